//! The HTTP signaling interface.
//!
//! One `PUT /api/webrtc` endpoint serves both steps of the exchange: a
//! request with `sdp`, `sdp_type`, and both track-set flags true is a
//! step-3 SDP exchange; otherwise a request with `local_tracks_set` true
//! is a step-1 prenegotiation query. `DELETE /api/webrtc` tears a peer
//! down, `GET /api/debug` reports the active server config.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use prost::Message;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tracing::{info, warn};

use causeway_proto as pb;

use crate::client::{self, CLIENT_ID_HEADER, CLIENT_SECRET_HEADER, PROTOBUF_CONTENT_TYPE};
use crate::error::{Error, Result};
use crate::peer::PeeringOffer;
use crate::state::WebrtcState;
use crate::track::NamedTrackKey;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The signaling server for one engine. `configure` is a no-op when the
/// config is unchanged; otherwise the old listener is torn down and the
/// new one bound. Serve errors surface on the error channel returned by
/// `new` so the supervisor can republish achieved state.
pub struct InterfaceServer {
    engine: Arc<WebrtcState>,
    running: Mutex<Option<RunningServer>>,
    error_tx: mpsc::Sender<Error>,
}

struct RunningServer {
    config: pb::HttpServer,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl InterfaceServer {
    pub fn new(engine: Arc<WebrtcState>) -> (Arc<Self>, mpsc::Receiver<Error>) {
        let (error_tx, error_rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                engine,
                running: Mutex::new(None),
                error_tx,
            }),
            error_rx,
        )
    }

    /// The configuration currently being served, if any.
    pub fn config(&self) -> Option<pb::HttpServer> {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .map(|running| running.config.clone())
    }

    /// The bound listener address, useful when the configured address has
    /// port zero.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .map(|running| running.local_addr)
    }

    pub async fn configure(&self, config: pb::HttpServer) -> Result<()> {
        if self.config().as_ref() == Some(&config) {
            return Ok(());
        }
        self.close().await;

        if config.address.is_none() {
            return Err(Error::Config("address not set".into()));
        }
        let addr: SocketAddr = config
            .address()
            .parse()
            .map_err(|_| Error::Config(format!("invalid address {:?}", config.address())))?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let router = build_router(self.engine.clone(), &config)?;

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let error_tx = self.error_tx.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(serve_shutdown.cancelled_owned())
                .await;
            if let Err(err) = served {
                warn!("signaling server error: {err}");
                let _ = error_tx.try_send(Error::Io(err));
            }
        });
        info!("signaling interface listening on {local_addr}");
        *self.running.lock().unwrap() = Some(RunningServer {
            config,
            local_addr,
            shutdown,
            task,
        });
        Ok(())
    }

    pub async fn close(&self) {
        let running = self.running.lock().unwrap().take();
        if let Some(running) = running {
            running.shutdown.cancel();
            let mut task = running.task;
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("signaling server shutdown timed out");
                task.abort();
            }
            info!("signaling interface closed");
        }
    }
}

#[derive(Clone)]
struct SignalContext {
    engine: Arc<WebrtcState>,
    server_config: pb::HttpServer,
}

fn build_router(engine: Arc<WebrtcState>, config: &pb::HttpServer) -> Result<Router> {
    let context = SignalContext {
        engine,
        server_config: config.clone(),
    };
    let mut api = Router::new()
        .route("/debug", get(debug_config))
        .route("/webrtc", put(exchange).delete(teardown));
    match &config.auth {
        None => {}
        Some(pb::http_server::Auth::SharedSecret(secret)) => {
            api = api.layer(middleware::from_fn_with_state(
                Arc::new(secret.clone()),
                require_shared_secret,
            ));
        }
        Some(pb::http_server::Auth::Bearer(bearer)) => {
            let verifier = Arc::new(BearerVerifier::new(bearer)?);
            api = api.layer(middleware::from_fn_with_state(verifier, require_bearer));
        }
    }
    Ok(Router::new()
        .nest("/api", api)
        .layer(CompressionLayer::new())
        .with_state(context))
}

async fn require_shared_secret(
    State(secret): State<Arc<pb::SharedSecretAuth>>,
    request: Request,
    next: Next,
) -> Response {
    let id = request
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|value| value.to_str().ok());
    let key = request
        .headers()
        .get(CLIENT_SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    if id == Some(secret.client_id()) && key == Some(secret.client_secret()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid client credentials" })),
        )
            .into_response()
    }
}

struct BearerVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl BearerVerifier {
    fn new(config: &pb::BearerAuth) -> Result<Self> {
        let Some(secret) = &config.hs256_secret else {
            return Err(Error::Config("bearer secret not set".into()));
        };
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(audience) = &config.audience {
            validation.set_audience(&[audience]);
        }
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        Ok(Self {
            key: DecodingKey::from_secret(secret),
            validation,
        })
    }

    fn verify(&self, token: &str) -> bool {
        jsonwebtoken::decode::<serde_json::Value>(token, &self.key, &self.validation).is_ok()
    }
}

async fn require_bearer(
    State(verifier): State<Arc<BearerVerifier>>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match token {
        Some(token) if verifier.verify(token) => next.run(request).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid token" })),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "no token on the request" })),
        )
            .into_response(),
    }
}

async fn debug_config(State(context): State<SignalContext>) -> Response {
    match serde_json::to_vec(&context.server_config) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("error converting to JSON: {err}"),
        )
            .into_response(),
    }
}

/// The URL under which this endpoint is canonically reachable, used as the
/// responder's id in answers.
fn canonical_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}/api/webrtc")
}

async fn exchange(
    State(context): State<SignalContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let offer = match pb::WebrtcOffer::decode(body) {
        Ok(offer) => offer,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    if offer.src_uuid.is_none() {
        return (StatusCode::BAD_REQUEST, "missing src uuid").into_response();
    }
    if offer.local_tracks_set.is_none() {
        return (StatusCode::BAD_REQUEST, "missing local tracks set").into_response();
    }
    if offer.remote_tracks_set.is_none() {
        return (StatusCode::BAD_REQUEST, "missing remote tracks set").into_response();
    }
    let canonical = canonical_url(&headers);
    if offer.sdp.is_some()
        && offer.sdp_type.is_some()
        && offer.local_tracks_set()
        && offer.remote_tracks_set()
    {
        sdp_exchange(&context.engine, canonical, offer).await
    } else if offer.local_tracks_set() {
        prenegotiation(&context.engine, canonical, offer)
    } else {
        (StatusCode::BAD_REQUEST, "malformed offer").into_response()
    }
}

/// Step 1: report which of the caller's tracks we accept and which
/// broadcasts we offer.
fn prenegotiation(
    engine: &Arc<WebrtcState>,
    canonical: String,
    offer: pb::WebrtcOffer,
) -> Response {
    let mut accepted = Vec::new();
    for track in &offer.local_tracks {
        let key = NamedTrackKey::from_proto(track);
        if engine.in_track_allowed(&key).is_some() {
            accepted.push(track.clone());
        }
    }
    let answer = pb::WebrtcOffer {
        src_uuid: Some(canonical),
        local_tracks: engine
            .broadcast_out_tracks()
            .iter()
            .map(NamedTrackKey::to_proto)
            .collect(),
        local_tracks_set: Some(true),
        remote_tracks: accepted,
        remote_tracks_set: Some(true),
        ..Default::default()
    };
    protobuf_response(StatusCode::OK, &answer)
}

/// Step 3: validate both track lists, peer as the responder, and answer
/// with mirrored lists.
async fn sdp_exchange(
    engine: &Arc<WebrtcState>,
    canonical: String,
    offer: pb::WebrtcOffer,
) -> Response {
    for track in &offer.local_tracks {
        let key = NamedTrackKey::from_proto(track);
        if engine.in_track_allowed(&key).is_none() {
            return (
                StatusCode::NOT_ACCEPTABLE,
                format!("incoming track {:?} not allowed", track.track_id()),
            )
                .into_response();
        }
    }
    let mut out_tracks = HashMap::new();
    for track in &offer.remote_tracks {
        let key = NamedTrackKey::from_proto(track);
        match engine.broadcast_out_track_port(&key) {
            Some(port) => {
                out_tracks.insert(key, port);
            }
            None => {
                return (
                    StatusCode::NOT_ACCEPTABLE,
                    format!("requested track {:?} not available", track.track_id()),
                )
                    .into_response();
            }
        }
    }
    let remote = match client::session_description(offer.sdp_type(), offer.sdp().to_string()) {
        Ok(desc) => desc,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    let peering = PeeringOffer {
        peer_id: offer.src_uuid().to_string(),
        sdp: Some(remote),
        out_tracks,
        in_tracks: offer.local_tracks.iter().map(NamedTrackKey::from_proto).collect(),
        data_channel: offer.datachannel(),
    };
    let peer_id = peering.peer_id.clone();
    engine.un_peer(&peer_id).await;
    let answer_sdp = match engine.peer(peering, 0).await {
        Ok(Some(answer)) => answer,
        Ok(None) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "peering produced no answer",
            )
                .into_response();
        }
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("peering failed: {err}"),
            )
                .into_response();
        }
    };
    let answer = pb::WebrtcOffer {
        src_uuid: Some(canonical),
        sdp: Some(answer_sdp.sdp.clone()),
        sdp_type: Some(answer_sdp.sdp_type.to_string()),
        local_tracks: offer.remote_tracks.clone(),
        local_tracks_set: Some(true),
        remote_tracks: offer.local_tracks.clone(),
        remote_tracks_set: Some(true),
        ..Default::default()
    };
    protobuf_response(StatusCode::OK, &answer)
}

async fn teardown(State(context): State<SignalContext>, body: Bytes) -> Response {
    let offer = match pb::WebrtcOffer::decode(body) {
        Ok(offer) => offer,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    if offer.src_uuid.is_none() {
        return (StatusCode::BAD_REQUEST, "no source uuid").into_response();
    }
    context.engine.un_peer(offer.src_uuid()).await;
    StatusCode::NO_CONTENT.into_response()
}

fn protobuf_response(status: StatusCode, msg: &pb::WebrtcOffer) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)],
        msg.encode_to_vec(),
    )
        .into_response()
}
