//! The reconciliation engine.
//!
//! One `WebrtcState` owns every peer, every outbound track state, and the
//! channels tying it to its supervisor. It is continuously brought to a
//! desired `State` via `reconcile`, and reports the achieved state via
//! `to_proto`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::candidate::CandidateType;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use causeway_proto as pb;

use crate::bridge::UdpIngress;
use crate::client;
use crate::error::{Error, Result};
use crate::http::InterfaceServer;
use crate::peer::{PeerRole, PeeringOffer, WebrtcPeer};
use crate::track::{LocalhostPort, NamedTrackKey};

const MIME_TYPE_H265: &str = "video/H265";
const H265_PAYLOAD_TYPE: u8 = 126;

const DATA_CHANNEL_DEPTH: usize = 100;
const MEDIA_CHANNEL_DEPTH: usize = 10;
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Engine configuration, replaced atomically by `reconcile`.
#[derive(Clone, Default)]
pub struct WebrtcStateConfig {
    pub webrtc: RTCConfiguration,
    /// Signaling auth strategy per peer id; absent means plain HTTP.
    pub credentials: HashMap<String, pb::WebrtcConfigAuth>,
    pub reconnect_attempts: u32,
    /// Inbound tracks we accept, each mapped to its localhost sink port.
    pub allowed_in_tracks: HashMap<NamedTrackKey, LocalhostPort>,
}

impl WebrtcStateConfig {
    /// Config with the given ICE URLs and nothing else.
    pub fn with_ice_urls(urls: Vec<String>) -> Self {
        Self {
            webrtc: RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls,
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Per-outbound-track forwarding node. Peers hold non-owning subscriber
/// slots in here; removal of a peer always removes its slot.
pub(crate) struct TrackState {
    pub(crate) port: LocalhostPort,
    /// True: lifetime independent of subscribers. False: destroyed with
    /// its sole owning peer.
    pub(crate) broadcast: bool,
    pub(crate) subscribers: HashMap<String, Arc<TrackLocalStaticRTP>>,
    pub(crate) ingress: Arc<UdpIngress>,
}

impl TrackState {
    fn new(port: LocalhostPort, broadcast: bool) -> Self {
        Self {
            port,
            broadcast,
            subscribers: HashMap::new(),
            ingress: Arc::new(UdpIngress::new(port)),
        }
    }
}

/// Receiver ends of the engine's event channels, handed to the consumer
/// at construction.
pub struct WebrtcEvents {
    /// Coalescing signal: re-publish achieved state.
    pub background_change: mpsc::Receiver<()>,
    /// Inbound track open/close notifications.
    pub media_in: mpsc::Receiver<pb::MediaChannel>,
    /// Inbound data-channel payloads.
    pub data_in: mpsc::Receiver<pb::DataTransmission>,
    /// Periodic ICE stats snapshots (coalescing).
    pub stats: mpsc::Receiver<Vec<pb::Stats>>,
}

pub struct WebrtcState {
    src_uuid: String,
    api: API,
    config: RwLock<WebrtcStateConfig>,
    peers: RwLock<HashMap<String, Arc<WebrtcPeer>>>,
    out_track_states: RwLock<HashMap<NamedTrackKey, TrackState>>,
    background_change_tx: mpsc::Sender<()>,
    media_in_tx: mpsc::Sender<pb::MediaChannel>,
    data_in_tx: mpsc::Sender<pb::DataTransmission>,
    data_out_tx: mpsc::Sender<pb::DataTransmission>,
    stats_tx: mpsc::Sender<Vec<pb::Stats>>,
    cancel: CancellationToken,
}

impl WebrtcState {
    /// Build the engine: default codecs plus H.265, default interceptors,
    /// a fresh process-unique source id, and the single background
    /// supervisor task.
    pub fn new(config: WebrtcStateConfig) -> Result<(Arc<Self>, WebrtcEvents)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let video_rtcp_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".to_owned(),
                parameter: String::new(),
            },
            RTCPFeedback {
                typ: "ccm".to_owned(),
                parameter: "fir".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: String::new(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "pli".to_owned(),
            },
        ];
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H265.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: video_rtcp_feedback,
                },
                payload_type: H265_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let (background_change_tx, background_change_rx) = mpsc::channel(1);
        let (media_in_tx, media_in_rx) = mpsc::channel(MEDIA_CHANNEL_DEPTH);
        let (data_in_tx, data_in_rx) = mpsc::channel(DATA_CHANNEL_DEPTH);
        let (data_out_tx, data_out_rx) = mpsc::channel(DATA_CHANNEL_DEPTH);
        let (stats_tx, stats_rx) = mpsc::channel(1);

        let state = Arc::new(Self {
            src_uuid: Uuid::new_v4().to_string(),
            api,
            config: RwLock::new(config),
            peers: RwLock::new(HashMap::new()),
            out_track_states: RwLock::new(HashMap::new()),
            background_change_tx,
            media_in_tx,
            data_in_tx,
            data_out_tx,
            stats_tx,
            cancel: CancellationToken::new(),
        });
        state.spawn_supervisor(data_out_rx);
        Ok((
            state,
            WebrtcEvents {
                background_change: background_change_rx,
                media_in: media_in_rx,
                data_in: data_in_rx,
                stats: stats_rx,
            },
        ))
    }

    /// Process-unique id presented to peers during signaling.
    pub fn src_uuid(&self) -> &str {
        &self.src_uuid
    }

    /// Sender for outbound data-channel payloads, dispatched by
    /// destination id.
    pub fn data_out(&self) -> mpsc::Sender<pb::DataTransmission> {
        self.data_out_tx.clone()
    }

    /// Cancel the engine, close every peer, and stop every outbound
    /// pipeline.
    pub async fn close(&self) {
        self.cancel.cancel();
        let peers: Vec<Arc<WebrtcPeer>> = self.peers.read().unwrap().values().cloned().collect();
        for peer in peers {
            peer.close().await;
        }
        let mut tracks = self.out_track_states.write().unwrap();
        for (_, track) in tracks.drain() {
            track.ingress.stop();
        }
    }

    /// Replace the whole configuration.
    pub fn reconfigure(&self, config: WebrtcStateConfig) {
        *self.config.write().unwrap() = config;
    }

    /// Current outbound track keys.
    pub fn out_tracks(&self) -> Vec<NamedTrackKey> {
        self.out_track_states.read().unwrap().keys().cloned().collect()
    }

    /// Outbound tracks that survive independent of any single peer.
    pub fn broadcast_out_tracks(&self) -> Vec<NamedTrackKey> {
        self.out_track_states
            .read()
            .unwrap()
            .iter()
            .filter(|(_, track)| track.broadcast)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Whether this inbound track is accepted, and the localhost port it
    /// should be bridged to. Keys are normalized on construction, so the
    /// mime-type comparison is case-insensitive.
    pub fn in_track_allowed(&self, key: &NamedTrackKey) -> Option<LocalhostPort> {
        self.config.read().unwrap().allowed_in_tracks.get(key).copied()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.read().unwrap().keys().cloned().collect()
    }

    pub fn peer_role(&self, peer_id: &str) -> Option<PeerRole> {
        self.peers.read().unwrap().get(peer_id).map(|peer| peer.role)
    }

    /// Outbound track keys a registered peer currently carries.
    pub fn peer_out_tracks(&self, peer_id: &str) -> Option<Vec<NamedTrackKey>> {
        self.peers
            .read()
            .unwrap()
            .get(peer_id)
            .map(|peer| peer.out_tracks.lock().unwrap().keys().cloned().collect())
    }

    /// The one-shot peering operation. Three modes:
    ///
    /// 1. `peer_id` empty: create broadcast `TrackState`s for
    ///    `offer.out_tracks` and return `Ok(None)`. Idempotent.
    /// 2. `offer.sdp` absent: `peer_id` must be a signaling URL; assume
    ///    the initiator role, prenegotiate, exchange SDP, and return
    ///    `Ok(None)`.
    /// 3. `offer.sdp` present: assume the responder role and return the
    ///    local answer.
    pub async fn peer(
        self: &Arc<Self>,
        offer: PeeringOffer,
        fails: u32,
    ) -> Result<Option<RTCSessionDescription>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        if offer.peer_id.is_empty() {
            let mut tracks = self.out_track_states.write().unwrap();
            for (key, port) in &offer.out_tracks {
                tracks
                    .entry(key.clone())
                    .or_insert_with(|| TrackState::new(*port, true));
            }
            return Ok(None);
        }

        let role = if offer.sdp.is_some() {
            PeerRole::Responder
        } else {
            PeerRole::Initiator
        };
        let client = self.signaling_client(&offer.peer_id)?;
        let peer = WebrtcPeer::new(role, client, offer.clone(), fails, Arc::downgrade(self));
        {
            let mut peers = self.peers.write().unwrap();
            if peers.contains_key(&offer.peer_id) {
                return Err(Error::PeerExists(offer.peer_id));
            }
            peers.insert(offer.peer_id.clone(), peer.clone());
        }

        match self.connect_peer(&peer, offer).await {
            Ok(answer) => Ok(answer),
            Err(err) => {
                warn!("peering failed: {err}");
                peer.fail().await;
                Err(err)
            }
        }
    }

    async fn connect_peer(
        self: &Arc<Self>,
        peer: &Arc<WebrtcPeer>,
        mut offer: PeeringOffer,
    ) -> Result<Option<RTCSessionDescription>> {
        if peer.role == PeerRole::Initiator {
            offer.prenegotiate(self, &peer.client).await?;
            peer.set_offer(offer.clone());
        }

        let rtc_config = self.config.read().unwrap().webrtc.clone();
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        *peer.pc.lock().unwrap() = Some(pc.clone());

        *peer.out_tracks.lock().unwrap() = offer.out_tracks.clone();
        for (key, port) in &offer.out_tracks {
            let sink = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: key.mime_type.clone(),
                    ..Default::default()
                },
                key.track_id.clone(),
                key.stream_id.clone(),
            ));
            pc.add_track(Arc::clone(&sink) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            let mut tracks = self.out_track_states.write().unwrap();
            let entry = tracks
                .entry(key.clone())
                .or_insert_with(|| TrackState::new(*port, false));
            entry.subscribers.insert(peer.peer_id.clone(), sink);
        }

        peer.install_on_track(self, &pc);
        peer.install_ice_handler(self, &pc);

        if offer.data_channel {
            match peer.role {
                PeerRole::Responder => {
                    let weak_peer = Arc::downgrade(peer);
                    let weak_state = Arc::downgrade(self);
                    pc.on_data_channel(Box::new(move |channel| {
                        let weak_peer = weak_peer.clone();
                        let weak_state = weak_state.clone();
                        Box::pin(async move {
                            debug!("data channel received");
                            if let (Some(peer), Some(state)) =
                                (weak_peer.upgrade(), weak_state.upgrade())
                            {
                                peer.attach_data_channel(&state, channel);
                            }
                        })
                    }));
                }
                PeerRole::Initiator => {
                    let channel = pc.create_data_channel(&self.src_uuid, None).await?;
                    peer.attach_data_channel(self, channel);
                }
            }
        }

        match peer.role {
            PeerRole::Responder => {
                let Some(remote) = offer.sdp.clone() else {
                    return Err(Error::Signaling("responder offer is missing sdp".into()));
                };
                pc.set_remote_description(remote).await?;
                let answer = pc.create_answer(None).await?;
                let mut gather_complete = pc.gathering_complete_promise().await;
                pc.set_local_description(answer).await?;
                let _ = gather_complete.recv().await;
                Ok(pc.local_description().await)
            }
            PeerRole::Initiator => {
                reqwest::Url::parse(&offer.peer_id)
                    .map_err(|_| Error::InvalidPeerUrl(offer.peer_id.clone()))?;
                let local_offer = pc.create_offer(None).await?;
                let mut gather_complete = pc.gathering_complete_promise().await;
                pc.set_local_description(local_offer).await?;
                let _ = gather_complete.recv().await;
                let local = pc.local_description().await.ok_or_else(|| {
                    Error::Signaling("local description missing after gathering".into())
                })?;

                let request = pb::WebrtcOffer {
                    src_uuid: Some(self.src_uuid.clone()),
                    sdp: Some(local.sdp.clone()),
                    sdp_type: Some(local.sdp_type.to_string()),
                    local_tracks: offer
                        .out_tracks
                        .keys()
                        .map(NamedTrackKey::to_proto)
                        .collect(),
                    local_tracks_set: Some(true),
                    remote_tracks: offer.in_tracks.iter().map(NamedTrackKey::to_proto).collect(),
                    remote_tracks_set: Some(true),
                    datachannel: Some(offer.data_channel),
                };
                let answer = client::put_offer(&peer.client, &offer.peer_id, &request).await?;
                let remote =
                    client::session_description(answer.sdp_type(), answer.sdp().to_string())?;
                pc.set_remote_description(remote).await?;
                Ok(None)
            }
        }
    }

    /// Remove this peer if it exists; no-op if it doesn't.
    pub async fn un_peer(&self, peer_id: &str) {
        let peer = self.peers.read().unwrap().get(peer_id).cloned();
        if let Some(peer) = peer {
            peer.close().await;
        }
    }

    /// Bring the engine to the desired state: update configuration, then
    /// diff peers into create/modify/close sets and run all three
    /// concurrently.
    pub async fn reconcile(self: &Arc<Self>, desired: &pb::State) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        {
            let mut config = self.config.write().unwrap();
            if let Some(attempts) = desired.reconnect_attempts {
                config.reconnect_attempts = attempts;
            }
            if let Some(webrtc_config) = &desired.config {
                config.webrtc = RTCConfiguration {
                    ice_servers: webrtc_config
                        .ice_servers
                        .iter()
                        .map(ice_server_from_proto)
                        .collect(),
                    ..Default::default()
                };
                config.credentials = webrtc_config.credentials.clone();
            }
            config.allowed_in_tracks = desired
                .wanted_tracks
                .iter()
                .filter_map(|channel| {
                    channel.track.as_ref().map(|track| {
                        (
                            NamedTrackKey::from_proto(track),
                            channel.localhost_port() as LocalhostPort,
                        )
                    })
                })
                .collect();
        }

        // Fold the desired data and media entries into one target offer
        // per peer id.
        let mut targets: HashMap<String, PeeringOffer> = HashMap::new();
        for channel in &desired.data {
            let id = channel.dest_uuid().to_string();
            targets
                .entry(id.clone())
                .or_insert_with(|| PeeringOffer::new(id))
                .data_channel = true;
        }
        for channel in &desired.media {
            let Some(track) = &channel.track else { continue };
            let id = channel.dest_uuid().to_string();
            targets
                .entry(id.clone())
                .or_insert_with(|| PeeringOffer::new(id))
                .out_tracks
                .insert(
                    NamedTrackKey::from_proto(track),
                    channel.localhost_port() as LocalhostPort,
                );
        }

        let mut to_create = Vec::new();
        let mut to_modify = Vec::new();
        let mut to_close = Vec::new();
        {
            let peers = self.peers.read().unwrap();
            for (id, peer) in peers.iter() {
                match targets.get(id) {
                    Some(target) => {
                        let current = peer.out_tracks.lock().unwrap().clone();
                        if target.data_channel != peer.wants_data || target.out_tracks != current {
                            to_modify.push(id.clone());
                        }
                    }
                    None => to_close.push(id.clone()),
                }
            }
            for id in targets.keys() {
                if !peers.contains_key(id) {
                    to_create.push(id.clone());
                }
            }
        }

        let mut tasks = JoinSet::new();
        for id in to_modify {
            if let Some(offer) = targets.get(&id) {
                let offer = offer.clone();
                let state = self.clone();
                tasks.spawn(async move {
                    state.un_peer(&id).await;
                    if let Err(err) = state.peer(offer, 0).await {
                        warn!("failed to re-peer {id}: {err}");
                    }
                });
            }
        }
        for id in to_create {
            if let Some(offer) = targets.get(&id) {
                let offer = offer.clone();
                let state = self.clone();
                tasks.spawn(async move {
                    if let Err(err) = state.peer(offer, 0).await {
                        warn!("failed to peer {id}: {err}");
                    }
                });
            }
        }
        for id in to_close {
            let state = self.clone();
            tasks.spawn(async move {
                state.un_peer(&id).await;
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Read-only snapshot of the achieved state.
    pub fn to_proto(&self, server: &InterfaceServer) -> Result<pb::State> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        let mut data = Vec::new();
        let mut media = Vec::new();
        {
            let peers = self.peers.read().unwrap();
            for (id, peer) in peers.iter() {
                if peer.datachannel.lock().unwrap().is_some() {
                    data.push(pb::DataChannel {
                        src_uuid: None,
                        dest_uuid: Some(id.clone()),
                    });
                }
                for (key, port) in peer.out_tracks.lock().unwrap().iter() {
                    media.push(pb::MediaChannel {
                        dest_uuid: Some(id.clone()),
                        track: Some(key.to_proto()),
                        localhost_port: Some(u32::from(*port)),
                        ..Default::default()
                    });
                }
            }
        }
        let config = self.config.read().unwrap();
        let wanted_tracks = config
            .allowed_in_tracks
            .iter()
            .map(|(key, port)| pb::MediaChannel {
                track: Some(key.to_proto()),
                localhost_port: Some(u32::from(*port)),
                ..Default::default()
            })
            .collect();
        let ice_servers = config.webrtc.ice_servers.iter().map(ice_server_to_proto).collect();
        Ok(pb::State {
            data,
            media,
            wanted_tracks,
            config: Some(pb::WebrtcConfig {
                ice_servers,
                credentials: config.credentials.clone(),
            }),
            reconnect_attempts: Some(config.reconnect_attempts),
            http_server_config: server.config(),
        })
    }

    // ---- crate-internal plumbing -------------------------------------

    fn spawn_supervisor(self: &Arc<Self>, mut data_out_rx: mpsc::Receiver<pb::DataTransmission>) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut stats_interval = tokio::time::interval(STATS_INTERVAL);
            stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = state.cancel.cancelled() => return,
                    transmission = data_out_rx.recv() => {
                        let Some(transmission) = transmission else { return };
                        state.dispatch_data(transmission).await;
                    }
                    _ = stats_interval.tick() => state.publish_stats().await,
                }
            }
        });
    }

    async fn dispatch_data(&self, transmission: pb::DataTransmission) {
        let dest = transmission
            .channel
            .as_ref()
            .map(|channel| channel.dest_uuid().to_string())
            .unwrap_or_default();
        let peer = self.peers.read().unwrap().get(&dest).cloned();
        let Some(peer) = peer else {
            warn!("no peer {dest:?} for data send");
            return;
        };
        peer.send_data(transmission.payload.unwrap_or_default()).await;
    }

    async fn publish_stats(&self) {
        let peers: Vec<(String, Arc<WebrtcPeer>)> = self
            .peers
            .read()
            .unwrap()
            .iter()
            .map(|(id, peer)| (id.clone(), peer.clone()))
            .collect();
        let mut batch = Vec::new();
        for (dest_uuid, peer) in peers {
            let pc = peer.pc.lock().unwrap().clone();
            let Some(pc) = pc else { continue };
            let report = pc.get_stats().await;
            let mut entry = pb::Stats::default();
            let mut remote_candidate_id = String::new();
            for value in report.reports.values() {
                if let StatsReportType::CandidatePair(pair) = value {
                    if pair.nominated {
                        remote_candidate_id = pair.remote_candidate_id.clone();
                        entry.dest_uuid = Some(dest_uuid.clone());
                        entry.cumulative_rtt = Some(pair.total_round_trip_time);
                        entry.current_rtt = Some(pair.current_round_trip_time);
                        entry.outgoing_bitrate = Some(pair.available_outgoing_bitrate);
                        entry.incoming_bitrate = Some(pair.available_incoming_bitrate);
                        break;
                    }
                }
            }
            if let Some(StatsReportType::RemoteCandidate(candidate)) =
                report.reports.get(&remote_candidate_id)
            {
                entry.protocol = Some(candidate.relay_protocol.clone());
                entry.set_candidate_type(match candidate.candidate_type {
                    CandidateType::Host => pb::CandidateType::Host,
                    CandidateType::ServerReflexive => pb::CandidateType::Srflx,
                    CandidateType::PeerReflexive => pb::CandidateType::Prflx,
                    CandidateType::Relay => pb::CandidateType::Relay,
                    _ => pb::CandidateType::Unknown,
                });
            }
            if entry.dest_uuid.is_some() {
                batch.push(entry);
            }
        }
        trace!("publishing stats for {} peers", batch.len());
        // Coalesce: if a snapshot is already pending, drop this one.
        let _ = self.stats_tx.try_send(batch);
    }

    fn signaling_client(&self, peer_id: &str) -> Result<reqwest::Client> {
        let auth = self.config.read().unwrap().credentials.get(peer_id).cloned();
        client::build_client(auth.as_ref())
    }

    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.config.read().unwrap().reconnect_attempts
    }

    pub(crate) fn signal_background_change(&self) {
        let _ = self.background_change_tx.try_send(());
    }

    pub(crate) fn data_in_sender(&self) -> mpsc::Sender<pb::DataTransmission> {
        self.data_in_tx.clone()
    }

    pub(crate) fn remove_peer(&self, peer_id: &str) {
        self.peers.write().unwrap().remove(peer_id);
    }

    /// Drop a closing peer's subscriber slots; non-broadcast tracks go
    /// down with their sole owner.
    pub(crate) fn release_out_tracks(
        &self,
        peer_id: &str,
        released: &HashMap<NamedTrackKey, LocalhostPort>,
    ) {
        let mut tracks = self.out_track_states.write().unwrap();
        for key in released.keys() {
            let remove = match tracks.get_mut(key) {
                Some(track) if track.broadcast => {
                    track.subscribers.remove(peer_id);
                    false
                }
                Some(track) => {
                    track.ingress.stop();
                    true
                }
                None => false,
            };
            if remove {
                tracks.remove(key);
            }
        }
    }

    /// Subscriber sinks for one outbound track, or `None` once the track
    /// is gone.
    pub(crate) fn out_track_sinks(
        &self,
        key: &NamedTrackKey,
    ) -> Option<Vec<Arc<TrackLocalStaticRTP>>> {
        self.out_track_states
            .read()
            .unwrap()
            .get(key)
            .map(|track| track.subscribers.values().cloned().collect())
    }

    /// Port of a broadcast-available outbound track.
    pub(crate) fn broadcast_out_track_port(&self, key: &NamedTrackKey) -> Option<LocalhostPort> {
        self.out_track_states
            .read()
            .unwrap()
            .get(key)
            .filter(|track| track.broadcast)
            .map(|track| track.port)
    }

    /// Start the ingress pipeline of every track this peer subscribes to.
    /// Idempotent; invoked on ICE connected.
    pub(crate) fn start_out_tracks(self: &Arc<Self>, peer: &Arc<WebrtcPeer>) {
        let keys: Vec<NamedTrackKey> =
            peer.out_tracks.lock().unwrap().keys().cloned().collect();
        let tracks = self.out_track_states.read().unwrap();
        for key in keys {
            if let Some(track) = tracks.get(&key) {
                track.ingress.start(self.clone(), key.clone());
            }
        }
    }

    /// An outbound pipeline died: destroy the track state and fail every
    /// subscribing peer.
    pub(crate) fn fail_out_track(self: &Arc<Self>, key: &NamedTrackKey) {
        let subscriber_ids = {
            let mut tracks = self.out_track_states.write().unwrap();
            match tracks.remove(key) {
                Some(track) => {
                    track.ingress.stop();
                    track.subscribers.into_keys().collect::<Vec<_>>()
                }
                None => return,
            }
        };
        let peers: Vec<Arc<WebrtcPeer>> = {
            let peers = self.peers.read().unwrap();
            subscriber_ids
                .iter()
                .filter_map(|id| peers.get(id).cloned())
                .collect()
        };
        for peer in peers {
            tokio::spawn(peer.fail());
        }
    }

    pub(crate) async fn publish_media_open(
        &self,
        peer_id: &str,
        key: &NamedTrackKey,
        port: LocalhostPort,
    ) {
        let event = pb::MediaChannel {
            src_uuid: Some(peer_id.to_string()),
            track: Some(key.to_proto()),
            localhost_port: Some(u32::from(port)),
            ..Default::default()
        };
        if self.media_in_tx.send(event).await.is_err() {
            debug!("media event dropped, engine consumer gone");
        }
    }

    /// Non-blocking so teardown can never stall on a saturated consumer.
    pub(crate) fn publish_media_closed(
        &self,
        peer_id: &str,
        key: &NamedTrackKey,
        port: LocalhostPort,
    ) {
        let event = pb::MediaChannel {
            src_uuid: Some(peer_id.to_string()),
            track: Some(key.to_proto()),
            localhost_port: Some(u32::from(port)),
            close: Some(true),
            ..Default::default()
        };
        if self.media_in_tx.try_send(event).is_err() {
            debug!("media close event dropped");
        }
    }
}

fn ice_server_from_proto(server: &pb::IceServer) -> RTCIceServer {
    let credential_type = match server.credential_type() {
        "oauth" => RTCIceCredentialType::Oauth,
        // "password" and anything unknown.
        _ => RTCIceCredentialType::Password,
    };
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username().to_string(),
        credential: server.credential().to_string(),
        credential_type,
    }
}

fn ice_server_to_proto(server: &RTCIceServer) -> pb::IceServer {
    let credential_type = match server.credential_type {
        RTCIceCredentialType::Oauth => "oauth",
        _ => "password",
    };
    pb::IceServer {
        urls: server.urls.clone(),
        username: Some(server.username.clone()),
        credential: Some(server.credential.clone()),
        credential_type: Some(credential_type.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_type_round_trip_defaults_to_password() {
        let from_wire = ice_server_from_proto(&pb::IceServer {
            urls: vec!["turn:turn.example.invalid".into()],
            username: Some("user".into()),
            credential: Some("pass".into()),
            credential_type: Some("something-new".into()),
        });
        assert_eq!(from_wire.credential_type, RTCIceCredentialType::Password);

        let back = ice_server_to_proto(&from_wire);
        assert_eq!(back.credential_type(), "password");
        assert_eq!(back.username(), "user");

        let oauth = ice_server_from_proto(&pb::IceServer {
            urls: Vec::new(),
            username: None,
            credential: None,
            credential_type: Some("oauth".into()),
        });
        assert_eq!(oauth.credential_type, RTCIceCredentialType::Oauth);
        assert_eq!(ice_server_to_proto(&oauth).credential_type(), "oauth");
    }
}
