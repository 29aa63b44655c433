//! HTTP signaling client helpers.
//!
//! Every signaling exchange is a single `WebrtcOffer` record PUT to the
//! peer's signaling URL; teardown is a best-effort DELETE. The per-peer
//! client is prebuilt from the credential map so the engine never knows
//! which auth scheme a given peer uses.

use std::time::Duration;

use prost::Message;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use causeway_proto as pb;

use crate::error::{Error, Result};

pub(crate) const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Headers presented for the shared-secret auth scheme.
pub(crate) const CLIENT_ID_HEADER: &str = "x-causeway-client-id";
pub(crate) const CLIENT_SECRET_HEADER: &str = "x-causeway-client-secret";

const SIGNALING_TIMEOUT: Duration = Duration::from_secs(30);

fn status_ok(status: reqwest::StatusCode) -> bool {
    (200..=300).contains(&status.as_u16())
}

/// Build the HTTP client for one peer from its configured auth strategy.
pub(crate) fn build_client(auth: Option<&pb::WebrtcConfigAuth>) -> Result<reqwest::Client> {
    let builder = reqwest::Client::builder().timeout(SIGNALING_TIMEOUT);
    let builder = match auth.and_then(|auth| auth.auth.as_ref()) {
        None => builder,
        Some(pb::webrtc_config_auth::Auth::SharedSecret(secret)) => {
            let mut headers = HeaderMap::new();
            let id = HeaderValue::from_str(secret.client_id())
                .map_err(|_| Error::Config("shared-secret client id is not a valid header".into()))?;
            let key = HeaderValue::from_str(secret.client_secret())
                .map_err(|_| Error::Config("shared-secret client secret is not a valid header".into()))?;
            headers.insert(CLIENT_ID_HEADER, id);
            headers.insert(CLIENT_SECRET_HEADER, key);
            builder.default_headers(headers)
        }
        Some(pb::webrtc_config_auth::Auth::SocksProxy(proxy)) => {
            let proxy = reqwest::Proxy::all(format!("socks5h://{}", proxy.proxy_addr()))?;
            builder.proxy(proxy)
        }
    };
    Ok(builder.build()?)
}

/// Build a session description from the wire's string type form.
pub(crate) fn session_description(sdp_type: &str, sdp: String) -> Result<RTCSessionDescription> {
    let desc = match sdp_type {
        "offer" => RTCSessionDescription::offer(sdp),
        "answer" => RTCSessionDescription::answer(sdp),
        "pranswer" => RTCSessionDescription::pranswer(sdp),
        other => {
            return Err(Error::Signaling(format!("unsupported sdp type {other:?}")));
        }
    }?;
    Ok(desc)
}

/// PUT one offer record and decode the peer's reply.
pub(crate) async fn put_offer(
    client: &reqwest::Client,
    url: &str,
    request: &pb::WebrtcOffer,
) -> Result<pb::WebrtcOffer> {
    let response = client
        .put(url)
        .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
        .body(request.encode_to_vec())
        .send()
        .await?;
    if !status_ok(response.status()) {
        return Err(Error::Signaling(format!(
            "unsuccessful HTTP status {}",
            response.status().as_u16()
        )));
    }
    let body = response.bytes().await?;
    Ok(pb::WebrtcOffer::decode(body)?)
}

/// Tell the remote to tear its side of the peering down.
pub(crate) async fn delete_peer(
    client: &reqwest::Client,
    url: &str,
    src_uuid: &str,
) -> Result<()> {
    let deletion = pb::WebrtcOffer {
        src_uuid: Some(src_uuid.to_string()),
        ..Default::default()
    };
    let response = client
        .delete(url)
        .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
        .body(deletion.encode_to_vec())
        .send()
        .await?;
    if !status_ok(response.status()) {
        return Err(Error::Signaling(format!(
            "unsuccessful HTTP status {}",
            response.status().as_u16()
        )));
    }
    Ok(())
}
