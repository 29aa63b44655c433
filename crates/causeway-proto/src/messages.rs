use std::collections::HashMap;

use prost::bytes::Bytes;
use serde::Serialize;

/// Identity of a media track on the wire: `(track_id, stream_id, mime_type)`.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct NamedTrack {
    #[prost(string, optional, tag = "1")]
    pub track_id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub stream_id: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub mime_type: Option<String>,
}

/// The single record carried by every signaling exchange.
///
/// `local_tracks_set` / `remote_tracks_set` are explicit presence flags:
/// an empty track list and an absent one mean different things, and the
/// step-1 / step-3 dispatch depends on the distinction.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct WebrtcOffer {
    #[prost(string, optional, tag = "1")]
    pub src_uuid: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub sdp: Option<String>,
    /// SDP type in string form: "offer", "answer", "pranswer", "rollback".
    #[prost(string, optional, tag = "3")]
    pub sdp_type: Option<String>,
    #[prost(message, repeated, tag = "4")]
    pub local_tracks: Vec<NamedTrack>,
    #[prost(bool, optional, tag = "5")]
    pub local_tracks_set: Option<bool>,
    #[prost(message, repeated, tag = "6")]
    pub remote_tracks: Vec<NamedTrack>,
    #[prost(bool, optional, tag = "7")]
    pub remote_tracks_set: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub datachannel: Option<bool>,
}

/// A data channel endpoint. `src_uuid` set means "from peer" (inbound),
/// `dest_uuid` set means "to peer" (desired / achieved state).
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct DataChannel {
    #[prost(string, optional, tag = "1")]
    pub src_uuid: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub dest_uuid: Option<String>,
}

/// One payload travelling through a peer's data channel.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct DataTransmission {
    #[prost(message, optional, tag = "1")]
    pub channel: Option<DataChannel>,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub payload: Option<Bytes>,
}

/// A media flow notification or declaration.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct MediaChannel {
    #[prost(string, optional, tag = "1")]
    pub src_uuid: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub dest_uuid: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub track: Option<NamedTrack>,
    #[prost(uint32, optional, tag = "4")]
    pub localhost_port: Option<u32>,
    #[prost(bool, optional, tag = "5")]
    pub close: Option<bool>,
}

/// ICE transport snapshot for one peer, taken from the nominated
/// candidate pair.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct Stats {
    #[prost(string, optional, tag = "1")]
    pub dest_uuid: Option<String>,
    #[prost(double, optional, tag = "2")]
    pub cumulative_rtt: Option<f64>,
    #[prost(double, optional, tag = "3")]
    pub current_rtt: Option<f64>,
    #[prost(double, optional, tag = "4")]
    pub outgoing_bitrate: Option<f64>,
    #[prost(double, optional, tag = "5")]
    pub incoming_bitrate: Option<f64>,
    #[prost(string, optional, tag = "6")]
    pub protocol: Option<String>,
    #[prost(enumeration = "CandidateType", optional, tag = "7")]
    pub candidate_type: Option<i32>,
}

/// Remote ICE candidate type of the nominated pair.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum CandidateType {
    Unknown = 0,
    Host = 1,
    Srflx = 2,
    Prflx = 3,
    Relay = 4,
}

/// One ICE/STUN/TURN server entry with credentials.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct IceServer {
    #[prost(string, repeated, tag = "1")]
    pub urls: Vec<String>,
    #[prost(string, optional, tag = "2")]
    pub username: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub credential: Option<String>,
    /// "password" or "oauth"; anything else falls back to password.
    #[prost(string, optional, tag = "4")]
    pub credential_type: Option<String>,
}

/// Shared-secret header pair, presented by the client and checked by the
/// responder's middleware.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct SharedSecretAuth {
    #[prost(string, optional, tag = "1")]
    pub client_id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub client_secret: Option<String>,
}

/// Route signaling requests for a peer through an anonymizing overlay's
/// SOCKS5 endpoint.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct SocksProxyAuth {
    #[prost(string, optional, tag = "1")]
    pub proxy_addr: Option<String>,
}

/// HS256 bearer-token verification for the signaling server.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct BearerAuth {
    #[prost(bytes = "bytes", optional, tag = "1")]
    pub hs256_secret: Option<Bytes>,
    #[prost(string, optional, tag = "2")]
    pub audience: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub issuer: Option<String>,
}

/// Client-side auth strategy for reaching one peer's signaling endpoint.
/// Absent oneof means plain HTTP.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct WebrtcConfigAuth {
    #[prost(oneof = "webrtc_config_auth::Auth", tags = "1, 2")]
    pub auth: Option<webrtc_config_auth::Auth>,
}

pub mod webrtc_config_auth {
    use serde::Serialize;

    #[derive(Clone, PartialEq, Serialize, ::prost::Oneof)]
    pub enum Auth {
        #[prost(message, tag = "1")]
        SharedSecret(super::SharedSecretAuth),
        #[prost(message, tag = "2")]
        SocksProxy(super::SocksProxyAuth),
    }
}

/// WebRTC engine configuration: ICE servers plus the per-peer signaling
/// credential map.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct WebrtcConfig {
    #[prost(message, repeated, tag = "1")]
    pub ice_servers: Vec<IceServer>,
    #[prost(map = "string, message", tag = "2")]
    pub credentials: HashMap<String, WebrtcConfigAuth>,
}

/// Signaling server configuration. Absent auth oneof means no middleware.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct HttpServer {
    #[prost(string, optional, tag = "1")]
    pub address: Option<String>,
    #[prost(oneof = "http_server::Auth", tags = "2, 3")]
    pub auth: Option<http_server::Auth>,
}

pub mod http_server {
    use serde::Serialize;

    #[derive(Clone, PartialEq, Serialize, ::prost::Oneof)]
    pub enum Auth {
        #[prost(message, tag = "2")]
        SharedSecret(super::SharedSecretAuth),
        #[prost(message, tag = "3")]
        Bearer(super::BearerAuth),
    }
}

/// The desired (or achieved) state of one engine instance.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct State {
    #[prost(message, repeated, tag = "1")]
    pub data: Vec<DataChannel>,
    #[prost(message, repeated, tag = "2")]
    pub media: Vec<MediaChannel>,
    #[prost(message, repeated, tag = "3")]
    pub wanted_tracks: Vec<MediaChannel>,
    #[prost(message, optional, tag = "4")]
    pub config: Option<WebrtcConfig>,
    #[prost(uint32, optional, tag = "5")]
    pub reconnect_attempts: Option<u32>,
    #[prost(message, optional, tag = "6")]
    pub http_server_config: Option<HttpServer>,
}

/// Control-plane input: a desired-state replacement or an outbound data
/// payload.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct Mutation {
    #[prost(oneof = "mutation::Kind", tags = "1, 2")]
    pub kind: Option<mutation::Kind>,
}

pub mod mutation {
    use serde::Serialize;

    #[derive(Clone, PartialEq, Serialize, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Data(super::DataTransmission),
        #[prost(message, tag = "2")]
        SetState(super::State),
    }
}

/// Control-plane output: inbound data, media lifecycle notifications, and
/// achieved-state snapshots.
#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
pub struct Event {
    #[prost(oneof = "event::Kind", tags = "1, 2, 3")]
    pub kind: Option<event::Kind>,
}

pub mod event {
    use serde::Serialize;

    #[derive(Clone, PartialEq, Serialize, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Data(super::DataTransmission),
        #[prost(message, tag = "2")]
        Media(super::MediaChannel),
        #[prost(message, tag = "3")]
        AchievedState(super::State),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn offer_presence_flags_survive_round_trip() {
        let offer = WebrtcOffer {
            src_uuid: Some("peer-1".into()),
            local_tracks: Vec::new(),
            local_tracks_set: Some(true),
            remote_tracks_set: Some(false),
            datachannel: Some(true),
            ..Default::default()
        };
        let decoded = WebrtcOffer::decode(offer.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, offer);
        // Empty-but-set stays distinct from unset.
        assert!(decoded.local_tracks_set());
        assert!(decoded.local_tracks.is_empty());
        assert!(!decoded.remote_tracks_set());
        assert!(decoded.remote_tracks_set.is_some());
        assert!(decoded.sdp.is_none());
    }

    #[test]
    fn unset_fields_encode_to_nothing() {
        let empty = WebrtcOffer::default();
        assert!(empty.encode_to_vec().is_empty());
        assert!(!empty.local_tracks_set());
        assert_eq!(empty.src_uuid(), "");
    }

    #[test]
    fn state_round_trip_with_auth_oneofs() {
        let mut credentials = HashMap::new();
        credentials.insert(
            "http://example.invalid/api/webrtc".to_string(),
            WebrtcConfigAuth {
                auth: Some(webrtc_config_auth::Auth::SharedSecret(SharedSecretAuth {
                    client_id: Some("id".into()),
                    client_secret: Some("secret".into()),
                })),
            },
        );
        let state = State {
            data: vec![DataChannel {
                dest_uuid: Some("http://example.invalid/api/webrtc".into()),
                ..Default::default()
            }],
            config: Some(WebrtcConfig {
                ice_servers: vec![IceServer {
                    urls: vec!["stun:stun.l.google.com:19302".into()],
                    credential_type: Some("password".into()),
                    ..Default::default()
                }],
                credentials,
            }),
            reconnect_attempts: Some(3),
            http_server_config: Some(HttpServer {
                address: Some("127.0.0.1:0".into()),
                auth: None,
            }),
            ..Default::default()
        };
        let decoded = State::decode(state.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.reconnect_attempts(), 3);
    }

    #[test]
    fn candidate_type_enum_maps_unknown() {
        let mut stats = Stats::default();
        stats.set_candidate_type(CandidateType::Srflx);
        let decoded = Stats::decode(stats.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.candidate_type, Some(CandidateType::Srflx as i32));
        assert!(CandidateType::try_from(99).is_err());
    }

    #[test]
    fn http_server_config_serializes_to_json() {
        let config = HttpServer {
            address: Some("127.0.0.1:9090".into()),
            auth: Some(http_server::Auth::SharedSecret(SharedSecretAuth {
                client_id: Some("id".into()),
                client_secret: Some("secret".into()),
            })),
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["address"], "127.0.0.1:9090");
    }
}
