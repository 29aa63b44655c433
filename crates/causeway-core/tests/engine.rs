//! Engine lifecycle tests: peering, reconciliation, the data path, and
//! the media bridge, all over loopback with no external ICE servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::timeout;

use causeway_core::{
    Error, InterfaceServer, NamedTrackKey, PeerRole, PeeringOffer, WebrtcEvents, WebrtcState,
    WebrtcStateConfig,
};
use causeway_proto as pb;

const DEADLINE: Duration = Duration::from_secs(30);

fn offer_to(url: &str) -> PeeringOffer {
    let mut offer = PeeringOffer::new(url);
    offer.data_channel = true;
    offer
}

async fn start_responder(
    config: WebrtcStateConfig,
) -> (Arc<WebrtcState>, WebrtcEvents, Arc<InterfaceServer>, String) {
    let (state, events) = WebrtcState::new(config).expect("engine");
    let (server, _errors) = InterfaceServer::new(state.clone());
    server
        .configure(pb::HttpServer {
            address: Some("127.0.0.1:0".into()),
            auth: None,
        })
        .await
        .expect("configure");
    let addr = server.local_addr().expect("bound address");
    let url = format!("http://{addr}/api/webrtc");
    (state, events, server, url)
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Pump minimal RTP packets at a localhost ingress port until aborted.
fn spawn_rtp_feeder(port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let socket = tokio::net::UdpSocket::bind(("127.0.0.1", 0))
            .await
            .expect("bind feeder");
        socket.connect(("127.0.0.1", port)).await.expect("connect feeder");
        let mut seq: u16 = 0;
        let mut ts: u32 = 0;
        loop {
            let mut packet = vec![0u8; 12 + 16];
            packet[0] = 0x80; // version 2
            packet[1] = 96;
            packet[2..4].copy_from_slice(&seq.to_be_bytes());
            packet[4..8].copy_from_slice(&ts.to_be_bytes());
            packet[8..12].copy_from_slice(&0x1234_5678u32.to_be_bytes());
            // Refused until the ingress binds; keep trying.
            let _ = socket.send(&packet).await;
            seq = seq.wrapping_add(1);
            ts = ts.wrapping_add(3000);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
}

#[tokio::test]
async fn empty_lifecycle() {
    let (state, _events) = WebrtcState::new(WebrtcStateConfig::default()).expect("engine");
    assert!(state.out_tracks().is_empty());
    assert!(state.peer_ids().is_empty());
    state.close().await;
    // A closed engine refuses further operations.
    let result = state.peer(offer_to("http://127.0.0.1:9/api/webrtc"), 0).await;
    assert!(matches!(result, Err(Error::Closed)));
}

#[tokio::test]
async fn broadcast_setup_is_idempotent() {
    let (state, _events) = WebrtcState::new(WebrtcStateConfig::default()).expect("engine");
    let track1 = NamedTrackKey::new("track1", "stream1", "video/h264");
    let track2 = NamedTrackKey::new("track2", "stream2", "video/h264");
    let mut offer = PeeringOffer::new("");
    offer.out_tracks.insert(track1.clone(), 57031);
    offer.out_tracks.insert(track2.clone(), 57032);

    assert!(state.peer(offer.clone(), 0).await.expect("setup").is_none());
    let tracks = state.out_tracks();
    assert_eq!(tracks.len(), 2);
    assert!(tracks.contains(&track1));
    assert!(tracks.contains(&track2));

    state.peer(offer, 0).await.expect("setup again");
    assert_eq!(state.out_tracks().len(), 2);
    assert_eq!(state.broadcast_out_tracks().len(), 2);
    state.close().await;
}

#[tokio::test]
async fn in_track_allowed_follows_reconfiguration() {
    let (state, _events) = WebrtcState::new(WebrtcStateConfig::default()).expect("engine");
    let track1 = NamedTrackKey::new("track1", "stream1", "video/h264");
    let track2 = NamedTrackKey::new("track2", "stream2", "video/h264");
    let track3 = NamedTrackKey::new("track3", "stream3", "video/vp9");
    assert!(state.in_track_allowed(&track1).is_none());
    assert!(state.in_track_allowed(&track2).is_none());

    let mut allowed = HashMap::new();
    allowed.insert(track1.clone(), 57001);
    allowed.insert(track2.clone(), 57002);
    state.reconfigure(WebrtcStateConfig {
        allowed_in_tracks: allowed,
        ..Default::default()
    });
    assert_eq!(state.in_track_allowed(&track1), Some(57001));
    assert_eq!(state.in_track_allowed(&track2), Some(57002));
    assert!(state.in_track_allowed(&track3).is_none());
    // Keys normalize their mime type, so lookups ignore wire casing.
    let shouty = NamedTrackKey::new("track1", "stream1", "VIDEO/H264");
    assert_eq!(state.in_track_allowed(&shouty), Some(57001));
    state.close().await;
}

#[tokio::test]
async fn peer_connect_unpeer_repeer() {
    let (responder, _responder_events, _server, url) =
        start_responder(WebrtcStateConfig::default()).await;
    let (initiator, _initiator_events) =
        WebrtcState::new(WebrtcStateConfig::default()).expect("engine");

    timeout(DEADLINE, initiator.peer(offer_to(&url), 0))
        .await
        .expect("peer deadline")
        .expect("peer");
    assert_eq!(initiator.peer_ids(), vec![url.clone()]);
    assert_eq!(initiator.peer_role(&url), Some(PeerRole::Initiator));
    assert_eq!(responder.peer_ids(), vec![initiator.src_uuid().to_string()]);
    assert_eq!(
        responder.peer_role(initiator.src_uuid()),
        Some(PeerRole::Responder)
    );

    initiator.un_peer(&url).await;
    initiator.un_peer(&url).await; // idempotent
    assert!(initiator.peer_ids().is_empty());
    wait_until(DEADLINE, || responder.peer_ids().is_empty()).await;

    timeout(DEADLINE, initiator.peer(offer_to(&url), 0))
        .await
        .expect("re-peer deadline")
        .expect("re-peer");
    assert_eq!(initiator.peer_ids(), vec![url.clone()]);
    wait_until(DEADLINE, || responder.peer_ids().len() == 1).await;

    initiator.close().await;
    responder.close().await;
}

#[tokio::test]
async fn duplicate_peering_registers_exactly_one() {
    let (responder, _responder_events, _server, url) =
        start_responder(WebrtcStateConfig::default()).await;
    let (initiator, _initiator_events) =
        WebrtcState::new(WebrtcStateConfig::default()).expect("engine");

    let first = tokio::spawn({
        let state = initiator.clone();
        let offer = offer_to(&url);
        async move { state.peer(offer, 0).await }
    });
    let second = tokio::spawn({
        let state = initiator.clone();
        let offer = offer_to(&url);
        async move { state.peer(offer, 0).await }
    });
    let results = [
        timeout(DEADLINE, first).await.expect("deadline").expect("join"),
        timeout(DEADLINE, second).await.expect("deadline").expect("join"),
    ];
    let successes = results.iter().filter(|result| result.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|result| matches!(result, Err(Error::PeerExists(_))))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(duplicates, 1);
    // The winner stays registered.
    assert_eq!(initiator.peer_ids(), vec![url.clone()]);

    initiator.close().await;
    responder.close().await;
}

#[tokio::test]
async fn data_echo_between_two_engines() {
    let (receiver, mut receiver_events, _server, url) =
        start_responder(WebrtcStateConfig::default()).await;
    let (sender, _sender_events) =
        WebrtcState::new(WebrtcStateConfig::default()).expect("engine");

    timeout(DEADLINE, sender.peer(offer_to(&url), 0))
        .await
        .expect("peer deadline")
        .expect("peer");

    sender
        .data_out()
        .send(pb::DataTransmission {
            channel: Some(pb::DataChannel {
                dest_uuid: Some(url.clone()),
                ..Default::default()
            }),
            payload: Some(Bytes::from_static(b"hello")),
        })
        .await
        .expect("enqueue");

    let received = timeout(Duration::from_secs(10), receiver_events.data_in.recv())
        .await
        .expect("data deadline")
        .expect("data event");
    assert_eq!(received.payload.as_deref(), Some(b"hello".as_slice()));
    let channel = received.channel.expect("channel");
    assert_eq!(channel.src_uuid(), sender.src_uuid());
    assert!(channel.dest_uuid.is_none());

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn media_handshake() {
    let track = NamedTrackKey::new("rgbd", "realsenseD455", "video/h264");
    let mut allowed = HashMap::new();
    allowed.insert(track.clone(), 57011);
    let (responder, mut responder_events, _server, url) = start_responder(WebrtcStateConfig {
        allowed_in_tracks: allowed,
        ..Default::default()
    })
    .await;
    let (initiator, _initiator_events) =
        WebrtcState::new(WebrtcStateConfig::default()).expect("engine");

    let mut offer = PeeringOffer::new(url.clone());
    offer.out_tracks.insert(track.clone(), 57012);
    let feeder = spawn_rtp_feeder(57012);

    timeout(DEADLINE, initiator.peer(offer, 0))
        .await
        .expect("peer deadline")
        .expect("peer");

    let received = timeout(DEADLINE, responder_events.media_in.recv())
        .await
        .expect("media deadline")
        .expect("media event");
    assert_eq!(received.src_uuid(), initiator.src_uuid());
    assert_eq!(received.localhost_port(), 57011);
    assert!(!received.close());
    let received_track = received.track.expect("track");
    assert_eq!(received_track.track_id(), "rgbd");
    assert_eq!(received_track.stream_id(), "realsenseD455");
    assert_eq!(received_track.mime_type().to_ascii_lowercase(), "video/h264");

    feeder.abort();
    initiator.close().await;
    responder.close().await;
}

#[tokio::test]
async fn reconcile_add_modify_remove() {
    let track = NamedTrackKey::new("rgbd", "realsenseD455", "video/h264");
    let mut allowed = HashMap::new();
    allowed.insert(track.clone(), 57021);
    let (responder, mut responder_events, _server, url) = start_responder(WebrtcStateConfig {
        allowed_in_tracks: allowed,
        ..Default::default()
    })
    .await;
    let (initiator, _initiator_events) =
        WebrtcState::new(WebrtcStateConfig::default()).expect("engine");
    let feeder = spawn_rtp_feeder(57022);

    // One peer with a data channel and one media track.
    let desired = pb::State {
        data: vec![pb::DataChannel {
            dest_uuid: Some(url.clone()),
            ..Default::default()
        }],
        media: vec![pb::MediaChannel {
            dest_uuid: Some(url.clone()),
            track: Some(track.to_proto()),
            localhost_port: Some(57022),
            ..Default::default()
        }],
        ..Default::default()
    };
    timeout(DEADLINE, initiator.reconcile(&desired))
        .await
        .expect("reconcile deadline")
        .expect("reconcile");
    assert_eq!(initiator.peer_ids(), vec![url.clone()]);
    assert_eq!(
        initiator.peer_out_tracks(&url).expect("peer"),
        vec![track.clone()]
    );

    let received = timeout(DEADLINE, responder_events.media_in.recv())
        .await
        .expect("media deadline")
        .expect("media event");
    assert_eq!(received.src_uuid(), initiator.src_uuid());
    assert_eq!(received.localhost_port(), 57021);

    // Drop the media, keep the data channel: the peer is re-created with
    // no outbound tracks.
    let desired = pb::State {
        data: vec![pb::DataChannel {
            dest_uuid: Some(url.clone()),
            ..Default::default()
        }],
        ..Default::default()
    };
    timeout(DEADLINE, initiator.reconcile(&desired))
        .await
        .expect("reconcile deadline")
        .expect("reconcile");
    assert_eq!(initiator.peer_ids(), vec![url.clone()]);
    assert!(initiator.peer_out_tracks(&url).expect("peer").is_empty());

    // Reconciling the same desired state again changes nothing.
    timeout(DEADLINE, initiator.reconcile(&desired))
        .await
        .expect("reconcile deadline")
        .expect("reconcile");
    assert_eq!(initiator.peer_ids(), vec![url.clone()]);

    // Empty everything: the peer goes away.
    let desired = pb::State::default();
    timeout(DEADLINE, initiator.reconcile(&desired))
        .await
        .expect("reconcile deadline")
        .expect("reconcile");
    assert!(initiator.peer_ids().is_empty());

    feeder.abort();
    initiator.close().await;
    responder.close().await;
}

#[tokio::test]
async fn reconnect_budget_exhaustion() {
    // Nothing listens on the target port, so every attempt fails fast.
    let (state, mut events) = WebrtcState::new(WebrtcStateConfig {
        reconnect_attempts: 2,
        ..Default::default()
    })
    .expect("engine");
    let result = state.peer(offer_to("http://127.0.0.1:9/api/webrtc"), 0).await;
    assert!(result.is_err());
    // The retry chain runs to exhaustion before `peer` returns: no peer
    // left, exactly one background-change signal.
    assert!(state.peer_ids().is_empty());
    timeout(Duration::from_secs(5), events.background_change.recv())
        .await
        .expect("signal deadline")
        .expect("signal");
    assert!(events.background_change.try_recv().is_err());
    state.close().await;
}

#[tokio::test]
async fn zero_reconnect_attempts_closes_after_one_failure() {
    let (state, mut events) =
        WebrtcState::new(WebrtcStateConfig::default()).expect("engine");
    let result = state.peer(offer_to("http://127.0.0.1:9/api/webrtc"), 0).await;
    assert!(result.is_err());
    assert!(state.peer_ids().is_empty());
    timeout(Duration::from_secs(5), events.background_change.recv())
        .await
        .expect("signal deadline")
        .expect("signal");
    assert!(events.background_change.try_recv().is_err());
    state.close().await;
}
