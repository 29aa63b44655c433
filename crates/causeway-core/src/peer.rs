//! Peer lifecycle.
//!
//! A `WebrtcPeer` is one remote endpoint. The local side is either the
//! initiator (creates the connection, sends the offer, owns reconnect
//! attempts) or the responder (receives the offer, answers, never
//! retries). `close` and `fail` are once-guarded: concurrent callers
//! observe exactly one execution of the body.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::MarshalSize;

use causeway_proto as pb;

use crate::bridge::{self, RTP_BUFFER_BYTES};
use crate::client;
use crate::error::{Error, Result};
use crate::state::WebrtcState;
use crate::track::{LocalhostPort, NamedTrackKey};

/// Depth of the per-peer outbound data queue.
const DATA_QUEUE_DEPTH: usize = 10;

/// The local role in a peering relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Creates the connection, sends the offer, retries on failure.
    Initiator,
    /// Receives the offer and answers; failure is terminal.
    Responder,
}

/// The intent to create (or re-create) one peer.
#[derive(Debug, Clone)]
pub struct PeeringOffer {
    /// Target id. Empty for broadcast setup; a signaling URL for the
    /// initiator role; any string for the responder role.
    pub peer_id: String,
    /// The remote offer, present only on the responder side.
    pub sdp: Option<RTCSessionDescription>,
    /// Tracks to send, each fed from a localhost UDP port.
    pub out_tracks: HashMap<NamedTrackKey, LocalhostPort>,
    /// Tracks the remote is expected to send.
    pub in_tracks: Vec<NamedTrackKey>,
    /// Whether a data channel is wanted.
    pub data_channel: bool,
}

impl PeeringOffer {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            sdp: None,
            out_tracks: HashMap::new(),
            in_tracks: Vec::new(),
            data_channel: false,
        }
    }

    /// Step 1 of the signaling protocol: advertise our outbound tracks,
    /// learn which the responder accepts and which broadcasts it offers,
    /// and narrow this offer to the intersection.
    pub(crate) async fn prenegotiate(
        &mut self,
        state: &WebrtcState,
        client: &reqwest::Client,
    ) -> Result<()> {
        reqwest::Url::parse(&self.peer_id)
            .map_err(|_| Error::InvalidPeerUrl(self.peer_id.clone()))?;
        let query = pb::WebrtcOffer {
            src_uuid: Some(state.src_uuid().to_string()),
            local_tracks: self.out_tracks.keys().map(NamedTrackKey::to_proto).collect(),
            local_tracks_set: Some(true),
            remote_tracks_set: Some(false),
            datachannel: Some(self.data_channel),
            ..Default::default()
        };
        let answer = client::put_offer(client, &self.peer_id, &query).await?;
        if answer.local_tracks_set.is_none() || answer.remote_tracks_set.is_none() {
            return Err(Error::Signaling(
                "prenegotiation answer does not have local or remote tracks set".into(),
            ));
        }
        let mut accepted_remote = Vec::new();
        for track in &answer.local_tracks {
            let key = NamedTrackKey::from_proto(track);
            if state.in_track_allowed(&key).is_some() {
                accepted_remote.push(key);
            }
        }
        let mut accepted_local = HashMap::new();
        for track in &answer.remote_tracks {
            let key = NamedTrackKey::from_proto(track);
            if let Some(port) = self.out_tracks.get(&key) {
                accepted_local.insert(key, *port);
            }
        }
        self.out_tracks = accepted_local;
        self.in_tracks = accepted_remote;
        Ok(())
    }
}

/// An inbound track's forwarding resources: the allowed localhost port and
/// the token stopping its reader and PLI tasks.
struct InboundTrack {
    port: LocalhostPort,
    cancel: CancellationToken,
}

pub(crate) struct WebrtcPeer {
    pub(crate) peer_id: String,
    pub(crate) role: PeerRole,
    /// Whether the desired state asked for a data channel. Reconciliation
    /// diffs against this rather than the (asynchronously attached)
    /// channel itself.
    pub(crate) wants_data: bool,
    pub(crate) client: reqwest::Client,
    pub(crate) fails: AtomicU32,
    state: Weak<WebrtcState>,
    /// Retry seed for the initiator role, updated after prenegotiation.
    offer: Mutex<PeeringOffer>,
    pub(crate) pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    pub(crate) datachannel: Mutex<Option<Arc<RTCDataChannel>>>,
    pub(crate) out_tracks: Mutex<HashMap<NamedTrackKey, LocalhostPort>>,
    in_tracks: Mutex<HashMap<NamedTrackKey, InboundTrack>>,
    data_out_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    data_out_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    closed: AtomicBool,
    failed: AtomicBool,
}

impl WebrtcPeer {
    pub(crate) fn new(
        role: PeerRole,
        client: reqwest::Client,
        offer: PeeringOffer,
        fails: u32,
        state: Weak<WebrtcState>,
    ) -> Arc<Self> {
        let (data_out_tx, data_out_rx) = mpsc::channel(DATA_QUEUE_DEPTH);
        Arc::new(Self {
            peer_id: offer.peer_id.clone(),
            role,
            wants_data: offer.data_channel,
            client,
            fails: AtomicU32::new(fails),
            state,
            offer: Mutex::new(offer),
            pc: Mutex::new(None),
            datachannel: Mutex::new(None),
            out_tracks: Mutex::new(HashMap::new()),
            in_tracks: Mutex::new(HashMap::new()),
            data_out_tx: Mutex::new(Some(data_out_tx)),
            data_out_rx: Mutex::new(Some(data_out_rx)),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_offer(&self, offer: PeeringOffer) {
        *self.offer.lock().unwrap() = offer;
    }

    /// Enqueue one payload for the data channel, in arrival order.
    pub(crate) async fn send_data(&self, payload: Bytes) {
        let sender = self.data_out_tx.lock().unwrap().clone();
        let Some(sender) = sender else {
            debug!("data queue for {} is closed, dropping payload", self.peer_id);
            return;
        };
        if sender.send(payload).await.is_err() {
            debug!("data queue for {} is closed, dropping payload", self.peer_id);
        }
    }

    /// Release everything this peer owns. Runs at most once; later calls
    /// return immediately.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.state.upgrade();
        if let Some(state) = &state {
            state.remove_peer(&self.peer_id);
        }
        // Dropping the sender ends the data writer once the queue drains.
        self.data_out_tx.lock().unwrap().take();
        self.data_out_rx.lock().unwrap().take();

        let out_tracks = std::mem::take(&mut *self.out_tracks.lock().unwrap());
        if let Some(state) = &state {
            state.release_out_tracks(&self.peer_id, &out_tracks);
        }

        let in_tracks = std::mem::take(&mut *self.in_tracks.lock().unwrap());
        for (key, inbound) in in_tracks {
            inbound.cancel.cancel();
            if let Some(state) = &state {
                state.publish_media_closed(&self.peer_id, &key, inbound.port);
            }
        }

        self.datachannel.lock().unwrap().take();
        let pc = self.pc.lock().unwrap().take();
        if let Some(pc) = pc {
            if let Err(err) = pc.close().await {
                warn!("peer connection close failed: {err}");
            }
        }
        info!("closed local->{}", self.peer_id);

        // Symmetric teardown: tell the remote, if the id is a signaling
        // URL. Best effort.
        if let Some(state) = state {
            if reqwest::Url::parse(&self.peer_id).is_ok() {
                let client = self.client.clone();
                let url = self.peer_id.clone();
                let src_uuid = state.src_uuid().to_string();
                tokio::spawn(async move {
                    if let Err(err) = client::delete_peer(&client, &url, &src_uuid).await {
                        debug!("unpeer {url}: {err}");
                    }
                });
            }
        }
    }

    /// Terminal failure handling: close, then either retry (initiator
    /// with budget left) or signal the supervisor. Runs at most once.
    ///
    /// Boxed because the retry re-enters `WebrtcState::peer`, whose error
    /// path lands back here.
    pub(crate) fn fail(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            if this.failed.swap(true, Ordering::SeqCst) {
                return;
            }
            warn!("peering with {} failed", this.peer_id);
            this.close().await;
            let Some(state) = this.state.upgrade() else {
                return;
            };
            let fails = this.fails.load(Ordering::SeqCst);
            if this.role == PeerRole::Initiator && fails < state.reconnect_attempts() {
                info!("reconnecting to {} (attempt {})", this.peer_id, fails + 1);
                let offer = this.offer.lock().unwrap().clone();
                if let Err(err) = state.peer(offer, fails + 1).await {
                    warn!("reconnection to {} failed: {err}", this.peer_id);
                }
            } else {
                state.signal_background_change();
            }
        })
    }

    /// Wire a data channel into the peer: inbound messages to the
    /// engine's `DataIn`, the outbound queue to the channel once it
    /// opens. Only the first channel is attached.
    pub(crate) fn attach_data_channel(
        self: &Arc<Self>,
        state: &Arc<WebrtcState>,
        channel: Arc<RTCDataChannel>,
    ) {
        {
            let mut guard = self.datachannel.lock().unwrap();
            if guard.is_some() {
                return;
            }
            *guard = Some(channel.clone());
        }

        let data_in = state.data_in_sender();
        let peer_id = self.peer_id.clone();
        channel.on_message(Box::new(move |message| {
            let data_in = data_in.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let transmission = pb::DataTransmission {
                    channel: Some(pb::DataChannel {
                        src_uuid: Some(peer_id),
                        dest_uuid: None,
                    }),
                    payload: Some(message.data),
                };
                if data_in.send(transmission).await.is_err() {
                    debug!("engine closed, dropping inbound data");
                }
            })
        }));

        let weak_peer = Arc::downgrade(self);
        let weak_channel = Arc::downgrade(&channel);
        channel.on_open(Box::new(move || {
            let weak_peer = weak_peer.clone();
            let weak_channel = weak_channel.clone();
            Box::pin(async move {
                let (Some(peer), Some(channel)) = (weak_peer.upgrade(), weak_channel.upgrade())
                else {
                    return;
                };
                let Some(mut queue) = peer.data_out_rx.lock().unwrap().take() else {
                    return;
                };
                let failer = Arc::downgrade(&peer);
                drop(peer);
                tokio::spawn(async move {
                    while let Some(payload) = queue.recv().await {
                        if let Err(err) = channel.send(&payload).await {
                            warn!("data channel send failed: {err}");
                            if let Some(peer) = failer.upgrade() {
                                peer.fail().await;
                            }
                            return;
                        }
                    }
                });
            })
        }));
    }

    pub(crate) fn install_ice_handler(
        self: &Arc<Self>,
        state: &Arc<WebrtcState>,
        pc: &Arc<RTCPeerConnection>,
    ) {
        use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

        let weak_peer = Arc::downgrade(self);
        let weak_state = Arc::downgrade(state);
        let peer_id = self.peer_id.clone();
        let src_uuid = state.src_uuid().to_string();
        pc.on_ice_connection_state_change(Box::new(move |ice_state| {
            let weak_peer = weak_peer.clone();
            let weak_state = weak_state.clone();
            let peer_id = peer_id.clone();
            let src_uuid = src_uuid.clone();
            Box::pin(async move {
                info!("ice {ice_state} {src_uuid}->{peer_id}");
                let (Some(peer), Some(state)) = (weak_peer.upgrade(), weak_state.upgrade())
                else {
                    return;
                };
                match ice_state {
                    RTCIceConnectionState::Connected => state.start_out_tracks(&peer),
                    RTCIceConnectionState::Completed => peer.fails.store(0, Ordering::SeqCst),
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Closed => {
                        tokio::spawn(peer.fail());
                    }
                    _ => {}
                }
            })
        }));
    }

    pub(crate) fn install_on_track(
        self: &Arc<Self>,
        state: &Arc<WebrtcState>,
        pc: &Arc<RTCPeerConnection>,
    ) {
        let weak_peer = Arc::downgrade(self);
        let weak_state = Arc::downgrade(state);
        let weak_pc = Arc::downgrade(pc);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak_peer = weak_peer.clone();
            let weak_state = weak_state.clone();
            let weak_pc = weak_pc.clone();
            Box::pin(async move {
                let (Some(peer), Some(state), Some(pc)) =
                    (weak_peer.upgrade(), weak_state.upgrade(), weak_pc.upgrade())
                else {
                    return;
                };
                peer.handle_remote_track(&state, &pc, track).await;
            })
        }));
    }

    /// One remote track has arrived: check it against the allow list,
    /// bridge it to the allowed localhost port, and announce it.
    async fn handle_remote_track(
        self: &Arc<Self>,
        state: &Arc<WebrtcState>,
        pc: &Arc<RTCPeerConnection>,
        track: Arc<TrackRemote>,
    ) {
        let key = NamedTrackKey::new(
            track.id(),
            track.stream_id(),
            track.codec().capability.mime_type,
        );
        let Some(port) = state.in_track_allowed(&key) else {
            warn!("disallowed track {key:?} from {}, closing connection", self.peer_id);
            tokio::spawn(self.fail());
            return;
        };
        let socket = match bridge::connect_egress(port).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!("egress to 127.0.0.1:{port} failed: {err}");
                tokio::spawn(self.fail());
                return;
            }
        };
        let cancel = CancellationToken::new();
        {
            let mut in_tracks = self.in_tracks.lock().unwrap();
            if in_tracks.contains_key(&key) {
                // A duplicate advertised track violates prenegotiation
                // just like a disallowed one.
                drop(in_tracks);
                warn!("duplicate track {key:?} from {}, closing connection", self.peer_id);
                tokio::spawn(self.fail());
                return;
            }
            in_tracks.insert(
                key.clone(),
                InboundTrack {
                    port,
                    cancel: cancel.clone(),
                },
            );
        }
        debug!(
            "track {key:?} started from {}, payload type {}",
            self.peer_id,
            track.payload_type()
        );
        state.publish_media_open(&self.peer_id, &key, port).await;

        if track.kind() == RTPCodecType::Video {
            bridge::spawn_pli_ticker(pc.clone(), track.ssrc(), cancel.clone());
        }

        let failer = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut buf = [0u8; RTP_BUFFER_BYTES];
            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => return,
                    read = track.read(&mut buf) => read,
                };
                match read {
                    Ok((packet, _)) => {
                        let len = packet.marshal_size();
                        if let Err(err) = socket.send(&buf[..len]).await {
                            warn!("egress send failed: {err}");
                            if let Some(peer) = failer.upgrade() {
                                peer.fail().await;
                            }
                            return;
                        }
                    }
                    Err(err) => {
                        debug!("track read ended: {err}");
                        if let Some(peer) = failer.upgrade() {
                            peer.fail().await;
                        }
                        return;
                    }
                }
            }
        });
    }
}
