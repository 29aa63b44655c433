//! The localhost-UDP media bridge.
//!
//! Outbound tracks are fed by local producers sending raw RTP datagrams to
//! a well-known localhost port; one ingress task per track fans each
//! datagram out to every subscribing peer's static RTP sink. Inbound
//! tracks flow the other way: a reader task pumps the remote track into a
//! UDP socket pointed at the allowed localhost port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::TrackLocalWriter;

use crate::state::WebrtcState;
use crate::track::{LocalhostPort, NamedTrackKey};

/// RTP fits in one MTU; anything larger is already broken.
pub(crate) const RTP_BUFFER_BYTES: usize = 1500;

const PLI_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);

/// UDP ingress for one outbound track: `127.0.0.1:<port>` → every
/// subscriber's RTP sink.
///
/// Creation is cheap and does not touch the network; `start` is idempotent
/// and is invoked whenever a subscribing peer reaches ICE connected.
pub(crate) struct UdpIngress {
    port: LocalhostPort,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl UdpIngress {
    pub(crate) fn new(port: LocalhostPort) -> Self {
        Self {
            port,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Bind the ingress port and spawn the forwarding task. Subsequent
    /// calls are no-ops.
    pub(crate) fn start(&self, state: Arc<WebrtcState>, key: NamedTrackKey) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let port = self.port;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let socket = match UdpSocket::bind(("127.0.0.1", port)).await {
                Ok(socket) => socket,
                Err(err) => {
                    warn!("ingress bind 127.0.0.1:{port} failed: {err}");
                    state.fail_out_track(&key);
                    return;
                }
            };
            debug!("ingress for {key:?} listening on 127.0.0.1:{port}");
            let mut buf = [0u8; RTP_BUFFER_BYTES];
            loop {
                let len = tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = socket.recv(&mut buf) => match received {
                        Ok(len) => len,
                        Err(err) => {
                            warn!("ingress recv on 127.0.0.1:{port} failed: {err}");
                            state.fail_out_track(&key);
                            return;
                        }
                    },
                };
                // Snapshot the subscriber set; the track may have been
                // removed while we were waiting on the socket.
                let Some(sinks) = state.out_track_sinks(&key) else {
                    return;
                };
                for sink in sinks {
                    if let Err(err) = sink.write(&buf[..len]).await {
                        warn!("rtp write for {key:?} failed: {err}");
                        state.fail_out_track(&key);
                        return;
                    }
                }
            }
        });
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Open the egress socket for one inbound track, pointed at the allowed
/// localhost port.
pub(crate) async fn connect_egress(port: LocalhostPort) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
    socket.connect(("127.0.0.1", port)).await?;
    Ok(socket)
}

/// Periodically request a keyframe for an inbound video track until the
/// token is cancelled or the connection goes away.
pub(crate) fn spawn_pli_ticker(
    pc: Arc<RTCPeerConnection>,
    media_ssrc: u32,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PLI_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if let Err(err) = pc.write_rtcp(&[Box::new(pli)]).await {
                debug!("pli send stopped: {err}");
                return;
            }
        }
    });
}
