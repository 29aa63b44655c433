//! Session supervisor: bridges one framed control stream to one engine.
//!
//! Inbound `Mutation` frames carry desired-state replacements and
//! outbound data payloads; outbound `Event` frames carry inbound data,
//! media notifications, and achieved-state snapshots. One stream drives
//! exactly one isolated `WebrtcState`.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::warn;

use causeway_proto::framing;
use causeway_proto::{event, mutation, Event, Mutation, State};

use crate::error::{Error, Result};
use crate::http::InterfaceServer;
use crate::state::{WebrtcEvents, WebrtcState};

/// Run one control session until the stream ends or the engine reports a
/// terminal error. The caller closes the engine and the interface server
/// afterwards.
pub async fn run_session<S>(
    stream: S,
    state: Arc<WebrtcState>,
    mut events: WebrtcEvents,
    server: Arc<InterfaceServer>,
    mut server_errors: mpsc::Receiver<Error>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (set_state_tx, mut set_state_rx) = mpsc::channel::<State>(8);
    let data_out = state.data_out();

    let mut inbound = tokio::spawn(async move {
        let mut reader = reader;
        loop {
            match framing::read_frame::<_, Mutation>(&mut reader).await {
                Ok(Some(incoming)) => match incoming.kind {
                    Some(mutation::Kind::Data(data)) => {
                        if data_out.send(data).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(mutation::Kind::SetState(desired)) => {
                        if set_state_tx.send(desired).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => {}
                },
                Ok(None) => return Ok(()),
                Err(err) => return Err(Error::Io(err)),
            }
        }
    });

    loop {
        tokio::select! {
            joined = &mut inbound => {
                return match joined {
                    Ok(result) => result,
                    Err(err) => Err(Error::Io(std::io::Error::other(err))),
                };
            }
            desired = set_state_rx.recv() => {
                let Some(mut desired) = desired else {
                    return match inbound.await {
                        Ok(result) => result,
                        Err(err) => Err(Error::Io(std::io::Error::other(err))),
                    };
                };
                // Coalesce a burst of desired states down to the latest.
                while let Ok(newer) = set_state_rx.try_recv() {
                    desired = newer;
                }
                match &desired.http_server_config {
                    Some(config) => {
                        if let Err(err) = server.configure(config.clone()).await {
                            warn!("failed to configure signaling interface: {err}");
                        }
                    }
                    None => server.close().await,
                }
                state.reconcile(&desired).await?;
                let achieved = state.to_proto(&server)?;
                send_event(&mut writer, event::Kind::AchievedState(achieved)).await?;
            }
            data = events.data_in.recv() => {
                let Some(data) = data else { continue };
                send_event(&mut writer, event::Kind::Data(data)).await?;
            }
            media = events.media_in.recv() => {
                let Some(media) = media else { continue };
                send_event(&mut writer, event::Kind::Media(media)).await?;
            }
            changed = events.background_change.recv() => {
                if changed.is_none() {
                    continue;
                }
                let achieved = state.to_proto(&server)?;
                send_event(&mut writer, event::Kind::AchievedState(achieved)).await?;
            }
            failure = server_errors.recv() => {
                let Some(failure) = failure else { continue };
                warn!("signaling interface error: {failure}");
                let achieved = state.to_proto(&server)?;
                send_event(&mut writer, event::Kind::AchievedState(achieved)).await?;
            }
        }
    }
}

async fn send_event<W>(writer: &mut W, kind: event::Kind) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    framing::write_frame(writer, &Event { kind: Some(kind) })
        .await
        .map_err(Error::Io)
}
