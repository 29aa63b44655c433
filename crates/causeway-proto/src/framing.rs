//! Length-prefixed framing for the control-plane stream.
//!
//! Each frame is a big-endian `u32` payload length followed by one encoded
//! protobuf message. The stream is reliable and ordered (a Unix or TCP
//! socket), so no checksum or resynchronization marker is needed.

use std::io;

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload. A desired-state message is a few
/// kilobytes; anything near this limit is a corrupt or hostile stream.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Write one message as a length-prefixed frame.
pub async fn write_frame<W, M>(writer: &mut W, msg: &M) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let payload = msg.encode_to_vec();
    if payload.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Read one length-prefixed frame and decode it.
///
/// Returns `Ok(None)` on a clean end of stream (EOF at a frame boundary).
/// EOF in the middle of a frame is an error.
pub async fn read_frame<R, M>(reader: &mut R) -> io::Result<Option<M>>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let msg = M::decode(payload.as_slice())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mutation, DataTransmission, Mutation};

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = Mutation {
            kind: Some(mutation::Kind::Data(DataTransmission {
                channel: None,
                payload: Some(prost::bytes::Bytes::from_static(b"hello")),
            })),
        };
        write_frame(&mut client, &msg).await.unwrap();
        let decoded: Mutation = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let decoded: Option<Mutation> = read_frame(&mut server).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&8u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);
        let result: io::Result<Option<Mutation>> = read_frame(&mut server).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_BYTES as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        let result: io::Result<Option<Mutation>> = read_frame(&mut server).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn garbage_payload_never_panics() {
        use rand::{Rng, RngCore};
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let len: usize = rng.gen_range(1..256);
            let mut payload = vec![0u8; len];
            rng.fill_bytes(&mut payload);
            let (mut client, mut server) = tokio::io::duplex(4096);
            client.write_all(&(len as u32).to_be_bytes()).await.unwrap();
            client.write_all(&payload).await.unwrap();
            drop(client);
            let _: io::Result<Option<Mutation>> = read_frame(&mut server).await;
        }
    }
}
