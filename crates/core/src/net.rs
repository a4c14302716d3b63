//! Msgpack-ext framing for scheduler connections.
//!
//! Each message on the wire is a msgpack `ext` value whose body is the
//! msgpack-encoded message payload. The reader accepts every ext header
//! form; the writer emits the smallest of ext8/16/32.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ext type byte marking a framed message payload.
const PAYLOAD_EXT_TYPE: u8 = 0x06;

const FIXEXT1: u8 = 0xd4;
const FIXEXT2: u8 = 0xd5;
const FIXEXT4: u8 = 0xd6;
const FIXEXT8: u8 = 0xd7;
const FIXEXT16: u8 = 0xd8;
const EXT8: u8 = 0xc7;
const EXT16: u8 = 0xc8;
const EXT32: u8 = 0xc9;

/// Writes one framed message.
pub async fn send_message<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = Vec::with_capacity(6);
    match payload.len() {
        0..=0xff => {
            header.push(EXT8);
            header.push(payload.len() as u8);
        }
        0x100..=0xffff => {
            header.push(EXT16);
            header.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        _ => {
            let len = u32::try_from(payload.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "message too large for ext32")
            })?;
            header.push(EXT32);
            header.extend_from_slice(&len.to_be_bytes());
        }
    }
    header.push(PAYLOAD_EXT_TYPE);
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one framed message. Returns `None` when the peer closed the
/// connection before a new message started.
pub async fn receive_message<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let marker = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };

    let len = match marker {
        FIXEXT1 => 1,
        FIXEXT2 => 2,
        FIXEXT4 => 4,
        FIXEXT8 => 8,
        FIXEXT16 => 16,
        EXT8 => usize::from(reader.read_u8().await?),
        EXT16 => usize::from(reader.read_u16().await?),
        EXT32 => reader.read_u32().await? as usize,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected message marker 0x{other:02x}"),
            ));
        }
    };

    let ext_type = reader.read_u8().await?;
    if ext_type != PAYLOAD_EXT_TYPE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected ext type 0x{ext_type:02x}"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Address this process advertises to peers.
///
/// Workers and schedulers pass an explicit `--host`; clients fall back to
/// the `SPIDER_HOST` environment variable, then loopback.
pub fn local_address() -> String {
    std::env::var("SPIDER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_message_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        send_message(&mut client, b"hello").await.unwrap();
        let received = receive_message(&mut server).await.unwrap().unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn large_message_round_trips() {
        let payload = vec![0xabu8; 70_000];
        let (mut client, mut server) = tokio::io::duplex(256 * 1024);
        send_message(&mut client, &payload).await.unwrap();
        let received = receive_message(&mut server).await.unwrap().unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn closed_connection_yields_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(receive_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_ext_marker_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x90]).await.unwrap();
        let err = receive_message(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
