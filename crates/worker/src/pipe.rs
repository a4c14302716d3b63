//! Length-framed envelopes over the supervisor/child pipes.
//!
//! Each message is a 16-byte ASCII decimal length prefix followed by
//! exactly that many payload bytes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LENGTH_PREFIX_LEN: usize = 16;

/// Writes one framed message.
pub async fn send_message<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("{:016}", payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one framed message. Returns `None` when the pipe closed before a
/// full header arrived.
pub async fn receive_message<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let text = std::str::from_utf8(&header)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length prefix is not ascii"))?;
    let len: usize = text.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid length prefix {text:?}"),
        )
    })?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_round_trips() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        send_message(&mut tx, b"payload").await.unwrap();
        let received = receive_message(&mut rx).await.unwrap().unwrap();
        assert_eq!(received, b"payload");
    }

    #[tokio::test]
    async fn empty_message_round_trips() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        send_message(&mut tx, b"").await.unwrap();
        let received = receive_message(&mut rx).await.unwrap().unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn closed_pipe_yields_none() {
        let (tx, mut rx) = tokio::io::duplex(64);
        drop(tx);
        assert!(receive_message(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_header_is_rejected() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(b"not-a-number----").await.unwrap();
        assert!(receive_message(&mut rx).await.is_err());
    }
}
