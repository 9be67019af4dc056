//! Network Module
//!
//! Framed TCP request/response transport between reconciler nodes, and
//! the admin client that fetches history from a peer over it.

mod server;
mod client;
mod peer;

pub use server::{MessageHandler, NetworkServer};
pub use client::NetworkClient;
pub use peer::PeerAdminClient;

use crate::replication::{Message, FrameHeader};
use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &Message::StatusRequest).await.unwrap();
        let received = read_message(&mut b).await.unwrap();
        assert_eq!(received.type_name(), "StatusRequest");
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let body = Message::StatusRequest.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xffff;

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();
        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }
}
