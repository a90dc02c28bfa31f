//! Length-prefixed bincode wire protocol for P2P communication.
//!
//! Frame format: [4-byte length (u32 big-endian)][bincode WireFrame]
//! Every frame carries the network magic so a testnet node can never feed
//! mainnet data into our stores.

use crate::error::{NetworkError, ProtocolError};
use crate::network::message::NetworkEnvelope;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame we accept or produce (10 MiB). The bulk data response
/// budget is derived from it.
pub const MAX_PERMITTED_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub magic: [u8; 4],
    pub envelope: NetworkEnvelope,
}

fn encode(magic: [u8; 4], envelope: &NetworkEnvelope) -> Result<Vec<u8>, ProtocolError> {
    let frame = WireFrame {
        magic,
        envelope: envelope.clone(),
    };
    let payload = bincode::serialize(&frame)
        .map_err(|e| ProtocolError::Internal(format!("Failed to serialize {}: {}", envelope.message_type(), e)))?;
    if payload.len() > MAX_PERMITTED_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_PERMITTED_MESSAGE_SIZE,
        });
    }
    Ok(payload)
}

/// Serialize an envelope and write it as a length-prefixed frame.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: [u8; 4],
    envelope: &NetworkEnvelope,
) -> Result<(), NetworkError> {
    let frame = serialize_frame(magic, envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Pre-serialize an envelope into a length-prefixed frame.
pub fn serialize_frame(magic: [u8; 4], envelope: &NetworkEnvelope) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode(magic, envelope)?;
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read a length-prefixed frame and decode the envelope.
/// Returns Ok(None) on clean EOF (connection closed).
pub async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected_magic: [u8; 4],
) -> Result<Option<NetworkEnvelope>, NetworkError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PERMITTED_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_PERMITTED_MESSAGE_SIZE,
        }
        .into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let frame: WireFrame = bincode::deserialize(&payload)
        .map_err(|e| ProtocolError::Foreign(format!("Undecodable frame: {}", e)))?;
    if frame.magic != expected_magic {
        return Err(ProtocolError::Foreign(format!(
            "Wrong network magic {}",
            hex::encode(frame.magic)
        ))
        .into());
    }

    Ok(Some(frame.envelope))
}
