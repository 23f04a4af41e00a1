//! Noema binary protocol
//!
//! Length-prefixed request/response protocol spoken by the storage server.
//!
//! Message format:
//! ```text
//! [4 bytes: big-endian message length][N bytes: MessagePack payload]
//! ```
//!
//! Connections are long-lived and strictly request/response: the client
//! writes one request frame, the server answers with exactly one response
//! frame. On a protocol error the server sends a single `Error` response and
//! closes the connection.

pub mod error;
mod messages;

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub use error::{ProtocolError, Result};
pub use messages::{
    AssociationInfo, ConceptInfo, LearnOptionsMsg, PathMsg, PathStepMsg, StorageRequest,
    StorageResponse,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum message size (16 MiB); larger frames are refused as invalid data
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Association type codes on the wire. Fixed contract:
/// Semantic=0, Causal=1, Temporal=2, Hierarchical=3, Compositional=4.
pub const ASSOC_TYPE_SEMANTIC: u8 = 0;
pub const ASSOC_TYPE_CAUSAL: u8 = 1;
pub const ASSOC_TYPE_TEMPORAL: u8 = 2;
pub const ASSOC_TYPE_HIERARCHICAL: u8 = 3;
pub const ASSOC_TYPE_COMPOSITIONAL: u8 = 4;

/// Send a message over a stream with length prefix
pub async fn send_message<S, T>(stream: &mut S, message: &T) -> Result<()>
where
    S: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = rmp_serde::to_vec_named(message)?;

    if bytes.len() > MAX_MESSAGE_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(
            bytes.len(),
            MAX_MESSAGE_SIZE as usize,
        ));
    }

    // Length prefix (4 bytes, big-endian)
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;

    Ok(())
}

/// Receive a message from a stream with length prefix.
///
/// A clean EOF before the length prefix is `ConnectionClosed`; an oversize
/// length is `MessageTooLarge` and the payload is never read.
pub async fn recv_message<S, T>(stream: &mut S) -> Result<T>
where
    S: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let len = match stream.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    };

    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(
            len as usize,
            MAX_MESSAGE_SIZE as usize,
        ));
    }

    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;

    Ok(rmp_serde::from_slice(&buf)?)
}

/// Helper for the request-response pattern
pub async fn request<S, Req, Resp>(stream: &mut S, request: &Req) -> Result<Resp>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
    Req: Serialize,
    Resp: for<'de> Deserialize<'de>,
{
    send_message(stream, request).await?;
    recv_message(stream).await
}
