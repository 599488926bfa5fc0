use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TunnelError;

/// Multiplexing frame carried inside the sealed connection stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Frame {
    /// Peer opened a session on a named channel.
    Open { session: String, channel: String },
    /// One session message.
    Data {
        session: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Peer closed the session. No more data follows.
    Close { session: String },
}

impl Frame {
    pub(crate) fn session(&self) -> &str {
        match self {
            Frame::Open { session, .. } | Frame::Data { session, .. } | Frame::Close { session } => {
                session
            }
        }
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, TunnelError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, TunnelError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Write a length-prefixed record (u32 big-endian length, then bytes).
pub(crate) async fn write_framed<W>(writer: &mut W, data: &[u8]) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(data.len()).map_err(|_| TunnelError::MessageTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed record, refusing anything above `max_size`.
pub(crate) async fn read_framed<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TunnelError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
