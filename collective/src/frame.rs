//! Length-prefixed JSON framing for the TCP transport.

use std::io;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Writes one frame: a big-endian length header followed by the JSON payload.
///
/// # Arguments
/// * `tx` - The underlying writer.
/// * `buf` - Scratch buffer reused across calls to avoid per-frame allocations.
/// * `value` - The payload to encode.
pub(crate) async fn write_frame<W, T>(tx: &mut W, buf: &mut Vec<u8>, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    buf.clear();
    buf.resize(LEN_TYPE_SIZE, 0);
    serde_json::to_writer(&mut *buf, value)?;

    let len = (buf.len() - LEN_TYPE_SIZE) as LenType;
    buf[..LEN_TYPE_SIZE].copy_from_slice(&len.to_be_bytes());

    tx.write_all(buf).await?;
    tx.flush().await
}

/// Reads one frame and decodes its JSON payload.
///
/// # Arguments
/// * `rx` - The underlying reader.
/// * `buf` - Scratch buffer reused across calls.
pub(crate) async fn read_frame<R, T>(rx: &mut R, buf: &mut Vec<u8>) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0; LEN_TYPE_SIZE];
    rx.read_exact(&mut len_buf).await?;
    let len = LenType::from_be_bytes(len_buf) as usize;

    buf.clear();
    buf.resize(len, 0);
    rx.read_exact(buf).await?;

    serde_json::from_slice(buf).map_err(io::Error::from)
}
