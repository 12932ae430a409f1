//! Message framing: an 8-digit zero-padded ASCII byte count, then the payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ControllerError, Result};

pub const HEADER_LEN: usize = 8;

/// Largest payload accepted in either direction.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub fn encode_header(len: usize) -> Result<[u8; HEADER_LEN]> {
    if len > MAX_MESSAGE_SIZE {
        return Err(ControllerError::Protocol(format!(
            "message of {} bytes exceeds limit of {}",
            len, MAX_MESSAGE_SIZE
        )));
    }
    let text = format!("{:08}", len);
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<usize> {
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(ControllerError::Protocol(format!(
            "malformed length prefix {:?}",
            String::from_utf8_lossy(header)
        )));
    }
    let len: usize = std::str::from_utf8(header)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ControllerError::Protocol("malformed length prefix".to_string()))?;
    if len > MAX_MESSAGE_SIZE {
        return Err(ControllerError::Protocol(format!(
            "message of {} bytes exceeds limit of {}",
            len, MAX_MESSAGE_SIZE
        )));
    }
    Ok(len)
}

pub async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = decode_header(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_message<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(payload.len())?;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
