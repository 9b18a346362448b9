//! Multi-part message framing.
//!
//! A message is a part count followed by length-prefixed parts:
//!
//! ```text
//! [u32 BE: parts][u32 BE: len][bytes of len] ... (parts times)
//! ```

use crate::config::CommConfig;
use crate::error::{CommError, Result};
use crate::message::Multipart;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read one multi-part message.
///
/// Returns `None` on clean EOF (peer closed the connection between messages).
pub async fn read_multipart<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Multipart>> {
    let mut count_buf = [0u8; 4];
    match reader.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let parts = u32::from_be_bytes(count_buf) as usize;
    if parts > CommConfig::MAX_MESSAGE_PARTS {
        return Err(CommError::BadMessage {
            message: format!(
                "Message has {} parts, maximum is {}",
                parts,
                CommConfig::MAX_MESSAGE_PARTS
            ),
        });
    }

    let mut total = 0usize;
    let mut frames = Vec::with_capacity(parts);
    for _ in 0..parts {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        total += len;
        if total > CommConfig::MAX_MESSAGE_SIZE {
            return Err(CommError::BadMessage {
                message: format!(
                    "Message size exceeds maximum {}",
                    CommConfig::MAX_MESSAGE_SIZE
                ),
            });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        frames.push(Bytes::from(payload));
    }

    Ok(Some(frames))
}

/// Write one multi-part message and flush.
pub async fn write_multipart<W: AsyncWriteExt + Unpin>(writer: &mut W, frames: &[Bytes]) -> Result<()> {
    writer.write_all(&(frames.len() as u32).to_be_bytes()).await?;
    for frame in frames {
        writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_multipart_preserves_empty_frames() {
        block_on(async {
            let frames = vec![
                Bytes::from_static(b"id"),
                Bytes::new(),
                Bytes::from_static(b"payload"),
            ];
            let mut buf = Vec::new();
            write_multipart(&mut buf, &frames).await.unwrap();

            let mut cursor = std::io::Cursor::new(buf);
            let read_back = read_multipart(&mut cursor).await.unwrap();
            assert_eq!(read_back, Some(frames));
        });
    }

    #[test]
    fn test_read_empty_stream_returns_none() {
        block_on(async {
            let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
            assert!(read_multipart(&mut cursor).await.unwrap().is_none());
        });
    }

    #[test]
    fn test_read_too_many_parts_returns_error() {
        block_on(async {
            let count = (CommConfig::MAX_MESSAGE_PARTS + 1) as u32;
            let mut cursor = std::io::Cursor::new(count.to_be_bytes().to_vec());
            assert!(read_multipart(&mut cursor).await.is_err());
        });
    }

    #[test]
    fn test_read_truncated_part_returns_error() {
        block_on(async {
            let mut buf = Vec::new();
            buf.extend_from_slice(&1u32.to_be_bytes());
            buf.extend_from_slice(&10u32.to_be_bytes());
            buf.extend_from_slice(b"short");
            let mut cursor = std::io::Cursor::new(buf);
            assert!(read_multipart(&mut cursor).await.is_err());
        });
    }
}
