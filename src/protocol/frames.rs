//! Multipart framing over byte streams

use std::io::ErrorKind;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// One message: an ordered list of frames delivered atomically
pub type Multipart = Vec<Bytes>;

/// Largest single frame accepted (auxiliary payloads can be big)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Most frames accepted in one multipart
pub const MAX_FRAMES: u32 = 64;

/// Read one multipart from a stream
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// messages. A close in the middle of a message is an error.
pub async fn read_multipart<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Multipart>> {
    let count = match reader.read_u32().await {
        Ok(count) => count,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if count > MAX_FRAMES {
        return Err(Error::malformed(format!(
            "multipart has {} frames (max {})",
            count, MAX_FRAMES
        )));
    }

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        frames.push(Bytes::from(buf));
    }

    Ok(Some(frames))
}

/// Write one multipart to a stream and flush it
pub async fn write_multipart<W: AsyncWrite + Unpin>(writer: &mut W, frames: &[Bytes]) -> Result<()> {
    if frames.len() > MAX_FRAMES as usize {
        return Err(Error::malformed(format!(
            "multipart has {} frames (max {})",
            frames.len(),
            MAX_FRAMES
        )));
    }

    let body: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut buf = Vec::with_capacity(4 + body);
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multipart_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = vec![Bytes::from_static(b"kv"), Bytes::new(), Bytes::from_static(b"payload")];

        write_multipart(&mut a, &sent).await.unwrap();
        let received = read_multipart(&mut b).await.unwrap().unwrap();

        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_fragmented_reads_reassemble() {
        // Header, length and body arrive in separate reads
        let mut stream = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 1])
            .read(&[0, 0])
            .read(&[0, 5, b'h', b'e'])
            .read(b"llo")
            .build();

        let received = read_multipart(&mut stream).await.unwrap().unwrap();
        assert_eq!(received, vec![Bytes::from_static(b"hello")]);
    }

    #[tokio::test]
    async fn test_written_layout() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0, 0, 0, 2, 0, 0, 0, 2, b'k', b'v', 0, 0, 0, 0])
            .build();
        write_multipart(&mut stream, &[Bytes::from_static(b"kv"), Bytes::new()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clean_close_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_multipart(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_message_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Announces two frames, delivers half of one
        a.write_all(&[0, 0, 0, 2, 0, 0, 0, 9, b'x']).await.unwrap();
        drop(a);
        assert!(read_multipart(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32) + 1;
        a.write_all(&1u32.to_be_bytes()).await.unwrap();
        a.write_all(&len.to_be_bytes()).await.unwrap();

        let err = read_multipart(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_too_many_frames_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAMES + 1).to_be_bytes()).await.unwrap();

        let err = read_multipart(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
    }
}
