//! Length-prefixed framing for event streams and pubsub payloads.
//!
//! Every CBOR item and byte payload is preceded by a u32 big-endian length;
//! file bodies use a u64 prefix since they may exceed the item cap. The
//! 32-byte connection challenge is the only unprefixed value on a stream.

use crate::headers::Headers;
use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Random bytes the server hands out per connection.
pub const CHALLENGE_LEN: usize = 32;

/// Upper bound for a single header/content/data item.
pub const MAX_ITEM_BYTES: usize = 1_000_000;

/// Upper bound for an attached file body.
pub const MAX_FILE_BYTES: u64 = 64 * 1024 * 1024;

pub async fn read_item<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.context("reading item length")?;
    let len = BigEndian::read_u32(&prefix) as usize;
    if len > MAX_ITEM_BYTES {
        bail!("item of {} bytes exceeds the {} byte cap", len, MAX_ITEM_BYTES);
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.context("reading item")?;
    Ok(buf)
}

pub async fn write_item<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    let mut prefix = [0u8; 4];
    BigEndian::write_u32(&mut prefix, bytes.len() as u32);
    stream.write_all(&prefix).await?;
    stream.write_all(bytes).await?;
    Ok(())
}

/// Read the optional file body; zero length means no file.
pub async fn read_file<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 8];
    stream.read_exact(&mut prefix).await.context("reading file length")?;
    let len = BigEndian::read_u64(&prefix);
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FILE_BYTES {
        bail!("file of {} bytes exceeds the {} byte cap", len, MAX_FILE_BYTES);
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await.context("reading file")?;
    Ok(Some(buf))
}

pub async fn write_file<S: AsyncWrite + Unpin>(stream: &mut S, file: Option<&[u8]>) -> Result<()> {
    let bytes = file.unwrap_or_default();
    let mut prefix = [0u8; 8];
    BigEndian::write_u64(&mut prefix, bytes.len() as u64);
    stream.write_all(&prefix).await?;
    if !bytes.is_empty() {
        stream.write_all(bytes).await?;
    }
    Ok(())
}

/// One parsed frame as carried by a stream or a pubsub message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub headers: Headers,
    pub content: Vec<u8>,
    pub data: Vec<u8>,
    pub file: Option<Vec<u8>>,
}

impl Frame {
    pub async fn read<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self> {
        let headers: Headers = crypto::cbor_decode(&read_item(stream).await?).context("decoding headers")?;
        let content = read_item(stream).await?;
        let data = read_item(stream).await?;
        let file = read_file(stream).await?;
        Ok(Frame {
            headers,
            content,
            data,
            file,
        })
    }

    pub async fn write<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        write_item(stream, &crypto::cbor_encode(&self.headers)?).await?;
        write_item(stream, &self.content).await?;
        write_item(stream, &self.data).await?;
        write_file(stream, self.file.as_deref()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Serialize for a pubsub message: headers, content and data only.
    pub fn to_message(&self) -> Result<Vec<u8>> {
        let headers = crypto::cbor_encode(&self.headers)?;
        let mut out = Vec::with_capacity(12 + headers.len() + self.content.len() + self.data.len());
        for item in [&headers[..], &self.content, &self.data] {
            let mut prefix = [0u8; 4];
            BigEndian::write_u32(&mut prefix, item.len() as u32);
            out.extend_from_slice(&prefix);
            out.extend_from_slice(item);
        }
        Ok(out)
    }

    /// Parse a pubsub message produced by [`Frame::to_message`].
    pub fn from_message(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let mut items: Vec<&[u8]> = Vec::with_capacity(3);
        for _ in 0..3 {
            if bytes.len() < offset + 4 {
                bail!("truncated message");
            }
            let len = BigEndian::read_u32(&bytes[offset..offset + 4]) as usize;
            offset += 4;
            if len > MAX_ITEM_BYTES || bytes.len() < offset + len {
                bail!("truncated message");
            }
            items.push(&bytes[offset..offset + len]);
            offset += len;
        }
        Ok(Frame {
            headers: crypto::cbor_decode(items[0]).context("decoding headers")?,
            content: items[1].to_vec(),
            data: items[2].to_vec(),
            file: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::TYPE_MSG;
    use futures::io::Cursor;

    fn frame() -> Frame {
        Frame {
            headers: Headers {
                frame_type: TYPE_MSG.to_owned(),
                service: "friends".to_owned(),
                event: "invite".to_owned(),
                id: "m-1".to_owned(),
                nonce: "n-1".to_owned(),
                timestamp: 1,
                ..Default::default()
            },
            content: b"{\"name\":\"Bob\"}".to_vec(),
            data: Vec::new(),
            file: None,
        }
    }

    #[tokio::test]
    async fn stream_roundtrip() {
        let mut buf = Cursor::new(Vec::new());
        frame().write(&mut buf).await.unwrap();
        let mut read = Cursor::new(buf.into_inner());
        let decoded = Frame::read(&mut read).await.unwrap();
        assert_eq!(decoded, frame());
    }

    #[tokio::test]
    async fn stream_roundtrip_with_file() {
        let mut f = frame();
        f.file = Some(vec![1, 2, 3, 4]);
        let mut buf = Cursor::new(Vec::new());
        f.write(&mut buf).await.unwrap();
        let mut read = Cursor::new(buf.into_inner());
        assert_eq!(Frame::read(&mut read).await.unwrap(), f);
    }

    #[test]
    fn message_roundtrip() {
        let bytes = frame().to_message().unwrap();
        assert_eq!(Frame::from_message(&bytes).unwrap(), frame());
    }

    #[test]
    fn truncated_message_is_rejected() {
        let bytes = frame().to_message().unwrap();
        assert!(Frame::from_message(&bytes[..bytes.len() - 1]).is_err());
    }

    #[tokio::test]
    async fn oversized_item_is_rejected() {
        let mut bytes = vec![0u8; 4];
        BigEndian::write_u32(&mut bytes, (MAX_ITEM_BYTES + 1) as u32);
        let mut read = Cursor::new(bytes);
        assert!(read_item(&mut read).await.is_err());
    }
}
