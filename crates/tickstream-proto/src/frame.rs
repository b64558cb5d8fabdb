//! Self-synchronizing wire frame: two magic bytes, version, type, a
//! big-endian length prefix, the payload, and a big-endian CRC32C trailer.

use std::io::{Read, Write};

use thiserror::Error;
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// First magic byte at offset 0.
pub const MAGIC_1: u8 = 0xF5;
/// Second magic byte at offset 1.
pub const MAGIC_2: u8 = 0x7D;
/// The only protocol version this codec accepts.
pub const VERSION: u8 = 0x01;
/// Fixed header size: magic(2) + version(1) + type(1) + length(4).
pub const HEADER_LEN: usize = 8;
/// Checksum trailer size.
pub const CHECKSUM_LEN: usize = 4;
/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: u32 = 65_536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame magic")]
    InvalidMagic,
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD})")]
    MessageTooLarge(u32),
    #[error("frame truncated before completion")]
    IncompleteFrame,
    #[error("checksum mismatch")]
    InvalidChecksum,
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::IncompleteFrame
        } else {
            FrameError::Io(err.to_string())
        }
    }
}

/// A decoded wire frame. `kind` is the raw type byte; the message
/// catalog is responsible for interpreting it and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Encodes `(kind, payload)` into a complete frame, magic through checksum.
///
/// Fails with [`FrameError::MessageTooLarge`] if `payload.len()` exceeds
/// [`MAX_PAYLOAD`]. The codec never inspects `payload` contents.
pub fn encode(
    kind: u8,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| FrameError::MessageTooLarge(u32::MAX))?;
    if len > MAX_PAYLOAD {
        return Err(FrameError::MessageTooLarge(len));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    out.push(MAGIC_1);
    out.push(MAGIC_2);
    out.push(VERSION);
    out.push(kind);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);

    let checksum = crc32c::crc32c(&out);
    out.extend_from_slice(&checksum.to_be_bytes());
    Ok(out)
}

fn header_fields(header: &[u8; HEADER_LEN]) -> Result<(u8, u32), FrameError> {
    if header[0] != MAGIC_1 || header[1] != MAGIC_2 {
        return Err(FrameError::InvalidMagic);
    }
    let version = header[2];
    if version != VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let kind = header[3];
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_PAYLOAD {
        return Err(FrameError::MessageTooLarge(len));
    }
    Ok((kind, len))
}

fn verify_checksum(
    header: &[u8; HEADER_LEN],
    payload: &[u8],
    checksum_bytes: &[u8; CHECKSUM_LEN],
) -> Result<(), FrameError> {
    let expected = u32::from_be_bytes(*checksum_bytes);
    let mut hasher_input = Vec::with_capacity(HEADER_LEN + payload.len());
    hasher_input.extend_from_slice(header);
    hasher_input.extend_from_slice(payload);
    let actual = crc32c::crc32c(&hasher_input);
    if actual != expected {
        return Err(FrameError::InvalidChecksum);
    }
    Ok(())
}

/// Decodes one frame from a blocking reader.
///
/// Detection order on failure: [`FrameError::InvalidMagic`],
/// [`FrameError::UnsupportedVersion`], [`FrameError::MessageTooLarge`],
/// [`FrameError::IncompleteFrame`], [`FrameError::InvalidChecksum`].
pub fn decode_sync<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0_u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let (kind, len) = header_fields(&header)?;

    let mut rest = vec![0_u8; len as usize + CHECKSUM_LEN];
    reader.read_exact(&mut rest)?;
    let (payload, checksum_bytes) = rest.split_at(len as usize);
    let checksum_bytes: [u8; CHECKSUM_LEN] =
        checksum_bytes.try_into().expect("fixed checksum length");

    verify_checksum(&header, payload, &checksum_bytes)?;

    Ok(Frame { version: header[2], kind, payload: payload.to_vec() })
}

/// Encodes and writes one frame to a blocking writer.
pub fn encode_sync<W: Write>(
    writer: &mut W,
    kind: u8,
    payload: &[u8],
) -> Result<(), FrameError> {
    let bytes = encode(kind, payload)?;
    writer.write_all(&bytes)?;
    Ok(())
}

#[cfg(feature = "tokio")]
/// Decodes one frame from an async reader. Same detection order as
/// [`decode_sync`].
pub async fn decode_async<R: AsyncRead + Unpin>(
    reader: &mut R
) -> Result<Frame, FrameError> {
    let mut header = [0_u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let (kind, len) = header_fields(&header)?;

    let mut rest = vec![0_u8; len as usize + CHECKSUM_LEN];
    reader.read_exact(&mut rest).await?;
    let (payload, checksum_bytes) = rest.split_at(len as usize);
    let checksum_bytes: [u8; CHECKSUM_LEN] =
        checksum_bytes.try_into().expect("fixed checksum length");

    verify_checksum(&header, payload, &checksum_bytes)?;

    Ok(Frame { version: header[2], kind, payload: payload.to_vec() })
}

#[cfg(feature = "tokio")]
/// Encodes and writes one frame to an async writer.
pub async fn encode_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: u8,
    payload: &[u8],
) -> Result<(), FrameError> {
    let bytes = encode(kind, payload)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_empty_payload() {
        let bytes = encode(1, &[]).unwrap();
        let frame = decode_sync(&mut &bytes[..]).unwrap();
        assert_eq!(frame.kind, 1);
        assert_eq!(frame.version, VERSION);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn round_trip_with_payload() {
        let payload = b"hello tick stream".to_vec();
        let bytes = encode(4, &payload).unwrap();
        let frame = decode_sync(&mut &bytes[..]).unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0_u8; MAX_PAYLOAD as usize + 1];
        let err = encode(4, &payload).unwrap_err();
        assert_eq!(err, FrameError::MessageTooLarge(MAX_PAYLOAD + 1));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = encode(1, b"x").unwrap();
        bytes[0] = 0x00;
        let err = decode_sync(&mut &bytes[..]).unwrap_err();
        assert_eq!(err, FrameError::InvalidMagic);
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut bytes = encode(1, b"x").unwrap();
        bytes[2] = 0x02;
        let err = decode_sync(&mut &bytes[..]).unwrap_err();
        assert_eq!(err, FrameError::UnsupportedVersion(0x02));
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let bytes = encode(1, b"hello").unwrap();
        let truncated = &bytes[..bytes.len() - 2];
        let err = decode_sync(&mut &truncated[..]).unwrap_err();
        assert_eq!(err, FrameError::IncompleteFrame);
    }

    #[test]
    fn decode_rejects_corrupted_checksum() {
        let mut bytes = encode(1, b"hello").unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = decode_sync(&mut &bytes[..]).unwrap_err();
        assert_eq!(err, FrameError::InvalidChecksum);
    }

    #[test]
    fn single_byte_mutations_are_all_rejected() {
        let bytes = encode(4, b"payload-bytes").unwrap();
        for i in 0..bytes.len() {
            for bit in 0..8 {
                let mut mutated = bytes.clone();
                mutated[i] ^= 1 << bit;
                if mutated == bytes {
                    continue;
                }
                let result = decode_sync(&mut &mutated[..]);
                assert!(
                    result.is_err(),
                    "mutation at byte {i} bit {bit} should fail to decode"
                );
            }
        }
    }

    #[tokio::test]
    async fn async_round_trip() {
        let payload = b"async payload".to_vec();
        let mut buf = Vec::new();
        encode_async(&mut buf, 6, &payload).await.unwrap();
        let frame = decode_async(&mut &buf[..]).await.unwrap();
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.kind, 6);
    }
}
