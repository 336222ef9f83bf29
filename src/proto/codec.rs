// Envelope framing for the wire protocol
//
// Four envelopes can wrap a message on its way to the socket: a compound
// envelope packing several messages into one datagram, a CRC32 checksum
// envelope, a label prefix for multi-tenant port sharing, and an LZW
// compression envelope. The dispatch layer peels them in the order
// label, encrypt, checksum, compress, compound.

use crate::error::{MeshError, Result};
use crate::proto::MessageType;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Maximum number of parts one compound envelope can carry.
pub const MAX_COMPOUND_PARTS: usize = 255;

/// Compression algorithms understood by the compress envelope.
pub const COMPRESSION_LZW: u8 = 0;

/// Body of the compress envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CompressedPayload {
    algo: u8,
    buf: Vec<u8>,
}

/// Pack up to 255 messages into one compound envelope:
/// tag, 1-byte count, N big-endian u16 lengths, then the parts.
pub fn pack_compound(parts: &[Vec<u8>]) -> Result<Vec<u8>> {
    if parts.len() > MAX_COMPOUND_PARTS {
        return Err(MeshError::Serialization(format!(
            "compound overflow: {} parts",
            parts.len()
        )));
    }
    let body_len: usize = parts.iter().map(|p| p.len()).sum();
    let mut buf = BytesMut::with_capacity(2 + parts.len() * 2 + body_len);
    buf.put_u8(MessageType::Compound as u8);
    buf.put_u8(parts.len() as u8);
    for part in parts {
        if part.len() > u16::MAX as usize {
            return Err(MeshError::Serialization(format!(
                "compound part too large: {} bytes",
                part.len()
            )));
        }
        buf.put_u16(part.len() as u16);
    }
    for part in parts {
        buf.put_slice(part);
    }
    Ok(buf.to_vec())
}

/// Pack an arbitrary number of messages, splitting into several compound
/// envelopes when more than 255 parts are supplied.
pub fn pack_compounds(parts: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
    parts
        .chunks(MAX_COMPOUND_PARTS)
        .map(pack_compound)
        .collect()
}

/// Split a compound envelope. The caller has already consumed the tag byte.
///
/// Returns the number of parts the buffer was too short to carry, along with
/// the parts that were recovered intact.
pub fn split_compound(buf: &[u8]) -> Result<(usize, Vec<Bytes>)> {
    let mut cursor = Bytes::copy_from_slice(buf);
    if cursor.remaining() < 1 {
        return Err(MeshError::Truncated);
    }
    let count = cursor.get_u8() as usize;
    if cursor.remaining() < count * 2 {
        return Err(MeshError::Truncated);
    }
    let lengths: Vec<usize> = (0..count).map(|_| cursor.get_u16() as usize).collect();

    let mut truncated = 0;
    let mut parts = Vec::with_capacity(count);
    for len in lengths {
        if cursor.remaining() < len {
            truncated += 1;
            continue;
        }
        parts.push(cursor.split_to(len));
    }
    Ok((truncated, parts))
}

/// Wrap a message in the checksum envelope: tag, 4-byte big-endian CRC32
/// (IEEE) of the inner message, then the inner message.
pub fn wrap_checksum(inner: &[u8]) -> Vec<u8> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(inner);
    let crc = hasher.finalize();

    let mut buf = BytesMut::with_capacity(5 + inner.len());
    buf.put_u8(MessageType::HasCrc as u8);
    buf.put_u32(crc);
    buf.put_slice(inner);
    buf.to_vec()
}

/// Verify and strip the checksum envelope. The caller has already consumed
/// the tag byte.
pub fn strip_checksum(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.len() < 4 {
        return Err(MeshError::Truncated);
    }
    let expected = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let inner = &buf[4..];

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(inner);
    if hasher.finalize() != expected {
        return Err(MeshError::ChecksumMismatch);
    }
    Ok(inner.to_vec())
}

/// Prefix a message with the label envelope: tag, 1-byte length, label
/// bytes, then the message.
pub fn add_label_header(msg: &[u8], label: &str) -> Result<Vec<u8>> {
    if label.is_empty() || label.len() > 255 {
        return Err(MeshError::Serialization(format!(
            "label must be 1..=255 bytes, got {}",
            label.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(2 + label.len() + msg.len());
    buf.put_u8(MessageType::Label as u8);
    buf.put_u8(label.len() as u8);
    buf.put_slice(label.as_bytes());
    buf.put_slice(msg);
    Ok(buf.to_vec())
}

/// If the buffer starts with a label envelope, strip it and return
/// `(message, Some(label))`; otherwise return the buffer untouched.
pub fn remove_label_header(buf: &[u8]) -> Result<(Vec<u8>, Option<String>)> {
    if buf.first() != Some(&(MessageType::Label as u8)) {
        return Ok((buf.to_vec(), None));
    }
    if buf.len() < 2 {
        return Err(MeshError::Truncated);
    }
    let len = buf[1] as usize;
    if len == 0 {
        return Err(MeshError::Truncated);
    }
    if buf.len() < 2 + len {
        return Err(MeshError::Truncated);
    }
    let label = String::from_utf8_lossy(&buf[2..2 + len]).into_owned();
    Ok((buf[2 + len..].to_vec(), Some(label)))
}

/// Wrap a message in the compression envelope.
pub fn compress_payload(msg: &[u8]) -> Result<Vec<u8>> {
    let payload = CompressedPayload {
        algo: COMPRESSION_LZW,
        buf: lzw_compress(msg),
    };
    super::encode(MessageType::Compress, &payload)
}

/// Decompress a compression envelope. The caller has already consumed the
/// tag byte.
pub fn decompress_payload(buf: &[u8]) -> Result<Vec<u8>> {
    let payload: CompressedPayload = super::decode_body(buf)?;
    if payload.algo != COMPRESSION_LZW {
        return Err(MeshError::UnknownMessage(payload.algo));
    }
    lzw_decompress(&payload.buf)
}

// LZW with 16-bit little-endian codes. The dictionary starts with the 256
// single-byte sequences and grows as runs repeat; the decoder rebuilds the
// same dictionary, including the self-referential code that names the
// sequence currently being defined.

fn lzw_compress(input: &[u8]) -> Vec<u8> {
    use std::collections::HashMap;

    let mut dict: HashMap<Vec<u8>, u16> =
        (0..=255u16).map(|i| (vec![i as u8], i)).collect();
    let mut next_code: u16 = 256;
    let mut result = Vec::new();
    let mut current: Vec<u8> = Vec::new();

    for &byte in input {
        let mut extended = current.clone();
        extended.push(byte);

        if dict.contains_key(&extended) {
            current = extended;
        } else {
            if let Some(&code) = dict.get(&current) {
                result.extend_from_slice(&code.to_le_bytes());
            }
            if next_code < u16::MAX {
                dict.insert(extended, next_code);
                next_code += 1;
            }
            current = vec![byte];
        }
    }

    if !current.is_empty() {
        if let Some(&code) = dict.get(&current) {
            result.extend_from_slice(&code.to_le_bytes());
        }
    }

    result
}

fn lzw_decompress(input: &[u8]) -> Result<Vec<u8>> {
    use std::collections::HashMap;

    if input.len() % 2 != 0 {
        return Err(MeshError::Truncated);
    }

    let mut dict: HashMap<u16, Vec<u8>> =
        (0..=255u16).map(|i| (i, vec![i as u8])).collect();
    let mut next_code: u16 = 256;
    let mut result = Vec::new();
    let mut previous: Vec<u8> = Vec::new();

    for chunk in input.chunks_exact(2) {
        let code = u16::from_le_bytes([chunk[0], chunk[1]]);

        let entry = if let Some(sequence) = dict.get(&code) {
            sequence.clone()
        } else if code == next_code && !previous.is_empty() {
            let mut sequence = previous.clone();
            sequence.push(previous[0]);
            sequence
        } else {
            return Err(MeshError::Serialization(format!(
                "invalid compression code: {}",
                code
            )));
        };

        result.extend_from_slice(&entry);

        if !previous.is_empty() && next_code < u16::MAX {
            let mut new_entry = previous.clone();
            new_entry.push(entry[0]);
            dict.insert(next_code, new_entry);
            next_code += 1;
        }

        previous = entry;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_roundtrip_preserves_order() {
        let parts = vec![b"alpha".to_vec(), b"bb".to_vec(), b"ccc".to_vec()];
        let packed = pack_compound(&parts).unwrap();
        assert_eq!(packed[0], MessageType::Compound as u8);

        let (truncated, unpacked) = split_compound(&packed[1..]).unwrap();
        assert_eq!(truncated, 0);
        assert_eq!(unpacked.len(), 3);
        assert_eq!(&unpacked[0][..], b"alpha");
        assert_eq!(&unpacked[1][..], b"bb");
        assert_eq!(&unpacked[2][..], b"ccc");
    }

    #[test]
    fn test_compound_reports_truncation() {
        let parts = vec![b"alpha".to_vec(), b"beta".to_vec()];
        let packed = pack_compound(&parts).unwrap();

        // Cut into the second part: first survives, second is counted lost.
        let cut = &packed[1..packed.len() - 2];
        let (truncated, unpacked) = split_compound(cut).unwrap();
        assert_eq!(truncated, 1);
        assert_eq!(unpacked.len(), 1);
        assert_eq!(&unpacked[0][..], b"alpha");
    }

    #[test]
    fn test_pack_compounds_splits_over_255() {
        let parts: Vec<Vec<u8>> = (0..300).map(|i| vec![i as u8]).collect();
        let compounds = pack_compounds(&parts).unwrap();
        assert_eq!(compounds.len(), 2);
        assert_eq!(compounds[0][1], 255);
        assert_eq!(compounds[1][1], 45);
    }

    #[test]
    fn test_checksum_roundtrip() {
        let inner = b"tagged message bytes".to_vec();
        let wrapped = wrap_checksum(&inner);
        assert_eq!(wrapped[0], MessageType::HasCrc as u8);
        assert_eq!(strip_checksum(&wrapped[1..]).unwrap(), inner);
    }

    #[test]
    fn test_checksum_detects_single_bit_flip() {
        let inner = b"tagged message bytes".to_vec();
        let mut wrapped = wrap_checksum(&inner);
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;
        assert!(matches!(
            strip_checksum(&wrapped[1..]),
            Err(MeshError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_label_roundtrip() {
        let msg = b"payload".to_vec();
        let labelled = add_label_header(&msg, "tenant-a").unwrap();
        let (stripped, label) = remove_label_header(&labelled).unwrap();
        assert_eq!(stripped, msg);
        assert_eq!(label.as_deref(), Some("tenant-a"));
    }

    #[test]
    fn test_unlabelled_passthrough() {
        let msg = vec![MessageType::Ping as u8, 1, 2, 3];
        let (out, label) = remove_label_header(&msg).unwrap();
        assert_eq!(out, msg);
        assert!(label.is_none());
    }

    #[test]
    fn test_label_rejects_oversize() {
        assert!(add_label_header(b"x", &"a".repeat(256)).is_err());
        assert!(add_label_header(b"x", "").is_err());
    }

    #[test]
    fn test_compress_roundtrip() {
        let msg: Vec<u8> = b"the quick brown fox jumps over the lazy dog, \
                             the quick brown fox jumps again"
            .to_vec();
        let wrapped = compress_payload(&msg).unwrap();
        assert_eq!(wrapped[0], MessageType::Compress as u8);
        assert_eq!(decompress_payload(&wrapped[1..]).unwrap(), msg);
    }

    #[test]
    fn test_lzw_roundtrip_binary() {
        let msg: Vec<u8> = (0..=255u8).cycle().take(2048).collect();
        assert_eq!(lzw_decompress(&lzw_compress(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_lzw_rejects_odd_length() {
        assert!(lzw_decompress(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_empty_split_is_truncated() {
        assert!(matches!(split_compound(&[]), Err(MeshError::Truncated)));
    }
}
