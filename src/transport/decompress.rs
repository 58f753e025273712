//! Payload decompression with plain-text fallback.
//!
//! Some endpoints honor the `Accept-Encoding: gzip, deflate` hint, some
//! return plain JSON regardless. The body is therefore inflated
//! speculatively: gzip first, zlib/deflate second, and if neither produces
//! anything the raw payload is used unmodified.

use flate2::read::{MultiGzDecoder, ZlibDecoder};
use std::borrow::Cow;
use std::io::Read;

/// Decode a response body, falling back to the raw bytes when it is not
/// compressed (or too corrupt to inflate).
pub fn decode_body(raw: &[u8]) -> Cow<'_, [u8]> {
    if let Some(out) = inflate_gzip(raw) {
        return Cow::Owned(out);
    }
    if let Some(out) = inflate_zlib(raw) {
        return Cow::Owned(out);
    }
    tracing::debug!(
        bytes = raw.len(),
        "payload did not inflate, treating it as plain json"
    );
    Cow::Borrowed(raw)
}

fn inflate_gzip(raw: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = MultiGzDecoder::new(raw);
    match decoder.read_to_end(&mut out) {
        Ok(_) if !out.is_empty() => Some(out),
        _ => None,
    }
}

fn inflate_zlib(raw: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = ZlibDecoder::new(raw);
    match decoder.read_to_end(&mut out) {
        Ok(_) if !out.is_empty() => Some(out),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_gzip_round_trip() {
        let payload = br#"{"tsAnchor": 0, "values": []}"#;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decode_body(&compressed).as_ref(), payload);
    }

    #[test]
    fn test_plain_payload_falls_through() {
        let payload = br#"{"tsAnchor": 0}"#;
        assert_eq!(decode_body(payload).as_ref(), payload.as_slice());
    }

    #[test]
    fn test_truncated_gzip_falls_through() {
        let garbage = [0x1f, 0x8b, 0x00];
        assert_eq!(decode_body(&garbage).as_ref(), garbage.as_slice());
    }
}
