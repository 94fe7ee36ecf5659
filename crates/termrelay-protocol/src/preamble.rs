//! Stream preamble.
//!
//! The first message on a connection is `FF 05 FF 05` followed by the UTF-8
//! session id. The id ends where the message ends, so it needs no
//! terminator and may be any length the frame limit allows.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

pub const PREAMBLE_MARKER: [u8; 4] = [0xFF, 0x05, 0xFF, 0x05];

pub fn encode(session_id: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREAMBLE_MARKER.len() + session_id.len());
    buf.put_slice(&PREAMBLE_MARKER);
    buf.put_slice(session_id.as_bytes());
    buf.freeze()
}

/// Extracts the session id from a preamble message.
pub fn decode(message: &[u8]) -> Result<String, ProtocolError> {
    let Some(id_bytes) = message.strip_prefix(&PREAMBLE_MARKER[..]) else {
        return Err(ProtocolError::BadPreamble("missing marker".to_string()));
    };
    let id = std::str::from_utf8(id_bytes)
        .map_err(|e| ProtocolError::BadPreamble(format!("session id is not UTF-8: {}", e)))?;
    if id.trim().is_empty() {
        return Err(ProtocolError::BadPreamble("empty session id".to_string()));
    }
    Ok(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ten_byte_id() {
        let message = encode("abcdefghij");
        assert_eq!(message.len(), 14);
        assert_eq!(&message[..4], &PREAMBLE_MARKER);
        assert_eq!(decode(&message).unwrap(), "abcdefghij");
    }

    #[test]
    fn test_uuid_id() {
        let id = "1b4e28ba-2fa1-11d2-883f-0016d3cca427";
        assert_eq!(decode(&encode(id)).unwrap(), id);
    }

    #[test]
    fn test_missing_marker() {
        let err = decode(b"\x00ls\n").unwrap_err();
        assert!(matches!(err, ProtocolError::BadPreamble(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_partial_marker() {
        assert!(decode(&[0xFF, 0x05, 0xFF]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_empty_id() {
        assert!(decode(&PREAMBLE_MARKER).is_err());
        assert!(decode(&encode("   ")).is_err());
    }

    #[test]
    fn test_invalid_utf8_id() {
        let mut message = PREAMBLE_MARKER.to_vec();
        message.extend_from_slice(&[0xC3, 0x28]);
        assert!(matches!(
            decode(&message),
            Err(ProtocolError::BadPreamble(_))
        ));
    }
}
