//! Utility functions for the ble-link crate.

/// Decode a characteristic payload as UTF-8 text.
///
/// # Arguments
///
/// * `payload` - Raw characteristic bytes
///
/// # Returns
///
/// The decoded text, or `None` if the bytes are not valid UTF-8
///
/// # Example
///
/// ```
/// use ble_link::payload_to_string;
///
/// assert_eq!(payload_to_string(b"42").as_deref(), Some("42"));
/// assert_eq!(payload_to_string(&[0xff]), None);
/// ```
#[inline]
pub fn payload_to_string(payload: &[u8]) -> Option<String> {
    std::str::from_utf8(payload).ok().map(str::to_owned)
}

/// Decode a characteristic payload as UTF-8, replacing invalid sequences.
///
/// # Example
///
/// ```
/// use ble_link::payload_to_string_lossy;
///
/// assert_eq!(payload_to_string_lossy(b"ok\xff"), "ok\u{fffd}");
/// ```
#[inline]
pub fn payload_to_string_lossy(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

/// Format a payload as space separated hex, for logs.
pub fn payload_to_hex(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_to_string() {
        assert_eq!(payload_to_string(b"").as_deref(), Some(""));
        assert_eq!(payload_to_string("héllo".as_bytes()).as_deref(), Some("héllo"));
        assert_eq!(payload_to_string(&[0xc3]), None);
    }

    #[test]
    fn test_payload_to_string_lossy() {
        assert_eq!(payload_to_string_lossy(b"203.0.113.7"), "203.0.113.7");
        assert_eq!(payload_to_string_lossy(&[0xff, 0x41]), "\u{fffd}A");
    }

    #[test]
    fn test_payload_to_hex() {
        assert_eq!(payload_to_hex(&[0x01, 0xab, 0xff]), "01 AB FF");
        assert_eq!(payload_to_hex(&[]), "");
    }
}
