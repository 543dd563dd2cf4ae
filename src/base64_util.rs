use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

/// Tries standard and URL-safe base64, tolerating missing padding and
/// stray whitespace. Shared by `uri_parser` (subscription bodies) and
/// `outbound` (`vmess://` payloads, `ss://` userinfo).
pub fn decode_lenient(s: &str) -> Option<Vec<u8>> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    for engine in [&STANDARD as &dyn Engine, &URL_SAFE, &STANDARD_NO_PAD, &URL_SAFE_NO_PAD] {
        if let Ok(bytes) = engine.decode(&compact) {
            return Some(bytes);
        }
    }
    None
}

pub fn decode_lenient_utf8(s: &str) -> Option<String> {
    decode_lenient(s).and_then(|b| String::from_utf8(b).ok())
}
