//! Response framing and noise stripping
//!
//! The adapter terminates every response with a `>` prompt and mixes the
//! payload with echo, status chatter (`SEARCHING...`), bus-init markers and
//! keep-alive `.` filler. The framer turns a raw byte stream into a clean
//! hex string and decodes it into byte values.

use regex::Regex;
use std::io;
use std::sync::OnceLock;

use super::PROMPT;
use crate::link::TransportLink;

fn searching_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("SEARCHING").unwrap())
}

fn noise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[[:space:][:cntrl:]]").unwrap())
}

fn bus_init_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(BUS INIT)|(BUSINIT)|(\.)").unwrap())
}

fn hex_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-F]+$").unwrap())
}

/// Accumulate bytes from `link` until the `>` prompt or end of stream.
///
/// The prompt itself is discarded. A stream that ends mid-frame yields the
/// partial frame; `Ok(None)` means the stream ended with nothing buffered.
pub fn read_raw_frame(link: &dyn TransportLink) -> io::Result<Option<String>> {
    let mut frame = String::new();
    loop {
        match link.read_byte()? {
            Some(PROMPT) => return Ok(Some(frame)),
            Some(byte) => frame.push(byte as char),
            None if frame.is_empty() => return Ok(None),
            None => return Ok(Some(frame)),
        }
    }
}

/// Strip adapter chatter from a raw frame, in fixed order: `SEARCHING`
/// first, then whitespace and control characters, then bus-init markers and
/// `.` filler.
///
/// A result that is not a plausible hex run is still returned as-is; some
/// commands (`AT Z`, `AT RV`) legitimately answer with text, so rejection
/// is the caller's call.
pub fn clean_response(raw: &str) -> String {
    let cleaned = searching_re().replace_all(raw, "");
    let cleaned = noise_re().replace_all(&cleaned, "");
    let cleaned = bus_init_re().replace_all(&cleaned, "").into_owned();
    if !cleaned.is_empty() && !is_hex_plausible(&cleaned) {
        tracing::debug!(frame = %cleaned, "response is not a hex run, forwarding as-is");
    }
    cleaned
}

/// Whether a cleaned frame consists solely of uppercase hex digits.
pub fn is_hex_plausible(cleaned: &str) -> bool {
    hex_run_re().is_match(cleaned)
}

/// Decode a cleaned frame into byte values, two hex characters per byte.
///
/// A trailing group shorter than two characters is dropped; adapters are
/// observed to emit such fragments and discarding the incomplete byte is
/// the intended handling. Decoding stops at the first pair that is not hex,
/// leaving the caller with a short buffer it already knows how to treat as
/// "no data".
pub fn decode_payload(cleaned: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(cleaned.len() / 2);
    for pair in cleaned.as_bytes().chunks_exact(2) {
        let digits = match std::str::from_utf8(pair) {
            Ok(s) => s,
            Err(_) => break,
        };
        match u8::from_str_radix(digits, 16) {
            Ok(value) => buffer.push(value),
            Err(_) => {
                tracing::debug!(group = %digits, "non-hex group, truncating decode");
                break;
            }
        }
    }
    buffer
}
