//! Event identifier generation.
//!
//! Identifiers look like `EVT-20250101000000-Ab3dEfGh12`: a stable prefix, a
//! UTC timestamp at second resolution, and a 10-character URL-safe random
//! suffix (60 bits of entropy from a v4 UUID). They sort by creation instant
//! at second resolution and embed cleanly in e-mail subjects, where they
//! round-trip through human replies as `[ref:<id>]`.
//!
//! Uniqueness relies on the suffix entropy alone; an insert that still
//! collides surfaces as `DuplicateKey` and is retried with a fresh id by the
//! publisher.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use uuid::Uuid;

const DEFAULT_PREFIX: &str = "EVT";
const SUFFIX_LEN: usize = 10;

fn short_suffix() -> String {
    let encoded = URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes());
    encoded[..SUFFIX_LEN].to_string()
}

/// Generate an event id with the default `EVT` prefix.
pub fn new_event_id() -> String {
    new_event_id_with_prefix(DEFAULT_PREFIX)
}

/// Generate an event id with a caller-supplied prefix.
///
/// The prefix is trimmed and uppercased; an empty or whitespace-only prefix
/// falls back to `EVT`.
pub fn new_event_id_with_prefix(prefix: &str) -> String {
    let mut safe = prefix.trim().to_ascii_uppercase();
    if safe.is_empty() {
        safe = DEFAULT_PREFIX.to_string();
    }
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    format!("{safe}-{timestamp}-{}", short_suffix())
}
