//! Input validation applied before any state mutation.
//!
//! Every externally supplied string passes through one of these checks at
//! the hub boundary. The rules are deliberately strict character classes,
//! not full grammars — anything surprising is rejected outright.

/// Maximum accepted chat message length in characters.
pub const MAX_CHAT_LEN: usize = 500;

/// `roomId`: hex, 1–50 characters.
pub fn valid_room_id(s: &str) -> bool {
    !s.is_empty() && s.len() <= 50 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// `gameType`: alphanumeric, 1–50 characters.
pub fn valid_game_type(s: &str) -> bool {
    !s.is_empty() && s.len() <= 50 && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// `templateName`: letters, digits, space, `_()-.,`, 1–100 characters.
pub fn valid_template_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 100
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '(' | ')' | '-' | '.' | ',')
        })
}

/// `idempotencyKey`: letters, digits, `_-`, 1–64 characters.
pub fn valid_idempotency_key(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

/// `referenceId`: letters, digits, `_:-`, 1–100 characters.
pub fn valid_reference_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 100
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-'))
}

/// `coinAmount`: |v| ≤ 10^12.
pub fn valid_coin_amount(v: i64) -> bool {
    v.unsigned_abs() <= 1_000_000_000_000
}

/// `configJson`: well-formed JSON no longer than 4096 bytes.
pub fn valid_config_json(s: &str) -> bool {
    s.len() <= 4096 && serde_json::from_str::<serde_json::Value>(s).is_ok()
}

/// Chat messages: non-empty after trimming, bounded length.
pub fn valid_chat_message(s: &str) -> bool {
    !s.trim().is_empty() && s.chars().count() <= MAX_CHAT_LEN
}
