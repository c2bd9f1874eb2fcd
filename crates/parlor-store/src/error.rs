//! Error types for the storage layer.

/// Errors from the KV interface itself.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The key holds a value of a different kind (string vs hash vs
    /// sorted set).
    #[error("wrong value kind at key {0}")]
    WrongType(String),

    /// The engine's interior lock was poisoned by a panic elsewhere.
    #[error("kv engine lock poisoned")]
    Poisoned,

    /// A networked engine failed to reach its backend.
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the room store and registry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Meta documents are JSON; this wraps a parse or encode failure.
    #[error("meta encode/decode failed: {0}")]
    Meta(#[from] serde_json::Error),

    /// State bytes could not be produced for a save.
    #[error(transparent)]
    Codec(#[from] parlor_protocol::CodecError),

    /// No free short code was found within the attempt budget.
    #[error("short code allocation exhausted after {0} attempts")]
    ShortCodeExhausted(u32),
}
