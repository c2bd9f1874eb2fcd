//! Versioned binary encoding of game state.
//!
//! Wire layout, exactly `1 + 4 + size` bytes:
//!
//! ```text
//! ┌─────────┬──────────────────┬──────────────────┐
//! │ version │ size (u32 LE)    │ state body       │
//! │ 1 byte  │ 4 bytes          │ `size` bytes     │
//! └─────────┴──────────────────┴──────────────────┘
//! ```
//!
//! The body is the bincode fixed-int little-endian encoding of the state,
//! which is a stable flat layout for states built from integers, bools,
//! and fixed-size arrays. States must not contain heap-backed fields
//! (`String`, `Vec`, maps) — those would make the encoded size vary and
//! break the declared-size check.
//!
//! Decoding pins the stored `(version, size)` pair against the current
//! layout. A mismatch consults the [`MigrationRegistry`]; if no migrator
//! is registered for the stored triple, decoding fails with
//! [`CodecError::StateCorruptedOrIncompatible`] naming it.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::CodecError;

/// Hard ceiling on the encoded state body.
pub const MAX_STATE_SIZE: usize = 1024;

/// Length of the fixed header preceding the state body.
pub const STATE_HEADER_LEN: usize = 5;

/// A fixed-layout game state that the room store can persist.
///
/// Implementors declare the current layout version and the exact encoded
/// body size. Bumping the layout means bumping `VERSION` and registering
/// a migrator for the previous `(VERSION, ENCODED_SIZE)` pair.
pub trait GameState:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Current layout version, written into every blob.
    const VERSION: u8;

    /// Exact size of the bincode body in bytes.
    const ENCODED_SIZE: usize;
}

/// The parsed fixed header of a stored state blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredStateHeader {
    pub version: u8,
    pub size: u32,
}

impl StoredStateHeader {
    fn parse(blob: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        if blob.len() < STATE_HEADER_LEN {
            return Err(CodecError::Truncated(blob.len()));
        }
        let version = blob[0];
        let size = u32::from_le_bytes([blob[1], blob[2], blob[3], blob[4]]);
        let body = &blob[STATE_HEADER_LEN..];
        if body.len() != size as usize {
            return Err(CodecError::SizeMismatch {
                declared: size as usize,
                actual: body.len(),
            });
        }
        Ok((Self { version, size }, body))
    }
}

/// Encodes a state with the current version header.
pub fn encode_state<S: GameState>(state: &S) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(state).map_err(CodecError::Encode)?;
    if body.len() != S::ENCODED_SIZE {
        return Err(CodecError::SizeMismatch {
            declared: S::ENCODED_SIZE,
            actual: body.len(),
        });
    }
    if body.len() > MAX_STATE_SIZE {
        return Err(CodecError::TooLarge(body.len()));
    }

    let mut out = Vec::with_capacity(STATE_HEADER_LEN + body.len());
    out.push(S::VERSION);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a state blob, consulting `migrations` when the stored triple
/// does not match the current layout.
pub fn decode_state<S: GameState>(
    blob: &[u8],
    migrations: &MigrationRegistry,
) -> Result<S, CodecError> {
    let (header, body) = StoredStateHeader::parse(blob)?;

    if header.version == S::VERSION && header.size as usize == S::ENCODED_SIZE {
        // A body of the right version and size that still fails to parse
        // means the bytes themselves are damaged.
        return bincode::deserialize(body).map_err(|_| {
            CodecError::StateCorruptedOrIncompatible {
                stored_version: header.version,
                stored_size: header.size,
                expected_version: S::VERSION,
                expected_size: S::ENCODED_SIZE as u32,
            }
        });
    }

    match migrations.migrate::<S>(header.version, header.size, body) {
        Some(Ok(state)) => Ok(state),
        Some(Err(reason)) => Err(CodecError::MigrationFailed {
            from_version: header.version,
            reason,
        }),
        None => Err(CodecError::StateCorruptedOrIncompatible {
            stored_version: header.version,
            stored_size: header.size,
            expected_version: S::VERSION,
            expected_size: S::ENCODED_SIZE as u32,
        }),
    }
}

type Migrator =
    Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, String> + Send + Sync>;

/// Registered state migrations, keyed by `(state type, version, size)`.
///
/// A migrator receives the raw stored body and returns a fresh current
/// state. Registration happens once at process init, next to module
/// registration.
#[derive(Default)]
pub struct MigrationRegistry {
    migrators: HashMap<(TypeId, u8, u32), Migrator>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a migrator for states of type `S` stored with the given
    /// older `(version, size)` pair.
    pub fn register<S, F>(&mut self, from_version: u8, from_size: u32, migrate: F)
    where
        S: GameState,
        F: Fn(&[u8]) -> Result<S, String> + Send + Sync + 'static,
    {
        self.migrators.insert(
            (TypeId::of::<S>(), from_version, from_size),
            Box::new(move |body| {
                migrate(body).map(|s| Box::new(s) as Box<dyn Any + Send>)
            }),
        );
    }

    fn migrate<S: GameState>(
        &self,
        version: u8,
        size: u32,
        body: &[u8],
    ) -> Option<Result<S, String>> {
        let migrator = self.migrators.get(&(TypeId::of::<S>(), version, size))?;
        Some(migrator(body).map(|boxed| {
            *boxed
                .downcast::<S>()
                .expect("migrator registered for S returns S")
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.migrators.is_empty()
    }
}
