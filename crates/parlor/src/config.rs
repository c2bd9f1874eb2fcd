//! Server configuration.
//!
//! Every section deserializes with defaults, so a config file only needs
//! the keys it overrides. Durations are expressed in the unit their key
//! names (`tick_interval_ms`, `grace_period_seconds`).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ParlorError;

/// A named room template the hub's `CreateRoom` resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomTemplate {
    pub game_type: String,
    pub max_seats: u8,
    #[serde(default)]
    pub entry_fee: i64,
    #[serde(default)]
    pub visibility: parlor_protocol::Visibility,
    /// Module-specific config copied into the room meta.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameLoopSection {
    pub tick_interval_ms: u64,
    pub max_rooms_per_tick: usize,
    pub sweep_concurrency: usize,
    pub idle_room_seconds: u64,
}

impl Default for GameLoopSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5000,
            max_rooms_per_tick: 50,
            sweep_concurrency: 10,
            idle_room_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub reconnection_grace_period_seconds: u64,
    pub heartbeat_ttl_seconds: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            reconnection_grace_period_seconds: 15,
            heartbeat_ttl_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomySection {
    pub initial_coins: i64,
    pub rake_percent: i64,
}

impl Default for EconomySection {
    fn default() -> Self {
        Self {
            initial_coins: 100,
            rake_percent: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub permit_limit: i64,
    pub window_minutes: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            permit_limit: 100,
            window_minutes: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSection {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_attempts: i32,
    pub purge_after_days: u64,
}

impl Default for OutboxSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            batch_size: 100,
            max_attempts: 5,
            purge_after_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Postgres connection URL; empty means the in-memory repositories.
    pub url: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub connection_idle_lifetime_seconds: u64,
    pub command_timeout_seconds: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_pool_size: 16,
            min_pool_size: 1,
            connection_idle_lifetime_seconds: 300,
            command_timeout_seconds: 30,
        }
    }
}

impl DatabaseSection {
    pub fn pool_settings(&self) -> parlor_economy::PgPoolSettings {
        parlor_economy::PgPoolSettings {
            url: self.url.clone(),
            max_pool_size: self.max_pool_size,
            min_pool_size: self.min_pool_size,
            connection_idle_lifetime: Duration::from_secs(
                self.connection_idle_lifetime_seconds,
            ),
            command_timeout: Duration::from_secs(self.command_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    /// 0 means `2 × available parallelism`.
    pub shards: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self { shards: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub game_loop: GameLoopSection,
    pub session: SessionSection,
    pub economy: EconomySection,
    pub rate_limit: RateLimitSection,
    pub outbox: OutboxSection,
    pub dispatcher: DispatcherSection,
    pub database: DatabaseSection,
    pub templates: HashMap<String, RoomTemplate>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            game_loop: GameLoopSection::default(),
            session: SessionSection::default(),
            economy: EconomySection::default(),
            rate_limit: RateLimitSection::default(),
            outbox: OutboxSection::default(),
            dispatcher: DispatcherSection::default(),
            database: DatabaseSection::default(),
            templates: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ParlorError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ParlorError::Config(format!("read {:?}: {e}", path.as_ref())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ParlorError> {
        serde_json::from_str(raw).map_err(|e| ParlorError::Config(e.to_string()))
    }

    pub fn with_template(mut self, name: impl Into<String>, template: RoomTemplate) -> Self {
        self.templates.insert(name.into(), template);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.game_loop.tick_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.session.reconnection_grace_period_seconds)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.game_loop.tick_interval_ms, 5000);
        assert_eq!(cfg.session.reconnection_grace_period_seconds, 15);
        assert_eq!(cfg.economy.initial_coins, 100);
        assert_eq!(cfg.rate_limit.permit_limit, 100);
        assert_eq!(cfg.outbox.max_attempts, 5);
    }

    #[test]
    fn test_partial_json_overrides_only_named_keys() {
        let cfg = ServerConfig::from_json(
            r#"{
                "bind_addr": "0.0.0.0:9000",
                "game_loop": { "tick_interval_ms": 1000 },
                "economy": { "initial_coins": 250 }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.game_loop.tick_interval_ms, 1000);
        // Unnamed keys within a named section keep their defaults.
        assert_eq!(cfg.game_loop.max_rooms_per_tick, 50);
        assert_eq!(cfg.economy.initial_coins, 250);
        assert_eq!(cfg.economy.rake_percent, 3);
    }

    #[test]
    fn test_templates_parse() {
        let cfg = ServerConfig::from_json(
            r#"{
                "templates": {
                    "Sprint (4p)": {
                        "game_type": "sprint",
                        "max_seats": 4,
                        "entry_fee": 100,
                        "config": { "track_length": 30 }
                    }
                }
            }"#,
        )
        .unwrap();

        let t = &cfg.templates["Sprint (4p)"];
        assert_eq!(t.game_type, "sprint");
        assert_eq!(t.max_seats, 4);
        assert_eq!(t.entry_fee, 100);
        assert_eq!(t.config["track_length"], 30);
    }

    #[test]
    fn test_malformed_json_is_a_config_error() {
        assert!(ServerConfig::from_json("{ nope").is_err());
    }

    #[test]
    fn test_database_section_converts_to_pool_settings() {
        let cfg = ServerConfig::from_json(
            r#"{
                "database": {
                    "url": "postgres://localhost/parlor",
                    "max_pool_size": 8,
                    "command_timeout_seconds": 5
                }
            }"#,
        )
        .unwrap();

        let settings = cfg.database.pool_settings();
        assert_eq!(settings.url, "postgres://localhost/parlor");
        assert_eq!(settings.max_pool_size, 8);
        assert_eq!(settings.min_pool_size, 1);
        assert_eq!(settings.command_timeout, Duration::from_secs(5));
    }
}
