//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::util::rate_limit::INPUT_RATE_LIMIT;
use crate::util::time::DEFAULT_TICK_RATE;
use crate::ws::protocol::WORLD_EXTENT;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub log_json: bool,

    /// World width in world units
    pub map_width: u16,
    /// World height in world units
    pub map_height: u16,
    /// Optional JSON map definition produced by the map generator
    pub map_file: Option<PathBuf>,

    /// Inbound messages per second allowed per connection
    pub input_rate_limit: u32,

    /// Allowed client origins for CORS (empty allows any)
    pub client_origins: Vec<String>,

    /// Settings handed to every match
    pub game: GameConfig,
}

/// Per-match settings
#[derive(Clone, Debug, PartialEq)]
pub struct GameConfig {
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Spatial index cell edge length
    pub cell_size: f32,
    pub max_players: usize,
    /// Players needed before the countdown starts
    pub min_players: usize,
    /// Seconds between reaching `min_players` and the start
    pub countdown_secs: f32,
    /// Hard capacity of one connection's per-tick buffer
    pub outbound_buffer_bytes: usize,
    /// Ticks a connection may fall behind before it is dropped
    pub outbound_queue: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            cell_size: 16.0,
            max_players: 80,
            min_players: 2,
            countdown_secs: 5.0,
            outbound_buffer_bytes: 65536,
            outbound_queue: 8,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = GameConfig::default();
        let game = GameConfig {
            tick_rate: parse_var("TICK_RATE", defaults.tick_rate)?,
            cell_size: parse_var("GRID_CELL_SIZE", defaults.cell_size)?,
            max_players: parse_var("MAX_PLAYERS_PER_MATCH", defaults.max_players)?,
            min_players: parse_var("MIN_PLAYERS_TO_START", defaults.min_players)?,
            countdown_secs: parse_var("COUNTDOWN_SECS", defaults.countdown_secs)?,
            outbound_buffer_bytes: parse_var("OUTBOUND_BUFFER_BYTES", defaults.outbound_buffer_bytes)?,
            outbound_queue: parse_var("OUTBOUND_QUEUE", defaults.outbound_queue)?,
        };
        game.validate()?;

        let map_width = parse_var("MAP_WIDTH", 1024)?;
        let map_height = parse_var("MAP_HEIGHT", 1024)?;
        validate_map_size(map_width, map_height)?;

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")),

            map_width,
            map_height,
            map_file: env::var("MAP_FILE").ok().filter(|s| !s.is_empty()).map(PathBuf::from),

            input_rate_limit: parse_var("INPUT_RATE_LIMIT", INPUT_RATE_LIMIT)?,

            client_origins: env::var("CLIENT_ORIGIN")
                .map(|s| parse_origins(&s))
                .unwrap_or_default(),

            game,
        })
    }
}

impl GameConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("TICK_RATE"));
        }
        if !(self.cell_size >= 1.0) {
            return Err(ConfigError::Invalid("GRID_CELL_SIZE"));
        }
        if self.max_players == 0 {
            return Err(ConfigError::Invalid("MAX_PLAYERS_PER_MATCH"));
        }
        if self.min_players == 0 || self.min_players > self.max_players {
            return Err(ConfigError::Invalid("MIN_PLAYERS_TO_START"));
        }
        if !(64..=1 << 20).contains(&self.outbound_buffer_bytes) {
            return Err(ConfigError::Invalid("OUTBOUND_BUFFER_BYTES"));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid("OUTBOUND_QUEUE"));
        }
        Ok(())
    }
}

/// Positions are quantised inside a fixed extent on the wire
fn validate_map_size(width: u16, height: u16) -> Result<(), ConfigError> {
    let fits = |side: u16| side > 0 && side as f32 <= WORLD_EXTENT;
    if !fits(width) {
        return Err(ConfigError::Invalid("MAP_WIDTH"));
    }
    if !fits(height) {
        return Err(ConfigError::Invalid("MAP_HEIGHT"));
    }
    Ok(())
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn defaults_are_valid() {
        assert_ok!(GameConfig::default().validate());
    }

    #[test]
    fn min_players_cannot_exceed_capacity() {
        let config = GameConfig {
            min_players: 5,
            max_players: 4,
            ..GameConfig::default()
        };
        let err = assert_err!(config.validate());
        assert!(matches!(err, ConfigError::Invalid("MIN_PLAYERS_TO_START")));
    }

    #[test]
    fn zero_tick_rate_is_rejected() {
        let config = GameConfig {
            tick_rate: 0,
            ..GameConfig::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn maps_beyond_the_wire_extent_are_rejected() {
        assert_ok!(validate_map_size(1024, 512));
        let err = assert_err!(validate_map_size(2048, 1024));
        assert!(matches!(err, ConfigError::Invalid("MAP_WIDTH")));
        let err = assert_err!(validate_map_size(1024, 0));
        assert!(matches!(err, ConfigError::Invalid("MAP_HEIGHT")));
    }

    #[test]
    fn origins_are_split_and_trimmed() {
        assert_eq!(
            parse_origins("https://a.example, https://b.example,,"),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn unset_variable_falls_back_to_default() {
        let v: u32 = assert_ok!(parse_var("ARENA_TEST_SURELY_UNSET_VAR", 17));
        assert_eq!(v, 17);
    }
}
