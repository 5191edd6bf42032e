use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Largest number of participants a room holds.
pub const MAX_ROOM_SIZE: usize = 4;

/// Public STUN servers every peer connection is configured with.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

/// How long an offer may stay unanswered before the link is torn down.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_RELAY_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub max_room_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            max_room_size: MAX_ROOM_SIZE,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_room_size < 2 {
            return Err(Error::InvalidConfig(format!(
                "max_room_size must be at least 2, got {}",
                self.max_room_size
            )));
        }
        Ok(())
    }
}

/// Settings for one participant joining a room.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub room: String,
    pub name: String,
    pub email: String,
    pub stun_servers: Vec<String>,
    pub negotiation_timeout: Duration,
    pub audio: bool,
    pub video: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            room: String::new(),
            name: String::new(),
            email: String::new(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            audio: true,
            video: true,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.room.trim().is_empty() {
            return Err(Error::InvalidConfig("room name must not be empty".to_string()));
        }
        if self.email.trim().is_empty() {
            return Err(Error::InvalidConfig("email must not be empty".to_string()));
        }
        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "relay url must be a ws:// or wss:// url, got {}",
                self.relay_url
            )));
        }
        if self.negotiation_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "negotiation timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relay_config_is_valid() {
        let config = RelayConfig::default();
        assert_eq!(config.max_room_size, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relay_config_rejects_single_seat_rooms() {
        let config = RelayConfig {
            max_room_size: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_client_config_requires_room_and_email() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_err());

        config.room = "r1".to_string();
        assert!(config.validate().is_err());

        config.email = "a@example.com".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.stun_servers.len(), 2);
    }

    #[test]
    fn test_client_config_rejects_http_urls() {
        let config = ClientConfig {
            relay_url: "http://127.0.0.1:8000".to_string(),
            room: "r1".to_string(),
            email: "a@example.com".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
