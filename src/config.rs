use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{RealtimeError, Result};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:5000";
pub const DEFAULT_TOKEN_URL: &str = "http://localhost:5000/api/v1/auth/socket-token";
pub const RECONNECTION_ATTEMPTS: u32 = 5;
pub const RECONNECTION_DELAY_MS: u64 = 3000;
pub const CONNECT_TIMEOUT_MS: u64 = 5000;
pub const BANNER_DELAY_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub server_url: Url,
    pub token_url: Url,
    pub reconnection_attempts: u32,
    pub reconnection_delay: Duration,
    pub connect_timeout: Duration,
    pub banner_delay: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            server_url: Url::parse(DEFAULT_SERVER_URL).expect("default server url is valid"),
            token_url: Url::parse(DEFAULT_TOKEN_URL).expect("default token url is valid"),
            reconnection_attempts: RECONNECTION_ATTEMPTS,
            reconnection_delay: Duration::from_millis(RECONNECTION_DELAY_MS),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            banner_delay: Duration::from_millis(BANNER_DELAY_MS),
        }
    }
}

impl RealtimeConfig {
    /// Defaults overridden by `CINEMA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = RealtimeConfig::default();

        if let Some(raw) = read_var("CINEMA_REALTIME_URL") {
            config.server_url = Url::parse(&raw)?;
        }
        if let Some(raw) = read_var("CINEMA_TOKEN_URL") {
            config.token_url = Url::parse(&raw)?;
        }
        if let Some(raw) = read_var("CINEMA_RECONNECT_ATTEMPTS") {
            config.reconnection_attempts = parse_number("CINEMA_RECONNECT_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = read_var("CINEMA_RECONNECT_DELAY_MS") {
            config.reconnection_delay =
                Duration::from_millis(parse_number("CINEMA_RECONNECT_DELAY_MS", &raw)?);
        }
        if let Some(raw) = read_var("CINEMA_CONNECT_TIMEOUT_MS") {
            config.connect_timeout =
                Duration::from_millis(parse_number("CINEMA_CONNECT_TIMEOUT_MS", &raw)?);
        }

        Ok(config)
    }

    /// Engine.IO websocket endpoint for the configured server.
    pub fn socket_url(&self) -> Result<Url> {
        let mut url = self.server_url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(RealtimeError::Config(format!(
                    "unsupported scheme for realtime server: {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| RealtimeError::Config(format!("cannot use scheme {scheme}")))?;
        url.set_path("/socket.io/");
        url.set_query(Some("EIO=4&transport=websocket"));
        Ok(url)
    }
}

fn read_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| RealtimeError::Config(format!("{name} must be a number, got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reconnection_policy() {
        let config = RealtimeConfig::default();
        assert_eq!(config.reconnection_attempts, 5);
        assert_eq!(config.reconnection_delay, Duration::from_millis(3000));
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
        assert_eq!(config.banner_delay, Duration::from_millis(5000));
    }

    #[test]
    fn socket_url_switches_to_websocket_scheme() {
        let mut config = RealtimeConfig::default();
        config.server_url = Url::parse("https://cinema.example.com/app").unwrap();
        let url = config.socket_url().unwrap();
        assert_eq!(
            url.as_str(),
            "wss://cinema.example.com/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn socket_url_rejects_unknown_scheme() {
        let mut config = RealtimeConfig::default();
        config.server_url = Url::parse("ftp://cinema.example.com").unwrap();
        assert!(matches!(config.socket_url(), Err(RealtimeError::Config(_))));
    }

    #[test]
    fn parse_number_reports_variable_name() {
        let err = parse_number::<u32>("CINEMA_RECONNECT_ATTEMPTS", "five").unwrap_err();
        assert!(err.to_string().contains("CINEMA_RECONNECT_ATTEMPTS"));
    }
}
