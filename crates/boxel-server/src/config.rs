// config.rs — server configuration
//
// There is no command-line surface; the handful of knobs come from the
// environment with defaults matching the distributed setup.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use boxel_common::clock::TimeDelta;
use boxel_common::protocol::DEFAULT_PORT;

pub const LEVEL_FILE: &str = "world.gz";
pub const EVENT_FILE: &str = "events.txt.gz";

/// One simulation frame.
pub const FRAME_INTERVAL: TimeDelta = TimeDelta::from_millis(250);

/// How often dirty state is flushed to disk.
pub const SAVE_INTERVAL: TimeDelta = TimeDelta::new(120, 0);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub level_path: PathBuf,
    pub event_path: PathBuf,
    pub frame_interval: TimeDelta,
    pub save_interval: TimeDelta,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            level_path: PathBuf::from(LEVEL_FILE),
            event_path: PathBuf::from(EVENT_FILE),
            frame_interval: FRAME_INTERVAL,
            save_interval: SAVE_INTERVAL,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Ok(port) = std::env::var("BOXEL_PORT") {
            if let Ok(port) = port.parse() {
                config.bind_addr.set_port(port);
            }
        }
        if let Ok(path) = std::env::var("BOXEL_LEVEL_FILE") {
            config.level_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("BOXEL_EVENT_FILE") {
            config.event_path = PathBuf::from(path);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 25565);
        assert_eq!(config.level_path, PathBuf::from("world.gz"));
        assert_eq!(config.frame_interval, TimeDelta::from_millis(250));
        assert_eq!(config.save_interval.sec, 120);
    }
}
