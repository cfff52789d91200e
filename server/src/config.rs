use crate::gateway::GatewayConfig;
use shared::REGEN_INTERVAL_SECS;
use std::path::PathBuf;
use std::time::Duration;

/// Headroom on top of the image limit for the JSON envelope of a frame.
const FRAME_OVERHEAD_BYTES: usize = 64 * 1024;

/// Everything the server needs to start, usually built from command-line
/// arguments by the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served for every path other than the WebSocket endpoint.
    pub assets_dir: PathBuf,
    pub regen_interval: Duration,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Largest WebSocket message accepted from a client.
    pub fn max_frame_bytes(&self) -> usize {
        self.gateway.max_image_bytes + FRAME_OVERHEAD_BYTES
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            assets_dir: PathBuf::from("public"),
            regen_interval: Duration::from_secs(REGEN_INTERVAL_SECS),
            gateway: GatewayConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "127.0.0.1:3001");
        assert_eq!(config.regen_interval, Duration::from_secs(6));
        assert!(!config.gateway.acknowledge_rejections);
        assert_eq!(
            config.max_frame_bytes(),
            config.gateway.max_image_bytes + FRAME_OVERHEAD_BYTES
        );
    }

    #[test]
    fn test_address_validation() {
        let config = ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        assert!(config
            .address()
            .parse::<std::net::SocketAddr>()
            .is_ok());
    }
}
