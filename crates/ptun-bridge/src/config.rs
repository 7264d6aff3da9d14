//! Tunnel configuration
//!
//! Supplied by the owning controller on every `start`/`update`. Can be
//! written by hand as TOML:
//!
//! ```toml
//! private_key = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk="
//! required_interface = "en0"
//!
//! [peer]
//! public_key = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg="
//! endpoint = "185.65.135.1:51820"
//! ```

use crate::keys::{PrivateKey, PublicKey};
use ptun_core::RouteResolution;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{info, warn};

/// The single peer the tunnel talks to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
}

impl PeerConfig {
    /// Peer reachable at `endpoint`
    pub fn new(public_key: PublicKey, endpoint: SocketAddr) -> Self {
        Self {
            public_key,
            endpoint: Some(endpoint),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub private_key: PrivateKey,
    pub peer: PeerConfig,
    /// Interface UDP sessions must bind to, keeping tunnel traffic off
    /// the tunnel itself
    #[serde(default)]
    pub required_interface: Option<String>,
}

/// What the engine is initialized with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineParams {
    pub private_key: [u8; 32],
    pub peer_public_key: [u8; 32],
    pub peer_endpoint: SocketAddr,
}

impl TunnelConfig {
    pub fn new(private_key: PrivateKey, peer: PeerConfig) -> Self {
        Self {
            private_key,
            peer,
            required_interface: None,
        }
    }

    /// Parse a TOML config
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Parse a JSON config
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Check the config is complete enough to start an engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(endpoint) = self.peer.endpoint else {
            return Err(ConfigError::MissingEndpoint);
        };
        if endpoint.port() == 0 {
            return Err(ConfigError::InvalidEndpoint(endpoint));
        }
        Ok(())
    }

    /// Key bytes and peer address for engine initialization
    pub fn engine_params(&self) -> Result<EngineParams, ConfigError> {
        self.validate()?;
        let peer_endpoint = self.peer.endpoint.ok_or(ConfigError::MissingEndpoint)?;
        Ok(EngineParams {
            private_key: self.private_key.to_bytes(),
            peer_public_key: self.peer.public_key.to_bytes(),
            peer_endpoint,
        })
    }

    /// Pin UDP sessions to the interface `route` leaves through.
    ///
    /// Returns false, leaving the config untouched, when the route already
    /// goes through a tunnel interface.
    pub fn bind_outside_tunnel(&mut self, route: &RouteResolution) -> bool {
        if route.is_tunnel_interface() {
            warn!(
                "Route to {} goes through tunnel interface {}, not binding",
                route.destination, route.interface_name
            );
            return false;
        }
        if route.interface_name.is_empty() {
            warn!("Route to {} has no interface", route.destination);
            return false;
        }
        info!("Binding tunnel sessions to {}", route.interface_name);
        self.required_interface = Some(route.interface_name.clone());
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Peer has no endpoint")]
    MissingEndpoint,

    #[error("Invalid peer endpoint {0}")]
    InvalidEndpoint(SocketAddr),

    #[error("Invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const PRIVATE: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const PEER: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

    fn route(interface_name: &str) -> RouteResolution {
        RouteResolution {
            destination: IpAddr::V4(Ipv4Addr::new(185, 65, 135, 1)),
            gateway: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))),
            netmask: None,
            interface_name: interface_name.to_string(),
            interface_index: 4,
        }
    }

    fn config() -> TunnelConfig {
        TunnelConfig::new(
            PrivateKey::from_base64(PRIVATE).unwrap(),
            PeerConfig::new(
                PublicKey::from_base64(PEER).unwrap(),
                "185.65.135.1:51820".parse().unwrap(),
            ),
        )
    }

    #[test]
    fn test_from_toml() {
        let config = TunnelConfig::from_toml(&format!(
            r#"
            private_key = "{PRIVATE}"
            required_interface = "en0"

            [peer]
            public_key = "{PEER}"
            endpoint = "185.65.135.1:51820"
            "#
        ))
        .unwrap();

        assert_eq!(config.required_interface.as_deref(), Some("en0"));
        assert_eq!(config.peer.public_key.to_base64(), PEER);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_json_without_endpoint() {
        let config = TunnelConfig::from_json(&format!(
            r#"{{"private_key": "{PRIVATE}", "peer": {{"public_key": "{PEER}"}}}}"#
        ))
        .unwrap();

        assert!(matches!(config.validate(), Err(ConfigError::MissingEndpoint)));
        assert!(matches!(
            config.engine_params(),
            Err(ConfigError::MissingEndpoint)
        ));
    }

    #[test]
    fn test_rejects_bad_key() {
        let result = TunnelConfig::from_json(&format!(
            r#"{{"private_key": "short", "peer": {{"public_key": "{PEER}"}}}}"#
        ));
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_engine_params() {
        let config = config();
        let params = config.engine_params().unwrap();
        assert_eq!(params.private_key, config.private_key.to_bytes());
        assert_eq!(params.peer_public_key, config.peer.public_key.to_bytes());
        assert_eq!(params.peer_endpoint.port(), 51820);
    }

    #[test]
    fn test_zero_port_is_invalid() {
        let mut config = config();
        config.peer.endpoint = Some("185.65.135.1:0".parse().unwrap());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_bind_outside_tunnel() {
        let mut config = config();
        assert!(!config.bind_outside_tunnel(&route("utun4")));
        assert_eq!(config.required_interface, None);

        assert!(config.bind_outside_tunnel(&route("en0")));
        assert_eq!(config.required_interface.as_deref(), Some("en0"));
    }
}
