//! Error types for discovery, the device manager and command dispatch.

use std::io;
use std::net::SocketAddr;

use lidarlink_transport::TransportError;
use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Listening socket could not be bound
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        /// Listen address
        addr: SocketAddr,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// Other transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DiscoveryError {
    pub(crate) fn from_bind(err: TransportError) -> Self {
        match err {
            TransportError::BindFailed { addr, source } => DiscoveryError::Bind { addr, source },
            other => DiscoveryError::Transport(other),
        }
    }
}

/// Device manager errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    /// Every handle is claimed by a different broadcast code
    #[error("device table is full ({0} handles in use)")]
    TableFull(usize),

    /// Broadcast code is empty
    #[error("invalid broadcast code")]
    InvalidBroadcastCode,
}

/// Command dispatch errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Command channel has shut down
    #[error("command channel closed")]
    ChannelClosed,
}

/// Connection service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Discovery could not start
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_conversion() {
        let addr: SocketAddr = "0.0.0.0:55000".parse().unwrap();
        let err = DiscoveryError::from_bind(TransportError::BindFailed {
            addr,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        });
        assert!(matches!(err, DiscoveryError::Bind { addr: a, .. } if a == addr));

        let err = DiscoveryError::from_bind(TransportError::Closed);
        assert!(matches!(err, DiscoveryError::Transport(TransportError::Closed)));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ManagerError::TableFull(32).to_string(),
            "device table is full (32 handles in use)"
        );
        assert_eq!(
            DispatchError::ChannelClosed.to_string(),
            "command channel closed"
        );
    }
}
