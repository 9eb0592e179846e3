//! Configuration for a messaging hub.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MessagingError;
use crate::transport::TransportOptions;

/// Configuration for a [`MessagingHub`](crate::MessagingHub).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Identity advertised to peers. Falls back to the host name.
    pub identity: Option<String>,

    /// Address to accept WebSocket connections on. `None` makes the hub
    /// client-only; port 0 picks an ephemeral port.
    #[serde(with = "opt_socket_addr_serde")]
    pub listen_addr: Option<SocketAddr>,

    /// Bind-retry budget used by [`start`](crate::MessagingHub::start).
    #[serde(with = "millis_serde")]
    pub start_timeout: Duration,

    /// Pause between bind attempts while the address is in use.
    #[serde(with = "millis_serde")]
    pub bind_retry_interval: Duration,

    /// Upper bound on a single outbound connect attempt.
    #[serde(with = "millis_serde")]
    pub connect_timeout: Duration,

    /// How long a closing transport waits for the peer's close reply.
    #[serde(with = "millis_serde")]
    pub close_timeout: Duration,

    /// Liveness probe timeout used while waiting for a peer.
    #[serde(with = "millis_serde")]
    pub probe_timeout: Duration,

    /// Poll interval used while waiting for a peer.
    #[serde(with = "millis_serde")]
    pub poll_interval: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            identity: None,
            listen_addr: None,
            start_timeout: Duration::from_millis(60_000),
            bind_retry_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl MessagingConfig {
    /// A client-only config with the given identity.
    pub fn client(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            ..Self::default()
        }
    }

    /// A listening config with the given identity and address.
    pub fn server(identity: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            identity: Some(identity.into()),
            listen_addr: Some(listen_addr),
            ..Self::default()
        }
    }

    pub(crate) fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: self.connect_timeout,
            close_timeout: self.close_timeout,
        }
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), MessagingError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Read a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, MessagingError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// [`load`](Self::load), falling back to defaults when the file is
    /// absent or unusable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(MessagingError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(e) => {
                warn!("Ignoring config at {}: {e}", path.display());
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod opt_socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &Option<SocketAddr>, s: S) -> Result<S::Ok, S::Error> {
        match addr {
            Some(addr) => s.serialize_str(&addr.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SocketAddr>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        s.map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
