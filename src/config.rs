//! Configuration options (§6): transport, host/port or Unix path, database,
//! password, reconnect policy, connect timeout, and the pubsub-only
//! back-pressure overflow knobs.

use crate::transport::{Endpoint, TlsOptions};
use std::time::Duration;

/// `reconnect_sleep`: a fixed sleep between reconnect attempts, or the
/// `no_reconnect` sentinel that disables the reconnect loop entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    NoReconnect,
    Fixed(Duration),
}

impl ReconnectPolicy {
    pub fn fixed_millis(ms: u64) -> Self {
        ReconnectPolicy::Fixed(Duration::from_millis(ms))
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, ReconnectPolicy::NoReconnect)
    }
}

/// Connection-level configuration for the request connection actor (C3) and
/// the pubsub actor (C5) alike.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub endpoint: Endpoint,
    pub tls: Option<TlsOptions>,
    pub database: Option<u64>,
    pub password: String,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl ConnectionOptions {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ConnectionOptions {
            endpoint: Endpoint::Tcp {
                host: host.into(),
                port,
            },
            tls: None,
            database: None,
            password: String::new(),
            reconnect: ReconnectPolicy::fixed_millis(1000),
            connect_timeout: Duration::from_millis(5000),
        }
    }

    pub fn unix(path: impl Into<std::path::PathBuf>) -> Self {
        ConnectionOptions {
            endpoint: Endpoint::Unix { path: path.into() },
            tls: None,
            database: None,
            password: String::new(),
            reconnect: ReconnectPolicy::fixed_millis(1000),
            connect_timeout: Duration::from_millis(5000),
        }
    }

    pub fn with_database(mut self, db: u64) -> Self {
        self.database = Some(db);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Overflow policy for a pubsub actor's `msg_queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBehaviour {
    /// Discard the queue and send a synthetic overflow notice.
    Drop,
    /// Terminate the pubsub actor.
    Exit,
}

#[derive(Debug, Clone, Copy)]
pub struct PubsubOptions {
    /// `None` means `infinity`.
    pub max_queue_size: Option<usize>,
    pub queue_behaviour: QueueBehaviour,
}

impl Default for PubsubOptions {
    fn default() -> Self {
        PubsubOptions {
            max_queue_size: Some(1024),
            queue_behaviour: QueueBehaviour::Drop,
        }
    }
}
