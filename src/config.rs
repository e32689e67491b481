//! Client configuration

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::client::connection::Conn;

/// Options for constructing a [`ClusterClient`](crate::cluster::ClusterClient)
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Seed node addresses ("host:port"), tried in order during bootstrap
    pub initial_addresses: Vec<String>,
    /// Randomise the seed list at construction time so multiple clients
    /// spread their initial dial load
    pub shuffle_initial: bool,
    /// Options handed unchanged to every connection the client creates
    pub connection_options: ConnectionOptions,
}

impl ClusterOptions {
    /// Options with the given seed addresses and defaults elsewhere
    pub fn new<I, S>(initial_addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            initial_addresses: initial_addresses.into_iter().map(Into::into).collect(),
            shuffle_initial: false,
            connection_options: ConnectionOptions::default(),
        }
    }
}

/// Per-connection options, passed unchanged to the connection factory
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Read timeout applied to every reply wait
    pub read_timeout: Duration,
    /// Write timeout applied to every submit
    pub write_timeout: Duration,
    /// Credentials sent as an AUTH preamble after dialling
    pub auth: Option<AuthConfig>,
    /// Pub/sub wiring installed at client construction when present
    pub pubsub: Option<PubSubHandlers>,
}

impl ConnectionOptions {
    pub fn connect_timeout(&self) -> Duration {
        defaulted(self.connect_timeout, Duration::from_secs(5))
    }

    pub fn read_timeout(&self) -> Duration {
        defaulted(self.read_timeout, Duration::from_secs(30))
    }

    pub fn write_timeout(&self) -> Duration {
        defaulted(self.write_timeout, Duration::from_secs(30))
    }
}

fn defaulted(configured: Duration, fallback: Duration) -> Duration {
    if configured.is_zero() {
        fallback
    } else {
        configured
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("connect_timeout", &self.connect_timeout())
            .field("read_timeout", &self.read_timeout())
            .field("write_timeout", &self.write_timeout())
            .field("auth", &self.auth.as_ref().map(|a| a.username.as_deref()))
            .field("pubsub", &self.pubsub.is_some())
            .finish()
    }
}

/// AUTH credentials
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Username for ACL-style AUTH; password-only when absent
    pub username: Option<String>,
    pub password: String,
}

/// A source of connections usable for subscribe commands
///
/// Retries internally until it either yields a connection or observes a
/// closing client and yields `None`.
pub type SubscribeSource = Arc<dyn Fn() -> Option<Conn> + Send + Sync>;

/// Pub/sub handler wiring
///
/// When present in [`ConnectionOptions`], the cluster client invokes
/// `install` once during construction, handing over a dispatcher-backed
/// [`SubscribeSource`].
#[derive(Clone)]
pub struct PubSubHandlers {
    pub install: Arc<dyn Fn(SubscribeSource) + Send + Sync>,
}

impl PubSubHandlers {
    pub fn new<F>(install: F) -> Self
    where
        F: Fn(SubscribeSource) + Send + Sync + 'static,
    {
        Self {
            install: Arc::new(install),
        }
    }
}
