//! Configuration for a [`Pool`](crate::Pool).

use std::{fmt, sync::Arc, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    event::EventListener,
};

/// The network address of the single endpoint a [`Pool`](crate::Pool) manages connections to.
///
/// A host ending in `.sock` is treated as a path to a UNIX domain socket; anything else is
/// dialed over TCP.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Address {
    pub host: String,
    pub port: Option<u16>,
}

impl Address {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether this address names a UNIX domain socket path rather than a TCP host.
    pub fn is_unix_socket(&self) -> bool {
        self.host.ends_with(".sock")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

/// Configuration for a [`Pool`](crate::Pool), built with the [`TypedBuilder`] derive so
/// construction reads as a fluent chain with sensible defaults.
#[derive(TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PoolOptions {
    /// Cap on `active_checkouts + pending_creates`. `None` means unbounded.
    #[builder(default = Some(100))]
    pub max_pool_size: Option<u32>,

    /// Target floor maintained by the background maintenance pass.
    #[builder(default)]
    pub min_pool_size: Option<u32>,

    /// Cap on the number of connections concurrently being dialed/handshaked.
    #[builder(default = 2)]
    pub max_connecting: u32,

    /// Idle connections older than this are pruned on checkout or during maintenance.
    #[builder(default)]
    pub max_idle_time: Option<Duration>,

    /// Deadline for a checkout to acquire a connection. `None` means no deadline.
    #[builder(default)]
    pub wait_queue_timeout: Option<Duration>,

    /// `max_waiters = max_pool_size * wait_queue_multiple`. `None` means unbounded waiters.
    #[builder(default)]
    pub wait_queue_multiple: Option<u32>,

    /// Dial + handshake deadline for establishing a brand new connection.
    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,

    /// Per send/recv deadline on a checked-out connection.
    #[builder(default)]
    pub socket_timeout: Option<Duration>,

    /// Minimum spacing between cheap liveness probes on the same idle connection.
    #[builder(default = Duration::from_secs(1))]
    pub check_interval: Duration,

    /// Whether `reset()` transitions the pool to PAUSED (vs. staying READY).
    #[builder(default = true)]
    pub pause_enabled: bool,

    /// Application name passed through to the handshake collaborator and reported in the
    /// `PoolCreated` event.
    #[builder(default)]
    pub app_name: Option<String>,

    /// Optional listener notified of every CMAP-style lifecycle event.
    #[builder(default, setter(strip_option))]
    pub event_listener: Option<Arc<dyn EventListener>>,
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("max_pool_size", &self.max_pool_size)
            .field("min_pool_size", &self.min_pool_size)
            .field("max_connecting", &self.max_connecting)
            .field("max_idle_time", &self.max_idle_time)
            .field("wait_queue_timeout", &self.wait_queue_timeout)
            .field("wait_queue_multiple", &self.wait_queue_multiple)
            .field("connect_timeout", &self.connect_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("check_interval", &self.check_interval)
            .field("pause_enabled", &self.pause_enabled)
            .field("app_name", &self.app_name)
            .finish_non_exhaustive()
    }
}

impl PoolOptions {
    /// The maximum number of queued waiters allowed before a checkout is refused outright.
    pub fn max_waiters(&self) -> Option<u32> {
        match (self.max_pool_size, self.wait_queue_multiple) {
            (Some(max_pool_size), Some(multiple)) => Some(max_pool_size * multiple),
            _ => None,
        }
    }

    /// Validates option combinations that can't be expressed in the type system alone.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_connecting == 0 {
            return Err(Error::invalid_argument(
                "max_connecting must be at least 1",
            ));
        }
        if let (Some(min), Some(max)) = (self.min_pool_size, self.max_pool_size) {
            if min > max {
                return Err(Error::invalid_argument(format!(
                    "min_pool_size ({min}) must not exceed max_pool_size ({max})"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn address_display_includes_port_only_when_present() {
        assert_eq!(Address::new("db.example.com", Some(27017)).to_string(), "db.example.com:27017");
        assert_eq!(Address::new("/tmp/mongodb.sock", None).to_string(), "/tmp/mongodb.sock");
    }

    #[test]
    fn address_recognizes_unix_socket_paths() {
        assert!(Address::new("/tmp/mongodb-27017.sock", None).is_unix_socket());
        assert!(!Address::new("localhost", Some(27017)).is_unix_socket());
    }

    #[test]
    fn max_waiters_is_none_unless_both_bound_and_multiple_are_set() {
        let options = PoolOptions::builder().build();
        assert_eq!(options.max_waiters(), None);

        let options = PoolOptions::builder()
            .max_pool_size(Some(10))
            .wait_queue_multiple(Some(5))
            .build();
        assert_eq!(options.max_waiters(), Some(50));

        let options = PoolOptions::builder().max_pool_size(None).wait_queue_multiple(Some(5)).build();
        assert_eq!(options.max_waiters(), None);
    }

    #[test]
    fn validate_rejects_zero_max_connecting() {
        let options = PoolOptions::builder().max_connecting(0u32).build();
        let error = options.validate().unwrap_err();
        assert!(matches!(&*error.kind, ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn validate_rejects_min_pool_size_above_max() {
        let options = PoolOptions::builder()
            .min_pool_size(Some(10))
            .max_pool_size(Some(5))
            .build();
        assert!(options.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(PoolOptions::builder().build().validate().is_ok());
    }
}
