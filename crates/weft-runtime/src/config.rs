//! Runtime configuration
//!
//! A single [`RuntimeConfig`] is installed for the whole process; it can be
//! built explicitly or read from `WEFT_*` environment variables. Once a
//! scheduler has consulted it the configuration is frozen.

use std::sync::OnceLock;
use std::time::Duration;

use weft_core::env::env_get;
use weft_core::error::{RuntimeError, RuntimeResult};

/// Process-wide runtime tunables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Usable bytes per coroutine stack (guard page not included).
    pub stack_size: usize,
    /// Default connect timeout for hooked sockets.
    pub connect_timeout: Duration,
    /// Default receive timeout for hooked sockets.
    pub recv_timeout: Duration,
    /// Default send timeout for hooked sockets.
    pub send_timeout: Duration,
    /// Initial fd context table capacity; the table grows by half on demand.
    pub fd_slots: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: 128 * 1024,
            connect_timeout: Duration::from_millis(5000),
            recv_timeout: Duration::from_millis(6000),
            send_timeout: Duration::from_millis(6000),
            fd_slots: 128,
        }
    }
}

impl RuntimeConfig {
    /// Build a config from `WEFT_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            stack_size: env_get("WEFT_STACK_SIZE", d.stack_size),
            connect_timeout: Duration::from_millis(env_get(
                "WEFT_CONNECT_TIMEOUT_MS",
                d.connect_timeout.as_millis() as u64,
            )),
            recv_timeout: Duration::from_millis(env_get(
                "WEFT_RECV_TIMEOUT_MS",
                d.recv_timeout.as_millis() as u64,
            )),
            send_timeout: Duration::from_millis(env_get(
                "WEFT_SEND_TIMEOUT_MS",
                d.send_timeout.as_millis() as u64,
            )),
            fd_slots: env_get("WEFT_FD_SLOTS", d.fd_slots),
        }
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn with_recv_timeout(mut self, t: Duration) -> Self {
        self.recv_timeout = t;
        self
    }

    pub fn with_send_timeout(mut self, t: Duration) -> Self {
        self.send_timeout = t;
        self
    }

    pub fn with_connect_timeout(mut self, t: Duration) -> Self {
        self.connect_timeout = t;
        self
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.stack_size < 16 * 1024 {
            return Err(RuntimeError::InvalidConfig("stack_size below 16 KiB"));
        }
        if self.fd_slots == 0 {
            return Err(RuntimeError::InvalidConfig("fd_slots must be nonzero"));
        }
        Ok(())
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install `cfg` as the process-wide config.
///
/// Fails if the config has already been read or installed.
pub fn init(cfg: RuntimeConfig) -> RuntimeResult<()> {
    cfg.validate()?;
    GLOBAL.set(cfg).map_err(|_| RuntimeError::AlreadyStarted)
}

/// The process-wide config, reading the environment on first use.
pub fn global() -> &'static RuntimeConfig {
    GLOBAL.get_or_init(RuntimeConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_tiny_stack_rejected() {
        let cfg = RuntimeConfig::default().with_stack_size(4096);
        assert!(matches!(
            cfg.validate(),
            Err(RuntimeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_builder_chain() {
        let cfg = RuntimeConfig::default()
            .with_recv_timeout(Duration::from_millis(100))
            .with_stack_size(256 * 1024);
        assert_eq!(cfg.recv_timeout, Duration::from_millis(100));
        assert_eq!(cfg.stack_size, 256 * 1024);
    }
}
