//! Tracing subscriber setup for the `tern` binary and tests.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, StoreError};

/// Installs a global `fmt` subscriber filtered by `level`, which accepts any
/// `EnvFilter` directive (`info`, `tern=debug,warn`, ...).
///
/// # Errors
///
/// Fails when the directive does not parse or a subscriber is already set.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| StoreError::Invalid(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| StoreError::Invalid("logging already initialized".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_directive() {
        assert!(matches!(
            init_logging("tern=loud"),
            Err(StoreError::Invalid(_))
        ));
    }
}
