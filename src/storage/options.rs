use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::storage::compaction::CompactionPhase;

/// Journal durability mode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync the delta or tombstone journal after every write (most durable).
    #[default]
    Full,
    /// Sync at compaction boundaries, on `sync` and on close.
    Normal,
    /// No explicit journal syncs. Manifest commits are still durable.
    Off,
}

impl Synchronous {
    /// Returns the string representation of the synchronous mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }

    /// Parses a synchronous mode from a string (case-insensitive).
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "normal" => Some(Synchronous::Normal),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

/// Background compaction policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Whether the background worker runs at all. `compact_now` works either way.
    pub enabled: bool,
    /// Run a cycle every this many seconds when set.
    pub interval_secs: Option<u64>,
    /// Signal the worker once this many delta writes accumulated since the
    /// last cycle. Zero disables the threshold trigger.
    pub delta_threshold: u64,
    /// How long Quiescing waits for active leases before aborting.
    pub quiesce_timeout_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: None,
            delta_threshold: 100_000,
            quiesce_timeout_ms: 5_000,
        }
    }
}

impl CompactionConfig {
    /// Quiesce timeout as a duration.
    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    /// Timer interval, if the timer trigger is enabled.
    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.map(Duration::from_secs)
    }
}

/// What a phase hook asks the compactor to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookAction {
    /// Run the phase normally.
    Continue,
    /// Fail the phase; the cycle aborts and cleans up.
    Fail,
    /// Stop the cycle without any cleanup, leaving disk state as a process
    /// crash at this point would.
    Crash,
}

/// Called at the start of every compaction phase.
pub type PhaseHook = Arc<dyn Fn(CompactionPhase) -> HookAction + Send + Sync>;

/// Configuration supplied when creating or opening a [`super::HybridStore`].
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Journal durability mode.
    pub synchronous: Synchronous,
    /// Background compaction policy.
    pub compaction: CompactionConfig,
    /// Fault-injection hook run before each compaction phase.
    #[serde(skip)]
    pub phase_hook: Option<PhaseHook>,
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("synchronous", &self.synchronous)
            .field("compaction", &self.compaction)
            .field("phase_hook", &self.phase_hook.is_some())
            .finish()
    }
}

impl StoreOptions {
    /// Sets the journal durability mode.
    pub fn synchronous(mut self, mode: Synchronous) -> Self {
        self.synchronous = mode;
        self
    }

    /// Replaces the compaction policy.
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Enables or disables the background worker.
    pub fn background_compaction(mut self, enabled: bool) -> Self {
        self.compaction.enabled = enabled;
        self
    }

    /// Sets the delta write threshold that signals the worker.
    pub fn delta_threshold(mut self, writes: u64) -> Self {
        self.compaction.delta_threshold = writes;
        self
    }

    /// Sets the quiesce timeout.
    pub fn quiesce_timeout(mut self, timeout: Duration) -> Self {
        self.compaction.quiesce_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Installs a phase hook.
    pub fn phase_hook(
        mut self,
        hook: impl Fn(CompactionPhase) -> HookAction + Send + Sync + 'static,
    ) -> Self {
        self.phase_hook = Some(Arc::new(hook));
        self
    }

    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| StoreError::Invalid(format!("store options: {err}")))
    }

    /// Loads options from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() -> Result<()> {
        let opts = StoreOptions::from_toml_str(
            r#"
            synchronous = "normal"

            [compaction]
            interval_secs = 30
            delta_threshold = 500
            "#,
        )?;
        assert_eq!(opts.synchronous, Synchronous::Normal);
        assert_eq!(opts.compaction.interval(), Some(Duration::from_secs(30)));
        assert_eq!(opts.compaction.delta_threshold, 500);
        assert!(opts.compaction.enabled);
        assert_eq!(opts.compaction.quiesce_timeout_ms, 5_000);
        assert!(opts.phase_hook.is_none());
        Ok(())
    }

    #[test]
    fn bad_toml_is_invalid() {
        let err = StoreOptions::from_toml_str("synchronous = \"sometimes\"").unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn synchronous_parses_case_insensitively() {
        assert_eq!(Synchronous::from_str("OFF"), Some(Synchronous::Off));
        assert_eq!(Synchronous::from_str("lazy"), None);
        assert_eq!(Synchronous::Normal.as_str(), "normal");
    }
}
