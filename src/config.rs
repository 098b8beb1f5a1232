//! Configuration traits and the dispatcher configuration.
//!
//! The traits describe the common configuration patterns; `DispatcherConfig`
//! is the one concrete configuration the crate consumes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stream::DEFAULT_BUFFER_SIZE;

/// Base trait for configuration types.
///
/// # Example
///
/// ```rust
/// use relayline::Config;
/// use std::time::Duration;
///
/// #[derive(Debug, Clone)]
/// struct GatewayConfig {
///     name: String,
///     timeout_ms: u64,
/// }
///
/// impl Config for GatewayConfig {
///     fn name(&self) -> &str {
///         &self.name
///     }
///
///     fn timeout(&self) -> Option<Duration> {
///         Some(Duration::from_millis(self.timeout_ms))
///     }
/// }
/// ```
pub trait Config: Send + Sync {
    /// Returns the configuration name/identifier.
    fn name(&self) -> &str {
        "default"
    }

    /// Returns the timeout duration, if configured.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Returns whether verbose output is enabled.
    fn is_verbose(&self) -> bool {
        false
    }

    /// Returns whether debug mode is enabled.
    fn is_debug(&self) -> bool {
        false
    }

    /// Validates the configuration.
    ///
    /// Returns Ok(()) if valid, or an error message describing the issue.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Trait for configurations that support file-based loading.
pub trait FileConfig: Config {
    /// Load configuration from a file path.
    fn from_file(path: &Path) -> Result<Self, String>
    where
        Self: Sized;

    /// Save configuration to a file path.
    fn to_file(&self, path: &Path) -> Result<(), String>;
}

/// Trait for configurations that can be merged.
pub trait MergeableConfig: Config {
    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` where applicable.
    fn merge(&mut self, other: &Self);

    /// Create a new configuration by merging two configurations.
    fn merged(base: &Self, overlay: &Self) -> Self
    where
        Self: Clone,
    {
        let mut result = base.clone();
        result.merge(overlay);
        result
    }
}

/// Where chains ending in synchronous filters and a sync endpoint run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncExecution {
    /// On Tokio's blocking pool
    #[default]
    Blocking,
    /// On the dispatching thread, before `dispatch` returns
    Inline,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Dispatcher settings.
///
/// Loadable from TOML:
///
/// ```toml
/// name = "orders"
/// default_timeout_ms = 2000
/// stream_buffer_size = 64
/// sync_execution = "inline"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Configuration name
    pub name: String,
    /// Deadline applied to requests that carry none
    pub default_timeout_ms: Option<u64>,
    /// Capacity of channels handed out by `Dispatcher::stream_channel`
    #[serde(default = "default_buffer_size")]
    pub stream_buffer_size: usize,
    /// Execution mode for synchronous chains
    pub sync_execution: SyncExecution,
    /// Verbose output flag
    pub verbose: bool,
    /// Debug mode flag
    pub debug: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            default_timeout_ms: None,
            stream_buffer_size: DEFAULT_BUFFER_SIZE,
            sync_execution: SyncExecution::default(),
            verbose: false,
            debug: false,
        }
    }
}

impl DispatcherConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with every file in `paths` laid over them, later files
    /// winning. The result is validated.
    ///
    /// ```rust,no_run
    /// use relayline::DispatcherConfig;
    ///
    /// let config = DispatcherConfig::load_layered(&["dispatcher.toml", "dispatcher.local.toml"])?;
    /// # Ok::<(), String>(())
    /// ```
    pub fn load_layered<P: AsRef<Path>>(paths: &[P]) -> Result<Self, String> {
        let mut overlay = DispatcherConfigOverlay::default();
        for path in paths {
            overlay.merge(&DispatcherConfigOverlay::from_file(path.as_ref())?);
        }
        let config = Self::default().overlaid(&overlay);
        config.validate()?;
        Ok(config)
    }

    /// Apply every field `overlay` sets.
    pub fn apply(&mut self, overlay: &DispatcherConfigOverlay) {
        if let Some(name) = &overlay.name {
            self.name = name.clone();
        }
        if let Some(ms) = overlay.default_timeout_ms {
            self.default_timeout_ms = Some(ms);
        }
        if let Some(size) = overlay.stream_buffer_size {
            self.stream_buffer_size = size;
        }
        if let Some(mode) = overlay.sync_execution {
            self.sync_execution = mode;
        }
        if let Some(verbose) = overlay.verbose {
            self.verbose = verbose;
        }
        if let Some(debug) = overlay.debug {
            self.debug = debug;
        }
    }

    /// Copy of this configuration with `overlay` applied.
    pub fn overlaid(mut self, overlay: &DispatcherConfigOverlay) -> Self {
        self.apply(overlay);
        self
    }

    /// Set the configuration name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the default timeout in milliseconds.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = Some(ms);
        self
    }

    /// Set the default timeout.
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.default_timeout_ms = Some(duration.as_millis() as u64);
        self
    }

    /// Set the stream buffer size.
    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }

    /// Set the sync execution mode.
    pub fn with_sync_execution(mut self, mode: SyncExecution) -> Self {
        self.sync_execution = mode;
        self
    }

    /// Enable verbose output.
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Enable debug mode.
    pub fn debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// Parse from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, String> {
        toml::from_str(source).map_err(|e| format!("invalid dispatcher config: {}", e))
    }

    /// Render as a TOML document.
    pub fn to_toml_string(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("cannot serialize dispatcher config: {}", e))
    }
}

impl Config for DispatcherConfig {
    fn name(&self) -> &str {
        if self.name.is_empty() {
            "default"
        } else {
            &self.name
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    fn is_verbose(&self) -> bool {
        self.verbose
    }

    fn is_debug(&self) -> bool {
        self.debug
    }

    fn validate(&self) -> Result<(), String> {
        if self.stream_buffer_size == 0 {
            return Err("stream_buffer_size must be greater than 0".to_string());
        }
        if self.default_timeout_ms == Some(0) {
            return Err("default_timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl FileConfig for DispatcherConfig {
    fn from_file(path: &Path) -> Result<Self, String> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Self::from_toml_str(&source)
    }

    fn to_file(&self, path: &Path) -> Result<(), String> {
        let rendered = self.to_toml_string()?;
        std::fs::write(path, rendered).map_err(|e| format!("cannot write {}: {}", path.display(), e))
    }
}

/// A partial `DispatcherConfig`: only the fields that are set override.
///
/// Unlike comparing against defaults, an overlay can put a field back to its
/// default value, e.g. `stream_buffer_size = 100` over a file that lowered it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfigOverlay {
    /// Configuration name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Deadline applied to requests that carry none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    /// Capacity of channels handed out by `Dispatcher::stream_channel`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_buffer_size: Option<usize>,
    /// Execution mode for synchronous chains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_execution: Option<SyncExecution>,
    /// Verbose output flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
    /// Debug mode flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

impl DispatcherConfigOverlay {
    /// An overlay that sets nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, String> {
        toml::from_str(source).map_err(|e| format!("invalid dispatcher config: {}", e))
    }
}

impl From<&DispatcherConfig> for DispatcherConfigOverlay {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            name: Some(config.name.clone()),
            default_timeout_ms: config.default_timeout_ms,
            stream_buffer_size: Some(config.stream_buffer_size),
            sync_execution: Some(config.sync_execution),
            verbose: Some(config.verbose),
            debug: Some(config.debug),
        }
    }
}

impl Config for DispatcherConfigOverlay {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("default")
    }

    fn timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    fn is_verbose(&self) -> bool {
        self.verbose.unwrap_or(false)
    }

    fn is_debug(&self) -> bool {
        self.debug.unwrap_or(false)
    }

    fn validate(&self) -> Result<(), String> {
        DispatcherConfig::default().overlaid(self).validate()
    }
}

impl FileConfig for DispatcherConfigOverlay {
    fn from_file(path: &Path) -> Result<Self, String> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Self::from_toml_str(&source)
    }

    fn to_file(&self, path: &Path) -> Result<(), String> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| format!("cannot serialize dispatcher config: {}", e))?;
        std::fs::write(path, rendered).map_err(|e| format!("cannot write {}: {}", path.display(), e))
    }
}

impl MergeableConfig for DispatcherConfigOverlay {
    fn merge(&mut self, other: &Self) {
        if other.name.is_some() {
            self.name = other.name.clone();
        }
        if other.default_timeout_ms.is_some() {
            self.default_timeout_ms = other.default_timeout_ms;
        }
        if other.stream_buffer_size.is_some() {
            self.stream_buffer_size = other.stream_buffer_size;
        }
        if other.sync_execution.is_some() {
            self.sync_execution = other.sync_execution;
        }
        if other.verbose.is_some() {
            self.verbose = other.verbose;
        }
        if other.debug.is_some() {
            self.debug = other.debug;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::new()
            .with_name("orders")
            .with_timeout_ms(5000)
            .verbose();

        assert_eq!(config.name(), "orders");
        assert_eq!(config.timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(config.stream_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.sync_execution, SyncExecution::Blocking);
        assert!(config.is_verbose());
        assert!(!config.is_debug());
        assert_eq!(DispatcherConfig::new().name(), "default");
    }

    #[test]
    fn test_config_validation() {
        assert!(DispatcherConfig::new().validate().is_ok());
        assert!(DispatcherConfig::new()
            .with_stream_buffer_size(0)
            .validate()
            .is_err());
        assert!(DispatcherConfig::new().with_timeout_ms(0).validate().is_err());
    }

    #[test]
    fn test_toml_parsing() {
        let config = DispatcherConfig::from_toml_str(
            r#"
            name = "orders"
            default_timeout_ms = 250
            sync_execution = "inline"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "orders");
        assert_eq!(config.default_timeout_ms, Some(250));
        assert_eq!(config.stream_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.sync_execution, SyncExecution::Inline);

        assert!(DispatcherConfig::from_toml_str("sync_execution = \"sideways\"").is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.toml");
        let config = DispatcherConfig::new()
            .with_name("files")
            .with_stream_buffer_size(8)
            .debug();

        config.to_file(&path).unwrap();
        let loaded = DispatcherConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);

        assert!(DispatcherConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_overlay_merge_overrides_set_values() {
        let base = DispatcherConfigOverlay::from_toml_str("name = \"base\"\ndefault_timeout_ms = 1000").unwrap();
        let local = DispatcherConfigOverlay {
            sync_execution: Some(SyncExecution::Inline),
            verbose: Some(true),
            ..DispatcherConfigOverlay::new()
        };

        let merged = DispatcherConfigOverlay::merged(&base, &local);
        assert_eq!(merged.name(), "base");
        assert_eq!(merged.timeout(), Some(Duration::from_millis(1000)));
        assert_eq!(merged.sync_execution, Some(SyncExecution::Inline));
        assert!(merged.is_verbose());
        assert!(!merged.is_debug());
    }

    #[test]
    fn test_overlay_can_restore_defaults() {
        let tuned = DispatcherConfig::new()
            .with_stream_buffer_size(8)
            .with_sync_execution(SyncExecution::Inline)
            .verbose();
        let reset = DispatcherConfigOverlay {
            stream_buffer_size: Some(DEFAULT_BUFFER_SIZE),
            sync_execution: Some(SyncExecution::Blocking),
            verbose: Some(false),
            ..DispatcherConfigOverlay::new()
        };

        let config = tuned.overlaid(&reset);
        assert_eq!(config.stream_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.sync_execution, SyncExecution::Blocking);
        assert!(!config.verbose);

        let from_full = DispatcherConfigOverlay::from(&DispatcherConfig::new());
        let config = DispatcherConfig::new().with_stream_buffer_size(8).overlaid(&from_full);
        assert_eq!(config, DispatcherConfig::new());
    }

    #[test]
    fn test_overlay_validation() {
        assert!(DispatcherConfigOverlay::new().validate().is_ok());
        let zero = DispatcherConfigOverlay {
            stream_buffer_size: Some(0),
            ..DispatcherConfigOverlay::new()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_load_layered_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("dispatcher.toml");
        let local = dir.path().join("dispatcher.local.toml");
        std::fs::write(&base, "name = \"orders\"\nstream_buffer_size = 8\nverbose = true\n").unwrap();
        DispatcherConfigOverlay {
            stream_buffer_size: Some(DEFAULT_BUFFER_SIZE),
            debug: Some(true),
            ..DispatcherConfigOverlay::new()
        }
        .to_file(&local)
        .unwrap();

        let config = DispatcherConfig::load_layered(&[&base, &local]).unwrap();
        assert_eq!(config.name(), "orders");
        assert_eq!(config.stream_buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.is_verbose());
        assert!(config.is_debug());

        std::fs::write(&local, "stream_buffer_size = 0\n").unwrap();
        assert!(DispatcherConfig::load_layered(&[&base, &local]).is_err());
        assert!(DispatcherConfig::load_layered(&[dir.path().join("missing.toml")]).is_err());
    }

    #[derive(Debug, Clone)]
    struct WorkerConfig {
        max_workers: u32,
    }

    impl Config for WorkerConfig {
        fn name(&self) -> &str {
            "workers"
        }

        fn validate(&self) -> Result<(), String> {
            if self.max_workers == 0 {
                Err("max_workers must be greater than 0".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_custom_config_validation() {
        let valid = WorkerConfig { max_workers: 4 };
        assert!(valid.validate().is_ok());

        let invalid = WorkerConfig { max_workers: 0 };
        assert!(invalid.validate().is_err());
    }
}
