//! # Memory Configuration
//!
//! Page sizing and debug switches, loaded once at startup from TOML.
//!
//! ```toml
//! default_page_size = 65536
//! page_alignment = 16
//! debug_signatures = true
//!
//! [page_sizes]
//! "FrameAllocator" = 1048576
//! "ArrayAllocator<16384>" = 262144
//! ```
//!
//! The configuration must be installed before the first section is leased;
//! sections already handed out keep the page size they were created with.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::align::is_power_of_two;
use crate::error::{MemoryError, MemoryResult};

/// Default page size for sections: 64KB.
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Default page alignment.
pub const DEFAULT_PAGE_ALIGNMENT: usize = 16;

/// Memory system configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Page size for kinds without an override.
    pub default_page_size: usize,
    /// Base alignment of every page.
    pub page_alignment: usize,
    /// Write and check trailing signatures on aligned allocations.
    pub debug_signatures: bool,
    /// Per-kind page size overrides, keyed by the exact kind string.
    pub page_sizes: HashMap<String, usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            page_alignment: DEFAULT_PAGE_ALIGNMENT,
            debug_signatures: true,
            page_sizes: HashMap::new(),
        }
    }
}

impl MemoryConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] on malformed TOML or values
    /// rejected by [`MemoryConfig::validate`].
    pub fn from_toml_str(source: &str) -> MemoryResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| MemoryError::InvalidConfig(format!("Failed to parse memory config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] if the file cannot be read or
    /// parsed.
    pub fn from_file(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::InvalidConfig(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] for zero page sizes and
    /// [`MemoryError::InvalidAlignment`] for a non power-of-two alignment.
    pub fn validate(&self) -> MemoryResult<()> {
        if !is_power_of_two(self.page_alignment) {
            return Err(MemoryError::InvalidAlignment(self.page_alignment));
        }
        if self.default_page_size == 0 {
            return Err(MemoryError::InvalidConfig(
                "default_page_size must be greater than zero".to_string(),
            ));
        }
        if let Some((kind, _)) = self.page_sizes.iter().find(|(_, &size)| size == 0) {
            return Err(MemoryError::InvalidConfig(format!(
                "page size for kind {kind:?} must be greater than zero"
            )));
        }
        Ok(())
    }

    /// Page size used for new sections of `kind`.
    #[must_use]
    pub fn page_size_for(&self, kind: &str) -> usize {
        self.page_sizes
            .get(kind)
            .copied()
            .unwrap_or(self.default_page_size)
    }
}

static CURRENT: RwLock<Option<Arc<MemoryConfig>>> = parking_lot::const_rwlock(None);

/// Installs the process-wide configuration.
///
/// # Errors
///
/// Returns the validation error and leaves the current configuration
/// untouched if `config` is invalid.
pub fn install(config: MemoryConfig) -> MemoryResult<()> {
    config.validate()?;
    tracing::debug!(
        default_page_size = config.default_page_size,
        overrides = config.page_sizes.len(),
        "memory config installed"
    );
    *CURRENT.write() = Some(Arc::new(config));
    Ok(())
}

/// Returns the process-wide configuration (defaults until one is installed).
#[must_use]
pub fn current() -> Arc<MemoryConfig> {
    if let Some(config) = CURRENT.read().as_ref() {
        return Arc::clone(config);
    }
    let mut slot = CURRENT.write();
    Arc::clone(slot.get_or_insert_with(|| Arc::new(MemoryConfig::default())))
}
