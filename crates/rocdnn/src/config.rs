//! Runtime configuration.
//!
//! Configuration is read from a TOML file and then overridden by environment
//! variables:
//!
//! ```toml
//! backend = "auto"        # "auto", "reference" or "miopen"
//! profiling = false
//!
//! [library]
//! miopen = "/opt/rocm/lib/libMIOpen.so"
//! hip = "/opt/rocm/lib/libamdhip64.so"
//!
//! [find]
//! request_count = 4
//! exhaustive = true
//! ```
//!
//! | Variable              | Field                 |
//! |-----------------------|-----------------------|
//! | `ROCDNN_BACKEND`      | `backend`             |
//! | `ROCDNN_MIOPEN_LIB`   | `library.miopen`      |
//! | `ROCDNN_HIP_LIB`      | `library.hip`         |
//! | `ROCDNN_FIND_REQUEST` | `find.request_count`  |
//! | `ROCDNN_PROFILING`    | `profiling`           |

use crate::{DnnError, DnnResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which backend a [`Runtime`](crate::Runtime) should use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The vendor library when it loads, otherwise the reference backend.
    #[default]
    Auto,
    /// Host reference backend.
    Reference,
    /// The vendor library; fails if it cannot be loaded.
    Miopen,
}

impl BackendKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "reference" | "host" => Some(Self::Reference),
            "miopen" | "rocm" => Some(Self::Miopen),
            _ => None,
        }
    }
}

/// Explicit paths to the vendor libraries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Path to `libMIOpen`.
    pub miopen: Option<PathBuf>,
    /// Path to `libamdhip64`.
    pub hip: Option<PathBuf>,
}

/// Convolution algorithm search settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindConfig {
    /// Maximum number of candidates a search returns.
    pub request_count: usize,
    /// Whether the search also benchmarks algorithms the heuristic skips.
    pub exhaustive: bool,
}

impl Default for FindConfig {
    fn default() -> Self {
        Self {
            request_count: 4,
            exhaustive: true,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend selection.
    pub backend: BackendKind,
    /// Library locations.
    pub library: LibraryConfig,
    /// Algorithm search settings.
    pub find: FindConfig,
    /// Whether new handles record kernel times.
    pub profiling: bool,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> DnnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or an invalid request count.
    pub fn parse(content: &str) -> DnnResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an unparseable value.
    pub fn from_env() -> DnnResult<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::InvalidValue`] for an unparseable value.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> DnnResult<Self> {
        const OP: &str = "Config::with_env_overrides";

        if let Some(value) = lookup("ROCDNN_BACKEND") {
            self.backend = BackendKind::parse(&value)
                .ok_or_else(|| DnnError::invalid_value(OP, format!("unknown backend `{value}`")))?;
        }
        if let Some(value) = lookup("ROCDNN_MIOPEN_LIB") {
            self.library.miopen = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("ROCDNN_HIP_LIB") {
            self.library.hip = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("ROCDNN_FIND_REQUEST") {
            self.find.request_count = value.trim().parse().map_err(|_| {
                DnnError::invalid_value(OP, format!("bad request count `{value}`"))
            })?;
        }
        if let Some(value) = lookup("ROCDNN_PROFILING") {
            self.profiling = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> DnnResult<()> {
        if self.find.request_count == 0 {
            return Err(DnnError::invalid_value(
                "Config::validate",
                "find.request_count must be at least 1",
            ));
        }
        Ok(())
    }
}
