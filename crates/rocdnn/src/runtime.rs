//! Runtime initialization and backend selection.
//!
//! A [`Runtime`] is the process-level entry point: it owns the backend every
//! descriptor, handle and plan is created from. Cloning is cheap and shares
//! the backend.
//!
//! ```rust,ignore
//! // Host reference backend, always available
//! let rt = Runtime::reference();
//!
//! // Backend chosen by configuration (vendor library when it loads)
//! let rt = Runtime::init(&Config::from_env()?)?;
//! ```

use crate::backend::{Backend, DescriptorKind, RawDescriptor, ReferenceBackend};
use crate::config::{BackendKind, Config};
#[cfg(not(feature = "rocm"))]
use crate::DnnError;
use crate::DnnResult;
use std::fmt;
use std::sync::Arc;

/// Shared access to one backend.
#[derive(Clone)]
pub struct Runtime {
    backend: Arc<dyn Backend>,
    config: Arc<Config>,
}

impl Runtime {
    /// A runtime over a fresh [`ReferenceBackend`] with default settings.
    #[must_use]
    pub fn reference() -> Self {
        Self::with_backend(Arc::new(ReferenceBackend::new()), Config::default())
    }

    /// A runtime over an explicit backend.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn Backend>, config: Config) -> Self {
        tracing::debug!(backend = backend.name(), "runtime created");
        Self {
            backend,
            config: Arc::new(config),
        }
    }

    /// Initialize the backend `config` selects.
    ///
    /// With [`BackendKind::Auto`] the vendor library is tried first and the
    /// reference backend is used when it cannot be loaded.
    ///
    /// # Errors
    ///
    /// Returns [`DnnError::BackendUnavailable`](crate::DnnError::BackendUnavailable)
    /// when [`BackendKind::Miopen`] is requested and the library cannot be
    /// loaded or initialized.
    pub fn init(config: &Config) -> DnnResult<Self> {
        match config.backend {
            BackendKind::Reference => Ok(Self::with_backend(
                Arc::new(ReferenceBackend::new()),
                config.clone(),
            )),
            BackendKind::Miopen => Self::init_miopen(config),
            BackendKind::Auto => Self::init_miopen(config).or_else(|err| {
                tracing::info!("vendor library unavailable ({err}), using reference backend");
                Ok(Self::with_backend(
                    Arc::new(ReferenceBackend::new()),
                    config.clone(),
                ))
            }),
        }
    }

    #[cfg(feature = "rocm")]
    fn init_miopen(config: &Config) -> DnnResult<Self> {
        let backend = crate::backend::miopen::MiopenBackend::load(&config.library)?;
        Ok(Self::with_backend(Arc::new(backend), config.clone()))
    }

    #[cfg(not(feature = "rocm"))]
    fn init_miopen(_config: &Config) -> DnnResult<Self> {
        Err(DnnError::BackendUnavailable(
            "built without the `rocm` feature".to_string(),
        ))
    }

    /// The backend.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// The configuration the runtime was created with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether two runtimes share one backend.
    #[must_use]
    pub fn same_backend(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

/// A backend descriptor destroyed when dropped.
pub(crate) struct OwnedDescriptor {
    runtime: Runtime,
    raw: RawDescriptor,
    kind: DescriptorKind,
}

impl OwnedDescriptor {
    pub(crate) fn create(runtime: &Runtime, kind: DescriptorKind) -> DnnResult<Self> {
        let raw = runtime.backend().create_descriptor(kind)?;
        Ok(Self {
            runtime: runtime.clone(),
            raw,
            kind,
        })
    }

    pub(crate) const fn raw(&self) -> RawDescriptor {
        self.raw
    }

    pub(crate) const fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.runtime.backend()
    }
}

impl Drop for OwnedDescriptor {
    fn drop(&mut self) {
        if let Err(err) = self.runtime.backend().destroy_descriptor(self.kind, self.raw) {
            tracing::warn!(kind = ?self.kind, "failed to destroy descriptor: {err}");
        }
    }
}

impl fmt::Debug for OwnedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedDescriptor")
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_runtime() {
        let rt = Runtime::reference();
        assert_eq!(rt.backend().name(), "reference");
        assert!(rt.same_backend(&rt.clone()));
        assert!(!rt.same_backend(&Runtime::reference()));
    }

    #[test]
    fn test_init_reference() {
        let config = Config {
            backend: BackendKind::Reference,
            ..Config::default()
        };
        let rt = Runtime::init(&config).unwrap();
        assert_eq!(rt.backend().name(), "reference");
    }

    #[test]
    fn test_init_auto_falls_back() {
        let config = Config {
            library: crate::config::LibraryConfig {
                miopen: Some("/nonexistent/libMIOpen.so".into()),
                hip: Some("/nonexistent/libamdhip64.so".into()),
            },
            ..Config::default()
        };
        let rt = Runtime::init(&config).unwrap();
        assert_eq!(rt.backend().name(), "reference");
    }

    #[test]
    fn test_init_miopen_unavailable() {
        let config = Config {
            backend: BackendKind::Miopen,
            library: crate::config::LibraryConfig {
                miopen: Some("/nonexistent/libMIOpen.so".into()),
                hip: Some("/nonexistent/libamdhip64.so".into()),
            },
            ..Config::default()
        };
        let err = Runtime::init(&config).unwrap_err();
        assert!(matches!(err, crate::DnnError::BackendUnavailable(_)));
    }

    #[test]
    fn test_owned_descriptor_released() {
        let rt = Runtime::reference();
        let desc = OwnedDescriptor::create(&rt, DescriptorKind::Tensor).unwrap();
        let raw = desc.raw();
        drop(desc);
        assert!(rt.backend().tensor_num_bytes(raw).is_err());
    }
}
