//! Execution handles.
//!
//! A [`Handle`] is the context every operation is submitted through. It is
//! bound to one device queue (stream) and optionally records kernel times.
//!
//! # Thread Safety
//!
//! `Handle` is `Send` but not `Sync`: it can move between threads but only
//! one thread submits through it at a time. Use one handle per concurrent
//! execution context.

use crate::backend::{Backend, RawHandle};
use crate::runtime::Runtime;
use crate::stream::Streamer;
use crate::DnnResult;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// An execution context bound to one stream.
pub struct Handle {
    runtime: Runtime,
    raw: RawHandle,
    stream: Option<Arc<dyn Streamer>>,
    // Opts out of `Sync`.
    _not_sync: PhantomData<Cell<()>>,
}

impl Handle {
    /// Create a handle on the runtime's backend.
    ///
    /// # Panics
    ///
    /// Panics if the backend cannot create an execution context. This is the
    /// one process-fatal failure of the crate; use [`Handle::try_new`] to
    /// handle it instead.
    #[must_use]
    pub fn new(runtime: &Runtime) -> Self {
        match Self::try_new(runtime) {
            Ok(handle) => handle,
            Err(err) => panic!("failed to create {} handle: {err}", runtime.backend().name()),
        }
    }

    /// Create a handle, returning the backend error on failure.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if no context can be created.
    pub fn try_new(runtime: &Runtime) -> DnnResult<Self> {
        let raw = runtime.backend().create_handle()?;
        // Owned from here on: an early return below releases `raw` in `Drop`.
        let handle = Self {
            runtime: runtime.clone(),
            raw,
            stream: None,
            _not_sync: PhantomData,
        };
        if runtime.config().profiling {
            runtime.backend().enable_profiling(raw, true)?;
        }
        tracing::debug!(backend = runtime.backend().name(), handle = raw.as_raw(), "handle created");
        Ok(handle)
    }

    /// Bind the handle to `stream`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn set_stream(&mut self, stream: Arc<dyn Streamer>) -> DnnResult<()> {
        self.backend().set_stream(self.raw, stream.as_raw())?;
        self.stream = Some(stream);
        Ok(())
    }

    /// The stream bound with [`set_stream`](Self::set_stream), if any.
    #[must_use]
    pub fn stream(&self) -> Option<&Arc<dyn Streamer>> {
        self.stream.as_ref()
    }

    /// Native handle of the stream the backend reports.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn raw_stream(&self) -> DnnResult<u64> {
        self.backend().stream(self.raw)
    }

    /// Wait for all work submitted through this handle.
    ///
    /// # Errors
    ///
    /// Returns the stream's error.
    pub fn synchronize(&self) -> DnnResult<()> {
        match &self.stream {
            Some(stream) => stream.sync(),
            None => Ok(()),
        }
    }

    /// Toggle kernel timing.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn enable_profiling(&mut self, enable: bool) -> DnnResult<()> {
        self.backend().enable_profiling(self.raw, enable)
    }

    /// Time of the last kernel in milliseconds, when profiling is enabled.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn kernel_time(&self) -> DnnResult<f32> {
        self.backend().kernel_time(self.raw)
    }

    /// Backend id.
    #[must_use]
    pub const fn raw(&self) -> RawHandle {
        self.raw
    }

    /// Runtime the handle belongs to.
    #[must_use]
    pub const fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.runtime.backend()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Err(err) = self.backend().destroy_handle(self.raw) {
            tracing::warn!(handle = self.raw.as_raw(), "failed to destroy handle: {err}");
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("backend", &self.backend().name())
            .field("raw", &self.raw)
            .field("stream", &self.stream)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FaultyBackend;
    use crate::config::Config;
    use crate::DnnError;
    use crate::stream::HostStream;

    fn assert_send<T: Send>() {}

    #[test]
    fn test_handle_is_send() {
        assert_send::<Handle>();
    }

    #[test]
    fn test_stream_binding() {
        let rt = Runtime::reference();
        let mut handle = Handle::new(&rt);
        assert_eq!(handle.raw_stream().unwrap(), 0);
        assert!(handle.stream().is_none());

        let stream = Arc::new(HostStream::new("compute"));
        let raw = stream.as_raw();
        handle.set_stream(stream).unwrap();
        assert_eq!(handle.raw_stream().unwrap(), raw);
        assert_eq!(handle.stream().unwrap().as_raw(), raw);
        handle.synchronize().unwrap();
    }

    #[test]
    fn test_profiling_default_from_config() {
        let config = Config {
            profiling: true,
            ..Config::default()
        };
        let rt = Runtime::with_backend(
            Arc::new(crate::backend::ReferenceBackend::new()),
            config,
        );
        let handle = Handle::new(&rt);
        assert_eq!(handle.kernel_time().unwrap(), 0.0);
    }

    #[test]
    fn test_failed_profiling_releases_handle() {
        let backend = Arc::new(FaultyBackend::new(true));
        let config = Config {
            profiling: true,
            ..Config::default()
        };
        let rt = Runtime::with_backend(backend.clone(), config);
        assert!(matches!(Handle::try_new(&rt), Err(DnnError::BadParam { .. })));
        assert_eq!(backend.live_handles(), 0);

        let rt = Runtime::with_backend(backend.clone(), Config::default());
        let handle = Handle::try_new(&rt).unwrap();
        assert_eq!(backend.live_handles(), 1);
        drop(handle);
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_handles_are_distinct() {
        let rt = Runtime::reference();
        let a = Handle::new(&rt);
        let b = Handle::new(&rt);
        assert_ne!(a.raw(), b.raw());
    }
}
