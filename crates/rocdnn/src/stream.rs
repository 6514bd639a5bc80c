//! Device queues.
//!
//! Work submitted through a [`Handle`](crate::Handle) is enqueued on the
//! stream bound to it. Submissions on one stream execute in order; nothing is
//! ordered across streams.

use crate::DnnResult;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A device queue an operation can be enqueued on.
pub trait Streamer: Send + Sync + fmt::Debug {
    /// Native stream handle; `0` is the device's default stream.
    fn as_raw(&self) -> u64;

    /// Block until all work enqueued on the stream has finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime reports a failure while waiting.
    fn sync(&self) -> DnnResult<()>;
}

static NEXT_HOST_STREAM: AtomicU64 = AtomicU64::new(1);

/// A named stream for backends that execute synchronously on the host.
///
/// Every submission has completed by the time it returns, so
/// [`Streamer::sync`] never waits.
#[derive(Clone, Debug)]
pub struct HostStream {
    handle: u64,
    name: String,
}

impl HostStream {
    /// Create a stream with a fresh non-zero handle.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            handle: NEXT_HOST_STREAM.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        }
    }

    /// The default stream (handle `0`).
    #[must_use]
    pub fn default_stream() -> Self {
        Self {
            handle: 0,
            name: "default".to_string(),
        }
    }

    /// Stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the default stream.
    #[must_use]
    pub const fn is_default(&self) -> bool {
        self.handle == 0
    }
}

impl Streamer for HostStream {
    fn as_raw(&self) -> u64 {
        self.handle
    }

    fn sync(&self) -> DnnResult<()> {
        tracing::trace!(stream = %self.name, "host stream sync");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stream() {
        let stream = HostStream::default_stream();
        assert!(stream.is_default());
        assert_eq!(stream.as_raw(), 0);
        assert!(stream.sync().is_ok());
    }

    #[test]
    fn test_streams_get_distinct_handles() {
        let a = HostStream::new("a");
        let b = HostStream::new("b");
        assert_ne!(a.as_raw(), b.as_raw());
        assert!(!a.is_default());
        assert_eq!(b.name(), "b");
    }
}
