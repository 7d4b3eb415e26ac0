//! Error taxonomy shared by every layer of the crate.

use thiserror::Error;

/// Error type for all camera, stream, frame and registry operations.
///
/// Driver failures that do not map onto one of the named kinds are passed
/// through unchanged as [`Error::Driver`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A caller-supplied argument is invalid (zero size, bad alignment, empty id).
    #[error("bad parameter: {0}")]
    BadParameter(String),
    /// The device or stream is not open.
    #[error("device not open")]
    DeviceNotOpen,
    /// The requested metadata or feature is not available.
    #[error("not available: {0}")]
    NotAvailable(String),
    /// A lookup, unregistration or revoke targeted something that is not tracked.
    #[error("not found: {0}")]
    NotFound(String),
    /// A caller-provided destination is too small.
    #[error("destination too small, {required} bytes required")]
    MoreData {
        /// Number of bytes the destination must hold.
        required: usize,
    },
    /// The call is not valid in the current state.
    #[error("invalid call: {0}")]
    InvalidCall(String),
    /// The operation was already performed.
    #[error("already done: {0}")]
    Already(String),
    /// Allocation or resource acquisition failed.
    #[error("insufficient resources: {0}")]
    Resources(String),
    /// A synchronization primitive failed or an invariant was broken.
    #[error("internal fault: {0}")]
    InternalFault(String),
    /// The owning transport layer of an interface or camera vanished.
    #[error("transport layer not found: {0}")]
    TlNotFound(String),
    /// A wait expired before the awaited event happened.
    #[error("operation timed out")]
    Timeout,
    /// Driver-specific failure passed through unchanged.
    #[error("driver error {code}: {message}")]
    Driver {
        /// Driver status code.
        code: i32,
        /// Human-readable driver message.
        message: String,
    },
}

impl Error {
    /// Returns `true` for [`Error::Already`], which teardown sequences treat as success.
    pub const fn is_already(&self) -> bool {
        matches!(self, Self::Already(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Driver {
            code: err.raw_os_error().unwrap_or(-1),
            message: err.to_string(),
        }
    }
}

/// Result type for all crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a batch operation that keeps going after individual failures.
///
/// Counts successful steps and remembers the first failure so it can be
/// reported once every step has run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Number of steps that succeeded.
    pub completed: usize,
    /// First failure observed, if any.
    pub first_error: Option<Error>,
}

impl BatchOutcome {
    /// Create an empty outcome.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            completed: 0,
            first_error: None,
        }
    }

    /// Record the result of one step.
    ///
    /// Returns `true` when the step succeeded.
    pub fn record<T>(&mut self, result: Result<T>) -> bool {
        match result {
            Ok(_) => {
                self.completed += 1;
                true
            }
            Err(err) => {
                if self.first_error.is_none() {
                    self.first_error = Some(err);
                }
                false
            }
        }
    }

    /// Record the result of one step, handing back its value on success.
    pub fn keep<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.completed += 1;
                Some(value)
            }
            Err(err) => {
                self.record::<()>(Err(err));
                None
            }
        }
    }

    /// Record a step whose [`Error::Already`] outcome counts as success.
    pub fn record_tolerant(&mut self, result: Result<()>) -> bool {
        match result {
            Err(err) if err.is_already() => self.record(Ok(())),
            other => self.record(other),
        }
    }

    /// Returns `true` if no step failed.
    pub const fn is_clean(&self) -> bool {
        self.first_error.is_none()
    }

    /// Collapse into a plain result carrying the first failure.
    pub fn into_result(self) -> Result<()> {
        self.first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_outcome_keeps_first_error() {
        let mut outcome = BatchOutcome::new();
        assert!(outcome.record(Ok(())));
        assert!(!outcome.record::<()>(Err(Error::Timeout)));
        assert!(!outcome.record::<()>(Err(Error::DeviceNotOpen)));
        assert!(outcome.record(Ok(())));

        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.first_error, Some(Error::Timeout));
        assert_eq!(outcome.into_result(), Err(Error::Timeout));
    }

    #[test]
    fn test_batch_outcome_tolerates_already() {
        let mut outcome = BatchOutcome::new();
        outcome.record_tolerant(Err(Error::Already("capture ended".to_owned())));
        assert!(outcome.is_clean());
        assert_eq!(outcome.completed, 1);

        outcome.record_tolerant(Err(Error::InvalidCall("closed".to_owned())));
        assert!(!outcome.is_clean());
    }

    #[test]
    fn test_io_error_maps_to_driver() {
        let err = Error::from(std::io::Error::from_raw_os_error(16));
        assert!(matches!(err, Error::Driver { code: 16, .. }));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::MoreData { required: 64 }.to_string(),
            "destination too small, 64 bytes required"
        );
        assert_eq!(Error::Timeout.to_string(), "operation timed out");
    }
}
