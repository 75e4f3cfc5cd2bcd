//! The assertion failure value and its raise/catch pair.

use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::rt::{self, Boundary};

/// An assertion that did not hold, with the source location it was written at.
///
/// The value is immutable once built. It travels from [`raise()`] to the
/// nearest enclosing [`catch_within()`] as an unwinding payload.
///
/// The location is supplied by the caller; nothing here inspects the call
/// stack. Use [`assertion_failure!`] to fill it from `file!()` and `line!()`.
///
/// [`raise()`]: AssertionFailure::raise
/// [`catch_within()`]: AssertionFailure::catch_within
/// [`assertion_failure!`]: crate::assertion_failure
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssertionFailure {
    message: String,
    file: String,
    line: u32,
}

impl AssertionFailure {
    /// Create a failure. Any values are accepted, including empty strings.
    pub fn new(message: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            file: file.into(),
            line,
        }
    }

    /// What went wrong.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Source path the assertion was authored in.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Source line the assertion was authored at.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Returns `true` if a [`catch_within()`] boundary is active on this thread,
    /// meaning [`raise()`] would be intercepted rather than abort the process.
    ///
    /// [`raise()`]: AssertionFailure::raise
    /// [`catch_within()`]: AssertionFailure::catch_within
    pub fn is_catchable() -> bool {
        rt::is_guarded()
    }

    /// Raise this failure.
    ///
    /// Control transfers to the nearest enclosing [`catch_within()`] on the
    /// current thread. Every frame in between is abandoned; none of the code
    /// after the raise point in those frames runs.
    ///
    /// If no boundary is active on this thread the failure is uncaught: a
    /// one-line report is written to stderr and the process aborts. An
    /// assertion nobody expected to catch is a programming error.
    ///
    /// Frames that are unwound get no cleanup guarantee from this contract.
    /// Do not rely on resources held by them being released.
    ///
    /// The panic hook is not invoked, so a caught failure prints nothing.
    ///
    /// [`catch_within()`]: AssertionFailure::catch_within
    pub fn raise(self) -> ! {
        if !rt::is_guarded() {
            rt::abort_uncaught(&self);
        }
        panic::resume_unwind(Box::new(self))
    }

    /// Run `block` and return the failure raised inside it, if any.
    ///
    /// Returns `None` when `block` completes normally. Only the first raise is
    /// observed, since nothing after it executes.
    ///
    /// Panics that are not an [`AssertionFailure`] keep propagating; they are
    /// never swallowed by this boundary.
    ///
    /// # Example
    ///
    /// ```
    /// use throwable_assertion::AssertionFailure;
    ///
    /// let caught = AssertionFailure::catch_within(|| {
    ///     AssertionFailure::new("x must be positive", "validator.src", 42).raise();
    /// });
    ///
    /// let failure = caught.unwrap();
    /// assert_eq!(failure.message(), "x must be positive");
    /// assert_eq!(failure.file(), "validator.src");
    /// assert_eq!(failure.line(), 42);
    /// ```
    pub fn catch_within<F>(block: F) -> Option<Self>
    where
        F: FnOnce(),
    {
        Self::catch(block).err()
    }

    /// Like [`catch_within()`], for blocks that produce a value.
    ///
    /// [`catch_within()`]: AssertionFailure::catch_within
    pub fn catch<F, R>(block: F) -> Result<R, Self>
    where
        F: FnOnce() -> R,
    {
        let result = {
            let _boundary = Boundary::enter();
            panic::catch_unwind(AssertUnwindSafe(block))
        };

        match result {
            Ok(value) => Ok(value),
            Err(payload) => match payload.downcast::<Self>() {
                Ok(failure) => Err(*failure),
                Err(other) => panic::resume_unwind(other),
            },
        }
    }
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.message, self.file, self.line)
    }
}

impl Error for AssertionFailure {}
