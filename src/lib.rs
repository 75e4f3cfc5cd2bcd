//! Throwable assertion failures for test harnesses.
//!
//! An [`AssertionFailure`] carries a message and the source location it was
//! written at. Code under test raises it; a test catches it with
//! [`AssertionFailure::catch_within`] and inspects it, no matter how many
//! frames lie between the two.
//!
//! A failure raised with no enclosing boundary on the current thread aborts
//! the process. Use [`isolate::run`] to observe that from a test.
//!
//! # Example
//!
//! ```
//! use throwable_assertion::{AssertionFailure, raise_assertion};
//!
//! fn checked_div(a: i32, b: i32) -> i32 {
//!     if b == 0 {
//!         raise_assertion!("division by zero: {} / {}", a, b);
//!     }
//!     a / b
//! }
//!
//! let failure = AssertionFailure::catch_within(|| {
//!     checked_div(1, 0);
//! })
//! .unwrap();
//!
//! assert_eq!(failure.message(), "division by zero: 1 / 0");
//! assert_eq!(failure.file(), file!());
//! ```

mod assertion;
pub mod isolate;
mod rt;

pub use assertion::AssertionFailure;

/// Build an [`AssertionFailure`] located at the invocation site.
///
/// Takes `format!` arguments for the message.
#[macro_export]
macro_rules! assertion_failure {
    ($($arg:tt)+) => {
        $crate::AssertionFailure::new(::std::format!($($arg)+), ::std::file!(), ::std::line!())
    };
}

/// Build an [`AssertionFailure`] at the invocation site and raise it.
#[macro_export]
macro_rules! raise_assertion {
    ($($arg:tt)+) => {
        $crate::assertion_failure!($($arg)+).raise()
    };
}
