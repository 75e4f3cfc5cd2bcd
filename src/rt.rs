//! Boundary tracking and uncaught-failure termination.
//!
//! Every `catch_within` pushes a boundary on the current thread for the
//! duration of its block. `raise` consults the count to decide between
//! unwinding and aborting.

use std::cell::Cell;
use std::io::Write;
use std::sync::OnceLock;

use crate::assertion::AssertionFailure;

/// Environment variable names used by the isolated runner.
pub(crate) const ENV_PHASE: &str = "THROWABLE_PHASE";
pub(crate) const ENV_RUN_ID: &str = "THROWABLE_RUN_ID";
pub(crate) const ENV_RUN_INDEX: &str = "THROWABLE_RUN_INDEX";
pub(crate) const ENV_PRIOR_OUTCOMES: &str = "THROWABLE_PRIOR_OUTCOMES";

/// Marker that starts every uncaught-failure report line.
pub(crate) const REPORT_PREFIX: &str = r#"{"event":"uncaught_assertion""#;

thread_local! {
    /// Number of `catch_within` boundaries active on this thread.
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

static RUNTIME: OnceLock<RuntimeConfig> = OnceLock::new();

/// Role of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Normal process; `isolate::run` spawns children from here.
    Parent,
    /// Spawned by `isolate::run`; runs the isolated block and exits.
    Child,
}

#[derive(Debug)]
pub(crate) struct RuntimeConfig {
    pub(crate) phase: Phase,
    /// Correlates report lines with the spawn that produced them.
    pub(crate) run_id: Option<String>,
    /// Which `isolate::run` call of the test this child executes (1-indexed).
    pub(crate) run_index: usize,
    /// Encoded outcomes of the calls before `run_index`, one per line.
    pub(crate) prior_outcomes: String,
}

fn init_runtime() -> RuntimeConfig {
    let phase = match std::env::var(ENV_PHASE).as_deref() {
        Ok("CHILD") => Phase::Child,
        _ => Phase::Parent,
    };

    let run_id = std::env::var(ENV_RUN_ID).ok().filter(|id| !id.is_empty());

    let run_index = std::env::var(ENV_RUN_INDEX)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1);

    let prior_outcomes = std::env::var(ENV_PRIOR_OUTCOMES).unwrap_or_default();

    RuntimeConfig {
        phase,
        run_id,
        run_index,
        prior_outcomes,
    }
}

/// Returns the cached runtime configuration.
/// Environment variables are read exactly once per process.
#[inline]
pub(crate) fn runtime() -> &'static RuntimeConfig {
    RUNTIME.get_or_init(init_runtime)
}

/// An active catch boundary. Popped on drop, including during unwinding.
pub(crate) struct Boundary {
    _private: (),
}

impl Boundary {
    pub(crate) fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { _private: () }
    }
}

impl Drop for Boundary {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Whether at least one boundary is active on the current thread.
#[inline]
pub(crate) fn is_guarded() -> bool {
    DEPTH.with(|depth| depth.get() > 0)
}

/// Report an uncaught failure and abort the process.
///
/// The report goes straight to the stderr handle, bypassing libtest's output
/// capture, so it survives the abort.
#[cold]
pub(crate) fn abort_uncaught(failure: &AssertionFailure) -> ! {
    let run_id = runtime().run_id.as_deref();
    let line = format_report(run_id, failure);

    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.write_all(b"\n");
    let _ = stderr.flush();
    drop(stderr);

    std::process::abort()
}

/// Render the single-line JSON report for an uncaught failure.
pub(crate) fn format_report(run_id: Option<&str>, failure: &AssertionFailure) -> String {
    let run_id = match run_id {
        Some(id) => format!("\"{}\"", escape(id)),
        None => "null".to_string(),
    };

    format!(
        r#"{},"run_id":{},"message":"{}","file":"{}","line":{}}}"#,
        REPORT_PREFIX,
        run_id,
        escape(failure.message()),
        escape(failure.file()),
        failure.line()
    )
}

/// Parse a report line produced by [`format_report`].
///
/// Returns the run id (if any) and the failure. Lines that are not reports,
/// or are truncated, yield `None`.
pub(crate) fn parse_report(line: &str) -> Option<(Option<String>, AssertionFailure)> {
    let rest = line.strip_prefix(REPORT_PREFIX)?;

    let rest = rest.strip_prefix(r#","run_id":"#)?;
    let (run_id, rest) = match rest.strip_prefix("null") {
        Some(rest) => (None, rest),
        None => {
            let (id, rest) = take_string(rest)?;
            (Some(id), rest)
        }
    };

    let rest = rest.strip_prefix(r#","message":"#)?;
    let (message, rest) = take_string(rest)?;

    let rest = rest.strip_prefix(r#","file":"#)?;
    let (file, rest) = take_string(rest)?;

    let rest = rest.strip_prefix(r#","line":"#)?;
    let digits = rest.strip_suffix('}')?;
    let line = digits.parse().ok()?;

    Some((run_id, AssertionFailure::new(message, file, line)))
}

pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Read a quoted, escaped string from the front of `s`.
/// Returns the unescaped contents and the remainder after the closing quote.
pub(crate) fn take_string(s: &str) -> Option<(String, &str)> {
    let s = s.strip_prefix('"')?;
    let mut out = String::new();
    let mut chars = s.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((out, &s[i + 1..])),
            '\\' => match chars.next()?.1 {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                other => out.push(other),
            },
            c => out.push(c),
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_nests() {
        assert!(!is_guarded());
        {
            let _outer = Boundary::enter();
            assert!(is_guarded());
            {
                let _inner = Boundary::enter();
                assert!(is_guarded());
            }
            assert!(is_guarded());
        }
        assert!(!is_guarded());
    }

    #[test]
    fn test_depth_is_per_thread() {
        let _boundary = Boundary::enter();
        let other = std::thread::spawn(is_guarded).join().unwrap();
        assert!(!other);
        assert!(is_guarded());
    }

    #[test]
    fn test_report_format() {
        let failure = AssertionFailure::new("x must be positive", "validator.src", 42);
        assert_eq!(
            format_report(None, &failure),
            r#"{"event":"uncaught_assertion","run_id":null,"message":"x must be positive","file":"validator.src","line":42}"#
        );
    }

    #[test]
    fn test_report_parse_with_escapes() {
        let failure = AssertionFailure::new("said \"no\"\n\tback\\slash", "C:\\src\\a.rs", 7);
        let line = format_report(Some("abc-123"), &failure);
        assert!(!line.contains('\n'));

        let (run_id, parsed) = parse_report(&line).unwrap();
        assert_eq!(run_id.as_deref(), Some("abc-123"));
        assert_eq!(parsed, failure);
    }

    #[test]
    fn test_report_parse_rejects_other_lines() {
        assert!(parse_report("thread 'main' panicked at src/lib.rs:1:1").is_none());
        assert!(parse_report(r#"{"event":"uncaught_assertion","run_id":null,"message":"cut"#).is_none());
    }

    #[test]
    fn test_runtime_is_cached() {
        let r1 = runtime();
        let r2 = runtime();
        assert!(std::ptr::eq(r1, r2));
    }
}
