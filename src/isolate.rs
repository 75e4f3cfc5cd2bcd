//! Isolated runner: observe process-terminating failures from a test.
//!
//! An uncaught [`AssertionFailure`] aborts the process, which a test cannot
//! observe in-process. [`run()`] re-executes the current test binary filtered
//! to the calling test, runs the block in that child, and reports how the
//! child ended.
//!
//! A test may call [`run()`] several times. Calls are numbered per test
//! thread; the child for call N replays the outcomes of calls 1..N seen by
//! the parent, runs only block N, and exits.
//!
//! # Example
//!
//! ```ignore
//! use throwable_assertion::{AssertionFailure, isolate::{self, Outcome}};
//!
//! #[test]
//! fn uncaught_failure_aborts() {
//!     let outcome = isolate::run(|| {
//!         AssertionFailure::new("boom", "here.rs", 3).raise();
//!     });
//!     assert!(matches!(outcome, Outcome::Aborted(Some(_))));
//! }
//! ```

use std::cell::{Cell, RefCell};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use uuid::Uuid;

use crate::assertion::AssertionFailure;
use crate::rt::{self, ENV_PHASE, ENV_PRIOR_OUTCOMES, ENV_RUN_ID, ENV_RUN_INDEX, Phase, runtime};

/// Marker that starts the line a child writes just before running its block.
const START_PREFIX: &str = r#"{"event":"isolated_start""#;

thread_local! {
    /// Number of `run` calls made on this thread so far.
    static RUN_COUNTER: Cell<usize> = const { Cell::new(0) };
    /// Outcomes the parent observed for this thread's earlier calls.
    static HISTORY: RefCell<Vec<Outcome>> = const { RefCell::new(Vec::new()) };
}

/// How an isolated child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The block returned and the child exited with status 0.
    Completed,
    /// The child aborted. Carries the uncaught failure when its report was
    /// found on the child's stderr.
    Aborted(Option<AssertionFailure>),
    /// The child exited with a non-zero code without an abort,
    /// e.g. 101 when an ordinary panic escaped the test.
    Failed(i32),
    /// The child exited without ever reaching the block, e.g. because the
    /// calling test's name could not be matched in the child.
    NotRun,
    /// No child could be started.
    NotSpawned(String),
    /// The child started but its exit status could not be collected.
    Lost(String),
}

impl Outcome {
    /// The uncaught failure, if the child aborted with one.
    pub fn uncaught(&self) -> Option<&AssertionFailure> {
        match self {
            Outcome::Aborted(failure) => failure.as_ref(),
            _ => None,
        }
    }
}

/// Run `block` in a child process and report how that process ended.
///
/// Must be called from the thread of a libtest `#[test]` function: the child
/// is the same test binary invoked with `--exact <test name>`. Called from
/// any other thread, the child finds no such test and the result is
/// [`Outcome::NotRun`].
///
/// Inside the child, the call being isolated runs `block` and then exits the
/// process with status 0, so it never returns there.
pub fn run<F>(block: F) -> Outcome
where
    F: FnOnce(),
{
    let index = RUN_COUNTER.with(|counter| {
        let current = counter.get() + 1;
        counter.set(current);
        current
    });

    let config = runtime();

    match config.phase {
        Phase::Child => run_in_child(index, block),
        Phase::Parent => {
            let prior = HISTORY.with(|history| encode_outcomes(&history.borrow()));
            let outcome = spawn_isolated(index, &prior);
            HISTORY.with(|history| history.borrow_mut().push(outcome.clone()));
            outcome
        }
    }
}

fn run_in_child<F>(index: usize, block: F) -> Outcome
where
    F: FnOnce(),
{
    let config = runtime();

    if index != config.run_index {
        // Earlier calls replay what the parent saw. Later calls are never
        // reached since the target call exits.
        return decode_outcomes(&config.prior_outcomes)
            .and_then(|prior| prior.into_iter().nth(index - 1))
            .unwrap_or(Outcome::NotRun);
    }

    announce_start(config.run_id.as_deref());
    block();
    std::process::exit(0);
}

/// Tell the parent the block is about to run.
fn announce_start(run_id: Option<&str>) {
    let line = format_start(run_id.unwrap_or_default());

    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.write_all(b"\n");
    let _ = stderr.flush();
}

fn format_start(run_id: &str) -> String {
    format!(r#"{},"run_id":"{}"}}"#, START_PREFIX, rt::escape(run_id))
}

fn parse_start(line: &str) -> Option<String> {
    let rest = line.strip_prefix(START_PREFIX)?;
    let rest = rest.strip_prefix(r#","run_id":"#)?;
    let (run_id, rest) = rt::take_string(rest)?;
    (rest == "}").then_some(run_id)
}

fn spawn_isolated(index: usize, prior: &str) -> Outcome {
    let exe = match std::env::current_exe() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("[throwable] error: cannot find current executable: {}", e);
            return Outcome::NotSpawned(e.to_string());
        }
    };

    let Some(test_name) = extract_test_name() else {
        eprintln!("[throwable] error: cannot determine the calling test's name");
        return Outcome::NotSpawned("unknown test name".to_string());
    };

    let run_id = Uuid::new_v4().to_string();
    spawn_child(&exe, &test_name, &run_id, index, prior)
}

/// Spawn the child in CHILD phase and collect its outcome.
fn spawn_child(exe: &Path, test_name: &str, run_id: &str, index: usize, prior: &str) -> Outcome {
    let mut cmd = Command::new(exe);

    cmd.env(ENV_PHASE, "CHILD");
    cmd.env(ENV_RUN_ID, run_id);
    cmd.env(ENV_RUN_INDEX, index.to_string());
    cmd.env(ENV_PRIOR_OUTCOMES, prior);

    cmd.arg("--exact");
    cmd.arg(test_name);
    cmd.arg("--test-threads=1");

    // Capture stderr to find the start marker and uncaught report
    cmd.stderr(Stdio::piped());
    cmd.stdout(Stdio::null());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[throwable] error: cannot spawn child: {}", e);
            return Outcome::NotSpawned(e.to_string());
        }
    };

    let stderr = child.stderr.take();
    let log = stderr
        .map(|stderr| read_child_log(stderr, run_id))
        .unwrap_or_default();

    let status = match child.wait() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[throwable] error: cannot wait for child: {}", e);
            return Outcome::Lost(e.to_string());
        }
    };

    if !log.started {
        eprintln!(
            "[throwable] child for {} exited without running the block (call {})",
            test_name, index
        );
    }

    interpret_exit_status(status, log)
}

/// What the parent learned from one child's stderr.
#[derive(Debug, Default, PartialEq, Eq)]
struct ChildLog {
    /// The start marker tagged with our run id was seen.
    started: bool,
    report: Option<AssertionFailure>,
}

/// Scan the child's stderr for the lines tagged with `run_id`.
///
/// Reads to the end so the child never blocks on a full pipe. Other lines
/// are passed through to our own stderr.
fn read_child_log(stderr: impl Read, run_id: &str) -> ChildLog {
    let reader = BufReader::new(stderr);
    let mut log = ChildLog::default();

    for line in reader.lines().map_while(Result::ok) {
        if parse_start(&line).is_some_and(|id| id == run_id) {
            log.started = true;
            continue;
        }

        match rt::parse_report(&line) {
            Some((Some(id), failure)) if id == run_id && log.report.is_none() => {
                log.report = Some(failure);
            }
            _ => eprintln!("[throwable] child: {}", line),
        }
    }

    log
}

fn interpret_exit_status(status: ExitStatus, log: ChildLog) -> Outcome {
    if !log.started {
        return Outcome::NotRun;
    }

    if status.success() {
        return Outcome::Completed;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal()
            && signal == libc::SIGABRT
        {
            return Outcome::Aborted(log.report);
        }
    }

    if log.report.is_some() {
        // Abort on a platform without signals.
        return Outcome::Aborted(log.report);
    }

    Outcome::Failed(status.code().unwrap_or(-1))
}

/// Encode outcomes one per line for the child's environment.
fn encode_outcomes(outcomes: &[Outcome]) -> String {
    let lines: Vec<String> = outcomes
        .iter()
        .map(|outcome| match outcome {
            Outcome::Completed => "completed".to_string(),
            Outcome::Aborted(None) => "aborted".to_string(),
            Outcome::Aborted(Some(failure)) => {
                format!("aborted {}", rt::format_report(None, failure))
            }
            Outcome::Failed(code) => format!("failed {}", code),
            Outcome::NotRun => "not_run".to_string(),
            Outcome::NotSpawned(reason) => format!("not_spawned \"{}\"", rt::escape(reason)),
            Outcome::Lost(reason) => format!("lost \"{}\"", rt::escape(reason)),
        })
        .collect();

    lines.join("\n")
}

/// Decode [`encode_outcomes`] output. Any malformed line yields `None`.
fn decode_outcomes(encoded: &str) -> Option<Vec<Outcome>> {
    if encoded.is_empty() {
        return Some(Vec::new());
    }

    encoded.lines().map(decode_outcome).collect()
}

fn decode_outcome(line: &str) -> Option<Outcome> {
    let (kind, rest) = line.split_once(' ').unwrap_or((line, ""));

    match (kind, rest) {
        ("completed", "") => Some(Outcome::Completed),
        ("aborted", "") => Some(Outcome::Aborted(None)),
        ("aborted", report) => {
            let (_, failure) = rt::parse_report(report)?;
            Some(Outcome::Aborted(Some(failure)))
        }
        ("failed", code) => code.parse().ok().map(Outcome::Failed),
        ("not_run", "") => Some(Outcome::NotRun),
        ("not_spawned", reason) => Some(Outcome::NotSpawned(whole_string(reason)?)),
        ("lost", reason) => Some(Outcome::Lost(whole_string(reason)?)),
        _ => None,
    }
}

fn whole_string(s: &str) -> Option<String> {
    let (value, rest) = rt::take_string(s)?;
    rest.is_empty().then_some(value)
}

/// Name of the running libtest test.
///
/// libtest names each test thread after its test. Falls back to the first
/// positional argument when tests run on the main thread.
fn extract_test_name() -> Option<String> {
    match std::thread::current().name() {
        Some(name) if name != "main" => return Some(name.to_string()),
        _ => {}
    }

    std::env::args()
        .skip(1)
        .find(|arg| !arg.starts_with('-'))
}
