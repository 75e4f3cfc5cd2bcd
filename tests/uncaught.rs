//! Process-level behavior, observed through child processes.

use throwable_assertion::isolate::{self, Outcome};
use throwable_assertion::{AssertionFailure, raise_assertion};

#[test]
fn uncaught_raise_aborts_the_process() {
    let outcome = isolate::run(|| {
        AssertionFailure::new("x must be positive", "validator.src", 42).raise();
    });

    assert_eq!(
        outcome,
        Outcome::Aborted(Some(AssertionFailure::new(
            "x must be positive",
            "validator.src",
            42
        )))
    );
}

#[test]
fn report_survives_awkward_messages() {
    let outcome = isolate::run(|| {
        AssertionFailure::new("line one\nsaid \"two\" \\ three", "odd path.rs", 0).raise();
    });

    let failure = outcome.uncaught().expect("child should report the failure");
    assert_eq!(failure.message(), "line one\nsaid \"two\" \\ three");
    assert_eq!(failure.file(), "odd path.rs");
    assert_eq!(failure.line(), 0);
}

#[test]
fn caught_raise_lets_the_process_finish() {
    let outcome = isolate::run(|| {
        let caught = AssertionFailure::catch_within(|| raise_assertion!("handled"));
        assert!(caught.is_some());
    });

    assert_eq!(outcome, Outcome::Completed);
}

#[test]
fn raise_after_boundary_exits_is_uncaught() {
    let outcome = isolate::run(|| {
        AssertionFailure::catch_within(|| {});
        AssertionFailure::new("too late", "late.rs", 8).raise();
    });

    assert_eq!(
        outcome.uncaught(),
        Some(&AssertionFailure::new("too late", "late.rs", 8))
    );
}

#[test]
fn boundary_on_another_thread_does_not_catch() {
    let outcome = isolate::run(|| {
        AssertionFailure::catch_within(|| {
            let _ = std::thread::spawn(|| {
                AssertionFailure::new("wrong thread", "thread.rs", 1).raise();
            })
            .join();
        });
    });

    assert!(matches!(outcome, Outcome::Aborted(Some(ref f)) if f.message() == "wrong thread"));
}

#[test]
fn ordinary_panic_fails_without_aborting() {
    let outcome = isolate::run(|| {
        AssertionFailure::catch_within(|| panic!("regular panic"));
    });

    assert_eq!(outcome, Outcome::Failed(101));
}

#[test]
fn each_run_call_isolates_its_own_block() {
    let first = isolate::run(|| {});
    assert_eq!(first, Outcome::Completed);

    let second = isolate::run(|| {
        AssertionFailure::new("second", "s.rs", 2).raise();
    });
    assert_eq!(second.uncaught(), Some(&AssertionFailure::new("second", "s.rs", 2)));

    let third = isolate::run(|| {});
    assert_eq!(third, Outcome::Completed);
}

#[test]
fn earlier_outcomes_are_replayed_in_later_children() {
    let first = isolate::run(|| panic!("first block fails"));
    assert_eq!(first, Outcome::Failed(101));

    let second = isolate::run(|| {
        raise_assertion!("after a failed run");
    });
    assert_eq!(
        second.uncaught().map(AssertionFailure::message),
        Some("after a failed run")
    );
}

#[test]
fn run_off_the_test_thread_reports_not_run() {
    let outcome = std::thread::Builder::new()
        .name("worker".to_string())
        .spawn(|| {
            isolate::run(|| {
                AssertionFailure::new("never reached", "worker.rs", 1).raise();
            })
        })
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(outcome, Outcome::NotRun);
}
