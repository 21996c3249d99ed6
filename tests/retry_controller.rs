mod support;

use std::time::Duration;

use distillery_kiosk::error::{BackendError, FetchError};
use distillery_kiosk::request::Request;
use distillery_kiosk::retry::{RetryController, RetryOutcome};
use serde_json::json;
use support::{Attempt, FakeBackend};

fn request(batches: u32) -> Request {
    Request::new(json!({"3": {"inputs": {"seed": 42}}}), batches).unwrap()
}

fn controller(backend: FakeBackend, max_attempts: u32) -> RetryController<FakeBackend> {
    RetryController::new(backend, max_attempts, Duration::ZERO)
}

#[test]
fn first_attempt_success_never_terminates() {
    let mut ctl = controller(FakeBackend::always(Attempt::Images(1)), 2);
    let outcome = ctl.run(&request(1)).unwrap();
    assert_eq!(outcome.images().map(<[_]>::len), Some(1));
    assert_eq!(ctl.backend().connects, 1);
    assert_eq!(ctl.backend().terminates, 0);
}

#[test]
fn every_attempt_failing_terminates_each_time_then_gives_up() {
    let mut ctl = controller(FakeBackend::always(Attempt::GenerateFails), 3);
    let outcome = ctl.run(&request(1)).unwrap();
    match outcome {
        RetryOutcome::Exhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(matches!(
                last_error,
                FetchError::Backend(BackendError::Crashed(_))
            ));
        }
        RetryOutcome::Succeeded(_) => panic!("expected exhaustion"),
    }
    assert_eq!(ctl.backend().connects, 3);
    assert_eq!(ctl.backend().terminates, 3);
    assert_eq!(ctl.backend().generate_calls.get(), 3);
}

#[test]
fn failure_then_success_terminates_once() {
    let backend = FakeBackend::scripted([Attempt::GenerateFails, Attempt::Images(2)]);
    let mut ctl = controller(backend, 2);
    let images = ctl.run(&request(1)).unwrap().into_images().unwrap();
    assert_eq!(images.len(), 2);
    assert_eq!(ctl.backend().connects, 2);
    assert_eq!(ctl.backend().terminates, 1);
    assert_eq!(ctl.backend().terminates_without_session, 0);
}

#[test]
fn connect_failure_counts_as_an_attempt() {
    let backend = FakeBackend::scripted([Attempt::ConnectFails, Attempt::Images(1)]);
    let mut ctl = controller(backend, 2);
    let outcome = ctl.run(&request(1)).unwrap();
    assert!(outcome.images().is_some());
    assert_eq!(ctl.backend().connects, 2);
    assert_eq!(ctl.backend().terminates, 1);
    assert_eq!(ctl.backend().terminates_without_session, 1);
}

#[test]
fn failure_mid_batch_discards_partial_results() {
    // the retry starts over from the first batch
    let backend = FakeBackend::scripted([Attempt::GenerateFails, Attempt::Images(1)]);
    let mut ctl = controller(backend, 2);
    let images = ctl.run(&request(2)).unwrap().into_images().unwrap();
    assert_eq!(images.len(), 2);
    assert_eq!(ctl.backend().generate_calls.get(), 3);
}

#[test]
fn termination_failure_escalates_immediately() {
    let mut backend = FakeBackend::always(Attempt::GenerateFails);
    backend.fail_termination = true;
    let mut ctl = controller(backend, 5);
    let failure = ctl.run(&request(1)).unwrap_err();
    assert!(failure.reason.contains("scripted"));
    assert_eq!(ctl.backend().connects, 1);
    assert_eq!(ctl.backend().terminates, 1);
}

#[test]
fn zero_max_attempts_still_tries_once() {
    let mut ctl = controller(FakeBackend::always(Attempt::GenerateFails), 0);
    assert_eq!(ctl.max_attempts(), 1);
    let outcome = ctl.run(&request(1)).unwrap();
    assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
    assert_eq!(ctl.backend().terminates, 1);
}
