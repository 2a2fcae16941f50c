use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::internal::allocator::AllocationRequest;
use crate::internal::common::ids::JobId;
use crate::internal::controller::{
    Controller, ControllerConfig, JobDescription, JobState, WhereIsQuery,
};
use crate::internal::tests::utils::bmp::{BmpCommand, ScriptedConnector};
use crate::internal::tests::utils::machine::{
    MachineBuilder, any_board, simple_machine, triads,
};
use crate::internal::tests::utils::wait_until;

fn create_controller(seconds_before_free: f64) -> (Controller, Arc<ScriptedConnector>) {
    let connector = ScriptedConnector::new();
    let config = ControllerConfig {
        max_retired_jobs: 100,
        seconds_before_free,
        bmp_retry_delay: Duration::ZERO,
    };
    (Controller::new(config, connector.clone()), connector)
}

fn create_job(controller: &Controller, request: AllocationRequest) -> JobId {
    controller
        .create_job(JobDescription::new("a", request), Some("10.0.0.1"))
        .unwrap()
}

fn state(controller: &Controller, job_id: JobId) -> JobState {
    controller.get_job_state(job_id, None).state
}

fn wait_for_state(controller: &Controller, job_id: JobId, expected: JobState) {
    wait_until(|| state(controller, job_id) == expected);
}

fn shutdown(controller: &Controller) {
    controller.stop();
    controller.join();
}

#[test]
fn test_basic_queue_and_run() {
    let (controller, _connector) = create_controller(0.0);
    controller
        .set_machines(vec![simple_machine("m", 1, 2)])
        .unwrap();

    let first = create_job(&controller, any_board());
    wait_for_state(&controller, first, JobState::Ready);
    let second = create_job(&controller, triads(1, 2));
    assert_eq!(state(&controller, second), JobState::Queued);
    let third = create_job(&controller, triads(2, 2));
    let info = controller.get_job_state(third, None);
    assert_eq!(info.state, JobState::Destroyed);
    assert_eq!(
        info.reason.as_deref(),
        Some("Cancelled: No suitable machines available.")
    );

    controller.destroy_job(first, None, None);
    assert_eq!(state(&controller, first), JobState::Destroyed);
    // Placed as soon as the freed board is powered off
    wait_for_state(&controller, second, JobState::Ready);
    let info = controller.get_job_machine_info(second, None).unwrap();
    assert_eq!(info.boards.len(), 6);
    assert_eq!(info.machine_name, "m");
    shutdown(&controller);
}

#[test]
fn test_keepalive_timeout() {
    let (controller, _connector) = create_controller(0.0);
    controller
        .set_machines(vec![simple_machine("m", 1, 1)])
        .unwrap();
    let mut description = JobDescription::new("a", any_board());
    description.keepalive = Some(0.1);
    let short = controller.create_job(description, None).unwrap();
    let mut description = JobDescription::new("a", any_board());
    description.keepalive = None;
    let forever = controller.create_job(description, None).unwrap();
    wait_for_state(&controller, short, JobState::Ready);
    wait_for_state(&controller, forever, JobState::Ready);

    std::thread::sleep(Duration::from_millis(150));
    controller.destroy_timed_out_jobs();
    let info = controller.get_job_state(short, None);
    assert_eq!(info.state, JobState::Destroyed);
    assert_eq!(info.reason.as_deref(), Some("Job timed out."));
    assert_eq!(state(&controller, forever), JobState::Ready);
    shutdown(&controller);
}

#[test]
fn test_delayed_free() {
    let (controller, _connector) = create_controller(0.1);
    controller
        .set_machines(vec![simple_machine("m", 1, 2)])
        .unwrap();
    let first = create_job(&controller, triads(1, 2));
    wait_for_state(&controller, first, JobState::Ready);
    controller.destroy_job(first, Some("done".to_string()), None);

    let second = create_job(&controller, triads(1, 2));
    assert_eq!(state(&controller, second), JobState::Queued);
    wait_until(|| {
        controller.check_free();
        state(&controller, second) == JobState::Ready
    });
    shutdown(&controller);
}

#[test]
fn test_machine_removal_destroys_jobs() {
    let (controller, _connector) = create_controller(0.0);
    controller
        .set_machines(vec![simple_machine("m0", 1, 2), simple_machine("m1", 1, 2)])
        .unwrap();
    let mut description = JobDescription::new("a", any_board());
    description.machine = Some("m0".to_string());
    let job0 = controller.create_job(description, None).unwrap();
    let mut description = JobDescription::new("a", any_board());
    description.machine = Some("m1".to_string());
    let job1 = controller.create_job(description, None).unwrap();
    wait_for_state(&controller, job0, JobState::Ready);
    wait_for_state(&controller, job1, JobState::Ready);
    controller.changed_jobs();
    controller.changed_machines();

    controller
        .set_machines(vec![simple_machine("m1", 1, 2)])
        .unwrap();
    let info = controller.get_job_state(job0, None);
    assert_eq!(info.state, JobState::Destroyed);
    assert_eq!(info.reason.as_deref(), Some("Machine removed."));
    assert_eq!(state(&controller, job1), JobState::Ready);
    assert_eq!(controller.changed_jobs(), BTreeSet::from([job0]));
    assert_eq!(
        controller.changed_machines(),
        BTreeSet::from(["m0".to_string()])
    );
    assert!(controller.changed_jobs().is_empty());
    assert_eq!(
        controller
            .list_machines()
            .into_iter()
            .map(|m| m.name)
            .collect::<Vec<_>>(),
        vec!["m1".to_string()]
    );
    shutdown(&controller);
}

#[test]
fn test_torus_requirement() {
    let (controller, _connector) = create_controller(0.0);
    controller
        .set_machines(vec![simple_machine("m", 2, 1)])
        .unwrap();
    let mut request = triads(2, 1);
    request.require_torus = true;
    let torus = create_job(&controller, request);
    wait_for_state(&controller, torus, JobState::Ready);

    let mut request = triads(1, 1);
    request.require_torus = true;
    let small = create_job(&controller, request);
    assert_eq!(state(&controller, small), JobState::Destroyed);
    shutdown(&controller);
}

#[test]
fn test_where_is_round_trip() {
    let (controller, _connector) = create_controller(0.0);
    controller
        .set_machines(vec![
            MachineBuilder::new("m", 4, 2).dead_board((2, 1, 0)).build(),
        ])
        .unwrap();
    let numbers = |pairs: &[(&str, i64)]| -> BTreeMap<String, i64> {
        pairs.iter().map(|&(k, v)| (k.to_string(), v)).collect()
    };
    let query = WhereIsQuery::from_named(
        Some("m".to_string()),
        None,
        &numbers(&[("x", 3), ("y", 1), ("z", 2)]),
    )
    .unwrap();
    let found = controller.where_is(&query).unwrap();
    let (cabinet, frame, board) = found.physical;
    let query = WhereIsQuery::from_named(
        Some("m".to_string()),
        None,
        &numbers(&[
            ("cabinet", cabinet as i64),
            ("frame", frame as i64),
            ("board", board as i64),
        ]),
    )
    .unwrap();
    assert_eq!(controller.where_is(&query).unwrap().logical, (3, 1, 2));

    let query = WhereIsQuery::Physical {
        machine: "m".to_string(),
        cabinet: 2,
        frame: 1,
        board: 0,
    };
    assert_eq!(controller.where_is(&query), None);

    assert_eq!(controller.get_board_position("m", (3, 1, 2)), Some((3, 1, 2)));
    assert_eq!(controller.get_board_at_position("m", (1, 0, 2)), Some((1, 0, 2)));
    assert_eq!(controller.get_board_position("nope", (0, 0, 0)), None);
    shutdown(&controller);
}

#[test]
fn test_bmp_commands_sent() {
    let (controller, connector) = create_controller(0.0);
    controller
        .set_machines(vec![simple_machine("m", 1, 1)])
        .unwrap();
    let job_id = create_job(&controller, triads(1, 1));
    wait_for_state(&controller, job_id, JobState::Ready);

    let commands = connector.commands_for("bmp-m-0-0");
    assert_eq!(
        commands[0],
        BmpCommand::Power {
            boards: vec![0, 1, 2],
            on: true
        }
    );
    // A whole-machine triad wraps onto itself, so nothing needs isolating
    assert_eq!(commands.len(), 1);

    controller.power_off_job_boards(job_id, None);
    wait_for_state(&controller, job_id, JobState::Ready);
    assert_eq!(controller.get_job_state(job_id, None).power, Some(false));
    assert_eq!(
        connector.commands_for("bmp-m-0-0").last(),
        Some(&BmpCommand::Power {
            boards: vec![0, 1, 2],
            on: false
        })
    );
    shutdown(&controller);
}

#[test]
fn test_bmp_failure_destroys_job() {
    let (controller, connector) = create_controller(0.0);
    controller
        .set_machines(vec![simple_machine("m", 1, 1)])
        .unwrap();
    connector.set_failing("bmp-m-0-0", true);
    let job_id = create_job(&controller, triads(1, 1));
    wait_for_state(&controller, job_id, JobState::Destroyed);
    assert_eq!(
        controller.get_job_state(job_id, None).reason.as_deref(),
        Some("Machine configuration failed. Error: Requests failed on BMP bmp-m-0-0")
    );

    // The boards become available again once the power-off attempt ends
    connector.set_failing("bmp-m-0-0", false);
    let job_id = create_job(&controller, triads(1, 1));
    wait_for_state(&controller, job_id, JobState::Ready);
    shutdown(&controller);
}

#[test]
fn test_handler_lock_pauses_worker() {
    let (controller, _connector) = create_controller(0.0);
    controller
        .set_machines(vec![simple_machine("m", 1, 1)])
        .unwrap();
    let lock = controller.bmp_handler_lock("m", (0, 0)).unwrap();
    assert!(controller.bmp_handler_lock("m", (5, 5)).is_none());

    let guard = lock.lock().unwrap();
    let job_id = create_job(&controller, any_board());
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(state(&controller, job_id), JobState::Power);
    drop(guard);
    wait_for_state(&controller, job_id, JobState::Ready);
    shutdown(&controller);
}

#[test]
fn test_background_state_change_callback() {
    let (controller, _connector) = create_controller(0.0);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    controller.set_on_background_state_change(Some(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));
    controller
        .set_machines(vec![simple_machine("m", 1, 1)])
        .unwrap();
    assert!(calls.load(Ordering::SeqCst) >= 1);

    let job_id = create_job(&controller, any_board());
    wait_for_state(&controller, job_id, JobState::Ready);
    assert!(calls.load(Ordering::SeqCst) >= 2);

    controller.set_on_background_state_change(None);
    shutdown(&controller);
}

#[test]
fn test_list_jobs() {
    let (controller, _connector) = create_controller(0.0);
    controller
        .set_machines(vec![simple_machine("m", 1, 1)])
        .unwrap();
    let job_id = create_job(&controller, triads(1, 1));
    let queued = create_job(&controller, any_board());
    wait_for_state(&controller, job_id, JobState::Ready);

    let jobs = controller.list_jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].job_id, job_id);
    assert_eq!(jobs[0].args, vec![1, 1]);
    assert_eq!(jobs[0].owner, "a");
    assert_eq!(jobs[0].allocated_machine_name.as_deref(), Some("m"));
    assert_eq!(jobs[0].keepalive_host.as_deref(), Some("10.0.0.1"));
    assert_eq!(jobs[1].job_id, queued);
    assert_eq!(jobs[1].state, JobState::Queued);
    assert!(jobs[1].args.is_empty());
    assert_eq!(jobs[1].boards, None);
    shutdown(&controller);
}

#[test]
fn test_settings() {
    let (controller, _connector) = create_controller(0.0);
    assert_eq!(controller.max_retired_jobs(), 100);
    controller.set_max_retired_jobs(5);
    assert_eq!(controller.max_retired_jobs(), 5);
    controller.set_seconds_before_free(2.5);
    assert_eq!(controller.seconds_before_free(), 2.5);
    assert!(controller.machines().is_empty());
}

#[test]
fn test_snapshot_and_restore() {
    let (controller, connector) = create_controller(0.0);
    controller
        .set_machines(vec![simple_machine("m", 1, 2)])
        .unwrap();
    let job_id = create_job(&controller, triads(1, 1));
    wait_for_state(&controller, job_id, JobState::Ready);
    let snapshot = controller.snapshot();
    shutdown(&controller);

    let restored = Controller::restore(snapshot, connector, Duration::ZERO).unwrap();
    assert_eq!(state(&restored, job_id), JobState::Ready);
    assert_eq!(restored.machines().len(), 1);
    // Identifiers keep counting where they left off
    let next = create_job(&restored, triads(1, 1));
    assert!(next > job_id);
    wait_for_state(&restored, next, JobState::Ready);
    shutdown(&restored);
}
