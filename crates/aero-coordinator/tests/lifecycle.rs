//! Lifecycle: start/stop/restart/reset semantics, entry-point stability,
//! stale-instance filtering and the full-restart debounce.

mod common;

use aero_coordinator::{
    IncomingMessage, VmConfig, VmRuntime, VmState, WorkerEntrypoint, WorkerEventPayload,
    WorkerRole, WorkerState,
};
use common::*;
use pretty_assertions::assert_eq;

#[test]
fn start_spawns_every_role_once_and_refuses_a_second_start() {
    let (mut coordinator, state) = started_coordinator(small_config());
    assert_eq!(coordinator.vm_state(), VmState::Running);
    for role in WorkerRole::ALL {
        assert_eq!(spawn_count(&state, role), 1);
        let status = coordinator.worker_status(role).unwrap();
        assert_eq!(status.state, WorkerState::Starting);
        assert_eq!(status.instance_id, 1);
    }
    assert!(coordinator.start(small_config(), Default::default()).is_err());
}

#[test]
fn stop_is_idempotent_and_shuts_workers_down() {
    let (mut coordinator, state) = started_coordinator(small_config());
    coordinator.stop();
    assert_eq!(coordinator.vm_state(), VmState::Stopped);
    assert_eq!(state.lock().unwrap().terminated.len(), 4);
    for role in WorkerRole::ALL {
        assert!(posts_to(&state, role).contains(&SentKind::Shutdown));
        assert!(coordinator.worker_status(role).is_none());
    }
    coordinator.stop();
    assert_eq!(state.lock().unwrap().terminated.len(), 4);
}

#[test]
fn restart_reallocates_shared_memory_but_reset_preserves_it() {
    let (mut coordinator, state) = started_coordinator(small_config());
    make_all_ready(&mut coordinator);

    let init_ram = |state: &SharedMockState, nth: usize| -> usize {
        state
            .lock()
            .unwrap()
            .posts
            .iter()
            .filter_map(|p| match p.kind {
                SentKind::Init { guest_ram } if p.role == WorkerRole::Cpu => Some(guest_ram),
                _ => None,
            })
            .nth(nth)
            .expect("init message")
    };
    let first = init_ram(&state, 0);

    coordinator.reset("test").unwrap();
    let after_reset = init_ram(&state, 1);
    assert_eq!(first, after_reset, "reset must preserve shared memory");
    assert_eq!(coordinator.vm_state(), VmState::Running);
    assert_eq!(current_instance(&coordinator, WorkerRole::Cpu), 2);

    coordinator.restart().unwrap();
    let after_restart = init_ram(&state, 2);
    assert_ne!(first, after_restart, "restart must reallocate shared memory");
}

#[test]
fn instance_ids_are_monotonic_across_cycles() {
    let (mut coordinator, _state) = started_coordinator(small_config());
    assert_eq!(current_instance(&coordinator, WorkerRole::Net), 1);
    coordinator.restart_worker(WorkerRole::Net).unwrap();
    assert_eq!(current_instance(&coordinator, WorkerRole::Net), 2);
    coordinator.restart().unwrap();
    assert_eq!(current_instance(&coordinator, WorkerRole::Net), 3);
    // The other roles were only restarted by the full cycle.
    assert_eq!(current_instance(&coordinator, WorkerRole::Cpu), 2);
}

#[test]
fn cpu_entrypoint_is_stable_across_every_lifecycle_operation() {
    let config = VmConfig { vm_runtime: None, ..small_config() };
    let (mut coordinator, state) = started_coordinator(config);

    coordinator.restart().unwrap();
    coordinator.reset("test").unwrap();
    coordinator.restart_worker(WorkerRole::Cpu).unwrap(); // falls back to full restart
    coordinator
        .update_config(VmConfig { log_level: aero_coordinator::LogLevel::Debug, ..small_config() })
        .unwrap();

    let cpu_entrypoints: Vec<WorkerEntrypoint> = state
        .lock()
        .unwrap()
        .spawns
        .iter()
        .filter(|s| s.role == WorkerRole::Cpu)
        .map(|s| s.entrypoint)
        .collect();
    assert!(!cpu_entrypoints.is_empty());
    assert!(cpu_entrypoints.iter().all(|&e| e == WorkerEntrypoint::CpuMachine));

    // Changing the selector is the one thing that changes the entrypoint.
    coordinator
        .update_config(VmConfig { vm_runtime: Some(VmRuntime::Legacy), ..small_config() })
        .unwrap();
    assert_eq!(coordinator.worker_entrypoint(WorkerRole::Cpu), Some(WorkerEntrypoint::CpuLegacy));
}

#[test]
fn stale_instance_messages_have_no_side_effect() {
    let (mut coordinator, _state) = started_coordinator(small_config());
    coordinator.restart_worker(WorkerRole::Net).unwrap();
    assert_eq!(current_instance(&coordinator, WorkerRole::Net), 2);

    // READY tagged with the dead instance: state must stay Starting.
    coordinator.handle_worker_message(IncomingMessage {
        role: WorkerRole::Net,
        instance_id: 1,
        payload: WorkerEventPayload::Ready,
    });
    assert_eq!(coordinator.worker_status(WorkerRole::Net).unwrap().state, WorkerState::Starting);

    // A stale guest submission must not enter the queue either.
    coordinator.handle_worker_message(IncomingMessage {
        role: WorkerRole::Cpu,
        instance_id: 0,
        payload: guest_submit(1),
    });
    assert_eq!(coordinator.pending_gpu_submissions(), 0);
}

#[test]
fn net_worker_failure_restarts_in_place_without_touching_other_roles() {
    let (mut coordinator, state) = started_coordinator(small_config());
    make_all_ready(&mut coordinator);

    deliver(
        &mut coordinator,
        WorkerRole::Net,
        WorkerEventPayload::Fatal { message: "proxy wedged".into() },
    );

    assert_eq!(spawn_count(&state, WorkerRole::Net), 2);
    for role in [WorkerRole::Cpu, WorkerRole::Io, WorkerRole::Gpu] {
        assert_eq!(spawn_count(&state, role), 1);
    }
    assert!(!coordinator.restart_scheduled());
    assert_eq!(coordinator.last_fatal_event().unwrap().role, WorkerRole::Net);
    assert_eq!(coordinator.worker_status(WorkerRole::Net).unwrap().state, WorkerState::Starting);
}

#[tokio::test(start_paused = true)]
async fn concurrent_restart_requests_coalesce_into_one_cycle() {
    let (mut coordinator, state) = started_coordinator(small_config());
    make_all_ready(&mut coordinator);

    deliver(
        &mut coordinator,
        WorkerRole::Cpu,
        WorkerEventPayload::Fatal { message: "triple fault storm".into() },
    );
    deliver(
        &mut coordinator,
        WorkerRole::Gpu,
        WorkerEventPayload::Fatal { message: "context lost".into() },
    );
    assert!(coordinator.restart_scheduled());

    assert!(coordinator.complete_scheduled_restart().await.unwrap());
    // One restart cycle: every role spawned exactly twice in total.
    for role in WorkerRole::ALL {
        assert_eq!(spawn_count(&state, role), 2);
    }
    assert!(!coordinator.restart_scheduled());
    assert!(!coordinator.complete_scheduled_restart().await.unwrap());
}

#[test]
fn guest_reset_request_preserves_memory_and_respawns_workers() {
    let (mut coordinator, state) = started_coordinator(small_config());
    make_all_ready(&mut coordinator);

    deliver(&mut coordinator, WorkerRole::Cpu, WorkerEventPayload::ResetRequest);

    assert_eq!(coordinator.vm_state(), VmState::Running);
    for role in WorkerRole::ALL {
        assert_eq!(spawn_count(&state, role), 2);
    }

    // Reset requests are CPU-only; one from IO is a protocol error and is
    // dropped.
    deliver(&mut coordinator, WorkerRole::Io, WorkerEventPayload::ResetRequest);
    for role in WorkerRole::ALL {
        assert_eq!(spawn_count(&state, role), 2);
    }
}
