//! Config transitions through the live supervisor: restart exactly when
//! required, keep the device contract stable otherwise.

mod common;

use aero_coordinator::{
    ConfigAction, LogLevel, RestartReason, TransportMode, VmConfig, WorkerRole,
};
use common::*;
use pretty_assertions::assert_eq;

#[test]
fn transport_mode_change_restarts_exactly_once() {
    let config = VmConfig { virtio_net_mode: TransportMode::Modern, ..small_config() };
    let (mut coordinator, state) = started_coordinator(config.clone());
    make_all_ready(&mut coordinator);

    let action = coordinator
        .update_config(VmConfig { virtio_net_mode: TransportMode::Legacy, ..config })
        .unwrap();
    assert_eq!(action, ConfigAction::FullRestart(RestartReason::DeviceContractChanged));

    for role in WorkerRole::ALL {
        assert_eq!(spawn_count(&state, role), 2, "{role}: exactly one restart cycle");
    }
}

#[test]
fn log_level_change_touches_nothing() {
    let (mut coordinator, state) = started_coordinator(small_config());
    make_all_ready(&mut coordinator);

    let contract_before = coordinator.device_contract().unwrap();
    let posts_before = post_count(&state);

    let action = coordinator
        .update_config(VmConfig { log_level: LogLevel::Trace, ..small_config() })
        .unwrap();
    assert_eq!(action, ConfigAction::MutateInPlace);

    // No restart, no worker churn, no attachment re-sends.
    for role in WorkerRole::ALL {
        assert_eq!(spawn_count(&state, role), 1);
    }
    assert_eq!(post_count(&state), posts_before);
    assert_eq!(coordinator.active_config().unwrap().log_level, LogLevel::Trace);

    // The binding-visible surface is untouched.
    let contract_after = coordinator.device_contract().unwrap();
    assert_eq!(contract_before, contract_after);
}

#[test]
fn contract_is_stable_across_non_binding_updates() {
    let (mut coordinator, _state) = started_coordinator(small_config());
    let before = coordinator.device_contract().unwrap();

    coordinator
        .update_config(VmConfig {
            log_level: LogLevel::Error,
            proxy_url: Some("wss://gw.example".into()),
            active_disk_image: Some("ignored.img".into()),
            ..small_config()
        })
        .unwrap();

    assert_eq!(before, coordinator.device_contract().unwrap());
}

#[test]
fn deprecated_active_disk_image_is_ignored_by_the_differ() {
    let (mut coordinator, state) = started_coordinator(small_config());
    let action = coordinator
        .update_config(VmConfig {
            active_disk_image: Some("c_drive_old.img".into()),
            ..small_config()
        })
        .unwrap();
    assert_eq!(action, ConfigAction::MutateInPlace);
    for role in WorkerRole::ALL {
        assert_eq!(spawn_count(&state, role), 1);
    }
}

#[test]
fn update_config_requires_a_started_vm() {
    let (spawner, _state) = RecordingSpawner::new();
    let mut coordinator = aero_coordinator::Coordinator::new(spawner);
    assert!(coordinator.update_config(small_config()).is_err());
}
