//! Discovery and link ownership against simulated devices.
//!
//! Run with: `cargo test -p act-hardware --test link_lifecycle`

use std::time::Duration;

use act_core::ActError;
use act_hardware::{
    ActuatorConfig, ActuatorController, MockPortOpener, SimBehavior, SimulatedActuator,
};

fn config(candidates: &[&str]) -> ActuatorConfig {
    let mut config = ActuatorConfig::default();
    config.connection.candidates = Some(candidates.iter().map(|c| c.to_string()).collect());
    config
}

#[tokio::test(start_paused = true)]
async fn scan_follows_candidate_order_and_skips_preferred() {
    let responsive = SimulatedActuator::new();
    let opener = MockPortOpener::new()
        .with_device(
            "/dev/sim1",
            SimulatedActuator::new().with_behavior(SimBehavior::Mute),
        )
        .with_device("/dev/sim2", responsive.clone());

    let mut controller = ActuatorController::new(
        &config(&["/dev/sim0", "/dev/sim1", "/dev/sim2"]),
        Box::new(opener.clone()),
    )
    .unwrap();

    controller.connect(Some("/dev/sim1")).await.unwrap();

    assert_eq!(opener.open_log(), vec!["/dev/sim1", "/dev/sim0", "/dev/sim2"]);
    assert_eq!(controller.port_name(), Some("/dev/sim2"));
    assert_eq!(
        controller.fallback_notice().as_deref(),
        Some("Requested /dev/sim1 not responsive, using /dev/sim2")
    );
    // probe + init sequence
    assert_eq!(responsive.frames().len(), 21);
}

#[tokio::test(start_paused = true)]
async fn no_device_anywhere() {
    let opener = MockPortOpener::new();
    let mut controller =
        ActuatorController::new(&config(&["/dev/sim0", "/dev/sim1"]), Box::new(opener.clone()))
            .unwrap();

    let err = controller.connect(Some("/dev/sim9")).await.unwrap_err();
    assert!(matches!(err, ActError::NoResponsiveDevice { tried: 3 }));
    assert_eq!(err.exit_code(), 2);
    assert!(!controller.is_connected());
}

#[tokio::test(start_paused = true)]
async fn second_connect_does_not_touch_the_line() {
    let device = SimulatedActuator::new();
    let opener = MockPortOpener::new().with_device("/dev/sim0", device.clone());
    let mut controller =
        ActuatorController::new(&config(&["/dev/sim0"]), Box::new(opener.clone())).unwrap();

    controller.connect(Some("/dev/sim0")).await.unwrap();
    let frames = device.frames().len();
    controller.connect(Some("/dev/elsewhere")).await.unwrap();

    assert_eq!(device.frames().len(), frames);
    assert_eq!(opener.open_log().len(), 1);
    assert_eq!(controller.port_name(), Some("/dev/sim0"));
}

#[tokio::test(start_paused = true)]
async fn unplug_drops_link_and_reconnect_falls_back() {
    let first = SimulatedActuator::new();
    let spare = SimulatedActuator::new().with_position(4);
    let opener = MockPortOpener::new()
        .with_device("/dev/sim0", first.clone())
        .with_device("/dev/sim1", spare);
    let mut controller =
        ActuatorController::new(&config(&["/dev/sim0", "/dev/sim1"]), Box::new(opener)).unwrap();

    controller.connect(Some("/dev/sim0")).await.unwrap();
    first.unplug();

    let err = controller
        .move_relative_blocking(2, 10, Duration::from_secs(5), 0)
        .await
        .unwrap_err();
    assert!(err.is_link_fatal());
    assert!(!controller.is_connected());

    controller.connect(Some("/dev/sim0")).await.unwrap();
    assert_eq!(controller.port_name(), Some("/dev/sim1"));
    assert_eq!(controller.read_position().await.unwrap(), 4);
}
