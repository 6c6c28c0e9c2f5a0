//! Integration tests for a running driver against the mock camera.

use pco_daq::config::DriverConfig;
use pco_daq::driver::{DriverHandle, PcoDriver};
use pco_daq::image::{Image, PixelData};
use pco_daq::mock::MockCamera;
use pco_daq::pipeline::Outputs;
use pco_daq::sdk::{CameraSdk, TimestampMode};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Delivered = Arc<Mutex<Vec<Image>>>;

/// Test configuration with short connect delays.
fn test_config() -> DriverConfig {
    let mut config = DriverConfig::default();
    config.timing.connect_period = Duration::from_millis(1);
    config.timing.reconnect_period = Duration::from_millis(5);
    // keep polls out of the way of call and transition assertions
    config.timing.status_poll_period = Duration::from_secs(3600);
    config.timing.acquisition_poll_period = Duration::from_secs(3600);
    config
}

fn start(camera: &Arc<MockCamera>) -> (PcoDriver, DriverHandle, Delivered) {
    let delivered: Delivered = Arc::default();
    let sink = Arc::clone(&delivered);
    let sdk: Arc<dyn CameraSdk> = camera.clone();
    let driver = PcoDriver::spawn(
        &test_config(),
        sdk,
        Outputs::new(move |image: Image| sink.lock().unwrap().push(image)),
    )
    .expect("driver should start");
    let handle = driver.handle();
    assert!(
        eventually(|| handle.status().state == "Idle"),
        "driver never reached Idle"
    );
    (driver, handle, delivered)
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Wait until the state machine has handled everything posted so far.
fn settle(handle: &DriverHandle) {
    assert!(eventually(|| handle.pending_events() == 0));
    std::thread::sleep(Duration::from_millis(20));
}

#[test]
fn test_frame_gap_is_counted_and_acquisition_completes() {
    let camera = Arc::new(MockCamera::small(16, 8));
    let (driver, handle, delivered) = start(&camera);

    handle.update_settings(|s| s.num_images = 4);
    handle.acquire().unwrap();
    assert!(eventually(|| handle.status().acquiring));

    let receiver = driver.receiver();
    for n in [1, 2, 4, 5] {
        let (_, _, pixels) = camera.frame(n, 100);
        assert!(receiver.deliver(&pixels).is_some());
    }

    assert!(eventually(|| handle.status().state == "Idle"));
    let status = handle.status();
    assert_eq!(status.counters.missing_frames, 1);
    assert_eq!(status.counters.last_frame_number, 5);
    assert_eq!(status.counters.images_counter, 4);

    let delivered = delivered.lock().unwrap();
    let frames: Vec<_> = delivered.iter().map(|i| i.frame_number).collect();
    assert_eq!(frames, vec![1, 2, 4, 5]);
    let ids: Vec<_> = delivered.iter().map(|i| i.unique_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
}

#[test]
fn test_exposures_are_summed() {
    let camera = Arc::new(MockCamera::small(3, 1));
    let (driver, handle, delivered) = start(&camera);

    handle.update_settings(|s| {
        s.num_images = 1;
        s.num_exposures = 3;
        s.timestamp_mode = TimestampMode::None;
    });
    handle.acquire().unwrap();
    assert!(eventually(|| handle.status().acquiring));

    let receiver = driver.receiver();
    for _ in 0..3 {
        assert!(receiver.deliver(&[10, 10, 10]).is_some());
    }

    assert!(eventually(|| delivered.lock().unwrap().len() == 1));
    assert_eq!(
        delivered.lock().unwrap()[0].data,
        PixelData::U16(vec![30, 30, 30])
    );
    assert!(eventually(|| handle.status().state == "Idle"));
    assert_eq!(handle.status().counters.exposures_counter, 0);
}

#[test]
fn test_arm_failure_releases_every_buffer() {
    let camera = Arc::new(MockCamera::small(16, 8));
    let (_driver, handle, _) = start(&camera);

    camera.fail_once("arm");
    handle.arm().unwrap();

    assert!(eventually(|| handle.status().message.starts_with("Arm failed")));
    let status = handle.status();
    assert_eq!(status.state, "Idle");
    assert!(!status.armed);
    assert_eq!(camera.allocated_buffers(), 0);
    assert!(!camera.recording());

    // the next arm goes through
    handle.arm().unwrap();
    assert!(eventually(|| handle.status().state == "Armed"));
}

#[test]
fn test_disarm_when_idle_changes_nothing() {
    let camera = Arc::new(MockCamera::small(16, 8));
    let (_driver, handle, _) = start(&camera);
    settle(&handle);
    let before = handle.status();
    let calls = camera.calls().len();

    handle.disarm().unwrap();
    settle(&handle);

    let after = handle.status();
    assert_eq!(after.state, "Idle");
    assert_eq!(after.last_transition, before.last_transition);
    assert_eq!(camera.calls().len(), calls);
}

#[test]
fn test_stop_while_armed_returns_to_idle() {
    let camera = Arc::new(MockCamera::small(16, 8));
    let (_driver, handle, _) = start(&camera);

    handle.arm().unwrap();
    assert!(eventually(|| handle.status().state == "Armed"));
    handle.stop().unwrap();
    assert!(eventually(|| handle.status().state == "Idle"));
    assert_eq!(camera.allocated_buffers(), 0);
}

#[test]
fn test_reboot_reconnects() {
    let camera = Arc::new(MockCamera::small(16, 8));
    let mut config = test_config();
    config.timing.reboot_period = Duration::from_millis(20);
    let sdk: Arc<dyn CameraSdk> = camera.clone();
    let driver = PcoDriver::spawn(&config, sdk, Outputs::new(|_: Image| {})).unwrap();
    let handle = driver.handle();
    assert!(eventually(|| handle.status().state == "Idle"));

    handle.reboot().unwrap();
    assert!(eventually(|| camera.call_count("reboot") == 1));
    assert!(eventually(
        || camera.call_count("open") == 2 && handle.status().connected
    ));
    assert!(eventually(|| handle.status().state == "Idle"));
    assert!(camera.is_open());
}

#[test]
fn test_shutdown_closes_camera() {
    let camera = Arc::new(MockCamera::small(16, 8));
    let (driver, handle, _) = start(&camera);
    handle.arm().unwrap();
    assert!(eventually(|| handle.status().state == "Armed"));

    driver.shutdown().unwrap();
    assert!(!camera.is_open());
    assert_eq!(camera.allocated_buffers(), 0);
    assert!(handle.arm().is_err());
}
