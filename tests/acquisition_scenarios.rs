//! Acquisition scenarios against the mock driver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cam_acquire::driver::{ACQUISITION_START, ACQUISITION_STOP};
use cam_acquire::mock::{MockCamera, MockDriver};
use cam_acquire::validation::{validate_color_bars, validate_frame_sequence};
use cam_acquire::{
    AccessMode, Camera, Driver, Error, Format, FourCC, FrameObserver, FramePtr, FrameStatus,
    System, SystemConfig,
};
use serial_test::serial;

const TIMEOUT: Duration = Duration::from_secs(2);

fn start(driver: &Arc<MockDriver>) -> (Arc<System>, Arc<Camera>) {
    let system = System::startup(Arc::clone(driver) as Arc<dyn Driver>, SystemConfig::default())
        .expect("startup should succeed");
    let camera = system
        .open_camera_by_id("DEV_1", AccessMode::Full)
        .expect("open should succeed");
    (system, camera)
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
#[serial]
fn test_single_grab_delivers_color_bars() {
    let driver = Arc::new(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
    let (system, camera) = start(&driver);
    let stream = camera.primary_stream().expect("stream").handle();

    let frame = camera.acquire_single_image(TIMEOUT).expect("grab should succeed");

    assert_eq!(frame.status().expect("status"), FrameStatus::Complete);
    assert_eq!(frame.frame_id().expect("frame id"), 1);
    assert_eq!(frame.width().expect("width"), 64);
    assert_eq!(frame.height().expect("height"), 48);
    validate_color_bars(&frame).expect("frame should carry color bars");

    // Nothing stays announced or queued once the grab returns.
    assert_eq!(driver.announced_frames(stream), 0);
    assert_eq!(driver.queued_frames(stream), 0);
    assert!(camera.is_open());
    assert!(driver
        .commands()
        .iter()
        .any(|command| command == ACQUISITION_START));

    system.shutdown();
}

#[test]
#[serial]
fn test_single_grab_fills_payload_sized_buffer() {
    let driver = Arc::new(
        MockDriver::new()
            .with_camera(MockCamera::new("DEV_1").with_format(Format::new(32, 16, FourCC::YUYV))),
    );
    let (system, camera) = start(&driver);
    assert_eq!(camera.payload_size().expect("payload size"), 1024);

    let frame = camera
        .acquire_single_image(Duration::from_millis(5000))
        .expect("grab should succeed");

    assert!(frame.buffer_size() >= 1024);
    assert_eq!(frame.image_bytes().expect("image").len(), 1024);
    system.shutdown();
}

#[test]
#[serial]
fn test_multi_grab_returns_consecutive_frames() {
    let driver = Arc::new(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
    let (system, camera) = start(&driver);

    let grab = camera
        .acquire_multiple_images(4, TIMEOUT)
        .expect("grab should succeed");

    assert!(grab.is_complete());
    assert_eq!(grab.frames.len(), 4);
    validate_frame_sequence(&grab.frames).expect("frame ids should be consecutive");
    system.shutdown();
}

#[test]
#[serial]
fn test_multi_grab_with_partial_announce() {
    let driver = Arc::new(
        MockDriver::new()
            .with_camera(MockCamera::new("DEV_1"))
            .with_announce_limit(2),
    );
    let (system, camera) = start(&driver);

    let grab = camera
        .acquire_multiple_images(5, TIMEOUT)
        .expect("partial grab should still succeed");

    assert_eq!(grab.requested, 5);
    assert_eq!(grab.frames.len(), 2);
    assert!(matches!(grab.first_error, Some(Error::Resources(_))));
    assert!(!grab.is_complete());
    validate_frame_sequence(&grab.frames).expect("frame ids should be consecutive");
    system.shutdown();
}

#[test]
#[serial]
fn test_multi_grab_keeps_queueing_past_a_rejected_buffer() {
    let driver = Arc::new(
        MockDriver::new()
            .with_camera(MockCamera::new("DEV_1"))
            .with_failing_queue_call(1),
    );
    let (system, camera) = start(&driver);
    let stream = camera.primary_stream().expect("stream").handle();

    let grab = camera
        .acquire_multiple_images(3, TIMEOUT)
        .expect("grab should succeed with the queued frames");

    assert_eq!(grab.requested, 3);
    assert_eq!(grab.frames.len(), 2);
    assert!(matches!(grab.first_error, Some(Error::Resources(_))));
    validate_frame_sequence(&grab.frames).expect("frame ids should be consecutive");
    assert_eq!(driver.announced_frames(stream), 0);
    system.shutdown();
}

#[test]
#[serial]
fn test_failed_acquisition_start_rolls_back() {
    let driver = Arc::new(
        MockDriver::new()
            .with_camera(MockCamera::new("DEV_1"))
            .with_failing_command(ACQUISITION_START),
    );
    let (system, camera) = start(&driver);
    let stream = camera.primary_stream().expect("stream").handle();

    let result = camera.acquire_single_image(TIMEOUT);

    assert!(matches!(result, Err(Error::Driver { .. })));
    assert_eq!(driver.announced_frames(stream), 0);
    assert_eq!(driver.queued_frames(stream), 0);
    // Capture was ended, so the engine accepts a fresh start.
    camera.start_capture().expect("capture should restart");
    camera.end_capture().expect("capture should end");
    system.shutdown();
}

#[test]
#[serial]
fn test_grab_on_closed_camera() {
    let driver = Arc::new(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
    let (system, camera) = start(&driver);
    camera.close().expect("close should succeed");

    assert_eq!(
        camera.acquire_single_image(TIMEOUT).map(|_| ()),
        Err(Error::DeviceNotOpen)
    );
    assert!(matches!(
        camera.acquire_multiple_images(0, TIMEOUT),
        Err(Error::BadParameter(_))
    ));
    system.shutdown();
}

#[test]
#[serial]
fn test_continuous_acquisition_requeues_until_stopped() {
    let driver = Arc::new(
        MockDriver::new()
            .with_camera(MockCamera::new("DEV_1"))
            .with_frame_interval(Duration::from_millis(1)),
    );
    let (system, camera) = start(&driver);
    let stream = camera.primary_stream().expect("stream").handle();

    let delivered = Arc::new(AtomicUsize::new(0));
    let requeued_after_stop = Arc::new(AtomicUsize::new(0));
    let observer: Arc<dyn FrameObserver> = {
        let delivered = Arc::clone(&delivered);
        let requeued_after_stop = Arc::clone(&requeued_after_stop);
        let camera = Arc::clone(&camera);
        let driver = Arc::clone(&driver);
        Arc::new(move |frame: &FramePtr| {
            delivered.fetch_add(1, Ordering::SeqCst);
            // The stop command only runs once the queue gate is closed.
            let stopping = driver
                .commands()
                .iter()
                .any(|command| command == ACQUISITION_STOP);
            if camera.queue_frame(frame).is_ok() && stopping {
                requeued_after_stop.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let in_flight = camera
        .start_continuous_image_acquisition(3, observer)
        .expect("streaming should start");
    assert_eq!(in_flight, 3);
    assert!(wait_until(|| delivered.load(Ordering::SeqCst) >= 10));

    camera
        .stop_continuous_image_acquisition()
        .expect("streaming should stop");

    // Let a callback that raced the stop finish, then nothing may follow.
    thread::sleep(Duration::from_millis(50));
    let settled = delivered.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(delivered.load(Ordering::SeqCst), settled);
    assert_eq!(requeued_after_stop.load(Ordering::SeqCst), 0);

    assert_eq!(driver.announced_frames(stream), 0);
    assert_eq!(driver.queued_frames(stream), 0);
    assert!(!driver.is_acquiring(camera.device_handle().expect("device")));

    system.shutdown();
}

#[test]
#[serial]
fn test_continuous_acquisition_with_partial_announce() {
    let driver = Arc::new(
        MockDriver::new()
            .with_camera(MockCamera::new("DEV_1"))
            .with_announce_limit(3),
    );
    let (system, camera) = start(&driver);

    let seen: Arc<Mutex<Vec<FramePtr>>> = Arc::new(Mutex::new(Vec::new()));
    let delivered = Arc::new(AtomicUsize::new(0));
    let observer: Arc<dyn FrameObserver> = {
        let seen = Arc::clone(&seen);
        let delivered = Arc::clone(&delivered);
        let camera = Arc::clone(&camera);
        Arc::new(move |frame: &FramePtr| {
            if let Ok(mut seen) = seen.lock() {
                if !seen.iter().any(|known| Arc::ptr_eq(known, frame)) {
                    seen.push(Arc::clone(frame));
                }
            }
            delivered.fetch_add(1, Ordering::SeqCst);
            let _ = camera.queue_frame(frame);
        })
    };

    let in_flight = camera
        .start_continuous_image_acquisition(5, observer)
        .expect("streaming should start with the announced frames");
    assert_eq!(in_flight, 3);
    assert!(wait_until(|| delivered.load(Ordering::SeqCst) >= 12));
    camera
        .stop_continuous_image_acquisition()
        .expect("streaming should stop");

    assert_eq!(seen.lock().expect("lock").len(), 3);
    seen.lock().expect("lock").clear();
    system.shutdown();
}

#[test]
#[serial]
fn test_continuous_acquisition_can_restart() {
    let driver = Arc::new(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
    let (system, camera) = start(&driver);

    let frames: Arc<Mutex<Vec<FramePtr>>> = Arc::new(Mutex::new(Vec::new()));
    let observer: Arc<dyn FrameObserver> = {
        let frames = Arc::clone(&frames);
        Arc::new(move |frame: &FramePtr| {
            if let Ok(mut frames) = frames.lock() {
                frames.push(Arc::clone(frame));
            }
        })
    };

    for _ in 0..2 {
        frames.lock().expect("lock").clear();
        camera
            .start_continuous_image_acquisition(2, Arc::clone(&observer))
            .expect("streaming should start");
        assert!(wait_until(|| frames.lock().map_or(0, |f| f.len()) >= 2));
        camera
            .stop_continuous_image_acquisition()
            .expect("streaming should stop");
    }

    system.shutdown();
}

#[test]
#[serial]
fn test_stop_without_start_is_tolerated() {
    let driver = Arc::new(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
    let (system, camera) = start(&driver);

    camera
        .stop_continuous_image_acquisition()
        .expect("stop on an idle camera should succeed");
    system.shutdown();
}
