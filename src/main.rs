//! Cam-acquire demo binary: list the catalog, grab one image, stream a few frames.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cam_acquire::mock::{MockCamera, MockDriver};
use cam_acquire::{
    init_logging, AccessMode, Driver, FrameObserver, FramePtr, LogLevel, LogOptions, System,
    SystemConfig,
};
use tracing::{info, warn};

const STREAM_FOR: Duration = Duration::from_millis(500);

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> cam_acquire::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let log_level = std::env::var("CAM_LOG_LEVEL")
        .ok()
        .map(|level| level.parse::<LogLevel>())
        .transpose()?
        .unwrap_or_default();
    init_logging(&LogOptions {
        log_level,
        json_format: args.iter().any(|arg| arg == "--json"),
    })?;

    let driver = select_driver(args.iter().any(|arg| arg == "--v4l2"))?;
    let system = System::startup(driver, SystemConfig::default())?;

    for transport_layer in system.transport_layers()? {
        println!("Transport layer: {} ({:?})", transport_layer.name(), transport_layer.kind());
    }
    for interface in system.interfaces()? {
        println!("Interface: {} [{}]", interface.name(), interface.id());
    }
    let cameras = system.cameras()?;
    for camera in &cameras {
        println!("Camera: {} {} [{}]", camera.name(), camera.model(), camera.extended_id());
    }

    let Some(camera) = cameras.first() else {
        println!("No camera found");
        system.shutdown();
        return Ok(());
    };
    camera.open(AccessMode::Full)?;

    let frame = camera.acquire_single_image(system.config().acquisition_timeout())?;
    println!(
        "Frame {}: {}x{} {} ({:?})",
        frame.frame_id()?,
        frame.width()?,
        frame.height()?,
        frame.pixel_format()?,
        frame.status()?
    );

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let requeue = Arc::clone(camera);
    let observer: Arc<dyn FrameObserver> = Arc::new(move |frame: &FramePtr| {
        counter.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = requeue.queue_frame(frame) {
            warn!(%err, "frame not re-queued");
        }
    });
    let in_flight = camera.start_continuous_image_acquisition(
        system.config().continuous_buffer_count(),
        observer,
    )?;
    info!(buffers = in_flight, "streaming");
    thread::sleep(STREAM_FOR);
    camera.stop_continuous_image_acquisition()?;
    println!("Streamed {} frames", received.load(Ordering::Relaxed));

    camera.close()?;
    system.shutdown();
    Ok(())
}

#[cfg(feature = "v4l2")]
fn select_driver(v4l2: bool) -> cam_acquire::Result<Arc<dyn Driver>> {
    if v4l2 {
        return Ok(Arc::new(cam_acquire::v4l2::V4l2Driver::new()));
    }
    Ok(mock_driver())
}

#[cfg(not(feature = "v4l2"))]
fn select_driver(v4l2: bool) -> cam_acquire::Result<Arc<dyn Driver>> {
    if v4l2 {
        return Err(cam_acquire::Error::NotAvailable(
            "built without the v4l2 feature".to_owned(),
        ));
    }
    Ok(mock_driver())
}

fn mock_driver() -> Arc<dyn Driver> {
    Arc::new(
        MockDriver::new()
            .with_camera(MockCamera::new("DEV_1").with_name("Demo Camera"))
            .with_frame_interval(Duration::from_millis(20)),
    )
}
