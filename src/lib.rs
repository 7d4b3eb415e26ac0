//! Cam-Acquire: frame-buffer lifecycle and device registry for streaming cameras
//!
//! This library manages image buffers, per-stream capture engines and a
//! hot-plug aware catalog of transport layers, interfaces and cameras on top
//! of a pluggable [`Driver`]. A simulated [`mock::MockDriver`] is always
//! available; a V4L2 driver is built with the `v4l2` feature.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cam_acquire::mock::{MockCamera, MockDriver};
//! use cam_acquire::{AccessMode, System, SystemConfig};
//!
//! # fn main() -> cam_acquire::Result<()> {
//! let driver = Arc::new(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
//! let system = System::startup(driver, SystemConfig::default())?;
//! let camera = system.open_camera_by_id("DEV_1", AccessMode::Full)?;
//! let frame = camera.acquire_single_image(Duration::from_secs(1))?;
//! println!("frame {} is {}x{}", frame.frame_id()?, frame.width()?, frame.height()?);
//! system.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod camera;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod format;
pub mod frame;
pub mod handler;
pub mod logging;
pub mod mock;
pub mod observer;
pub mod registry;
pub mod stream;
pub mod sync;
pub mod system;
pub mod validation;

#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use acquisition::{AcquisitionState, MultiFrameGrab, TeardownStep};
pub use camera::Camera;
pub use config::SystemConfig;
pub use dispatch::{DriverEvent, EventSink};
pub use driver::{AccessMode, CameraInfo, DiscoveryKind, Driver, TransportLayerType};
pub use error::{BatchOutcome, Error, Result};
pub use format::{Format, FourCC};
pub use frame::{
    AllocationMode, Frame, FrameDelivery, FramePtr, FrameStatus, PayloadType, ReceiveFlags,
    Registration, SharedBuffer,
};
pub use handler::{FrameHandler, FrameObserver};
pub use logging::{init_logging, LogLevel, LogOptions};
pub use observer::{CameraListObserver, InterfaceListObserver, UpdateTrigger};
pub use registry::{Interface, TransportLayer};
pub use stream::Stream;
pub use system::System;
