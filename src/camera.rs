//! Device facade: identity, open/close, streams and named commands of one
//! camera. Image acquisition lives in [`crate::acquisition`].

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::driver::{
    AccessMode, CameraInfo, DeviceHandle, Driver, InterfaceHandle, LocalDeviceHandle,
    ModuleHandle, TransportLayerHandle, ADJUST_PACKET_SIZE,
};
use crate::error::{Error, Result};
use crate::frame::FramePtr;
use crate::stream::Stream;
use crate::sync::{lock, ReaderWriterLock};

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
struct Session {
    device: DeviceHandle,
    local_device: LocalDeviceHandle,
}

/// A camera known to the registry.
///
/// The camera references its interface and transport layer by handle; look
/// them up through [`crate::System`].
pub struct Camera {
    info: CameraInfo,
    driver: Arc<dyn Driver>,
    session: Mutex<Option<Session>>,
    streams: ReaderWriterLock<Vec<Arc<Stream>>>,
    queue_gate: Mutex<bool>,
}

impl Camera {
    pub(crate) fn new(info: CameraInfo, driver: Arc<dyn Driver>) -> Self {
        Self {
            info,
            driver,
            session: Mutex::new(None),
            streams: ReaderWriterLock::new("camera streams", Vec::new()),
            queue_gate: Mutex::new(true),
        }
    }

    /// Identifier unique on the camera's transport layer.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Identifier unique across all transport layers.
    pub fn extended_id(&self) -> &str {
        &self.info.extended_id
    }

    /// Returns `true` if `id` is this camera's extended id.
    pub fn extended_id_equals(&self, id: &str) -> bool {
        self.info.extended_id == id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Model name.
    pub fn model(&self) -> &str {
        &self.info.model
    }

    /// Serial number.
    pub fn serial_number(&self) -> &str {
        &self.info.serial_number
    }

    /// Handle of the interface the camera is attached to.
    pub const fn interface_handle(&self) -> InterfaceHandle {
        self.info.interface
    }

    /// Handle of the transport layer the camera is reached through.
    pub const fn transport_layer_handle(&self) -> TransportLayerHandle {
        self.info.transport_layer
    }

    /// Information captured when the camera was discovered.
    pub const fn info(&self) -> &CameraInfo {
        &self.info
    }

    /// Strongest access mode currently permitted. Queried from the driver each call.
    pub fn permitted_access(&self) -> Result<AccessMode> {
        Ok(self.driver.camera_info(&self.info.extended_id)?.permitted_access)
    }

    /// Returns `true` while the camera is open.
    pub fn is_open(&self) -> bool {
        lock(&self.session, "camera session").is_ok_and(|session| session.is_some())
    }

    /// Driver handle of the open device.
    pub fn device_handle(&self) -> Result<DeviceHandle> {
        self.session().map(|session| session.device)
    }

    /// Driver handle of the host-side device.
    pub fn local_device_handle(&self) -> Result<LocalDeviceHandle> {
        self.session().map(|session| session.local_device)
    }

    /// Open the camera and its streams. Only the first stream is opened.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCall` if the camera is already open. If the driver
    /// opens the device but its streams cannot be enumerated, the device is
    /// closed again and the enumeration error returned.
    pub fn open(&self, mode: AccessMode) -> Result<()> {
        let mut session = lock(&self.session, "camera session")?;
        if session.is_some() {
            return Err(Error::InvalidCall(format!("camera {} already open", self.info.id)));
        }

        let device = self.driver.open_camera(&self.info.extended_id, mode)?;
        let handles = match self.driver.device_streams(device) {
            Ok(handles) => handles,
            Err(err) => {
                if let Err(close_err) = self.driver.close_camera(device) {
                    warn!(camera = %self.info.id, %close_err, "could not close camera after failed open");
                }
                return Err(err);
            }
        };

        let streams: Vec<Arc<Stream>> = handles
            .streams
            .iter()
            .enumerate()
            .map(|(index, handle)| Arc::new(Stream::new(Arc::clone(&self.driver), *handle, index)))
            .collect();
        if let Some(primary) = streams.first() {
            primary.open()?;
        }
        *self.streams.enter_write()? = streams;
        *session = Some(Session {
            device,
            local_device: handles.local_device,
        });

        info!(camera = %self.info.id, device = %device, ?mode, "camera opened");
        Ok(())
    }

    /// Close the camera and all its streams.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotOpen` if the camera is not open.
    pub fn close(&self) -> Result<()> {
        let mut session = lock(&self.session, "camera session")?;
        let Some(open) = session.take() else {
            return Err(Error::DeviceNotOpen);
        };

        let streams = std::mem::take(&mut *self.streams.enter_write_exclusive()?);
        for stream in streams {
            if let Err(err) = stream.close() {
                warn!(camera = %self.info.id, stream = %stream.handle(), %err, "could not close stream");
            }
        }

        self.driver.close_camera(open.device)?;
        info!(camera = %self.info.id, "camera closed");
        Ok(())
    }

    /// Streams of the open camera in index order.
    pub fn streams(&self) -> Result<Vec<Arc<Stream>>> {
        self.session()?;
        Ok(self.streams.enter_read()?.clone())
    }

    /// The first stream, which carries image data.
    pub fn primary_stream(&self) -> Result<Arc<Stream>> {
        self.session()?;
        self.streams
            .enter_read()?
            .first()
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("stream of camera {}", self.info.id)))
    }

    /// Bytes needed to hold one payload.
    pub fn payload_size(&self) -> Result<usize> {
        self.driver.payload_size(self.device_handle()?)
    }

    /// Buffer alignment required by the primary stream.
    pub fn stream_buffer_alignment(&self) -> Result<usize> {
        self.primary_stream()?.buffer_alignment()
    }

    /// Announce `frame` on the primary stream.
    pub fn announce_frame(&self, frame: &FramePtr) -> Result<()> {
        self.primary_stream()?.announce_frame(frame)
    }

    /// Revoke `frame` from the primary stream.
    pub fn revoke_frame(&self, frame: &FramePtr) -> Result<()> {
        self.primary_stream()?.revoke_frame(frame)
    }

    /// Revoke every frame from the primary stream.
    pub fn revoke_all_frames(&self) -> Result<()> {
        self.primary_stream()?.revoke_all_frames()
    }

    /// Queue `frame` on the primary stream.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCall` while continuous acquisition is being stopped.
    pub fn queue_frame(&self, frame: &FramePtr) -> Result<()> {
        let gate = lock(&self.queue_gate, "queue gate")?;
        if !*gate {
            return Err(Error::InvalidCall("frame queue is disabled".to_owned()));
        }
        let result = self.primary_stream()?.queue_frame(frame);
        drop(gate);
        result
    }

    /// Flush the primary stream's queue.
    pub fn flush_queue(&self) -> Result<()> {
        self.primary_stream()?.flush_queue()
    }

    /// Start capture on the primary stream.
    pub fn start_capture(&self) -> Result<()> {
        self.primary_stream()?.start_capture()
    }

    /// End capture on the primary stream.
    pub fn end_capture(&self) -> Result<()> {
        self.primary_stream()?.end_capture()
    }

    /// Run a named command on the device.
    pub fn run_command(&self, name: &str) -> Result<()> {
        debug!(camera = %self.info.id, command = name, "running command");
        self.driver
            .run_command(ModuleHandle::Device(self.device_handle()?), name)
    }

    /// Negotiate the largest usable packet size on the primary stream.
    ///
    /// Runs the adjustment command and polls until it completes.
    ///
    /// # Errors
    ///
    /// Returns `NotAvailable` if the stream has no such command and
    /// `Timeout` if it does not finish within `timeout`.
    pub fn adjust_packet_size(&self, timeout: Duration) -> Result<()> {
        let module = ModuleHandle::Stream(self.primary_stream()?.handle());
        self.driver
            .run_command(module, ADJUST_PACKET_SIZE)
            .map_err(|err| match err {
                Error::NotFound(_) => Error::NotAvailable(ADJUST_PACKET_SIZE.to_owned()),
                other => other,
            })?;

        let deadline = Instant::now() + timeout;
        while !self.driver.is_command_done(module, ADJUST_PACKET_SIZE)? {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            thread::sleep(COMMAND_POLL_INTERVAL);
        }
        debug!(camera = %self.info.id, "packet size adjusted");
        Ok(())
    }

    pub(crate) const fn queue_gate(&self) -> &Mutex<bool> {
        &self.queue_gate
    }

    fn session(&self) -> Result<Session> {
        (*lock(&self.session, "camera session")?).ok_or(Error::DeviceNotOpen)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                warn!(camera = %self.info.id, %err, "could not close camera on drop");
            }
        }
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("id", &self.info.id)
            .field("extended_id", &self.info.extended_id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::mock::{MockCamera, MockDriver};

    fn camera_on(driver: &Arc<MockDriver>) -> (Camera, Dispatcher) {
        let dispatcher = Dispatcher::new(8);
        driver.startup(dispatcher.sink()).expect("startup should succeed");
        let info = driver.cameras().expect("cameras")[0].clone();
        (Camera::new(info, Arc::clone(driver) as Arc<dyn Driver>), dispatcher)
    }

    #[test]
    fn test_open_close() {
        let driver = Arc::new(MockDriver::new().with_camera(MockCamera::new("DEV_1").with_streams(2)));
        let (camera, _dispatcher) = camera_on(&driver);

        assert!(matches!(camera.streams(), Err(Error::DeviceNotOpen)));
        camera.open(AccessMode::Full).expect("open should succeed");
        assert!(matches!(
            camera.open(AccessMode::Full),
            Err(Error::InvalidCall(_))
        ));

        let streams = camera.streams().expect("streams");
        assert_eq!(streams.len(), 2);
        assert!(streams[0].is_open());
        assert!(!streams[1].is_open());

        camera.close().expect("close should succeed");
        assert_eq!(camera.close(), Err(Error::DeviceNotOpen));
        assert_eq!(driver.open_devices(), 0);
    }

    #[test]
    fn test_failed_stream_enumeration_closes_device() {
        let driver = Arc::new(
            MockDriver::new()
                .with_camera(MockCamera::new("DEV_1"))
                .with_stream_query_failure(),
        );
        let (camera, _dispatcher) = camera_on(&driver);

        assert!(camera.open(AccessMode::Full).is_err());
        assert!(!camera.is_open());
        assert_eq!(driver.open_devices(), 0);
    }

    #[test]
    fn test_open_respects_permitted_access() {
        let driver = Arc::new(
            MockDriver::new().with_camera(MockCamera::new("DEV_1").with_permitted_access(AccessMode::Read)),
        );
        let (camera, _dispatcher) = camera_on(&driver);

        assert_eq!(camera.permitted_access().expect("access"), AccessMode::Read);
        assert!(camera.open(AccessMode::Full).is_err());
        camera.open(AccessMode::Read).expect("read-only open should succeed");
    }

    #[test]
    fn test_queue_gate_rejects_while_closed() {
        let driver = Arc::new(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
        let (camera, _dispatcher) = camera_on(&driver);
        camera.open(AccessMode::Full).expect("open should succeed");

        *camera.queue_gate().lock().expect("lock") = false;
        let frame = crate::frame::Frame::new(1024, crate::frame::AllocationMode::AnnounceFrame, 1)
            .expect("frame should allocate");
        assert!(matches!(
            camera.queue_frame(&frame),
            Err(Error::InvalidCall(_))
        ));
    }

    #[test]
    fn test_adjust_packet_size() {
        let driver = Arc::new(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
        let (camera, _dispatcher) = camera_on(&driver);
        assert_eq!(
            camera.adjust_packet_size(Duration::from_millis(100)),
            Err(Error::DeviceNotOpen)
        );

        camera.open(AccessMode::Full).expect("open should succeed");
        camera
            .adjust_packet_size(Duration::from_millis(100))
            .expect("adjust should succeed");
        assert!(driver.commands().iter().any(|command| command == ADJUST_PACKET_SIZE));
    }
}
