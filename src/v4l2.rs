//! V4L2 driver using the v4l crate.
//!
//! Every `/dev/video*` node is reported as a camera under a single "V4L2"
//! transport layer and interface. Acquisition runs an mmap stream on a
//! capture thread that copies each captured image into the oldest queued
//! frame.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::dispatch::EventSink;
use crate::driver::{
    AccessMode, CameraInfo, Completion, DeviceHandle, DeviceStreams, DiscoveryTarget, Driver,
    InterfaceHandle, InterfaceInfo, LocalDeviceHandle, ModuleHandle, StreamHandle,
    TransportLayerHandle, TransportLayerInfo, TransportLayerType, ACQUISITION_START,
    ACQUISITION_STOP,
};
use crate::error::{Error, Result};
use crate::format::{Format, FourCC};
use crate::frame::{FrameDelivery, FramePtr, FrameStatus, PayloadType};
use crate::sync::lock;

const TRANSPORT_LAYER: TransportLayerHandle = TransportLayerHandle(1);
const INTERFACE: InterfaceHandle = InterfaceHandle(2);
const MMAP_BUFFERS: u32 = 4;

struct Capture {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct OpenNode {
    path: PathBuf,
    stream: StreamHandle,
    local_device: LocalDeviceHandle,
    announced: Vec<FramePtr>,
    queue: VecDeque<(FramePtr, Completion)>,
    capturing: bool,
    capture: Option<Capture>,
}

impl OpenNode {
    fn abort_queued(&mut self) {
        for (frame, _) in self.queue.drain(..) {
            if let Err(err) = frame.abort() {
                warn!(frame = frame.id(), %err, "could not abort frame");
            }
        }
    }
}

#[derive(Default)]
struct State {
    sink: Option<EventSink>,
    devices: BTreeMap<DeviceHandle, OpenNode>,
    next_handle: u64,
}

impl State {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn node(&mut self, device: DeviceHandle) -> Result<&mut OpenNode> {
        self.devices
            .get_mut(&device)
            .ok_or_else(|| Error::BadParameter(format!("unknown device {device}")))
    }

    fn node_by_stream(&mut self, stream: StreamHandle) -> Result<&mut OpenNode> {
        self.devices
            .values_mut()
            .find(|node| node.stream == stream)
            .ok_or_else(|| Error::BadParameter(format!("unknown stream {stream}")))
    }
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn state(&self) -> Result<MutexGuard<'_, State>> {
        lock(&self.state, "v4l2 driver state")
    }
}

/// Driver for V4L2 capture devices.
pub struct V4l2Driver {
    shared: Arc<Shared>,
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Driver {
    /// Create the driver. Devices are enumerated on demand.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_handle: 0x100,
                    ..State::default()
                }),
            }),
        }
    }

    /// Current format of a device node.
    pub fn format_of(path: &Path) -> Result<Format> {
        let device = Device::with_path(path)?;
        let fmt = device.format()?;
        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    /// Request a format on a device node and return what the driver chose.
    pub fn set_format(path: &Path, format: &Format) -> Result<Format> {
        let device = Device::with_path(path)?;
        let mut fmt = device.format()?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();
        let fmt = device.set_format(&fmt)?;
        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn describe(path: &Path) -> Result<CameraInfo> {
        let device = Device::with_path(path)?;
        let caps = device.query_caps()?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(Error::NotAvailable(format!(
                "{} cannot capture video",
                path.display()
            )));
        }
        let id = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
        Ok(CameraInfo {
            id,
            extended_id: path.display().to_string(),
            name: caps.card,
            model: caps.driver,
            serial_number: caps.bus,
            interface: INTERFACE,
            transport_layer: TRANSPORT_LAYER,
            permitted_access: AccessMode::Exclusive,
        })
    }

    fn stop_capture(&self, device: DeviceHandle) -> Result<()> {
        let capture = self.shared.state()?.node(device)?.capture.take();
        if let Some(capture) = capture {
            capture.stop.store(true, Ordering::Release);
            if capture.thread.join().is_err() {
                warn!(%device, "v4l2 capture thread panicked");
            }
        }
        Ok(())
    }

    fn start_capture(&self, device: DeviceHandle) -> Result<()> {
        let mut state = self.shared.state()?;
        let node = state.node(device)?;
        if node.capture.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let path = node.path.clone();
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("v4l2-capture".to_owned())
            .spawn(move || {
                if let Err(err) = run_capture(&shared, device, &path, &flag) {
                    warn!(%device, %err, "v4l2 capture stopped");
                }
            })
            .map_err(|err| Error::Resources(format!("could not spawn capture thread: {err}")))?;
        node.capture = Some(Capture { stop, thread });
        Ok(())
    }
}

impl Driver for V4l2Driver {
    fn startup(&self, sink: EventSink) -> Result<()> {
        let mut state = self.shared.state()?;
        if state.sink.is_some() {
            return Err(Error::Already("v4l2 driver started".to_owned()));
        }
        state.sink = Some(sink);
        info!("v4l2 driver started");
        Ok(())
    }

    fn shutdown(&self) {
        let devices: Vec<DeviceHandle> = self
            .shared
            .state()
            .map(|state| state.devices.keys().copied().collect())
            .unwrap_or_default();
        for device in devices {
            if let Err(err) = self.close_camera(device) {
                warn!(%device, %err, "could not close v4l2 device");
            }
        }
        if let Ok(mut state) = self.shared.state() {
            state.sink = None;
        }
    }

    fn transport_layers(&self) -> Result<Vec<TransportLayerInfo>> {
        Ok(vec![TransportLayerInfo {
            handle: TRANSPORT_LAYER,
            id: "v4l2".to_owned(),
            name: "V4L2".to_owned(),
            model_name: "Video4Linux2".to_owned(),
            vendor: "linux".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            path: "/dev".to_owned(),
            kind: TransportLayerType::V4l2,
        }])
    }

    fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(vec![InterfaceInfo {
            handle: INTERFACE,
            id: "v4l2-video".to_owned(),
            name: "V4L2 video nodes".to_owned(),
            kind: TransportLayerType::V4l2,
            transport_layer: TRANSPORT_LAYER,
        }])
    }

    fn cameras(&self) -> Result<Vec<CameraInfo>> {
        let cameras = v4l::context::enum_devices()
            .iter()
            .filter_map(|node| match Self::describe(node.path()) {
                Ok(info) => Some(info),
                Err(err) => {
                    debug!(path = %node.path().display(), %err, "skipping video node");
                    None
                }
            })
            .collect();
        Ok(cameras)
    }

    fn camera_info(&self, id: &str) -> Result<CameraInfo> {
        let path = if id.starts_with('/') {
            PathBuf::from(id)
        } else {
            Path::new("/dev").join(id)
        };
        if !path.exists() {
            return Err(Error::NotFound(format!("camera {id}")));
        }
        Self::describe(&path)
    }

    fn open_camera(&self, extended_id: &str, mode: AccessMode) -> Result<DeviceHandle> {
        if mode == AccessMode::None {
            return Err(Error::BadParameter("access mode none".to_owned()));
        }
        let info = self.camera_info(extended_id)?;
        let mut state = self.shared.state()?;
        if state.sink.is_none() {
            return Err(Error::InvalidCall("v4l2 driver not started".to_owned()));
        }
        let device = DeviceHandle(state.allocate_handle());
        let stream = StreamHandle(state.allocate_handle());
        let local_device = LocalDeviceHandle(state.allocate_handle());
        state.devices.insert(
            device,
            OpenNode {
                path: PathBuf::from(&info.extended_id),
                stream,
                local_device,
                announced: Vec::new(),
                queue: VecDeque::new(),
                capturing: false,
                capture: None,
            },
        );
        info!(camera = %info.extended_id, %device, "v4l2 device opened");
        Ok(device)
    }

    fn device_streams(&self, device: DeviceHandle) -> Result<DeviceStreams> {
        let mut state = self.shared.state()?;
        let node = state.node(device)?;
        Ok(DeviceStreams {
            streams: vec![node.stream],
            local_device: node.local_device,
        })
    }

    fn close_camera(&self, device: DeviceHandle) -> Result<()> {
        self.stop_capture(device)?;
        let mut node = self
            .shared
            .state()?
            .devices
            .remove(&device)
            .ok_or_else(|| Error::BadParameter(format!("unknown device {device}")))?;
        node.abort_queued();
        debug!(%device, "v4l2 device closed");
        Ok(())
    }

    fn payload_size(&self, device: DeviceHandle) -> Result<usize> {
        let path = self.shared.state()?.node(device)?.path.clone();
        let format = Self::format_of(&path)?;
        usize::try_from(format.size).map_err(|_| Error::InternalFault("payload size overflow".to_owned()))
    }

    fn stream_buffer_alignment(&self, stream: StreamHandle) -> Result<Option<usize>> {
        self.shared.state()?.node_by_stream(stream)?;
        Ok(None)
    }

    fn announce_frame(&self, stream: StreamHandle, frame: &FramePtr) -> Result<()> {
        let mut state = self.shared.state()?;
        let node = state.node_by_stream(stream)?;
        if node.announced.iter().any(|known| Arc::ptr_eq(known, frame)) {
            return Err(Error::InvalidCall("frame already announced".to_owned()));
        }
        if !frame.has_memory()? {
            frame.attach_driver_memory(vec![0; frame.buffer_size()])?;
        }
        node.announced.push(Arc::clone(frame));
        Ok(())
    }

    fn revoke_frame(&self, stream: StreamHandle, frame: &FramePtr) -> Result<()> {
        let mut state = self.shared.state()?;
        let node = state.node_by_stream(stream)?;
        let position = node
            .announced
            .iter()
            .position(|known| Arc::ptr_eq(known, frame))
            .ok_or_else(|| Error::NotFound(format!("frame {} not announced", frame.id())))?;
        node.announced.remove(position);
        node.queue.retain(|(queued, _)| !Arc::ptr_eq(queued, frame));
        Ok(())
    }

    fn revoke_all_frames(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.shared.state()?;
        let node = state.node_by_stream(stream)?;
        node.abort_queued();
        node.announced.clear();
        Ok(())
    }

    fn queue_frame(&self, stream: StreamHandle, frame: &FramePtr, completion: Completion) -> Result<()> {
        let mut state = self.shared.state()?;
        let node = state.node_by_stream(stream)?;
        if !node.capturing {
            return Err(Error::InvalidCall("capture not started".to_owned()));
        }
        if node.queue.iter().any(|(queued, _)| Arc::ptr_eq(queued, frame)) {
            return Err(Error::InvalidCall("frame already queued".to_owned()));
        }
        node.queue.push_back((Arc::clone(frame), completion));
        Ok(())
    }

    fn flush_queue(&self, stream: StreamHandle) -> Result<()> {
        self.shared.state()?.node_by_stream(stream)?.abort_queued();
        Ok(())
    }

    fn capture_start(&self, stream: StreamHandle) -> Result<()> {
        self.shared.state()?.node_by_stream(stream)?.capturing = true;
        Ok(())
    }

    fn capture_end(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.shared.state()?;
        let node = state.node_by_stream(stream)?;
        if !node.capturing {
            return Err(Error::Already("capture not running".to_owned()));
        }
        node.capturing = false;
        Ok(())
    }

    fn run_command(&self, module: ModuleHandle, name: &str) -> Result<()> {
        match (module, name) {
            (ModuleHandle::Device(device), ACQUISITION_START) => self.start_capture(device),
            (ModuleHandle::Device(device), ACQUISITION_STOP) => self.stop_capture(device),
            _ => Err(Error::NotFound(format!("command {name}"))),
        }
    }

    fn is_command_done(&self, _module: ModuleHandle, name: &str) -> Result<bool> {
        match name {
            ACQUISITION_START | ACQUISITION_STOP => Ok(true),
            _ => Err(Error::NotFound(format!("command {name}"))),
        }
    }

    fn enable_discovery(&self, target: DiscoveryTarget) -> Result<()> {
        // V4L2 nodes have no arrival notifications without udev.
        debug!(?target, "v4l2 discovery events are not produced");
        Ok(())
    }

    fn disable_discovery(&self, _target: DiscoveryTarget) -> Result<()> {
        Ok(())
    }
}

impl Drop for V4l2Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_capture(shared: &Shared, device: DeviceHandle, path: &Path, stop: &AtomicBool) -> Result<()> {
    let format = V4l2Driver::format_of(path)?;
    let handle = Device::with_path(path)?;
    let mut stream = MmapStream::with_buffers(&handle, Type::VideoCapture, MMAP_BUFFERS)?;
    debug!(%device, %format.fourcc, "v4l2 capture running");

    while !stop.load(Ordering::Acquire) {
        let (data, meta) = stream.next()?;

        let (next, sink) = {
            let mut state = shared.state()?;
            let sink = state.sink.clone();
            let node = state.node(device)?;
            let next = if node.capturing { node.queue.pop_front() } else { None };
            (next, sink)
        };
        let Some((frame, completion)) = next else {
            trace!(sequence = meta.sequence, "no queued frame, image dropped");
            continue;
        };

        let used = usize::try_from(meta.bytesused).unwrap_or(usize::MAX).min(data.len());
        let image = data.get(..used).unwrap_or(data);
        let copied = frame.with_buffer_mut(|buffer| {
            let len = buffer.len().min(image.len());
            if let (Some(target), Some(source)) = (buffer.get_mut(..len), image.get(..len)) {
                target.copy_from_slice(source);
            }
            len
        })?;

        let status = if copied < image.len() {
            FrameStatus::TooSmall
        } else {
            FrameStatus::Complete
        };
        // V4L2 timestamps are non-negative in practice
        let secs = u64::try_from(meta.timestamp.sec.max(0)).unwrap_or(0);
        let micros = u64::try_from(meta.timestamp.usec.max(0)).unwrap_or(0);
        let timestamp = Duration::from_secs(secs) + Duration::from_micros(micros);
        let delivery = FrameDelivery::new(status)
            .with_dimension(format.width, format.height)
            .with_offset(0, 0)
            .with_frame_id(u64::from(meta.sequence))
            .with_timestamp(u64::try_from(timestamp.as_nanos()).unwrap_or(u64::MAX))
            .with_payload_type(PayloadType::Image)
            .with_pixel_format(format.fourcc)
            .with_image(0, copied);
        frame.complete(delivery)?;

        if completion == Completion::Notify {
            if let Some(sink) = sink {
                sink.frame_done(frame)?;
            }
        }
    }
    Ok(())
}
