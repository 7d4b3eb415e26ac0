//! Mock driver for development and testing without hardware.
//!
//! [`MockDriver`] simulates one transport layer with configurable
//! interfaces and cameras. A worker thread fills queued frames with YUYV
//! test patterns once a device is acquiring, and hot-plug helpers emit
//! discovery events the way a real transport would.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatch::EventSink;
use crate::driver::{
    AccessMode, CameraInfo, Completion, DeviceHandle, DeviceStreams, DiscoveryKind,
    DiscoveryTarget, Driver, InterfaceHandle, InterfaceInfo, LocalDeviceHandle, ModuleHandle,
    StreamHandle, TransportLayerHandle, TransportLayerInfo, TransportLayerType, ACQUISITION_START,
    ACQUISITION_STOP, ADJUST_PACKET_SIZE,
};
use crate::error::{Error, Result};
use crate::format::{Format, FourCC};
use crate::frame::{AllocationMode, FrameDelivery, FramePtr, FrameStatus, PayloadType};
use crate::sync::{lock, wait_timeout};

const TRANSPORT_LAYER: TransportLayerHandle = TransportLayerHandle(1);
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    #[default]
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// A simulated camera.
#[derive(Debug, Clone)]
pub struct MockCamera {
    id: String,
    name: String,
    model: String,
    serial_number: String,
    interface_id: Option<String>,
    aliases: Vec<String>,
    format: Format,
    streams: usize,
    buffer_alignment: Option<usize>,
    permitted_access: AccessMode,
}

impl MockCamera {
    /// Create a camera with a 64x48 YUYV payload and one stream.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: "Mock Camera".to_owned(),
            model: "MOCK-1".to_owned(),
            serial_number: format!("SN-{id}"),
            interface_id: None,
            aliases: Vec::new(),
            format: Format::new(64, 48, FourCC::YUYV),
            streams: 1,
            buffer_alignment: None,
            permitted_access: AccessMode::Exclusive,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        name.clone_into(&mut self.name);
        self
    }

    /// Attach the camera to the interface with this id instead of the first one.
    #[must_use]
    pub fn with_interface(mut self, interface_id: &str) -> Self {
        self.interface_id = Some(interface_id.to_owned());
        self
    }

    /// Add an alias the driver resolves to this camera (for example an IP address).
    #[must_use]
    pub fn with_alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_owned());
        self
    }

    /// Set the payload format.
    #[must_use]
    pub const fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the number of streams.
    #[must_use]
    pub const fn with_streams(mut self, streams: usize) -> Self {
        self.streams = streams;
        self
    }

    /// Report a stream buffer alignment.
    #[must_use]
    pub const fn with_buffer_alignment(mut self, alignment: usize) -> Self {
        self.buffer_alignment = Some(alignment);
        self
    }

    /// Set the strongest access mode the camera permits.
    #[must_use]
    pub const fn with_permitted_access(mut self, mode: AccessMode) -> Self {
        self.permitted_access = mode;
        self
    }
}

struct CameraEntry {
    camera: MockCamera,
    info: CameraInfo,
}

struct OpenDevice {
    extended_id: String,
    format: Format,
    local_device: LocalDeviceHandle,
    streams: Vec<StreamHandle>,
    acquiring: bool,
    frame_counter: u64,
}

#[derive(Default)]
struct StreamState {
    device: Option<DeviceHandle>,
    announced: Vec<FramePtr>,
    implicitly_announced: Vec<FramePtr>,
    queue: VecDeque<(FramePtr, Completion)>,
    capturing: bool,
}

impl StreamState {
    fn abort_queued(&mut self) {
        for (frame, _) in self.queue.drain(..) {
            if let Err(err) = frame.abort() {
                warn!(frame = frame.id(), %err, "could not abort frame");
            }
        }
    }

    /// Drop the frames that only became announced by being queued.
    fn forget_implicit(&mut self) {
        for frame in self.implicitly_announced.drain(..) {
            self.announced.retain(|known| !Arc::ptr_eq(known, &frame));
        }
    }
}

#[derive(Default)]
struct Faults {
    announce_limit: Option<usize>,
    failing_commands: Vec<String>,
    stream_query_failure: bool,
    discovery_failure: bool,
    failing_queue_calls: Vec<usize>,
    queue_calls: usize,
}

struct State {
    running: bool,
    sink: Option<EventSink>,
    transport_layer: TransportLayerInfo,
    interfaces: Vec<InterfaceInfo>,
    cameras: Vec<CameraEntry>,
    devices: BTreeMap<DeviceHandle, OpenDevice>,
    streams: BTreeMap<StreamHandle, StreamState>,
    discovery: HashSet<DiscoveryTarget>,
    commands: Vec<String>,
    faults: Faults,
    frame_interval: Duration,
    pattern: TestPattern,
    next_handle: u64,
}

impl State {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn camera(&self, id: &str) -> Option<&CameraEntry> {
        self.cameras.iter().find(|entry| {
            entry.info.extended_id == id
                || entry.info.id == id
                || entry.camera.aliases.iter().any(|alias| alias == id)
        })
    }

    fn stream(&mut self, stream: StreamHandle) -> Result<&mut StreamState> {
        self.streams
            .get_mut(&stream)
            .ok_or_else(|| Error::BadParameter(format!("unknown stream {stream}")))
    }

    fn interface_info(&self, camera: &MockCamera) -> Option<&InterfaceInfo> {
        match &camera.interface_id {
            Some(id) => self.interfaces.iter().find(|interface| &interface.id == id),
            None => self.interfaces.first(),
        }
    }

    fn add_camera(&mut self, camera: MockCamera) -> Option<String> {
        let interface = self.interface_info(&camera)?;
        let info = CameraInfo {
            id: camera.id.clone(),
            extended_id: format!("{}::{}", interface.id, camera.id),
            name: camera.name.clone(),
            model: camera.model.clone(),
            serial_number: camera.serial_number.clone(),
            interface: interface.handle,
            transport_layer: interface.transport_layer,
            permitted_access: camera.permitted_access,
        };
        let extended_id = info.extended_id.clone();
        self.cameras.push(CameraEntry { camera, info });
        Some(extended_id)
    }

    fn add_interface(&mut self, id: &str) {
        let handle = InterfaceHandle(self.allocate_handle());
        self.interfaces.push(InterfaceInfo {
            handle,
            id: id.to_owned(),
            name: format!("Mock interface {id}"),
            kind: TransportLayerType::Custom,
            transport_layer: self.transport_layer.handle,
        });
    }

    /// Pop the oldest queued frame of the first stream ready to deliver.
    fn next_job(&mut self) -> Option<Job> {
        let sink = self.sink.clone()?;
        let pattern = self.pattern;
        let interval = self.frame_interval;
        let devices = &mut self.devices;

        self.streams.values_mut().find_map(|stream| {
            let device = devices.get_mut(&stream.device?)?;
            if !stream.capturing || !device.acquiring {
                return None;
            }
            let (frame, completion) = stream.queue.pop_front()?;
            device.frame_counter += 1;
            Some(Job {
                frame,
                completion,
                format: device.format,
                pattern,
                frame_id: device.frame_counter,
                interval,
                sink: sink.clone(),
            })
        })
    }
}

struct Job {
    frame: FramePtr,
    completion: Completion,
    format: Format,
    pattern: TestPattern,
    frame_id: u64,
    interval: Duration,
    sink: EventSink,
}

impl Job {
    fn run(self) {
        let payload = usize::try_from(self.format.size).unwrap_or(usize::MAX);
        let written = self.frame.with_buffer_mut(|buffer| {
            let len = buffer.len().min(payload);
            if let Some(target) = buffer.get_mut(..len) {
                fill_pattern(target, &self.format, self.pattern);
            }
            len
        });

        let delivery = match written {
            Ok(len) => {
                let status = if len < payload {
                    FrameStatus::TooSmall
                } else {
                    FrameStatus::Complete
                };
                let timestamp = u64::try_from(self.interval.as_nanos())
                    .unwrap_or(u64::MAX)
                    .saturating_mul(self.frame_id);
                FrameDelivery::new(status)
                    .with_dimension(self.format.width, self.format.height)
                    .with_offset(0, 0)
                    .with_frame_id(self.frame_id)
                    .with_timestamp(timestamp)
                    .with_payload_type(PayloadType::Image)
                    .with_pixel_format(self.format.fourcc)
                    .with_image(0, len)
            }
            Err(err) => {
                warn!(frame = self.frame.id(), %err, "could not fill frame");
                FrameDelivery::new(FrameStatus::Incomplete).with_pixel_format(self.format.fourcc)
            }
        };

        if let Err(err) = self.frame.complete(delivery) {
            warn!(frame = self.frame.id(), %err, "could not complete frame");
            return;
        }
        if self.completion == Completion::Notify {
            if let Err(err) = self.sink.frame_done(self.frame) {
                debug!(%err, "frame-done event not delivered");
            }
        }
    }
}

struct Inner {
    state: Mutex<State>,
    wake: Condvar,
}

/// Simulated transport driver.
pub struct MockDriver {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a driver with one transport layer, one interface and no cameras.
    #[must_use]
    pub fn new() -> Self {
        let mut state = State {
            running: false,
            sink: None,
            transport_layer: TransportLayerInfo {
                handle: TRANSPORT_LAYER,
                id: "mock-tl".to_owned(),
                name: "Mock transport layer".to_owned(),
                model_name: "MockTL".to_owned(),
                vendor: "mock".to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                path: "mock".to_owned(),
                kind: TransportLayerType::Custom,
            },
            interfaces: Vec::new(),
            cameras: Vec::new(),
            devices: BTreeMap::new(),
            streams: BTreeMap::new(),
            discovery: HashSet::new(),
            commands: Vec::new(),
            faults: Faults::default(),
            frame_interval: Duration::from_millis(5),
            pattern: TestPattern::ColorBars,
            next_handle: 0x100,
        };
        state.add_interface("mock-if0");

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Add a camera to the inventory.
    #[must_use]
    pub fn with_camera(self, camera: MockCamera) -> Self {
        self.configure(|state| {
            state.add_camera(camera);
        })
    }

    /// Add an interface to the inventory.
    #[must_use]
    pub fn with_interface(self, id: &str) -> Self {
        self.configure(|state| state.add_interface(id))
    }

    /// Fail announces once `limit` frames are announced on a stream.
    #[must_use]
    pub fn with_announce_limit(self, limit: usize) -> Self {
        self.configure(|state| state.faults.announce_limit = Some(limit))
    }

    /// Fail every run of the named command.
    #[must_use]
    pub fn with_failing_command(self, name: &str) -> Self {
        self.configure(|state| state.faults.failing_commands.push(name.to_owned()))
    }

    /// Fail stream enumeration after a device is opened.
    #[must_use]
    pub fn with_stream_query_failure(self) -> Self {
        self.configure(|state| state.faults.stream_query_failure = true)
    }

    /// Fail the `nth` call to queue a frame (1-based, counted per driver).
    #[must_use]
    pub fn with_failing_queue_call(self, nth: usize) -> Self {
        self.configure(|state| state.faults.failing_queue_calls.push(nth))
    }

    /// Fail enabling discovery.
    #[must_use]
    pub fn with_discovery_failure(self) -> Self {
        self.configure(|state| state.faults.discovery_failure = true)
    }

    /// Set the pause between two delivered frames.
    #[must_use]
    pub fn with_frame_interval(self, interval: Duration) -> Self {
        self.configure(|state| state.frame_interval = interval)
    }

    /// Set the pattern written into frames.
    #[must_use]
    pub fn with_pattern(self, pattern: TestPattern) -> Self {
        self.configure(|state| state.pattern = pattern)
    }

    /// Plug a camera in, emitting a detection event if camera discovery is on.
    ///
    /// Returns the camera's extended id.
    pub fn plug_camera(&self, camera: MockCamera) -> Result<String> {
        let (extended_id, sink) = {
            let mut state = self.state()?;
            let extended_id = state
                .add_camera(camera)
                .ok_or_else(|| Error::NotFound("interface for mock camera".to_owned()))?;
            (extended_id, state.discovery_sink(DiscoveryTarget::Cameras))
        };
        if let Some(sink) = sink {
            sink.camera_changed(&extended_id, DiscoveryKind::Detected)?;
        }
        Ok(extended_id)
    }

    /// Unplug a camera, emitting a missing event if camera discovery is on.
    pub fn unplug_camera(&self, id: &str) -> Result<()> {
        let (extended_id, sink) = {
            let mut state = self.state()?;
            let position = state
                .cameras
                .iter()
                .position(|entry| entry.info.extended_id == id || entry.info.id == id)
                .ok_or_else(|| Error::NotFound(format!("mock camera {id}")))?;
            let entry = state.cameras.remove(position);
            (entry.info.extended_id, state.discovery_sink(DiscoveryTarget::Cameras))
        };
        if let Some(sink) = sink {
            sink.camera_changed(&extended_id, DiscoveryKind::Missing)?;
        }
        Ok(())
    }

    /// Report a reachability change of a camera.
    pub fn touch_camera(&self, id: &str, reachable: bool) -> Result<()> {
        let (extended_id, sink) = {
            let state = self.state()?;
            let entry = state
                .camera(id)
                .ok_or_else(|| Error::NotFound(format!("mock camera {id}")))?;
            (
                entry.info.extended_id.clone(),
                state.discovery_sink(DiscoveryTarget::Cameras),
            )
        };
        let kind = if reachable {
            DiscoveryKind::Reachable
        } else {
            DiscoveryKind::Unreachable
        };
        if let Some(sink) = sink {
            sink.camera_changed(&extended_id, kind)?;
        }
        Ok(())
    }

    /// Change the access mode a camera permits.
    pub fn set_permitted_access(&self, id: &str, mode: AccessMode) -> Result<()> {
        let mut state = self.state()?;
        let entry = state
            .cameras
            .iter_mut()
            .find(|entry| entry.info.extended_id == id || entry.info.id == id)
            .ok_or_else(|| Error::NotFound(format!("mock camera {id}")))?;
        entry.camera.permitted_access = mode;
        entry.info.permitted_access = mode;
        Ok(())
    }

    /// Plug an interface in, emitting an event if interface discovery is on.
    pub fn plug_interface(&self, id: &str) -> Result<()> {
        let sink = {
            let mut state = self.state()?;
            state.add_interface(id);
            state.discovery_sink(DiscoveryTarget::Interfaces)
        };
        if let Some(sink) = sink {
            sink.interface_changed(id)?;
        }
        Ok(())
    }

    /// Unplug an interface, emitting an event if interface discovery is on.
    pub fn unplug_interface(&self, id: &str) -> Result<()> {
        let sink = {
            let mut state = self.state()?;
            let position = state
                .interfaces
                .iter()
                .position(|interface| interface.id == id)
                .ok_or_else(|| Error::NotFound(format!("mock interface {id}")))?;
            state.interfaces.remove(position);
            state.discovery_sink(DiscoveryTarget::Interfaces)
        };
        if let Some(sink) = sink {
            sink.interface_changed(id)?;
        }
        Ok(())
    }

    /// Frames waiting in a stream's input queue.
    pub fn queued_frames(&self, stream: StreamHandle) -> usize {
        self.state()
            .ok()
            .and_then(|state| state.streams.get(&stream).map(|s| s.queue.len()))
            .unwrap_or(0)
    }

    /// Frames announced on a stream.
    pub fn announced_frames(&self, stream: StreamHandle) -> usize {
        self.state()
            .ok()
            .and_then(|state| state.streams.get(&stream).map(|s| s.announced.len()))
            .unwrap_or(0)
    }

    /// Commands run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().map(|state| state.commands.clone()).unwrap_or_default()
    }

    /// Number of open devices.
    pub fn open_devices(&self) -> usize {
        self.state().map_or(0, |state| state.devices.len())
    }

    /// Returns `true` if discovery events for `target` are enabled.
    pub fn is_discovery_enabled(&self, target: DiscoveryTarget) -> bool {
        self.state().is_ok_and(|state| state.discovery.contains(&target))
    }

    /// Returns `true` while the device runs acquisition.
    pub fn is_acquiring(&self, device: DeviceHandle) -> bool {
        self.state()
            .is_ok_and(|state| state.devices.get(&device).is_some_and(|d| d.acquiring))
    }

    fn configure<F: FnOnce(&mut State)>(self, update: F) -> Self {
        if let Ok(mut state) = self.state() {
            update(&mut state);
        }
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        lock(&self.inner.state, "mock driver state")
    }
}

impl State {
    fn discovery_sink(&self, target: DiscoveryTarget) -> Option<EventSink> {
        if self.discovery.contains(&target) {
            self.sink.clone()
        } else {
            None
        }
    }
}

impl Driver for MockDriver {
    fn startup(&self, sink: EventSink) -> Result<()> {
        {
            let mut state = self.state()?;
            if state.running {
                return Err(Error::Already("mock driver started".to_owned()));
            }
            state.running = true;
            state.sink = Some(sink);
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("mock-capture".to_owned())
            .spawn(move || run_worker(&inner))
            .map_err(|err| Error::Resources(format!("could not spawn mock worker: {err}")))?;
        *lock(&self.worker, "mock worker")? = Some(handle);
        debug!("mock driver started");
        Ok(())
    }

    fn shutdown(&self) {
        if let Ok(mut state) = self.state() {
            state.running = false;
            state.sink = None;
            state.discovery.clear();
        }
        self.inner.wake.notify_all();

        let handle = lock(&self.worker, "mock worker").ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("mock worker panicked");
            }
        }
    }

    fn transport_layers(&self) -> Result<Vec<TransportLayerInfo>> {
        Ok(vec![self.state()?.transport_layer.clone()])
    }

    fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(self.state()?.interfaces.clone())
    }

    fn cameras(&self) -> Result<Vec<CameraInfo>> {
        Ok(self.state()?.cameras.iter().map(|entry| entry.info.clone()).collect())
    }

    fn camera_info(&self, id: &str) -> Result<CameraInfo> {
        self.state()?
            .camera(id)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| Error::NotFound(format!("camera {id}")))
    }

    fn open_camera(&self, extended_id: &str, mode: AccessMode) -> Result<DeviceHandle> {
        let mut state = self.state()?;
        if !state.running {
            return Err(Error::InvalidCall("mock driver not started".to_owned()));
        }
        let entry = state
            .camera(extended_id)
            .ok_or_else(|| Error::NotFound(format!("camera {extended_id}")))?;
        if !entry.camera.permitted_access.allows(mode) {
            return Err(Error::InvalidCall(format!(
                "{mode:?} access not permitted on {extended_id}"
            )));
        }
        let format = entry.camera.format;
        let stream_count = entry.camera.streams;
        let extended_id = entry.info.extended_id.clone();

        let device = DeviceHandle(state.allocate_handle());
        let local_device = LocalDeviceHandle(state.allocate_handle());
        let mut streams = Vec::with_capacity(stream_count);
        for _ in 0..stream_count {
            let stream = StreamHandle(state.allocate_handle());
            state.streams.insert(
                stream,
                StreamState {
                    device: Some(device),
                    ..StreamState::default()
                },
            );
            streams.push(stream);
        }
        state.devices.insert(
            device,
            OpenDevice {
                extended_id,
                format,
                local_device,
                streams,
                acquiring: false,
                frame_counter: 0,
            },
        );
        Ok(device)
    }

    fn device_streams(&self, device: DeviceHandle) -> Result<DeviceStreams> {
        let state = self.state()?;
        if state.faults.stream_query_failure {
            return Err(Error::Driver {
                code: -5,
                message: "stream enumeration failed".to_owned(),
            });
        }
        let open = state
            .devices
            .get(&device)
            .ok_or_else(|| Error::BadParameter(format!("unknown device {device}")))?;
        Ok(DeviceStreams {
            streams: open.streams.clone(),
            local_device: open.local_device,
        })
    }

    fn close_camera(&self, device: DeviceHandle) -> Result<()> {
        let mut state = self.state()?;
        let open = state
            .devices
            .remove(&device)
            .ok_or_else(|| Error::BadParameter(format!("unknown device {device}")))?;
        for stream in open.streams {
            if let Some(mut stream) = state.streams.remove(&stream) {
                stream.abort_queued();
            }
        }
        debug!(camera = %open.extended_id, "mock device closed");
        Ok(())
    }

    fn payload_size(&self, device: DeviceHandle) -> Result<usize> {
        let state = self.state()?;
        let open = state
            .devices
            .get(&device)
            .ok_or_else(|| Error::BadParameter(format!("unknown device {device}")))?;
        usize::try_from(open.format.size)
            .map_err(|_| Error::InternalFault("payload size overflow".to_owned()))
    }

    fn stream_buffer_alignment(&self, stream: StreamHandle) -> Result<Option<usize>> {
        let mut state = self.state()?;
        let device = state
            .stream(stream)?
            .device
            .ok_or_else(|| Error::BadParameter(format!("stream {stream} has no device")))?;
        let extended_id = state
            .devices
            .get(&device)
            .map(|open| open.extended_id.clone())
            .ok_or(Error::DeviceNotOpen)?;
        Ok(state
            .camera(&extended_id)
            .and_then(|entry| entry.camera.buffer_alignment))
    }

    fn announce_frame(&self, stream: StreamHandle, frame: &FramePtr) -> Result<()> {
        let mut state = self.state()?;
        let limit = state.faults.announce_limit;
        let stream = state.stream(stream)?;
        if limit.is_some_and(|limit| stream.announced.len() >= limit) {
            return Err(Error::Resources("announce limit reached".to_owned()));
        }
        if stream.announced.iter().any(|known| Arc::ptr_eq(known, frame)) {
            return Err(Error::InvalidCall("frame already announced".to_owned()));
        }
        if frame.allocation_mode() == Some(AllocationMode::AllocAndAnnounceFrame) && !frame.has_memory()? {
            frame.attach_driver_memory(vec![0; frame.buffer_size()])?;
        }
        stream.announced.push(Arc::clone(frame));
        Ok(())
    }

    fn revoke_frame(&self, stream: StreamHandle, frame: &FramePtr) -> Result<()> {
        let mut state = self.state()?;
        let stream = state.stream(stream)?;
        let position = stream
            .announced
            .iter()
            .position(|known| Arc::ptr_eq(known, frame))
            .ok_or_else(|| Error::NotFound(format!("frame {} not announced", frame.id())))?;
        stream.announced.remove(position);
        stream.implicitly_announced.retain(|known| !Arc::ptr_eq(known, frame));
        stream.queue.retain(|(queued, _)| {
            let keep = !Arc::ptr_eq(queued, frame);
            if !keep {
                if let Err(err) = queued.abort() {
                    warn!(frame = queued.id(), %err, "could not abort frame");
                }
            }
            keep
        });
        Ok(())
    }

    fn revoke_all_frames(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.state()?;
        let stream = state.stream(stream)?;
        stream.abort_queued();
        stream.announced.clear();
        stream.implicitly_announced.clear();
        Ok(())
    }

    fn queue_frame(&self, stream: StreamHandle, frame: &FramePtr, completion: Completion) -> Result<()> {
        let mut state = self.state()?;
        state.faults.queue_calls += 1;
        let call = state.faults.queue_calls;
        if state.faults.failing_queue_calls.contains(&call) {
            return Err(Error::Resources(format!("queue call {call} rejected")));
        }
        let limit = state.faults.announce_limit;
        let stream = state.stream(stream)?;
        if !stream.capturing {
            return Err(Error::InvalidCall("capture not started".to_owned()));
        }
        if stream.queue.iter().any(|(queued, _)| Arc::ptr_eq(queued, frame)) {
            return Err(Error::InvalidCall("frame already queued".to_owned()));
        }
        // Queueing an unknown frame announces it.
        if !stream.announced.iter().any(|known| Arc::ptr_eq(known, frame)) {
            if limit.is_some_and(|limit| stream.announced.len() >= limit) {
                return Err(Error::Resources("announce limit reached".to_owned()));
            }
            if frame.allocation_mode() == Some(AllocationMode::AllocAndAnnounceFrame) && !frame.has_memory()? {
                frame.attach_driver_memory(vec![0; frame.buffer_size()])?;
            }
            stream.announced.push(Arc::clone(frame));
            stream.implicitly_announced.push(Arc::clone(frame));
        }
        stream.queue.push_back((Arc::clone(frame), completion));
        drop(state);
        self.inner.wake.notify_all();
        Ok(())
    }

    fn flush_queue(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.state()?;
        let stream = state.stream(stream)?;
        stream.abort_queued();
        stream.forget_implicit();
        Ok(())
    }

    fn capture_start(&self, stream: StreamHandle) -> Result<()> {
        self.state()?.stream(stream)?.capturing = true;
        self.inner.wake.notify_all();
        Ok(())
    }

    fn capture_end(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.state()?;
        let stream = state.stream(stream)?;
        if !stream.capturing {
            return Err(Error::Already("capture not running".to_owned()));
        }
        stream.capturing = false;
        Ok(())
    }

    fn run_command(&self, module: ModuleHandle, name: &str) -> Result<()> {
        let mut state = self.state()?;
        state.commands.push(name.to_owned());
        if state.faults.failing_commands.iter().any(|failing| failing == name) {
            return Err(Error::Driver {
                code: -1,
                message: format!("command {name} failed"),
            });
        }

        match (module, name) {
            (ModuleHandle::Device(device), ACQUISITION_START | ACQUISITION_STOP) => {
                let open = state
                    .devices
                    .get_mut(&device)
                    .ok_or_else(|| Error::BadParameter(format!("unknown device {device}")))?;
                open.acquiring = name == ACQUISITION_START;
                drop(state);
                self.inner.wake.notify_all();
                Ok(())
            }
            (ModuleHandle::Stream(stream), ADJUST_PACKET_SIZE) => state.stream(stream).map(|_| ()),
            _ => Err(Error::NotFound(format!("command {name}"))),
        }
    }

    fn is_command_done(&self, _module: ModuleHandle, name: &str) -> Result<bool> {
        match name {
            ACQUISITION_START | ACQUISITION_STOP | ADJUST_PACKET_SIZE => Ok(true),
            _ => Err(Error::NotFound(format!("command {name}"))),
        }
    }

    fn enable_discovery(&self, target: DiscoveryTarget) -> Result<()> {
        let mut state = self.state()?;
        if state.faults.discovery_failure {
            return Err(Error::Driver {
                code: -2,
                message: "discovery could not be enabled".to_owned(),
            });
        }
        state.discovery.insert(target);
        Ok(())
    }

    fn disable_discovery(&self, target: DiscoveryTarget) -> Result<()> {
        self.state()?.discovery.remove(&target);
        Ok(())
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(inner: &Inner) {
    loop {
        let job = {
            let Ok(mut state) = lock(&inner.state, "mock driver state") else {
                return;
            };
            loop {
                if !state.running {
                    return;
                }
                if let Some(job) = state.next_job() {
                    break job;
                }
                match wait_timeout(&inner.wake, state, IDLE_WAIT, "mock driver state") {
                    Ok((next, _)) => state = next,
                    Err(_) => return,
                }
            }
        };
        let interval = job.interval;
        job.run();
        thread::sleep(interval);
    }
}

/// Generate a full frame of test data for `format`.
#[must_use]
pub fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; usize::try_from(format.size).unwrap_or(0)];
    fill_pattern(&mut data, format, pattern);
    data
}

/// Write `pattern` into a YUYV buffer laid out as `format`.
pub fn fill_pattern(data: &mut [u8], format: &Format, pattern: TestPattern) {
    match pattern {
        TestPattern::ColorBars => generate_color_bars(data, format),
        TestPattern::Gradient => generate_gradient(data, format),
        TestPattern::Solid(y, u, v) => generate_solid(data, y, u, v),
    }
}

/// Iterate over the `[Y0 U Y1 V]` quads of each row with the x coordinate of Y0.
fn for_each_pair<F: FnMut(u32, &mut [u8])>(data: &mut [u8], format: &Format, mut write: F) {
    let stride = usize::try_from(format.stride).unwrap_or(0).max(4);
    for row in data.chunks_exact_mut(stride) {
        for (pair, quad) in row.chunks_exact_mut(4).enumerate() {
            let x = u32::try_from(pair * 2).unwrap_or(u32::MAX);
            if x >= format.width {
                break;
            }
            write(x, quad);
        }
    }
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], format: &Format) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    const BARS: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];
    let bar_width = (format.width / 8).max(1);

    for_each_pair(data, format, |x, quad| {
        let bar = usize::try_from((x / bar_width).min(7)).unwrap_or(7);
        let (y, u, v) = BARS.get(bar).copied().unwrap_or((16, 128, 128));
        quad.copy_from_slice(&[y, u, y, v]);
    });
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], format: &Format) {
    let width = format.width.max(1);
    for_each_pair(data, format, |x, quad| {
        let y = u8::try_from(x * 255 / width).unwrap_or(u8::MAX);
        quad.copy_from_slice(&[y, 128, y, 128]);
    });
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for quad in data.chunks_exact_mut(4) {
        quad.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::frame::Frame;

    fn started(driver: MockDriver) -> (Arc<MockDriver>, Dispatcher) {
        let driver = Arc::new(driver);
        let dispatcher = Dispatcher::new(16);
        driver.startup(dispatcher.sink()).expect("startup should succeed");
        (driver, dispatcher)
    }

    #[test]
    fn test_mock_inventory() {
        let (driver, _dispatcher) = started(
            MockDriver::new()
                .with_interface("mock-if1")
                .with_camera(MockCamera::new("DEV_1"))
                .with_camera(MockCamera::new("DEV_2").with_interface("mock-if1").with_alias("10.0.0.2")),
        );

        assert_eq!(driver.transport_layers().expect("transport layers").len(), 1);
        assert_eq!(driver.interfaces().expect("interfaces").len(), 2);
        let cameras = driver.cameras().expect("cameras");
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].extended_id, "mock-if0::DEV_1");
        assert_eq!(cameras[1].extended_id, "mock-if1::DEV_2");

        let resolved = driver.camera_info("10.0.0.2").expect("alias should resolve");
        assert_eq!(resolved.id, "DEV_2");
    }

    #[test]
    fn test_mock_startup_twice_is_already() {
        let (driver, dispatcher) = started(MockDriver::new());
        assert!(matches!(
            driver.startup(dispatcher.sink()),
            Err(Error::Already(_))
        ));
    }

    #[test]
    fn test_queue_requires_capture() {
        let (driver, _dispatcher) = started(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
        let device = driver
            .open_camera("mock-if0::DEV_1", AccessMode::Full)
            .expect("open should succeed");
        let stream = driver.device_streams(device).expect("streams").streams[0];
        let frame = Frame::new(64 * 48 * 2, AllocationMode::AnnounceFrame, 1).expect("frame should allocate");

        assert!(matches!(
            driver.queue_frame(stream, &frame, Completion::Wait),
            Err(Error::InvalidCall(_))
        ));
        driver.capture_start(stream).expect("capture should start");
        driver
            .queue_frame(stream, &frame, Completion::Wait)
            .expect("queue should succeed");
        assert!(matches!(
            driver.queue_frame(stream, &frame, Completion::Wait),
            Err(Error::InvalidCall(_))
        ));
        assert_eq!(driver.queued_frames(stream), 1);

        driver.flush_queue(stream).expect("flush should succeed");
        assert_eq!(driver.queued_frames(stream), 0);
        assert_eq!(frame.status().expect("status"), FrameStatus::Aborted);
    }

    #[test]
    fn test_worker_fills_frames_in_order() {
        let (driver, _dispatcher) = started(
            MockDriver::new()
                .with_camera(MockCamera::new("DEV_1"))
                .with_pattern(TestPattern::Solid(100, 110, 120)),
        );
        let device = driver
            .open_camera("mock-if0::DEV_1", AccessMode::Full)
            .expect("open should succeed");
        let stream = driver.device_streams(device).expect("streams").streams[0];
        let size = driver.payload_size(device).expect("payload size");
        let frames: Vec<FramePtr> = (0..3)
            .map(|_| Frame::new(size, AllocationMode::AnnounceFrame, 1).expect("frame should allocate"))
            .collect();

        driver.capture_start(stream).expect("capture should start");
        for frame in &frames {
            frame.arm().expect("arm should succeed");
            driver
                .queue_frame(stream, frame, Completion::Wait)
                .expect("queue should succeed");
        }
        driver
            .run_command(ModuleHandle::Device(device), ACQUISITION_START)
            .expect("acquisition should start");

        for (index, frame) in frames.iter().enumerate() {
            let status = frame
                .wait_complete(Duration::from_secs(2))
                .expect("frame should complete");
            assert_eq!(status, FrameStatus::Complete);
            assert_eq!(frame.frame_id().expect("frame id"), index as u64 + 1);
            assert_eq!(frame.width().expect("width"), 64);
            let image = frame.image_bytes().expect("image");
            assert_eq!(&image[..4], &[100, 110, 100, 120]);
        }
        assert!(driver.is_acquiring(device));
    }

    #[test]
    fn test_small_frame_reports_too_small() {
        let (driver, _dispatcher) = started(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
        let device = driver
            .open_camera("mock-if0::DEV_1", AccessMode::Full)
            .expect("open should succeed");
        let stream = driver.device_streams(device).expect("streams").streams[0];
        let frame = Frame::new(16, AllocationMode::AnnounceFrame, 1).expect("frame should allocate");

        driver.capture_start(stream).expect("capture should start");
        frame.arm().expect("arm should succeed");
        driver
            .queue_frame(stream, &frame, Completion::Wait)
            .expect("queue should succeed");
        driver
            .run_command(ModuleHandle::Device(device), ACQUISITION_START)
            .expect("acquisition should start");

        let status = frame
            .wait_complete(Duration::from_secs(2))
            .expect("frame should complete");
        assert_eq!(status, FrameStatus::TooSmall);
    }

    #[test]
    fn test_driver_allocated_memory_on_announce() {
        let (driver, _dispatcher) = started(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
        let device = driver
            .open_camera("mock-if0::DEV_1", AccessMode::Full)
            .expect("open should succeed");
        let stream = driver.device_streams(device).expect("streams").streams[0];
        let frame = Frame::new(128, AllocationMode::AllocAndAnnounceFrame, 1).expect("frame should build");

        driver.announce_frame(stream, &frame).expect("announce should succeed");
        assert!(frame.has_memory().expect("memory state"));
    }

    #[test]
    fn test_failing_command() {
        let (driver, _dispatcher) = started(
            MockDriver::new()
                .with_camera(MockCamera::new("DEV_1"))
                .with_failing_command(ACQUISITION_START),
        );
        let device = driver
            .open_camera("mock-if0::DEV_1", AccessMode::Full)
            .expect("open should succeed");
        let result = driver.run_command(ModuleHandle::Device(device), ACQUISITION_START);
        assert!(matches!(result, Err(Error::Driver { .. })));
        assert_eq!(driver.commands(), vec![ACQUISITION_START.to_owned()]);
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);

        assert_eq!(data.len(), (640 * 480 * 2) as usize);
        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
        // Last bar should be black (Y=16)
        assert_eq!(data[data.len() - 4], 16);
    }

    #[test]
    fn test_gradient_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Gradient);

        // Left edge should be dark
        assert!(data[0] < 10);

        // Right edge should be bright (check last row, last pixel)
        let last_row_start = (479 * 640 * 2) as usize;
        let last_pixel_y = data[last_row_start + 638 * 2];
        assert!(last_pixel_y > 200);
    }

    #[test]
    fn test_solid_pattern() {
        let format = Format::new(64, 64, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Solid(128, 64, 192));

        assert_eq!(&data[..4], &[128, 64, 128, 192]);
        assert!(data.chunks_exact(4).all(|quad| quad == [128, 64, 128, 192]));
    }

    #[test]
    fn test_narrow_format_does_not_divide_by_zero() {
        let format = Format::new(4, 2, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);
        assert_eq!(data.len(), 16);
    }
}
