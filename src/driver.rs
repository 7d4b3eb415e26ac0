//! The boundary between this crate and a camera transport driver.
//!
//! A [`Driver`] owns the hardware (or a simulation of it). Everything above
//! this module talks to devices only through the trait, by opaque handles.
//! Drivers report asynchronous events through the [`EventSink`] handed to
//! [`Driver::startup`].

use std::fmt;

use crate::dispatch::EventSink;
use crate::error::Result;
use crate::frame::FramePtr;

/// Command that starts image acquisition on a device.
pub const ACQUISITION_START: &str = "AcquisitionStart";
/// Command that stops image acquisition on a device.
pub const ACQUISITION_STOP: &str = "AcquisitionStop";
/// Command that negotiates the largest usable packet size on a stream.
pub const ADJUST_PACKET_SIZE: &str = "GVSPAdjustPacketSize";

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

handle_type!(
    /// Driver handle of a transport layer.
    TransportLayerHandle
);
handle_type!(
    /// Driver handle of an interface.
    InterfaceHandle
);
handle_type!(
    /// Driver handle of an open remote device.
    DeviceHandle
);
handle_type!(
    /// Driver handle of an open stream.
    StreamHandle
);
handle_type!(
    /// Driver handle of the host-side representation of an open device.
    LocalDeviceHandle
);

/// Module a named command runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleHandle {
    /// The remote device.
    Device(DeviceHandle),
    /// One of its streams.
    Stream(StreamHandle),
}

/// Transport technology of a transport layer or interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportLayerType {
    /// Not reported.
    #[default]
    Unknown,
    /// GigE Vision.
    GigE,
    /// USB3 Vision.
    Usb3,
    /// Camera Link.
    CameraLink,
    /// MIPI CSI-2.
    Csi2,
    /// PCI Express.
    Pcie,
    /// Video4Linux2 device nodes.
    V4l2,
    /// Simulated devices.
    Custom,
}

/// Access to a device, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum AccessMode {
    /// No access.
    #[default]
    None,
    /// Read-only access.
    Read,
    /// Read and write access.
    Full,
    /// Read and write access, no one else may open the device.
    Exclusive,
}

impl AccessMode {
    /// Returns `true` if a device permitting `self` can be opened with `requested`.
    #[must_use]
    pub fn allows(self, requested: Self) -> bool {
        requested != Self::None && requested <= self
    }
}

/// Description of a transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportLayerInfo {
    /// Driver handle.
    pub handle: TransportLayerHandle,
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Model name.
    pub model_name: String,
    /// Vendor.
    pub vendor: String,
    /// Version string.
    pub version: String,
    /// Library or node path.
    pub path: String,
    /// Transport technology.
    pub kind: TransportLayerType,
}

/// Description of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Driver handle.
    pub handle: InterfaceHandle,
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Transport technology.
    pub kind: TransportLayerType,
    /// Owning transport layer.
    pub transport_layer: TransportLayerHandle,
}

/// Description of a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    /// Identifier unique on its transport layer.
    pub id: String,
    /// Identifier unique across all transport layers.
    pub extended_id: String,
    /// Display name.
    pub name: String,
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial_number: String,
    /// Interface the camera is attached to.
    pub interface: InterfaceHandle,
    /// Transport layer the camera is reached through.
    pub transport_layer: TransportLayerHandle,
    /// Strongest access mode currently permitted.
    pub permitted_access: AccessMode,
}

/// Handles produced when a device is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStreams {
    /// Stream handles in index order.
    pub streams: Vec<StreamHandle>,
    /// Host-side device handle.
    pub local_device: LocalDeviceHandle,
}

/// How a queued frame's completion is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Post a frame-done event to the sink after filling the frame.
    Notify,
    /// Only complete the frame; a caller waits on it.
    Wait,
}

/// Which discovery events a driver should emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryTarget {
    /// Camera arrival, departure and state changes.
    Cameras,
    /// Interface arrival and departure.
    Interfaces,
}

/// What happened to a discovered camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryKind {
    /// The camera appeared.
    Detected,
    /// The camera disappeared.
    Missing,
    /// The camera became reachable.
    Reachable,
    /// The camera became unreachable.
    Unreachable,
}

/// A camera transport driver.
///
/// Implementations must be usable from several threads at once. Frame
/// deliveries and discovery events are posted through the [`EventSink`]
/// given to [`Driver::startup`]; completed frames queued with
/// [`Completion::Wait`] are only completed, never posted.
pub trait Driver: Send + Sync {
    /// Start the driver. `sink` receives all asynchronous events.
    fn startup(&self, sink: EventSink) -> Result<()>;

    /// Stop the driver and drop the sink.
    fn shutdown(&self);

    /// List transport layers. Called once at startup.
    fn transport_layers(&self) -> Result<Vec<TransportLayerInfo>>;

    /// List interfaces currently present.
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>>;

    /// List cameras currently present.
    fn cameras(&self) -> Result<Vec<CameraInfo>>;

    /// Query one camera by id, extended id or alias (for example an IP address).
    fn camera_info(&self, id: &str) -> Result<CameraInfo>;

    /// Open the camera with the given extended id.
    fn open_camera(&self, extended_id: &str, mode: AccessMode) -> Result<DeviceHandle>;

    /// Enumerate the streams of an open device.
    fn device_streams(&self, device: DeviceHandle) -> Result<DeviceStreams>;

    /// Close an open device and all its streams.
    fn close_camera(&self, device: DeviceHandle) -> Result<()>;

    /// Bytes needed to hold one payload of the device.
    fn payload_size(&self, device: DeviceHandle) -> Result<usize>;

    /// Required buffer alignment of a stream, `None` if not reported.
    fn stream_buffer_alignment(&self, stream: StreamHandle) -> Result<Option<usize>>;

    /// Register a frame with a stream.
    fn announce_frame(&self, stream: StreamHandle, frame: &FramePtr) -> Result<()>;

    /// Unregister a frame from a stream.
    fn revoke_frame(&self, stream: StreamHandle, frame: &FramePtr) -> Result<()>;

    /// Unregister every frame of a stream.
    fn revoke_all_frames(&self, stream: StreamHandle) -> Result<()>;

    /// Put a frame on the stream's input queue.
    fn queue_frame(&self, stream: StreamHandle, frame: &FramePtr, completion: Completion) -> Result<()>;

    /// Drop every frame from the input queue, aborting pending deliveries.
    fn flush_queue(&self, stream: StreamHandle) -> Result<()>;

    /// Prepare the stream to receive data.
    fn capture_start(&self, stream: StreamHandle) -> Result<()>;

    /// Stop receiving data. Returns `Already` if capture is not running.
    fn capture_end(&self, stream: StreamHandle) -> Result<()>;

    /// Run a named command on a module.
    fn run_command(&self, module: ModuleHandle, name: &str) -> Result<()>;

    /// Returns `true` once a previously run command finished.
    fn is_command_done(&self, module: ModuleHandle, name: &str) -> Result<bool>;

    /// Start emitting discovery events for `target`.
    fn enable_discovery(&self, target: DiscoveryTarget) -> Result<()>;

    /// Stop emitting discovery events for `target`.
    fn disable_discovery(&self, target: DiscoveryTarget) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_allows() {
        assert!(AccessMode::Full.allows(AccessMode::Read));
        assert!(AccessMode::Full.allows(AccessMode::Full));
        assert!(!AccessMode::Read.allows(AccessMode::Full));
        assert!(!AccessMode::Exclusive.allows(AccessMode::None));
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(DeviceHandle(255).to_string(), "0xff");
    }
}
