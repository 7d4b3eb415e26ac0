//! Frame buffer descriptors.
//!
//! A [`Frame`] owns (or borrows) the memory a driver fills with image data,
//! carries the metadata of the last delivery, and optionally references the
//! observer that wants to hear about completed deliveries. Frames are shared
//! as [`FramePtr`] between the caller, the capture engine and the driver.

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::format::{yuyv_pixel_at, FourCC};
use crate::handler::{FrameHandler, FrameObserver};
use crate::sync::{lock, wait_timeout};

/// Shared handle to a frame.
pub type FramePtr = Arc<Frame>;

/// Caller-owned memory wrapped by [`Frame::with_user_buffer`].
///
/// The frame only holds a reference; the memory outlives the frame.
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// How a self-allocated frame obtains its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationMode {
    /// The frame allocates its buffer when constructed.
    #[default]
    AnnounceFrame,
    /// The driver allocates the buffer when the frame is announced.
    AllocAndAnnounceFrame,
}

/// Whether a capture engine currently tracks the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Registration {
    /// Not tracked by any stream.
    #[default]
    Free,
    /// Explicitly announced to a stream.
    Announced,
    /// Tracked because it was enqueued without being announced first.
    Queued,
}

/// Outcome of the most recent delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    /// Queued or not yet delivered.
    #[default]
    Pending,
    /// Fully received.
    Complete,
    /// Received with missing data.
    Incomplete,
    /// The buffer was too small for the payload.
    TooSmall,
    /// Removed from the queue before delivery.
    Aborted,
}

/// Kind of payload carried by a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadType {
    /// Unknown or not reported.
    #[default]
    Unknown,
    /// Uncompressed image.
    Image,
    /// Raw data.
    Raw,
    /// JPEG image.
    Jpeg,
    /// H.264 stream data.
    H264,
    /// Chunk data only.
    ChunkOnly,
}

/// Bitmask of the metadata fields a delivery filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiveFlags(u32);

impl ReceiveFlags {
    /// No metadata received.
    pub const NONE: Self = Self(0);
    /// Width and height are valid.
    pub const DIMENSION: Self = Self(1);
    /// Horizontal and vertical offsets are valid.
    pub const OFFSET: Self = Self(1 << 1);
    /// Frame id is valid.
    pub const FRAME_ID: Self = Self(1 << 2);
    /// Timestamp is valid.
    pub const TIMESTAMP: Self = Self(1 << 3);
    /// Payload type is valid.
    pub const PAYLOAD_TYPE: Self = Self(1 << 4);
    /// Image offset and length are valid.
    pub const IMAGE_DATA: Self = Self(1 << 5);

    /// Returns `true` if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ReceiveFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Metadata a driver reports when it finishes filling a frame.
///
/// Built with the `with_*` methods, each of which also sets the matching
/// [`ReceiveFlags`] bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDelivery {
    status: FrameStatus,
    flags: ReceiveFlags,
    payload_type: PayloadType,
    width: u32,
    height: u32,
    offset_x: u32,
    offset_y: u32,
    pixel_format: FourCC,
    frame_id: u64,
    timestamp: u64,
    image_offset: usize,
    image_len: usize,
}

impl FrameDelivery {
    /// Start a delivery record with the given status.
    #[must_use]
    pub fn new(status: FrameStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Set the image dimensions.
    #[must_use]
    pub fn with_dimension(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self.flags = self.flags | ReceiveFlags::DIMENSION;
        self
    }

    /// Set the region-of-interest offsets.
    #[must_use]
    pub fn with_offset(mut self, offset_x: u32, offset_y: u32) -> Self {
        self.offset_x = offset_x;
        self.offset_y = offset_y;
        self.flags = self.flags | ReceiveFlags::OFFSET;
        self
    }

    /// Set the device frame counter.
    #[must_use]
    pub fn with_frame_id(mut self, frame_id: u64) -> Self {
        self.frame_id = frame_id;
        self.flags = self.flags | ReceiveFlags::FRAME_ID;
        self
    }

    /// Set the device timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self.flags = self.flags | ReceiveFlags::TIMESTAMP;
        self
    }

    /// Set the payload type.
    #[must_use]
    pub fn with_payload_type(mut self, payload_type: PayloadType) -> Self {
        self.payload_type = payload_type;
        self.flags = self.flags | ReceiveFlags::PAYLOAD_TYPE;
        self
    }

    /// Set the pixel format.
    #[must_use]
    pub const fn with_pixel_format(mut self, pixel_format: FourCC) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    /// Set where the decoded image lies within the buffer.
    #[must_use]
    pub fn with_image(mut self, offset: usize, len: usize) -> Self {
        self.image_offset = offset;
        self.image_len = len;
        self.flags = self.flags | ReceiveFlags::IMAGE_DATA;
        self
    }

    /// Delivery status.
    pub const fn status(&self) -> FrameStatus {
        self.status
    }

    /// Metadata flags set by this delivery.
    pub const fn flags(&self) -> ReceiveFlags {
        self.flags
    }
}

enum Memory {
    Owned { bytes: Vec<u8>, offset: usize },
    External(SharedBuffer),
    Unattached,
}

#[derive(Default)]
struct FrameState {
    registration: Registration,
    delivery: FrameDelivery,
    synchronous: bool,
    handler: Weak<FrameHandler>,
}

/// A frame buffer plus its delivery metadata.
pub struct Frame {
    id: u64,
    size: usize,
    alignment: usize,
    allocation: Option<AllocationMode>,
    memory: Mutex<Memory>,
    state: Mutex<FrameState>,
    completed: Condvar,
    observer: Mutex<Option<Arc<dyn FrameObserver>>>,
}

impl Frame {
    /// Create a self-allocated frame of `size` bytes.
    ///
    /// # Arguments
    ///
    /// * `size` - Buffer size in bytes, normally the camera's payload size
    /// * `mode` - Whether the frame or the driver allocates the memory
    /// * `alignment` - Required buffer alignment, a power of two
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for a zero size or an alignment that is not a
    /// power of two, and `Resources` if the memory cannot be allocated.
    pub fn new(size: usize, mode: AllocationMode, alignment: usize) -> Result<FramePtr> {
        if size == 0 {
            return Err(Error::BadParameter("frame size must be non-zero".to_owned()));
        }
        if !alignment.is_power_of_two() {
            return Err(Error::BadParameter(format!(
                "buffer alignment {alignment} is not a power of two"
            )));
        }

        let memory = match mode {
            AllocationMode::AnnounceFrame => allocate_aligned(size, alignment)?,
            AllocationMode::AllocAndAnnounceFrame => Memory::Unattached,
        };

        Ok(Arc::new(Self::build(size, alignment, Some(mode), memory)))
    }

    /// Create a frame around caller-owned memory.
    ///
    /// Dropping the frame never releases `buffer`.
    pub fn with_user_buffer(buffer: SharedBuffer) -> Result<FramePtr> {
        let size = lock(&buffer, "user buffer")?.len();
        if size == 0 {
            return Err(Error::BadParameter("user buffer is empty".to_owned()));
        }
        Ok(Arc::new(Self::build(size, 1, None, Memory::External(buffer))))
    }

    fn build(size: usize, alignment: usize, allocation: Option<AllocationMode>, memory: Memory) -> Self {
        Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            size,
            alignment,
            allocation,
            memory: Mutex::new(memory),
            state: Mutex::new(FrameState::default()),
            completed: Condvar::new(),
            observer: Mutex::new(None),
        }
    }

    /// Process-unique identity of this descriptor.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Buffer size in bytes.
    pub const fn buffer_size(&self) -> usize {
        self.size
    }

    /// Requested buffer alignment.
    pub const fn alignment(&self) -> usize {
        self.alignment
    }

    /// Allocation mode, or `None` for a frame over caller memory.
    pub const fn allocation_mode(&self) -> Option<AllocationMode> {
        self.allocation
    }

    /// Returns `true` if the buffer memory is present.
    pub fn has_memory(&self) -> Result<bool> {
        Ok(!matches!(*lock(&self.memory, "frame memory")?, Memory::Unattached))
    }

    /// Attach driver-allocated memory to an [`AllocationMode::AllocAndAnnounceFrame`] frame.
    pub fn attach_driver_memory(&self, bytes: Vec<u8>) -> Result<()> {
        if self.allocation != Some(AllocationMode::AllocAndAnnounceFrame) {
            return Err(Error::InvalidCall(
                "frame does not take driver-allocated memory".to_owned(),
            ));
        }
        if bytes.len() < self.size {
            return Err(Error::MoreData { required: self.size });
        }
        let mut memory = lock(&self.memory, "frame memory")?;
        if !matches!(*memory, Memory::Unattached) {
            return Err(Error::Already("driver memory attached".to_owned()));
        }
        *memory = Memory::Owned { bytes, offset: 0 };
        Ok(())
    }

    /// Drop driver-allocated memory again, typically when the frame is revoked.
    pub fn release_driver_memory(&self) -> Result<()> {
        if self.allocation == Some(AllocationMode::AllocAndAnnounceFrame) {
            *lock(&self.memory, "frame memory")? = Memory::Unattached;
        }
        Ok(())
    }

    /// Run `f` over the whole buffer.
    pub fn with_buffer<R, F: FnOnce(&[u8]) -> R>(&self, f: F) -> Result<R> {
        let memory = lock(&self.memory, "frame memory")?;
        match &*memory {
            Memory::Owned { bytes, offset } => {
                let view = bytes
                    .get(*offset..offset + self.size)
                    .ok_or_else(|| Error::InternalFault("frame view out of range".to_owned()))?;
                Ok(f(view))
            }
            Memory::External(buffer) => Ok(f(&lock(buffer, "user buffer")?)),
            Memory::Unattached => Err(Error::NotAvailable("frame buffer".to_owned())),
        }
    }

    /// Run `f` over the whole buffer with write access. Used by drivers.
    pub fn with_buffer_mut<R, F: FnOnce(&mut [u8]) -> R>(&self, f: F) -> Result<R> {
        let mut memory = lock(&self.memory, "frame memory")?;
        match &mut *memory {
            Memory::Owned { bytes, offset } => {
                let view = bytes
                    .get_mut(*offset..*offset + self.size)
                    .ok_or_else(|| Error::InternalFault("frame view out of range".to_owned()))?;
                Ok(f(view))
            }
            Memory::External(buffer) => Ok(f(&mut lock(buffer, "user buffer")?)),
            Memory::Unattached => Err(Error::NotAvailable("frame buffer".to_owned())),
        }
    }

    /// Run `f` over the decoded image of the last delivery.
    pub fn with_image<R, F: FnOnce(&[u8]) -> R>(&self, f: F) -> Result<R> {
        let delivery = self.delivery()?;
        if !delivery.flags.contains(ReceiveFlags::IMAGE_DATA) {
            return Err(Error::NotAvailable("image data".to_owned()));
        }
        let start = delivery.image_offset;
        let end = start.saturating_add(delivery.image_len);
        self.with_buffer(|buffer| buffer.get(start..end).map(f))?
            .ok_or_else(|| Error::InternalFault("image range exceeds buffer".to_owned()))
    }

    /// Copy the decoded image into `dest`, returning the number of bytes copied.
    ///
    /// # Errors
    ///
    /// Returns `MoreData` with the required length if `dest` is too small.
    pub fn copy_image_into(&self, dest: &mut [u8]) -> Result<usize> {
        self.with_image(|image| {
            let target = dest.get_mut(..image.len()).ok_or(Error::MoreData {
                required: image.len(),
            })?;
            target.copy_from_slice(image);
            Ok(image.len())
        })?
    }

    /// Copy the decoded image into a new vector.
    pub fn image_bytes(&self) -> Result<Vec<u8>> {
        self.with_image(<[u8]>::to_vec)
    }

    /// Sample an RGB pixel from a YUYV image.
    ///
    /// Returns `Ok(None)` if the coordinates fall outside the image.
    pub fn pixel_at(&self, x: u32, y: u32) -> Result<Option<(u8, u8, u8)>> {
        let width = self.width()?;
        self.with_image(|image| yuyv_pixel_at(image, x, y, width))
    }

    /// Register the observer notified when a delivery completes.
    ///
    /// Replaces any previously registered observer.
    pub fn register_observer(&self, observer: Arc<dyn FrameObserver>) -> Result<()> {
        *lock(&self.observer, "frame observer")? = Some(observer);
        Ok(())
    }

    /// Remove the registered observer.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no observer is registered.
    pub fn unregister_observer(&self) -> Result<()> {
        lock(&self.observer, "frame observer")?
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::NotFound("frame observer".to_owned()))
    }

    /// The registered observer, if any.
    pub fn observer(&self) -> Result<Option<Arc<dyn FrameObserver>>> {
        Ok(lock(&self.observer, "frame observer")?.clone())
    }

    /// Snapshot of the last delivery.
    pub fn delivery(&self) -> Result<FrameDelivery> {
        Ok(self.state()?.delivery)
    }

    /// Status of the last delivery. Always available.
    pub fn status(&self) -> Result<FrameStatus> {
        Ok(self.state()?.delivery.status)
    }

    /// Pixel format of the last delivery. Always available.
    pub fn pixel_format(&self) -> Result<FourCC> {
        Ok(self.state()?.delivery.pixel_format)
    }

    /// Metadata flags of the last delivery.
    pub fn receive_flags(&self) -> Result<ReceiveFlags> {
        Ok(self.state()?.delivery.flags)
    }

    /// Image width in pixels.
    pub fn width(&self) -> Result<u32> {
        self.field(ReceiveFlags::DIMENSION, "width", |d| d.width)
    }

    /// Image height in pixels.
    pub fn height(&self) -> Result<u32> {
        self.field(ReceiveFlags::DIMENSION, "height", |d| d.height)
    }

    /// Horizontal region-of-interest offset.
    pub fn offset_x(&self) -> Result<u32> {
        self.field(ReceiveFlags::OFFSET, "offset x", |d| d.offset_x)
    }

    /// Vertical region-of-interest offset.
    pub fn offset_y(&self) -> Result<u32> {
        self.field(ReceiveFlags::OFFSET, "offset y", |d| d.offset_y)
    }

    /// Device frame counter.
    pub fn frame_id(&self) -> Result<u64> {
        self.field(ReceiveFlags::FRAME_ID, "frame id", |d| d.frame_id)
    }

    /// Device timestamp.
    pub fn timestamp(&self) -> Result<u64> {
        self.field(ReceiveFlags::TIMESTAMP, "timestamp", |d| d.timestamp)
    }

    /// Payload type.
    pub fn payload_type(&self) -> Result<PayloadType> {
        self.field(ReceiveFlags::PAYLOAD_TYPE, "payload type", |d| d.payload_type)
    }

    /// Registration state with respect to a capture engine.
    pub fn registration(&self) -> Result<Registration> {
        Ok(self.state()?.registration)
    }

    /// Returns `true` if the frame is used for synchronous acquisition.
    pub fn is_synchronous(&self) -> Result<bool> {
        Ok(self.state()?.synchronous)
    }

    /// Reset the delivery state before the frame is handed to a driver queue.
    pub fn arm(&self) -> Result<()> {
        self.state()?.delivery = FrameDelivery::default();
        Ok(())
    }

    /// Record a finished delivery and wake synchronous waiters. Used by drivers.
    pub fn complete(&self, delivery: FrameDelivery) -> Result<()> {
        self.state()?.delivery = delivery;
        self.completed.notify_all();
        Ok(())
    }

    /// Mark a pending delivery as aborted and wake synchronous waiters.
    pub fn abort(&self) -> Result<()> {
        let mut state = self.state()?;
        if state.delivery.status == FrameStatus::Pending {
            let pixel_format = state.delivery.pixel_format;
            state.delivery = FrameDelivery::new(FrameStatus::Aborted).with_pixel_format(pixel_format);
            self.completed.notify_all();
        }
        Ok(())
    }

    /// Block until the pending delivery finishes.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if nothing was delivered within `timeout`.
    pub fn wait_complete(&self, timeout: Duration) -> Result<FrameStatus> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state()?;
        while state.delivery.status == FrameStatus::Pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            state = wait_timeout(&self.completed, state, remaining, "frame state")?.0;
        }
        Ok(state.delivery.status)
    }

    pub(crate) fn set_registration(&self, registration: Registration) -> Result<()> {
        self.state()?.registration = registration;
        Ok(())
    }

    pub(crate) fn set_synchronous(&self, synchronous: bool) -> Result<()> {
        self.state()?.synchronous = synchronous;
        Ok(())
    }

    pub(crate) fn handler(&self) -> Option<Arc<FrameHandler>> {
        self.state().ok().and_then(|state| state.handler.upgrade())
    }

    pub(crate) fn set_handler(&self, handler: Weak<FrameHandler>) -> Result<()> {
        self.state()?.handler = handler;
        Ok(())
    }

    /// Detach from the capture engine: clears the handler slot and registration.
    pub(crate) fn release(&self) -> Result<()> {
        let mut state = self.state()?;
        state.handler = Weak::new();
        state.registration = Registration::Free;
        Ok(())
    }

    fn field<T, F: FnOnce(&FrameDelivery) -> T>(
        &self,
        flag: ReceiveFlags,
        name: &str,
        read: F,
    ) -> Result<T> {
        let state = self.state()?;
        if state.delivery.flags.contains(flag) {
            Ok(read(&state.delivery))
        } else {
            Err(Error::NotAvailable(name.to_owned()))
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, FrameState>> {
        lock(&self.state, "frame state")
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("allocation", &self.allocation)
            .finish_non_exhaustive()
    }
}

fn allocate_aligned(size: usize, alignment: usize) -> Result<Memory> {
    let padded = size
        .checked_add(alignment - 1)
        .ok_or_else(|| Error::Resources(format!("frame of {size} bytes is too large")))?;

    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(padded)
        .map_err(|err| Error::Resources(format!("could not allocate {size} bytes: {err}")))?;
    bytes.resize(padded, 0);

    let offset = bytes.as_ptr().align_offset(alignment);
    if offset >= alignment {
        return Err(Error::Resources(format!(
            "could not align buffer to {alignment} bytes"
        )));
    }
    Ok(Memory::Owned { bytes, offset })
}
