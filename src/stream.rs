//! Capture engine: the frames one device stream tracks and their
//! announce / queue / flush / revoke lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::driver::{Completion, Driver, StreamHandle};
use crate::error::{Error, Result};
use crate::frame::{FramePtr, Registration};
use crate::handler::FrameHandler;
use crate::sync::ReaderWriterLock;

/// One stream of an open device.
///
/// Every frame the stream tracks has a [`FrameHandler`] in the stream's
/// handler collection and a back-reference to it in the frame's context
/// slot. A frame is tracked either because it was announced or because it
/// was queued without being announced first.
pub struct Stream {
    driver: Arc<dyn Driver>,
    handle: StreamHandle,
    index: usize,
    open: AtomicBool,
    handlers: ReaderWriterLock<Vec<Arc<FrameHandler>>>,
}

impl Stream {
    pub(crate) fn new(driver: Arc<dyn Driver>, handle: StreamHandle, index: usize) -> Self {
        Self {
            driver,
            handle,
            index,
            open: AtomicBool::new(false),
            handlers: ReaderWriterLock::new("stream frames", Vec::new()),
        }
    }

    /// Driver handle of the stream.
    pub const fn handle(&self) -> StreamHandle {
        self.handle
    }

    /// Position of the stream on its device.
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Returns `true` while the stream is open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Number of frames currently tracked.
    pub fn tracked_frames(&self) -> usize {
        self.handlers.enter_read().map_or(0, |handlers| handlers.len())
    }

    /// Returns `true` if `frame` is tracked by this stream.
    pub fn is_tracked(&self, frame: &FramePtr) -> bool {
        self.handlers
            .enter_read()
            .is_ok_and(|handlers| find(&handlers, frame).is_some())
    }

    /// Mark the stream open.
    pub fn open(&self) -> Result<()> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Err(Error::Already("stream open".to_owned()));
        }
        debug!(stream = %self.handle, index = self.index, "stream opened");
        Ok(())
    }

    /// Close the stream.
    ///
    /// If frames are still tracked, capture is ended, the queue flushed and
    /// every frame revoked; failures along the way are logged, not returned.
    pub fn close(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.tracked_frames() > 0 {
            let steps = [
                ("end capture", self.end_capture()),
                ("flush queue", self.flush_queue()),
                ("revoke frames", self.revoke_all_frames()),
            ];
            for (step, result) in steps {
                match result {
                    Err(err) if !err.is_already() => {
                        warn!(stream = %self.handle, step, %err, "stream close step failed");
                    }
                    _ => {}
                }
            }
        }

        let mut handlers = self.handlers.enter_write_exclusive()?;
        for handler in handlers.drain(..) {
            release(&handler);
        }
        self.open.store(false, Ordering::Release);
        debug!(stream = %self.handle, "stream closed");
        Ok(())
    }

    /// Register `frame` with the driver.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCall` if the frame is already announced or queued,
    /// here or on another stream.
    pub fn announce_frame(&self, frame: &FramePtr) -> Result<()> {
        self.ensure_open()?;
        let mut handlers = self.handlers.enter_write_exclusive()?;
        if find(&handlers, frame).is_some() || frame.registration()? != Registration::Free {
            return Err(Error::InvalidCall(
                "frame is already announced or queued".to_owned(),
            ));
        }

        self.driver.announce_frame(self.handle, frame)?;
        let handler = FrameHandler::attach(frame)?;
        frame.set_registration(Registration::Announced)?;
        handlers.push(handler);
        Ok(())
    }

    /// Unregister `frame` from the driver and stop tracking it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the stream does not track `frame`.
    pub fn revoke_frame(&self, frame: &FramePtr) -> Result<()> {
        self.ensure_open()?;
        let mut handlers = self.handlers.enter_write_exclusive()?;
        let position = find(&handlers, frame)
            .ok_or_else(|| Error::NotFound(format!("frame {} on stream {}", frame.id(), self.handle)))?;

        self.driver.revoke_frame(self.handle, frame)?;
        let handler = handlers.swap_remove(position);
        release(&handler);
        Ok(())
    }

    /// Unregister every frame from the driver and stop tracking them.
    pub fn revoke_all_frames(&self) -> Result<()> {
        self.ensure_open()?;
        let mut handlers = self.handlers.enter_write_exclusive()?;
        self.driver.revoke_all_frames(self.handle)?;
        for handler in handlers.drain(..) {
            release(&handler);
        }
        Ok(())
    }

    /// Put `frame` on the driver's input queue.
    ///
    /// A frame that is not tracked yet becomes tracked as queued. Frames
    /// marked synchronous complete without a frame-done event.
    pub fn queue_frame(&self, frame: &FramePtr) -> Result<()> {
        self.ensure_open()?;
        let completion = if frame.is_synchronous()? {
            Completion::Wait
        } else {
            Completion::Notify
        };

        let mut handlers = self.handlers.enter_write_exclusive()?;
        let tracked = find(&handlers, frame).is_some();
        if !tracked && frame.registration()? != Registration::Free {
            return Err(Error::InvalidCall(
                "frame is tracked by another stream".to_owned(),
            ));
        }

        frame.arm()?;
        self.driver.queue_frame(self.handle, frame, completion)?;

        if !tracked {
            let handler = FrameHandler::attach(frame)?;
            frame.set_registration(Registration::Queued)?;
            handlers.push(handler);
        }
        Ok(())
    }

    /// Flush the driver's input queue.
    ///
    /// Frames that were only tracked because they were queued stop being
    /// tracked; announced frames stay announced.
    pub fn flush_queue(&self) -> Result<()> {
        self.ensure_open()?;
        self.driver.flush_queue(self.handle)?;

        let mut handlers = self.handlers.enter_write_exclusive()?;
        handlers.retain(|handler| {
            let announced = handler
                .frame()
                .registration()
                .is_ok_and(|registration| registration == Registration::Announced);
            if !announced {
                release(handler);
            }
            announced
        });
        Ok(())
    }

    /// Prepare the stream to receive data.
    pub fn start_capture(&self) -> Result<()> {
        self.ensure_open()?;
        self.driver.capture_start(self.handle)
    }

    /// Stop receiving data.
    pub fn end_capture(&self) -> Result<()> {
        self.ensure_open()?;
        self.driver.capture_end(self.handle)
    }

    /// Buffer alignment required by the stream, 1 if the driver does not report one.
    pub fn buffer_alignment(&self) -> Result<usize> {
        self.ensure_open()?;
        match self.driver.stream_buffer_alignment(self.handle) {
            Ok(Some(alignment)) if alignment > 0 => Ok(alignment),
            Ok(_) => Ok(1),
            Err(err) => {
                debug!(stream = %self.handle, %err, "buffer alignment not reported, using 1");
                Ok(1)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::DeviceNotOpen)
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("handle", &self.handle)
            .field("index", &self.index)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

fn find(handlers: &[Arc<FrameHandler>], frame: &FramePtr) -> Option<usize> {
    handlers
        .iter()
        .position(|handler| Arc::ptr_eq(handler.frame(), frame))
}

/// Wait out an in-flight delivery, then detach the frame.
fn release(handler: &FrameHandler) {
    if let Err(err) = handler.quiesce() {
        warn!(%err, "could not synchronize with frame delivery");
    }
    let frame = handler.frame();
    if let Err(err) = frame.release().and_then(|()| frame.release_driver_memory()) {
        warn!(frame = frame.id(), %err, "could not release frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::driver::{AccessMode, Driver};
    use crate::frame::{AllocationMode, Frame};
    use crate::mock::{MockCamera, MockDriver};

    struct Fixture {
        driver: Arc<MockDriver>,
        stream: Stream,
        _dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let driver = Arc::new(MockDriver::new().with_camera(MockCamera::new("DEV_1")));
        let dispatcher = Dispatcher::new(8);
        driver.startup(dispatcher.sink()).expect("startup should succeed");
        let extended_id = driver.cameras().expect("cameras")[0].extended_id.clone();
        let device = driver
            .open_camera(&extended_id, AccessMode::Full)
            .expect("open should succeed");
        let handle = driver.device_streams(device).expect("streams").streams[0];
        let stream = Stream::new(Arc::clone(&driver) as Arc<dyn Driver>, handle, 0);
        stream.open().expect("open should succeed");
        Fixture {
            driver,
            stream,
            _dispatcher: dispatcher,
        }
    }

    fn frame() -> FramePtr {
        Frame::new(1024, AllocationMode::AnnounceFrame, 1).expect("frame should allocate")
    }

    #[test]
    fn test_closed_stream_rejects_operations() {
        let fx = fixture();
        fx.stream.close().expect("close should succeed");
        assert_eq!(fx.stream.announce_frame(&frame()), Err(Error::DeviceNotOpen));
        assert_eq!(fx.stream.start_capture(), Err(Error::DeviceNotOpen));
        fx.driver.shutdown();
    }

    #[test]
    fn test_announce_twice_is_invalid() {
        let fx = fixture();
        let frame = frame();
        fx.stream.announce_frame(&frame).expect("announce should succeed");
        assert_eq!(frame.registration().expect("registration"), Registration::Announced);
        assert!(matches!(
            fx.stream.announce_frame(&frame),
            Err(Error::InvalidCall(_))
        ));
        assert_eq!(fx.stream.tracked_frames(), 1);
        fx.driver.shutdown();
    }

    #[test]
    fn test_revoke_untracked_is_not_found() {
        let fx = fixture();
        assert!(matches!(
            fx.stream.revoke_frame(&frame()),
            Err(Error::NotFound(_))
        ));
        fx.driver.shutdown();
    }

    #[test]
    fn test_revoke_clears_context() {
        let fx = fixture();
        let frame = frame();
        fx.stream.announce_frame(&frame).expect("announce should succeed");
        assert!(frame.handler().is_some());

        fx.stream.revoke_frame(&frame).expect("revoke should succeed");
        assert!(frame.handler().is_none());
        assert_eq!(frame.registration().expect("registration"), Registration::Free);
        assert_eq!(fx.stream.tracked_frames(), 0);
        assert_eq!(fx.driver.announced_frames(fx.stream.handle()), 0);
        fx.driver.shutdown();
    }

    #[test]
    fn test_flush_forgets_queued_only_frames() {
        let fx = fixture();
        let announced = frame();
        let queued_only = frame();
        fx.stream.announce_frame(&announced).expect("announce should succeed");
        fx.stream.start_capture().expect("capture should start");
        fx.stream.queue_frame(&announced).expect("queue should succeed");
        fx.stream.queue_frame(&queued_only).expect("queue should succeed");
        assert_eq!(queued_only.registration().expect("registration"), Registration::Queued);
        assert_eq!(fx.stream.tracked_frames(), 2);

        fx.stream.flush_queue().expect("flush should succeed");

        assert_eq!(fx.stream.tracked_frames(), 1);
        assert!(fx.stream.is_tracked(&announced));
        assert!(queued_only.handler().is_none());
        assert_eq!(queued_only.registration().expect("registration"), Registration::Free);
        assert_eq!(fx.driver.queued_frames(fx.stream.handle()), 0);
        assert_eq!(fx.driver.announced_frames(fx.stream.handle()), 1);
        fx.driver.shutdown();
    }

    #[test]
    fn test_revoke_frame_that_was_only_queued() {
        let fx = fixture();
        let frame = frame();
        fx.stream.start_capture().expect("capture should start");
        fx.stream.queue_frame(&frame).expect("queue should succeed");
        assert_eq!(frame.registration().expect("registration"), Registration::Queued);
        assert_eq!(fx.driver.announced_frames(fx.stream.handle()), 1);

        fx.stream.revoke_frame(&frame).expect("revoke should succeed");

        assert_eq!(frame.registration().expect("registration"), Registration::Free);
        assert!(frame.handler().is_none());
        assert_eq!(fx.stream.tracked_frames(), 0);
        assert_eq!(fx.driver.announced_frames(fx.stream.handle()), 0);
        assert_eq!(fx.driver.queued_frames(fx.stream.handle()), 0);
        fx.driver.shutdown();
    }

    #[test]
    fn test_close_revokes_everything() {
        let fx = fixture();
        let frames: Vec<FramePtr> = (0..3).map(|_| frame()).collect();
        for frame in &frames {
            fx.stream.announce_frame(frame).expect("announce should succeed");
        }
        fx.stream.start_capture().expect("capture should start");
        fx.stream.queue_frame(&frames[0]).expect("queue should succeed");

        fx.stream.close().expect("close should succeed");

        assert!(!fx.stream.is_open());
        assert_eq!(fx.stream.tracked_frames(), 0);
        assert_eq!(fx.driver.announced_frames(fx.stream.handle()), 0);
        assert!(frames.iter().all(|frame| frame.handler().is_none()));
        fx.driver.shutdown();
    }

    #[test]
    fn test_revoke_all_then_announce_fresh_frame() {
        let fx = fixture();
        for _ in 0..3 {
            fx.stream.announce_frame(&frame()).expect("announce should succeed");
        }
        fx.stream.revoke_all_frames().expect("revoke all should succeed");
        assert_eq!(fx.stream.tracked_frames(), 0);

        let fresh = frame();
        fx.stream.announce_frame(&fresh).expect("announce should succeed");
        assert_eq!(fx.stream.tracked_frames(), 1);
        assert!(fx.stream.is_tracked(&fresh));
        assert!(matches!(
            fx.stream.revoke_frame(&fresh).and_then(|()| fx.stream.revoke_frame(&fresh)),
            Err(Error::NotFound(_))
        ));
        fx.driver.shutdown();
    }

    #[test]
    fn test_buffer_alignment_defaults_to_one() {
        let fx = fixture();
        assert_eq!(fx.stream.buffer_alignment().expect("alignment"), 1);
        fx.driver.shutdown();
    }
}
