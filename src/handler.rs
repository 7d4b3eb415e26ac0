//! Frame delivery: observers and the per-frame handler the capture engine
//! attaches to every tracked frame.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::Result;
use crate::frame::FramePtr;
use crate::sync::lock;

/// Receives frames whose delivery completed.
///
/// Called on the dispatch thread. Implementations may re-queue the frame.
pub trait FrameObserver: Send + Sync {
    /// A delivery into `frame` finished; its status says how.
    fn frame_received(&self, frame: &FramePtr);
}

impl<F> FrameObserver for F
where
    F: Fn(&FramePtr) + Send + Sync,
{
    fn frame_received(&self, frame: &FramePtr) {
        self(frame);
    }
}

/// Binds a tracked frame to the stream that tracks it.
///
/// The frame reaches its handler through a weak back-reference, so a frame
/// revoked from its stream no longer finds one.
pub struct FrameHandler {
    frame: FramePtr,
    lock: Mutex<()>,
}

impl FrameHandler {
    /// Create a handler for `frame` and install it in the frame's context slot.
    pub(crate) fn attach(frame: &FramePtr) -> Result<Arc<Self>> {
        let handler = Arc::new(Self {
            frame: Arc::clone(frame),
            lock: Mutex::new(()),
        });
        frame.set_handler(Arc::downgrade(&handler))?;
        Ok(handler)
    }

    /// The frame this handler belongs to.
    pub fn frame(&self) -> &FramePtr {
        &self.frame
    }

    /// Serialize with an in-flight delivery of this frame.
    pub(crate) fn quiesce(&self) -> Result<()> {
        lock(&self.lock, "frame handler").map(drop)
    }

    /// Deliver a completed frame to its observer.
    ///
    /// A frame with no handler was revoked or flushed while the driver still
    /// had it; the delivery is logged and discarded. The observer runs
    /// without any crate lock held.
    pub fn deliver(frame: &FramePtr) {
        let Some(handler) = frame.handler() else {
            debug!(frame = frame.id(), "frame removed from queue, delivery discarded");
            return;
        };

        let observer = {
            let Ok(_guard) = lock(&handler.lock, "frame handler") else {
                return;
            };
            match handler.frame.observer() {
                Ok(observer) => observer,
                Err(err) => {
                    warn!(frame = frame.id(), %err, "could not read frame observer");
                    return;
                }
            }
        };

        match observer {
            Some(observer) => observer.frame_received(&handler.frame),
            None => debug!(frame = frame.id(), "no observer registered, delivery dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AllocationMode, Frame};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_frame() -> (FramePtr, Arc<AtomicUsize>) {
        let frame = Frame::new(16, AllocationMode::AnnounceFrame, 1).expect("frame should allocate");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        frame
            .register_observer(Arc::new(move |_: &FramePtr| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("register should succeed");
        (frame, calls)
    }

    #[test]
    fn test_deliver_reaches_observer() {
        let (frame, calls) = counting_frame();
        let handler = FrameHandler::attach(&frame).expect("attach should succeed");

        FrameHandler::deliver(&frame);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(handler.frame(), &frame));
    }

    #[test]
    fn test_deliver_without_handler_is_discarded() {
        let (frame, calls) = counting_frame();
        FrameHandler::deliver(&frame);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let handler = FrameHandler::attach(&frame).expect("attach should succeed");
        drop(handler);
        FrameHandler::deliver(&frame);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_observer_may_requeue_reentrantly() {
        let frame = Frame::new(16, AllocationMode::AnnounceFrame, 1).expect("frame should allocate");
        let handler = FrameHandler::attach(&frame).expect("attach should succeed");
        let inner = Arc::clone(&handler);
        frame
            .register_observer(Arc::new(move |_: &FramePtr| {
                // The handler lock is free while the observer runs.
                inner.quiesce().expect("handler lock should be free");
            }))
            .expect("register should succeed");

        FrameHandler::deliver(&frame);
    }
}
