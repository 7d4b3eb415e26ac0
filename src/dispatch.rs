//! Event dispatch between driver threads and user observers.
//!
//! Drivers post [`DriverEvent`]s into a bounded channel through an
//! [`EventSink`]; a dedicated dispatch thread drains it and runs frame and
//! catalog observers. Driver threads therefore never execute user code.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

use crate::driver::DiscoveryKind;
use crate::error::{Error, Result};
use crate::frame::FramePtr;
use crate::handler::FrameHandler;
use crate::sync::lock;

/// An asynchronous event reported by a driver.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A frame queued with notification finished its delivery.
    FrameDone(FramePtr),
    /// A camera appeared, disappeared or changed state.
    CameraDiscovery {
        /// Id or extended id of the camera.
        camera_id: String,
        /// What happened.
        kind: DiscoveryKind,
    },
    /// An interface appeared or disappeared.
    InterfaceDiscovery {
        /// Id of the interface.
        interface_id: String,
    },
}

#[derive(Debug)]
enum Message {
    Event(DriverEvent),
    Shutdown,
}

/// Receives catalog events on the dispatch thread.
pub(crate) trait DiscoveryHandler: Send + Sync {
    fn camera_event(&self, camera_id: &str, kind: DiscoveryKind);
    fn interface_event(&self, interface_id: &str);
}

/// Posting side of the dispatch channel, handed to the driver.
///
/// Posting blocks while the channel is full, except on the dispatch thread
/// itself where a full channel drops the event with a warning. Must not be
/// called from inside an async runtime.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<Message>,
    dispatch_thread: Arc<OnceLock<ThreadId>>,
}

impl EventSink {
    /// Post an event.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCall` once the dispatcher stopped, and `Resources`
    /// when the channel is full and the caller is the dispatch thread.
    pub fn post(&self, event: DriverEvent) -> Result<()> {
        self.send(Message::Event(event))
    }

    /// Post a frame-done event.
    pub fn frame_done(&self, frame: FramePtr) -> Result<()> {
        self.post(DriverEvent::FrameDone(frame))
    }

    /// Post a camera discovery event.
    pub fn camera_changed(&self, camera_id: &str, kind: DiscoveryKind) -> Result<()> {
        self.post(DriverEvent::CameraDiscovery {
            camera_id: camera_id.to_owned(),
            kind,
        })
    }

    /// Post an interface discovery event.
    pub fn interface_changed(&self, interface_id: &str) -> Result<()> {
        self.post(DriverEvent::InterfaceDiscovery {
            interface_id: interface_id.to_owned(),
        })
    }

    fn on_dispatch_thread(&self) -> bool {
        self.dispatch_thread.get() == Some(&thread::current().id())
    }

    fn send(&self, message: Message) -> Result<()> {
        if self.on_dispatch_thread() {
            return self.sender.try_send(message).map_err(|err| match err {
                TrySendError::Full(message) => {
                    warn!(?message, "dispatch channel full, event dropped");
                    Error::Resources("dispatch channel full".to_owned())
                }
                TrySendError::Closed(_) => Error::InvalidCall("dispatcher stopped".to_owned()),
            });
        }
        self.sender
            .blocking_send(message)
            .map_err(|_| Error::InvalidCall("dispatcher stopped".to_owned()))
    }
}

/// Owns the dispatch thread.
pub(crate) struct Dispatcher {
    sink: EventSink,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create the channel. The thread starts with [`Dispatcher::start`].
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sink: EventSink {
                sender,
                dispatch_thread: Arc::new(OnceLock::new()),
            },
            receiver: Mutex::new(Some(receiver)),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Spawn the dispatch thread. Catalog events go to `handler` while it lives.
    pub(crate) fn start(&self, handler: Weak<dyn DiscoveryHandler>) -> Result<()> {
        let receiver = lock(&self.receiver, "dispatch receiver")?
            .take()
            .ok_or_else(|| Error::Already("dispatcher started".to_owned()))?;

        let handle = thread::Builder::new()
            .name("cam-dispatch".to_owned())
            .spawn(move || run(receiver, &handler))
            .map_err(|err| Error::Resources(format!("could not spawn dispatch thread: {err}")))?;

        // Only `start` sets the id and it takes the receiver first.
        let _ = self.sink.dispatch_thread.set(handle.thread().id());
        *lock(&self.thread, "dispatch thread")? = Some(handle);
        Ok(())
    }

    /// Stop the dispatch thread.
    ///
    /// Events posted before the stop are still dispatched. When called from
    /// the dispatch thread itself the thread is left to finish on its own.
    pub(crate) fn stop(&self) {
        if let Err(err) = self.sink.send(Message::Shutdown) {
            debug!(%err, "dispatcher already stopped");
        }
        let handle = lock(&self.thread, "dispatch thread").ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if self.sink.on_dispatch_thread() {
                return;
            }
            if handle.join().is_err() {
                error!("dispatch thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut receiver: mpsc::Receiver<Message>, handler: &Weak<dyn DiscoveryHandler>) {
    debug!("dispatcher started");
    while let Some(message) = receiver.blocking_recv() {
        match message {
            Message::Shutdown => break,
            Message::Event(DriverEvent::FrameDone(frame)) => FrameHandler::deliver(&frame),
            Message::Event(DriverEvent::CameraDiscovery { camera_id, kind }) => {
                if let Some(handler) = handler.upgrade() {
                    handler.camera_event(&camera_id, kind);
                }
            }
            Message::Event(DriverEvent::InterfaceDiscovery { interface_id }) => {
                if let Some(handler) = handler.upgrade() {
                    handler.interface_event(&interface_id);
                }
            }
        }
    }
    debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AllocationMode, Frame};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl DiscoveryHandler for Recorder {
        fn camera_event(&self, camera_id: &str, kind: DiscoveryKind) {
            self.events
                .lock()
                .expect("lock")
                .push(format!("camera {camera_id} {kind:?}"));
        }

        fn interface_event(&self, interface_id: &str) {
            self.events
                .lock()
                .expect("lock")
                .push(format!("interface {interface_id}"));
        }
    }

    #[test]
    fn test_events_are_dispatched_in_order() {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn DiscoveryHandler> = Arc::downgrade(&recorder) as Weak<dyn DiscoveryHandler>;
        let dispatcher = Dispatcher::new(4);
        dispatcher.start(weak).expect("start should succeed");
        let sink = dispatcher.sink();

        sink.camera_changed("DEV_1", DiscoveryKind::Detected)
            .expect("post should succeed");
        sink.interface_changed("if0").expect("post should succeed");
        dispatcher.stop();

        let events = recorder.events.lock().expect("lock").clone();
        assert_eq!(events, vec!["camera DEV_1 Detected", "interface if0"]);

        let result = sink.camera_changed("DEV_2", DiscoveryKind::Missing);
        assert!(matches!(result, Err(Error::InvalidCall(_))));
    }

    #[test]
    fn test_frame_done_runs_observer_on_dispatch_thread() {
        let dispatcher = Dispatcher::new(4);
        let handler: Weak<dyn DiscoveryHandler> = Weak::<Recorder>::new();
        dispatcher.start(handler).expect("start should succeed");

        let frame = Frame::new(8, AllocationMode::AnnounceFrame, 1).expect("frame should allocate");
        let _handler = FrameHandler::attach(&frame).expect("attach should succeed");
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        frame
            .register_observer(Arc::new(move |_: &FramePtr| {
                let name = thread::current().name().map(str::to_owned);
                let _ = tx.lock().expect("lock").send(name);
            }))
            .expect("register should succeed");

        dispatcher
            .sink()
            .frame_done(Arc::clone(&frame))
            .expect("post should succeed");

        let name = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("observer should run");
        assert_eq!(name.as_deref(), Some("cam-dispatch"));
        dispatcher.stop();
    }

    #[test]
    fn test_stop_from_dispatch_thread_does_not_deadlock() {
        let dispatcher = Arc::new(Dispatcher::new(2));
        dispatcher
            .start(Weak::<Recorder>::new())
            .expect("start should succeed");

        let frame = Frame::new(8, AllocationMode::AnnounceFrame, 1).expect("frame should allocate");
        let _handler = FrameHandler::attach(&frame).expect("attach should succeed");
        let stops = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&dispatcher);
        let counter = Arc::clone(&stops);
        frame
            .register_observer(Arc::new(move |_: &FramePtr| {
                inner.stop();
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("register should succeed");

        dispatcher
            .sink()
            .frame_done(Arc::clone(&frame))
            .expect("post should succeed");

        for _ in 0..200 {
            if stops.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        frame.unregister_observer().expect("unregister should succeed");
    }
}
