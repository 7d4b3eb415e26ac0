//! Image acquisition on a [`Camera`]: single and multi-frame grabs and
//! continuous streaming.
//!
//! Grabs run through an explicit state machine. Each state knows the
//! teardown steps that undo it, so a grab that fails halfway (or is simply
//! finished) unwinds exactly what was set up, in reverse order.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::camera::Camera;
use crate::driver::{ACQUISITION_START, ACQUISITION_STOP};
use crate::error::{BatchOutcome, Error, Result};
use crate::frame::{AllocationMode, Frame, FramePtr};
use crate::handler::FrameObserver;
use crate::sync::lock;

/// Where an acquisition sequence stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionState {
    /// Nothing set up.
    Idle,
    /// Frames announced to the stream.
    Announced,
    /// Stream capture started.
    Capturing,
    /// Frames queued.
    Queued,
    /// Device acquisition running.
    Running,
}

/// One step that undoes part of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownStep {
    /// Run `AcquisitionStop` on the device.
    StopAcquisition,
    /// End stream capture.
    EndCapture,
    /// Flush the stream's input queue.
    FlushQueue,
    /// Revoke the sequence's frames.
    RevokeFrames,
}

impl AcquisitionState {
    /// Steps that undo this state and the state they lead back to.
    #[must_use]
    pub const fn rollback(self) -> (&'static [TeardownStep], Self) {
        match self {
            Self::Idle => (&[], Self::Idle),
            Self::Announced => (&[TeardownStep::RevokeFrames], Self::Idle),
            Self::Capturing => (&[TeardownStep::EndCapture], Self::Announced),
            Self::Queued => (
                &[TeardownStep::EndCapture, TeardownStep::FlushQueue],
                Self::Announced,
            ),
            Self::Running => (&[TeardownStep::StopAcquisition], Self::Queued),
        }
    }

    /// Every step from this state back to [`AcquisitionState::Idle`], in order.
    #[must_use]
    pub fn teardown_plan(self) -> Vec<TeardownStep> {
        let mut plan = Vec::new();
        let mut state = self;
        while state != Self::Idle {
            let (steps, next) = state.rollback();
            plan.extend_from_slice(steps);
            state = next;
        }
        plan
    }
}

/// How frames are put on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueMode {
    /// Synchronous completion, waited on by the grabbing thread.
    Synchronous,
    /// Observer completion through the camera's enqueue gate.
    Continuous,
}

/// Drives a camera through the acquisition states and unwinds on drop.
struct AcquisitionSequence<'a> {
    camera: &'a Camera,
    state: AcquisitionState,
    announced: Vec<FramePtr>,
    queued: Vec<FramePtr>,
}

impl<'a> AcquisitionSequence<'a> {
    const fn new(camera: &'a Camera) -> Self {
        Self {
            camera,
            state: AcquisitionState::Idle,
            announced: Vec::new(),
            queued: Vec::new(),
        }
    }

    fn announce(&mut self, frames: Vec<FramePtr>) -> BatchOutcome {
        let mut outcome = BatchOutcome::new();
        for frame in frames {
            if outcome.record(self.camera.announce_frame(&frame)) {
                self.announced.push(frame);
            }
        }
        if !self.announced.is_empty() {
            self.state = AcquisitionState::Announced;
        }
        outcome
    }

    fn start_capture(&mut self) -> Result<()> {
        self.camera.start_capture()?;
        self.state = AcquisitionState::Capturing;
        Ok(())
    }

    fn queue(&mut self, mode: QueueMode) -> BatchOutcome {
        let mut outcome = BatchOutcome::new();
        for frame in &self.announced {
            let result = match mode {
                QueueMode::Synchronous => frame
                    .set_synchronous(true)
                    .and_then(|()| self.camera.primary_stream()?.queue_frame(frame)),
                QueueMode::Continuous => self.camera.queue_frame(frame),
            };
            if outcome.record(result) {
                self.queued.push(Arc::clone(frame));
            }
        }
        if !self.queued.is_empty() {
            self.state = AcquisitionState::Queued;
        }
        outcome
    }

    fn start_acquisition(&mut self) -> Result<()> {
        self.camera.run_command(ACQUISITION_START)?;
        self.state = AcquisitionState::Running;
        Ok(())
    }

    /// Hand the running acquisition over; nothing is undone on drop.
    fn commit(mut self) -> usize {
        self.state = AcquisitionState::Idle;
        self.queued.len()
    }

    fn teardown(&mut self) -> Result<()> {
        let mut outcome = BatchOutcome::new();
        for step in self.state.teardown_plan() {
            let result = self.run(step);
            if let Err(err) = &result {
                if !err.is_already() {
                    warn!(camera = self.camera.id(), ?step, %err, "teardown step failed");
                }
            }
            outcome.record_tolerant(result);
        }
        for frame in &self.announced {
            if let Err(err) = frame.set_synchronous(false) {
                debug!(frame = frame.id(), %err, "could not reset synchronous flag");
            }
        }
        self.state = AcquisitionState::Idle;
        outcome.into_result()
    }

    fn run(&self, step: TeardownStep) -> Result<()> {
        match step {
            TeardownStep::StopAcquisition => self.camera.run_command(ACQUISITION_STOP),
            TeardownStep::EndCapture => self.camera.end_capture(),
            TeardownStep::FlushQueue => self.camera.flush_queue(),
            TeardownStep::RevokeFrames => {
                let mut outcome = BatchOutcome::new();
                for frame in &self.announced {
                    outcome.record(self.camera.revoke_frame(frame));
                }
                outcome.into_result()
            }
        }
    }
}

impl Drop for AcquisitionSequence<'_> {
    fn drop(&mut self) {
        if self.state != AcquisitionState::Idle {
            if let Err(err) = self.teardown() {
                warn!(camera = self.camera.id(), %err, "acquisition teardown failed");
            }
        }
    }
}

/// Result of [`Camera::acquire_multiple_images`].
#[derive(Debug, Clone)]
pub struct MultiFrameGrab {
    /// Frames that completed, in queue order.
    pub frames: Vec<FramePtr>,
    /// Number of frames requested.
    pub requested: usize,
    /// First failure of the grab, if any step failed.
    pub first_error: Option<Error>,
}

impl MultiFrameGrab {
    /// Returns `true` if every requested frame completed and nothing failed.
    pub fn is_complete(&self) -> bool {
        self.frames.len() == self.requested && self.first_error.is_none()
    }
}

impl Camera {
    /// Grab one image.
    ///
    /// # Arguments
    ///
    /// * `timeout` - How long to wait for the frame
    ///
    /// # Errors
    ///
    /// Returns the first failure of the grab, including `Timeout` when no
    /// frame arrived and any teardown failure.
    pub fn acquire_single_image(&self, timeout: Duration) -> Result<FramePtr> {
        let grab = self.acquire_multiple_images(1, timeout)?;
        if let Some(err) = grab.first_error {
            return Err(err);
        }
        grab.frames.into_iter().next().ok_or(Error::Timeout)
    }

    /// Grab `count` images, waiting up to `timeout` for each.
    ///
    /// Partial results are returned: if at least one frame completed the
    /// grab succeeds and `first_error` reports what went wrong.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for a zero count, `DeviceNotOpen` on a closed
    /// camera, and the first failure if no frame completed.
    pub fn acquire_multiple_images(&self, count: usize, timeout: Duration) -> Result<MultiFrameGrab> {
        if count == 0 {
            return Err(Error::BadParameter("frame count must be non-zero".to_owned()));
        }
        let frames = self.allocate_frames(count, None)?;

        let mut sequence = AcquisitionSequence::new(self);
        let mut first_error = sequence.announce(frames).first_error;
        if sequence.announced.is_empty() {
            return Err(first_error.unwrap_or(Error::Resources("no frame announced".to_owned())));
        }
        if first_error.is_some() {
            warn!(
                camera = self.id(),
                announced = sequence.announced.len(),
                requested = count,
                "only part of the frames could be announced"
            );
        }

        sequence.start_capture()?;
        let queued = sequence.queue(QueueMode::Synchronous);
        if let Some(err) = &queued.first_error {
            warn!(camera = self.id(), %err, queued = queued.completed, "only part of the frames could be queued");
        }
        first_error = first_error.or(queued.first_error);
        if sequence.queued.is_empty() {
            return Err(first_error.unwrap_or(Error::InternalFault("no frame queued".to_owned())));
        }
        sequence.start_acquisition()?;

        let mut delivered = Vec::with_capacity(sequence.queued.len());
        for frame in &sequence.queued {
            match frame.wait_complete(timeout) {
                Ok(_) => delivered.push(Arc::clone(frame)),
                Err(err) => {
                    first_error = first_error.or(Some(err));
                    break;
                }
            }
        }

        if let Err(err) = sequence.teardown() {
            first_error = first_error.or(Some(err));
        }

        if delivered.is_empty() {
            return Err(first_error.unwrap_or(Error::Timeout));
        }
        debug!(camera = self.id(), frames = delivered.len(), "grab finished");
        Ok(MultiFrameGrab {
            frames: delivered,
            requested: count,
            first_error,
        })
    }

    /// Start streaming into `buffer_count` frames delivered to `observer`.
    ///
    /// The observer is expected to re-queue frames with
    /// [`Camera::queue_frame`]. Returns the number of frames in flight.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for a zero count, and the first failure if no
    /// frame could be announced or queued, or if acquisition did not start.
    /// Anything set up before the failure is undone.
    pub fn start_continuous_image_acquisition(
        &self,
        buffer_count: usize,
        observer: Arc<dyn FrameObserver>,
    ) -> Result<usize> {
        if buffer_count == 0 {
            return Err(Error::BadParameter("buffer count must be non-zero".to_owned()));
        }
        let frames = self.allocate_frames(buffer_count, Some(&observer))?;

        let mut sequence = AcquisitionSequence::new(self);
        let announced = sequence.announce(frames);
        if sequence.announced.is_empty() {
            return Err(announced
                .first_error
                .unwrap_or(Error::Resources("no frame announced".to_owned())));
        }
        if let Some(err) = &announced.first_error {
            warn!(camera = self.id(), %err, announced = announced.completed, "only part of the frames could be announced");
        }

        sequence.start_capture()?;
        let queued = sequence.queue(QueueMode::Continuous);
        if sequence.queued.is_empty() {
            return Err(queued
                .first_error
                .unwrap_or(Error::InternalFault("no frame queued".to_owned())));
        }
        if let Some(err) = &queued.first_error {
            warn!(camera = self.id(), %err, queued = queued.completed, "only part of the frames could be queued");
        }
        sequence.start_acquisition()?;

        let in_flight = sequence.commit();
        info!(camera = self.id(), buffers = in_flight, "continuous acquisition started");
        Ok(in_flight)
    }

    /// Stop continuous acquisition.
    ///
    /// The enqueue gate is closed first so observers cannot re-queue frames
    /// while the stream is torn down; it is reopened before returning. Every
    /// step runs; the first failure is reported.
    pub fn stop_continuous_image_acquisition(&self) -> Result<()> {
        *lock(self.queue_gate(), "queue gate")? = false;

        let mut outcome = BatchOutcome::new();
        outcome.record_tolerant(self.run_command(ACQUISITION_STOP));
        outcome.record_tolerant(self.end_capture());
        outcome.record_tolerant(self.flush_queue());
        outcome.record_tolerant(self.revoke_all_frames());

        *lock(self.queue_gate(), "queue gate")? = true;

        if let Some(err) = &outcome.first_error {
            warn!(camera = self.id(), %err, "continuous acquisition stopped with errors");
        } else {
            info!(camera = self.id(), "continuous acquisition stopped");
        }
        outcome.into_result()
    }

    fn allocate_frames(
        &self,
        count: usize,
        observer: Option<&Arc<dyn FrameObserver>>,
    ) -> Result<Vec<FramePtr>> {
        let payload = self.payload_size()?;
        let alignment = self.stream_buffer_alignment()?;

        let mut outcome = BatchOutcome::new();
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame = Frame::new(payload, AllocationMode::AnnounceFrame, alignment).and_then(|frame| {
                if let Some(observer) = observer {
                    frame.register_observer(Arc::clone(observer))?;
                }
                Ok(frame)
            });
            if let Some(frame) = outcome.keep(frame) {
                frames.push(frame);
            }
        }
        if frames.is_empty() {
            return Err(outcome
                .first_error
                .unwrap_or(Error::Resources("no frame allocated".to_owned())));
        }
        Ok(frames)
    }
}
