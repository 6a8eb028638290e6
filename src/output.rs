//! Outputs and frame scheduling
//!
//! An output is a place where a backend displays images: a window on an X11 server or a
//! toplevel surface on a parent Wayland compositor. Every backend drives its outputs through
//! the same [`FrameScheduler`], so frame pacing behaves identically everywhere.
//!
//! # Frame scheduling
//!
//! At most one frame is in flight per output. The scheduler is always in one of three states
//! (see [`FrameState`]):
//!
//! - **Idle**: nothing is waiting for the display system. Scheduling an image commits it right away.
//! - **Committed**: an image was committed and the scheduler waits for the completion signal.
//! - **Committed with pending**: additionally, the latest image scheduled since the commit is
//!   queued. Scheduling yet another image replaces it, and the replaced image is handed back
//!   through [`OutputEvent::BufferReleased`].
//!
//! When the display system signals completion the pending image, if any, is committed and
//! [`OutputEvent::Frame`] is emitted exactly once. Committed images come back through
//! [`OutputEvent::BufferReleased`] once the display system no longer reads from them.
//!
//! ```
//! # use ferrule::output::{FrameScheduler, FrameState};
//! let scheduler = FrameScheduler::new();
//! assert_eq!(scheduler.state(), FrameState::Idle);
//! ```

use std::mem;

use tracing::{trace, warn};

use crate::backend::allocator::{AnyError, Image, ImageId};
use crate::utils::ids::id_type;

id_type!(
    /// Unique identifier of an output
    OutputId
);

/// An output mode
///
/// A possible combination of dimensions and refresh rate for an output.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Mode {
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
    /// The refresh rate in millihertz
    ///
    /// `1000` is one fps (frame per second), `2000` is 2 fps, etc...
    /// Nested outputs do not know their refresh rate and report `0`.
    pub refresh: i32,
}

impl Mode {
    /// Mode of freshly created nested outputs
    pub const DEFAULT: Mode = Mode {
        width: 1280,
        height: 720,
        refresh: 0,
    };

    /// Mode for a configure event, `None` if either dimension is not positive
    pub fn from_configure(width: i32, height: i32) -> Option<Mode> {
        (width > 0 && height > 0).then_some(Mode {
            width,
            height,
            refresh: 0,
        })
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::DEFAULT
    }
}

/// Static description of an output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    /// Name of the output, e.g. `X11-1` or `WL-1`
    pub name: String,
    /// Textual description of the manufacturer
    pub make: String,
    /// Textual description of the model
    pub model: String,
    /// Current mode
    pub mode: Mode,
}

/// Something that happened on an output
#[derive(Debug)]
pub enum OutputEvent {
    /// The display system is ready for a new frame
    Frame,
    /// An image is no longer used by the output and may be reused
    BufferReleased(Image),
    /// The output was resized
    Mode(Mode),
    /// The output was destroyed, e.g. because its window was closed
    Destroyed,
}

/// State of a [`FrameScheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// No frame is in flight
    Idle,
    /// A frame was committed, waiting for completion
    Committed,
    /// A frame was committed and another one is queued
    CommittedWithPending,
}

/// The display-system side of an output
pub trait PresentSurface {
    /// Attach and commit the image, and arm the completion signal for it
    fn present(&mut self, image: &Image) -> Result<(), AnyError>;

    /// Disarm an armed completion signal
    ///
    /// After this returns, a completion signal arriving late must be ignored.
    fn cancel_frame(&mut self);
}

/// Errors returned when scheduling a frame
#[derive(Debug, thiserror::Error)]
pub enum ScheduleFrameError {
    /// The output does not exist (anymore)
    ///
    /// The image is handed back to the caller.
    #[error("Output does not exist")]
    UnknownOutput(Image),
    /// The display system rejected the commit
    ///
    /// The image was emitted as released again.
    #[error("Failed to present the frame")]
    Present(#[source] AnyError),
}

/// Frame pacing state machine of a single output
#[derive(Debug, Default)]
pub struct FrameScheduler {
    armed: bool,
    pending: Option<Image>,
    presented: Vec<Image>,
    events: Vec<OutputEvent>,
}

impl FrameScheduler {
    /// Create an idle scheduler
    pub fn new() -> Self {
        FrameScheduler::default()
    }

    /// The current state
    pub fn state(&self) -> FrameState {
        match (self.armed, self.pending.is_some()) {
            (false, _) => FrameState::Idle,
            (true, false) => FrameState::Committed,
            (true, true) => FrameState::CommittedWithPending,
        }
    }

    /// Images committed to the display system and not released yet
    pub fn presented(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.presented.iter().map(Image::id)
    }

    /// Submit an image for display
    ///
    /// The image is committed right away when idle, otherwise it becomes the pending image,
    /// releasing any previously pending one.
    pub fn schedule_frame<S: PresentSurface>(
        &mut self,
        surface: &mut S,
        image: Image,
    ) -> Result<(), ScheduleFrameError> {
        if !self.armed {
            return self.commit(surface, image);
        }

        if let Some(displaced) = self.pending.replace(image) {
            trace!(image = %displaced.id(), "Pending frame displaced");
            self.events.push(OutputEvent::BufferReleased(displaced));
        }
        Ok(())
    }

    /// Handle the completion signal of the display system
    pub fn frame_done<S: PresentSurface>(&mut self, surface: &mut S) {
        if !self.armed {
            trace!("Ignoring completion signal without a frame in flight");
            return;
        }
        self.armed = false;

        if let Some(next) = self.pending.take() {
            if let Err(err) = self.commit(surface, next) {
                warn!("Failed to commit pending frame: {}", err);
            }
        }
        self.events.push(OutputEvent::Frame);
    }

    /// Handle the display system releasing a committed image
    ///
    /// Returns `false` if the image is not known to this scheduler.
    pub fn buffer_released(&mut self, id: ImageId) -> bool {
        let Some(index) = self.presented.iter().position(|image| image.id() == id) else {
            return false;
        };
        let image = self.presented.remove(index);
        self.events.push(OutputEvent::BufferReleased(image));
        true
    }

    /// Tear the output down, releasing every image it holds
    pub fn destroy<S: PresentSurface>(&mut self, surface: &mut S) {
        if mem::take(&mut self.armed) {
            surface.cancel_frame();
        }
        if let Some(pending) = self.pending.take() {
            self.events.push(OutputEvent::BufferReleased(pending));
        }
        for image in self.presented.drain(..) {
            self.events.push(OutputEvent::BufferReleased(image));
        }
        self.events.push(OutputEvent::Destroyed);
    }

    /// Report a new mode
    pub fn mode_changed(&mut self, mode: Mode) {
        self.events.push(OutputEvent::Mode(mode));
    }

    /// Take the events produced since the last call
    pub fn take_events(&mut self) -> Vec<OutputEvent> {
        mem::take(&mut self.events)
    }

    fn commit<S: PresentSurface>(&mut self, surface: &mut S, image: Image) -> Result<(), ScheduleFrameError> {
        match surface.present(&image) {
            Ok(()) => {
                trace!(image = %image.id(), "Committed frame");
                self.armed = true;
                self.presented.push(image);
                Ok(())
            }
            Err(err) => {
                self.events.push(OutputEvent::BufferReleased(image));
                Err(ScheduleFrameError::Present(err))
            }
        }
    }
}
