//! Display backends and buffer management
//!
//! A backend presents rendered images in some display system. Two backends are provided,
//! both running nested inside another display server:
//!
//! - [`x11`] opens windows on an X11 server and presents through DRI3 and the Present extension
//! - [`wayland`] opens toplevel surfaces on a Wayland compositor and presents through
//!   `zwp_linux_dmabuf_v1`
//!
//! Both expose the same [`Backend`] interface to the [`allocator`], which imports every image
//! into the backend as it is created. Each backend is also a [`calloop`] event source
//! producing [`BackendEvent`]s.

use std::io;

use crate::backend::allocator::{format::FormatSet, AnyError, Format, Image};
use crate::output::{OutputEvent, OutputId};
use crate::utils::DeviceFd;

pub mod allocator;
pub mod renderer;

#[cfg(any(feature = "backend_x11", feature = "backend_wayland"))]
pub(crate) mod outputs;

#[cfg(feature = "backend_wayland")]
pub mod wayland;
#[cfg(feature = "backend_x11")]
pub mod x11;

/// Interface of a display backend towards allocators
pub trait Backend {
    /// The render node of the GPU the display system uses
    fn render_fd(&self) -> DeviceFd;

    /// Formats and modifiers the display system can import
    fn formats(&self) -> FormatSet;

    /// Import an image so it can later be presented
    ///
    /// Backend-private resources are stored in the image's [backend slot](Image::backend_data).
    fn attach(&mut self, image: &mut Image) -> Result<(), AttachError>;

    /// Release everything [`Backend::attach`] created for the image
    fn detach(&mut self, image: &mut Image);
}

/// Errors importing an image into a backend
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// The display system cannot use buffers of this format
    #[error("Format {0:?} cannot be imported")]
    Unsupported(Format),
    /// The import path available cannot handle this many planes
    #[error("Buffer has {planes} planes, the import path supports at most {max}")]
    TooManyPlanes {
        /// Planes of the buffer
        planes: usize,
        /// Planes supported
        max: usize,
    },
    /// A plane file descriptor could not be duplicated
    #[error("Failed to duplicate a dmabuf fd")]
    Fd(#[source] io::Error),
    /// The connection to the display system is gone
    #[error("The backend is disconnected")]
    Disconnected,
    /// The display system rejected the import
    #[error(transparent)]
    Protocol(#[from] AnyError),
}

/// Events produced by a backend
#[derive(Debug)]
pub enum BackendEvent {
    /// An output was created
    NewOutput(OutputId),
    /// Something happened on an output
    Output {
        /// The output concerned
        output: OutputId,
        /// What happened
        event: OutputEvent,
    },
    /// The connection to the display system was lost
    ///
    /// This is the last event the backend produces. The event source removes itself from the
    /// event loop afterwards.
    Disconnected,
}
