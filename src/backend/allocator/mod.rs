//! Buffer allocation and management.
//!
//! Collection of common traits and implementations around buffer creation and handling.
//!
//! - [`Image`] is a GPU buffer shared between the renderer and the display backend.
//! - [`Allocator`] creates and destroys images, [`DeviceAllocator`] is the implementation
//!   that wires a raw [`BufferDevice`], the renderer's [`ImageHooks`] and a
//!   [`Backend`](crate::backend::Backend) together.
//! - [`GbmAllocator`](gbm::GbmAllocator) is that allocator backed by a GBM device.
//! - [`Swapchain`] rotates a fixed set of images between rendering and display.
//!
//! [`ImageHooks`]: crate::backend::renderer::ImageHooks

use std::{cell::RefCell, error::Error, fmt, io, rc::Rc};

use downcast_rs::{impl_downcast, Downcast};

pub mod dmabuf;
pub mod format;
#[cfg(feature = "backend_gbm")]
pub mod gbm;

mod device;
mod image;
mod swapchain;

pub use self::device::{BufferDevice, DeviceAllocator};
pub use self::image::{Image, ImageId};
pub use self::swapchain::{Swapchain, SwapchainFlags, SwapchainId};

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

use self::dmabuf::Dmabuf;
use crate::backend::AttachError;

/// Common trait describing common properties of most types of buffers.
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32;
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32;
    /// Size (w x h) of the two-dimensional buffer
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Pixel format of the buffer
    fn format(&self) -> Format;
}

/// A raw buffer object that can back an [`Image`]
///
/// The buffer object is freed when the value is dropped.
pub trait ImageBuffer: Buffer + Downcast + fmt::Debug {
    /// Export the buffer's planes as a new [`Dmabuf`]
    fn export(&self) -> Result<Dmabuf, AnyError>;
}
impl_downcast!(ImageBuffer);

bitflags::bitflags! {
    /// Usage hints for buffers allocated with an implicit layout
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// The buffer will be rendered into
        const RENDERING = 1;
        /// The buffer may be put on a display plane
        const SCANOUT = 2;
        /// The buffer must use a linear layout
        const LINEAR = 4;
    }
}

/// Interface to create and destroy [`Image`]s
pub trait Allocator {
    /// Allocate a new image
    ///
    /// If `modifiers` is not empty, the resulting image uses one of them. An empty list lets the
    /// allocator pick a layout suitable for rendering and scanout.
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Image, AllocationError>;

    /// Destroy an image previously returned by [`Allocator::allocate`]
    fn deallocate(&mut self, image: Image);
}

impl<A: Allocator> Allocator for Rc<RefCell<A>> {
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Image, AllocationError> {
        self.borrow_mut().allocate(width, height, fourcc, modifiers)
    }

    fn deallocate(&mut self, image: Image) {
        self.borrow_mut().deallocate(image)
    }
}

/// Type-erased error of a foreign subsystem
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct AnyError(Box<dyn Error + Send + Sync>);

impl AnyError {
    /// Wrap an arbitrary error
    pub fn new(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        AnyError(err.into())
    }
}

/// Reasons an [`Allocator`] may fail to produce an image
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// Width or height was zero
    #[error("Invalid buffer size {0}x{1}")]
    InvalidSize(u32, u32),
    /// The buffer object could not be created
    #[error("Failed to create a buffer object")]
    CreateBuffer(#[source] io::Error),
    /// None of the requested modifiers could be satisfied
    #[error("None of the requested modifiers {requested:?} are supported for {fourcc}")]
    UnsupportedModifiers {
        /// Format that was requested
        fourcc: Fourcc,
        /// Modifiers that were requested
        requested: Vec<Modifier>,
    },
    /// The buffer object could not be exported as a dmabuf
    #[error("Failed to export the buffer object")]
    Export(#[source] AnyError),
    /// The renderer refused the image
    #[error("The renderer failed to import the image")]
    Renderer(#[source] AnyError),
    /// The backend could not import the image
    #[error("The backend failed to import the image")]
    Import(#[from] AttachError),
}
