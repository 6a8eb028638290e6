use std::fmt;

use super::{dmabuf::Dmabuf, Buffer, Format, ImageBuffer, SwapchainId};
use crate::utils::{ids::id_type, DataSlot};

id_type!(
    /// Unique identifier of an [`Image`]
    ImageId
);

/// Slot of a swapchain an image belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotRef {
    pub(crate) swapchain: SwapchainId,
    pub(crate) index: usize,
}

/// A GPU buffer shared between the renderer and a display backend
///
/// An image owns its buffer object and the exported dmabuf planes. On top of that it carries
/// three independent slots for private data:
///
/// - [`Image::backend_data`] holds whatever the display backend created when importing the
///   buffer (an X11 pixmap, a `wl_buffer`, ...)
/// - [`Image::renderer_data`] holds the renderer's import (e.g. an EGL image)
/// - [`Image::user_data`] is free for use by the compositor and travels with the image
///   through scheduling and release
///
/// Images are not `Clone`: exactly one party holds an image at any time, which is how the
/// swapchain and the output scheduler track whether a buffer is in use.
pub struct Image {
    id: ImageId,
    format: Format,
    width: u32,
    height: u32,
    dmabuf: Dmabuf,
    buffer: Box<dyn ImageBuffer>,
    backend_data: DataSlot,
    renderer_data: DataSlot,
    user_data: DataSlot,
    pub(crate) owner: Option<SlotRef>,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("size", &(self.width, self.height))
            .field("buffer", &self.buffer)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Wrap a freshly allocated buffer object and its exported planes
    ///
    /// Size and format are taken from the dmabuf.
    pub fn new(buffer: Box<dyn ImageBuffer>, dmabuf: Dmabuf) -> Image {
        Image {
            id: ImageId::next(),
            format: dmabuf.format(),
            width: dmabuf.width(),
            height: dmabuf.height(),
            dmabuf,
            buffer,
            backend_data: DataSlot::new(),
            renderer_data: DataSlot::new(),
            user_data: DataSlot::new(),
            owner: None,
        }
    }

    /// Identifier of this image
    pub fn id(&self) -> ImageId {
        self.id
    }

    /// Exported planes of this image
    pub fn dmabuf(&self) -> &Dmabuf {
        &self.dmabuf
    }

    /// Access the underlying buffer object, if it has type `B`
    pub fn buffer<B: ImageBuffer>(&self) -> Option<&B> {
        self.buffer.downcast_ref::<B>()
    }

    /// Data attached by the display backend
    pub fn backend_data(&self) -> &DataSlot {
        &self.backend_data
    }

    /// Mutable access to the data attached by the display backend
    pub fn backend_data_mut(&mut self) -> &mut DataSlot {
        &mut self.backend_data
    }

    /// Data attached by the renderer
    pub fn renderer_data(&self) -> &DataSlot {
        &self.renderer_data
    }

    /// Mutable access to the data attached by the renderer
    pub fn renderer_data_mut(&mut self) -> &mut DataSlot {
        &mut self.renderer_data
    }

    /// Data attached by the compositor
    pub fn user_data(&self) -> &DataSlot {
        &self.user_data
    }

    /// Mutable access to the data attached by the compositor
    pub fn user_data_mut(&mut self) -> &mut DataSlot {
        &mut self.user_data
    }

    /// Whether this image belongs to a swapchain
    pub fn is_swapchain_image(&self) -> bool {
        self.owner.is_some()
    }

    pub(crate) fn into_buffer(self) -> Box<dyn ImageBuffer> {
        self.buffer
    }
}

impl Buffer for Image {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> Format {
        self.format
    }
}
