//! Renderer integration of the allocator
//!
//! The allocator does not know how a renderer consumes buffers. Instead it calls the
//! [`ImageHooks`] of the renderer right after a buffer object was created and right before it
//! is freed, so the renderer can import the image and later release that import again.
//!
//! [`EglImageHooks`] implements these hooks for EGL based renderers: every image is imported
//! through an [`EglImporter`] and the resulting handle stored in the image's
//! [renderer slot](Image::renderer_data).

use std::fmt;

use tracing::{trace, warn};

use crate::backend::allocator::{dmabuf::Dmabuf, AnyError, Image};

/// Callbacks run by the allocator around the lifetime of every image
pub trait ImageHooks: fmt::Debug {
    /// Import a freshly created image
    ///
    /// Returning an error aborts the allocation; the buffer object is freed and the backend
    /// never sees the image.
    fn create(&mut self, image: &mut Image) -> Result<(), AnyError>;

    /// Release everything [`ImageHooks::create`] attached to the image
    ///
    /// Must tolerate images without any renderer data attached.
    fn destroy(&mut self, image: &mut Image);
}

/// The parts of an EGL context needed to import dmabufs
pub trait EglImporter: fmt::Debug {
    /// Handle of an imported image
    type Image: 'static;
    /// Error returned by the context
    type Error: std::error::Error + Send + Sync + 'static;

    /// Make the context current on the calling thread
    fn make_current(&self) -> Result<(), Self::Error>;
    /// Import the planes of a dmabuf
    fn create_image_from_dmabuf(&self, dmabuf: &Dmabuf) -> Result<Self::Image, Self::Error>;
    /// Free an image obtained from [`EglImporter::create_image_from_dmabuf`]
    fn destroy_image(&self, image: Self::Image);
}

/// Renderer data stored on images imported by [`EglImageHooks`]
#[derive(Debug)]
pub struct EglImageData<I> {
    /// The imported image handle
    pub image: I,
}

/// [`ImageHooks`] importing every image into an EGL context
#[derive(Debug)]
pub struct EglImageHooks<E> {
    egl: E,
}

impl<E: EglImporter> EglImageHooks<E> {
    /// Create hooks importing into the given context
    pub fn new(egl: E) -> Self {
        EglImageHooks { egl }
    }

    /// The wrapped context
    pub fn importer(&self) -> &E {
        &self.egl
    }
}

impl<E: EglImporter> ImageHooks for EglImageHooks<E> {
    fn create(&mut self, image: &mut Image) -> Result<(), AnyError> {
        self.egl.make_current().map_err(AnyError::new)?;
        let egl_image = self
            .egl
            .create_image_from_dmabuf(image.dmabuf())
            .map_err(AnyError::new)?;
        trace!(image = %image.id(), "Imported image into EGL");
        image.renderer_data_mut().set(EglImageData { image: egl_image });
        Ok(())
    }

    fn destroy(&mut self, image: &mut Image) {
        let Some(data) = image.renderer_data_mut().take::<EglImageData<E::Image>>() else {
            return;
        };
        if let Err(err) = self.egl.make_current() {
            warn!("Failed to make EGL context current while releasing an image: {}", err);
        }
        self.egl.destroy_image(data.image);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::backend::allocator::{Allocator, DeviceAllocator, Fourcc};
    use crate::test_utils::{Counters, FakeBackend, FakeDevice};

    #[derive(Debug, thiserror::Error)]
    #[error("context lost")]
    struct ContextLost;

    #[derive(Debug, Default, Clone)]
    struct FakeEgl {
        live: Rc<RefCell<Vec<u32>>>,
        next: Rc<RefCell<u32>>,
        lost: Rc<RefCell<bool>>,
    }

    impl EglImporter for FakeEgl {
        type Image = u32;
        type Error = ContextLost;

        fn make_current(&self) -> Result<(), ContextLost> {
            if *self.lost.borrow() {
                Err(ContextLost)
            } else {
                Ok(())
            }
        }

        fn create_image_from_dmabuf(&self, _dmabuf: &Dmabuf) -> Result<u32, ContextLost> {
            let mut next = self.next.borrow_mut();
            *next += 1;
            self.live.borrow_mut().push(*next);
            Ok(*next)
        }

        fn destroy_image(&self, image: u32) {
            self.live.borrow_mut().retain(|live| *live != image);
        }
    }

    #[test]
    fn images_are_imported_and_released() {
        let counters = Counters::default();
        let egl = FakeEgl::default();
        let mut allocator = DeviceAllocator::new(FakeBackend::new(&counters), FakeDevice::new(&counters))
            .with_hooks(EglImageHooks::new(egl.clone()));

        let image = allocator.allocate(32, 32, Fourcc::Xrgb8888, &[]).unwrap();
        let data = image
            .renderer_data()
            .get::<EglImageData<u32>>()
            .expect("Image was imported");
        assert_eq!(egl.live.borrow().as_slice(), &[data.image]);

        allocator.deallocate(image);
        assert!(egl.live.borrow().is_empty());
    }

    #[test]
    fn lost_context_fails_allocation() {
        let counters = Counters::default();
        let egl = FakeEgl::default();
        *egl.lost.borrow_mut() = true;
        let mut allocator = DeviceAllocator::new(FakeBackend::new(&counters), FakeDevice::new(&counters))
            .with_hooks(EglImageHooks::new(egl.clone()));

        assert!(allocator.allocate(32, 32, Fourcc::Xrgb8888, &[]).is_err());
        assert_eq!(counters.attach.get(), 0);
        assert!(egl.live.borrow().is_empty());
    }

    #[test]
    fn destroy_without_import_is_a_noop() {
        let counters = Counters::default();
        let egl = FakeEgl::default();
        let mut hooks = EglImageHooks::new(egl.clone());
        let mut image = crate::test_utils::fake_image(&counters, 4, 4);
        hooks.destroy(&mut image);
        assert!(egl.live.borrow().is_empty());
    }
}
