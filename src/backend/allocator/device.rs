use std::io;

use tracing::{debug, instrument, trace, warn};

use super::{AllocationError, Allocator, Buffer, BufferUsage, Fourcc, Image, ImageBuffer, Modifier};
use crate::backend::{renderer::ImageHooks, Backend};

/// A source of raw buffer objects
///
/// [`DeviceAllocator`] only deals with the bookkeeping of images; the actual memory comes from
/// a `BufferDevice`, e.g. a [`GbmDevice`](super::gbm::GbmDevice).
pub trait BufferDevice {
    /// Buffer objects created by this device
    type Buffer: ImageBuffer;

    /// Create a buffer object using one of the given explicit modifiers
    ///
    /// `modifiers` never contains [`Modifier::Invalid`].
    fn create_buffer_with_modifiers(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> io::Result<Self::Buffer>;

    /// Create a buffer object with a driver-chosen layout
    ///
    /// The returned buffer must report [`Modifier::Invalid`] unless `usage` requests a linear layout.
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        usage: BufferUsage,
    ) -> io::Result<Self::Buffer>;
}

/// The allocator gluing buffer objects, renderer and display backend together
///
/// Every successful [`allocate`](Allocator::allocate) runs three steps in order:
///
/// 1. a buffer object is created on the [`BufferDevice`] and exported as dmabuf
/// 2. the renderer's [`ImageHooks::create`] imports it, if hooks are set
/// 3. the [`Backend::attach`] imports it for display
///
/// A failure at any step undoes the previous steps in reverse order, so no resources leak.
/// [`deallocate`](Allocator::deallocate) runs the same steps backwards.
#[derive(Debug)]
pub struct DeviceAllocator<B, D> {
    backend: B,
    device: D,
    hooks: Option<Box<dyn ImageHooks>>,
    outstanding: usize,
}

impl<B: Backend, D: BufferDevice> DeviceAllocator<B, D> {
    /// Create a new allocator
    pub fn new(backend: B, device: D) -> Self {
        DeviceAllocator {
            backend,
            device,
            hooks: None,
            outstanding: 0,
        }
    }

    /// Set the renderer hooks run for every allocated image
    pub fn with_hooks(mut self, hooks: impl ImageHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    /// Number of images allocated and not yet deallocated
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// The backend images are attached to
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The device buffer objects are created on
    pub fn device(&self) -> &D {
        &self.device
    }

    fn create_buffer_object(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<D::Buffer, AllocationError> {
        let usage = BufferUsage::RENDERING | BufferUsage::SCANOUT;
        if modifiers.is_empty() {
            return self
                .device
                .create_buffer(width, height, fourcc, usage)
                .map_err(AllocationError::CreateBuffer);
        }

        let explicit = modifiers
            .iter()
            .copied()
            .filter(|modifier| *modifier != Modifier::Invalid)
            .collect::<Vec<_>>();
        let implicit_allowed = explicit.len() != modifiers.len();

        let mut last_error = None;
        if !explicit.is_empty() {
            match self
                .device
                .create_buffer_with_modifiers(width, height, fourcc, &explicit)
            {
                Ok(buffer) if modifiers.contains(&buffer.format().modifier) => return Ok(buffer),
                Ok(buffer) => {
                    warn!(
                        modifier = ?buffer.format().modifier,
                        "Device produced a buffer with a modifier that was not requested"
                    );
                }
                Err(err) if implicit_allowed => {
                    debug!("Allocation with explicit modifiers failed, falling back: {}", err);
                }
                Err(err) => last_error = Some(err),
            }
        }

        if implicit_allowed {
            let buffer = self
                .device
                .create_buffer(width, height, fourcc, usage)
                .map_err(AllocationError::CreateBuffer)?;
            if buffer.format().modifier == Modifier::Invalid {
                return Ok(buffer);
            }
            warn!(
                modifier = ?buffer.format().modifier,
                "Implicit allocation reported an explicit modifier"
            );
        }

        Err(match last_error {
            Some(err) => AllocationError::CreateBuffer(err),
            None => AllocationError::UnsupportedModifiers {
                fourcc,
                requested: modifiers.to_vec(),
            },
        })
    }
}

impl<B: Backend, D: BufferDevice> Allocator for DeviceAllocator<B, D> {
    #[instrument(level = "trace", skip(self), err)]
    #[profiling::function]
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Image, AllocationError> {
        if width == 0 || height == 0 {
            return Err(AllocationError::InvalidSize(width, height));
        }

        let buffer = self.create_buffer_object(width, height, fourcc, modifiers)?;
        let dmabuf = buffer.export().map_err(AllocationError::Export)?;
        let mut image = Image::new(Box::new(buffer), dmabuf);

        if let Some(hooks) = self.hooks.as_mut() {
            // dropping the image frees the buffer object
            hooks.create(&mut image).map_err(AllocationError::Renderer)?;
        }

        if let Err(err) = self.backend.attach(&mut image) {
            if let Some(hooks) = self.hooks.as_mut() {
                hooks.destroy(&mut image);
            }
            return Err(AllocationError::Import(err));
        }

        self.outstanding += 1;
        trace!(image = %image.id(), format = ?image.format(), "Allocated image");
        Ok(image)
    }

    #[profiling::function]
    fn deallocate(&mut self, mut image: Image) {
        trace!(image = %image.id(), "Deallocating image");
        self.backend.detach(&mut image);
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.destroy(&mut image);
        }
        drop(image.into_buffer());
        debug_assert!(self.outstanding > 0, "deallocated more images than were allocated");
        self.outstanding -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AttachError;
    use crate::test_utils::{init_logging, Counters, CountingHooks, FakeBackend, FakeDevice};

    fn allocator(counters: &Counters) -> DeviceAllocator<FakeBackend, FakeDevice> {
        init_logging();
        DeviceAllocator::new(FakeBackend::new(counters), FakeDevice::new(counters))
            .with_hooks(CountingHooks::new(counters))
    }

    #[test]
    fn allocate_then_deallocate_keeps_outstanding() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);
        let before = allocator.outstanding();

        let image = allocator
            .allocate(64, 64, Fourcc::Xrgb8888, &[Modifier::Linear])
            .expect("Allocation succeeds");
        assert_eq!(allocator.outstanding(), before + 1);
        allocator.deallocate(image);

        assert_eq!(allocator.outstanding(), before);
        assert_eq!(counters.live_buffers(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "deallocated more images than were allocated")]
    fn deallocating_a_foreign_image_is_caught() {
        let counters = Counters::default();
        let mut owner = allocator(&counters);
        let mut other = allocator(&counters);

        let image = owner
            .allocate(64, 64, Fourcc::Xrgb8888, &[Modifier::Linear])
            .expect("Allocation succeeds");
        other.deallocate(image);
    }

    #[test]
    fn attach_and_detach_are_symmetric() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);

        let images = (0..3)
            .map(|_| allocator.allocate(32, 32, Fourcc::Argb8888, &[]).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(counters.attach.get(), 3);
        assert_eq!(counters.renderer_create.get(), 3);

        for image in images {
            allocator.deallocate(image);
        }
        assert_eq!(counters.detach.get(), 3);
        assert_eq!(counters.renderer_destroy.get(), 3);
    }

    #[test]
    fn deallocate_runs_in_reverse_order() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);
        let image = allocator.allocate(16, 16, Fourcc::Xrgb8888, &[]).unwrap();
        counters.log.borrow_mut().clear();

        allocator.deallocate(image);
        assert_eq!(
            *counters.log.borrow(),
            vec!["backend_detach", "renderer_destroy", "buffer_free"]
        );
    }

    #[test]
    fn failed_import_leaks_nothing() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);
        counters.fail_attach.set(true);

        let result = allocator.allocate(64, 64, Fourcc::Xrgb8888, &[]);
        assert!(matches!(
            result,
            Err(AllocationError::Import(AttachError::Unsupported(_)))
        ));
        assert_eq!(counters.live_buffers(), 0);
        assert_eq!(counters.renderer_create.get(), counters.renderer_destroy.get());
        assert_eq!(allocator.outstanding(), 0);
        assert_eq!(
            *counters.log.borrow(),
            vec![
                "buffer_create",
                "renderer_create",
                "backend_attach",
                "renderer_destroy",
                "buffer_free"
            ]
        );
    }

    #[test]
    fn renderer_rejection_skips_backend() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);
        counters.fail_renderer.set(true);

        let result = allocator.allocate(64, 64, Fourcc::Xrgb8888, &[]);
        assert!(matches!(result, Err(AllocationError::Renderer(_))));
        assert_eq!(counters.attach.get(), 0);
        assert_eq!(counters.live_buffers(), 0);
    }

    #[test]
    fn zero_size_is_rejected() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);
        assert!(matches!(
            allocator.allocate(0, 64, Fourcc::Xrgb8888, &[]),
            Err(AllocationError::InvalidSize(0, 64))
        ));
        assert_eq!(counters.buffer_create.get(), 0);
    }

    #[test]
    fn empty_modifier_list_uses_implicit_layout() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);
        let image = allocator.allocate(8, 8, Fourcc::Xrgb8888, &[]).unwrap();
        assert_eq!(image.format().modifier, Modifier::Invalid);
        assert_eq!(image.dmabuf().modifier(), Modifier::Invalid);
        allocator.deallocate(image);
    }

    #[test]
    fn explicit_modifier_is_honored() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);
        let image = allocator
            .allocate(8, 8, Fourcc::Xrgb8888, &[Modifier::Linear])
            .unwrap();
        assert_eq!(image.format().modifier, Modifier::Linear);
        allocator.deallocate(image);
    }

    #[test]
    fn unsupported_explicit_modifier_fails_without_fallback() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);
        counters.fail_explicit.set(true);

        let result = allocator.allocate(8, 8, Fourcc::Xrgb8888, &[Modifier::Linear]);
        assert!(matches!(result, Err(AllocationError::CreateBuffer(_))));
        assert_eq!(counters.live_buffers(), 0);
    }

    #[test]
    fn invalid_modifier_allows_implicit_fallback() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);
        counters.fail_explicit.set(true);

        let image = allocator
            .allocate(8, 8, Fourcc::Xrgb8888, &[Modifier::Linear, Modifier::Invalid])
            .expect("Falls back to implicit allocation");
        assert_eq!(image.format().modifier, Modifier::Invalid);
        allocator.deallocate(image);
    }

    #[test]
    fn unexpected_modifier_is_rejected() {
        let counters = Counters::default();
        let mut allocator = allocator(&counters);
        counters.force_modifier.set(Some(Modifier::I915_x_tiled));

        let result = allocator.allocate(8, 8, Fourcc::Xrgb8888, &[Modifier::Linear]);
        assert!(matches!(result, Err(AllocationError::UnsupportedModifiers { .. })));
        assert_eq!(counters.live_buffers(), 0);
    }
}
