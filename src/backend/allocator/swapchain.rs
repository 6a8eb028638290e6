use tracing::{debug, error, trace};

use super::{image::SlotRef, AllocationError, Allocator, Fourcc, Image, Modifier};
use crate::utils::ids::id_type;

id_type!(
    /// Unique identifier of a [`Swapchain`]
    SwapchainId
);

bitflags::bitflags! {
    /// Options for [`Swapchain::new`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SwapchainFlags: u32 {
        /// Allocate three images instead of two
        const TRIPLE_BUFFERED = 1;
    }
}

/// Swapchain handling a fixed set of re-usable images.
///
/// ## How am I supposed to use this?
///
/// To do proper buffer management, most compositors do so called double-buffering.
/// Which means you use two buffers, one that is currently presented (the front buffer)
/// and one that is currently rendered to (the back buffer). After each rendering operation
/// you swap the buffers around, the old front buffer becomes the new back buffer, while
/// the new front buffer is displayed to the user. This avoids showing the user rendering
/// artifacts doing rendering.
///
/// There are also reasons to do triple-buffering, e.g. if you swap operation takes a
/// unspecified amount of time. In that case you have one buffer, that is currently
/// displayed, one that is done drawing and about to be swapped in and another one,
/// which you can use to render currently. Pass [`SwapchainFlags::TRIPLE_BUFFERED`] for that.
///
/// All images are allocated up front. [`acquire`](Swapchain::acquire) hands out the free image
/// that was released the longest time ago and moves it out of the swapchain. Once the display
/// system is done with it, give it back with [`release`](Swapchain::release).
/// When every image is out, `acquire` returns `None`; that is the backpressure signal to stop
/// rendering until a buffer comes back.
///
/// If you have associated resources for each image that can be reused, store them in the
/// image's [`user_data`](Image::user_data_mut). Images keep their data across acquire/release cycles.
#[derive(Debug)]
pub struct Swapchain<A: Allocator> {
    allocator: A,
    id: SwapchainId,

    width: u32,
    height: u32,
    fourcc: Fourcc,
    modifiers: Vec<Modifier>,

    slots: Vec<Slot>,
    counter: u64,
}

#[derive(Debug)]
struct Slot {
    /// `None` while the image is acquired
    image: Option<Image>,
    seq: u64,
}

impl<A: Allocator> Swapchain<A> {
    /// Create a new swapchain, eagerly allocating all of its images.
    ///
    /// If any allocation fails, the images allocated so far are deallocated again and the
    /// error is returned.
    pub fn new(
        mut allocator: A,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
        flags: SwapchainFlags,
    ) -> Result<Swapchain<A>, AllocationError> {
        let count = if flags.contains(SwapchainFlags::TRIPLE_BUFFERED) {
            3
        } else {
            2
        };
        let id = SwapchainId::next();

        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            match allocator.allocate(width, height, fourcc, modifiers) {
                Ok(mut image) => {
                    image.owner = Some(SlotRef { swapchain: id, index });
                    slots.push(Slot {
                        image: Some(image),
                        seq: 0,
                    });
                }
                Err(err) => {
                    error!(%id, "Failed to allocate swapchain image {}: {}", index, err);
                    for image in slots.into_iter().filter_map(|slot| slot.image) {
                        allocator.deallocate(image);
                    }
                    return Err(err);
                }
            }
        }

        debug!(%id, width, height, ?fourcc, count, "Created swapchain");
        Ok(Swapchain {
            allocator,
            id,
            width,
            height,
            fourcc,
            modifiers: modifiers.to_vec(),
            slots,
            counter: 0,
        })
    }

    /// Identifier of this swapchain
    pub fn id(&self) -> SwapchainId {
        self.id
    }

    /// Acquire the least recently released free image, if there is one.
    ///
    /// Returns `None` exactly when every image of the swapchain is acquired.
    #[profiling::function]
    pub fn acquire(&mut self) -> Option<Image> {
        let slot = self
            .slots
            .iter_mut()
            .filter(|slot| slot.image.is_some())
            .min_by_key(|slot| slot.seq)?;
        let image = slot.image.take();
        trace!(swapchain = %self.id, image = ?image.as_ref().map(Image::id), "Acquired image");
        image
    }

    /// Give an acquired image back to the swapchain.
    ///
    /// # Panics
    ///
    /// Panics if the image was not acquired from this swapchain.
    #[profiling::function]
    pub fn release(&mut self, image: Image) {
        let Some(owner) = image.owner else {
            panic!("Released image does not belong to a swapchain");
        };
        assert_eq!(
            owner.swapchain, self.id,
            "Released image belongs to a different swapchain"
        );
        let slot = &mut self.slots[owner.index];
        assert!(slot.image.is_none(), "Released image was not acquired");

        self.counter += 1;
        slot.seq = self.counter;
        trace!(swapchain = %self.id, image = %image.id(), seq = slot.seq, "Released image");
        slot.image = Some(image);
    }

    /// Destroy the swapchain, deallocating all of its images.
    ///
    /// Dropping the swapchain has the same effect.
    ///
    /// # Panics
    ///
    /// Panics if any image is still acquired.
    pub fn destroy(self) {
        drop(self);
    }

    /// Number of images in the swapchain
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always `false`, a swapchain has at least two images
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of images currently acquired
    pub fn acquired(&self) -> usize {
        self.slots.iter().filter(|slot| slot.image.is_none()).count()
    }

    /// Dimensions of the images
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Pixel format of the images
    pub fn format(&self) -> Fourcc {
        self.fourcc
    }

    /// Modifiers the images were allocated with
    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    /// The allocator used by this swapchain
    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

impl<A: Allocator> Drop for Swapchain<A> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert_eq!(self.acquired(), 0, "Swapchain destroyed while images are acquired");
        }
        for image in self.slots.drain(..).filter_map(|slot| slot.image) {
            self.allocator.deallocate(image);
        }
        debug!(id = %self.id, "Destroyed swapchain");
    }
}
