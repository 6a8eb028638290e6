//! Module for [dmabuf](https://docs.kernel.org/driver-api/dma-buf.html) buffers.
//!
//! A [`Dmabuf`] describes how a GPU buffer is laid out in memory: one file descriptor,
//! offset and stride per plane plus the format modifier shared by all planes.
//! `Dmabuf`s act alike to smart pointers and can be freely cloned and passed around.
//! Once the last `Dmabuf` reference is dropped, its file descriptors are closed.
//!
//! Protocols carry the 64-bit modifier as two 32-bit halves; [`split_modifier`] and
//! [`join_modifier`] implement that conversion.

use super::{Buffer, Format, Fourcc, Modifier};
use std::hash::{Hash, Hasher};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

/// Maximum amount of planes this implementation supports
pub const MAX_PLANES: usize = 4;

#[derive(Debug)]
struct DmabufInternal {
    planes: Vec<Plane>,
    width: u32,
    height: u32,
    format: Format,
    flags: DmabufFlags,
}

/// A single plane of a [`Dmabuf`]
#[derive(Debug)]
pub struct Plane {
    fd: OwnedFd,
    /// Index of the plane inside the buffer
    pub plane_idx: u32,
    /// Offset from the start of the fd
    pub offset: u32,
    /// Stride for this plane
    pub stride: u32,
}

impl AsFd for Plane {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

bitflags::bitflags! {
    /// Possible flags for a DMA buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmabufFlags: u32 {
        /// The buffer content is Y-inverted
        const Y_INVERT = 1;
        /// The buffer content is interlaced
        const INTERLACED = 2;
        /// The buffer content if interlaced is bottom-field first
        const BOTTOM_FIRST = 4;
    }
}

/// Strong reference to a dmabuf handle
#[derive(Debug, Clone)]
pub struct Dmabuf(Arc<DmabufInternal>);

impl PartialEq for Dmabuf {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Dmabuf {}

impl Hash for Dmabuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}

impl Buffer for Dmabuf {
    fn width(&self) -> u32 {
        self.0.width
    }

    fn height(&self) -> u32 {
        self.0.height
    }

    fn format(&self) -> Format {
        self.0.format
    }
}

/// Builder for Dmabufs
#[derive(Debug)]
pub struct DmabufBuilder {
    internal: DmabufInternal,
}

impl DmabufBuilder {
    /// Add a plane to the constructed Dmabuf
    ///
    /// *Note*: Each Dmabuf needs at least one plane.
    /// [`MAX_PLANES`] notes the maximum amount of planes any format may use with this implementation,
    /// adding more fails and returns `false`.
    pub fn add_plane(&mut self, fd: OwnedFd, idx: u32, offset: u32, stride: u32) -> bool {
        if self.internal.planes.len() == MAX_PLANES {
            return false;
        }
        self.internal.planes.push(Plane {
            fd,
            plane_idx: idx,
            offset,
            stride,
        });

        true
    }

    /// Build a `Dmabuf` out of the provided parameters and planes
    ///
    /// Returns `None` if the builder has no planes attached.
    pub fn build(mut self) -> Option<Dmabuf> {
        if self.internal.planes.is_empty() {
            return None;
        }

        self.internal.planes.sort_by_key(|plane| plane.plane_idx);
        Some(Dmabuf(Arc::new(self.internal)))
    }
}

impl Dmabuf {
    /// Create a new Dmabuf builder
    pub fn builder(width: u32, height: u32, format: Format, flags: DmabufFlags) -> DmabufBuilder {
        DmabufBuilder {
            internal: DmabufInternal {
                planes: Vec::with_capacity(MAX_PLANES),
                width,
                height,
                format,
                flags,
            },
        }
    }

    /// The pixel format code of this buffer
    pub fn fourcc(&self) -> Fourcc {
        self.0.format.code
    }

    /// The modifier shared by all planes
    pub fn modifier(&self) -> Modifier {
        self.0.format.modifier
    }

    /// The amount of planes this Dmabuf has
    pub fn num_planes(&self) -> usize {
        self.0.planes.len()
    }

    /// Planes of this buffer, ordered by plane index
    pub fn planes(&self) -> impl ExactSizeIterator<Item = &Plane> + '_ {
        self.0.planes.iter()
    }

    /// Returns borrowed handles of the planes of this buffer
    pub fn handles(&self) -> impl Iterator<Item = BorrowedFd<'_>> + '_ {
        self.0.planes.iter().map(|p| p.fd.as_fd())
    }

    /// Returns offsets for the planes of this buffer
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.offset)
    }

    /// Returns strides for the planes of this buffer
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.stride)
    }

    /// Returns if this buffer format has any vendor-specific modifiers set or is implicit/linear
    pub fn has_modifier(&self) -> bool {
        self.modifier() != Modifier::Invalid && self.modifier() != Modifier::Linear
    }

    /// Flags this buffer was created with
    pub fn flags(&self) -> DmabufFlags {
        self.0.flags
    }
}

/// Splits a modifier into the `(hi, lo)` halves used on the wire
///
/// `hi` holds bits 63..32, `lo` bits 31..0.
pub fn split_modifier(modifier: Modifier) -> (u32, u32) {
    let raw: u64 = modifier.into();
    ((raw >> 32) as u32, (raw & 0xffff_ffff) as u32)
}

/// Reassembles a modifier from its wire halves
pub fn join_modifier(hi: u32, lo: u32) -> Modifier {
    Modifier::from(((hi as u64) << 32) | lo as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::null_fd;

    #[test]
    fn modifier_split_is_bit_exact() {
        let raw = 0x0100_0000_0000_0001u64;
        assert_eq!(split_modifier(Modifier::from(raw)), (0x0100_0000, 0x0000_0001));
        assert_eq!(split_modifier(Modifier::Linear), (0, 0));
        assert_eq!(split_modifier(Modifier::Invalid), (0x00ff_ffff, 0xffff_ffff));
        assert_eq!(split_modifier(Modifier::from(0xffff_ffffu64)), (0, 0xffff_ffff));
    }

    #[test]
    fn modifier_join_inverts_split() {
        for raw in [0u64, 1, 0xffff_ffff, 0x1_0000_0000, 0x00ff_ffff_ffff_ffff, u64::MAX] {
            let (hi, lo) = split_modifier(Modifier::from(raw));
            assert_eq!(u64::from(join_modifier(hi, lo)), raw, "round trip of {:#x}", raw);
        }
    }

    #[test]
    fn builder_orders_planes_and_caps_count() {
        let format = Format {
            code: Fourcc::Nv12,
            modifier: Modifier::Linear,
        };
        let mut builder = Dmabuf::builder(64, 32, format, DmabufFlags::empty());
        assert!(builder.add_plane(null_fd(), 1, 2048, 64));
        assert!(builder.add_plane(null_fd(), 0, 0, 64));
        assert!(builder.add_plane(null_fd(), 2, 0, 64));
        assert!(builder.add_plane(null_fd(), 3, 0, 64));
        assert!(!builder.add_plane(null_fd(), 4, 0, 64));

        let dmabuf = builder.build().expect("Builder has planes");
        assert_eq!(dmabuf.num_planes(), MAX_PLANES);
        assert_eq!(dmabuf.offsets().take(2).collect::<Vec<_>>(), vec![0, 2048]);
        assert_eq!(dmabuf.size(), (64, 32));
        assert!(!dmabuf.has_modifier());
    }

    #[test]
    fn empty_builder_fails() {
        let format = Format {
            code: Fourcc::Xrgb8888,
            modifier: Modifier::Invalid,
        };
        assert!(Dmabuf::builder(1, 1, format, DmabufFlags::empty()).build().is_none());
    }
}
