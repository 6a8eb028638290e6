//! Module for Buffers created using [libgbm](gbm).
//!
//! [`GbmDevice`](gbm::Device) implements [`BufferDevice`] and [`GbmBuffer`] wraps its buffer
//! objects, so a GBM device can back a [`DeviceAllocator`]. [`GbmAllocator`] is that combination
//! created straight from the render node of a [`Backend`].

use std::io;
use std::os::unix::io::AsFd;

use gbm::BufferObject;
pub use gbm::{BufferObjectFlags as GbmBufferFlags, Device as GbmDevice, DeviceDestroyedError};
use tracing::{info, instrument};

use super::{
    dmabuf::{Dmabuf, DmabufFlags},
    AnyError, Buffer, BufferDevice, BufferUsage, DeviceAllocator, Format, Fourcc, ImageBuffer, Modifier,
};
use crate::backend::Backend;
use crate::utils::{DevPath, DeviceFd};

/// A GBM buffer object
#[derive(Debug)]
pub struct GbmBuffer {
    bo: BufferObject<()>,
    width: u32,
    height: u32,
    format: Format,
}

impl GbmBuffer {
    /// Create a [`GbmBuffer`] from an existing [`BufferObject`]
    ///
    /// `implicit` forces the object to assume the modifier is `Invalid` for cases,
    /// where the buffer was allocated with an older api, that doesn't support modifiers.
    ///
    /// Gbm might otherwise give us the underlying or a non-sensical modifier,
    /// which can fail in various other apis.
    ///
    /// Fails if the device of the buffer object was already destroyed.
    pub fn from_bo(bo: BufferObject<()>, implicit: bool) -> Result<Self, DeviceDestroyedError> {
        let format = Format {
            code: bo.format()?,
            modifier: if implicit { Modifier::Invalid } else { bo.modifier()? },
        };
        Ok(GbmBuffer {
            width: bo.width()?,
            height: bo.height()?,
            bo,
            format,
        })
    }
}

impl std::ops::Deref for GbmBuffer {
    type Target = BufferObject<()>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.bo
    }
}

impl Buffer for GbmBuffer {
    #[inline]
    fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    fn format(&self) -> Format {
        self.format
    }
}

impl ImageBuffer for GbmBuffer {
    #[profiling::function]
    fn export(&self) -> Result<Dmabuf, AnyError> {
        let planes = self.bo.plane_count().map_err(AnyError::new)? as i32;

        let mut builder = Dmabuf::builder(self.width, self.height, self.format, DmabufFlags::empty());
        for idx in 0..planes {
            // `gbm_bo_get_fd_for_plane` returns a new fd owned by the caller
            let fd = self.bo.fd_for_plane(idx).map_err(AnyError::new)?;
            let offset = self.bo.offset(idx).map_err(AnyError::new)?;
            let stride = self.bo.stride_for_plane(idx).map_err(AnyError::new)?;
            builder.add_plane(fd, idx as u32, offset, stride);
        }

        builder
            .build()
            .ok_or_else(|| AnyError::new("GBM buffer object without planes"))
    }
}

fn device_destroyed(err: DeviceDestroyedError) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, err)
}

fn gbm_flags(usage: BufferUsage) -> GbmBufferFlags {
    let mut flags = GbmBufferFlags::empty();
    if usage.contains(BufferUsage::RENDERING) {
        flags |= GbmBufferFlags::RENDERING;
    }
    if usage.contains(BufferUsage::SCANOUT) {
        flags |= GbmBufferFlags::SCANOUT;
    }
    if usage.contains(BufferUsage::LINEAR) {
        flags |= GbmBufferFlags::LINEAR;
    }
    flags
}

impl<T: AsFd + 'static> BufferDevice for GbmDevice<T> {
    type Buffer = GbmBuffer;

    #[instrument(level = "trace", skip(self), err)]
    #[profiling::function]
    fn create_buffer_with_modifiers(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> io::Result<GbmBuffer> {
        let bo = self.create_buffer_object_with_modifiers::<()>(width, height, fourcc, modifiers.iter().copied())?;
        GbmBuffer::from_bo(bo, false).map_err(device_destroyed)
    }

    #[instrument(level = "trace", skip(self), err)]
    #[profiling::function]
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        usage: BufferUsage,
    ) -> io::Result<GbmBuffer> {
        let linear = usage.contains(BufferUsage::LINEAR);
        let bo = self.create_buffer_object::<()>(width, height, fourcc, gbm_flags(usage))?;
        let mut buffer = GbmBuffer::from_bo(bo, true).map_err(device_destroyed)?;
        if linear {
            buffer.format.modifier = Modifier::Linear;
        }
        Ok(buffer)
    }
}

/// [`DeviceAllocator`] backed by a GBM device
pub type GbmAllocator<B> = DeviceAllocator<B, GbmDevice<DeviceFd>>;

impl<B: Backend> DeviceAllocator<B, GbmDevice<DeviceFd>> {
    /// Create a GBM allocator on the render node of the given backend
    pub fn with_gbm(backend: B) -> io::Result<Self> {
        let fd = backend.render_fd();
        let path = fd.dev_path();
        let device = GbmDevice::new(fd)?;
        info!(
            node = ?path,
            backend = device.backend_name(),
            "Created GBM allocator"
        );
        Ok(DeviceAllocator::new(backend, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_maps_to_gbm_flags() {
        assert_eq!(
            gbm_flags(BufferUsage::RENDERING | BufferUsage::SCANOUT),
            GbmBufferFlags::RENDERING | GbmBufferFlags::SCANOUT
        );
        assert_eq!(gbm_flags(BufferUsage::LINEAR), GbmBufferFlags::LINEAR);
        assert!(gbm_flags(BufferUsage::empty()).is_empty());
    }

    #[test]
    fn destroyed_device_maps_to_io_error() {
        let err = device_destroyed(DeviceDestroyedError);
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(err.get_ref().is_some_and(|inner| inner.is::<DeviceDestroyedError>()));
    }
}
