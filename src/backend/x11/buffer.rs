//! Importing images into the X server.
//!
//! Images are imported as X pixmaps which are then presented to the windows of outputs.
//!
//! ## Dmabuf pixmaps
//!
//! A [`Dmabuf`] backed pixmap is created using the [`DRI3`](x11rb::protocol::dri3) extension of
//! the X server. One of two code paths is used here. For more modern DRI3 (>= 1.2) implementations
//! multi-plane Dmabufs with explicit modifiers may be used to create a pixmap. Otherwise the
//! fallback code path (available in >= 1.0) is used to create the pixmap, although the Dmabuf may
//! only have one plane then.
//!
//! Pixmaps are created against the root window, so one pixmap can be presented to any output.
//!
//! If you do need to modify any of the logic pertaining to the Dmabuf presentation, do ensure you
//! read the `dri3proto.txt` file (link in the non-public comments of the x11 mod.rs).

use std::os::unix::io::{BorrowedFd, OwnedFd};

use tracing::{trace, warn};
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, Pixmap, Window};

use crate::backend::allocator::{
    format::{get_bpp, get_depth, FormatSet},
    AnyError, Buffer, Fourcc, Image, Modifier,
};
use crate::backend::AttachError;

/// Maximum number of planes `dri3_pixmap_from_buffers` accepts
const MAX_PLANES: usize = 4;

/// The DRI3 request used to turn a dmabuf into a pixmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ImportPath {
    /// `PixmapFromBuffers`, DRI3 1.2
    MultiPlane,
    /// `PixmapFromBuffer`, DRI3 1.0
    SinglePlane,
}

impl ImportPath {
    /// Pick the import path for a buffer with `planes` planes on a server speaking `dri3`
    pub(crate) fn select(dri3: (u32, u32), planes: usize) -> Result<ImportPath, AttachError> {
        if dri3 >= (1, 2) {
            if planes > MAX_PLANES {
                return Err(AttachError::TooManyPlanes {
                    planes,
                    max: MAX_PLANES,
                });
            }
            Ok(ImportPath::MultiPlane)
        } else {
            if planes != 1 {
                return Err(AttachError::TooManyPlanes { planes, max: 1 });
            }
            Ok(ImportPath::SinglePlane)
        }
    }
}

/// The pixmap of an imported image, stored in the image's backend slot
#[derive(Debug)]
pub(crate) struct X11Pixmap {
    pub pixmap: Pixmap,
}

/// Formats the X server can import
///
/// `modifiers` are the screen modifiers reported for XRGB8888, `None` if the server has no
/// modifier support. Without any modifier the server is assumed to take linear buffers.
pub(crate) fn supported_formats(modifiers: Option<&[u64]>) -> FormatSet {
    let mut formats = FormatSet::default();
    for &modifier in modifiers.unwrap_or_default() {
        formats.add(Fourcc::Xrgb8888, Modifier::from(modifier));
    }
    if formats.is_empty() {
        formats.add(Fourcc::Xrgb8888, Modifier::Linear);
    }
    formats
}

/// Create a pixmap for the image's dmabuf and store it in the image's backend slot
#[profiling::function]
pub(crate) fn import<C: Connection>(
    connection: &C,
    root: Window,
    dri3: (u32, u32),
    image: &mut Image,
) -> Result<(), AttachError> {
    let dmabuf = image.dmabuf();
    let format = dmabuf.format();
    let path = ImportPath::select(dri3, dmabuf.num_planes())?;

    let (Some(depth), Some(bpp)) = (get_depth(format.code), get_bpp(format.code)) else {
        return Err(AttachError::Unsupported(format));
    };
    if path == ImportPath::SinglePlane && dmabuf.has_modifier() {
        // DRI3 1.0 has no way to pass the modifier along
        return Err(AttachError::Unsupported(format));
    }
    let (width, height) =
        pixmap_dimensions(dmabuf.width(), dmabuf.height()).ok_or(AttachError::Unsupported(format))?;

    // The fds are closed once the request was sent, so hand over duplicates.
    let fds = dmabuf
        .handles()
        .map(|fd: BorrowedFd<'_>| fd.try_clone_to_owned())
        .collect::<Result<Vec<OwnedFd>, _>>()
        .map_err(AttachError::Fd)?;

    let pixmap = connection.generate_id().map_err(protocol)?;
    let cookie = match path {
        ImportPath::MultiPlane => {
            let strides = padded(dmabuf.strides());
            let offsets = padded(dmabuf.offsets());
            connection.dri3_pixmap_from_buffers(
                pixmap,
                root,
                width,
                height,
                strides[0],
                offsets[0],
                strides[1],
                offsets[1],
                strides[2],
                offsets[2],
                strides[3],
                offsets[3],
                depth as u8,
                bpp as u8,
                u64::from(format.modifier),
                fds,
            )
        }
        ImportPath::SinglePlane => {
            let stride = dmabuf.strides().next().unwrap_or_default();
            let (stride, size) =
                single_plane_layout(dmabuf.height(), stride).ok_or(AttachError::Unsupported(format))?;
            let fd = fds.into_iter().next().ok_or(AttachError::TooManyPlanes { planes: 0, max: 1 })?;
            connection.dri3_pixmap_from_buffer(
                pixmap,
                root,
                size,
                width,
                height,
                stride,
                depth as u8,
                bpp as u8,
                fd,
            )
        }
    }
    .map_err(protocol)?;
    cookie.check().map_err(protocol)?;

    trace!(image = %image.id(), pixmap, ?path, "Imported image into the X server");
    image.backend_data_mut().set(X11Pixmap { pixmap });
    Ok(())
}

/// Free the pixmap created by [`import`]
pub(crate) fn release<C: Connection>(connection: &C, image: &mut Image) {
    let Some(X11Pixmap { pixmap }) = image.backend_data_mut().take::<X11Pixmap>() else {
        return;
    };
    if let Err(err) = connection.free_pixmap(pixmap) {
        warn!(pixmap, "Failed to free pixmap: {}", err);
    }
}

/// Pixmap dimensions are 16 bit on the wire
fn pixmap_dimensions(width: u32, height: u32) -> Option<(u16, u16)> {
    Some((u16::try_from(width).ok()?, u16::try_from(height).ok()?))
}

/// Stride and total size of a single plane pixmap
fn single_plane_layout(height: u32, stride: u32) -> Option<(u16, u32)> {
    Some((u16::try_from(stride).ok()?, height.checked_mul(stride)?))
}

/// Planes beyond the buffer's own are passed as `NONE`
fn padded(values: impl Iterator<Item = u32>) -> Vec<u32> {
    let mut values = values.collect::<Vec<_>>();
    values.resize(MAX_PLANES, x11rb::NONE);
    values
}

fn protocol(err: impl std::error::Error + Send + Sync + 'static) -> AttachError {
    AttachError::Protocol(AnyError::new(err))
}
