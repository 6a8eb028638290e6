//! `zwp_linux_dmabuf_v1` handling: format advertisement and `wl_buffer` import.

use std::os::unix::io::AsFd;

use tracing::{debug, error, trace};
use wayland_client::{
    protocol::wl_buffer::{self, WlBuffer},
    Connection, Dispatch, QueueHandle,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1::{self, ZwpLinuxBufferParamsV1},
    zwp_linux_dmabuf_v1::{self, ZwpLinuxDmabufV1},
};

use super::WaylandState;
use crate::backend::allocator::{
    dmabuf::{join_modifier, split_modifier, DmabufFlags},
    format::FormatSet,
    Buffer, Fourcc, Image, ImageId, Modifier,
};
use crate::backend::AttachError;

/// Record a format advertised by the remote compositor
///
/// Returns `false` for fourcc codes that are not known.
pub(crate) fn advertise(formats: &mut FormatSet, format: u32, modifier: Modifier) -> bool {
    match Fourcc::try_from(format) {
        Ok(code) => {
            formats.add(code, modifier);
            true
        }
        Err(_) => false,
    }
}

/// Create a `wl_buffer` for the image's dmabuf and store it in the image's backend slot
#[profiling::function]
pub(crate) fn import(
    global: &ZwpLinuxDmabufV1,
    qh: &QueueHandle<WaylandState>,
    image: &mut Image,
) -> Result<(), AttachError> {
    let dmabuf = image.dmabuf();
    let (modifier_hi, modifier_lo) = split_modifier(dmabuf.modifier());

    let params = global.create_params(qh, ());
    for plane in dmabuf.planes() {
        params.add(
            plane.as_fd(),
            plane.plane_idx,
            plane.offset,
            plane.stride,
            modifier_hi,
            modifier_lo,
        );
    }

    let mut flags = zwp_linux_buffer_params_v1::Flags::empty();
    if dmabuf.flags().contains(DmabufFlags::Y_INVERT) {
        flags |= zwp_linux_buffer_params_v1::Flags::YInvert;
    }
    if dmabuf.flags().contains(DmabufFlags::INTERLACED) {
        flags |= zwp_linux_buffer_params_v1::Flags::Interlaced;
    }
    if dmabuf.flags().contains(DmabufFlags::BOTTOM_FIRST) {
        flags |= zwp_linux_buffer_params_v1::Flags::BottomFirst;
    }

    let buffer = params.create_immed(
        dmabuf.width() as i32,
        dmabuf.height() as i32,
        dmabuf.fourcc() as u32,
        flags,
        qh,
        image.id(),
    );
    params.destroy();

    trace!(image = %image.id(), buffer = ?buffer, "Created dmabuf wl_buffer");
    image.backend_data_mut().set(buffer);
    Ok(())
}

/// Destroy the `wl_buffer` created by [`import`]
pub(crate) fn release(image: &mut Image) {
    if let Some(buffer) = image.backend_data_mut().take::<WlBuffer>() {
        buffer.destroy();
    }
}

impl Dispatch<ZwpLinuxDmabufV1, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _: &ZwpLinuxDmabufV1,
        event: zwp_linux_dmabuf_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let (format, modifier) = match event {
            zwp_linux_dmabuf_v1::Event::Format { format } => (format, Modifier::Invalid),
            zwp_linux_dmabuf_v1::Event::Modifier {
                format,
                modifier_hi,
                modifier_lo,
            } => (format, join_modifier(modifier_hi, modifier_lo)),
            _ => return,
        };

        if advertise(&mut state.formats, format, modifier) {
            debug!(format = format!("{:#x}", format), ?modifier, "Remote format");
        } else {
            debug!(format = format!("{:#x}", format), "Ignoring unknown remote format");
        }
    }
}

impl Dispatch<ZwpLinuxBufferParamsV1, ()> for WaylandState {
    fn event(
        _: &mut Self,
        _: &ZwpLinuxBufferParamsV1,
        event: zwp_linux_buffer_params_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let zwp_linux_buffer_params_v1::Event::Failed = event {
            error!("Remote compositor failed to import a dmabuf");
        }
    }
}

impl Dispatch<WlBuffer, ImageId> for WaylandState {
    fn event(
        state: &mut Self,
        _: &WlBuffer,
        event: wl_buffer::Event,
        image: &ImageId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            state.outputs.buffer_released(*image);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_formats_and_modifiers_accumulate() {
        let mut formats = FormatSet::default();
        let xrgb = Fourcc::Xrgb8888 as u32;
        let (hi, lo) = split_modifier(Modifier::I915_y_tiled);

        assert!(advertise(&mut formats, xrgb, Modifier::Invalid));
        assert!(advertise(&mut formats, xrgb, join_modifier(hi, lo)));
        assert!(advertise(&mut formats, Fourcc::Argb8888 as u32, Modifier::Linear));

        assert_eq!(formats.len(), 2);
        let entry = formats.get(Fourcc::Xrgb8888).unwrap();
        assert!(entry.supports_implicit());
        assert!(entry.contains(Modifier::I915_y_tiled));
    }

    #[test]
    fn unknown_fourcc_is_skipped() {
        let mut formats = FormatSet::default();
        assert!(!advertise(&mut formats, 0xdead_beef, Modifier::Linear));
        assert!(formats.is_empty());
    }
}
