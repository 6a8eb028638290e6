use tracing::{debug, trace};
use wayland_client::{
    protocol::{
        wl_buffer::WlBuffer,
        wl_callback::{self, WlCallback},
        wl_compositor::WlCompositor,
        wl_surface::WlSurface,
    },
    Connection, Dispatch, Proxy, QueueHandle,
};
use wayland_protocols::xdg::shell::client::{
    xdg_surface::{self, XdgSurface},
    xdg_toplevel::{self, XdgToplevel},
    xdg_wm_base::{self, XdgWmBase},
};

use super::WaylandState;
use crate::backend::allocator::{AnyError, Image};
use crate::backend::outputs::BackendOutput;
use crate::output::{FrameScheduler, Mode, OutputId, OutputInfo, PresentSurface, ScheduleFrameError};

/// A toplevel surface on the remote compositor acting as an output
#[derive(Debug)]
pub(crate) struct WaylandOutput {
    surface: WlSurface,
    xdg_surface: XdgSurface,
    toplevel: XdgToplevel,
    frame_callback: Option<WlCallback>,
    pub info: OutputInfo,
    pub scheduler: FrameScheduler,
}

impl WaylandOutput {
    pub fn new(
        compositor: &WlCompositor,
        wm_base: &XdgWmBase,
        qh: &QueueHandle<WaylandState>,
        id: OutputId,
        name: String,
        app_id: &str,
        mode: Mode,
    ) -> WaylandOutput {
        let surface = compositor.create_surface(qh, ());
        let xdg_surface = wm_base.get_xdg_surface(&surface, qh, id);
        let toplevel = xdg_surface.get_toplevel(qh, id);

        toplevel.set_title(format!("{} - {}", app_id, name));
        toplevel.set_app_id(app_id.to_owned());
        // The initial commit without a buffer asks the compositor for a configure
        surface.commit();

        debug!(output = %name, surface = ?surface.id(), "Created toplevel surface");

        WaylandOutput {
            surface,
            xdg_surface,
            toplevel,
            frame_callback: None,
            info: OutputInfo {
                name,
                make: "wayland".into(),
                model: "wayland".into(),
                mode,
            },
            scheduler: FrameScheduler::new(),
        }
    }

    pub fn schedule_frame(
        &mut self,
        qh: &QueueHandle<WaylandState>,
        id: OutputId,
        image: Image,
    ) -> Result<(), ScheduleFrameError> {
        let (scheduler, mut surface) = self.split(qh, id);
        scheduler.schedule_frame(&mut surface, image)
    }

    /// The frame callback of the last commit fired
    pub fn frame_done(&mut self, qh: &QueueHandle<WaylandState>, id: OutputId) {
        self.frame_callback = None;
        let (scheduler, mut surface) = self.split(qh, id);
        scheduler.frame_done(&mut surface);
    }

    pub fn destroy(mut self, qh: &QueueHandle<WaylandState>, id: OutputId) -> FrameScheduler {
        let (scheduler, mut surface) = self.split(qh, id);
        scheduler.destroy(&mut surface);

        self.toplevel.destroy();
        self.xdg_surface.destroy();
        self.surface.destroy();
        debug!(output = %self.info.name, "Destroyed toplevel surface");
        self.scheduler
    }

    fn split<'a>(
        &'a mut self,
        qh: &'a QueueHandle<WaylandState>,
        id: OutputId,
    ) -> (&'a mut FrameScheduler, WaylandPresentSurface<'a>) {
        (
            &mut self.scheduler,
            WaylandPresentSurface {
                surface: &self.surface,
                qh,
                id,
                frame_callback: &mut self.frame_callback,
            },
        )
    }
}

/// Attaches `wl_buffer`s to the output's surface
struct WaylandPresentSurface<'a> {
    surface: &'a WlSurface,
    qh: &'a QueueHandle<WaylandState>,
    id: OutputId,
    frame_callback: &'a mut Option<WlCallback>,
}

impl PresentSurface for WaylandPresentSurface<'_> {
    fn present(&mut self, image: &Image) -> Result<(), AnyError> {
        let Some(buffer) = image.backend_data().get::<WlBuffer>() else {
            return Err(AnyError::new("image has no wl_buffer"));
        };
        if !self.surface.is_alive() {
            return Err(AnyError::new("surface is gone"));
        }

        self.surface.attach(Some(buffer), 0, 0);
        if self.surface.version() >= 4 {
            self.surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        }
        *self.frame_callback = Some(self.surface.frame(self.qh, self.id));
        self.surface.commit();

        trace!(output = %self.id, image = %image.id(), "Committed");
        Ok(())
    }

    fn cancel_frame(&mut self) {
        // wl_callback cannot be destroyed, a late `done` finds no output and is dropped.
        self.frame_callback.take();
    }
}

impl BackendOutput for WaylandOutput {
    fn scheduler(&mut self) -> &mut FrameScheduler {
        &mut self.scheduler
    }
}

impl Dispatch<WlCallback, OutputId> for WaylandState {
    fn event(
        state: &mut Self,
        _: &WlCallback,
        event: wl_callback::Event,
        id: &OutputId,
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            let Some(output) = state.outputs.get_mut(id) else {
                trace!(output = %id, "Frame callback for a destroyed output");
                return;
            };
            output.frame_done(qh, *id);
            state.outputs.collect_events();
        }
    }
}

impl Dispatch<XdgWmBase, ()> for WaylandState {
    fn event(
        _: &mut Self,
        wm_base: &XdgWmBase,
        event: xdg_wm_base::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<XdgSurface, OutputId> for WaylandState {
    fn event(
        _: &mut Self,
        xdg_surface: &XdgSurface,
        event: xdg_surface::Event,
        _: &OutputId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            xdg_surface.ack_configure(serial);
        }
    }
}

impl Dispatch<XdgToplevel, OutputId> for WaylandState {
    fn event(
        state: &mut Self,
        _: &XdgToplevel,
        event: xdg_toplevel::Event,
        id: &OutputId,
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                let Some(mode) = Mode::from_configure(width, height) else {
                    return;
                };
                let Some(output) = state.outputs.get_mut(id) else {
                    return;
                };
                if output.info.mode != mode {
                    output.info.mode = mode;
                    output.scheduler.mode_changed(mode);
                    state.outputs.collect_events();
                }
            }
            xdg_toplevel::Event::Close => {
                debug!(output = %id, "Toplevel was closed");
                state.outputs.destroy(*id, |id, output| output.destroy(qh, id));
            }
            _ => {}
        }
    }
}
