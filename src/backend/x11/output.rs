use std::collections::HashMap;

use tracing::{debug, trace, warn};
use x11rb::{
    connection::Connection,
    protocol::{
        present::{self, ConnectionExt as _},
        xproto::{
            AtomEnum, ConnectionExt as _, CreateWindowAux, EventMask, Pixmap, PropMode, Screen, Window,
            WindowClass,
        },
    },
    rust_connection::{ReplyOrIdError, RustConnection},
    wrapper::ConnectionExt as _,
};

use super::{buffer::X11Pixmap, Atoms};
use crate::backend::allocator::{AnyError, Image, ImageId};
use crate::backend::outputs::BackendOutput;
use crate::output::{FrameScheduler, Mode, OutputInfo, PresentSurface, ScheduleFrameError};

/// A window on the X server acting as an output
#[derive(Debug)]
pub(crate) struct X11Output {
    pub window: Window,
    present_event: u32,
    pub info: OutputInfo,
    pub scheduler: FrameScheduler,
    serial: u32,
    last_msc: u64,
    /// Pixmaps handed to the X server, not idle yet
    in_flight: HashMap<Pixmap, ImageId>,
}

impl X11Output {
    pub fn new(
        connection: &RustConnection,
        screen: &Screen,
        atoms: &Atoms,
        name: String,
        title: &str,
        mode: Mode,
    ) -> Result<X11Output, ReplyOrIdError> {
        let window = connection.generate_id()?;
        let window_aux =
            CreateWindowAux::new().event_mask(EventMask::EXPOSURE | EventMask::STRUCTURE_NOTIFY);

        connection.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            screen.root,
            0,
            0,
            mode.width as u16,
            mode.height as u16,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &window_aux,
        )?;

        // Ask the window manager to send us WM_DELETE_WINDOW instead of killing the connection
        connection.change_property32(
            PropMode::REPLACE,
            window,
            atoms.WM_PROTOCOLS,
            AtomEnum::ATOM,
            &[atoms.WM_DELETE_WINDOW],
        )?;
        connection.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            title.as_bytes(),
        )?;
        connection.change_property8(
            PropMode::REPLACE,
            window,
            atoms._NET_WM_NAME,
            atoms.UTF8_STRING,
            title.as_bytes(),
        )?;

        let present_event = connection.generate_id()?;
        connection.present_select_input(
            present_event,
            window,
            present::EventMask::COMPLETE_NOTIFY | present::EventMask::IDLE_NOTIFY,
        )?;

        connection.map_window(window)?;
        connection.flush()?;

        debug!(output = %name, window, "Created X11 window");

        Ok(X11Output {
            window,
            present_event,
            info: OutputInfo {
                name,
                make: "X11".into(),
                model: "X11 window".into(),
                mode,
            },
            scheduler: FrameScheduler::new(),
            serial: 0,
            last_msc: 0,
            in_flight: HashMap::new(),
        })
    }

    pub fn schedule_frame(
        &mut self,
        connection: &RustConnection,
        image: Image,
    ) -> Result<(), ScheduleFrameError> {
        let (scheduler, mut surface) = self.split(connection);
        scheduler.schedule_frame(&mut surface, image)
    }

    /// The X server finished presenting a pixmap
    pub fn present_complete(&mut self, connection: &RustConnection, msc: u64) {
        self.last_msc = msc;
        let (scheduler, mut surface) = self.split(connection);
        scheduler.frame_done(&mut surface);
    }

    /// The X server no longer reads from a pixmap
    pub fn pixmap_idle(&mut self, pixmap: Pixmap) -> bool {
        release_idle_pixmap(&mut self.in_flight, &mut self.scheduler, pixmap)
    }

    pub fn destroy(mut self, connection: &RustConnection) -> FrameScheduler {
        let (scheduler, mut surface) = self.split(connection);
        scheduler.destroy(&mut surface);

        if let Err(err) =
            connection.present_select_input(self.present_event, self.window, present::EventMask::NO_EVENT)
        {
            warn!(window = self.window, "Failed to deselect present events: {}", err);
        }
        if let Err(err) = connection.destroy_window(self.window) {
            warn!(window = self.window, "Failed to destroy window: {}", err);
        }
        if let Err(err) = connection.flush() {
            warn!(window = self.window, "Failed to flush the X11 connection: {}", err);
        }
        debug!(output = %self.info.name, "Destroyed X11 window");
        self.scheduler
    }

    fn split<'a>(&'a mut self, connection: &'a RustConnection) -> (&'a mut FrameScheduler, X11PresentSurface<'a>) {
        (
            &mut self.scheduler,
            X11PresentSurface {
                connection,
                window: self.window,
                serial: &mut self.serial,
                last_msc: self.last_msc,
                in_flight: &mut self.in_flight,
            },
        )
    }
}

impl BackendOutput for X11Output {
    fn scheduler(&mut self) -> &mut FrameScheduler {
        &mut self.scheduler
    }
}

/// Hands the image behind an idle pixmap back to the scheduler
///
/// Each pixmap is released once per presentation, repeated or unknown notifications are dropped.
fn release_idle_pixmap(
    in_flight: &mut HashMap<Pixmap, ImageId>,
    scheduler: &mut FrameScheduler,
    pixmap: Pixmap,
) -> bool {
    let Some(image) = in_flight.remove(&pixmap) else {
        trace!(pixmap, "Idle notification for unknown pixmap");
        return false;
    };
    scheduler.buffer_released(image)
}

/// Presents pixmaps to a window through the Present extension
struct X11PresentSurface<'a> {
    connection: &'a RustConnection,
    window: Window,
    serial: &'a mut u32,
    last_msc: u64,
    in_flight: &'a mut HashMap<Pixmap, ImageId>,
}

impl PresentSurface for X11PresentSurface<'_> {
    fn present(&mut self, image: &Image) -> Result<(), AnyError> {
        let Some(&X11Pixmap { pixmap }) = image.backend_data().get::<X11Pixmap>() else {
            return Err(AnyError::new("image was not imported into the X server"));
        };

        *self.serial = self.serial.wrapping_add(1);
        // Present as soon as possible, the X server will pick the next convenient vblank.
        let msc = self.last_msc + 1;

        self.connection
            .present_pixmap(
                self.window,
                pixmap,
                *self.serial,
                x11rb::NONE, // Update the entire window
                x11rb::NONE, // Update the entire window
                0,           // No offsets
                0,
                x11rb::NONE, // Let the X server pick the most suitable crtc
                x11rb::NONE, // Do not wait to present
                x11rb::NONE, // Idle notifications tell us when the X server is done with the pixmap.
                present::Option::NONE.into(),
                msc,
                0,
                0,
                &[], // We don't need to notify any other windows.
            )
            .map_err(AnyError::new)?;
        self.connection.flush().map_err(AnyError::new)?;

        self.in_flight.insert(pixmap, image.id());
        trace!(window = self.window, pixmap, serial = *self.serial, "Presented pixmap");
        Ok(())
    }

    fn cancel_frame(&mut self) {
        // A presentation cannot be revoked. The window is going away, so the completion is never
        // routed back to the scheduler.
        trace!(window = self.window, "Dropping frame in flight");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputEvent;
    use crate::test_utils::{fake_image, released, Counters, FakeSurface};

    #[test]
    fn idle_pixmaps_release_their_image_once() {
        let counters = Counters::default();
        let mut scheduler = FrameScheduler::new();
        let mut surface = FakeSurface::default();
        let image = fake_image(&counters, 8, 8);
        let id = image.id();
        scheduler.schedule_frame(&mut surface, image).unwrap();
        scheduler.take_events();

        let mut in_flight = HashMap::from([(7, id)]);
        assert!(release_idle_pixmap(&mut in_flight, &mut scheduler, 7));
        assert_eq!(released(&scheduler.take_events()), vec![id]);

        assert!(!release_idle_pixmap(&mut in_flight, &mut scheduler, 7));
        assert!(scheduler.take_events().is_empty());
    }

    #[test]
    fn unknown_pixmaps_are_ignored() {
        let mut scheduler = FrameScheduler::new();
        let mut in_flight = HashMap::new();
        assert!(!release_idle_pixmap(&mut in_flight, &mut scheduler, 42));
        assert!(!scheduler
            .take_events()
            .iter()
            .any(|event| matches!(event, OutputEvent::BufferReleased(_))));
    }
}
