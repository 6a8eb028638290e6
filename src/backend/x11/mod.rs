//! Implementation of the backend types using X11.
//!
//! This backend runs a compositor as an X11 client. Every output is a window on the X server.
//! Images are imported as DRI3 pixmaps and presented with the Present extension, whose
//! completion and idle notifications drive the [`FrameScheduler`](crate::output::FrameScheduler)
//! of each window.
//!
//! The backend is initialized using [`X11Backend::new`] or an [`X11BackendBuilder`]. The
//! [`X11Backend`] is inserted into a [`calloop::EventLoop`] and produces [`BackendEvent`]s, while
//! the cloneable [`X11Handle`] creates outputs, schedules frames and implements [`Backend`] for
//! allocators.
//!
//! ## Example usage
//!
//! ```rust,no_run
//! # use std::{cell::RefCell, rc::Rc, error::Error};
//! use ferrule::backend::{BackendEvent, allocator::{gbm::GbmAllocator, Fourcc, Swapchain, SwapchainFlags}};
//! use ferrule::backend::x11::X11Backend;
//! use ferrule::output::OutputEvent;
//!
//! fn init_x11_backend(handle: calloop::LoopHandle<'static, ()>) -> Result<(), Box<dyn Error>> {
//!     let backend = X11Backend::new()?;
//!     let x_handle = backend.handle();
//!     let output = x_handle.create_output()?;
//!
//!     let allocator = Rc::new(RefCell::new(GbmAllocator::with_gbm(x_handle.clone())?));
//!     let mut swapchain = Swapchain::new(allocator, 1280, 720, Fourcc::Xrgb8888, &[], SwapchainFlags::empty())?;
//!
//!     if let Some(image) = swapchain.acquire() {
//!         // render into the image, then
//!         x_handle.schedule_frame(output, image)?;
//!     }
//!
//!     handle.insert_source(backend, move |event, _, _| match event {
//!         BackendEvent::Output { event: OutputEvent::BufferReleased(image), .. } => swapchain.release(image),
//!         _ => {}
//!     })?;
//!
//!     Ok(())
//! }
//! ```

// DRI3: https://gitlab.freedesktop.org/xorg/proto/xorgproto/-/blob/master/dri3proto.txt
// Present: https://gitlab.freedesktop.org/xorg/proto/xorgproto/-/blob/master/presentproto.txt

mod buffer;
mod error;
#[macro_use]
mod extension;
mod output;

use std::{
    cell::RefCell,
    io,
    os::unix::io::OwnedFd,
    rc::Rc,
    sync::Arc,
};

use calloop::{
    ping::{make_ping, PingSource},
    EventSource, LoopSignal, Poll, PostAction, Readiness, Token, TokenFactory,
};
use rustix::io::{fcntl_getfd, fcntl_setfd, FdFlags};
use tracing::{debug, error, info, info_span, trace, warn, Span};
use x11rb::{
    atom_manager,
    connection::Connection,
    protocol::{
        dri3::ConnectionExt as _,
        present::CompleteKind,
        xproto::{ConnectionExt as _, CreateWindowAux, Window, WindowClass},
        ErrorKind, Event,
    },
    rust_connection::{ReplyError, RustConnection},
};

use self::{buffer::supported_formats, extension::Extensions, output::X11Output};
use crate::backend::{
    allocator::{format::FormatSet, Buffer, Image},
    AttachError, Backend, BackendEvent,
};
use crate::backend::outputs::Outputs;
use crate::output::{Mode, OutputId, OutputInfo, ScheduleFrameError};
use crate::utils::{
    x11rb::{X11Source, X11SourceEvent},
    DevPath, DeviceFd,
};

pub use self::error::*;

atom_manager! {
    pub(crate) Atoms: AtomCollectionCookie {
        WM_PROTOCOLS,
        WM_DELETE_WINDOW,
        _NET_WM_NAME,
        UTF8_STRING,
        _FERRULE_X11_BACKEND_CLOSE,
    }
}

/// Builder used to construct an [`X11Backend`].
#[derive(Debug)]
pub struct X11BackendBuilder {
    display: Option<String>,
    title: String,
    mode: Mode,
    loop_signal: Option<LoopSignal>,
}

impl Default for X11BackendBuilder {
    fn default() -> Self {
        X11BackendBuilder {
            display: None,
            title: "ferrule".into(),
            mode: Mode::DEFAULT,
            loop_signal: None,
        }
    }
}

impl X11BackendBuilder {
    /// Returns a new builder.
    pub fn new() -> X11BackendBuilder {
        X11BackendBuilder::default()
    }

    /// Sets the X display to connect to, `$DISPLAY` is used otherwise.
    pub fn display(self, display: impl Into<String>) -> Self {
        Self {
            display: Some(display.into()),
            ..self
        }
    }

    /// Sets the title prefix of the output windows.
    pub fn title(self, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..self
        }
    }

    /// Sets the size new output windows are created with.
    ///
    /// There is no guarantee the size specified here will be the actual size of the window when it is
    /// presented.
    pub fn size(self, width: u16, height: u16) -> Self {
        Self {
            mode: Mode {
                width: width as i32,
                height: height as i32,
                refresh: 0,
            },
            ..self
        }
    }

    /// Stops the given event loop once the connection to the X server is lost.
    pub fn loop_signal(self, signal: LoopSignal) -> Self {
        Self {
            loop_signal: Some(signal),
            ..self
        }
    }

    /// Connects to the X server and initializes the backend.
    pub fn build(self) -> Result<X11Backend, X11Error> {
        let span = info_span!("backend_x11");
        let _guard = span.enter();

        info!("Connecting to the X server");

        let (connection, screen_number) = RustConnection::connect(self.display.as_deref())?;
        let connection = Arc::new(connection);
        info!(screen = screen_number, "Connected to the X server");

        let extensions = Extensions::check_extensions(&*connection)?;
        let root = connection.setup().roots[screen_number].root;
        let atoms = Atoms::new(&*connection)?.reply()?;

        let render_fd = open_render_node(&connection, root)?;

        let formats = if extensions.has_modifiers() {
            let reply = connection.dri3_get_supported_modifiers(root, 24, 32)?.reply()?;
            if reply.screen_modifiers.is_empty() {
                warn!("X server advertised no modifiers, assuming linear buffers");
            }
            supported_formats(Some(&reply.screen_modifiers))
        } else {
            warn!(
                "DRI3 {}.{} has no modifier support, assuming linear buffers",
                extensions.dri3.0, extensions.dri3.1
            );
            supported_formats(None)
        };
        debug!(formats = ?formats.iter().collect::<Vec<_>>(), "X server formats");

        // Never mapped, only receives the message that stops the event thread of the X11Source.
        let close_window = connection.generate_id()?;
        connection.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            close_window,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new(),
        )?;
        connection.flush()?;

        let source = X11Source::new(connection.clone(), close_window, atoms._FERRULE_X11_BACKEND_CLOSE);
        let (ping, ping_source) = make_ping().map_err(X11Error::Wakeup)?;

        let inner = X11Inner {
            connection,
            screen_number,
            root,
            atoms,
            extensions,
            render_fd,
            formats,
            title: self.title,
            mode: self.mode,
            outputs: Outputs::new(ping),
            output_counter: 0,
        };

        drop(_guard);
        Ok(X11Backend {
            source,
            ping_source,
            handle: X11Handle {
                inner: Rc::new(RefCell::new(inner)),
            },
            span,
            loop_signal: self.loop_signal,
        })
    }
}

fn open_render_node(connection: &RustConnection, root: Window) -> Result<DeviceFd, X11Error> {
    // provider being NONE tells the X server to use the RandR provider.
    let dri3 = match connection.dri3_open(root, x11rb::NONE)?.reply() {
        Ok(reply) => reply,
        Err(err) => {
            return Err(if let ReplyError::X11Error(ref protocol_error) = err {
                match protocol_error.error_kind {
                    // No GPU behind the screen, or the node cannot be authenticated for us
                    ErrorKind::Implementation | ErrorKind::Match => X11Error::CannotDirectRender,
                    _ => err.into(),
                }
            } else {
                err.into()
            });
        }
    };

    // The X server always opens a new file descriptor, so we can take ownership of it.
    let fd: OwnedFd = dri3.device_fd;
    let flags = fcntl_getfd(&fd).map_err(|err| X11Error::RenderNode(err.into()))?;
    fcntl_setfd(&fd, flags | FdFlags::CLOEXEC).map_err(|err| X11Error::RenderNode(err.into()))?;

    let fd = DeviceFd::from(fd);
    info!(node = ?fd.dev_path(), "Opened render node through DRI3");
    Ok(fd)
}

/// Represents an active connection to the X server, to be inserted into a calloop event loop.
#[derive(Debug)]
pub struct X11Backend {
    source: X11Source,
    ping_source: PingSource,
    handle: X11Handle,
    span: Span,
    loop_signal: Option<LoopSignal>,
}

impl X11Backend {
    /// Initializes the X11 backend by connecting to the X server named by `$DISPLAY`.
    pub fn new() -> Result<X11Backend, X11Error> {
        X11BackendBuilder::default().build()
    }

    /// Returns a handle to the X11 backend.
    pub fn handle(&self) -> X11Handle {
        self.handle.clone()
    }
}

impl EventSource for X11Backend {
    type Event = BackendEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let _guard = self.span.enter();
        let inner = self.handle.inner.clone();

        let mut action = self.source.process_events(readiness, token, |event, _| {
            inner.borrow_mut().process_event(event);
        })?;
        self.ping_source
            .process_events(readiness, token, |_, _| {})
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        // Do not hold the borrow, the callback may use the handle.
        let events = inner.borrow_mut().outputs.take_events();
        let mut disconnected = false;
        for event in events {
            disconnected |= matches!(event, BackendEvent::Disconnected);
            callback(event, &mut ());
        }

        if disconnected {
            if let Some(signal) = &self.loop_signal {
                signal.stop();
            }
            action = PostAction::Remove;
        } else {
            // Flush the connection so requests sent during callbacks reach the server.
            if let Err(err) = inner.borrow().connection.flush() {
                warn!("Failed to flush the X11 connection: {}", err);
            }
        }

        Ok(action)
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, token_factory)?;
        self.ping_source.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.reregister(poll, token_factory)?;
        self.ping_source.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)?;
        self.ping_source.unregister(poll)
    }
}

/// A handle to the X11 backend.
///
/// This is the primary object used to interface with the backend.
#[derive(Debug, Clone)]
pub struct X11Handle {
    inner: Rc<RefCell<X11Inner>>,
}

impl X11Handle {
    /// Returns the underlying connection to the X server.
    pub fn connection(&self) -> Arc<RustConnection> {
        self.inner.borrow().connection.clone()
    }

    /// Returns the default screen number of the X server.
    pub fn screen(&self) -> usize {
        self.inner.borrow().screen_number
    }

    /// Whether the X server accepts buffers with explicit modifiers.
    pub fn has_modifiers(&self) -> bool {
        self.inner.borrow().extensions.has_modifiers()
    }

    /// Opens a new window acting as an output.
    ///
    /// [`BackendEvent::NewOutput`] is emitted for it on the next dispatch.
    pub fn create_output(&self) -> Result<OutputId, X11Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.outputs.is_disconnected() {
            return Err(X11Error::ConnectionLost);
        }

        inner.output_counter += 1;
        let name = format!("X11-{}", inner.output_counter);
        let title = format!("{} - {}", inner.title, name);

        let connection = inner.connection.clone();
        let screen = &connection.setup().roots[inner.screen_number];
        let output = X11Output::new(&connection, screen, &inner.atoms, name, &title, inner.mode)?;

        let id = OutputId::next();
        inner.outputs.insert(id, output);
        Ok(id)
    }

    /// Submits an image for display on an output.
    ///
    /// See [`FrameScheduler::schedule_frame`](crate::output::FrameScheduler::schedule_frame).
    pub fn schedule_frame(&self, output: OutputId, image: Image) -> Result<(), ScheduleFrameError> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let Some(out) = inner.outputs.get_mut(&output) else {
            return Err(ScheduleFrameError::UnknownOutput(image));
        };

        let result = out.schedule_frame(&inner.connection, image);
        inner.outputs.collect_events();
        result
    }

    /// Closes the window of an output, releasing all of its images.
    ///
    /// Returns `false` if the output does not exist.
    pub fn destroy_output(&self, output: OutputId) -> bool {
        self.inner.borrow_mut().destroy_output(output)
    }

    /// Returns the description of an output.
    pub fn output_info(&self, output: OutputId) -> Option<OutputInfo> {
        self.inner.borrow().outputs.get(&output).map(|out| out.info.clone())
    }

    /// Returns all live outputs in creation order.
    pub fn outputs(&self) -> Vec<OutputId> {
        self.inner.borrow().outputs.ids()
    }
}

impl Backend for X11Handle {
    fn render_fd(&self) -> DeviceFd {
        self.inner.borrow().render_fd.clone()
    }

    fn formats(&self) -> FormatSet {
        self.inner.borrow().formats.clone()
    }

    fn attach(&mut self, image: &mut Image) -> Result<(), AttachError> {
        let inner = self.inner.borrow();
        if inner.outputs.is_disconnected() {
            return Err(AttachError::Disconnected);
        }
        if inner.formats.get(image.format().code).is_none() {
            return Err(AttachError::Unsupported(image.format()));
        }
        buffer::import(&*inner.connection, inner.root, inner.extensions.dri3, image)
    }

    fn detach(&mut self, image: &mut Image) {
        let inner = self.inner.borrow();
        buffer::release(&*inner.connection, image);
        if let Err(err) = inner.connection.flush() {
            warn!("Failed to flush the X11 connection: {}", err);
        }
    }
}

#[derive(Debug)]
struct X11Inner {
    connection: Arc<RustConnection>,
    screen_number: usize,
    root: Window,
    atoms: Atoms,
    extensions: Extensions,
    render_fd: DeviceFd,
    formats: FormatSet,
    title: String,
    mode: Mode,
    outputs: Outputs<X11Output>,
    output_counter: usize,
}

impl X11Inner {
    fn process_event(&mut self, event: X11SourceEvent) {
        let event = match event {
            X11SourceEvent::Event(event) => event,
            X11SourceEvent::Closed => {
                error!("Connection to the X server was lost");
                let connection = self.connection.clone();
                self.outputs.disconnect(|_, output| output.destroy(&connection));
                return;
            }
        };

        let connection = self.connection.clone();
        match event {
            Event::PresentCompleteNotify(complete_notify) => {
                if complete_notify.kind != CompleteKind::PIXMAP {
                    return;
                }
                if let Some((_, output)) = self.outputs.find_mut(|out| out.window == complete_notify.window) {
                    output.present_complete(&connection, complete_notify.msc);
                }
            }

            Event::PresentIdleNotify(idle_notify) => {
                if let Some((_, output)) = self.outputs.find_mut(|out| out.window == idle_notify.window) {
                    output.pixmap_idle(idle_notify.pixmap);
                }
            }

            Event::ConfigureNotify(configure_notify) => {
                let Some(mode) =
                    Mode::from_configure(configure_notify.width as i32, configure_notify.height as i32)
                else {
                    return;
                };
                if let Some((_, output)) = self.outputs.find_mut(|out| out.window == configure_notify.window) {
                    if output.info.mode != mode {
                        output.info.mode = mode;
                        output.scheduler.mode_changed(mode);
                    }
                }
            }

            Event::ClientMessage(client_message) => {
                if client_message.format != 32
                    || client_message.data.as_data32()[0] != self.atoms.WM_DELETE_WINDOW
                {
                    return;
                }
                let closed = self
                    .outputs
                    .find_mut(|out| out.window == client_message.window)
                    .map(|(id, _)| id);
                if let Some(id) = closed {
                    debug!(output = %id, "Window was closed");
                    self.destroy_output(id);
                }
            }

            Event::Error(err) => {
                error!("X11 protocol error: {:?}", err);
            }

            event => trace!(?event, "Unhandled X11 event"),
        }

        self.outputs.collect_events();
    }

    fn destroy_output(&mut self, id: OutputId) -> bool {
        let connection = self.connection.clone();
        self.outputs.destroy(id, |_, output| output.destroy(&connection))
    }
}
