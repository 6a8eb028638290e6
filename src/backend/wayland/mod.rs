//! Implementation of the backend types using Wayland.
//!
//! This backend runs a compositor as a client of another Wayland compositor. Every output is an
//! `xdg_toplevel` surface on the remote compositor. Images are imported as `wl_buffer`s through
//! `zwp_linux_dmabuf_v1` when they are allocated; frame callbacks and `wl_buffer.release` drive the
//! [`FrameScheduler`](crate::output::FrameScheduler) of each surface.
//!
//! The remote compositor must provide `wl_compositor`, `zwp_linux_dmabuf_v1` (version 3 for
//! modifier advertisement) and `xdg_wm_base`. The set of importable formats is collected during
//! [`WaylandBackendBuilder::build`] and does not change afterwards.
//!
//! Like the [X11 backend](crate::backend::x11), the [`WaylandBackend`] is a calloop event source
//! producing [`BackendEvent`]s and the cloneable [`WaylandHandle`] implements [`Backend`].

mod dmabuf;
mod output;

use std::{
    cell::RefCell,
    env,
    ffi::OsString,
    io,
    os::unix::{io::OwnedFd, net::UnixStream},
    path::{Path, PathBuf},
    rc::Rc,
};

use calloop::{
    generic::Generic,
    ping::{make_ping, PingSource},
    EventSource, Interest, LoopSignal, Mode as TriggerMode, Poll, PostAction, Readiness, Token,
    TokenFactory,
};
use rustix::fs::{Mode as FileMode, OFlags};
use tracing::{debug, error, info, info_span, warn, Span};
use wayland_client::{
    backend::WaylandError as ConnectionError,
    delegate_noop,
    protocol::{
        wl_compositor::WlCompositor,
        wl_registry::{self, WlRegistry},
        wl_surface::WlSurface,
    },
    ConnectError, Connection, Dispatch, DispatchError, EventQueue, QueueHandle,
};
use wayland_protocols::{
    wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
    xdg::shell::client::xdg_wm_base::XdgWmBase,
};

use self::output::WaylandOutput;
use crate::backend::{
    allocator::{format::FormatSet, Buffer, Image},
    AttachError, Backend, BackendEvent,
};
use crate::backend::outputs::Outputs;
use crate::output::{Mode, OutputId, OutputInfo, ScheduleFrameError};
use crate::utils::{DevPath, DeviceFd};

/// Render node opened when none is configured
pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

/// Errors of the Wayland backend
#[derive(Debug, thiserror::Error)]
pub enum WaylandError {
    /// Failed to connect to a Wayland compositor.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The socket of the named display could not be opened.
    #[error("Failed to open the socket {path:?}")]
    Socket {
        /// Socket path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A relative display name was given but `XDG_RUNTIME_DIR` is not set.
    #[error("XDG_RUNTIME_DIR is not set")]
    NoRuntimeDir,

    /// Error while dispatching events.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Error when using the wayland connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The remote compositor lacks a required global.
    #[error("The remote compositor does not support {0}")]
    MissingGlobal(&'static str),

    /// The render node could not be opened.
    #[error("Failed to open render node {path:?}")]
    RenderNode {
        /// Path of the render node
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The wakeup source of the backend could not be created.
    #[error("Failed to create the wakeup source")]
    Wakeup(#[source] io::Error),

    /// The connection to the remote compositor is gone.
    #[error("The connection to the remote compositor is gone")]
    Disconnected,
}

/// Builder used to construct a [`WaylandBackend`].
#[derive(Debug)]
pub struct WaylandBackendBuilder {
    display: Option<String>,
    render_node: PathBuf,
    app_id: String,
    mode: Mode,
    loop_signal: Option<LoopSignal>,
}

impl Default for WaylandBackendBuilder {
    fn default() -> Self {
        WaylandBackendBuilder {
            display: None,
            render_node: PathBuf::from(DEFAULT_RENDER_NODE),
            app_id: "ferrule".into(),
            mode: Mode::DEFAULT,
            loop_signal: None,
        }
    }
}

impl WaylandBackendBuilder {
    /// Returns a new builder.
    pub fn new() -> WaylandBackendBuilder {
        WaylandBackendBuilder::default()
    }

    /// Sets the remote display to connect to, `$WAYLAND_DISPLAY` is used otherwise.
    ///
    /// Relative names are resolved against `$XDG_RUNTIME_DIR`.
    pub fn display(self, display: impl Into<String>) -> Self {
        Self {
            display: Some(display.into()),
            ..self
        }
    }

    /// Sets the render node handed to allocators.
    pub fn render_node(self, path: impl Into<PathBuf>) -> Self {
        Self {
            render_node: path.into(),
            ..self
        }
    }

    /// Sets the app id and title prefix of the toplevel surfaces.
    pub fn app_id(self, app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..self
        }
    }

    /// Sets the mode outputs report until the remote compositor configures them.
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

    /// Stops the given event loop once the connection to the remote compositor is lost.
    pub fn loop_signal(self, signal: LoopSignal) -> Self {
        Self {
            loop_signal: Some(signal),
            ..self
        }
    }

    /// Connects to the remote compositor and initializes the backend.
    pub fn build(self) -> Result<WaylandBackend, WaylandError> {
        let span = info_span!("backend_wayland");
        let _guard = span.enter();

        info!("Creating wayland backend");

        let render_fd = rustix::fs::open(
            &self.render_node,
            OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC,
            FileMode::empty(),
        )
        .map_err(|err| WaylandError::RenderNode {
            path: self.render_node.clone(),
            source: err.into(),
        })?;
        let render_fd = DeviceFd::from(render_fd);
        info!(node = ?render_fd.dev_path(), "Opened render node");

        let connection = connect(self.display.as_deref())?;
        info!("Connected to the remote compositor");

        let (ping, ping_source) = make_ping().map_err(WaylandError::Wakeup)?;

        let mut queue = connection.new_event_queue();
        let qh = queue.handle();
        let _registry = connection.display().get_registry(&qh, ());

        let mut state = WaylandState {
            compositor: None,
            dmabuf: None,
            wm_base: None,
            formats: FormatSet::default(),
            outputs: Outputs::new(ping),
        };

        // Collect the globals, then the formats advertised by the dmabuf global
        queue.roundtrip(&mut state)?;
        queue.roundtrip(&mut state)?;

        if state.compositor.is_none() {
            error!("Remote compositor does not support wl_compositor");
            return Err(WaylandError::MissingGlobal("wl_compositor"));
        }
        if state.dmabuf.is_none() {
            error!("Remote compositor does not support zwp_linux_dmabuf_v1");
            return Err(WaylandError::MissingGlobal("zwp_linux_dmabuf_v1"));
        }
        if state.wm_base.is_none() {
            error!("Remote compositor does not support xdg_wm_base");
            return Err(WaylandError::MissingGlobal("xdg_wm_base"));
        }
        if state.formats.is_empty() {
            warn!("Remote compositor advertised no dmabuf formats");
        }

        // The fd is owned by the connection, hand a duplicate to calloop.
        let fd = connection
            .backend()
            .poll_fd()
            .try_clone_to_owned()
            .map_err(WaylandError::Wakeup)?;
        let source = Generic::new(fd, Interest::READ, TriggerMode::Level);

        drop(_guard);
        Ok(WaylandBackend {
            source,
            ping_source,
            handle: WaylandHandle {
                inner: Rc::new(RefCell::new(WaylandInner {
                    connection,
                    queue,
                    qh,
                    state,
                    render_fd,
                    app_id: self.app_id,
                    mode: self.mode,
                    output_counter: 0,
                })),
            },
            span,
            loop_signal: self.loop_signal,
        })
    }
}

fn connect(display: Option<&str>) -> Result<Connection, WaylandError> {
    let Some(name) = display else {
        return Ok(Connection::connect_to_env()?);
    };
    let path = socket_path(name, env::var_os("XDG_RUNTIME_DIR")).ok_or(WaylandError::NoRuntimeDir)?;
    let stream = UnixStream::connect(&path).map_err(|source| WaylandError::Socket { path, source })?;
    Ok(Connection::from_socket(stream)?)
}

/// Resolves a display name the way libwayland does
fn socket_path(name: &str, runtime_dir: Option<OsString>) -> Option<PathBuf> {
    if Path::new(name).is_absolute() {
        return Some(PathBuf::from(name));
    }
    runtime_dir.map(|dir| PathBuf::from(dir).join(name))
}

/// A connection to a remote Wayland compositor, to be inserted into a calloop event loop.
#[derive(Debug)]
pub struct WaylandBackend {
    source: Generic<OwnedFd>,
    ping_source: PingSource,
    handle: WaylandHandle,
    span: Span,
    loop_signal: Option<LoopSignal>,
}

impl WaylandBackend {
    /// Connects to the compositor named by `$WAYLAND_DISPLAY`.
    pub fn new() -> Result<WaylandBackend, WaylandError> {
        WaylandBackendBuilder::default().build()
    }

    /// Returns a handle to the backend.
    pub fn handle(&self) -> WaylandHandle {
        self.handle.clone()
    }
}

impl EventSource for WaylandBackend {
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

        self.source.process_events(readiness, token, |readiness, _| {
            let mut inner = inner.borrow_mut();
            if readiness.error {
                error!("Error on the connection to the remote compositor");
                inner.disconnect();
            } else if let Err(err) = inner.dispatch() {
                error!("Failed to dispatch remote events: {}", err);
                inner.disconnect();
            }
            Ok(PostAction::Continue)
        })?;
        self.ping_source
            .process_events(readiness, token, |_, _| {})
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        // Do not hold the borrow, the callback may use the handle.
        let events = inner.borrow_mut().state.outputs.take_events();
        let mut disconnected = false;
        for event in events {
            disconnected |= matches!(event, BackendEvent::Disconnected);
            callback(event, &mut ());
        }

        if disconnected {
            if let Some(signal) = &self.loop_signal {
                signal.stop();
            }
            return Ok(PostAction::Remove);
        }

        // Flush requests sent during callbacks.
        if let Err(err) = inner.borrow().connection.flush() {
            warn!("Failed to flush the remote connection: {}", err);
        }
        Ok(PostAction::Continue)
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

/// A handle to the Wayland backend.
#[derive(Debug, Clone)]
pub struct WaylandHandle {
    inner: Rc<RefCell<WaylandInner>>,
}

impl WaylandHandle {
    /// Returns a handle to the connection.
    pub fn connection(&self) -> Connection {
        self.inner.borrow().connection.clone()
    }

    /// Creates a new toplevel surface acting as an output.
    ///
    /// Performs a roundtrip so the surface is configured before the first frame is attached.
    /// [`BackendEvent::NewOutput`] is emitted for it on the next dispatch.
    pub fn create_output(&self) -> Result<OutputId, WaylandError> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        if inner.state.outputs.is_disconnected() {
            return Err(WaylandError::Disconnected);
        }
        let (Some(compositor), Some(wm_base)) = (&inner.state.compositor, &inner.state.wm_base) else {
            return Err(WaylandError::MissingGlobal("xdg_wm_base"));
        };

        inner.output_counter += 1;
        let id = OutputId::next();
        let output = WaylandOutput::new(
            compositor,
            wm_base,
            &inner.qh,
            id,
            format!("WL-{}", inner.output_counter),
            &inner.app_id,
            inner.mode,
        );
        inner.state.outputs.insert(id, output);

        inner.queue.roundtrip(&mut inner.state)?;
        Ok(id)
    }

    /// Submits an image for display on an output.
    ///
    /// See [`FrameScheduler::schedule_frame`](crate::output::FrameScheduler::schedule_frame).
    pub fn schedule_frame(&self, output: OutputId, image: Image) -> Result<(), ScheduleFrameError> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let Some(out) = inner.state.outputs.get_mut(&output) else {
            return Err(ScheduleFrameError::UnknownOutput(image));
        };

        let result = out.schedule_frame(&inner.qh, output, image);
        inner.state.outputs.collect_events();
        if let Err(err) = inner.connection.flush() {
            warn!("Failed to flush the remote connection: {}", err);
        }
        result
    }

    /// Destroys the surface of an output, releasing all of its images.
    ///
    /// Returns `false` if the output does not exist.
    pub fn destroy_output(&self, output: OutputId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let qh = &inner.qh;
        inner.state.outputs.destroy(output, |id, out| out.destroy(qh, id))
    }

    /// Returns the description of an output.
    pub fn output_info(&self, output: OutputId) -> Option<OutputInfo> {
        self.inner
            .borrow()
            .state
            .outputs
            .get(&output)
            .map(|out| out.info.clone())
    }

    /// Returns all live outputs in creation order.
    pub fn outputs(&self) -> Vec<OutputId> {
        self.inner.borrow().state.outputs.ids()
    }
}

impl Backend for WaylandHandle {
    fn render_fd(&self) -> DeviceFd {
        self.inner.borrow().render_fd.clone()
    }

    fn formats(&self) -> FormatSet {
        self.inner.borrow().state.formats.clone()
    }

    fn attach(&mut self, image: &mut Image) -> Result<(), AttachError> {
        let inner = self.inner.borrow();
        if inner.state.outputs.is_disconnected() {
            return Err(AttachError::Disconnected);
        }
        if inner.state.formats.get(image.format().code).is_none() {
            return Err(AttachError::Unsupported(image.format()));
        }
        let Some(global) = &inner.state.dmabuf else {
            return Err(AttachError::Disconnected);
        };
        dmabuf::import(global, &inner.qh, image)
    }

    fn detach(&mut self, image: &mut Image) {
        dmabuf::release(image);
        if let Err(err) = self.inner.borrow().connection.flush() {
            warn!("Failed to flush the remote connection: {}", err);
        }
    }
}

#[derive(Debug)]
struct WaylandInner {
    connection: Connection,
    queue: EventQueue<WaylandState>,
    qh: QueueHandle<WaylandState>,
    state: WaylandState,
    render_fd: DeviceFd,
    app_id: String,
    mode: Mode,
    output_counter: usize,
}

impl WaylandInner {
    /// Reads and dispatches whatever the remote compositor sent
    fn dispatch(&mut self) -> Result<(), WaylandError> {
        self.flush()?;
        if let Some(guard) = self.queue.prepare_read() {
            match guard.read() {
                Ok(_) => {}
                Err(ConnectionError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.queue.dispatch_pending(&mut self.state)?;
        self.flush()
    }

    fn flush(&self) -> Result<(), WaylandError> {
        match self.connection.flush() {
            Err(ConnectionError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            result => result.map_err(Into::into),
        }
    }

    fn disconnect(&mut self) {
        let qh = &self.qh;
        self.state.outputs.disconnect(|id, output| output.destroy(qh, id));
    }
}

/// State the remote event queue dispatches into
#[derive(Debug)]
pub(crate) struct WaylandState {
    compositor: Option<WlCompositor>,
    dmabuf: Option<ZwpLinuxDmabufV1>,
    wm_base: Option<XdgWmBase>,
    formats: FormatSet,
    outputs: Outputs<WaylandOutput>,
}

impl Dispatch<WlRegistry, ()> for WaylandState {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                debug!(interface = %interface, version, "Remote wayland global");
                match interface.as_str() {
                    "wl_compositor" => {
                        state.compositor = Some(registry.bind(name, version.min(4), qh, ()));
                    }
                    "zwp_linux_dmabuf_v1" => {
                        state.dmabuf = Some(registry.bind(name, version.min(3), qh, ()));
                    }
                    "xdg_wm_base" => {
                        state.wm_base = Some(registry.bind(name, 1, qh, ()));
                    }
                    _ => {}
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                debug!(name, "Remote global removed, ignoring");
            }
            _ => {}
        }
    }
}

delegate_noop!(WaylandState: WlCompositor);
delegate_noop!(WaylandState: ignore WlSurface);
