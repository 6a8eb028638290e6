//! Instrumented fakes shared by the unit tests

use std::{
    cell::{Cell, RefCell},
    io,
    ops::Deref,
    os::unix::io::OwnedFd,
    rc::Rc,
};

use crate::backend::{
    allocator::{
        dmabuf::{Dmabuf, DmabufFlags},
        format::FormatSet,
        AnyError, Buffer, BufferDevice, BufferUsage, Format, Fourcc, Image, ImageBuffer, ImageId, Modifier,
    },
    renderer::ImageHooks,
    AttachError, Backend,
};
use crate::output::{OutputEvent, PresentSurface};
use crate::utils::DeviceFd;

/// Route logs to the test harness, filtered by `RUST_LOG`
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn null_fd() -> OwnedFd {
    OwnedFd::from(std::fs::File::open("/dev/null").expect("/dev/null is readable"))
}

/// Call counters and failure switches shared between the fakes of one test
#[derive(Debug, Default, Clone)]
pub(crate) struct Counters(Rc<CountersInner>);

#[derive(Debug, Default)]
pub(crate) struct CountersInner {
    pub buffer_create: Cell<usize>,
    pub buffer_free: Cell<usize>,
    pub attach: Cell<usize>,
    pub detach: Cell<usize>,
    pub renderer_create: Cell<usize>,
    pub renderer_destroy: Cell<usize>,
    pub log: RefCell<Vec<&'static str>>,

    pub fail_attach: Cell<bool>,
    pub fail_renderer: Cell<bool>,
    pub fail_explicit: Cell<bool>,
    pub fail_after: Cell<Option<usize>>,
    pub force_modifier: Cell<Option<Modifier>>,
}

impl Deref for Counters {
    type Target = CountersInner;

    fn deref(&self) -> &CountersInner {
        &self.0
    }
}

impl CountersInner {
    pub fn live_buffers(&self) -> usize {
        self.buffer_create.get() - self.buffer_free.get()
    }

    fn bump(&self, counter: &Cell<usize>, entry: &'static str) {
        counter.set(counter.get() + 1);
        self.log.borrow_mut().push(entry);
    }
}

#[derive(Debug)]
pub(crate) struct FakeBuffer {
    counters: Counters,
    width: u32,
    height: u32,
    format: Format,
}

impl Buffer for FakeBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> Format {
        self.format
    }
}

impl ImageBuffer for FakeBuffer {
    fn export(&self) -> Result<Dmabuf, AnyError> {
        let mut builder = Dmabuf::builder(self.width, self.height, self.format, DmabufFlags::empty());
        builder.add_plane(null_fd(), 0, 0, self.width * 4);
        builder
            .build()
            .ok_or_else(|| AnyError::new("buffer without planes"))
    }
}

impl Drop for FakeBuffer {
    fn drop(&mut self) {
        self.counters.bump(&self.counters.buffer_free, "buffer_free");
    }
}

#[derive(Debug)]
pub(crate) struct FakeDevice {
    counters: Counters,
}

impl FakeDevice {
    pub fn new(counters: &Counters) -> Self {
        FakeDevice {
            counters: counters.clone(),
        }
    }

    fn buffer(&self, width: u32, height: u32, format: Format) -> io::Result<FakeBuffer> {
        if self
            .counters
            .fail_after
            .get()
            .is_some_and(|limit| self.counters.buffer_create.get() >= limit)
        {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "out of buffers"));
        }
        self.counters.bump(&self.counters.buffer_create, "buffer_create");
        Ok(FakeBuffer {
            counters: self.counters.clone(),
            width,
            height,
            format,
        })
    }
}

impl BufferDevice for FakeDevice {
    type Buffer = FakeBuffer;

    fn create_buffer_with_modifiers(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> io::Result<FakeBuffer> {
        if self.counters.fail_explicit.get() {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "no modifier support"));
        }
        let modifier = self.counters.force_modifier.get().unwrap_or(modifiers[0]);
        self.buffer(width, height, Format { code: fourcc, modifier })
    }

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        usage: BufferUsage,
    ) -> io::Result<FakeBuffer> {
        let modifier = if usage.contains(BufferUsage::LINEAR) {
            Modifier::Linear
        } else {
            Modifier::Invalid
        };
        self.buffer(width, height, Format { code: fourcc, modifier })
    }
}

/// Marker stored in the backend slot of attached images
#[derive(Debug)]
pub(crate) struct FakeImport;

#[derive(Debug, Clone)]
pub(crate) struct FakeBackend {
    counters: Counters,
}

impl FakeBackend {
    pub fn new(counters: &Counters) -> Self {
        FakeBackend {
            counters: counters.clone(),
        }
    }
}

impl Backend for FakeBackend {
    fn render_fd(&self) -> DeviceFd {
        DeviceFd::from(null_fd())
    }

    fn formats(&self) -> FormatSet {
        let mut formats = FormatSet::default();
        formats.add(Fourcc::Xrgb8888, Modifier::Linear);
        formats
    }

    fn attach(&mut self, image: &mut Image) -> Result<(), AttachError> {
        self.counters.bump(&self.counters.attach, "backend_attach");
        if self.counters.fail_attach.get() {
            return Err(AttachError::Unsupported(image.format()));
        }
        image.backend_data_mut().set(FakeImport);
        Ok(())
    }

    fn detach(&mut self, image: &mut Image) {
        self.counters.bump(&self.counters.detach, "backend_detach");
        assert!(
            image.backend_data_mut().take::<FakeImport>().is_some(),
            "Detached an image that was never attached"
        );
    }
}

#[derive(Debug)]
pub(crate) struct CountingHooks {
    counters: Counters,
}

impl CountingHooks {
    pub fn new(counters: &Counters) -> Self {
        CountingHooks {
            counters: counters.clone(),
        }
    }
}

impl ImageHooks for CountingHooks {
    fn create(&mut self, _image: &mut Image) -> Result<(), AnyError> {
        self.counters
            .bump(&self.counters.renderer_create, "renderer_create");
        if self.counters.fail_renderer.get() {
            return Err(AnyError::new("renderer rejected the image"));
        }
        Ok(())
    }

    fn destroy(&mut self, _image: &mut Image) {
        self.counters
            .bump(&self.counters.renderer_destroy, "renderer_destroy");
    }
}

/// A standalone image not attached to any backend
pub(crate) fn fake_image(counters: &Counters, width: u32, height: u32) -> Image {
    let buffer = FakeDevice::new(counters)
        .create_buffer(width, height, Fourcc::Xrgb8888, BufferUsage::RENDERING)
        .expect("Fake allocation succeeds");
    let dmabuf = buffer.export().expect("Fake export succeeds");
    Image::new(Box::new(buffer), dmabuf)
}

/// A display surface that records commits
#[derive(Debug, Default)]
pub(crate) struct FakeSurface {
    pub commits: Vec<ImageId>,
    pub armed: bool,
    pub cancelled: usize,
    pub fail: bool,
}

impl PresentSurface for FakeSurface {
    fn present(&mut self, image: &Image) -> Result<(), AnyError> {
        if self.fail {
            return Err(AnyError::new("surface gone"));
        }
        self.commits.push(image.id());
        self.armed = true;
        Ok(())
    }

    fn cancel_frame(&mut self) {
        self.armed = false;
        self.cancelled += 1;
    }
}

/// Ids of the images handed back in `events`, in order
pub(crate) fn released(events: &[OutputEvent]) -> Vec<ImageId> {
    events
        .iter()
        .filter_map(|event| match event {
            OutputEvent::BufferReleased(image) => Some(image.id()),
            _ => None,
        })
        .collect()
}
