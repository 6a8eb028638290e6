use std::fs::File;
use std::os::unix::io::OwnedFd;

use criterion::{criterion_group, criterion_main, Criterion};
use ferrule::backend::allocator::{
    dmabuf::{Dmabuf, DmabufFlags},
    format::FormatSet,
    AllocationError, Allocator, AnyError, Buffer, Format, Fourcc, Image, ImageBuffer, Modifier, Swapchain,
    SwapchainFlags,
};

#[derive(Debug)]
struct NullBuffer {
    width: u32,
    height: u32,
    format: Format,
}

impl Buffer for NullBuffer {
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

impl ImageBuffer for NullBuffer {
    fn export(&self) -> Result<Dmabuf, AnyError> {
        let fd = File::open("/dev/null").map_err(AnyError::new)?;
        let mut builder = Dmabuf::builder(self.width, self.height, self.format, DmabufFlags::empty());
        builder.add_plane(OwnedFd::from(fd), 0, 0, self.width * 4);
        builder.build().ok_or_else(|| AnyError::new("no planes"))
    }
}

/// Images backed by `/dev/null`, enough to exercise the swapchain bookkeeping
struct NullAllocator;

impl Allocator for NullAllocator {
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        _modifiers: &[Modifier],
    ) -> Result<Image, AllocationError> {
        let buffer = NullBuffer {
            width,
            height,
            format: Format {
                code: fourcc,
                modifier: Modifier::Linear,
            },
        };
        let dmabuf = buffer.export().expect("/dev/null is readable");
        Ok(Image::new(Box::new(buffer), dmabuf))
    }

    fn deallocate(&mut self, _image: Image) {}
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("Swapchain::acquire + release", |b| {
        let mut swapchain = Swapchain::new(
            NullAllocator,
            1280,
            720,
            Fourcc::Xrgb8888,
            &[],
            SwapchainFlags::TRIPLE_BUFFERED,
        )
        .unwrap();
        b.iter(|| {
            let image = swapchain.acquire().unwrap();
            swapchain.release(image);
        })
    });
    c.bench_function("FormatSet::add", |b| {
        b.iter(|| {
            let mut formats = FormatSet::default();
            for code in [Fourcc::Xrgb8888, Fourcc::Argb8888, Fourcc::Abgr8888] {
                formats.add(code, Modifier::Linear);
                formats.add(code, Modifier::Invalid);
            }
            formats
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
