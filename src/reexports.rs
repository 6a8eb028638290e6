//! Reexports of crates, that are part of the public api, for convenience

pub use calloop;
pub use drm_fourcc;
#[cfg(feature = "backend_gbm")]
pub use gbm;
#[cfg(feature = "backend_wayland")]
pub use wayland_client;
#[cfg(feature = "backend_wayland")]
pub use wayland_protocols;
#[cfg(feature = "x11rb_event_source")]
pub use x11rb;
