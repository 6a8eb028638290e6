//! Various utilities functions and types

mod fd;
pub(crate) mod ids;
pub mod user_data;
#[cfg(feature = "x11rb_event_source")]
pub mod x11rb;

pub use self::fd::{DevPath, DeviceFd};
pub use self::user_data::DataSlot;
