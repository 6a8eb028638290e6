#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # Ferrule: display backends for nested wayland compositors
//!
//! This crate provides the lower half of a compositor's output path: allocating GPU buffers,
//! rotating them through swapchains and presenting them in a parent display system.
//!
//! ## Structure of the crate
//!
//! - [`backend::allocator`] contains the buffer types, format negotiation through
//!   [`FormatSet`](backend::allocator::format::FormatSet), a GBM based allocator and the
//!   [`Swapchain`](backend::allocator::Swapchain).
//! - [`backend::x11`] and [`backend::wayland`] run the compositor nested inside an X11 server or
//!   another Wayland compositor. Both import every allocated image right away so presenting it
//!   later never blocks on the parent.
//! - [`output`] contains the frame scheduler shared by all backends, keeping at most one frame
//!   in flight per output.
//!
//! ## The event loop
//!
//! Backends are [`calloop`] event sources. Insert them into your event loop and react to the
//! [`BackendEvent`](backend::BackendEvent)s they produce: new outputs, frame callbacks, buffers
//! coming back from the parent and mode changes.
//!
//! ### Logging
//!
//! Ferrule makes extensive use of [`tracing`] for its internal logging. Every backend runs its
//! work inside its own span (`backend_x11`, `backend_wayland`).
//!
//! For release builds it is recommended to limit the log level during compile time:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod output;
pub mod utils;

pub mod reexports;

#[cfg(test)]
mod test_utils;
