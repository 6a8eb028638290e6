//! Format sets and format info tables for DRM formats.
//!
//! A [`FormatSet`] records which modifiers a consumer accepts for every pixel format it
//! knows about. Backends publish one through [`Backend::formats`](crate::backend::Backend::formats),
//! swapchains use it to pick modifiers for their allocations.
//!
//! ```
//! # use ferrule::backend::allocator::{Fourcc, Modifier, format::FormatSet};
//! let mut formats = FormatSet::default();
//! assert!(formats.add(Fourcc::Xrgb8888, Modifier::Linear));
//! assert!(!formats.add(Fourcc::Xrgb8888, Modifier::Linear));
//!
//! let entry = formats.get(Fourcc::Xrgb8888).unwrap();
//! assert_eq!(entry.modifiers().count(), 1);
//! assert!(formats.get(Fourcc::Argb8888).is_none());
//! ```
//!
//! The module also provides two table lookups, [`get_bpp`] and [`get_depth`], which the X11
//! backend needs to describe pixmaps.
//!
//! ```
//! # use ferrule::backend::allocator::Fourcc;
//! # use ferrule::backend::allocator::format::{get_bpp, get_depth};
//! assert_eq!(get_bpp(Fourcc::Argb8888), Some(32));
//! assert_eq!(get_depth(Fourcc::Xrgb8888), Some(24));
//! ```

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use super::{Format, Fourcc, Modifier};

/// Macro to generate table lookup functions for formats.
macro_rules! format_tables {
    (
        $($fourcc: ident {
            alpha: $alpha: expr,
            bpp: $bpp: expr,
            depth: $depth: expr $(,)?
        }),*
    ) => {
        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats will always return `false`.
        pub const fn has_alpha(fourcc: $crate::backend::allocator::Fourcc) -> bool {
            match fourcc {
                $(
                    $crate::backend::allocator::Fourcc::$fourcc => $alpha,
                )*
                _ => false,
            }
        }

        /// Returns the bits per pixel of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_bpp(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<usize> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Returns the depth of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_depth(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<usize> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some($depth),)*
                _ => None,
            }
        }

        #[cfg(test)]
        fn _impl_formats() -> &'static [$crate::backend::allocator::Fourcc] {
            &[
                $(
                    $crate::backend::allocator::Fourcc::$fourcc,
                )*
            ]
        }
    };
}

format_tables! {
    // 16-bit RGB
    Rgb565 { alpha: false, bpp: 16, depth: 16 },
    Bgr565 { alpha: false, bpp: 16, depth: 16 },

    // 32-bit RGB with 8-bit components
    Argb8888 { alpha: true, bpp: 32, depth: 32 },
    Xrgb8888 { alpha: false, bpp: 32, depth: 24 },
    Abgr8888 { alpha: true, bpp: 32, depth: 32 },
    Xbgr8888 { alpha: false, bpp: 32, depth: 24 },
    Rgba8888 { alpha: true, bpp: 32, depth: 32 },
    Rgbx8888 { alpha: false, bpp: 32, depth: 24 },
    Bgra8888 { alpha: true, bpp: 32, depth: 32 },
    Bgrx8888 { alpha: false, bpp: 32, depth: 24 },

    // 32-bit RGB with 10-bit components
    Argb2101010 { alpha: true, bpp: 32, depth: 32 },
    Xrgb2101010 { alpha: false, bpp: 32, depth: 30 },
    Abgr2101010 { alpha: true, bpp: 32, depth: 32 },
    Xbgr2101010 { alpha: false, bpp: 32, depth: 30 }
}

/// Modifiers accepted for a single pixel format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatEntry {
    code: Fourcc,
    modifiers: IndexSet<Modifier>,
}

impl FormatEntry {
    /// The pixel format this entry describes
    pub fn code(&self) -> Fourcc {
        self.code
    }

    /// Accepted modifiers, in the order they were first added
    pub fn modifiers(&self) -> impl Iterator<Item = Modifier> + '_ {
        self.modifiers.iter().copied()
    }

    /// Whether `modifier` is accepted for this format
    pub fn contains(&self, modifier: Modifier) -> bool {
        self.modifiers.contains(&modifier)
    }

    /// Whether the consumer accepts buffers with an implicit, driver-chosen layout
    pub fn supports_implicit(&self) -> bool {
        self.contains(Modifier::Invalid)
    }
}

/// A mapping from pixel formats to the modifiers accepted for each
///
/// Cloning is cheap; the storage is shared until one of the clones is modified.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FormatSet {
    formats: Arc<IndexMap<Fourcc, FormatEntry>>,
}

impl FormatSet {
    /// Record that `modifier` is accepted for `code`
    ///
    /// Returns `true` if the pair was newly recorded. Adding an already present pair leaves the
    /// set unchanged. [`Modifier::Invalid`] is a regular entry and means "implicit layout accepted".
    pub fn add(&mut self, code: Fourcc, modifier: Modifier) -> bool {
        if self.formats.get(&code).is_some_and(|entry| entry.contains(modifier)) {
            return false;
        }
        Arc::make_mut(&mut self.formats)
            .entry(code)
            .or_insert_with(|| FormatEntry {
                code,
                modifiers: IndexSet::new(),
            })
            .modifiers
            .insert(modifier)
    }

    /// Look up the entry for `code`
    pub fn get(&self, code: Fourcc) -> Option<&FormatEntry> {
        self.formats.get(&code)
    }

    /// Return `true` if the format/modifier pair is part of the set
    pub fn contains(&self, format: &Format) -> bool {
        self.get(format.code)
            .is_some_and(|entry| entry.contains(format.modifier))
    }

    /// Number of distinct pixel formats in the set
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Whether the set has no formats at all
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Iterate over the format entries in insertion order
    pub fn entries(&self) -> impl Iterator<Item = &FormatEntry> + '_ {
        self.formats.values()
    }

    /// Iterate over every format/modifier pair in insertion order
    pub fn iter(&self) -> impl Iterator<Item = Format> + '_ {
        self.formats.values().flat_map(|entry| {
            entry.modifiers().map(move |modifier| Format {
                code: entry.code,
                modifier,
            })
        })
    }
}

impl FromIterator<Format> for FormatSet {
    fn from_iter<T: IntoIterator<Item = Format>>(iter: T) -> Self {
        let mut set = FormatSet::default();
        for format in iter {
            set.add(format.code, format.modifier);
        }
        set
    }
}

impl Extend<Format> for FormatSet {
    fn extend<T: IntoIterator<Item = Format>>(&mut self, iter: T) {
        for format in iter {
            self.add(format.code, format.modifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{_impl_formats, get_bpp, get_depth, has_alpha, FormatSet};
    use crate::backend::allocator::{Format, Fourcc, Modifier};

    #[test]
    fn add_is_idempotent() {
        let mut set = FormatSet::default();
        assert!(set.add(Fourcc::Xrgb8888, Modifier::Linear));
        assert!(set.add(Fourcc::Xrgb8888, Modifier::Invalid));
        assert!(!set.add(Fourcc::Xrgb8888, Modifier::Linear));

        let entry = set.get(Fourcc::Xrgb8888).expect("Format was added");
        assert_eq!(
            entry.modifiers().collect::<Vec<_>>(),
            vec![Modifier::Linear, Modifier::Invalid]
        );
        assert!(entry.supports_implicit());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn get_unknown_format() {
        let mut set = FormatSet::default();
        assert!(set.is_empty());
        set.add(Fourcc::Argb8888, Modifier::Linear);
        assert!(set.get(Fourcc::Xrgb8888).is_none());
    }

    #[test]
    fn clones_do_not_observe_later_additions() {
        let mut set = FormatSet::default();
        set.add(Fourcc::Argb8888, Modifier::Linear);
        let snapshot = set.clone();
        set.add(Fourcc::Argb8888, Modifier::Invalid);

        assert!(!snapshot.contains(&Format {
            code: Fourcc::Argb8888,
            modifier: Modifier::Invalid
        }));
        assert!(set.contains(&Format {
            code: Fourcc::Argb8888,
            modifier: Modifier::Invalid
        }));
    }

    #[test]
    fn iter_preserves_insertion_order() {
        let formats = [
            Format {
                code: Fourcc::Xrgb8888,
                modifier: Modifier::Linear,
            },
            Format {
                code: Fourcc::Argb8888,
                modifier: Modifier::Invalid,
            },
            Format {
                code: Fourcc::Xrgb8888,
                modifier: Modifier::Invalid,
            },
        ];
        let set = formats.iter().copied().collect::<FormatSet>();
        let collected = set.iter().collect::<Vec<_>>();
        assert_eq!(collected, vec![formats[0], formats[2], formats[1]]);
    }

    #[test]
    fn format_bpp_greater_or_equal_than_depth() {
        for &format in _impl_formats() {
            let bpp = get_bpp(format).expect("Format in table has bpp");
            let depth = get_depth(format).expect("Format in table has depth");
            assert!(bpp >= depth, "{} has a depth greater than its bpp", format);
        }
    }

    #[test]
    fn alpha_formats_use_all_bits() {
        for &format in _impl_formats() {
            if has_alpha(format) {
                assert_eq!(get_bpp(format), get_depth(format), "{} has padding bits", format);
            }
        }
    }
}
