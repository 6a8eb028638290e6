/// Declares an opaque, process-unique identifier type.
///
/// Identifiers are handed out from a global counter and never reused while the process lives.
macro_rules! id_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            pub(crate) fn next() -> Self {
                static COUNTER: ::std::sync::atomic::AtomicUsize = ::std::sync::atomic::AtomicUsize::new(0);
                $name(COUNTER.fetch_add(1, ::std::sync::atomic::Ordering::Relaxed))
            }

            /// Raw numeric value of this identifier
            pub fn as_raw(&self) -> usize {
                self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

pub(crate) use id_type;

#[cfg(test)]
mod tests {
    id_type!(TestId);

    #[test]
    fn ids_are_unique() {
        let a = TestId::next();
        let b = TestId::next();
        assert_ne!(a, b);
        assert!(b.as_raw() > a.as_raw());
    }
}
