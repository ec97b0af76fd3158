//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain hex strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Number of hex characters shown for abbreviated identifiers.
pub const SHORT_LEN: usize = 12;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }

            /// First 12 characters, for display.
            pub fn short(&self) -> &str {
                let end = self.0.len().min(SHORT_LEN);
                self.0.get(..end).unwrap_or(&self.0)
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<$name> for String {
            fn eq(&self, other: &$name) -> bool {
                *self == other.0
            }
        }

        impl AsRef<std::path::Path> for $name {
            fn as_ref(&self) -> &std::path::Path {
                std::path::Path::new(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Blake3 identity of a layer: binds the step that produced it and its content.
    LayerId
);

string_newtype!(
    /// Blake3 identity of a step (parent layer + manifest, or base reference).
    StepId
);

string_newtype!(
    /// Blake3 hash of a manifest's canonical specifier text.
    ManifestHash
);

string_newtype!(
    /// Blake3 digest of an image's ordered layer-id chain.
    ImageDigest
);

string_newtype!(
    /// Blake3 hash of a content-addressable object in the store.
    ObjectHash
);
