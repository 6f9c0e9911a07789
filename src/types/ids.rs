//! Strongly-typed identifiers.
//!
//! Ids in the policy core are numeric and caller-assigned (the scheduler
//! allocates them); the newtypes keep the different id spaces from mixing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed numeric id newtype wrapper.
///
/// Generates: struct, `new()`, `as_u32()`, From<u32>, Display, Serialize,
/// Deserialize.
macro_rules! define_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(u32);

        impl $name {
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            pub const fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(JobId);
define_id!(UserId);
define_id!(QosId);
define_id!(AssocId);
