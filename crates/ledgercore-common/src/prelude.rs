// SPDX-License-Identifier: MIT

//! Re-exports the collection types used throughout this workspace, so the
//! rest of the crates can `use ledgercore_common::prelude::*;` without
//! caring whether the `std` feature is enabled.

#[cfg(feature = "std")]
mod imp {
    pub use std::boxed::Box;
    pub use std::collections::BTreeMap;
    pub use std::format;
    pub use std::string::String;
    pub use std::string::ToString;
    pub use std::vec;
    pub use std::vec::Vec;

    pub use hashbrown::HashMap;
    pub use hashbrown::HashSet;
}

#[cfg(not(feature = "std"))]
mod imp {
    extern crate alloc;

    pub use alloc::boxed::Box;
    pub use alloc::collections::BTreeMap;
    pub use alloc::format;
    pub use alloc::string::String;
    pub use alloc::string::ToString;
    pub use alloc::vec;
    pub use alloc::vec::Vec;

    pub use hashbrown::HashMap;
    pub use hashbrown::HashSet;
}

pub use imp::*;
