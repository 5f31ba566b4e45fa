//! Directory patching built on a bsdiff delta codec.
//!
//! The codec half (`suffix_array`, `search`, `bsdiff`, `bspatch`, `series`)
//! works on byte buffers and message streams; `create`, `apply` and `probe`
//! drive it over whole directory trees.

pub mod apply;
pub mod bsdiff;
pub mod bspatch;
pub mod compression;
pub mod container;
pub mod create;
pub mod error;
pub mod patch_format;
pub mod probe;
pub mod search;
pub mod series;
pub mod suffix_array;
pub mod util;
pub mod wire;

pub use error::{Error, Result};
