//! Services built on the dispatch pipeline.
//!
//! - `copy`: writes message bodies into files at a given offset

pub mod copy;

pub use copy::{copy_file, CopyError, CopyService};
