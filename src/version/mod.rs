//! Versioned file-set bookkeeping: immutable `Version`s linked by
//! `VersionEdit`s, persisted in the manifest and driven by the
//! compaction planner.

pub mod compaction;
pub mod edit;
pub mod set;
pub mod version;

pub use compaction::Compaction;
pub use edit::{FileMetaData, FileMetaHandle, VersionEdit};
pub use set::VersionSet;
pub use version::{Version, VersionGet};
