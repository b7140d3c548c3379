//! Page-based access to a file through lazily created memory mappings.
//!
//! A [`MappedFileStorage`] splits its file into fixed-size pages and maps each
//! page the first time it is requested, growing and zero-filling the file as
//! needed. Storages are opened through a [`MappedStorageFactory`], which owns
//! the configuration and a [`StorageRegistry`] shared by all storages it
//! opens.

// Lint config
#![cfg_attr(not(test), warn(clippy::cast_possible_wrap))]

mod consts;
mod factory;
pub mod region_lock;
pub mod registry;
mod storage;
mod utils;

pub use consts::{
	PageSizeBoundsError, DEFAULT_PAGES_TO_WARN_THRESHOLD, DEFAULT_PAGE_SIZE, MAX_FILE_SIZE,
	PAGE_SIZE_RANGE,
};
pub use factory::{MappedStorageFactory, OpenError, UnalignedFilePolicy};
pub use registry::{MappingStats, StorageRegistry};
pub use storage::{MappedFileStorage, Page, StorageError, UnmapPolicy};
