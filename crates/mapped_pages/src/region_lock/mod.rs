//! Crash-tolerant marking of file regions that are being allocated.
//!
//! Before a storage grows its file by a page, it marks the page's byte range
//! as "unfinished", writes zeros over it and then marks it as finished again.
//! If the process dies in between, the mark survives, and the next attempt to
//! use that range knows it has to redo the zeroing from scratch.

use std::{
	io,
	path::{Path, PathBuf},
};

use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub(crate) mod alloc;
mod marker;
mod noop;

pub use marker::{MarkerFileLock, MarkerFileRegion};
pub use noop::{NoopLock, NoopRegion};

#[derive(Debug, Error)]
pub enum RegionError {
	#[error("Region allocation was already started (marker {} exists)", _0.display())]
	AlreadyStarted(PathBuf),

	#[error("Region allocation was never started (marker {} is missing)", _0.display())]
	NotStarted(PathBuf),

	#[error("Failed to access region marker: {0}")]
	Io(#[from] io::Error),
}

/// A provider of [`AllocationRegion`]s for one storage file.
///
/// Only a single storage instance may own a file at a time, so a region is
/// never contended; a region that is already started when `start()` is called
/// indicates a broken ownership invariant, not a race to wait out.
pub trait RegionAllocationLock: Send + Sync + Sized + 'static {
	type Region: AllocationRegion;

	fn for_file(path: &Path) -> Self;

	fn region(&self, start_offset: u64, size: u64) -> Self::Region;

	/// Removes whatever the lock persisted for the file, finished or not.
	fn clean(&self) -> Result<(), RegionError> {
		Ok(())
	}
}

#[cfg_attr(test, automock)]
pub trait AllocationRegion {
	/// Whether a previous allocation of this region was started and never
	/// finished.
	fn is_unfinished(&self) -> Result<bool, RegionError>;

	fn start(&self) -> Result<(), RegionError>;

	fn finish(&self) -> Result<(), RegionError>;
}
