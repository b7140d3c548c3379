use std::path::Path;

use super::{AllocationRegion, RegionAllocationLock, RegionError};

/// A lock whose regions always report as finished.
///
/// Opting into this trades crash tolerance for not having to create and delete
/// a marker file for every page the storage grows by. A crash in the middle of
/// an expansion may then expose whatever the disk held before.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLock;

impl RegionAllocationLock for NoopLock {
	type Region = NoopRegion;

	fn for_file(_path: &Path) -> Self {
		Self
	}

	fn region(&self, _start_offset: u64, _size: u64) -> NoopRegion {
		NoopRegion
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRegion;

impl AllocationRegion for NoopRegion {
	#[inline]
	fn is_unfinished(&self) -> Result<bool, RegionError> {
		Ok(false)
	}

	#[inline]
	fn start(&self) -> Result<(), RegionError> {
		Ok(())
	}

	#[inline]
	fn finish(&self) -> Result<(), RegionError> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use super::*;

	#[test]
	fn noop_region_never_touches_the_disk() {
		let dir = tempdir().unwrap();
		let lock = NoopLock::for_file(&dir.path().join("pages.bin"));
		let region = lock.region(0, 4096);

		region.start().unwrap();
		assert!(!region.is_unfinished().unwrap());
		region.start().unwrap();
		region.finish().unwrap();
		region.finish().unwrap();

		assert_eq!(dir.path().read_dir().unwrap().count(), 0);
	}
}
