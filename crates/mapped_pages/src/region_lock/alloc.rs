use std::fs::File;

use crate::{storage::StorageError, utils::io::write_zeros_at};

use super::AllocationRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Allocation {
	/// The region was started, zeroed and finished.
	Fresh,

	/// The region was left unfinished by an earlier attempt and has been
	/// zeroed again in full.
	Recovered,
}

/// Makes sure `[start, start + size)` is allocated on disk and entirely zero.
///
/// Zeroing is idempotent, so a region found unfinished is simply zeroed again
/// and then finished, without starting it a second time.
pub(crate) fn allocate_zeroed(
	region: &impl AllocationRegion,
	file: &File,
	start: u64,
	size: u64,
) -> Result<Allocation, StorageError> {
	if recover_unfinished(region, file, start, size)? {
		return Ok(Allocation::Recovered);
	}
	region.start()?;
	zero_fill(file, start, size)?;
	region.finish()?;
	Ok(Allocation::Fresh)
}

/// Redoes the zeroing of a region that was left unfinished. Returns whether
/// anything had to be recovered.
pub(crate) fn recover_unfinished(
	region: &impl AllocationRegion,
	file: &File,
	start: u64,
	size: u64,
) -> Result<bool, StorageError> {
	if !region.is_unfinished()? {
		return Ok(false);
	}
	zero_fill(file, start, size)?;
	region.finish()?;
	Ok(true)
}

fn zero_fill(file: &File, start: u64, size: u64) -> Result<(), StorageError> {
	write_zeros_at(file, start, size).map_err(|source| StorageError::ZeroFill {
		start,
		end: start + size,
		source,
	})
}
