use std::ops::RangeInclusive;

use thiserror::Error;

use crate::utils::units::*;

pub const DEFAULT_PAGE_SIZE: u32 = MiB as u32;
pub const PAGE_SIZE_RANGE: RangeInclusive<u32> = (512 * B as u32)..=(GiB as u32);

/// Memory mappings are a limited OS resource (`vm.max_map_count` on linux),
/// so a warning is logged once this many pages are mapped at the same time.
pub const DEFAULT_PAGES_TO_WARN_THRESHOLD: u64 = 32 * 1024;

/// Upper bound on the size a storage file may grow to.
pub const MAX_FILE_SIZE: u64 = 16 * TiB;

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
	"Page size {} is invalid; must be a power of two between {} and {}",
	.0,
	display_size(u64::from(*PAGE_SIZE_RANGE.start())),
	display_size(u64::from(*PAGE_SIZE_RANGE.end()))
)]
pub struct PageSizeBoundsError(pub u32);

#[inline]
pub(crate) fn validate_page_size(size: u32) -> Result<(), PageSizeBoundsError> {
	if !size.is_power_of_two() || !PAGE_SIZE_RANGE.contains(&size) {
		return Err(PageSizeBoundsError(size));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accept_powers_of_two_in_range() {
		for size in [512, 4 * KiB as u32, 64 * KiB as u32, MiB as u32, GiB as u32] {
			assert_eq!(validate_page_size(size), Ok(()));
		}
	}

	#[test]
	fn reject_invalid_page_sizes() {
		for size in [0, 1, 256, 1000, 3 * KiB as u32, 2 * GiB as u32] {
			assert_eq!(validate_page_size(size), Err(PageSizeBoundsError(size)));
		}
	}

	#[test]
	fn page_size_error_message() {
		assert_eq!(
			PageSizeBoundsError(1000).to_string(),
			"Page size 1000 is invalid; must be a power of two between 512 B and 1 GiB"
		);
	}
}
