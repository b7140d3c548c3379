use std::{
	ffi::OsString,
	fs::{self, OpenOptions},
	io,
	path::{Path, PathBuf},
};

use static_assertions::assert_impl_all;

use super::{AllocationRegion, RegionAllocationLock, RegionError};

/// Persists "allocation in progress" as the existence of a sibling marker file.
///
/// The marker for the region starting at offset `n` of `data.bin` is
/// `data.bin.region-n.unfinished`, in the same directory. Only its existence
/// matters; it is always empty.
#[derive(Debug, Clone)]
pub struct MarkerFileLock {
	file_path: PathBuf,
}

assert_impl_all!(MarkerFileLock: Send, Sync);

impl MarkerFileLock {
	const MARKER_INFIX: &'static str = ".region-";
	const MARKER_SUFFIX: &'static str = ".unfinished";

	fn marker_path(&self, start_offset: u64) -> PathBuf {
		let mut name = self.file_name();
		name.push(format!("{}{start_offset}{}", Self::MARKER_INFIX, Self::MARKER_SUFFIX));
		self.file_path.with_file_name(name)
	}

	fn file_name(&self) -> OsString {
		self.file_path
			.file_name()
			.map(OsString::from)
			.unwrap_or_default()
	}
}

impl RegionAllocationLock for MarkerFileLock {
	type Region = MarkerFileRegion;

	fn for_file(path: &Path) -> Self {
		Self {
			file_path: path.to_path_buf(),
		}
	}

	fn region(&self, start_offset: u64, size: u64) -> MarkerFileRegion {
		MarkerFileRegion {
			marker: self.marker_path(start_offset),
			start_offset,
			size,
		}
	}

	fn clean(&self) -> Result<(), RegionError> {
		let Some(dir) = self.file_path.parent() else {
			return Ok(());
		};
		let mut prefix = self.file_name();
		prefix.push(Self::MARKER_INFIX);
		let prefix = prefix.to_string_lossy().into_owned();

		let entries = match fs::read_dir(dir) {
			Ok(entries) => entries,
			Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
			Err(err) => return Err(err.into()),
		};
		for entry in entries {
			let entry = entry?;
			let name = entry.file_name();
			let name = name.to_string_lossy();
			if name.starts_with(&prefix) && name.ends_with(Self::MARKER_SUFFIX) {
				remove_if_exists(&entry.path())?;
			}
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerFileRegion {
	marker: PathBuf,
	start_offset: u64,
	size: u64,
}

impl MarkerFileRegion {
	#[inline]
	pub fn start_offset(&self) -> u64 {
		self.start_offset
	}

	#[inline]
	pub fn size(&self) -> u64 {
		self.size
	}

	#[inline]
	pub fn marker_path(&self) -> &Path {
		&self.marker
	}
}

impl AllocationRegion for MarkerFileRegion {
	fn is_unfinished(&self) -> Result<bool, RegionError> {
		Ok(self.marker.try_exists()?)
	}

	fn start(&self) -> Result<(), RegionError> {
		match OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(&self.marker)
		{
			Ok(_) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
				Err(RegionError::AlreadyStarted(self.marker.clone()))
			}
			Err(err) => Err(err.into()),
		}
	}

	fn finish(&self) -> Result<(), RegionError> {
		match fs::remove_file(&self.marker) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				Err(RegionError::NotStarted(self.marker.clone()))
			}
			Err(err) => Err(err.into()),
		}
	}
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
	match fs::remove_file(path) {
		Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
		result => result,
	}
}
