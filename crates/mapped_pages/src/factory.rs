use std::{
	fmt,
	fs::{self, File, OpenOptions},
	io,
	marker::PhantomData,
	path::{self, Component, Path, PathBuf},
	sync::Arc,
};

use log::{debug, warn};
use thiserror::Error;

use crate::{
	consts::{validate_page_size, PageSizeBoundsError, DEFAULT_PAGE_SIZE},
	region_lock::{alloc::recover_unfinished, MarkerFileLock, RegionAllocationLock, RegionError},
	registry::StorageRegistry,
	storage::{MappedFileStorage, StorageError, UnmapPolicy},
	utils::io::write_zeros_at,
};

#[derive(Debug, Error)]
pub enum OpenError {
	#[error(transparent)]
	InvalidPageSize(#[from] PageSizeBoundsError),

	#[error("The directory {} doesn't exist", _0.display())]
	NoSuchDir(PathBuf),

	#[error("The size {len} of {} is not a multiple of the page size {page_size}", path.display())]
	NotPageAligned {
		path: PathBuf,
		len: u64,
		page_size: u32,
	},

	#[error(transparent)]
	Region(#[from] RegionError),

	#[error(transparent)]
	Storage(#[from] StorageError),

	#[error(transparent)]
	Io(#[from] io::Error),
}

/// What to do when a file is opened whose size is not a multiple of the page
/// size, and no interrupted expansion explains it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnalignedFilePolicy {
	/// Fail with [`OpenError::NotPageAligned`] without touching the file.
	#[default]
	ThrowException,

	/// Append zeros up to the next page boundary. Allows opening files written
	/// with a smaller page size.
	ExpandFile,

	/// Truncate the file to zero length.
	Clean,
}

/// Opens [`MappedFileStorage`]s.
///
/// A factory is an immutable configuration value: every setter returns a new
/// factory and leaves the original as it was.
pub struct MappedStorageFactory<L: RegionAllocationLock = MarkerFileLock> {
	registry: Arc<StorageRegistry>,
	page_size: u32,
	unaligned_policy: UnalignedFilePolicy,
	create_parent_directories: bool,
	unmap_policy: UnmapPolicy,
	_lock: PhantomData<fn() -> L>,
}

impl MappedStorageFactory {
	pub fn new(registry: Arc<StorageRegistry>) -> Self {
		Self {
			registry,
			page_size: DEFAULT_PAGE_SIZE,
			unaligned_policy: UnalignedFilePolicy::default(),
			create_parent_directories: true,
			unmap_policy: UnmapPolicy::default(),
			_lock: PhantomData,
		}
	}
}

impl<L: RegionAllocationLock> MappedStorageFactory<L> {
	/// Must be a power of two within
	/// [`PAGE_SIZE_RANGE`](crate::consts::PAGE_SIZE_RANGE); checked on
	/// [`open`](Self::open).
	pub fn page_size(&self, page_size: u32) -> Self {
		Self {
			page_size,
			..self.clone()
		}
	}

	pub fn if_file_is_not_page_aligned(&self, policy: UnalignedFilePolicy) -> Self {
		Self {
			unaligned_policy: policy,
			..self.clone()
		}
	}

	pub fn create_parent_directories(&self, create: bool) -> Self {
		Self {
			create_parent_directories: create,
			..self.clone()
		}
	}

	pub fn unmap_policy(&self, policy: UnmapPolicy) -> Self {
		Self {
			unmap_policy: policy,
			..self.clone()
		}
	}

	/// Switches the region allocation lock the opened storages use, e.g. to
	/// [`NoopLock`](crate::region_lock::NoopLock) to give up crash tolerance.
	pub fn atomicity_lock<M: RegionAllocationLock>(&self) -> MappedStorageFactory<M> {
		MappedStorageFactory {
			registry: Arc::clone(&self.registry),
			page_size: self.page_size,
			unaligned_policy: self.unaligned_policy,
			create_parent_directories: self.create_parent_directories,
			unmap_policy: self.unmap_policy,
			_lock: PhantomData,
		}
	}

	#[inline]
	pub fn registry(&self) -> &Arc<StorageRegistry> {
		&self.registry
	}

	pub fn open(&self, path: impl AsRef<Path>) -> Result<MappedFileStorage<L>, OpenError> {
		validate_page_size(self.page_size)?;
		let path = normalize_lexically(&path::absolute(path.as_ref())?);
		if !path.try_exists()? {
			self.ensure_parent_dir(&path)?;
		}

		let registration = self.registry.register(&path)?;
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(false)
			.open(&path)?;
		let lock = L::for_file(&path);
		self.align_file(&path, &file, &lock)?;

		debug!(
			"Opened storage {} with page size {}",
			path.display(),
			self.page_size
		);
		Ok(MappedFileStorage::new(
			file,
			registration,
			self.page_size,
			lock,
			self.unmap_policy,
		))
	}

	fn ensure_parent_dir(&self, path: &Path) -> Result<(), OpenError> {
		let Some(parent) = path.parent() else {
			return Ok(());
		};
		if parent.try_exists()? {
			return Ok(());
		}
		if !self.create_parent_directories {
			return Err(OpenError::NoSuchDir(parent.to_path_buf()));
		}
		fs::create_dir_all(parent)?;
		Ok(())
	}

	fn align_file(&self, path: &Path, file: &File, lock: &L) -> Result<(), OpenError> {
		let page_size = u64::from(self.page_size);
		let len = file.metadata()?.len();
		let tail_len = len % page_size;
		if tail_len == 0 {
			return Ok(());
		}

		let tail_start = len - tail_len;
		if recover_unfinished(&lock.region(tail_start, page_size), file, tail_start, page_size)? {
			warn!(
				"Expansion of {} was interrupted at size {len}; the last page has been zeroed again",
				path.display()
			);
			return Ok(());
		}

		match self.unaligned_policy {
			UnalignedFilePolicy::ThrowException => Err(OpenError::NotPageAligned {
				path: path.to_path_buf(),
				len,
				page_size: self.page_size,
			}),
			UnalignedFilePolicy::ExpandFile => {
				let end = tail_start + page_size;
				warn!(
					"Size {len} of {} is not a multiple of the page size {page_size}; expanding it to {end}",
					path.display()
				);
				write_zeros_at(file, len, end - len)
					.map_err(|source| StorageError::ZeroFill { start: len, end, source })?;
				Ok(())
			}
			UnalignedFilePolicy::Clean => {
				warn!(
					"Size {len} of {} is not a multiple of the page size {page_size}; discarding its content",
					path.display()
				);
				file.set_len(0)?;
				lock.clean()?;
				Ok(())
			}
		}
	}
}

/// Removes `.` and `..` components without touching the file system, so that
/// spellings of the same path register as one. Symbolic links are not
/// resolved; two paths reaching a file through different links count as
/// different files.
fn normalize_lexically(path: &Path) -> PathBuf {
	let mut normalized = PathBuf::new();
	for component in path.components() {
		match component {
			Component::CurDir => (),
			Component::ParentDir => {
				normalized.pop();
			}
			other => normalized.push(other),
		}
	}
	normalized
}

impl<L: RegionAllocationLock> Clone for MappedStorageFactory<L> {
	fn clone(&self) -> Self {
		self.atomicity_lock()
	}
}

impl<L: RegionAllocationLock> fmt::Debug for MappedStorageFactory<L> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MappedStorageFactory")
			.field("page_size", &self.page_size)
			.field("unaligned_policy", &self.unaligned_policy)
			.field("create_parent_directories", &self.create_parent_directories)
			.field("unmap_policy", &self.unmap_policy)
			.finish()
	}
}
