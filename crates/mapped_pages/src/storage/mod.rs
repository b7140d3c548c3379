use std::{
	backtrace::Backtrace,
	fmt,
	fs::{self, File},
	io,
	ops::{Bound, RangeBounds},
	path::{Path, PathBuf},
	sync::Arc,
	time::Instant,
};

use arc_swap::ArcSwap;
use log::{debug, warn};
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::{
	consts::MAX_FILE_SIZE,
	region_lock::{
		alloc::{allocate_zeroed, recover_unfinished, Allocation},
		MarkerFileLock, RegionAllocationLock, RegionError,
	},
	registry::{MappingStats, Registration},
};

pub use page::Page;
use table::PageTable;

mod page;
mod table;

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Storage {} is already closed; it was closed at:\n{closed_at}", path.display())]
	Closed {
		path: PathBuf,
		closed_at: Arc<Backtrace>,
	},

	#[error("Storage {} is already open; only one storage may own a file at a time", _0.display())]
	AlreadyOpen(PathBuf),

	#[error("Page {index} with page size {page_size} lies beyond the maximum file size")]
	OffsetOverflow { index: u64, page_size: u32 },

	#[error("Failed to fill bytes {start}..{end} with zeros: {source}")]
	ZeroFill {
		start: u64,
		end: u64,
		source: io::Error,
	},

	#[error("Failed to map page {index}: {source}")]
	Map { index: u64, source: io::Error },

	#[error("{} page(s) of {} are still in use and were not unmapped: {pages:?}", pages.len(), path.display())]
	PagesInUse { path: PathBuf, pages: Vec<u64> },

	#[error("Failed to allocate page region: {0}")]
	Region(#[from] RegionError),

	#[error(transparent)]
	Io(#[from] io::Error),
}

/// What [`MappedFileStorage::close_and_unsafely_unmap`] does with pages that
/// are still held by someone other than the storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnmapPolicy {
	/// Leave those pages mapped and report them as
	/// [`StorageError::PagesInUse`].
	#[default]
	Fail,

	/// Log a warning and unmap them anyway.
	LogAndContinue,
}

/// A file accessed through lazily created, fixed-size memory-mapped pages.
///
/// The file length is always a multiple of the page size. New pages are
/// allocated on disk and zeroed before they are mapped, under the protection of
/// a [`RegionAllocationLock`], so bytes that were never written read as zero
/// even if the process crashed while the file was growing.
///
/// Looking up an already mapped page never blocks. Creating a page, growing
/// the file and closing serialize on a single per-storage lock.
pub struct MappedFileStorage<L: RegionAllocationLock = MarkerFileLock> {
	path: PathBuf,
	page_size: u32,
	page_size_bits: u32,
	page_size_mask: u64,
	pages: ArcSwap<PageTable>,
	state: Mutex<State>,
	lock: L,
	unmap_policy: UnmapPolicy,
	stats: Arc<MappingStats>,
}

assert_impl_all!(MappedFileStorage: Send, Sync);

struct State {
	file: Option<File>,
	registration: Option<Registration>,
	closed_at: Option<Arc<Backtrace>>,
}

impl State {
	fn open_file(&self, path: &Path) -> Result<&File, StorageError> {
		match (&self.file, &self.closed_at) {
			(Some(file), _) => Ok(file),
			(None, Some(closed_at)) => Err(StorageError::Closed {
				path: path.to_path_buf(),
				closed_at: Arc::clone(closed_at),
			}),
			(None, None) => unreachable!("Storage file is missing, but the storage was never closed"),
		}
	}
}

impl<L: RegionAllocationLock> MappedFileStorage<L> {
	/// The file must be page-aligned already; see
	/// [`MappedStorageFactory`](crate::MappedStorageFactory).
	pub(crate) fn new(
		file: File,
		registration: Registration,
		page_size: u32,
		lock: L,
		unmap_policy: UnmapPolicy,
	) -> Self {
		debug_assert!(page_size.is_power_of_two());
		let path = registration.path().to_path_buf();
		let stats = registration.registry().stats_handle();
		Self {
			path,
			page_size,
			page_size_bits: page_size.trailing_zeros(),
			page_size_mask: u64::from(page_size) - 1,
			pages: ArcSwap::from_pointee(PageTable::empty()),
			state: Mutex::new(State {
				file: Some(file),
				registration: Some(registration),
				closed_at: None,
			}),
			lock,
			unmap_policy,
			stats,
		}
	}

	#[inline]
	pub fn path(&self) -> &Path {
		&self.path
	}

	#[inline]
	pub fn page_size(&self) -> u32 {
		self.page_size
	}

	#[inline]
	pub fn page_index_by_offset(&self, offset_in_file: u64) -> u64 {
		offset_in_file >> self.page_size_bits
	}

	#[inline]
	pub fn to_offset_in_page(&self, offset_in_file: u64) -> usize {
		(offset_in_file & self.page_size_mask) as usize
	}

	pub fn is_open(&self) -> bool {
		self.state.lock().file.is_some()
	}

	/// The current length of the file. Always a multiple of the page size.
	pub fn actual_file_size(&self) -> Result<u64, StorageError> {
		let state = self.state.lock();
		let file = state.open_file(&self.path)?;
		self.aligned_file_len(file)
	}

	pub fn page_by_offset(&self, offset_in_file: u64) -> Result<Arc<Page>, StorageError> {
		self.page_by_index(self.page_index_by_offset(offset_in_file))
	}

	/// Returns the page with the given index, mapping it first if necessary.
	///
	/// The first access to a page past the end of the file grows the file up
	/// to and including that page. Every later call for the same index returns
	/// the same page.
	pub fn page_by_index(&self, index: u64) -> Result<Arc<Page>, StorageError> {
		let overflow = || StorageError::OffsetOverflow {
			index,
			page_size: self.page_size,
		};
		let slot = usize::try_from(index).map_err(|_| overflow())?;
		if let Some(page) = self.pages.load().get(slot) {
			return Ok(Arc::clone(page));
		}
		let end = index
			.checked_add(1)
			.and_then(|num_pages| num_pages.checked_mul(u64::from(self.page_size)))
			.filter(|end| *end <= MAX_FILE_SIZE)
			.ok_or_else(overflow)?;
		self.create_page(index, slot, end)
	}

	/// Zeroes the bytes in `range`, clamped to the current end of the file.
	/// Never grows the file.
	pub fn zeroize_region(&self, range: impl RangeBounds<u64>) -> Result<(), StorageError> {
		let file_size = self.actual_file_size()?;
		let start = match range.start_bound() {
			Bound::Included(&start) => start,
			Bound::Excluded(&start) => start.saturating_add(1),
			Bound::Unbounded => 0,
		};
		let end = match range.end_bound() {
			Bound::Included(&end) => end.saturating_add(1),
			Bound::Excluded(&end) => end,
			Bound::Unbounded => file_size,
		}
		.min(file_size);

		let mut offset = start;
		while offset < end {
			let page = self.page_by_offset(offset)?;
			let until = end.min(page.range_in_file().end);
			let offset_in_page = self.to_offset_in_page(offset);
			page.zero(offset_in_page..offset_in_page + (until - offset) as usize);
			offset = until;
		}
		Ok(())
	}

	pub fn zeroize_till_eof(&self, start: u64) -> Result<(), StorageError> {
		self.zeroize_region(start..)
	}

	/// Writes all modified pages back to disk and waits until the file is
	/// synchronized.
	pub fn fsync(&self) -> Result<(), StorageError> {
		let state = self.state.lock();
		let file = state.open_file(&self.path)?;
		for page in self.pages.load().pages() {
			page.flush()?;
		}
		file.sync_all()?;
		Ok(())
	}

	/// Closes the file and releases this storage's hold on its pages.
	///
	/// Pages nobody else holds are unmapped right away; pages that callers
	/// still hold stay usable until the last of them is dropped. Any page
	/// lookup that needs the storage afterwards fails with
	/// [`StorageError::Closed`]. Closing twice does nothing.
	pub fn close(&self) {
		self.shut_down();
	}

	/// Closes the storage like [`close`](Self::close), then unmaps every page
	/// it had mapped immediately.
	///
	/// Pages that are still held elsewhere are handled according to the
	/// storage's [`UnmapPolicy`].
	///
	/// # Safety
	/// With [`UnmapPolicy::LogAndContinue`], pages held by others are unmapped
	/// as well: the caller must ensure that none of them is used afterwards,
	/// or concurrently, by any thread. See [`Page::force_unmap`].
	pub unsafe fn close_and_unsafely_unmap(&self) -> Result<(), StorageError> {
		self.unmap_pages(self.shut_down(), self.unmap_policy)
	}

	/// Closes the storage, unmaps its pages and deletes the file along with
	/// any region markers.
	///
	/// Pages still held by someone else are never unmapped here; if there are
	/// any, the file is not deleted and [`StorageError::PagesInUse`] is
	/// returned.
	pub fn close_and_clean(&self) -> Result<(), StorageError> {
		// Safety: with `UnmapPolicy::Fail`, only pages that nobody else holds
		// are unmapped.
		unsafe { self.unmap_pages(self.shut_down(), UnmapPolicy::Fail)? };
		match fs::remove_file(&self.path) {
			Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
			_ => (),
		}
		self.lock.clean()?;
		debug!("Deleted storage {}", self.path.display());
		Ok(())
	}

	fn shut_down(&self) -> Vec<Arc<Page>> {
		let mut state = self.state.lock();
		let Some(file) = state.file.take() else {
			return Vec::new();
		};
		state.closed_at = Some(Arc::new(Backtrace::force_capture()));
		let table = self.pages.swap(Arc::new(PageTable::empty()));
		let pages = table.pages().cloned().collect();
		drop(table);
		drop(file);
		state.registration = None;
		debug!("Closed storage {}", self.path.display());
		pages
	}

	/// # Safety
	/// See [`close_and_unsafely_unmap`](Self::close_and_unsafely_unmap).
	unsafe fn unmap_pages(&self, pages: Vec<Arc<Page>>, policy: UnmapPolicy) -> Result<(), StorageError> {
		let mut in_use = Vec::new();
		for page in pages {
			let other_holders = Arc::strong_count(&page) - 1;
			if other_holders != 0 {
				match policy {
					UnmapPolicy::Fail => {
						in_use.push(page.index());
						continue;
					}
					UnmapPolicy::LogAndContinue => warn!(
						"Unmapping page {} of {} while {other_holders} other owner(s) still hold it",
						page.index(),
						self.path.display()
					),
				}
			}
			page.force_unmap();
		}
		if !in_use.is_empty() {
			return Err(StorageError::PagesInUse {
				path: self.path.clone(),
				pages: in_use,
			});
		}
		Ok(())
	}

	/// `end` is the offset in the file right after the page.
	fn create_page(&self, index: u64, slot: usize, end: u64) -> Result<Arc<Page>, StorageError> {
		let state = self.state.lock();
		let file = state.open_file(&self.path)?;

		let table = self.pages.load_full();
		if let Some(page) = table.get(slot) {
			return Ok(Arc::clone(page));
		}

		let started = Instant::now();
		self.allocate_up_to(file, end)?;
		let page = Page::map(file, index, self.page_size as usize, Arc::clone(&self.stats))
			.map_err(|source| StorageError::Map { index, source })?;
		self.stats.record_map_time(started.elapsed());
		debug!("Mapped page {index} of {}", self.path.display());

		let page = Arc::new(page);
		if slot < table.len() {
			table.publish(slot, Arc::clone(&page));
		} else {
			let grown = table
				.try_grown_to_fit(slot)
				.map_err(|_| StorageError::OffsetOverflow {
					index,
					page_size: self.page_size,
				})?;
			grown.publish(slot, Arc::clone(&page));
			self.pages.store(Arc::new(grown));
		}
		Ok(page)
	}

	/// Makes sure the file is allocated up to `end` and that every new page is
	/// zeroed, one page-sized region at a time.
	fn allocate_up_to(&self, file: &File, end: u64) -> Result<(), StorageError> {
		let page_size = u64::from(self.page_size);
		let file_len = self.aligned_file_len(file)?;

		if end <= file_len {
			let start = end - page_size;
			if recover_unfinished(&self.lock.region(start, page_size), file, start, page_size)? {
				self.log_recovery(start);
			}
			return Ok(());
		}

		for start in (file_len..end).step_by(self.page_size as usize) {
			let region = self.lock.region(start, page_size);
			match allocate_zeroed(&region, file, start, page_size) {
				Ok(Allocation::Fresh) => (),
				Ok(Allocation::Recovered) => self.log_recovery(start),
				Err(err) => {
					self.discard_partial_page(file, start);
					return Err(err);
				}
			}
		}
		Ok(())
	}

	/// The length of the file, after repairing a partial page that a failed
	/// expansion may have left at its end.
	fn aligned_file_len(&self, file: &File) -> Result<u64, StorageError> {
		let len = file.metadata()?.len();
		let tail_len = len & self.page_size_mask;
		if tail_len == 0 {
			return Ok(len);
		}

		let page_size = u64::from(self.page_size);
		let tail_start = len - tail_len;
		if recover_unfinished(&self.lock.region(tail_start, page_size), file, tail_start, page_size)? {
			self.log_recovery(tail_start);
			return Ok(tail_start + page_size);
		}
		warn!(
			"{} ends in a partial page of {tail_len} bytes; truncating it to {tail_start} bytes",
			self.path.display()
		);
		file.set_len(tail_start)?;
		Ok(tail_start)
	}

	fn discard_partial_page(&self, file: &File, aligned_len: u64) {
		if let Err(err) = file.set_len(aligned_len) {
			warn!(
				"Failed to truncate {} back to {aligned_len} bytes after a failed expansion: {err}",
				self.path.display()
			);
		}
	}

	fn log_recovery(&self, start: u64) {
		warn!(
			"Allocation of page {} of {} was interrupted earlier; the page has been zeroed again",
			self.page_index_by_offset(start),
			self.path.display()
		);
	}
}

impl<L: RegionAllocationLock> Drop for MappedFileStorage<L> {
	fn drop(&mut self) {
		self.close();
	}
}

impl<L: RegionAllocationLock> fmt::Debug for MappedFileStorage<L> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MappedFileStorage")
			.field("path", &self.path)
			.field("page_size", &self.page_size)
			.field("open", &self.is_open())
			.finish()
	}
}
