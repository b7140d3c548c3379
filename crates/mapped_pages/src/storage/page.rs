use std::{
	fmt,
	fs::File,
	io,
	ops::Range,
	ptr, slice,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::registry::MappingStats;

/// One page-sized, read/write memory mapping of the storage file.
///
/// A page is immutable after construction: its index, size and the address
/// of its buffer never change. The mapping is released when the last `Arc`
/// holding the page is dropped, or earlier through [`Page::force_unmap`].
///
/// Bytes are accessed by copying in and out with [`Page::read`] and
/// [`Page::write`]. The page does not coordinate access between threads;
/// like any memory-mapped file, concurrent writers to the same bytes need
/// to synchronize on their own.
pub struct Page {
	index: u64,
	offset_in_file: u64,
	len: usize,
	ptr: *mut u8,
	mapping: Mutex<Option<MmapRaw>>,
	unmapped: AtomicBool,
	stats: Arc<MappingStats>,
}

// Safety: `ptr` points into `mapping`, which is owned by the page and can be
// shared between threads; all access through it goes through the methods
// below.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

assert_impl_all!(Page: Send, Sync);

impl Page {
	/// Maps `[index * len, (index + 1) * len)` of `file`. The range must
	/// already be allocated in the file.
	pub(super) fn map(
		file: &File,
		index: u64,
		len: usize,
		stats: Arc<MappingStats>,
	) -> Result<Self, io::Error> {
		let offset_in_file = index * len as u64;
		let mapping = MmapOptions::new()
			.offset(offset_in_file)
			.len(len)
			.map_raw(file)?;
		let ptr = mapping.as_mut_ptr();
		stats.record_mapped(len as u64);
		Ok(Self {
			index,
			offset_in_file,
			len,
			ptr,
			mapping: Mutex::new(Some(mapping)),
			unmapped: AtomicBool::new(false),
			stats,
		})
	}

	#[inline]
	pub fn index(&self) -> u64 {
		self.index
	}

	#[inline]
	pub fn offset_in_file(&self) -> u64 {
		self.offset_in_file
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.len
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// The absolute byte range of the file this page covers.
	#[inline]
	pub fn range_in_file(&self) -> Range<u64> {
		self.offset_in_file..self.offset_in_file + self.len as u64
	}

	#[inline]
	pub fn is_unmapped(&self) -> bool {
		self.unmapped.load(Ordering::Acquire)
	}

	pub fn read(&self, offset: usize, buf: &mut [u8]) {
		let range = self.checked_range(offset, buf.len());
		// Safety: `range` lies within the mapping, which is still alive.
		unsafe {
			ptr::copy_nonoverlapping(self.ptr.add(range.start), buf.as_mut_ptr(), range.len());
		}
	}

	pub fn write(&self, offset: usize, buf: &[u8]) {
		let range = self.checked_range(offset, buf.len());
		// Safety: `range` lies within the mapping, which is still alive.
		unsafe {
			ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr.add(range.start), range.len());
		}
	}

	pub fn zero(&self, range: Range<usize>) {
		assert!(range.start <= range.end, "Invalid range {range:?}");
		let range = self.checked_range(range.start, range.len());
		// Safety: `range` lies within the mapping, which is still alive.
		unsafe {
			ptr::write_bytes(self.ptr.add(range.start), 0, range.len());
		}
	}

	/// Writes modified bytes of this page back to the file.
	pub fn flush(&self) -> Result<(), io::Error> {
		match &*self.mapping.lock() {
			Some(mapping) => mapping.flush(),
			None => Ok(()),
		}
	}

	/// The start of the mapped buffer.
	#[inline]
	pub fn as_ptr(&self) -> *mut u8 {
		self.ptr
	}

	/// # Safety
	/// The caller must ensure that nobody writes to the page while the
	/// returned slice is alive, and that the page is not force-unmapped.
	pub unsafe fn as_slice(&self) -> &[u8] {
		assert!(!self.is_unmapped(), "Page {} has been unmapped", self.index);
		slice::from_raw_parts(self.ptr, self.len)
	}

	/// # Safety
	/// The caller must ensure that nobody else reads or writes the page while
	/// the returned slice is alive, and that the page is not force-unmapped.
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
		assert!(!self.is_unmapped(), "Page {} has been unmapped", self.index);
		slice::from_raw_parts_mut(self.ptr, self.len)
	}

	/// Releases the mapping right now instead of when the last holder drops
	/// the page. Returns `false` if it was already released.
	///
	/// # Safety
	/// Any access to the page's memory after this call, by any thread, is a
	/// use-after-free: the caller must ensure no other owner of this page
	/// still uses it, including through pointers or slices obtained earlier.
	/// Safe accessors called afterwards panic, but a call that is already in
	/// progress on another thread cannot be stopped.
	pub unsafe fn force_unmap(&self) -> bool {
		let Some(mapping) = self.mapping.lock().take() else {
			return false;
		};
		self.unmapped.store(true, Ordering::Release);
		drop(mapping);
		self.stats.record_unmapped(self.len as u64);
		true
	}

	fn checked_range(&self, offset: usize, len: usize) -> Range<usize> {
		assert!(!self.is_unmapped(), "Page {} has been unmapped", self.index);
		assert!(
			offset <= self.len && len <= self.len - offset,
			"Access to bytes {offset}..{} is outside of page {} (size {})",
			offset.saturating_add(len),
			self.index,
			self.len
		);
		offset..offset + len
	}
}

impl Drop for Page {
	fn drop(&mut self) {
		if self.mapping.get_mut().take().is_some() {
			self.stats.record_unmapped(self.len as u64);
		}
	}
}

impl fmt::Debug for Page {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Page")
			.field("index", &self.index)
			.field("range_in_file", &self.range_in_file())
			.field("unmapped", &self.is_unmapped())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use std::fs::{self, OpenOptions};

	use tempfile::tempdir;

	use crate::{registry::StorageRegistry, utils::test_helpers::assert_zeroed};

	use super::*;

	const PAGE_SIZE: usize = 4096;

	fn file_with_pages(dir: &tempfile::TempDir, num_pages: usize) -> File {
		let path = dir.path().join("pages.bin");
		let content: Vec<u8> = (0..num_pages * PAGE_SIZE).map(|i| (i / PAGE_SIZE) as u8).collect();
		fs::write(&path, content).unwrap();
		OpenOptions::new()
			.read(true)
			.write(true)
			.open(path)
			.unwrap()
	}

	#[test]
	fn map_page_at_offset() {
		// given
		let dir = tempdir().unwrap();
		let file = file_with_pages(&dir, 3);
		let registry = StorageRegistry::new();

		// when
		let page = Page::map(&file, 2, PAGE_SIZE, registry.stats_handle()).unwrap();

		// then
		assert_eq!(page.index(), 2);
		assert_eq!(page.range_in_file(), 8192..12288);
		let mut buf = [0; 4];
		page.read(PAGE_SIZE - 4, &mut buf);
		assert_eq!(buf, [2; 4]);
	}

	#[test]
	fn write_through_to_file() {
		// given
		let dir = tempdir().unwrap();
		let file = file_with_pages(&dir, 2);
		let registry = StorageRegistry::new();
		let page = Page::map(&file, 1, PAGE_SIZE, registry.stats_handle()).unwrap();

		// when
		page.write(10, &[0xde, 0xad, 0xbe, 0xef]);
		page.flush().unwrap();

		// then
		let content = fs::read(dir.path().join("pages.bin")).unwrap();
		assert_eq!(content[PAGE_SIZE + 10..PAGE_SIZE + 14], [0xde, 0xad, 0xbe, 0xef]);
		assert_eq!(content[PAGE_SIZE + 9], 1);
	}

	#[test]
	fn zero_part_of_page() {
		let dir = tempdir().unwrap();
		let file = file_with_pages(&dir, 2);
		let registry = StorageRegistry::new();
		let page = Page::map(&file, 1, PAGE_SIZE, registry.stats_handle()).unwrap();

		page.zero(100..200);

		let mut buf = vec![0xff; PAGE_SIZE];
		page.read(0, &mut buf);
		assert_eq!(buf[..100], [1; 100]);
		assert_zeroed!(buf[100..200]);
		assert!(buf[200..].iter().all(|b| *b == 1));
	}

	#[test]
	#[should_panic(expected = "outside of page")]
	fn access_past_page_end() {
		let dir = tempdir().unwrap();
		let file = file_with_pages(&dir, 1);
		let registry = StorageRegistry::new();
		let page = Page::map(&file, 0, PAGE_SIZE, registry.stats_handle()).unwrap();

		page.write(PAGE_SIZE - 2, &[1, 2, 3]);
	}

	#[test]
	fn drop_releases_mapping() {
		let dir = tempdir().unwrap();
		let file = file_with_pages(&dir, 1);
		let registry = StorageRegistry::new();

		let page = Page::map(&file, 0, PAGE_SIZE, registry.stats_handle()).unwrap();
		assert_eq!(registry.stats().pages_currently_mapped(), 1);
		drop(page);

		assert_eq!(registry.stats().pages_currently_mapped(), 0);
		assert_eq!(registry.stats().pages_mapped(), 1);
	}

	#[test]
	fn force_unmap_releases_mapping_once() {
		// given
		let dir = tempdir().unwrap();
		let file = file_with_pages(&dir, 1);
		let registry = StorageRegistry::new();
		let page = Page::map(&file, 0, PAGE_SIZE, registry.stats_handle()).unwrap();

		// when
		let first = unsafe { page.force_unmap() };
		let second = unsafe { page.force_unmap() };

		// then
		assert!(first);
		assert!(!second);
		assert!(page.is_unmapped());
		assert_eq!(registry.stats().pages_currently_mapped(), 0);
		page.flush().unwrap();
		drop(page);
		assert_eq!(registry.stats().bytes_currently_mapped(), 0);
	}

	#[test]
	#[should_panic(expected = "has been unmapped")]
	fn read_after_force_unmap() {
		let dir = tempdir().unwrap();
		let file = file_with_pages(&dir, 1);
		let registry = StorageRegistry::new();
		let page = Page::map(&file, 0, PAGE_SIZE, registry.stats_handle()).unwrap();

		unsafe { page.force_unmap() };
		page.read(0, &mut [0; 1]);
	}
}
