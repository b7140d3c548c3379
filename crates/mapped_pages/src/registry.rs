//! Process-wide bookkeeping for mapped storages.
//!
//! A [`StorageRegistry`] is owned by whoever embeds the storages and is handed
//! to the [`MappedStorageFactory`](crate::MappedStorageFactory). All storages
//! opened through the same registry share the single-owner check and the
//! mapping statistics.

use std::{
	collections::HashSet,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use log::warn;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::{
	consts::DEFAULT_PAGES_TO_WARN_THRESHOLD, storage::StorageError, utils::units::display_size,
};

pub struct StorageRegistry {
	open_paths: Mutex<HashSet<PathBuf>>,
	stats: Arc<MappingStats>,
}

assert_impl_all!(StorageRegistry: Send, Sync);

impl StorageRegistry {
	pub fn new() -> Arc<Self> {
		Self::with_page_warn_threshold(DEFAULT_PAGES_TO_WARN_THRESHOLD)
	}

	pub fn with_page_warn_threshold(pages_to_warn_threshold: u64) -> Arc<Self> {
		Arc::new(Self {
			open_paths: Mutex::new(HashSet::new()),
			stats: Arc::new(MappingStats::new(pages_to_warn_threshold)),
		})
	}

	#[inline]
	pub fn stats(&self) -> &MappingStats {
		&self.stats
	}

	pub fn open_storages_count(&self) -> usize {
		self.open_paths.lock().len()
	}

	pub fn is_open(&self, path: &Path) -> bool {
		self.open_paths.lock().contains(path)
	}

	/// Claims `path` for a new storage. Fails if another live storage owns it.
	pub(crate) fn register(self: &Arc<Self>, path: &Path) -> Result<Registration, StorageError> {
		let mut open_paths = self.open_paths.lock();
		if !open_paths.insert(path.to_path_buf()) {
			return Err(StorageError::AlreadyOpen(path.to_path_buf()));
		}
		Ok(Registration {
			registry: Arc::clone(self),
			path: path.to_path_buf(),
		})
	}

	pub(crate) fn stats_handle(&self) -> Arc<MappingStats> {
		Arc::clone(&self.stats)
	}

	fn unregister(&self, path: &Path) {
		let removed = self.open_paths.lock().remove(path);
		debug_assert!(removed, "{} was not registered", path.display());
	}
}

/// Ownership of a path in a [`StorageRegistry`]; released on drop.
pub(crate) struct Registration {
	registry: Arc<StorageRegistry>,
	path: PathBuf,
}

impl Registration {
	#[inline]
	pub fn path(&self) -> &Path {
		&self.path
	}

	#[inline]
	pub fn registry(&self) -> &Arc<StorageRegistry> {
		&self.registry
	}
}

impl Drop for Registration {
	fn drop(&mut self) {
		self.registry.unregister(&self.path);
	}
}

/// Counters describing the memory mappings created through a registry.
#[derive(Debug)]
pub struct MappingStats {
	pages_mapped: AtomicU64,
	bytes_mapped: AtomicU64,
	pages_currently_mapped: AtomicU64,
	bytes_currently_mapped: AtomicU64,
	map_time_nanos: AtomicU64,
	pages_to_warn_threshold: u64,
}

impl MappingStats {
	fn new(pages_to_warn_threshold: u64) -> Self {
		Self {
			pages_mapped: AtomicU64::new(0),
			bytes_mapped: AtomicU64::new(0),
			pages_currently_mapped: AtomicU64::new(0),
			bytes_currently_mapped: AtomicU64::new(0),
			map_time_nanos: AtomicU64::new(0),
			pages_to_warn_threshold,
		}
	}

	/// Total number of pages ever mapped.
	#[inline]
	pub fn pages_mapped(&self) -> u64 {
		self.pages_mapped.load(Ordering::Relaxed)
	}

	/// Total number of bytes ever mapped.
	#[inline]
	pub fn bytes_mapped(&self) -> u64 {
		self.bytes_mapped.load(Ordering::Relaxed)
	}

	#[inline]
	pub fn pages_currently_mapped(&self) -> u64 {
		self.pages_currently_mapped.load(Ordering::Relaxed)
	}

	#[inline]
	pub fn bytes_currently_mapped(&self) -> u64 {
		self.bytes_currently_mapped.load(Ordering::Relaxed)
	}

	/// Time spent zeroing and mapping new pages, summed over all threads.
	#[inline]
	pub fn time_spent_mapping(&self) -> Duration {
		Duration::from_nanos(self.map_time_nanos.load(Ordering::Relaxed))
	}

	#[inline]
	pub fn pages_to_warn_threshold(&self) -> u64 {
		self.pages_to_warn_threshold
	}

	pub(crate) fn record_mapped(&self, page_size: u64) {
		self.pages_mapped.fetch_add(1, Ordering::Relaxed);
		self.bytes_mapped.fetch_add(page_size, Ordering::Relaxed);
		let bytes_now = self
			.bytes_currently_mapped
			.fetch_add(page_size, Ordering::Relaxed)
			+ page_size;
		let pages_now = self.pages_currently_mapped.fetch_add(1, Ordering::Relaxed) + 1;
		if pages_now == self.pages_to_warn_threshold + 1 {
			warn!(
				"{pages_now} pages ({}) are mapped at the same time, more than the threshold of {}; \
				 the OS limit on memory mappings may be hit soon",
				display_size(bytes_now),
				self.pages_to_warn_threshold
			);
		}
	}

	pub(crate) fn record_map_time(&self, elapsed: Duration) {
		self.map_time_nanos.fetch_add(
			u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
			Ordering::Relaxed,
		);
	}

	pub(crate) fn record_unmapped(&self, page_size: u64) {
		self.pages_currently_mapped.fetch_sub(1, Ordering::Relaxed);
		self.bytes_currently_mapped
			.fetch_sub(page_size, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use log::Level;

	use crate::utils::test_helpers::{capture_logs, logged};

	use super::*;

	#[test]
	fn register_path_once() {
		// given
		let registry = StorageRegistry::new();
		let path = Path::new("/tmp/pages.bin");

		// when
		let registration = registry.register(path).unwrap();

		// then
		assert_eq!(registration.path(), path);
		assert!(registry.is_open(path));
		assert_eq!(registry.open_storages_count(), 1);
		assert!(matches!(
			registry.register(path),
			Err(StorageError::AlreadyOpen(p)) if p == path
		));
	}

	#[test]
	fn dropping_registration_releases_path() {
		let registry = StorageRegistry::new();
		let path = Path::new("/tmp/pages.bin");

		let registration = registry.register(path).unwrap();
		drop(registration);

		assert!(!registry.is_open(path));
		assert_eq!(registry.open_storages_count(), 0);
		registry.register(path).unwrap();
	}

	#[test]
	fn registries_are_independent() {
		let first = StorageRegistry::new();
		let second = StorageRegistry::new();
		let path = Path::new("/tmp/pages.bin");

		let _a = first.register(path).unwrap();
		let _b = second.register(path).unwrap();

		assert!(first.is_open(path));
		assert!(second.is_open(path));
	}

	#[test]
	fn track_mapped_pages() {
		// given
		let stats = MappingStats::new(10);

		// when
		stats.record_mapped(4096);
		stats.record_map_time(Duration::from_millis(2));
		stats.record_mapped(4096);
		stats.record_map_time(Duration::from_millis(3));
		stats.record_unmapped(4096);

		// then
		assert_eq!(stats.pages_mapped(), 2);
		assert_eq!(stats.bytes_mapped(), 8192);
		assert_eq!(stats.pages_currently_mapped(), 1);
		assert_eq!(stats.bytes_currently_mapped(), 4096);
		assert_eq!(stats.time_spent_mapping(), Duration::from_millis(5));
	}

	#[test]
	fn warn_once_when_crossing_threshold() {
		// given
		capture_logs();
		let registry = StorageRegistry::with_page_warn_threshold(2);
		let stats = registry.stats();

		// when
		stats.record_mapped(4096);
		stats.record_mapped(4096);

		// then
		assert!(logged(Level::Warn).is_empty());

		// when
		stats.record_mapped(4096);

		// then
		let warnings = logged(Level::Warn);
		assert_eq!(warnings.len(), 1);
		assert!(warnings[0].starts_with("3 pages (12 KiB) are mapped"));

		// when
		stats.record_mapped(4096);
		stats.record_unmapped(4096);
		stats.record_mapped(4096);

		// then
		assert_eq!(logged(Level::Warn).len(), 1);
	}
}
