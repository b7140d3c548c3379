use std::{
	collections::TryReserveError,
	sync::{Arc, OnceLock},
};

use super::page::Page;

const MIN_TABLE_LEN: usize = 16;

/// An append-only table of page slots.
///
/// A slot moves from empty to one specific page exactly once and never
/// changes after that, so a page read from a slot can be handed out without
/// holding any lock. Growing the table creates a new, larger table sharing
/// the already published pages; the storage swaps it in atomically.
pub(super) struct PageTable {
	slots: Box<[OnceLock<Arc<Page>>]>,
}

impl PageTable {
	pub fn empty() -> Self {
		Self { slots: Box::new([]) }
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.slots.len()
	}

	#[inline]
	pub fn get(&self, index: usize) -> Option<&Arc<Page>> {
		self.slots.get(index)?.get()
	}

	/// A copy of this table that has a slot for `index`. Fails instead of
	/// aborting if the slots cannot be allocated.
	pub fn try_grown_to_fit(&self, index: usize) -> Result<Self, TryReserveError> {
		debug_assert!(index >= self.len());
		let new_len = index
			.saturating_add(1)
			.max(self.len().saturating_mul(2))
			.max(MIN_TABLE_LEN);
		let mut slots: Vec<OnceLock<Arc<Page>>> = Vec::new();
		slots.try_reserve_exact(new_len)?;
		slots.extend(self.slots.iter().cloned());
		slots.resize_with(new_len, OnceLock::new);
		Ok(Self {
			slots: slots.into_boxed_slice(),
		})
	}

	/// Publishes `page` in its slot. Must only be called by the owner of the
	/// storage lock, for a slot that is still empty.
	pub fn publish(&self, index: usize, page: Arc<Page>) {
		let result = self.slots[index].set(page);
		assert!(result.is_ok(), "Page {index} was published twice");
	}

	pub fn pages(&self) -> impl Iterator<Item = &Arc<Page>> + '_ {
		self.slots.iter().filter_map(OnceLock::get)
	}
}
