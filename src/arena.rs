//! Stable-slot interning arena for directories and strings

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Interns values under a derived key, handing out small stable integers
/// ("slots") that records can embed instead of duplicating the value.
///
/// Slot 0 is permanently reserved as the null slot and is never assigned.
/// Removed slots are reused by later insertions: insertion scans upward from
/// a rolling high-water mark for the lowest free slot, and removal rewinds
/// the mark so the freed slot is found first. Slots stay valid until
/// explicitly removed, which makes them safe to persist inside records.
///
/// The arena is shared between the indexing pipeline and read-side
/// consumers; all operations take one internal lock.
pub struct SlotArena<T, Q> {
	key_of: fn(&T) -> Q,
	inner: Mutex<Inner<T, Q>>,
}

struct Inner<T, Q> {
	slots: Vec<Option<T>>,
	reverse: HashMap<Q, u32>,
	high_water: usize,
	count: usize,
}

impl<T: Clone, Q: Hash + Eq> SlotArena<T, Q> {
	pub fn new(key_of: fn(&T) -> Q) -> Self {
		let arena = Self {
			key_of,
			inner: Mutex::new(Inner {
				slots: Vec::new(),
				reverse: HashMap::new(),
				high_water: 1,
				count: 0,
			}),
		};
		arena.set_all(Vec::new());
		arena
	}

	/// Bulk-replace the arena contents, e.g. when loading a persisted
	/// snapshot. Element 0 must be empty; anything else is a caller bug.
	pub fn set_all(&self, mut values: Vec<Option<T>>) {
		if values.is_empty() {
			values = vec![None];
		}
		assert!(values[0].is_none(), "slot 0 is reserved");

		let mut reverse = HashMap::with_capacity(values.len() + 10);
		for (i, value) in values.iter().enumerate() {
			if let Some(value) = value {
				reverse.insert((self.key_of)(value), i as u32);
			}
		}

		let mut inner = self.inner.lock().unwrap();
		inner.count = values.len();
		inner.slots = values;
		inner.reverse = reverse;
		inner.high_water = 1;
	}

	/// Return the slot already interning this value's key, or assign the
	/// lowest free slot at or above the high-water mark.
	pub fn intern(&self, value: T) -> u32 {
		let key = (self.key_of)(&value);
		let mut inner = self.inner.lock().unwrap();

		if let Some(&slot) = inner.reverse.get(&key) {
			return slot;
		}

		let mut idx = inner.high_water;
		while idx < inner.slots.len() && inner.slots[idx].is_some() {
			idx += 1;
		}
		inner.high_water = idx;

		if inner.slots.len() <= idx {
			let grown = (inner.slots.len() * 2).max(32);
			inner.slots.resize_with(grown, || None);
		}

		inner.slots[idx] = Some(value);
		inner.reverse.insert(key, idx as u32);
		inner.count = inner.count.max(idx + 1);

		idx as u32
	}

	/// Look up the slot for a value without inserting.
	pub fn lookup(&self, value: &T) -> Option<u32> {
		let key = (self.key_of)(value);
		self.inner.lock().unwrap().reverse.get(&key).copied()
	}

	/// Clear a slot and make it available for reuse. Removing the reserved
	/// slot 0, or a slot that is already empty, is a caller bug.
	pub fn remove(&self, slot: u32) {
		assert!(slot != 0, "slot 0 is reserved");

		let mut inner = self.inner.lock().unwrap();
		let value = inner.slots[slot as usize]
			.take()
			.expect("removing an empty slot");
		let key = (self.key_of)(&value);
		inner.reverse.remove(&key);
		inner.high_water = inner.high_water.min(slot as usize);
	}

	pub fn get(&self, slot: u32) -> Option<T> {
		let inner = self.inner.lock().unwrap();
		inner.slots.get(slot as usize).and_then(|v| v.clone())
	}

	/// Snapshot the arena as a dense vector suitable for persisting; the
	/// reserved slot 0 is included as `None`.
	pub fn to_vec(&self) -> Vec<Option<T>> {
		let inner = self.inner.lock().unwrap();
		inner.slots[..inner.count].to_vec()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().count
	}

	pub fn is_empty(&self) -> bool {
		self.len() <= 1
	}
}
