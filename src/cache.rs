//! Bounded key/value cache with batched least-recently-touched eviction

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

struct Entry<V> {
	value: V,
	touched: u64,
}

struct Inner<K, V> {
	map: HashMap<K, Entry<V>>,
	limit: usize,
	tick: u64,
}

/// A bounded cache for decoded thumbnails and similar expensive values.
///
/// `get` refreshes the entry's last-touched ordering. When an insert pushes
/// the cache past its limit, the oldest `ceil(len / 8)` entries (at least
/// one) are evicted in one batch, which amortizes the sort over many
/// inserts. An optional disposal hook receives every value the cache lets
/// go of (evicted, replaced or cleared) so callers can release external
/// resources exactly once. All operations hold the same lock for their full
/// duration; the hook performs non-idempotent release, so a double call
/// must be impossible.
pub struct EvictionCache<K, V> {
	inner: Mutex<Inner<K, V>>,
	on_evict: Option<Box<dyn Fn(V) + Send + Sync>>,
}

impl<K: Hash + Eq + Clone, V: Clone> EvictionCache<K, V> {
	pub fn new(limit: usize) -> Self {
		Self {
			inner: Mutex::new(Inner {
				map: HashMap::new(),
				limit,
				tick: 0,
			}),
			on_evict: None,
		}
	}

	/// Install the disposal hook invoked with every released value.
	pub fn with_eviction_hook<F>(mut self, hook: F) -> Self
	where
		F: Fn(V) + Send + Sync + 'static,
	{
		self.on_evict = Some(Box::new(hook));
		self
	}

	fn dispose(&self, value: V) {
		if let Some(hook) = &self.on_evict {
			hook(value);
		}
	}

	pub fn get(&self, key: &K) -> Option<V> {
		let mut inner = self.inner.lock().unwrap();
		inner.tick += 1;
		let tick = inner.tick;
		inner.map.get_mut(key).map(|entry| {
			entry.touched = tick;
			entry.value.clone()
		})
	}

	pub fn put(&self, key: K, value: V) {
		let mut inner = self.inner.lock().unwrap();
		inner.tick += 1;
		let entry = Entry {
			value,
			touched: inner.tick,
		};

		if let Some(old) = inner.map.insert(key, entry) {
			self.dispose(old.value);
		}

		if inner.map.len() > inner.limit {
			let to_remove = ((inner.map.len() + 7) / 8).max(1);
			let mut by_age: Vec<(u64, K)> = inner
				.map
				.iter()
				.map(|(k, e)| (e.touched, k.clone()))
				.collect();
			by_age.sort_by_key(|(touched, _)| *touched);

			for (_, key) in by_age.into_iter().take(to_remove) {
				if let Some(entry) = inner.map.remove(&key) {
					self.dispose(entry.value);
				}
			}
		}
	}

	/// Drop an entry without invoking the disposal hook; the caller takes
	/// over ownership of the value.
	pub fn remove(&self, key: &K) -> Option<V> {
		let mut inner = self.inner.lock().unwrap();
		inner.map.remove(key).map(|e| e.value)
	}

	pub fn clear(&self) {
		let mut inner = self.inner.lock().unwrap();
		for (_, entry) in inner.map.drain() {
			self.dispose(entry.value);
		}
	}

	pub fn contains(&self, key: &K) -> bool {
		self.inner.lock().unwrap().map.contains_key(key)
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn limit(&self) -> usize {
		self.inner.lock().unwrap().limit
	}

	/// Raise or lower the capacity; takes effect on the next insert.
	pub fn set_limit(&self, limit: usize) {
		self.inner.lock().unwrap().limit = limit;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	#[test]
	fn test_get_refreshes_entry() {
		let cache: EvictionCache<u32, String> = EvictionCache::new(4);
		for i in 0..4 {
			cache.put(i, format!("v{i}"));
		}

		// touch the oldest entry so it survives the next eviction
		assert_eq!(cache.get(&0).as_deref(), Some("v0"));
		cache.put(4, "v4".to_string());

		assert!(cache.contains(&0));
		assert!(!cache.contains(&1)); // 1 became the oldest
	}

	#[test]
	fn test_eviction_batch_size() {
		let limit = 8;
		let evicted = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&evicted);
		let cache: EvictionCache<u32, u32> =
			EvictionCache::new(limit).with_eviction_hook(move |_| {
				counter.fetch_add(1, Ordering::SeqCst);
			});

		for i in 0..=limit as u32 {
			cache.put(i, i);
		}

		// 9 entries over a limit of 8: at least ceil(9/8) = 2 evictions
		let removed = evicted.load(Ordering::SeqCst);
		assert!(removed >= 2, "expected at least 2 evictions, got {removed}");
		assert_eq!(cache.len(), limit + 1 - removed);
		// the least recently touched entry was among the victims
		assert!(!cache.contains(&0));
	}

	#[test]
	fn test_replace_disposes_old_value() {
		let evicted = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&evicted);
		let cache: EvictionCache<u32, String> =
			EvictionCache::new(8).with_eviction_hook(move |_| {
				counter.fetch_add(1, Ordering::SeqCst);
			});

		cache.put(1, "old".to_string());
		cache.put(1, "new".to_string());

		assert_eq!(evicted.load(Ordering::SeqCst), 1);
		assert_eq!(cache.get(&1).as_deref(), Some("new"));
	}

	#[test]
	fn test_clear_disposes_everything() {
		let evicted = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&evicted);
		let cache: EvictionCache<u32, u32> =
			EvictionCache::new(8).with_eviction_hook(move |_| {
				counter.fetch_add(1, Ordering::SeqCst);
			});

		for i in 0..5 {
			cache.put(i, i);
		}
		cache.clear();

		assert_eq!(evicted.load(Ordering::SeqCst), 5);
		assert!(cache.is_empty());
	}

	#[test]
	fn test_remove_skips_hook() {
		let evicted = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&evicted);
		let cache: EvictionCache<u32, u32> =
			EvictionCache::new(8).with_eviction_hook(move |_| {
				counter.fetch_add(1, Ordering::SeqCst);
			});

		cache.put(1, 10);
		assert_eq!(cache.remove(&1), Some(10));
		assert_eq!(evicted.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn test_limit_is_mutable() {
		let cache: EvictionCache<u32, u32> = EvictionCache::new(2);
		cache.set_limit(100);
		for i in 0..50 {
			cache.put(i, i);
		}
		assert_eq!(cache.len(), 50);
	}
}
