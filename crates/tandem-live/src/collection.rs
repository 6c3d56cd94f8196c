//! Live Collection
//!
//! Generic merge-and-order engine: folds an at-least-once, possibly reordered
//! stream of row changes into a deduplicated list kept in comparator order.
//!
//! - at most one item per key
//! - `snapshot()` is always sorted by the comparator
//! - events without a key are dropped with a warning

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Debug;
use std::hash::Hash;
use tandem_types::remote_adapter::{ChangeEvent, ChangeOp};

use crate::prelude::*;

pub type KeyFn<T, K> = Box<dyn Fn(&T) -> Option<K> + Send + Sync>;
pub type CompareFn<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

pub struct LiveCollection<T, K> {
	items: Vec<T>,
	key_of: KeyFn<T, K>,
	cmp: CompareFn<T>,
}

impl<T, K> LiveCollection<T, K>
where
	T: Clone + PartialEq,
	K: Eq + Hash + Debug,
{
	/// Create an empty collection.
	///
	/// `cmp` must be a total order; use a unique field (the row id) as the last
	/// tiebreak so items created in the same millisecond keep a stable order.
	pub fn new<F, C>(key_of: F, cmp: C) -> Self
	where
		F: Fn(&T) -> Option<K> + Send + Sync + 'static,
		C: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
	{
		Self { items: Vec::new(), key_of: Box::new(key_of), cmp: Box::new(cmp) }
	}

	/// Replace the contents wholesale (initial fetch or resync).
	///
	/// Duplicate keys keep the last occurrence; items without a key are dropped.
	/// Each item is keyed once, then the result is sorted once.
	pub fn seed<I>(&mut self, initial: I)
	where
		I: IntoIterator<Item = T>,
	{
		let initial = initial.into_iter();
		let mut items: Vec<T> = Vec::with_capacity(initial.size_hint().0);
		let mut index: HashMap<K, usize> = HashMap::with_capacity(items.capacity());
		let mut dropped = 0usize;
		for item in initial {
			let Some(key) = (self.key_of)(&item) else {
				dropped += 1;
				continue;
			};
			match index.entry(key) {
				Entry::Occupied(slot) => items[*slot.get()] = item,
				Entry::Vacant(slot) => {
					slot.insert(items.len());
					items.push(item);
				}
			}
		}
		let cmp = &self.cmp;
		items.sort_by(|a, b| cmp(a, b));
		self.items = items;
		if dropped > 0 {
			warn!(dropped, "seed rows without a key were dropped");
		}
	}

	/// Apply one change event. Returns whether the visible contents changed.
	///
	/// Insert of a known key acts as Update, Update of an unknown key acts as
	/// Insert, Delete of an unknown key is a no-op.
	pub fn merge(&mut self, event: ChangeEvent<T>) -> bool {
		let Some(key) = (self.key_of)(&event.payload) else {
			warn!(op = %event.operation, "change event without a key dropped");
			return false;
		};

		match event.operation {
			ChangeOp::Insert | ChangeOp::Update => self.upsert(&key, event.payload),
			ChangeOp::Delete => match self.position_of(&key) {
				Some(idx) => {
					self.items.remove(idx);
					true
				}
				None => {
					debug!(key = ?key, "delete for unknown key ignored");
					false
				}
			},
		}
	}

	fn upsert(&mut self, key: &K, item: T) -> bool {
		if let Some(idx) = self.position_of(key) {
			if self.items[idx] == item {
				return false;
			}
			if self.fits_at(idx, &item) {
				self.items[idx] = item;
				return true;
			}
			// Sort position moved
			self.items.remove(idx);
		}
		let cmp = &self.cmp;
		let pos = self.items.partition_point(|existing| cmp(existing, &item) != Ordering::Greater);
		self.items.insert(pos, item);
		true
	}

	/// Whether `item` can replace the element at `idx` without breaking the order
	fn fits_at(&self, idx: usize, item: &T) -> bool {
		let after_prev =
			idx == 0 || (self.cmp)(&self.items[idx - 1], item) != Ordering::Greater;
		let before_next = self
			.items
			.get(idx + 1)
			.is_none_or(|next| (self.cmp)(item, next) != Ordering::Greater);
		after_prev && before_next
	}

	fn position_of(&self, key: &K) -> Option<usize> {
		self.items.iter().position(|item| (self.key_of)(item).as_ref() == Some(key))
	}

	/// Current contents in sorted order
	pub fn snapshot(&self) -> Vec<T> {
		self.items.clone()
	}

	pub fn items(&self) -> &[T] {
		&self.items
	}

	pub fn get(&self, key: &K) -> Option<&T> {
		self.position_of(key).map(|idx| &self.items[idx])
	}

	pub fn contains_key(&self, key: &K) -> bool {
		self.position_of(key).is_some()
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}
}

impl<T: Debug, K> Debug for LiveCollection<T, K> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LiveCollection").field("items", &self.items).finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use serde_json::{Value, json};
	use std::collections::HashSet;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
	use tandem_types::utils::row_key;

	fn rows() -> LiveCollection<Value, String> {
		LiveCollection::new(
			|row: &Value| row_key(row, "id"),
			|a: &Value, b: &Value| {
				a["ts"].as_i64().cmp(&b["ts"].as_i64()).then_with(|| a["id"].as_i64().cmp(&b["id"].as_i64()))
			},
		)
	}

	fn ids(collection: &LiveCollection<Value, String>) -> Vec<i64> {
		collection.items().iter().filter_map(|row| row["id"].as_i64()).collect()
	}

	#[test]
	fn test_conversation_scenario() {
		let mut c = rows();
		c.seed(vec![json!({ "id": 1, "ts": 100 }), json!({ "id": 2, "ts": 200 })]);

		assert!(c.merge(ChangeEvent::insert(json!({ "id": 3, "ts": 150 }))));
		assert_eq!(ids(&c), vec![1, 3, 2]);

		assert!(c.merge(ChangeEvent::update(json!({ "id": 1, "ts": 100, "content": "edited" }))));
		assert_eq!(ids(&c), vec![1, 3, 2]);
		assert_eq!(c.items()[0]["content"], "edited");

		assert!(c.merge(ChangeEvent::delete(json!({ "id": 2 }))));
		assert_eq!(
			c.snapshot(),
			vec![json!({ "id": 1, "ts": 100, "content": "edited" }), json!({ "id": 3, "ts": 150 })]
		);
	}

	#[test]
	fn test_duplicate_insert_acts_as_update() {
		let mut c = rows();
		assert!(c.merge(ChangeEvent::insert(json!({ "id": 1, "ts": 10 }))));
		assert!(!c.merge(ChangeEvent::insert(json!({ "id": 1, "ts": 10 }))));
		assert!(c.merge(ChangeEvent::insert(json!({ "id": 1, "ts": 10, "is_read": true }))));
		assert_eq!(c.len(), 1);
		assert_eq!(c.get(&"1".to_string()).unwrap()["is_read"], true);
	}

	#[test]
	fn test_update_of_unknown_key_inserts() {
		let mut c = rows();
		c.seed(vec![json!({ "id": 1, "ts": 10 })]);
		assert!(c.merge(ChangeEvent::update(json!({ "id": 2, "ts": 5 }))));
		assert_eq!(ids(&c), vec![2, 1]);
	}

	#[test]
	fn test_update_moving_sort_position() {
		let mut c = rows();
		c.seed(vec![json!({ "id": 1, "ts": 10 }), json!({ "id": 2, "ts": 20 }), json!({ "id": 3, "ts": 30 })]);
		assert!(c.merge(ChangeEvent::update(json!({ "id": 1, "ts": 25 }))));
		assert_eq!(ids(&c), vec![2, 1, 3]);
	}

	#[test]
	fn test_delete_unknown_is_noop() {
		let mut c = rows();
		c.seed(vec![json!({ "id": 1, "ts": 10 })]);
		assert!(!c.merge(ChangeEvent::delete(json!({ "id": 9 }))));
		assert_eq!(c.len(), 1);
	}

	#[test]
	fn test_event_without_key_is_dropped() {
		let mut c = rows();
		assert!(!c.merge(ChangeEvent::insert(json!({ "ts": 10 }))));
		assert!(!c.merge(ChangeEvent::insert(json!({ "id": null, "ts": 10 }))));
		assert!(c.is_empty());
	}

	#[test]
	fn test_seed_dedups_and_sorts() {
		let mut c = rows();
		c.seed(vec![
			json!({ "id": 2, "ts": 20 }),
			json!({ "id": 1, "ts": 10 }),
			json!({ "id": 2, "ts": 5 }),
			json!({ "ts": 1 }),
		]);
		assert_eq!(ids(&c), vec![2, 1]);
		assert_eq!(c.items()[0]["ts"], 5);
	}

	#[test]
	fn test_seed_keys_each_row_once() {
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		let mut c: LiveCollection<(i64, i64), i64> = LiveCollection::new(
			move |row: &(i64, i64)| {
				counter.fetch_add(1, AtomicOrdering::Relaxed);
				Some(row.0)
			},
			|a: &(i64, i64), b: &(i64, i64)| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)),
		);

		let n = 20_000i64;
		// every id twice, newest copy last
		c.seed((0..n).map(|id| (id, n - id)).chain((0..n).map(|id| (id, id))));

		assert_eq!(calls.load(AtomicOrdering::Relaxed), 2 * n as usize);
		assert_eq!(c.len(), n as usize);
		assert!(c.items().windows(2).all(|pair| pair[0].1 < pair[1].1));
		assert_eq!(c.items()[0], (0, 0));
	}

	#[derive(Debug, Clone)]
	enum Op {
		Insert(i64, i64),
		Update(i64, i64),
		Delete(i64),
	}

	fn op_strategy() -> impl Strategy<Value = Op> {
		prop_oneof![
			(0i64..8, 0i64..20).prop_map(|(id, ts)| Op::Insert(id, ts)),
			(0i64..8, 0i64..20).prop_map(|(id, ts)| Op::Update(id, ts)),
			(0i64..8).prop_map(Op::Delete),
		]
	}

	proptest! {
		#[test]
		fn prop_unique_keys_and_sorted(
			seed in proptest::collection::vec((0i64..8, 0i64..20), 0..8),
			ops in proptest::collection::vec(op_strategy(), 0..64),
		) {
			let mut c = rows();
			c.seed(seed.into_iter().map(|(id, ts)| json!({ "id": id, "ts": ts })));
			for op in ops {
				let event = match op {
					Op::Insert(id, ts) => ChangeEvent::insert(json!({ "id": id, "ts": ts })),
					Op::Update(id, ts) => ChangeEvent::update(json!({ "id": id, "ts": ts })),
					Op::Delete(id) => ChangeEvent::delete(json!({ "id": id })),
				};
				c.merge(event);

				let ids = ids(&c);
				let unique: HashSet<i64> = ids.iter().copied().collect();
				prop_assert_eq!(unique.len(), ids.len());

				let items = c.items();
				for pair in items.windows(2) {
					prop_assert_ne!((c.cmp)(&pair[0], &pair[1]), Ordering::Greater);
				}
			}
		}

		#[test]
		fn prop_merge_order_does_not_matter_for_final_state(
			events in proptest::collection::vec((0i64..6, 0i64..20), 1..24),
		) {
			// Inserts/updates of distinct final values converge regardless of order
			let mut forward = rows();
			let mut backward = rows();
			let mut last: std::collections::HashMap<i64, i64> = std::collections::HashMap::new();
			for (id, ts) in &events {
				last.insert(*id, *ts);
			}
			for (id, ts) in &last {
				forward.merge(ChangeEvent::insert(json!({ "id": id, "ts": ts })));
			}
			for (id, ts) in last.iter().collect::<Vec<_>>().into_iter().rev() {
				backward.merge(ChangeEvent::update(json!({ "id": id, "ts": ts })));
			}
			prop_assert_eq!(forward.snapshot(), backward.snapshot());
		}
	}
}

// vim: ts=4
