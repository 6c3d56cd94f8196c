//! Live View
//!
//! Binds a [`LiveCollection`] to a registry key and a table + filter of the remote
//! service. The view subscribes first and seeds second: events delivered while a
//! seed (or a later resync) is in flight are buffered and replayed on top of the
//! fetched rows, so nothing committed between the fetch and the subscription is
//! lost. Every transition to Connected on a recreated channel triggers a resync,
//! covering whatever was missed while disconnected.
//!
//! Snapshots are published through a `tokio::sync::watch` channel.

use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use tandem_types::remote_adapter::{
	ChangeEvent, ChangeHandlers, ChangeOp, Channel, ChannelStatus, QueryFilter, QueryOptions,
	RemoteAdapter,
};
use tandem_types::types::Row;
use tokio::sync::watch;

use crate::collection::LiveCollection;
use crate::prelude::*;
use crate::registry::{SubscriptionRegistry, SubscriptionTicket};

/// A row type a [`LiveView`] can hold
pub trait LiveRecord: Clone + PartialEq + Send + Sync + 'static {
	/// Decode a raw row. Failures are treated as malformed events.
	fn decode(row: Row) -> ClResult<Self>;

	/// Identity used for deduplication; `None` marks the row as malformed
	fn record_key(&self) -> Option<String>;

	/// Total order of the view
	fn compare(&self, other: &Self) -> Ordering;
}

/// Deserialize a row, mapping failures to [`Error::MalformedEvent`]
pub fn decode_row<T: DeserializeOwned>(row: Row) -> ClResult<T> {
	serde_json::from_value(row).map_err(|err| Error::MalformedEvent(err.to_string()))
}

/// Called for every pushed Insert that added a new item (not for seeded rows)
pub type InsertHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Called with the full contents after every successful resync (not the initial
/// seed). Runs with the view locked: it must not call back into the view.
pub type ResyncHook<T> = Arc<dyn Fn(&[T]) + Send + Sync>;

/// Optional callbacks of a [`LiveView`]
pub struct ViewHooks<T> {
	pub on_insert: Option<InsertHook<T>>,
	pub on_resync: Option<ResyncHook<T>>,
}

impl<T> Default for ViewHooks<T> {
	fn default() -> Self {
		Self { on_insert: None, on_resync: None }
	}
}

impl<T> ViewHooks<T> {
	pub fn on_insert<F>(mut self, hook: F) -> Self
	where
		F: Fn(&T) + Send + Sync + 'static,
	{
		self.on_insert = Some(Arc::new(hook));
		self
	}

	pub fn on_resync<F>(mut self, hook: F) -> Self
	where
		F: Fn(&[T]) + Send + Sync + 'static,
	{
		self.on_resync = Some(Arc::new(hook));
		self
	}
}

/// What triggered a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadCause {
	Open,
	Resync,
	/// Channel recreated with this generation
	Reconnect(u64),
}

/// What a view subscribes to
#[derive(Debug, Clone)]
pub struct ViewSpec {
	pub key: String,
	pub table: String,
	pub filter: QueryFilter,
	pub limit: Option<u32>,
}

impl ViewSpec {
	pub fn new(key: impl Into<String>, table: impl Into<String>) -> Self {
		Self { key: key.into(), table: table.into(), filter: QueryFilter::new(), limit: None }
	}

	pub fn with_filter(mut self, filter: QueryFilter) -> Self {
		self.filter = filter;
		self
	}

	pub fn with_limit(mut self, limit: u32) -> Self {
		self.limit = Some(limit);
		self
	}
}

struct ViewState<T> {
	collection: LiveCollection<T, String>,
	loading: bool,
	load_epoch: u64,
	buffered: Vec<ChangeEvent<T>>,
	/// Channel generation whose contents the collection reflects
	synced_generation: u64,
}

impl<T> ViewState<T> {
	fn begin_load(&mut self) -> u64 {
		self.loading = true;
		self.load_epoch += 1;
		self.load_epoch
	}
}

struct ViewInner<T> {
	spec: ViewSpec,
	remote: Arc<dyn RemoteAdapter>,
	registry: Arc<SubscriptionRegistry>,
	state: parking_lot::Mutex<ViewState<T>>,
	snapshots: watch::Sender<Arc<Vec<T>>>,
	hooks: ViewHooks<T>,
	closed: AtomicBool,
}

impl<T: LiveRecord> ViewInner<T> {
	fn open_channel(self: &Arc<Self>, ticket: &SubscriptionTicket) -> ClResult<Arc<dyn Channel>> {
		{
			let mut state = self.state.lock();
			if state.synced_generation == 0 {
				// Covered by the initial seed
				state.synced_generation = ticket.generation;
			}
		}

		let on_event = {
			let inner: Weak<Self> = Arc::downgrade(self);
			let ticket = ticket.clone();
			move |event: ChangeEvent| {
				if let Some(inner) = inner.upgrade() {
					inner.on_event(&ticket, event);
				}
			}
		};
		let on_status = {
			let inner: Weak<Self> = Arc::downgrade(self);
			let ticket = ticket.clone();
			move |status: ChannelStatus| {
				if let Some(inner) = inner.upgrade() {
					inner.on_status(&ticket, status);
				}
			}
		};

		self.remote.subscribe_changes(
			&self.spec.table,
			self.spec.filter.clone(),
			ChangeHandlers::new(on_event, on_status),
		)
	}

	fn on_event(&self, ticket: &SubscriptionTicket, event: ChangeEvent) {
		if !self.registry.touch(ticket) {
			debug!(key = %ticket.key, generation = ticket.generation, "event from stale channel dropped");
			return;
		}

		let event = match event.try_map(T::decode) {
			Ok(event) => event,
			Err(err) => {
				warn!(key = %ticket.key, error = %err, "malformed change event dropped");
				return;
			}
		};

		let mut state = self.state.lock();
		if state.loading {
			state.buffered.push(event);
			return;
		}
		let inserted = self.new_insert(&state.collection, &event);
		if state.collection.merge(event) {
			self.publish(&state.collection);
		}
		drop(state);
		self.notify_inserted(inserted);
	}

	fn new_insert(&self, collection: &LiveCollection<T, String>, event: &ChangeEvent<T>) -> Option<T> {
		if self.hooks.on_insert.is_none() || event.operation != ChangeOp::Insert {
			return None;
		}
		let key = event.payload.record_key()?;
		(!collection.contains_key(&key)).then(|| event.payload.clone())
	}

	fn notify_inserted<I: IntoIterator<Item = T>>(&self, items: I) {
		if let Some(hook) = &self.hooks.on_insert {
			for item in items {
				hook(&item);
			}
		}
	}

	fn on_status(self: &Arc<Self>, ticket: &SubscriptionTicket, status: ChannelStatus) {
		let connected = status == ChannelStatus::Connected;
		if !self.registry.report_status(ticket, status) || !connected {
			return;
		}

		let epoch = {
			let mut state = self.state.lock();
			if state.synced_generation == ticket.generation {
				return;
			}
			state.begin_load()
		};

		let Ok(runtime) = tokio::runtime::Handle::try_current() else {
			warn!(key = %ticket.key, "no runtime available for resync");
			self.state.lock().loading = false;
			return;
		};
		info!(key = %ticket.key, generation = ticket.generation, "channel recreated, resyncing");
		let inner = self.clone();
		let generation = ticket.generation;
		runtime.spawn(async move {
			let _ = inner.load(epoch, LoadCause::Reconnect(generation)).await;
		});
	}

	/// Fetch the rows and reseed, then replay buffered events.
	///
	/// A load superseded by a newer one leaves the state to its successor. After a
	/// successful resync the resync hook sees the final contents, buffered events
	/// included, so those are not reported to the insert hook again.
	async fn load(&self, epoch: u64, cause: LoadCause) -> ClResult<()> {
		let mut opts = QueryOptions::new().with_filter(self.spec.filter.clone());
		if let Some(limit) = self.spec.limit {
			opts = opts.with_limit(limit);
		}
		let result = self.remote.query(&self.spec.table, opts).await;

		let mut state = self.state.lock();
		if state.load_epoch != epoch {
			debug!(key = %self.spec.key, "superseded load discarded");
			return result.map(|_| ());
		}

		let outcome = match result {
			Ok(rows) => {
				let key = &self.spec.key;
				let items = rows.into_iter().filter_map(|row| match T::decode(row) {
					Ok(item) => Some(item),
					Err(err) => {
						warn!(key = %key, error = %err, "malformed row skipped");
						None
					}
				});
				state.collection.seed(items);
				if let LoadCause::Reconnect(generation) = cause {
					state.synced_generation = generation;
				}
				debug!(key = %self.spec.key, rows = state.collection.len(), "view seeded");
				Ok(())
			}
			Err(err) => {
				warn!(key = %self.spec.key, error = %err, "view seed failed");
				Err(err)
			}
		};

		state.loading = false;
		let mut inserted = Vec::new();
		for event in std::mem::take(&mut state.buffered) {
			inserted.extend(self.new_insert(&state.collection, &event));
			state.collection.merge(event);
		}
		self.publish(&state.collection);
		if outcome.is_ok()
			&& cause != LoadCause::Open
			&& let Some(hook) = &self.hooks.on_resync
		{
			hook(state.collection.items());
			inserted.clear();
		}
		drop(state);
		self.notify_inserted(inserted);
		outcome
	}

	fn publish(&self, collection: &LiveCollection<T, String>) {
		self.snapshots.send_replace(Arc::new(collection.snapshot()));
	}

	fn close(&self) {
		if !self.closed.swap(true, AtomicOrdering::AcqRel) {
			self.registry.unsubscribe(&self.spec.key);
		}
	}
}

/// A live, sorted, deduplicated view over a remote table
pub struct LiveView<T: LiveRecord> {
	inner: Arc<ViewInner<T>>,
}

impl<T: LiveRecord> LiveView<T> {
	/// Subscribe to `spec`, then seed it from a query.
	///
	/// Fails if the key is already tracked by the registry or the seed query fails
	/// (the subscription is released in that case).
	pub async fn open(
		registry: &Arc<SubscriptionRegistry>,
		remote: Arc<dyn RemoteAdapter>,
		spec: ViewSpec,
	) -> ClResult<Self> {
		Self::open_with_hooks(registry, remote, spec, ViewHooks::default()).await
	}

	/// Like [`LiveView::open`], calling `on_insert` for every newly pushed item.
	pub async fn open_with_insert_hook<F>(
		registry: &Arc<SubscriptionRegistry>,
		remote: Arc<dyn RemoteAdapter>,
		spec: ViewSpec,
		on_insert: F,
	) -> ClResult<Self>
	where
		F: Fn(&T) + Send + Sync + 'static,
	{
		Self::open_with_hooks(registry, remote, spec, ViewHooks::default().on_insert(on_insert)).await
	}

	/// Like [`LiveView::open`], with insert and resync callbacks.
	pub async fn open_with_hooks(
		registry: &Arc<SubscriptionRegistry>,
		remote: Arc<dyn RemoteAdapter>,
		spec: ViewSpec,
		hooks: ViewHooks<T>,
	) -> ClResult<Self> {
		if registry.contains(&spec.key) {
			return Err(Error::Factory(format!("key {} is already subscribed", spec.key)));
		}

		let collection = LiveCollection::new(T::record_key, |a: &T, b: &T| a.compare(b));
		let (snapshots, _) = watch::channel(Arc::new(Vec::new()));
		let inner = Arc::new(ViewInner {
			spec,
			remote,
			registry: registry.clone(),
			state: parking_lot::Mutex::new(ViewState {
				collection,
				loading: false,
				load_epoch: 0,
				buffered: Vec::new(),
				synced_generation: 0,
			}),
			snapshots,
			hooks,
			closed: AtomicBool::new(false),
		});

		let epoch = inner.state.lock().begin_load();
		let weak: Weak<ViewInner<T>> = Arc::downgrade(&inner);
		registry.subscribe(&inner.spec.key, move |ticket: &SubscriptionTicket| {
			let inner = weak.upgrade().ok_or(Error::ChannelClosed)?;
			inner.open_channel(ticket)
		})?;

		let view = Self { inner };
		if let Err(err) = view.inner.load(epoch, LoadCause::Open).await {
			view.close();
			return Err(err);
		}
		Ok(view)
	}

	pub fn key(&self) -> &str {
		&self.inner.spec.key
	}

	/// Latest published snapshot
	pub fn snapshot(&self) -> Arc<Vec<T>> {
		self.inner.snapshots.borrow().clone()
	}

	/// Receiver notified on every visible change
	pub fn watch(&self) -> watch::Receiver<Arc<Vec<T>>> {
		self.inner.snapshots.subscribe()
	}

	pub fn get(&self, key: &str) -> Option<T> {
		self.inner.state.lock().collection.get(&key.to_string()).cloned()
	}

	pub fn is_loading(&self) -> bool {
		self.inner.state.lock().loading
	}

	/// Merge a locally produced event (e.g. a confirmed send) as if it was pushed.
	///
	/// Buffered while a load is in flight. Returns whether the view changed.
	pub fn apply(&self, event: ChangeEvent<T>) -> bool {
		let mut state = self.inner.state.lock();
		if state.loading {
			state.buffered.push(event);
			return false;
		}
		let changed = state.collection.merge(event);
		if changed {
			self.inner.publish(&state.collection);
		}
		changed
	}

	/// Refetch and reseed now.
	pub async fn resync(&self) -> ClResult<()> {
		let epoch = self.inner.state.lock().begin_load();
		self.inner.load(epoch, LoadCause::Resync).await
	}

	/// Unsubscribe the key. Also done on drop.
	pub fn close(&self) {
		self.inner.close();
	}
}

impl<T: LiveRecord> Drop for LiveView<T> {
	fn drop(&mut self) {
		self.inner.close();
	}
}

impl<T: LiveRecord> std::fmt::Debug for LiveView<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LiveView").field("key", &self.inner.spec.key).finish_non_exhaustive()
	}
}


// vim: ts=4
