//! Subscription Registry
//!
//! Process-wide table of active push subscriptions keyed by a caller-chosen string.
//! Guarantees at most one live channel per key, supports refresh-in-place and a
//! collapsed refresh-all pass, and publishes status transitions to listeners (the
//! reconnect supervisor is one of them).
//!
//! The registry never retries on its own: factory failures propagate to the caller
//! of `subscribe`/`refresh`, and backoff is layered on top through status events.
//!
//! Each channel creation gets a fresh generation number. Callbacks wired into a
//! channel carry the [`SubscriptionTicket`] they were created with and must check
//! [`SubscriptionRegistry::is_current`] before acting, so that late events from a
//! closed or replaced channel are discarded.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tandem_types::remote_adapter::{Channel, ChannelStatus};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::LiveConfig;
use crate::prelude::*;

/// Identifies one concrete channel instance behind a registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionTicket {
	pub key: Arc<str>,
	pub generation: u64,
}

/// Lifecycle status of a subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
	Connecting,
	Connected,
	Disconnected,
	Error,
}

impl SubscriptionStatus {
	/// A live handle is returned as-is by `subscribe`; anything else is recreated
	pub fn is_live(self) -> bool {
		matches!(self, SubscriptionStatus::Connecting | SubscriptionStatus::Connected)
	}
}

impl From<&ChannelStatus> for SubscriptionStatus {
	fn from(status: &ChannelStatus) -> Self {
		match status {
			ChannelStatus::Connecting => SubscriptionStatus::Connecting,
			ChannelStatus::Connected => SubscriptionStatus::Connected,
			ChannelStatus::Closed => SubscriptionStatus::Disconnected,
			ChannelStatus::Error(_) => SubscriptionStatus::Error,
		}
	}
}

/// Snapshot of a tracked subscription
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
	pub key: Arc<str>,
	pub status: SubscriptionStatus,
	pub created_at: Instant,
	pub last_refreshed_at: Instant,
	/// Last status report or delivered event
	pub last_activity_at: Instant,
	pub reconnect_attempts: u32,
	pub generation: u64,
}

pub type ChannelFactory =
	Arc<dyn Fn(&SubscriptionTicket) -> ClResult<Arc<dyn Channel>> + Send + Sync>;
pub type CleanupFn = Box<dyn FnOnce() + Send>;

/// Notifications published to registry listeners
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
	StatusChanged { ticket: SubscriptionTicket, status: ChannelStatus },
	Refreshed { ticket: SubscriptionTicket },
	/// The factory failed while recreating the channel; the handle is in Error
	RefreshFailed { ticket: SubscriptionTicket, error: String, transient: bool },
	Removed { key: Arc<str> },
}

pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

struct Entry {
	handle: SubscriptionHandle,
	/// `None` while the factory for the current generation is running
	channel: Option<Arc<dyn Channel>>,
	factory: ChannelFactory,
	cleanups: Vec<CleanupFn>,
}

/// Resets the refresh-all reentrancy flag when the pass ends
struct RefreshAllGuard<'a>(&'a AtomicBool);

impl Drop for RefreshAllGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

pub struct SubscriptionRegistry {
	entries: Mutex<HashMap<Arc<str>, Entry>>,
	listeners: Mutex<Vec<RegistryListener>>,
	next_generation: AtomicU64,
	refreshing_all: AtomicBool,
	last_refresh_all: Mutex<Option<Instant>>,
	visibility_task: Mutex<Option<JoinHandle<()>>>,
	config: LiveConfig,
}

impl SubscriptionRegistry {
	/// Create an empty registry. Fails if `config` does not validate.
	pub fn new(config: LiveConfig) -> ClResult<Arc<Self>> {
		config.validate()?;
		Ok(Arc::new(Self {
			entries: Mutex::new(HashMap::new()),
			listeners: Mutex::new(Vec::new()),
			next_generation: AtomicU64::new(0),
			refreshing_all: AtomicBool::new(false),
			last_refresh_all: Mutex::new(None),
			visibility_task: Mutex::new(None),
			config,
		}))
	}

	pub fn config(&self) -> &LiveConfig {
		&self.config
	}

	/// Register a listener for status/refresh/removal events.
	///
	/// Listeners run synchronously on the reporting thread, outside the registry lock.
	pub fn add_listener<F>(&self, listener: F)
	where
		F: Fn(&RegistryEvent) + Send + Sync + 'static,
	{
		self.listeners.lock().push(Arc::new(listener));
	}

	fn emit(&self, event: &RegistryEvent) {
		let listeners: Vec<RegistryListener> = self.listeners.lock().clone();
		for listener in listeners {
			listener(event);
		}
	}

	fn next_ticket(&self, key: &Arc<str>) -> SubscriptionTicket {
		let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
		SubscriptionTicket { key: key.clone(), generation }
	}

	/// Return the channel for `key`, creating it with `factory` unless a live one exists.
	///
	/// A live handle (Connecting or Connected) is returned unchanged and `factory` is not
	/// invoked. A handle in Error or Disconnected state is replaced. Factory errors are
	/// returned as-is.
	pub fn subscribe<F>(&self, key: &str, factory: F) -> ClResult<Arc<dyn Channel>>
	where
		F: Fn(&SubscriptionTicket) -> ClResult<Arc<dyn Channel>> + Send + Sync + 'static,
	{
		let key: Arc<str> = Arc::from(key);
		let factory: ChannelFactory = Arc::new(factory);

		let (ticket, replaced) = {
			let mut entries = self.entries.lock();
			if let Some(entry) = entries.get(&key)
				&& entry.handle.status.is_live()
			{
				return entry.channel.clone().ok_or_else(|| {
					Error::Internal(format!("subscription {} is still being created", key))
				});
			}

			let ticket = self.next_ticket(&key);
			let now = Instant::now();
			let placeholder = Entry {
				handle: SubscriptionHandle {
					key: key.clone(),
					status: SubscriptionStatus::Connecting,
					created_at: now,
					last_refreshed_at: now,
					last_activity_at: now,
					reconnect_attempts: 0,
					generation: ticket.generation,
				},
				channel: None,
				factory: factory.clone(),
				cleanups: Vec::new(),
			};
			(ticket, entries.insert(key.clone(), placeholder))
		};

		let result = factory(&ticket);

		let mut to_close: Vec<Arc<dyn Channel>> = Vec::new();
		let outcome = {
			let mut entries = self.entries.lock();
			let current =
				entries.get(&key).is_some_and(|entry| entry.handle.generation == ticket.generation);
			match result {
				Ok(channel) if current => {
					if let Some(entry) = entries.get_mut(&key) {
						entry.channel = Some(channel.clone());
						if let Some(mut old) = replaced {
							entry.cleanups.append(&mut old.cleanups);
							to_close.extend(old.channel);
						}
					}
					Ok(channel)
				}
				Ok(channel) => {
					// Unsubscribed or replaced while the factory ran
					to_close.push(channel);
					to_close.extend(replaced.and_then(|old| old.channel));
					Err(Error::ChannelClosed)
				}
				Err(err) => {
					match replaced {
						Some(old) if current => {
							entries.insert(key.clone(), old);
						}
						Some(old) => to_close.extend(old.channel),
						None if current => {
							entries.remove(&key);
						}
						None => {}
					}
					Err(err)
				}
			}
		};

		for channel in &to_close {
			close_channel(&key, channel);
		}

		match &outcome {
			Ok(_) => debug!(key = %key, generation = ticket.generation, "subscribed"),
			Err(err) => warn!(key = %key, error = %err, "subscription factory failed"),
		}
		outcome
	}

	/// Close and remove the subscription for `key`, then run its cleanup callbacks.
	///
	/// Close errors are logged, not returned. Returns whether the key was tracked.
	pub fn unsubscribe(&self, key: &str) -> bool {
		let Some(entry) = self.entries.lock().remove(key) else {
			return false;
		};

		if let Some(channel) = &entry.channel {
			close_channel(key, channel);
		}
		for cleanup in entry.cleanups {
			cleanup();
		}
		debug!(key = %key, "unsubscribed");
		self.emit(&RegistryEvent::Removed { key: entry.handle.key });
		true
	}

	/// Close and recreate the channel for `key` with its stored factory.
	///
	/// Resets `reconnect_attempts` and `last_refreshed_at`. No-op for unknown keys;
	/// returns whether a channel was recreated.
	pub fn refresh(&self, key: &str) -> ClResult<bool> {
		let (ticket, factory, old_channel) = {
			let mut entries = self.entries.lock();
			let Some(entry) = entries.get_mut(key) else {
				return Ok(false);
			};
			let ticket = self.next_ticket(&entry.handle.key);
			let now = Instant::now();
			entry.handle.generation = ticket.generation;
			entry.handle.status = SubscriptionStatus::Connecting;
			entry.handle.reconnect_attempts = 0;
			entry.handle.last_refreshed_at = now;
			entry.handle.last_activity_at = now;
			(ticket, entry.factory.clone(), entry.channel.take())
		};

		if let Some(channel) = old_channel {
			close_channel(key, &channel);
		}

		let result = factory(&ticket);

		let (orphan, current) = {
			let mut entries = self.entries.lock();
			match entries.get_mut(key) {
				Some(entry) if entry.handle.generation == ticket.generation => match &result {
					Ok(channel) => {
						entry.channel = Some(channel.clone());
						(None, true)
					}
					Err(_) => {
						entry.handle.status = SubscriptionStatus::Error;
						(None, true)
					}
				},
				_ => (result.as_ref().ok().cloned(), false),
			}
		};
		if let Some(channel) = orphan {
			close_channel(key, &channel);
		}

		match result {
			Ok(_) => {
				debug!(key = %key, generation = ticket.generation, "subscription refreshed");
				self.emit(&RegistryEvent::Refreshed { ticket });
				Ok(true)
			}
			Err(err) => {
				warn!(key = %key, error = %err, "subscription refresh failed");
				if current {
					self.emit(&RegistryEvent::RefreshFailed {
						ticket,
						error: err.to_string(),
						transient: err.is_transient(),
					});
				}
				Err(err)
			}
		}
	}

	/// Refresh every tracked key.
	///
	/// Concurrent calls collapse into the pass already running (returning 0). Iterates
	/// a snapshot of the keys, so handlers may subscribe/unsubscribe meanwhile.
	/// Returns the number of keys refreshed successfully; failures are logged.
	pub fn refresh_all(&self) -> usize {
		if self.refreshing_all.swap(true, Ordering::AcqRel) {
			debug!("refresh-all already running");
			return 0;
		}
		let _guard = RefreshAllGuard(&self.refreshing_all);

		let keys = self.keys();
		info!(count = keys.len(), "refreshing all subscriptions");
		let mut refreshed = 0;
		for key in keys {
			match self.refresh(&key) {
				Ok(true) => refreshed += 1,
				Ok(false) => debug!(key = %key, "refresh-all: key removed during pass"),
				Err(err) => warn!(key = %key, error = %err, "refresh-all: key failed"),
			}
		}
		*self.last_refresh_all.lock() = Some(Instant::now());
		refreshed
	}

	/// Record a status transition reported by the channel behind `ticket`.
	///
	/// Reports from superseded generations are ignored. Returns whether the report
	/// was accepted.
	pub fn report_status(&self, ticket: &SubscriptionTicket, status: ChannelStatus) -> bool {
		{
			let mut entries = self.entries.lock();
			match entries.get_mut(&ticket.key) {
				Some(entry) if entry.handle.generation == ticket.generation => {
					entry.handle.status = SubscriptionStatus::from(&status);
					entry.handle.last_activity_at = Instant::now();
				}
				_ => {
					debug!(key = %ticket.key, generation = ticket.generation, status = ?status, "stale status report ignored");
					return false;
				}
			}
		}

		match &status {
			ChannelStatus::Error(msg) => {
				warn!(key = %ticket.key, error = %msg, "subscription channel error");
			}
			status => debug!(key = %ticket.key, status = ?status, "subscription status"),
		}
		self.emit(&RegistryEvent::StatusChanged { ticket: ticket.clone(), status });
		true
	}

	/// Whether `ticket` still names the current channel of a tracked key
	pub fn is_current(&self, ticket: &SubscriptionTicket) -> bool {
		self.entries
			.lock()
			.get(&ticket.key)
			.is_some_and(|entry| entry.handle.generation == ticket.generation)
	}

	/// Note activity (a delivered event) on the channel behind `ticket`.
	pub fn touch(&self, ticket: &SubscriptionTicket) -> bool {
		let mut entries = self.entries.lock();
		match entries.get_mut(&ticket.key) {
			Some(entry) if entry.handle.generation == ticket.generation => {
				entry.handle.last_activity_at = Instant::now();
				true
			}
			_ => false,
		}
	}

	/// Mark `key` as permanently disconnected (reconnect attempts exhausted).
	pub fn mark_disconnected(&self, key: &str) {
		if let Some(entry) = self.entries.lock().get_mut(key) {
			entry.handle.status = SubscriptionStatus::Disconnected;
		}
	}

	/// Mirror the supervisor's attempt counter into the handle
	pub fn set_reconnect_attempts(&self, key: &str, attempts: u32) {
		if let Some(entry) = self.entries.lock().get_mut(key) {
			entry.handle.reconnect_attempts = attempts;
		}
	}

	/// Register a callback run once when `key` is unsubscribed.
	///
	/// Returns false (and drops the callback) if the key is not tracked.
	pub fn on_cleanup<F>(&self, key: &str, cleanup: F) -> bool
	where
		F: FnOnce() + Send + 'static,
	{
		match self.entries.lock().get_mut(key) {
			Some(entry) => {
				entry.cleanups.push(Box::new(cleanup));
				true
			}
			None => false,
		}
	}

	pub fn handle(&self, key: &str) -> Option<SubscriptionHandle> {
		self.entries.lock().get(key).map(|entry| entry.handle.clone())
	}

	pub fn status(&self, key: &str) -> Option<SubscriptionStatus> {
		self.entries.lock().get(key).map(|entry| entry.handle.status)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.entries.lock().contains_key(key)
	}

	/// Tracked keys, sorted
	pub fn keys(&self) -> Vec<Arc<str>> {
		let mut keys: Vec<Arc<str>> = self.entries.lock().keys().cloned().collect();
		keys.sort();
		keys
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	/// Unsubscribe every key (process teardown).
	pub fn close_all(&self) {
		for key in self.keys() {
			self.unsubscribe(&key);
		}
	}

	/// Decide whether a "became visible" signal at `now` warrants a global refresh.
	///
	/// True when the last global refresh is older than `refresh_all_min_interval_ms`
	/// (or never happened) and at least one of the first `stale_sample_size` handles
	/// has been untouched for longer than `stale_threshold_ms`.
	pub fn should_refresh_on_visible(&self, now: Instant) -> bool {
		if let Some(last) = *self.last_refresh_all.lock()
			&& now.saturating_duration_since(last) < self.config.refresh_all_min_interval()
		{
			return false;
		}

		let stale_threshold = self.config.stale_threshold();
		let entries = self.entries.lock();
		let mut keys: Vec<&Arc<str>> = entries.keys().collect();
		keys.sort();
		keys.into_iter().take(self.config.stale_sample_size).any(|key| {
			entries.get(key).is_some_and(|entry| {
				now.saturating_duration_since(entry.handle.last_activity_at) > stale_threshold
			})
		})
	}

	/// Host signal: the application became visible again.
	///
	/// Debounced by `visibility_debounce_ms`; a burst of signals results in at most
	/// one check and at most one `refresh_all`.
	pub fn notify_visible(self: &Arc<Self>) {
		let registry: Weak<Self> = Arc::downgrade(self);
		let debounce = self.config.visibility_debounce();
		let task = tokio::spawn(async move {
			tokio::time::sleep(debounce).await;
			let Some(registry) = registry.upgrade() else {
				return;
			};
			if registry.should_refresh_on_visible(Instant::now()) {
				info!("stale subscriptions after becoming visible, refreshing all");
				registry.refresh_all();
			} else {
				debug!("visible again, subscriptions fresh");
			}
		});

		if let Some(previous) = self.visibility_task.lock().replace(task) {
			previous.abort();
		}
	}
}

impl Drop for SubscriptionRegistry {
	fn drop(&mut self) {
		if let Some(task) = self.visibility_task.get_mut().take() {
			task.abort();
		}
		for (key, entry) in self.entries.get_mut().drain() {
			if let Some(channel) = &entry.channel {
				close_channel(&key, channel);
			}
		}
	}
}

impl std::fmt::Debug for SubscriptionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SubscriptionRegistry").field("keys", &self.keys()).finish_non_exhaustive()
	}
}

fn close_channel(key: &str, channel: &Arc<dyn Channel>) {
	if let Err(err) = channel.close() {
		warn!(key = %key, topic = %channel.topic(), error = %err, "failed to close channel");
	}
}


// vim: ts=4
