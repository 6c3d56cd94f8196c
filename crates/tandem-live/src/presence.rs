//! Presence Tracker
//!
//! Maintains the set of identities currently present on a presence channel.
//! Full-state sync is the only update path: join/leave deltas can be missed while
//! reconnecting, so they are logged and otherwise ignored.
//!
//! The local announcement is remembered and re-sent after every transition to
//! Connected, since presence state does not survive a channel recreation.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tandem_types::remote_adapter::{
	Channel, ChannelStatus, PresenceChannel, PresenceHandlers, PresenceState, RemoteAdapter,
};
use tokio::sync::watch;

use crate::prelude::*;
use crate::registry::{SubscriptionRegistry, SubscriptionTicket};

pub type OnlineSet = BTreeSet<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceOptions {
	/// Presence channel name
	pub channel: String,
	/// Meta field carrying the identity; presence keys are used when `None`
	pub identity_field: Option<String>,
}

impl PresenceOptions {
	pub fn new(channel: impl Into<String>) -> Self {
		Self { channel: channel.into(), identity_field: None }
	}

	pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
		self.identity_field = Some(field.into());
		self
	}

	/// Registry key of the channel
	pub fn key(&self) -> String {
		format!("presence:{}", self.channel)
	}
}

struct PresenceInner {
	key: Arc<str>,
	options: PresenceOptions,
	registry: Arc<SubscriptionRegistry>,
	remote: Arc<dyn RemoteAdapter>,
	channel: Mutex<Option<(u64, Arc<dyn PresenceChannel>)>>,
	payload: Mutex<Option<Value>>,
	online: watch::Sender<Arc<OnlineSet>>,
}

impl PresenceInner {
	fn open_channel(self: &Arc<Self>, ticket: &SubscriptionTicket) -> ClResult<Arc<dyn Channel>> {
		let weak: Weak<Self> = Arc::downgrade(self);
		let on_sync = {
			let (weak, ticket) = (weak.clone(), ticket.clone());
			move |state: PresenceState| {
				if let Some(inner) = weak.upgrade()
					&& inner.registry.touch(&ticket)
				{
					inner.sync(&state);
				}
			}
		};
		let on_join = {
			let key = self.key.clone();
			move |presence_key: &str, metas: &[Value]| {
				debug!(key = %key, presence_key = %presence_key, metas = metas.len(), "presence join");
			}
		};
		let on_leave = {
			let key = self.key.clone();
			move |presence_key: &str, metas: &[Value]| {
				debug!(key = %key, presence_key = %presence_key, metas = metas.len(), "presence leave");
			}
		};
		let on_status = {
			let (weak, ticket) = (weak, ticket.clone());
			move |status: ChannelStatus| {
				if let Some(inner) = weak.upgrade() {
					inner.on_status(&ticket, status);
				}
			}
		};

		let handlers = PresenceHandlers {
			on_sync: Arc::new(on_sync),
			on_join: Arc::new(on_join),
			on_leave: Arc::new(on_leave),
			on_status: Arc::new(on_status),
		};
		let channel = self.remote.presence_channel(&self.options.channel, handlers)?;
		*self.channel.lock() = Some((ticket.generation, channel.clone()));
		let channel: Arc<dyn Channel> = channel;
		Ok(channel)
	}

	fn on_status(&self, ticket: &SubscriptionTicket, status: ChannelStatus) {
		let connected = status == ChannelStatus::Connected;
		if !self.registry.report_status(ticket, status) || !connected {
			return;
		}
		let Some(payload) = self.payload.lock().clone() else {
			return;
		};
		let Some(channel) = self.channel_for(ticket.generation) else {
			return;
		};
		let Ok(runtime) = tokio::runtime::Handle::try_current() else {
			warn!(key = %self.key, "no runtime available to re-announce presence");
			return;
		};

		let key = self.key.clone();
		runtime.spawn(async move {
			match channel.track(payload).await {
				Ok(()) => debug!(key = %key, "presence re-announced"),
				Err(err) => warn!(key = %key, error = %err, "presence re-announce failed"),
			}
		});
	}

	fn channel_for(&self, generation: u64) -> Option<Arc<dyn PresenceChannel>> {
		match &*self.channel.lock() {
			Some((current, channel)) if *current == generation => Some(channel.clone()),
			_ => None,
		}
	}

	fn current_channel(&self) -> Option<Arc<dyn PresenceChannel>> {
		self.channel.lock().as_ref().map(|(_, channel)| channel.clone())
	}

	fn identities(&self, state: &PresenceState) -> OnlineSet {
		match &self.options.identity_field {
			None => state.iter().filter(|(_, metas)| !metas.is_empty()).map(|(key, _)| key.clone()).collect(),
			Some(field) => state
				.values()
				.flatten()
				.filter_map(|meta| match meta.get(field.as_str()) {
					Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
					Some(Value::Number(id)) => Some(id.to_string()),
					_ => None,
				})
				.collect(),
		}
	}

	fn sync(&self, state: &PresenceState) {
		let online = self.identities(state);
		debug!(key = %self.key, online = online.len(), "presence sync");
		self.online.send_if_modified(|current| {
			if **current == online {
				return false;
			}
			*current = Arc::new(online);
			true
		});
	}
}

/// Tracks who is online on one presence channel
pub struct PresenceTracker {
	inner: Arc<PresenceInner>,
}

impl PresenceTracker {
	/// Subscribe to the presence channel described by `options`.
	pub fn join(
		registry: &Arc<SubscriptionRegistry>,
		remote: Arc<dyn RemoteAdapter>,
		options: PresenceOptions,
	) -> ClResult<Self> {
		if registry.contains(&options.key()) {
			return Err(Error::Factory(format!("presence channel {} is already joined", options.channel)));
		}

		let (online, _) = watch::channel(Arc::new(OnlineSet::new()));
		let inner = Arc::new(PresenceInner {
			key: Arc::from(options.key()),
			options,
			registry: registry.clone(),
			remote,
			channel: Mutex::new(None),
			payload: Mutex::new(None),
			online,
		});

		let weak: Weak<PresenceInner> = Arc::downgrade(&inner);
		registry.subscribe(&inner.key, move |ticket: &SubscriptionTicket| {
			let inner = weak.upgrade().ok_or(Error::ChannelClosed)?;
			inner.open_channel(ticket)
		})?;
		info!(key = %inner.key, "joined presence channel");
		Ok(Self { inner })
	}

	/// Apply an authoritative full-state sync
	pub fn on_sync(&self, state: &PresenceState) {
		self.inner.sync(state);
	}

	/// Advisory only: never changes the online set
	pub fn on_join(&self, presence_key: &str, metas: &[Value]) {
		debug!(key = %self.inner.key, presence_key = %presence_key, metas = metas.len(), "presence join");
	}

	/// Advisory only: never changes the online set
	pub fn on_leave(&self, presence_key: &str, metas: &[Value]) {
		debug!(key = %self.inner.key, presence_key = %presence_key, metas = metas.len(), "presence leave");
	}

	/// Announce local presence; remembered and re-announced after reconnects.
	pub async fn track(&self, payload: Value) -> ClResult<()> {
		*self.inner.payload.lock() = Some(payload.clone());
		let channel = self.inner.current_channel().ok_or(Error::ChannelClosed)?;
		channel.track(payload).await
	}

	/// Withdraw local presence and stop re-announcing it. The channel stays open.
	pub async fn untrack(&self) -> ClResult<()> {
		*self.inner.payload.lock() = None;
		match self.inner.current_channel() {
			Some(channel) => channel.untrack().await,
			None => Ok(()),
		}
	}

	/// Withdraw local presence, then unsubscribe the channel.
	///
	/// An untrack failure is logged; the channel is released regardless.
	pub async fn leave(&self) -> ClResult<()> {
		if let Err(err) = self.untrack().await {
			warn!(key = %self.inner.key, error = %err, "presence untrack failed");
		}
		self.release();
		Ok(())
	}

	fn release(&self) {
		self.inner.channel.lock().take();
		if self.inner.registry.unsubscribe(&self.inner.key) {
			info!(key = %self.inner.key, "left presence channel");
		}
	}

	pub fn online(&self) -> Arc<OnlineSet> {
		self.inner.online.borrow().clone()
	}

	pub fn is_online(&self, identity: &str) -> bool {
		self.inner.online.borrow().contains(identity)
	}

	/// Receiver notified whenever the online set changes
	pub fn changes(&self) -> watch::Receiver<Arc<OnlineSet>> {
		self.inner.online.subscribe()
	}

	pub fn key(&self) -> &str {
		&self.inner.key
	}
}

/// Dropping an announced tracker withdraws the announcement in the background
/// and unsubscribes once the untrack completes.
impl Drop for PresenceTracker {
	fn drop(&mut self) {
		let Some(channel) = self.inner.current_channel() else {
			return;
		};
		let announced = self.inner.payload.lock().take().is_some();
		if announced {
			match tokio::runtime::Handle::try_current() {
				Ok(runtime) => {
					self.inner.channel.lock().take();
					let registry = self.inner.registry.clone();
					let key = self.inner.key.clone();
					runtime.spawn(async move {
						if let Err(err) = channel.untrack().await {
							warn!(key = %key, error = %err, "presence untrack failed");
						}
						if registry.unsubscribe(&key) {
							info!(key = %key, "left presence channel");
						}
					});
					return;
				}
				Err(_) => warn!(key = %self.inner.key, "no runtime available to withdraw presence"),
			}
		}
		self.release();
	}
}

impl std::fmt::Debug for PresenceTracker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PresenceTracker").field("key", &self.inner.key).finish_non_exhaustive()
	}
}


// vim: ts=4
