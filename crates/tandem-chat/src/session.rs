//! Chat session: the live components of one signed-in user

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tandem_live::{
	LiveConfig, PresenceOptions, PresenceTracker, ReconnectSupervisor, SubscriptionRegistry,
	UnreadSource, UnreadTracker,
};
use tandem_types::remote_adapter::RemoteAdapter;

use crate::feed::ConversationFeed;
use crate::notification::NotificationFeed;
use crate::outbox::Outbox;
use crate::prelude::*;

/// Presence field carrying the user id, so several devices of one user count once
pub const PRESENCE_IDENTITY_FIELD: &str = "user_id";

pub struct ChatState {
	pub me: String,
	pub remote: Arc<dyn RemoteAdapter>,
	pub registry: Arc<SubscriptionRegistry>,
	pub supervisor: Arc<ReconnectSupervisor>,
	pub unread: Arc<UnreadTracker>,
	pub outbox: Outbox,
	/// Joined presence channels, withdrawn on shutdown
	presence: Mutex<Vec<Weak<PresenceTracker>>>,
}

pub type ChatSession = Arc<ChatState>;

impl ChatState {
	/// Wire up registry, supervisor, unread tracker and outbox for `me`.
	pub fn new(remote: Arc<dyn RemoteAdapter>, me: &str, config: LiveConfig) -> ClResult<ChatSession> {
		let registry = SubscriptionRegistry::new(config)?;
		let supervisor = ReconnectSupervisor::attach(&registry);
		let unread = Arc::new(UnreadTracker::new(remote.clone(), me, UnreadSource::default()));
		let outbox = Outbox::new(remote.clone(), me);
		info!(user = %me, "chat session started");
		Ok(Arc::new(Self {
			me: me.into(),
			remote,
			registry,
			supervisor,
			unread,
			outbox,
			presence: Mutex::new(Vec::new()),
		}))
	}

	pub async fn open_conversation(&self, conversation: &str) -> ClResult<ConversationFeed> {
		ConversationFeed::open(&self.registry, self.remote.clone(), self.unread.clone(), conversation).await
	}

	pub async fn open_notifications(&self) -> ClResult<NotificationFeed> {
		NotificationFeed::open(&self.registry, self.remote.clone(), &self.me).await
	}

	/// Join a presence channel, identifying users by their user id.
	///
	/// Call [`PresenceTracker::track`] to appear online.
	pub fn join_presence(&self, channel: &str) -> ClResult<Arc<PresenceTracker>> {
		let options = PresenceOptions::new(channel).with_identity_field(PRESENCE_IDENTITY_FIELD);
		let tracker = Arc::new(PresenceTracker::join(&self.registry, self.remote.clone(), options)?);
		let mut joined = self.presence.lock();
		joined.retain(|tracker| tracker.strong_count() > 0);
		joined.push(Arc::downgrade(&tracker));
		Ok(tracker)
	}

	/// Recompute unread badges from the server
	pub async fn refresh_unread(&self) -> ClResult<()> {
		self.unread.refresh().await
	}

	/// The app came back to the foreground
	pub fn on_visible(&self) {
		self.registry.notify_visible();
	}

	/// Manual "tap to reconnect" for one subscription
	pub fn reconnect(&self, key: &str) -> ClResult<bool> {
		self.supervisor.reconnect_now(key)
	}

	/// Withdraw presence announcements, then close every subscription
	pub async fn shutdown(&self) {
		let trackers: Vec<Arc<PresenceTracker>> =
			self.presence.lock().drain(..).filter_map(|tracker| tracker.upgrade()).collect();
		for tracker in &trackers {
			if let Err(err) = tracker.untrack().await {
				warn!(key = %tracker.key(), error = %err, "presence untrack failed on shutdown");
			}
		}
		let subscriptions = self.registry.len();
		self.registry.close_all();
		info!(user = %self.me, subscriptions, "chat session closed");
	}
}

impl std::fmt::Debug for ChatState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChatState").field("me", &self.me).finish_non_exhaustive()
	}
}

// vim: ts=4
