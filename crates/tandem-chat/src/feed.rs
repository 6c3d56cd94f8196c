//! Conversation feed: the live message list of one conversation

use std::sync::Arc;
use tandem_live::{LiveView, SubscriptionRegistry, UnreadTracker, ViewHooks, ViewSpec};
use tandem_types::remote_adapter::{QueryFilter, RemoteAdapter};
use tokio::sync::watch;

use crate::message::{MESSAGES_TABLE, Message};
use crate::prelude::*;

/// Registry key of a conversation's message feed
pub fn conversation_key(conversation: &str) -> String {
	format!("messages:{}", conversation)
}

pub struct ConversationFeed {
	conversation: String,
	view: LiveView<Message>,
	unread: Arc<UnreadTracker>,
}

impl ConversationFeed {
	/// Subscribe to `conversation` and load its history.
	///
	/// Pushed inserts from the other party that are not yet read bump the unread
	/// counter of the conversation. Every resync (reconnect or manual) recounts it
	/// from the reloaded history, picking up messages missed while disconnected.
	pub async fn open(
		registry: &Arc<SubscriptionRegistry>,
		remote: Arc<dyn RemoteAdapter>,
		unread: Arc<UnreadTracker>,
		conversation: &str,
	) -> ClResult<Self> {
		let spec = ViewSpec::new(conversation_key(conversation), MESSAGES_TABLE)
			.with_filter(QueryFilter::equals_one("conversation_id", conversation));

		let counter = unread.clone();
		let recounter = unread.clone();
		let key = conversation.to_string();
		let hooks = ViewHooks::default()
			.on_insert(move |message: &Message| {
				counter.record_incoming(&message.conversation_id, !message.is_from(counter.me()), message.is_read);
			})
			.on_resync(move |messages: &[Message]| {
				let me = recounter.me();
				let count = messages.iter().filter(|message| !message.is_from(me) && !message.is_read).count();
				recounter.reconcile_conversation(&key, u32::try_from(count).unwrap_or(u32::MAX));
			});
		let view = LiveView::open_with_hooks(registry, remote, spec, hooks).await?;

		info!(conversation = %conversation, messages = view.snapshot().len(), "conversation opened");
		Ok(Self { conversation: conversation.into(), view, unread })
	}

	pub fn conversation(&self) -> &str {
		&self.conversation
	}

	pub fn key(&self) -> &str {
		self.view.key()
	}

	/// Messages, oldest first
	pub fn messages(&self) -> Arc<Vec<Message>> {
		self.view.snapshot()
	}

	pub fn latest(&self) -> Option<Message> {
		self.view.snapshot().last().cloned()
	}

	pub fn watch(&self) -> watch::Receiver<Arc<Vec<Message>>> {
		self.view.watch()
	}

	/// Unread badge of this conversation
	pub fn unread(&self) -> u32 {
		self.unread.count(&self.conversation)
	}

	/// Mark everything sent to us in this conversation as read
	pub async fn mark_read(&self) -> ClResult<()> {
		self.unread.mark_read(&self.conversation).await
	}

	/// Refetch the history
	pub async fn resync(&self) -> ClResult<()> {
		self.view.resync().await
	}

	pub fn view(&self) -> &LiveView<Message> {
		&self.view
	}

	pub fn close(&self) {
		self.view.close();
	}
}

impl std::fmt::Debug for ConversationFeed {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConversationFeed").field("conversation", &self.conversation).finish_non_exhaustive()
	}
}

// vim: ts=4
