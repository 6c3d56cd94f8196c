//! Outbox
//!
//! Optimistic sending. A message is queued with a client-generated id and shown as
//! pending right away. An attachment is uploaded first, then the row is inserted
//! under the client id, so the push echo of the insert merges into the same item
//! as the confirmed row. Failed sends stay in the outbox until retried or discarded.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tandem_live::LiveRecord;
use tandem_types::remote_adapter::{ChangeEvent, Mutation, RemoteAdapter};
use tandem_types::utils::random_id;
use tokio::sync::watch;

use crate::feed::ConversationFeed;
use crate::message::{MESSAGES_TABLE, Message};
use crate::prelude::*;

pub const ATTACHMENT_BUCKET: &str = "chat-attachments";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
	pub file_name: String,
	pub content_type: String,
	pub bytes: Vec<u8>,
}

impl Attachment {
	pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
		Self { file_name: file_name.into(), content_type: content_type.into(), bytes }
	}
}

/// What the user composed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
	pub content: String,
	pub receiver_id: Option<String>,
	pub attachment: Option<Attachment>,
}

impl Draft {
	pub fn text(content: impl Into<String>) -> Self {
		Self { content: content.into(), ..Self::default() }
	}

	pub fn to(mut self, receiver: impl Into<String>) -> Self {
		self.receiver_id = Some(receiver.into());
		self
	}

	pub fn with_attachment(mut self, attachment: Attachment) -> Self {
		self.attachment = Some(attachment);
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
	Pending,
	Failed(String),
}

/// A message waiting in the outbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
	pub client_id: String,
	pub conversation_id: String,
	pub draft: Draft,
	/// Set once the attachment is stored, so a retry does not upload it again
	pub attachment_url: Option<String>,
	pub state: SendState,
	pub queued_at: Timestamp,
}

impl Outgoing {
	fn attachment_path(&self, attachment: &Attachment) -> String {
		format!("{}/{}-{}", self.conversation_id, self.client_id, attachment.file_name)
	}

	fn to_row(&self, sender: &str) -> Value {
		let mut row = Map::new();
		row.insert("id".into(), Value::String(self.client_id.clone()));
		row.insert("conversation_id".into(), Value::String(self.conversation_id.clone()));
		row.insert("sender_id".into(), Value::String(sender.into()));
		if let Some(receiver) = &self.draft.receiver_id {
			row.insert("receiver_id".into(), Value::String(receiver.clone()));
		}
		row.insert("content".into(), Value::String(self.draft.content.clone()));
		if let Some(url) = &self.attachment_url {
			row.insert("attachment_url".into(), Value::String(url.clone()));
		}
		row.insert("is_read".into(), Value::Bool(false));
		Value::Object(row)
	}
}

pub struct Outbox {
	me: String,
	remote: Arc<dyn RemoteAdapter>,
	queue: Mutex<Vec<Outgoing>>,
	changes: watch::Sender<Arc<Vec<Outgoing>>>,
}

impl Outbox {
	pub fn new(remote: Arc<dyn RemoteAdapter>, me: impl Into<String>) -> Self {
		let (changes, _) = watch::channel(Arc::new(Vec::new()));
		Self { me: me.into(), remote, queue: Mutex::new(Vec::new()), changes }
	}

	fn publish(&self, queue: &[Outgoing]) {
		self.changes.send_replace(Arc::new(queue.to_vec()));
	}

	fn update<F: FnOnce(&mut Outgoing)>(&self, client_id: &str, f: F) {
		let mut queue = self.queue.lock();
		if let Some(outgoing) = queue.iter_mut().find(|outgoing| outgoing.client_id == client_id) {
			f(outgoing);
			self.publish(&queue);
		}
	}

	fn remove(&self, client_id: &str) -> bool {
		let mut queue = self.queue.lock();
		let before = queue.len();
		queue.retain(|outgoing| outgoing.client_id != client_id);
		let removed = queue.len() != before;
		if removed {
			self.publish(&queue);
		}
		removed
	}

	/// Queue `draft` on `feed` and send it.
	///
	/// On error the message stays in the outbox as [`SendState::Failed`] (see
	/// [`Outbox::pending`]).
	pub async fn send(&self, feed: &ConversationFeed, draft: Draft) -> ClResult<Message> {
		let outgoing = Outgoing {
			client_id: random_id(),
			conversation_id: feed.conversation().into(),
			draft,
			attachment_url: None,
			state: SendState::Pending,
			queued_at: now(),
		};
		let client_id = outgoing.client_id.clone();
		{
			let mut queue = self.queue.lock();
			queue.push(outgoing);
			self.publish(&queue);
		}
		debug!(conversation = %feed.conversation(), client_id = %client_id, "message queued");

		self.deliver(feed, &client_id).await
	}

	/// Send a failed message again
	pub async fn retry(&self, feed: &ConversationFeed, client_id: &str) -> ClResult<Message> {
		let state = self.get(client_id).map(|outgoing| (outgoing.state, outgoing.conversation_id));
		match state {
			None => Err(Error::NotFound),
			Some((_, conversation)) if conversation != feed.conversation() => Err(Error::Internal(format!(
				"message {} belongs to conversation {}",
				client_id, conversation
			))),
			Some((SendState::Pending, _)) => {
				Err(Error::Internal(format!("message {} is already being sent", client_id)))
			}
			Some((SendState::Failed(_), _)) => {
				self.update(client_id, |outgoing| outgoing.state = SendState::Pending);
				info!(client_id = %client_id, "retrying send");
				self.deliver(feed, client_id).await
			}
		}
	}

	/// Drop a message from the outbox without sending it
	pub fn discard(&self, client_id: &str) -> bool {
		self.remove(client_id)
	}

	async fn deliver(&self, feed: &ConversationFeed, client_id: &str) -> ClResult<Message> {
		match self.try_deliver(feed, client_id).await {
			Ok(message) => {
				self.remove(client_id);
				info!(conversation = %message.conversation_id, id = %message.id, "message sent");
				Ok(message)
			}
			Err(err) => {
				warn!(client_id = %client_id, error = %err, "send failed, kept for retry");
				let reason = err.to_string();
				self.update(client_id, |outgoing| outgoing.state = SendState::Failed(reason));
				Err(err)
			}
		}
	}

	async fn try_deliver(&self, feed: &ConversationFeed, client_id: &str) -> ClResult<Message> {
		let mut outgoing = self.get(client_id).ok_or(Error::NotFound)?;

		if outgoing.attachment_url.is_none()
			&& let Some(attachment) = &outgoing.draft.attachment
		{
			let path = outgoing.attachment_path(attachment);
			let url = self
				.remote
				.upload_object(ATTACHMENT_BUCKET, &path, attachment.bytes.clone(), &attachment.content_type)
				.await?;
			debug!(client_id = %client_id, url = %url, "attachment uploaded");
			let cached = url.clone();
			self.update(client_id, |outgoing| outgoing.attachment_url = Some(cached));
			outgoing.attachment_url = Some(url);
		}

		let rows = self.remote.mutate(Mutation::insert(MESSAGES_TABLE, outgoing.to_row(&self.me))).await?;
		let row = rows
			.into_iter()
			.next()
			.ok_or_else(|| Error::Mutation(format!("insert of {} returned no row", client_id)))?;
		let message = Message::decode(row)?;
		feed.view().apply(ChangeEvent::insert(message.clone()));
		Ok(message)
	}

	pub fn get(&self, client_id: &str) -> Option<Outgoing> {
		self.queue.lock().iter().find(|outgoing| outgoing.client_id == client_id).cloned()
	}

	/// Queued messages of `conversation`, oldest first
	pub fn pending(&self, conversation: &str) -> Vec<Outgoing> {
		self.queue.lock().iter().filter(|outgoing| outgoing.conversation_id == conversation).cloned().collect()
	}

	pub fn is_empty(&self) -> bool {
		self.queue.lock().is_empty()
	}

	/// Receiver notified whenever the outbox changes
	pub fn watch(&self) -> watch::Receiver<Arc<Vec<Outgoing>>> {
		self.changes.subscribe()
	}
}

impl std::fmt::Debug for Outbox {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Outbox").field("me", &self.me).finish_non_exhaustive()
	}
}

// vim: ts=4
