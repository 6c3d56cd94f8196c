//! Unread Tracker
//!
//! Per-conversation unread counters maintained incrementally from inbound message
//! events, with optimistic mark-as-read and wholesale reconciliation against the
//! server. A failed mark-as-read is not rolled back; the next reconcile corrects it.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tandem_types::remote_adapter::{Mutation, QueryFilter, QueryOptions, RemoteAdapter};
use tandem_types::utils::row_key;
use tokio::sync::watch;

use crate::prelude::*;

/// Where unread messages live on the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadSource {
	pub table: String,
	pub conversation_field: String,
	pub receiver_field: String,
	pub read_field: String,
}

impl Default for UnreadSource {
	fn default() -> Self {
		Self {
			table: "messages".into(),
			conversation_field: "conversation_id".into(),
			receiver_field: "receiver_id".into(),
			read_field: "is_read".into(),
		}
	}
}

/// Progress of the last mark-as-read issued for a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkState {
	Pending,
	Confirmed,
	Failed,
}

#[derive(Debug, Default)]
struct UnreadState {
	counts: HashMap<String, u32>,
	marks: HashMap<String, MarkState>,
	/// Bumped per mark so an older completion cannot overwrite a newer Pending
	mark_seq: HashMap<String, u64>,
}

impl UnreadState {
	fn total(&self) -> u32 {
		self.counts.values().sum()
	}
}

pub struct UnreadTracker {
	me: String,
	source: UnreadSource,
	remote: Arc<dyn RemoteAdapter>,
	state: parking_lot::Mutex<UnreadState>,
	total: watch::Sender<u32>,
}

impl UnreadTracker {
	pub fn new(remote: Arc<dyn RemoteAdapter>, me: impl Into<String>, source: UnreadSource) -> Self {
		let (total, _) = watch::channel(0);
		Self {
			me: me.into(),
			source,
			remote,
			state: parking_lot::Mutex::new(UnreadState::default()),
			total,
		}
	}

	fn publish(&self, state: &UnreadState) {
		self.total.send_if_modified(|total| {
			let new = state.total();
			let changed = *total != new;
			*total = new;
			changed
		});
	}

	/// Count an inbound message.
	///
	/// Own messages and messages already read elsewhere are ignored. Returns whether
	/// the counter changed.
	pub fn record_incoming(&self, conversation: &str, from_other_party: bool, already_read: bool) -> bool {
		if !from_other_party || already_read {
			return false;
		}
		let mut state = self.state.lock();
		*state.counts.entry(conversation.to_string()).or_default() += 1;
		self.publish(&state);
		true
	}

	/// Optimistically zero the counter, then persist the read flag.
	///
	/// Exactly one mutation is issued per call. On failure the local zero is kept and
	/// the error is returned; the mark is tagged `Failed` until the next reconcile.
	pub async fn mark_read(&self, conversation: &str) -> ClResult<()> {
		let seq = {
			let mut state = self.state.lock();
			state.counts.insert(conversation.to_string(), 0);
			state.marks.insert(conversation.to_string(), MarkState::Pending);
			let seq = state.mark_seq.entry(conversation.to_string()).or_default();
			*seq += 1;
			let seq = *seq;
			self.publish(&state);
			seq
		};

		let filter = QueryFilter::equals_one(self.source.conversation_field.as_str(), conversation)
			.with_equals(self.source.receiver_field.as_str(), self.me.as_str())
			.with_equals(self.source.read_field.as_str(), false);
		let mut payload = serde_json::Map::new();
		payload.insert(self.source.read_field.clone(), Value::Bool(true));
		let mutation = Mutation::update(self.source.table.as_str(), filter, Value::Object(payload));
		let result = self.remote.mutate(mutation).await;

		let mut state = self.state.lock();
		let latest = state.mark_seq.get(conversation).copied() == Some(seq);
		match result {
			Ok(rows) => {
				debug!(conversation = %conversation, rows = rows.len(), "marked as read");
				if latest {
					state.marks.insert(conversation.to_string(), MarkState::Confirmed);
				}
				Ok(())
			}
			Err(err) => {
				warn!(conversation = %conversation, error = %err, "mark as read failed, keeping local state");
				if latest {
					state.marks.insert(conversation.to_string(), MarkState::Failed);
				}
				Err(err)
			}
		}
	}

	/// Replace all counters with server-computed values.
	///
	/// Conversations with a mark still in flight stay at zero. Finished mark tags
	/// are cleared.
	pub fn reconcile(&self, server_counts: HashMap<String, u32>) {
		let mut state = self.state.lock();
		state.marks.retain(|_, mark| *mark == MarkState::Pending);
		let mut counts = server_counts;
		counts.retain(|_, count| *count > 0);
		for conversation in state.marks.keys() {
			counts.remove(conversation);
		}
		state.counts = counts;
		debug!(conversations = state.counts.len(), total = state.total(), "unread counts reconciled");
		self.publish(&state);
	}

	/// Replace the counter of one conversation with a value recounted from its rows.
	///
	/// Ignored while a mark is in flight for it; a finished mark tag is cleared.
	/// Returns whether the count was applied.
	pub fn reconcile_conversation(&self, conversation: &str, count: u32) -> bool {
		let mut state = self.state.lock();
		match state.marks.get(conversation) {
			Some(MarkState::Pending) => return false,
			Some(_) => {
				state.marks.remove(conversation);
			}
			None => {}
		}
		if count > 0 {
			state.counts.insert(conversation.to_string(), count);
		} else {
			state.counts.remove(conversation);
		}
		debug!(conversation = %conversation, count, "unread count recounted");
		self.publish(&state);
		true
	}

	/// Recompute counts from the message table and reconcile with them.
	///
	/// The recomputed count is authoritative over any denormalized counter.
	pub async fn refresh(&self) -> ClResult<()> {
		let filter = QueryFilter::equals_one(self.source.receiver_field.as_str(), self.me.as_str())
			.with_equals(self.source.read_field.as_str(), false);
		let rows = self
			.remote
			.query(&self.source.table, QueryOptions::new().with_filter(filter))
			.await?;

		let mut counts: HashMap<String, u32> = HashMap::new();
		for row in &rows {
			match row_key(row, &self.source.conversation_field) {
				Some(conversation) => *counts.entry(conversation).or_default() += 1,
				None => warn!(row = %row, "unread row without conversation skipped"),
			}
		}
		self.reconcile(counts);
		Ok(())
	}

	/// Feed a raw inbound row (from a change feed) into the counters
	pub fn record_row(&self, row: &Value) -> bool {
		let Some(conversation) = row_key(row, &self.source.conversation_field) else {
			return false;
		};
		let from_other_party = row.get(self.source.receiver_field.as_str()).and_then(Value::as_str)
			== Some(self.me.as_str());
		let already_read =
			row.get(self.source.read_field.as_str()).and_then(Value::as_bool).unwrap_or(false);
		self.record_incoming(&conversation, from_other_party, already_read)
	}

	pub fn count(&self, conversation: &str) -> u32 {
		self.state.lock().counts.get(conversation).copied().unwrap_or(0)
	}

	pub fn total(&self) -> u32 {
		self.state.lock().total()
	}

	pub fn counts(&self) -> HashMap<String, u32> {
		self.state.lock().counts.clone()
	}

	pub fn mark_state(&self, conversation: &str) -> Option<MarkState> {
		self.state.lock().marks.get(conversation).copied()
	}

	/// Receiver of the total unread count, for badges
	pub fn watch_total(&self) -> watch::Receiver<u32> {
		self.total.subscribe()
	}

	pub fn me(&self) -> &str {
		&self.me
	}
}

impl std::fmt::Debug for UnreadTracker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UnreadTracker").field("me", &self.me).finish_non_exhaustive()
	}
}


// vim: ts=4
