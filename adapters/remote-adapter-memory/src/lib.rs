//! In-memory implementation of the remote data service.
//!
//! Holds tables of JSON rows, delivers change events to matching change feeds,
//! keeps shared presence state per channel name and stores uploaded objects. Several
//! client sessions can share one backend (see [`RemoteAdapterMemory::session`]), so
//! a test can play both sides of a conversation.
//!
//! Fault injection hooks make transport failures reproducible:
//! [`fail_next_mutations`](RemoteAdapterMemory::fail_next_mutations),
//! [`fail_channel_creation`](RemoteAdapterMemory::fail_channel_creation),
//! [`break_channels`](RemoteAdapterMemory::break_channels) and
//! [`emit_raw`](RemoteAdapterMemory::emit_raw).

#![forbid(unsafe_code)]

mod channel;
mod error;
mod store;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tandem_types::error::ClResult;
use tandem_types::remote_adapter::{
	ChangeEvent, ChangeHandlers, Channel, ChannelStatus, Mutation, MutationOp, PresenceChannel,
	PresenceHandlers, PresenceState, QueryFilter, QueryOptions, RemoteAdapter,
};
use tandem_types::types::Row;
use tandem_types::utils::random_id;
use tracing::{debug, info, warn};

pub use channel::{MemoryChannel, MemoryPresenceChannel};
pub use error::Error;

use channel::{Delivery, DeliverySender, Handlers};

/// Adapter configuration options
#[derive(Debug, Clone)]
pub struct AdapterConfig {
	/// Prefix of URLs returned by `upload_object`
	pub object_url_base: String,

	/// Row identity field, generated on insert when missing
	pub id_field: String,

	/// Creation time field (milliseconds), filled on insert when missing
	pub created_at_field: String,
}

impl Default for AdapterConfig {
	fn default() -> Self {
		Self {
			object_url_base: "memory://".into(),
			id_field: "id".into(),
			created_at_field: "created_at".into(),
		}
	}
}

#[derive(Debug)]
struct Feed {
	id: u64,
	table: String,
	filter: QueryFilter,
	tx: DeliverySender,
}

#[derive(Debug)]
struct Member {
	channel_id: u64,
	presence_key: String,
	meta: Option<Value>,
	tx: DeliverySender,
}

/// A stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
	pub bytes: Vec<u8>,
	pub content_type: String,
}

/// Backend state shared by all sessions
#[derive(Debug, Default)]
pub(crate) struct Shared {
	tables: Mutex<HashMap<String, store::Table>>,
	feeds: Mutex<Vec<Feed>>,
	rooms: Mutex<HashMap<String, Vec<Member>>>,
	objects: Mutex<HashMap<String, StoredObject>>,
	fail_mutations: AtomicUsize,
	fail_uploads: AtomicUsize,
	fail_channels: AtomicBool,
	next_channel_id: AtomicU64,
}

impl Shared {
	fn next_id(&self) -> u64 {
		self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1
	}

	/// Consume one pending injected failure from `counter`
	fn take_failure(counter: &AtomicUsize) -> bool {
		counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
	}

	fn publish(&self, table: &str, events: &[ChangeEvent]) {
		let feeds = self.feeds.lock();
		for feed in feeds.iter().filter(|feed| feed.table == table) {
			for event in events.iter().filter(|event| feed.filter.matches(&event.payload)) {
				let _ = feed.tx.send(Delivery::Event(event.clone()));
			}
		}
	}

	pub(crate) fn remove_feed(&self, id: u64) {
		self.feeds.lock().retain(|feed| feed.id != id);
	}

	pub(crate) fn set_presence(&self, room: &str, channel_id: u64, meta: Option<Value>) -> Result<(), Error> {
		let mut rooms = self.rooms.lock();
		let members = rooms.get_mut(room).ok_or(Error::Closed)?;
		let member =
			members.iter_mut().find(|member| member.channel_id == channel_id).ok_or(Error::Closed)?;

		let key = member.presence_key.clone();
		let delta = match (&member.meta, &meta) {
			(_, Some(new)) => Some(Delivery::Join(key, vec![new.clone()])),
			(Some(old), None) => Some(Delivery::Leave(key, vec![old.clone()])),
			(None, None) => None,
		};
		member.meta = meta;

		if let Some(delta) = delta {
			broadcast_room(members, &delta);
		}
		Ok(())
	}

	pub(crate) fn leave_room(&self, room: &str, channel_id: u64) {
		let mut rooms = self.rooms.lock();
		let Some(members) = rooms.get_mut(room) else {
			return;
		};
		let Some(pos) = members.iter().position(|member| member.channel_id == channel_id) else {
			return;
		};
		let member = members.remove(pos);
		if let Some(meta) = member.meta {
			broadcast_room(members, &Delivery::Leave(member.presence_key, vec![meta]));
		}
		if members.is_empty() {
			rooms.remove(room);
		}
	}
}

fn presence_state(members: &[Member]) -> PresenceState {
	let mut state = PresenceState::new();
	for member in members {
		if let Some(meta) = &member.meta {
			state.entry(member.presence_key.clone()).or_default().push(meta.clone());
		}
	}
	state
}

/// Send `delta` followed by the full state to every member of a room
fn broadcast_room(members: &[Member], delta: &Delivery) {
	let state = presence_state(members);
	for member in members {
		let _ = member.tx.send(delta.clone());
		let _ = member.tx.send(Delivery::Sync(state.clone()));
	}
}

/// In-memory implementation of RemoteAdapter.
#[derive(Debug)]
pub struct RemoteAdapterMemory {
	shared: Arc<Shared>,
	presence_key: String,
	config: AdapterConfig,
}

impl Default for RemoteAdapterMemory {
	fn default() -> Self {
		Self::new()
	}
}

impl RemoteAdapterMemory {
	/// Create an empty backend with a single session.
	pub fn new() -> Self {
		Self::with_config(AdapterConfig::default())
	}

	pub fn with_config(config: AdapterConfig) -> Self {
		Self { shared: Arc::new(Shared::default()), presence_key: random_id(), config }
	}

	/// Another client session on the same backend, announcing presence as `presence_key`.
	pub fn session(&self, presence_key: impl Into<String>) -> Self {
		Self { shared: self.shared.clone(), presence_key: presence_key.into(), config: self.config.clone() }
	}

	pub fn presence_key(&self) -> &str {
		&self.presence_key
	}

	/// Load rows without emitting change events
	pub fn seed(&self, table: &str, rows: Vec<Row>) {
		self.shared.tables.lock().entry(table.into()).or_default().extend(rows);
	}

	/// Current contents of a table, in insertion order
	pub fn rows(&self, table: &str) -> Vec<Row> {
		self.shared.tables.lock().get(table).cloned().unwrap_or_default()
	}

	pub fn object(&self, bucket: &str, path: &str) -> Option<StoredObject> {
		self.shared.objects.lock().get(&format!("{}/{}", bucket, path)).cloned()
	}

	/// Make the next `count` mutations fail
	pub fn fail_next_mutations(&self, count: usize) {
		self.shared.fail_mutations.store(count, Ordering::SeqCst);
	}

	/// Make the next `count` object uploads fail
	pub fn fail_next_uploads(&self, count: usize) {
		self.shared.fail_uploads.store(count, Ordering::SeqCst);
	}

	/// Refuse to open channels while `fail` is set
	pub fn fail_channel_creation(&self, fail: bool) {
		self.shared.fail_channels.store(fail, Ordering::SeqCst);
	}

	/// Drop every change feed on `table`, reporting an Error status to each.
	///
	/// Returns the number of feeds broken.
	pub fn break_channels(&self, table: &str) -> usize {
		let broken: Vec<Feed> = {
			let mut feeds = self.shared.feeds.lock();
			let (broken, kept): (Vec<Feed>, Vec<Feed>) =
				std::mem::take(&mut *feeds).into_iter().partition(|feed| feed.table == table);
			*feeds = kept;
			broken
		};
		for feed in &broken {
			let _ = feed.tx.send(Delivery::Status(ChannelStatus::Error("connection lost".into())));
		}
		warn!(table = %table, feeds = broken.len(), "change feeds broken");
		broken.len()
	}

	/// Drop every member of presence channel `name`, reporting an Error status to each.
	pub fn break_presence(&self, name: &str) -> usize {
		let members = self.shared.rooms.lock().remove(name).unwrap_or_default();
		for member in &members {
			let _ = member.tx.send(Delivery::Status(ChannelStatus::Error("connection lost".into())));
		}
		warn!(channel = %name, members = members.len(), "presence channel broken");
		members.len()
	}

	/// Deliver `event` verbatim to every feed on `table`, bypassing filters
	pub fn emit_raw(&self, table: &str, event: ChangeEvent) -> usize {
		let feeds = self.shared.feeds.lock();
		let mut delivered = 0;
		for feed in feeds.iter().filter(|feed| feed.table == table) {
			if feed.tx.send(Delivery::Event(event.clone())).is_ok() {
				delivered += 1;
			}
		}
		delivered
	}

	/// Number of open change feeds on `table`
	pub fn live_feeds(&self, table: &str) -> usize {
		self.shared.feeds.lock().iter().filter(|feed| feed.table == table).count()
	}

	/// Full presence state of channel `name`
	pub fn presence(&self, name: &str) -> PresenceState {
		self.shared.rooms.lock().get(name).map(|members| presence_state(members)).unwrap_or_default()
	}
}

#[async_trait]
impl RemoteAdapter for RemoteAdapterMemory {
	async fn query(&self, table: &str, opts: QueryOptions) -> ClResult<Vec<Row>> {
		let tables = self.shared.tables.lock();
		Ok(tables.get(table).map(|rows| store::select(rows, &opts)).unwrap_or_default())
	}

	async fn mutate(&self, mutation: Mutation) -> ClResult<Vec<Row>> {
		if Shared::take_failure(&self.shared.fail_mutations) {
			warn!(table = %mutation.table, op = ?mutation.op, "injected mutation failure");
			return Err(Error::Injected(format!("{:?} on {}", mutation.op, mutation.table)).into());
		}

		let events = {
			let mut tables = self.shared.tables.lock();
			let table = tables.entry(mutation.table.to_string()).or_default();
			match mutation.op {
				MutationOp::Insert => vec![store::insert(table, mutation.payload, &self.config)?],
				MutationOp::Update => store::update(table, &mutation.filter, &mutation.payload)?,
				MutationOp::Delete => store::delete(table, &mutation.filter),
			}
		};

		debug!(table = %mutation.table, op = ?mutation.op, rows = events.len(), "mutation applied");
		self.shared.publish(&mutation.table, &events);
		Ok(events.into_iter().map(|event| event.payload).collect())
	}

	fn subscribe_changes(
		&self,
		table: &str,
		filter: QueryFilter,
		handlers: ChangeHandlers,
	) -> ClResult<Arc<dyn Channel>> {
		let topic = format!("realtime:{}", table);
		if self.shared.fail_channels.load(Ordering::SeqCst) {
			return Err(Error::ChannelRefused(topic).into());
		}

		let tx = channel::spawn_delivery(Handlers::Change(handlers))?;
		let id = self.shared.next_id();
		self.shared.feeds.lock().push(Feed { id, table: table.into(), filter, tx });
		debug!(topic = %topic, id, "change feed opened");

		let channel: Arc<dyn Channel> =
			Arc::new(MemoryChannel { id, topic, shared: Arc::downgrade(&self.shared) });
		Ok(channel)
	}

	fn presence_channel(
		&self,
		name: &str,
		handlers: PresenceHandlers,
	) -> ClResult<Arc<dyn PresenceChannel>> {
		let topic = format!("presence:{}", name);
		if self.shared.fail_channels.load(Ordering::SeqCst) {
			return Err(Error::ChannelRefused(topic).into());
		}

		let tx = channel::spawn_delivery(Handlers::Presence(handlers))?;
		let id = self.shared.next_id();
		{
			let mut rooms = self.shared.rooms.lock();
			let members = rooms.entry(name.into()).or_default();
			let _ = tx.send(Delivery::Sync(presence_state(members)));
			members.push(Member { channel_id: id, presence_key: self.presence_key.clone(), meta: None, tx });
		}
		debug!(topic = %topic, id, key = %self.presence_key, "presence channel opened");

		let channel: Arc<dyn PresenceChannel> = Arc::new(MemoryPresenceChannel {
			id,
			room: name.into(),
			topic,
			shared: Arc::downgrade(&self.shared),
		});
		Ok(channel)
	}

	async fn upload_object(
		&self,
		bucket: &str,
		path: &str,
		bytes: Vec<u8>,
		content_type: &str,
	) -> ClResult<String> {
		if path.is_empty() || path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
			return Err(Error::InvalidPath(path.into()).into());
		}
		if Shared::take_failure(&self.shared.fail_uploads) {
			warn!(bucket = %bucket, path = %path, "injected upload failure");
			return Err(Error::Injected(format!("upload {}/{}", bucket, path)).into());
		}

		let size = bytes.len();
		self.shared
			.objects
			.lock()
			.insert(format!("{}/{}", bucket, path), StoredObject { bytes, content_type: content_type.into() });
		info!(bucket = %bucket, path = %path, size, "object stored");
		Ok(format!("{}{}/{}", self.config.object_url_base, bucket, path))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn test_query_and_mutate() {
		let adapter = RemoteAdapterMemory::new();
		adapter.seed("messages", vec![json!({ "id": "m1", "conversation_id": "c1", "created_at": 1 })]);

		let rows = adapter
			.mutate(Mutation::insert("messages", json!({ "conversation_id": "c2", "content": "hi" })))
			.await
			.unwrap();
		assert_eq!(rows.len(), 1);
		assert!(rows[0]["id"].is_string());

		let rows = adapter
			.query("messages", QueryOptions::new().with_filter(QueryFilter::equals_one("conversation_id", "c1")))
			.await
			.unwrap();
		assert_eq!(rows, vec![json!({ "id": "m1", "conversation_id": "c1", "created_at": 1 })]);
		assert!(adapter.query("missing", QueryOptions::new()).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_injected_mutation_failures() {
		let adapter = RemoteAdapterMemory::new();
		adapter.fail_next_mutations(2);
		for _ in 0..2 {
			let result = adapter.mutate(Mutation::insert("t", json!({}))).await;
			assert!(matches!(result, Err(tandem_types::error::Error::Mutation(_))));
		}
		assert!(adapter.mutate(Mutation::insert("t", json!({}))).await.is_ok());
		assert_eq!(adapter.rows("t").len(), 1);
	}

	#[tokio::test]
	async fn test_upload_object() {
		let adapter = RemoteAdapterMemory::new();
		let url = adapter
			.upload_object("chat-attachments", "c1/abc-photo.png", vec![1, 2, 3], "image/png")
			.await
			.unwrap();
		assert_eq!(url, "memory://chat-attachments/c1/abc-photo.png");
		assert_eq!(
			adapter.object("chat-attachments", "c1/abc-photo.png"),
			Some(StoredObject { bytes: vec![1, 2, 3], content_type: "image/png".into() })
		);
		assert!(adapter.upload_object("b", "../etc", vec![], "text/plain").await.is_err());
	}

	#[test]
	fn test_channel_requires_runtime() {
		let adapter = RemoteAdapterMemory::new();
		let handlers = ChangeHandlers::new(|_| {}, |_| {});
		let result = adapter.subscribe_changes("messages", QueryFilter::new(), handlers);
		assert!(matches!(result, Err(tandem_types::error::Error::Factory(_))));
	}

	#[test]
	fn test_sessions_share_backend() {
		let alice = RemoteAdapterMemory::new();
		let bob = alice.session("bob");
		alice.seed("messages", vec![json!({ "id": 1 })]);
		assert_eq!(bob.rows("messages").len(), 1);
		assert_eq!(bob.presence_key(), "bob");
	}
}

// vim: ts=4
