//! Fakes shared by the unit tests of this crate

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tandem_types::remote_adapter::{
	ChangeHandlers, Channel, Mutation, PresenceChannel, PresenceHandlers, QueryFilter,
	QueryOptions, RemoteAdapter,
};
use tandem_types::types::Row;

use crate::prelude::*;
use crate::registry::SubscriptionTicket;

#[derive(Debug)]
pub struct FakeChannel {
	topic: String,
	closed: AtomicBool,
	fail_close: bool,
}

impl FakeChannel {
	pub fn new(topic: &str) -> Arc<Self> {
		Arc::new(Self { topic: topic.into(), closed: AtomicBool::new(false), fail_close: false })
	}

	pub fn failing_close(topic: &str) -> Arc<Self> {
		Arc::new(Self { topic: topic.into(), closed: AtomicBool::new(false), fail_close: true })
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

impl Channel for FakeChannel {
	fn topic(&self) -> &str {
		&self.topic
	}

	fn close(&self) -> ClResult<()> {
		self.closed.store(true, Ordering::SeqCst);
		if self.fail_close { Err(Error::Transport("close failed".into())) } else { Ok(()) }
	}
}

#[async_trait]
impl PresenceChannel for FakeChannel {
	async fn track(&self, _payload: Value) -> ClResult<()> {
		Ok(())
	}

	async fn untrack(&self) -> ClResult<()> {
		Ok(())
	}
}

/// Factory producing fresh fake channels, plus its invocation counter
pub fn counting_factory() -> (
	impl Fn(&SubscriptionTicket) -> ClResult<Arc<dyn Channel>> + Clone + Send + Sync + 'static,
	Arc<AtomicUsize>,
) {
	let calls = Arc::new(AtomicUsize::new(0));
	let counter = calls.clone();
	let factory = move |ticket: &SubscriptionTicket| -> ClResult<Arc<dyn Channel>> {
		counter.fetch_add(1, Ordering::SeqCst);
		Ok(FakeChannel::new(&ticket.key) as Arc<dyn Channel>)
	};
	(factory, calls)
}

/// Factory that records every ticket it was called with
pub fn recording_factory() -> (
	impl Fn(&SubscriptionTicket) -> ClResult<Arc<dyn Channel>> + Clone + Send + Sync + 'static,
	Arc<Mutex<Vec<SubscriptionTicket>>>,
) {
	let tickets = Arc::new(Mutex::new(Vec::new()));
	let seen = tickets.clone();
	let factory = move |ticket: &SubscriptionTicket| -> ClResult<Arc<dyn Channel>> {
		seen.lock().push(ticket.clone());
		Ok(FakeChannel::new(&ticket.key) as Arc<dyn Channel>)
	};
	(factory, tickets)
}

/// Remote adapter that serves canned query results, records mutations and hands
/// out handlers so tests can drive channels by hand.
#[derive(Debug, Default)]
pub struct FakeRemote {
	pub rows: Mutex<HashMap<String, Vec<Row>>>,
	pub mutations: Mutex<Vec<Mutation>>,
	pub fail_mutations: AtomicBool,
	pub change_handlers: Mutex<Vec<(String, QueryFilter, ChangeHandlers)>>,
	pub presence_handlers: Mutex<Vec<PresenceHandlers>>,
	pub presence_channels: Mutex<Vec<Arc<RecordingPresence>>>,
	pub queries: AtomicUsize,
}

impl FakeRemote {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_rows(&self, table: &str, rows: Vec<Row>) {
		self.rows.lock().insert(table.into(), rows);
	}

	pub fn last_change_handlers(&self) -> Option<ChangeHandlers> {
		self.change_handlers.lock().last().map(|(_, _, handlers)| handlers.clone())
	}

	pub fn last_presence_handlers(&self) -> Option<PresenceHandlers> {
		self.presence_handlers.lock().last().cloned()
	}
}

#[async_trait]
impl RemoteAdapter for FakeRemote {
	async fn query(&self, table: &str, opts: QueryOptions) -> ClResult<Vec<Row>> {
		self.queries.fetch_add(1, Ordering::SeqCst);
		let rows = self.rows.lock().get(table).cloned().unwrap_or_default();
		Ok(rows.into_iter().filter(|row| opts.filter.matches(row)).collect())
	}

	async fn mutate(&self, mutation: Mutation) -> ClResult<Vec<Row>> {
		self.mutations.lock().push(mutation.clone());
		if self.fail_mutations.load(Ordering::SeqCst) {
			return Err(Error::Mutation("rejected".into()));
		}
		Ok(vec![mutation.payload])
	}

	fn subscribe_changes(
		&self,
		table: &str,
		filter: QueryFilter,
		handlers: ChangeHandlers,
	) -> ClResult<Arc<dyn Channel>> {
		self.change_handlers.lock().push((table.into(), filter, handlers));
		Ok(FakeChannel::new(table))
	}

	fn presence_channel(
		&self,
		name: &str,
		handlers: PresenceHandlers,
	) -> ClResult<Arc<dyn PresenceChannel>> {
		self.presence_handlers.lock().push(handlers);
		let channel = Arc::new(RecordingPresence::new(name));
		self.presence_channels.lock().push(channel.clone());
		Ok(channel)
	}

	async fn upload_object(
		&self,
		bucket: &str,
		path: &str,
		_bytes: Vec<u8>,
		_content_type: &str,
	) -> ClResult<String> {
		Ok(format!("fake://{}/{}", bucket, path))
	}
}

/// Presence channel recording track/untrack calls in order
#[derive(Debug)]
pub struct RecordingPresence {
	topic: String,
	pub calls: Mutex<VecDeque<String>>,
}

impl RecordingPresence {
	pub fn new(topic: &str) -> Self {
		Self { topic: topic.into(), calls: Mutex::new(VecDeque::new()) }
	}

	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().iter().cloned().collect()
	}
}

impl Channel for RecordingPresence {
	fn topic(&self) -> &str {
		&self.topic
	}

	fn close(&self) -> ClResult<()> {
		self.calls.lock().push_back("close".into());
		Ok(())
	}
}

#[async_trait]
impl PresenceChannel for RecordingPresence {
	async fn track(&self, payload: Value) -> ClResult<()> {
		self.calls.lock().push_back(format!("track:{}", payload));
		Ok(())
	}

	async fn untrack(&self) -> ClResult<()> {
		self.calls.lock().push_back("untrack".into());
		Ok(())
	}
}

pub fn setup_test_logging() {
	let _ = tracing_subscriber::fmt()
		.with_test_writer()
		.with_max_level(tracing::Level::DEBUG)
		.try_init();
}

// vim: ts=4
