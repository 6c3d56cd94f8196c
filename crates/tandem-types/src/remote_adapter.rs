//! Remote Data Service Adapter
//!
//! Trait and types for the hosted backend the client engine talks to. The service
//! provides four things:
//!
//! - query/mutate operations against named tables
//! - change feeds: a push subscription keyed by table + filter that delivers
//!   at-least-once, possibly reordered row-change events plus connection status
//!   transitions
//! - presence channels: ephemeral per-channel "who is connected" state
//! - object storage for attachments and avatars
//!
//! The on-wire protocol is owned by the service. Everything here is expressed in
//! terms of "table name, operation kind, row payload".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::prelude::*;
use crate::types::Row;
use crate::utils::compare_values;

/// Row change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
	Insert,
	Update,
	Delete,
}

impl std::fmt::Display for ChangeOp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ChangeOp::Insert => write!(f, "INSERT"),
			ChangeOp::Update => write!(f, "UPDATE"),
			ChangeOp::Delete => write!(f, "DELETE"),
		}
	}
}

/// A single row-change notification. Transient: consumed by the owning view as soon
/// as it arrives.
///
/// For `Delete` the payload carries at least the key field of the removed row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T = Row> {
	pub operation: ChangeOp,
	pub payload: T,
	pub received_at: Timestamp,
}

impl<T> ChangeEvent<T> {
	pub fn new(operation: ChangeOp, payload: T) -> Self {
		Self { operation, payload, received_at: now() }
	}

	pub fn insert(payload: T) -> Self {
		Self::new(ChangeOp::Insert, payload)
	}

	pub fn update(payload: T) -> Self {
		Self::new(ChangeOp::Update, payload)
	}

	pub fn delete(payload: T) -> Self {
		Self::new(ChangeOp::Delete, payload)
	}

	/// Convert the payload, keeping operation and receipt time.
	pub fn try_map<U, F>(self, f: F) -> ClResult<ChangeEvent<U>>
	where
		F: FnOnce(T) -> ClResult<U>,
	{
		Ok(ChangeEvent {
			operation: self.operation,
			payload: f(self.payload)?,
			received_at: self.received_at,
		})
	}
}

/// Connection status transitions reported by a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
	Connecting,
	Connected,
	Closed,
	Error(String),
}

impl ChannelStatus {
	/// Closed and Error are the transitions that trigger reconnection
	pub fn is_failure(&self) -> bool {
		matches!(self, ChannelStatus::Closed | ChannelStatus::Error(_))
	}
}

/// Query filter for selecting rows.
///
/// A row matches if ALL specified conditions are satisfied (AND logic).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
	/// Field equality constraints: field_name -> expected_value
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub equals: HashMap<String, Value>,

	/// Field not-equal constraints: field_name -> expected_value
	#[serde(default, skip_serializing_if = "HashMap::is_empty", rename = "notEquals")]
	pub not_equals: HashMap<String, Value>,

	/// Field in-array constraints: field_name -> array of allowed values
	#[serde(default, skip_serializing_if = "HashMap::is_empty", rename = "inArray")]
	pub in_array: HashMap<String, Vec<Value>>,
}

impl QueryFilter {
	/// Create a new empty filter (matches all rows).
	pub fn new() -> Self {
		Self::default()
	}

	/// Create a filter with a single equality constraint.
	pub fn equals_one(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::new().with_equals(field, value)
	}

	/// Add an equality constraint to this filter (builder pattern).
	pub fn with_equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
		self.equals.insert(field.into(), value.into());
		self
	}

	/// Add a not-equal constraint to this filter (builder pattern).
	pub fn with_not_equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
		self.not_equals.insert(field.into(), value.into());
		self
	}

	/// Add an in-array constraint to this filter (builder pattern).
	pub fn with_in_array(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
		self.in_array.insert(field.into(), values);
		self
	}

	/// Check if this filter is empty (matches all rows).
	pub fn is_empty(&self) -> bool {
		self.equals.is_empty() && self.not_equals.is_empty() && self.in_array.is_empty()
	}

	/// Check if a row matches this filter
	pub fn matches(&self, row: &Value) -> bool {
		for (field, expected) in &self.equals {
			match row.get(field) {
				Some(actual) if actual == expected => {}
				_ => return false,
			}
		}

		// Missing fields are inherently "not equal"
		for (field, expected) in &self.not_equals {
			if row.get(field).is_some_and(|actual| actual == expected) {
				return false;
			}
		}

		for (field, allowed) in &self.in_array {
			match row.get(field) {
				Some(actual) if allowed.contains(actual) => {}
				_ => return false,
			}
		}

		true
	}
}

/// Sort order for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
	pub field: String,
	pub ascending: bool,
}

impl SortField {
	pub fn asc(field: impl Into<String>) -> Self {
		Self { field: field.into(), ascending: true }
	}

	pub fn desc(field: impl Into<String>) -> Self {
		Self { field: field.into(), ascending: false }
	}

	/// Compare two rows on this field
	pub fn compare(&self, a: &Value, b: &Value) -> std::cmp::Ordering {
		let ord = compare_values(a.get(&self.field), b.get(&self.field));
		if self.ascending { ord } else { ord.reverse() }
	}
}

/// Options for querying rows (filter, sort, limit).
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
	pub filter: QueryFilter,
	pub sort: Vec<SortField>,
	pub limit: Option<u32>,
}

impl QueryOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_filter(mut self, filter: QueryFilter) -> Self {
		self.filter = filter;
		self
	}

	pub fn with_sort(mut self, sort: SortField) -> Self {
		self.sort.push(sort);
		self
	}

	pub fn with_limit(mut self, limit: u32) -> Self {
		self.limit = Some(limit);
		self
	}
}

/// Write operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MutationOp {
	Insert,
	Update,
	Delete,
}

/// A write against a named table.
///
/// - `Insert`: `payload` is the new row, `filter` is ignored
/// - `Update`: fields of `payload` are written to every row matching `filter`
/// - `Delete`: every row matching `filter` is removed, `payload` is ignored
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
	pub table: Box<str>,
	pub op: MutationOp,
	pub filter: QueryFilter,
	pub payload: Value,
}

impl Mutation {
	pub fn insert(table: impl Into<Box<str>>, payload: Value) -> Self {
		Self { table: table.into(), op: MutationOp::Insert, filter: QueryFilter::new(), payload }
	}

	pub fn update(table: impl Into<Box<str>>, filter: QueryFilter, payload: Value) -> Self {
		Self { table: table.into(), op: MutationOp::Update, filter, payload }
	}

	pub fn delete(table: impl Into<Box<str>>, filter: QueryFilter) -> Self {
		Self { table: table.into(), op: MutationOp::Delete, filter, payload: Value::Null }
	}
}

pub type EventCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// Callbacks for a change feed channel
#[derive(Clone)]
pub struct ChangeHandlers {
	pub on_event: EventCallback,
	pub on_status: StatusCallback,
}

impl ChangeHandlers {
	pub fn new<E, S>(on_event: E, on_status: S) -> Self
	where
		E: Fn(ChangeEvent) + Send + Sync + 'static,
		S: Fn(ChannelStatus) + Send + Sync + 'static,
	{
		Self { on_event: Arc::new(on_event), on_status: Arc::new(on_status) }
	}
}

impl Debug for ChangeHandlers {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChangeHandlers").finish_non_exhaustive()
	}
}

/// Handle to a live push subscription. Dropping the handle does not close the
/// channel; `close` must be called explicitly.
pub trait Channel: Debug + Send + Sync {
	/// Channel topic name, for logging
	fn topic(&self) -> &str;

	/// Stop delivery and release the underlying connection
	fn close(&self) -> ClResult<()>;
}

/// Full presence state: presence key -> list of metas announced under that key
/// (one per connected tab/device).
pub type PresenceState = HashMap<String, Vec<Value>>;

pub type PresenceSyncCallback = Arc<dyn Fn(PresenceState) + Send + Sync>;
pub type PresenceDeltaCallback = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// Callbacks for a presence channel
#[derive(Clone)]
pub struct PresenceHandlers {
	pub on_sync: PresenceSyncCallback,
	pub on_join: PresenceDeltaCallback,
	pub on_leave: PresenceDeltaCallback,
	pub on_status: StatusCallback,
}

impl Debug for PresenceHandlers {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PresenceHandlers").finish_non_exhaustive()
	}
}

/// Presence channel: a channel that can also announce local presence.
#[async_trait]
pub trait PresenceChannel: Channel {
	/// Announce local presence with the given meta payload
	async fn track(&self, payload: Value) -> ClResult<()>;

	/// Withdraw local presence
	async fn untrack(&self) -> ClResult<()>;
}

/// Remote Data Service Adapter trait.
///
/// Channel-opening methods are synchronous: they return a handle immediately and
/// report progress through the status callback (Connecting, then Connected or
/// Error). An `Err` from them means the channel could not even be described
/// (bad filter, missing configuration) and is not retried.
#[async_trait]
pub trait RemoteAdapter: Debug + Send + Sync {
	/// Query rows of a table with optional filtering, sorting and limit.
	async fn query(&self, table: &str, opts: QueryOptions) -> ClResult<Vec<Row>>;

	/// Apply a write. Returns the rows written (inserted, updated or deleted).
	async fn mutate(&self, mutation: Mutation) -> ClResult<Vec<Row>>;

	/// Open a change feed for rows of `table` matching `filter`.
	fn subscribe_changes(
		&self,
		table: &str,
		filter: QueryFilter,
		handlers: ChangeHandlers,
	) -> ClResult<Arc<dyn Channel>>;

	/// Open a presence channel by name.
	fn presence_channel(
		&self,
		name: &str,
		handlers: PresenceHandlers,
	) -> ClResult<Arc<dyn PresenceChannel>>;

	/// Store an object and return its public URL.
	async fn upload_object(
		&self,
		bucket: &str,
		path: &str,
		bytes: Vec<u8>,
		content_type: &str,
	) -> ClResult<String>;
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_filter_matches() {
		let filter = QueryFilter::equals_one("conversation_id", "c1").with_not_equals("sender_id", "me");
		assert!(filter.matches(&json!({ "conversation_id": "c1", "sender_id": "you" })));
		assert!(filter.matches(&json!({ "conversation_id": "c1" })));
		assert!(!filter.matches(&json!({ "conversation_id": "c1", "sender_id": "me" })));
		assert!(!filter.matches(&json!({ "conversation_id": "c2", "sender_id": "you" })));
	}

	#[test]
	fn test_filter_in_array() {
		let filter = QueryFilter::new().with_in_array("status", vec![json!("online"), json!("away")]);
		assert!(filter.matches(&json!({ "status": "away" })));
		assert!(!filter.matches(&json!({ "status": "offline" })));
		assert!(!filter.matches(&json!({})));
	}

	#[test]
	fn test_empty_filter_matches_all() {
		assert!(QueryFilter::new().is_empty());
		assert!(QueryFilter::new().matches(&json!({ "anything": 1 })));
	}

	#[test]
	fn test_sort_field_compare() {
		let a = json!({ "created_at": 100 });
		let b = json!({ "created_at": 200 });
		assert_eq!(SortField::asc("created_at").compare(&a, &b), std::cmp::Ordering::Less);
		assert_eq!(SortField::desc("created_at").compare(&a, &b), std::cmp::Ordering::Greater);
	}

	#[test]
	fn test_change_event_try_map() {
		let event = ChangeEvent::insert(json!({ "id": 7 }));
		let mapped = event
			.try_map(|row| row.get("id").and_then(Value::as_u64).ok_or(Error::Parse))
			.unwrap();
		assert_eq!(mapped.operation, ChangeOp::Insert);
		assert_eq!(mapped.payload, 7);
	}

	#[test]
	fn test_status_failure() {
		assert!(ChannelStatus::Closed.is_failure());
		assert!(ChannelStatus::Error("x".into()).is_failure());
		assert!(!ChannelStatus::Connected.is_failure());
		assert!(!ChannelStatus::Connecting.is_failure());
	}
}

// vim: ts=4
