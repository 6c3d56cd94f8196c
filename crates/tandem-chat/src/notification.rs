//! Notification feed

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tandem_live::{LiveRecord, LiveView, SubscriptionRegistry, ViewSpec, decode_row};
use tandem_types::remote_adapter::{ChangeEvent, Mutation, QueryFilter, RemoteAdapter};
use tandem_types::types::Row;
use tokio::sync::watch;

use crate::message::string_or_number;
use crate::prelude::*;

pub const NOTIFICATIONS_TABLE: &str = "notifications";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
	#[serde(deserialize_with = "string_or_number")]
	pub id: String,
	pub user_id: String,
	#[serde(rename = "type", default)]
	pub kind: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub body: String,
	#[serde(default)]
	pub data: Value,
	#[serde(default)]
	pub is_read: bool,
	pub created_at: Timestamp,
}

impl LiveRecord for Notification {
	fn decode(row: Row) -> ClResult<Self> {
		decode_row(row)
	}

	fn record_key(&self) -> Option<String> {
		Some(self.id.clone())
	}

	/// Newest first
	fn compare(&self, other: &Self) -> Ordering {
		other.created_at.cmp(&self.created_at).then_with(|| other.id.cmp(&self.id))
	}
}

fn read_payload() -> Value {
	let mut payload = Map::new();
	payload.insert("is_read".into(), Value::Bool(true));
	Value::Object(payload)
}

pub fn notifications_key(user: &str) -> String {
	format!("notifications:{}", user)
}

/// Live notification list of one user.
///
/// Read flags are set optimistically. A rejected write is not rolled back; the
/// next resync restores the server state.
pub struct NotificationFeed {
	user: String,
	remote: Arc<dyn RemoteAdapter>,
	view: LiveView<Notification>,
}

impl NotificationFeed {
	pub async fn open(
		registry: &Arc<SubscriptionRegistry>,
		remote: Arc<dyn RemoteAdapter>,
		user: &str,
	) -> ClResult<Self> {
		let spec = ViewSpec::new(notifications_key(user), NOTIFICATIONS_TABLE)
			.with_filter(QueryFilter::equals_one("user_id", user));
		let view = LiveView::open(registry, remote.clone(), spec).await?;
		Ok(Self { user: user.into(), remote, view })
	}

	/// Notifications, newest first
	pub fn notifications(&self) -> Arc<Vec<Notification>> {
		self.view.snapshot()
	}

	pub fn watch(&self) -> watch::Receiver<Arc<Vec<Notification>>> {
		self.view.watch()
	}

	pub fn unread_count(&self) -> usize {
		self.view.snapshot().iter().filter(|notification| !notification.is_read).count()
	}

	fn apply_read(&self, notification: &Notification) {
		let mut read = notification.clone();
		read.is_read = true;
		self.view.apply(ChangeEvent::update(read));
	}

	/// Mark one notification as read. Returns false if it was unknown or already read.
	pub async fn mark_read(&self, id: &str) -> ClResult<bool> {
		let Some(notification) = self.view.get(id).filter(|notification| !notification.is_read) else {
			return Ok(false);
		};
		self.apply_read(&notification);

		let filter = QueryFilter::equals_one("id", id).with_equals("user_id", self.user.as_str());
		if let Err(err) = self.remote.mutate(Mutation::update(NOTIFICATIONS_TABLE, filter, read_payload())).await {
			warn!(id = %id, error = %err, "marking notification as read failed");
			return Err(err);
		}
		Ok(true)
	}

	/// Mark every unread notification as read with a single write.
	///
	/// Returns the number of notifications marked locally.
	pub async fn mark_all_read(&self) -> ClResult<usize> {
		let unread: Vec<Notification> =
			self.view.snapshot().iter().filter(|notification| !notification.is_read).cloned().collect();
		if unread.is_empty() {
			return Ok(0);
		}
		for notification in &unread {
			self.apply_read(notification);
		}

		let filter = QueryFilter::equals_one("user_id", self.user.as_str()).with_equals("is_read", false);
		match self.remote.mutate(Mutation::update(NOTIFICATIONS_TABLE, filter, read_payload())).await {
			Ok(rows) => {
				debug!(user = %self.user, local = unread.len(), remote = rows.len(), "notifications marked as read");
				Ok(unread.len())
			}
			Err(err) => {
				warn!(user = %self.user, error = %err, "marking notifications as read failed");
				Err(err)
			}
		}
	}

	pub async fn resync(&self) -> ClResult<()> {
		self.view.resync().await
	}

	pub fn view(&self) -> &LiveView<Notification> {
		&self.view
	}

	pub fn close(&self) {
		self.view.close();
	}
}

impl std::fmt::Debug for NotificationFeed {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NotificationFeed").field("user", &self.user).finish_non_exhaustive()
	}
}


// vim: ts=4
