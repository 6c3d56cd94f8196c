//! Channels and in-order callback delivery
//!
//! Every channel owns a delivery task fed through an unbounded queue, so callbacks
//! run asynchronously (as with a network transport) but in the order they were
//! produced for that channel. Dropping the queue's last sender ends the task once
//! the queued deliveries are drained.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Weak;
use tandem_types::error::ClResult;
use tandem_types::remote_adapter::{
	ChangeEvent, ChangeHandlers, Channel, ChannelStatus, PresenceChannel, PresenceHandlers,
	PresenceState,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::Shared;
use crate::error::Error;

#[derive(Debug, Clone)]
pub(crate) enum Delivery {
	Event(ChangeEvent),
	Status(ChannelStatus),
	Sync(PresenceState),
	Join(String, Vec<Value>),
	Leave(String, Vec<Value>),
}

pub(crate) enum Handlers {
	Change(ChangeHandlers),
	Presence(PresenceHandlers),
}

impl Handlers {
	fn dispatch(&self, delivery: Delivery) {
		match (self, delivery) {
			(Handlers::Change(h), Delivery::Event(event)) => (h.on_event)(event),
			(Handlers::Change(h), Delivery::Status(status)) => (h.on_status)(status),
			(Handlers::Presence(h), Delivery::Status(status)) => (h.on_status)(status),
			(Handlers::Presence(h), Delivery::Sync(state)) => (h.on_sync)(state),
			(Handlers::Presence(h), Delivery::Join(key, metas)) => (h.on_join)(&key, &metas),
			(Handlers::Presence(h), Delivery::Leave(key, metas)) => (h.on_leave)(&key, &metas),
			(_, delivery) => debug!(?delivery, "delivery not applicable to channel kind"),
		}
	}
}

pub(crate) type DeliverySender = mpsc::UnboundedSender<Delivery>;

/// Start the delivery task for `handlers` and queue the initial status transitions
pub(crate) fn spawn_delivery(handlers: Handlers) -> Result<DeliverySender, Error> {
	let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
	let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
	runtime.spawn(async move {
		while let Some(delivery) = rx.recv().await {
			handlers.dispatch(delivery);
		}
	});

	let _ = tx.send(Delivery::Status(ChannelStatus::Connecting));
	let _ = tx.send(Delivery::Status(ChannelStatus::Connected));
	Ok(tx)
}

/// Change feed channel handle
#[derive(Debug)]
pub struct MemoryChannel {
	pub(crate) id: u64,
	pub(crate) topic: String,
	pub(crate) shared: Weak<Shared>,
}

impl Channel for MemoryChannel {
	fn topic(&self) -> &str {
		&self.topic
	}

	fn close(&self) -> ClResult<()> {
		if let Some(shared) = self.shared.upgrade() {
			shared.remove_feed(self.id);
		}
		debug!(topic = %self.topic, "channel closed");
		Ok(())
	}
}

/// Presence channel handle
#[derive(Debug)]
pub struct MemoryPresenceChannel {
	pub(crate) id: u64,
	pub(crate) room: String,
	pub(crate) topic: String,
	pub(crate) shared: Weak<Shared>,
}

impl Channel for MemoryPresenceChannel {
	fn topic(&self) -> &str {
		&self.topic
	}

	fn close(&self) -> ClResult<()> {
		if let Some(shared) = self.shared.upgrade() {
			shared.leave_room(&self.room, self.id);
		}
		debug!(topic = %self.topic, "presence channel closed");
		Ok(())
	}
}

#[async_trait]
impl PresenceChannel for MemoryPresenceChannel {
	async fn track(&self, payload: Value) -> ClResult<()> {
		let shared = self.shared.upgrade().ok_or(Error::Closed)?;
		shared.set_presence(&self.room, self.id, Some(payload))?;
		Ok(())
	}

	async fn untrack(&self) -> ClResult<()> {
		let shared = self.shared.upgrade().ok_or(Error::Closed)?;
		shared.set_presence(&self.room, self.id, None)?;
		Ok(())
	}
}

// vim: ts=4
