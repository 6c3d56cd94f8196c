//! Chat message row model

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use tandem_live::{LiveRecord, decode_row};
use tandem_types::types::Row;

use crate::prelude::*;

pub const MESSAGES_TABLE: &str = "messages";

/// Accept ids sent either as strings or as numbers
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
	D: Deserializer<'de>,
{
	match Value::deserialize(deserializer)? {
		Value::String(id) if !id.is_empty() => Ok(id),
		Value::Number(id) => Ok(id.to_string()),
		other => Err(serde::de::Error::custom(format!("invalid id: {}", other))),
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	#[serde(deserialize_with = "string_or_number")]
	pub id: String,
	pub conversation_id: String,
	pub sender_id: String,
	#[serde(default)]
	pub receiver_id: Option<String>,
	#[serde(default)]
	pub content: String,
	#[serde(default)]
	pub attachment_url: Option<String>,
	pub created_at: Timestamp,
	#[serde(default)]
	pub is_read: bool,
}

impl Message {
	pub fn is_from(&self, user: &str) -> bool {
		self.sender_id == user
	}
}

impl LiveRecord for Message {
	fn decode(row: Row) -> ClResult<Self> {
		decode_row(row)
	}

	fn record_key(&self) -> Option<String> {
		Some(self.id.clone())
	}

	/// Oldest first, ties broken by id
	fn compare(&self, other: &Self) -> Ordering {
		self.created_at.cmp(&other.created_at).then_with(|| self.id.cmp(&other.id))
	}
}


// vim: ts=4
