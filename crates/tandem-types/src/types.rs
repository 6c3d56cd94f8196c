//! Common types used throughout the Tandem engine.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

// Timestamp //
//***********//
/// Wall-clock time in milliseconds since the Unix epoch.
///
/// Row timestamps (`created_at`) and event receipt times use this type so that
/// same-second events still order deterministically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub fn as_millis(self) -> i64 {
		self.0
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl Serialize for Timestamp {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_i64(self.0)
	}
}

impl<'de> Deserialize<'de> for Timestamp {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		Ok(Timestamp(i64::deserialize(deserializer)?))
	}
}

pub fn now() -> Timestamp {
	let res = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
	Timestamp(i64::try_from(res.as_millis()).unwrap_or(i64::MAX))
}

// Row //
//*****//
/// A row as delivered by the remote data service: an opaque JSON object.
pub type Row = serde_json::Value;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_timestamp_ordering() {
		assert!(Timestamp(100) < Timestamp(200));
		assert_eq!(Timestamp(1234).as_millis(), 1234);
	}

	#[test]
	fn test_timestamp_serde() {
		let json = serde_json::to_string(&Timestamp(1234)).unwrap();
		assert_eq!(json, "1234");
		let ts: Timestamp = serde_json::from_str("5678").unwrap();
		assert_eq!(ts, Timestamp(5678));
	}
}

// vim: ts=4
