//! Error type shared by the engine, the chat layer and adapter implementations.

use std::fmt;

pub type ClResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	NotFound,
	/// Channel failed to open or closed unexpectedly
	Transport(String),
	/// A write (send, mark-as-read, presence update) was rejected
	Mutation(String),
	/// Inbound event is missing a required field or does not decode
	MalformedEvent(String),
	/// Channel-creation callback failed (bad filter, missing config)
	Factory(String),
	ChannelClosed,
	ConfigError(String),
	Parse,
	Internal(String),

	// externals
	Json(serde_json::Error),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::NotFound => write!(f, "not found"),
			Error::Transport(msg) => write!(f, "transport error: {}", msg),
			Error::Mutation(msg) => write!(f, "mutation failed: {}", msg),
			Error::MalformedEvent(msg) => write!(f, "malformed event: {}", msg),
			Error::Factory(msg) => write!(f, "channel factory failed: {}", msg),
			Error::ChannelClosed => write!(f, "channel closed"),
			Error::ConfigError(msg) => write!(f, "invalid configuration: {}", msg),
			Error::Parse => write!(f, "parse error"),
			Error::Internal(msg) => write!(f, "internal error: {}", msg),
			Error::Json(e) => write!(f, "json error: {}", e),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Json(e) => Some(e),
			_ => None,
		}
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Json(err)
	}
}

impl From<tokio::task::JoinError> for Error {
	fn from(err: tokio::task::JoinError) -> Self {
		Self::Internal(err.to_string())
	}
}

impl Error {
	/// Transient failures the reconnect machinery is allowed to retry
	pub fn is_transient(&self) -> bool {
		matches!(self, Error::Transport(_) | Error::ChannelClosed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_display() {
		assert_eq!(Error::Factory("bad filter".into()).to_string(), "channel factory failed: bad filter");
		assert_eq!(Error::NotFound.to_string(), "not found");
	}

	#[test]
	fn test_transient() {
		assert!(Error::Transport("reset".into()).is_transient());
		assert!(Error::ChannelClosed.is_transient());
		assert!(!Error::Factory("x".into()).is_transient());
		assert!(!Error::Mutation("x".into()).is_transient());
	}

	#[test]
	fn test_from_json() {
		let err: Error = serde_json::from_str::<u32>("nope").map_err(Error::from).unwrap_err();
		assert!(matches!(err, Error::Json(_)));
	}
}

// vim: ts=4
