use std::fmt;
use tandem_types::error::Error as TandemError;

/// Internal error type for the memory adapter
#[derive(Debug)]
pub enum Error {
	InvalidPayload(String),
	DuplicateKey(String),
	InvalidPath(String),
	/// Failure requested through the fault injection API
	Injected(String),
	ChannelRefused(String),
	NoRuntime,
	Closed,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Error::InvalidPayload(msg) => write!(f, "invalid payload: {}", msg),
			Error::DuplicateKey(key) => write!(f, "duplicate key: {}", key),
			Error::InvalidPath(path) => write!(f, "invalid object path: {}", path),
			Error::Injected(msg) => write!(f, "injected failure: {}", msg),
			Error::ChannelRefused(topic) => write!(f, "channel refused: {}", topic),
			Error::NoRuntime => write!(f, "no async runtime to deliver events"),
			Error::Closed => write!(f, "adapter closed"),
		}
	}
}

impl std::error::Error for Error {}

impl From<Error> for TandemError {
	fn from(e: Error) -> Self {
		match e {
			Error::InvalidPayload(_)
			| Error::DuplicateKey(_)
			| Error::InvalidPath(_)
			| Error::Injected(_) => TandemError::Mutation(e.to_string()),
			Error::ChannelRefused(_) | Error::NoRuntime => TandemError::Factory(e.to_string()),
			Error::Closed => TandemError::ChannelClosed,
		}
	}
}


// vim: ts=4
