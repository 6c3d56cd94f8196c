//! Shared types, error type, and the remote data service adapter trait for the
//! Tandem client engine.
//!
//! This crate holds the foundational types that are shared between the engine,
//! the chat layer and all adapter implementations.

#![forbid(unsafe_code)]

pub mod error;
pub mod prelude;
pub mod remote_adapter;
pub mod types;
pub mod utils;

// vim: ts=4
