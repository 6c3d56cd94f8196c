//! Engine configuration
//!
//! All knobs have defaults matching the hosted service's transport behaviour.
//! Values can be deserialized from a config document or overlaid from
//! `TANDEM_*` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::prelude::*;

/// Reconnect, staleness and notification settings shared by every live component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LiveConfig {
	/// Reconnect attempts before a key is marked permanently disconnected
	pub max_reconnect_attempts: u32,

	/// Delay before the first reconnect attempt
	pub base_backoff_ms: u64,

	/// Multiplier applied per attempt
	pub backoff_factor: f64,

	/// Upper bound for a single backoff delay
	pub max_backoff_ms: u64,

	/// A subscription untouched for longer than this is considered stale
	pub stale_threshold_ms: u64,

	/// Debounce window for repeated "became visible" signals
	pub visibility_debounce_ms: u64,

	/// Minimum time between two visibility-triggered global refreshes
	pub refresh_all_min_interval_ms: u64,

	/// How many subscriptions are sampled for staleness on a visibility signal
	pub stale_sample_size: usize,

	/// Capacity of broadcast channels carrying registry and supervisor events
	pub event_buffer: usize,
}

impl Default for LiveConfig {
	fn default() -> Self {
		Self {
			max_reconnect_attempts: 5,
			base_backoff_ms: 3000,
			backoff_factor: 1.5,
			max_backoff_ms: 10_000,
			stale_threshold_ms: 120_000,
			visibility_debounce_ms: 500,
			refresh_all_min_interval_ms: 30_000,
			stale_sample_size: 3,
			event_buffer: 128,
		}
	}
}

impl LiveConfig {
	pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
		self.max_reconnect_attempts = attempts;
		self
	}

	pub fn with_base_backoff_ms(mut self, ms: u64) -> Self {
		self.base_backoff_ms = ms;
		self
	}

	pub fn with_backoff_factor(mut self, factor: f64) -> Self {
		self.backoff_factor = factor;
		self
	}

	pub fn with_max_backoff_ms(mut self, ms: u64) -> Self {
		self.max_backoff_ms = ms;
		self
	}

	pub fn with_stale_threshold_ms(mut self, ms: u64) -> Self {
		self.stale_threshold_ms = ms;
		self
	}

	pub fn with_visibility_debounce_ms(mut self, ms: u64) -> Self {
		self.visibility_debounce_ms = ms;
		self
	}

	/// Overlay `TANDEM_*` environment variables on top of `self`.
	///
	/// Recognized: `TANDEM_MAX_RECONNECT_ATTEMPTS`, `TANDEM_BASE_BACKOFF_MS`,
	/// `TANDEM_BACKOFF_FACTOR`, `TANDEM_MAX_BACKOFF_MS`, `TANDEM_STALE_THRESHOLD_MS`,
	/// `TANDEM_VISIBILITY_DEBOUNCE_MS`.
	pub fn merge_env(self) -> ClResult<Self> {
		self.merge_vars(|name| std::env::var(name).ok())
	}

	/// Defaults overlaid with the environment, validated.
	pub fn from_env() -> ClResult<Self> {
		let config = Self::default().merge_env()?;
		config.validate()?;
		Ok(config)
	}

	fn merge_vars<F>(mut self, var: F) -> ClResult<Self>
	where
		F: Fn(&str) -> Option<String>,
	{
		fn parse<T: std::str::FromStr>(name: &str, value: &str) -> ClResult<T> {
			value
				.trim()
				.parse()
				.map_err(|_| Error::ConfigError(format!("{} has invalid value '{}'", name, value)))
		}

		if let Some(v) = var("TANDEM_MAX_RECONNECT_ATTEMPTS") {
			self.max_reconnect_attempts = parse("TANDEM_MAX_RECONNECT_ATTEMPTS", &v)?;
		}
		if let Some(v) = var("TANDEM_BASE_BACKOFF_MS") {
			self.base_backoff_ms = parse("TANDEM_BASE_BACKOFF_MS", &v)?;
		}
		if let Some(v) = var("TANDEM_BACKOFF_FACTOR") {
			self.backoff_factor = parse("TANDEM_BACKOFF_FACTOR", &v)?;
		}
		if let Some(v) = var("TANDEM_MAX_BACKOFF_MS") {
			self.max_backoff_ms = parse("TANDEM_MAX_BACKOFF_MS", &v)?;
		}
		if let Some(v) = var("TANDEM_STALE_THRESHOLD_MS") {
			self.stale_threshold_ms = parse("TANDEM_STALE_THRESHOLD_MS", &v)?;
		}
		if let Some(v) = var("TANDEM_VISIBILITY_DEBOUNCE_MS") {
			self.visibility_debounce_ms = parse("TANDEM_VISIBILITY_DEBOUNCE_MS", &v)?;
		}
		Ok(self)
	}

	pub fn validate(&self) -> ClResult<()> {
		if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
			return Err(Error::ConfigError(format!(
				"backoffFactor must be >= 1.0, got {}",
				self.backoff_factor
			)));
		}
		if self.max_backoff_ms < self.base_backoff_ms {
			return Err(Error::ConfigError(format!(
				"maxBackoffMs ({}) is below baseBackoffMs ({})",
				self.max_backoff_ms, self.base_backoff_ms
			)));
		}
		if self.event_buffer == 0 {
			return Err(Error::ConfigError("eventBuffer must be non-zero".into()));
		}
		Ok(())
	}

	/// Backoff delay before reconnect attempt `attempt` (zero-based):
	/// `base * factor^attempt`, capped at `max_backoff_ms`.
	pub fn backoff_delay(&self, attempt: u32) -> Duration {
		let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
		let raw = self.base_backoff_ms as f64 * self.backoff_factor.powi(exp);
		let capped = raw.min(self.max_backoff_ms as f64);
		Duration::from_millis(capped as u64)
	}

	pub fn stale_threshold(&self) -> Duration {
		Duration::from_millis(self.stale_threshold_ms)
	}

	pub fn visibility_debounce(&self) -> Duration {
		Duration::from_millis(self.visibility_debounce_ms)
	}

	pub fn refresh_all_min_interval(&self) -> Duration {
		Duration::from_millis(self.refresh_all_min_interval_ms)
	}
}


// vim: ts=4
