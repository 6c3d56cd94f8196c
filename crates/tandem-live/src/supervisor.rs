//! Reconnect Supervisor
//!
//! Shared backoff/retry state machine for every registry key:
//!
//! ```text
//! Connected --(Closed/Error)--> Backoff(n) --timer--> refresh --> Connecting --> Connected
//!                                   |
//!                                   +-- n >= max_reconnect_attempts --> Disconnected
//! ```
//!
//! The supervisor listens to registry status events. On a failure it schedules
//! `SubscriptionRegistry::refresh` after `base * factor^n` (capped), keeping one timer
//! per key: a new failure while a timer is pending replaces it. A Connected report
//! resets the counter. Once attempts are exhausted the key stays Disconnected until
//! `reconnect_now` is called.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tandem_types::remote_adapter::ChannelStatus;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::LiveConfig;
use crate::prelude::*;
use crate::registry::{RegistryEvent, SubscriptionRegistry};

/// Connection state as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
	Live,
	/// Transient: not surfaced as an error
	Reconnecting { attempt: u32 },
	/// Attempts exhausted: needs a manual reconnect
	Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
	Scheduled { key: Arc<str>, attempt: u32, delay: Duration },
	Exhausted { key: Arc<str> },
	Recovered { key: Arc<str> },
}

#[derive(Debug, Default)]
struct KeyState {
	attempts: u32,
	timer: Option<JoinHandle<()>>,
	exhausted: bool,
}

impl KeyState {
	fn cancel_timer(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.abort();
		}
	}
}

pub struct ReconnectSupervisor {
	registry: Arc<SubscriptionRegistry>,
	states: Mutex<HashMap<Arc<str>, KeyState>>,
	events: broadcast::Sender<SupervisorEvent>,
	config: LiveConfig,
}

impl ReconnectSupervisor {
	/// Create a supervisor and hook it into `registry`'s status events.
	pub fn attach(registry: &Arc<SubscriptionRegistry>) -> Arc<Self> {
		let config = registry.config().clone();
		let (events, _) = broadcast::channel(config.event_buffer.max(1));
		let supervisor = Arc::new(Self {
			registry: registry.clone(),
			states: Mutex::new(HashMap::new()),
			events,
			config,
		});

		let weak: Weak<Self> = Arc::downgrade(&supervisor);
		registry.add_listener(move |event| {
			if let Some(supervisor) = weak.upgrade() {
				supervisor.handle_event(event);
			}
		});
		supervisor
	}

	/// Receive scheduling/exhaustion/recovery notifications
	pub fn outcomes(&self) -> broadcast::Receiver<SupervisorEvent> {
		self.events.subscribe()
	}

	fn handle_event(self: &Arc<Self>, event: &RegistryEvent) {
		match event {
			RegistryEvent::StatusChanged { ticket, status } if status.is_failure() => {
				self.on_failure(&ticket.key);
			}
			RegistryEvent::StatusChanged { ticket, status: ChannelStatus::Connected } => {
				self.on_connected(&ticket.key);
			}
			RegistryEvent::RefreshFailed { ticket, error, transient } => {
				self.on_refresh_failed(&ticket.key, error, *transient);
			}
			RegistryEvent::Removed { key } => self.forget(key),
			RegistryEvent::StatusChanged { .. } | RegistryEvent::Refreshed { .. } => {}
		}
	}

	/// Handle a failed channel recreation, whoever triggered the refresh.
	///
	/// Transient errors count as one more failed attempt. Anything else stops the
	/// state machine: the key is Disconnected until `reconnect_now`.
	fn on_refresh_failed(self: &Arc<Self>, key: &Arc<str>, error: &str, transient: bool) {
		if transient {
			self.on_failure(key);
			return;
		}

		error!(key = %key, error = %error, "failed to recreate channel, giving up");
		{
			let mut states = self.states.lock();
			let state = states.entry(key.clone()).or_default();
			state.exhausted = true;
			state.cancel_timer();
		}
		self.registry.mark_disconnected(key);
		let _ = self.events.send(SupervisorEvent::Exhausted { key: key.clone() });
	}

	/// Handle a Closed/Error notification for `key`.
	///
	/// Returns the scheduled delay, or `None` when attempts are exhausted.
	pub fn on_failure(self: &Arc<Self>, key: &str) -> Option<Duration> {
		let key: Arc<str> = Arc::from(key);
		let mut states = self.states.lock();
		let state = states.entry(key.clone()).or_default();
		if state.exhausted {
			return None;
		}

		let attempt = state.attempts;
		if attempt >= self.config.max_reconnect_attempts {
			state.exhausted = true;
			state.cancel_timer();
			drop(states);

			self.registry.mark_disconnected(&key);
			warn!(key = %key, attempts = attempt, "reconnect attempts exhausted");
			let _ = self.events.send(SupervisorEvent::Exhausted { key });
			return None;
		}

		let delay = self.config.backoff_delay(attempt);
		state.attempts = attempt + 1;
		let weak = Arc::downgrade(self);
		let timer_key = key.clone();
		let timer = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			if let Some(supervisor) = weak.upgrade() {
				supervisor.fire(&timer_key);
			}
		});
		if let Some(previous) = state.timer.replace(timer) {
			previous.abort();
		}
		drop(states);

		self.registry.set_reconnect_attempts(&key, attempt + 1);
		info!(key = %key, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
		let _ = self.events.send(SupervisorEvent::Scheduled { key, attempt: attempt + 1, delay });
		Some(delay)
	}

	fn fire(&self, key: &Arc<str>) {
		let attempts = {
			let mut states = self.states.lock();
			let Some(state) = states.get_mut(key) else {
				return;
			};
			// Running inside this very task: release the handle without aborting
			state.timer = None;
			state.attempts
		};

		match self.registry.refresh(key) {
			Ok(true) => self.registry.set_reconnect_attempts(key, attempts),
			Ok(false) => self.forget(key),
			// Handled through the RefreshFailed event
			Err(err) => debug!(key = %key, error = %err, "scheduled reconnect failed"),
		}
	}

	/// Handle a Connected notification: reset the attempt counter.
	pub fn on_connected(&self, key: &str) {
		let recovered = {
			let mut states = self.states.lock();
			match states.get_mut(key) {
				Some(state) => {
					let recovered = state.attempts > 0 || state.exhausted;
					state.attempts = 0;
					state.exhausted = false;
					state.cancel_timer();
					recovered
				}
				None => false,
			}
		};

		if recovered {
			self.registry.set_reconnect_attempts(key, 0);
			info!(key = %key, "subscription recovered");
			let _ = self.events.send(SupervisorEvent::Recovered { key: Arc::from(key) });
		}
	}

	/// Manual retry ("tap to reconnect"): reset the state machine and refresh now.
	pub fn reconnect_now(&self, key: &str) -> ClResult<bool> {
		if let Some(state) = self.states.lock().get_mut(key) {
			state.attempts = 0;
			state.exhausted = false;
			state.cancel_timer();
		}
		info!(key = %key, "manual reconnect");
		self.registry.refresh(key)
	}

	/// Drop all state for `key`, cancelling a pending timer.
	pub fn forget(&self, key: &str) {
		if let Some(mut state) = self.states.lock().remove(key) {
			state.cancel_timer();
		}
	}

	/// Unsupervised Error/Disconnected handles count as Disconnected.
	pub fn link_state(&self, key: &str) -> LinkState {
		let Some(status) = self.registry.status(key) else {
			return LinkState::Disconnected;
		};
		match self.states.lock().get(key) {
			Some(state) if state.exhausted => return LinkState::Disconnected,
			Some(state) if state.attempts > 0 => {
				return LinkState::Reconnecting { attempt: state.attempts };
			}
			_ => {}
		}
		if status.is_live() { LinkState::Live } else { LinkState::Disconnected }
	}

	pub fn has_pending_timer(&self, key: &str) -> bool {
		self.states.lock().get(key).is_some_and(|state| state.timer.is_some())
	}
}

impl Drop for ReconnectSupervisor {
	fn drop(&mut self) {
		for state in self.states.get_mut().values_mut() {
			state.cancel_timer();
		}
	}
}

impl std::fmt::Debug for ReconnectSupervisor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ReconnectSupervisor").finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::{SubscriptionStatus, SubscriptionTicket};
	use crate::test_support::{FakeChannel, recording_factory, setup_test_logging};
	use std::sync::atomic::{AtomicBool, Ordering};
	use tandem_types::remote_adapter::Channel;

	fn setup(config: LiveConfig) -> (Arc<SubscriptionRegistry>, Arc<ReconnectSupervisor>) {
		let registry = SubscriptionRegistry::new(config).unwrap();
		let supervisor = ReconnectSupervisor::attach(&registry);
		(registry, supervisor)
	}

	/// Subscribe `key` with a factory that fails with `err()` while the switch is on
	fn subscribe_switchable(
		registry: &SubscriptionRegistry,
		key: &str,
		err: fn() -> Error,
	) -> Arc<AtomicBool> {
		let fail = Arc::new(AtomicBool::new(false));
		let f = fail.clone();
		registry
			.subscribe(key, move |ticket: &SubscriptionTicket| {
				if f.load(Ordering::SeqCst) {
					Err(err())
				} else {
					Ok(FakeChannel::new(&ticket.key) as Arc<dyn Channel>)
				}
			})
			.unwrap();
		fail
	}

	#[tokio::test(start_paused = true)]
	async fn test_backoff_terminates_after_max_attempts() {
		setup_test_logging();
		let (registry, supervisor) = setup(LiveConfig::default());
		let mut outcomes = supervisor.outcomes();
		let (factory, tickets) = recording_factory();
		registry.subscribe("messages:conv-42", factory).unwrap();

		let mut delays = Vec::new();
		for round in 0..5 {
			let ticket = tickets.lock().last().cloned().unwrap();
			registry.report_status(&ticket, ChannelStatus::Closed);
			match outcomes.recv().await.unwrap() {
				SupervisorEvent::Scheduled { attempt, delay, .. } => {
					assert_eq!(attempt, round + 1);
					delays.push(delay.as_millis() as u64);
					tokio::time::sleep(delay + Duration::from_millis(1)).await;
				}
				other => panic!("unexpected {:?}", other),
			}
			assert_eq!(tickets.lock().len(), round as usize + 2);
		}
		assert_eq!(delays, vec![3000, 4500, 6750, 10_000, 10_000]);

		// sixth failure: no further timer
		let ticket = tickets.lock().last().cloned().unwrap();
		registry.report_status(&ticket, ChannelStatus::Closed);
		assert_eq!(
			outcomes.recv().await.unwrap(),
			SupervisorEvent::Exhausted { key: Arc::from("messages:conv-42") }
		);
		assert!(!supervisor.has_pending_timer("messages:conv-42"));

		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(tickets.lock().len(), 6);
		assert_eq!(supervisor.link_state("messages:conv-42"), LinkState::Disconnected);
		assert_eq!(
			registry.handle("messages:conv-42").unwrap().status,
			SubscriptionStatus::Disconnected
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_connected_resets_attempts() {
		let (registry, supervisor) = setup(LiveConfig::default());
		let (factory, tickets) = recording_factory();
		registry.subscribe("k", factory).unwrap();

		let ticket = tickets.lock()[0].clone();
		registry.report_status(&ticket, ChannelStatus::Error("socket reset".into()));
		assert_eq!(supervisor.link_state("k"), LinkState::Reconnecting { attempt: 1 });
		assert_eq!(registry.handle("k").unwrap().reconnect_attempts, 1);

		tokio::time::sleep(Duration::from_millis(3001)).await;
		let ticket = tickets.lock().last().cloned().unwrap();
		assert_eq!(ticket.generation, 2);
		registry.report_status(&ticket, ChannelStatus::Connected);

		assert_eq!(supervisor.link_state("k"), LinkState::Live);
		assert_eq!(registry.handle("k").unwrap().reconnect_attempts, 0);

		// counter restarted: next delay is the base delay again
		let mut outcomes = supervisor.outcomes();
		registry.report_status(&ticket, ChannelStatus::Closed);
		match outcomes.recv().await.unwrap() {
			SupervisorEvent::Scheduled { attempt, delay, .. } => {
				assert_eq!(attempt, 1);
				assert_eq!(delay, Duration::from_millis(3000));
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_pending_timer_is_replaced_not_stacked() {
		let (registry, supervisor) = setup(LiveConfig::default());
		let (factory, tickets) = recording_factory();
		registry.subscribe("k", factory).unwrap();
		let ticket = tickets.lock()[0].clone();

		registry.report_status(&ticket, ChannelStatus::Closed);
		registry.report_status(&ticket, ChannelStatus::Closed);
		registry.report_status(&ticket, ChannelStatus::Closed);

		tokio::time::sleep(Duration::from_secs(30)).await;
		// only the last timer fired
		assert_eq!(tickets.lock().len(), 2);
		assert!(!supervisor.has_pending_timer("k"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_unsubscribe_cancels_timer() {
		let (registry, supervisor) = setup(LiveConfig::default());
		let (factory, tickets) = recording_factory();
		registry.subscribe("k", factory).unwrap();
		let ticket = tickets.lock()[0].clone();

		registry.report_status(&ticket, ChannelStatus::Closed);
		assert!(supervisor.has_pending_timer("k"));
		registry.unsubscribe("k");
		assert!(!supervisor.has_pending_timer("k"));

		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(tickets.lock().len(), 1);
		assert!(!registry.contains("k"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_reconnect_now_after_exhaustion() {
		let (registry, supervisor) = setup(LiveConfig::default().with_max_reconnect_attempts(0));
		let mut outcomes = supervisor.outcomes();
		let (factory, tickets) = recording_factory();
		registry.subscribe("k", factory).unwrap();
		let ticket = tickets.lock()[0].clone();

		registry.report_status(&ticket, ChannelStatus::Closed);
		assert!(matches!(outcomes.recv().await.unwrap(), SupervisorEvent::Exhausted { .. }));
		assert_eq!(supervisor.link_state("k"), LinkState::Disconnected);

		assert!(supervisor.reconnect_now("k").unwrap());
		assert_eq!(tickets.lock().len(), 2);
		let ticket = tickets.lock()[1].clone();
		registry.report_status(&ticket, ChannelStatus::Connected);
		assert_eq!(supervisor.link_state("k"), LinkState::Live);
	}

	#[tokio::test(start_paused = true)]
	async fn test_failed_refresh_all_disconnects() {
		setup_test_logging();
		let (registry, supervisor) = setup(LiveConfig::default());
		let mut outcomes = supervisor.outcomes();
		let fail = subscribe_switchable(&registry, "k", || Error::Factory("bad filter".into()));

		fail.store(true, Ordering::SeqCst);
		assert_eq!(registry.refresh_all(), 0);

		assert_eq!(outcomes.recv().await.unwrap(), SupervisorEvent::Exhausted { key: Arc::from("k") });
		assert_eq!(supervisor.link_state("k"), LinkState::Disconnected);
		assert_eq!(registry.status("k"), Some(SubscriptionStatus::Disconnected));
		assert!(!supervisor.has_pending_timer("k"));

		fail.store(false, Ordering::SeqCst);
		assert!(supervisor.reconnect_now("k").unwrap());
		assert_eq!(supervisor.link_state("k"), LinkState::Live);
	}

	#[tokio::test(start_paused = true)]
	async fn test_transient_refresh_failure_is_retried() {
		let (registry, supervisor) = setup(LiveConfig::default());
		let mut outcomes = supervisor.outcomes();
		let fail = subscribe_switchable(&registry, "k", || Error::Transport("socket reset".into()));

		fail.store(true, Ordering::SeqCst);
		assert!(registry.refresh("k").is_err());
		assert!(matches!(
			outcomes.recv().await.unwrap(),
			SupervisorEvent::Scheduled { attempt: 1, .. }
		));
		assert_eq!(supervisor.link_state("k"), LinkState::Reconnecting { attempt: 1 });
		assert!(supervisor.has_pending_timer("k"));

		fail.store(false, Ordering::SeqCst);
		tokio::time::sleep(Duration::from_millis(3001)).await;
		assert_eq!(registry.status("k"), Some(SubscriptionStatus::Connecting));
		assert!(!supervisor.has_pending_timer("k"));
	}

	#[test]
	fn test_link_state_of_unsupervised_error_handle() {
		let registry = SubscriptionRegistry::new(LiveConfig::default()).unwrap();
		let supervisor = Arc::new(ReconnectSupervisor {
			registry: registry.clone(),
			states: Mutex::new(HashMap::new()),
			events: broadcast::channel(1).0,
			config: LiveConfig::default(),
		});
		let fail = subscribe_switchable(&registry, "k", || Error::Factory("down".into()));
		assert_eq!(supervisor.link_state("k"), LinkState::Live);

		fail.store(true, Ordering::SeqCst);
		assert!(registry.refresh("k").is_err());
		assert_eq!(supervisor.link_state("k"), LinkState::Disconnected);
		assert_eq!(supervisor.link_state("missing"), LinkState::Disconnected);
	}

	#[tokio::test(start_paused = true)]
	async fn test_stale_generation_failure_is_ignored() {
		let (registry, supervisor) = setup(LiveConfig::default());
		let (factory, tickets) = recording_factory();
		registry.subscribe("k", factory).unwrap();
		let old = tickets.lock()[0].clone();
		registry.refresh("k").unwrap();

		// late Closed from the replaced channel must not trigger a reconnect
		registry.report_status(&old, ChannelStatus::Closed);
		assert!(!supervisor.has_pending_timer("k"));
		assert_eq!(supervisor.link_state("k"), LinkState::Live);
	}
}

// vim: ts=4
