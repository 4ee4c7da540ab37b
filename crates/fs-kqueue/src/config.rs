use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_MISSING_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 16;

/// Tunables for the kqueue backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KqueueConfig {
	/// How often paths that don't exist yet are retried, in milliseconds.
	pub missing_poll_interval_ms: u64,
	/// Initial number of slots in the kernel event buffer, it doubles whenever a wait fills it.
	pub event_buffer_capacity: usize,
	pub thread_name: String,
}

impl KqueueConfig {
	#[must_use]
	pub const fn missing_poll_interval(&self) -> Duration {
		// A zero period would make the poller spin
		Duration::from_millis(if self.missing_poll_interval_ms == 0 {
			1
		} else {
			self.missing_poll_interval_ms
		})
	}
}

impl Default for KqueueConfig {
	fn default() -> Self {
		Self {
			missing_poll_interval_ms: DEFAULT_MISSING_POLL_INTERVAL_MS,
			event_buffer_capacity: DEFAULT_EVENT_BUFFER_CAPACITY,
			thread_name: "sd-fs-kqueue".to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_fields_fall_back_to_defaults() {
		let config: KqueueConfig =
			serde_json::from_str(r#"{ "missing_poll_interval_ms": 1000 }"#).unwrap();

		assert_eq!(config.missing_poll_interval(), Duration::from_secs(1));
		assert_eq!(config.event_buffer_capacity, DEFAULT_EVENT_BUFFER_CAPACITY);
		assert_eq!(config.thread_name, "sd-fs-kqueue");
	}

	#[test]
	fn default_poll_interval_is_a_quarter_second() {
		assert_eq!(
			KqueueConfig::default().missing_poll_interval(),
			Duration::from_millis(250)
		);
	}
}
