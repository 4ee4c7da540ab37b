use crate::{
	helper::Inner,
	subscription::{Subscription, SubscriptionStatus},
};

use std::{
	sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
	time::Duration,
};

use tokio::{
	task::JoinHandle,
	time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct State {
	subscriptions: Vec<Arc<Subscription>>,
	/// Running poller, there is one if and only if `subscriptions` isn't empty.
	poller: Option<JoinHandle<()>>,
	/// Set while the poller is in the middle of a round, it then stops on its own.
	ticking: bool,
}

/// Subscriptions whose path couldn't be opened, retried on a timer until they can.
#[derive(Debug, Default)]
pub(crate) struct MissingFiles {
	state: Mutex<State>,
}

impl MissingFiles {
	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Parks `sub`, starting the poller with `spawn_poller` if it isn't running.
	pub(crate) fn add(
		&self,
		sub: Arc<Subscription>,
		spawn_poller: impl FnOnce() -> JoinHandle<()>,
	) {
		let mut state = self.lock();

		if state.subscriptions.iter().any(|parked| parked.id() == sub.id()) {
			warn!(
				id = %sub.id(),
				path = %sub.path().display(),
				"Subscription is already tracked as missing;"
			);
			return;
		}

		{
			let mut sub_state = sub.state();
			match sub_state.status {
				SubscriptionStatus::New | SubscriptionStatus::Missing => {
					sub_state.status = SubscriptionStatus::Missing;
				}
				status => {
					trace!(id = %sub.id(), ?status, "Not parking subscription;");
					return;
				}
			}
		}

		debug!(id = %sub.id(), path = %sub.path().display(), "Path is missing, polling for it;");
		state.subscriptions.push(sub);

		if state.poller.is_none() {
			trace!("Starting missing-file poller;");
			state.poller = Some(spawn_poller());
		}
	}

	/// No-op if `sub` isn't parked. Stops the poller when nothing is left to poll.
	pub(crate) fn remove(&self, sub: &Subscription) {
		let mut state = self.lock();
		state
			.subscriptions
			.retain(|parked| parked.id() != sub.id());

		if state.subscriptions.is_empty() && !state.ticking {
			if let Some(poller) = state.poller.take() {
				trace!("Nothing left to poll, stopping missing-file poller;");
				poller.abort();
			}
		}
	}

	fn forget(&self, sub: &Subscription) {
		self.lock()
			.subscriptions
			.retain(|parked| parked.id() != sub.id());
	}

	pub(crate) fn contains(&self, sub: &Subscription) -> bool {
		self.lock()
			.subscriptions
			.iter()
			.any(|parked| parked.id() == sub.id())
	}

	pub(crate) fn len(&self) -> usize {
		self.lock().subscriptions.len()
	}

	pub(crate) fn is_polling(&self) -> bool {
		self.lock().poller.is_some()
	}

	/// Aborts the poller, parked subscriptions stay parked.
	pub(crate) fn stop(&self) {
		let mut state = self.lock();
		state.ticking = false;
		if let Some(poller) = state.poller.take() {
			poller.abort();
		}
	}

	/// One poller round: every parked subscription whose path can be opened now becomes
	/// active and gets a created event. Returns `false` when nothing is left to poll, the
	/// poller is considered stopped from then on.
	async fn tick(&self, backend: &Inner) -> bool {
		let parked = {
			let mut state = self.lock();
			state.ticking = true;
			state.subscriptions.clone()
		};

		for sub in parked {
			if sub.status() == SubscriptionStatus::Cancelled {
				self.forget(&sub);
				continue;
			}

			if backend.start_watching(&sub) {
				debug!(id = %sub.id(), path = %sub.path().display(), "Missing path appeared;");
				self.forget(&sub);
				backend.file_appeared(&sub).await;
			}
		}

		let mut state = self.lock();
		state.ticking = false;
		if state.subscriptions.is_empty() {
			trace!("Nothing left to poll, stopping missing-file poller;");
			state.poller = None;
			false
		} else {
			true
		}
	}
}

pub(crate) async fn run_poller(backend: Weak<Inner>, period: Duration) {
	let mut ticker = interval_at(Instant::now() + period, period);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		ticker.tick().await;

		let Some(backend) = backend.upgrade() else {
			break;
		};

		if !backend.missing().tick(&backend).await {
			break;
		}
	}
}
