//! Subscription lifecycle and event dispatching.
//!
//! Lock order: the subscription table is taken before a subscription's own state, the
//! missing-file set is taken before a subscription's state, and the table and the missing-file
//! set are never held at the same time. No lock is held across an `.await` or a blocking
//! OS call.

use crate::{
	config::KqueueConfig,
	dep_list::{diff_with, DiffHandler, DirEntry, DirListing, Inode},
	error::{Error, StartupError, StartupStage},
	event::{kind_for_flags, MonitorEvent, VnodeFlags},
	fs::FileSystem,
	missing::{run_poller, MissingFiles},
	subscription::{Subscription, SubscriptionId, SubscriptionStatus},
	thread::{EventThread, KernelQueue, Notification},
	utils::monotonic_micros,
};

use std::{
	collections::HashMap,
	fmt, io,
	os::fd::{AsRawFd, RawFd},
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
	},
};

use async_channel as chan;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, instrument, trace, warn, Instrument};

/// Outcome of trying to open and register a subscription's path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOutcome {
	Watching,
	/// The path can't be opened right now, most likely it doesn't exist.
	Unavailable,
	/// Cancelled or already active, nothing was done.
	Skipped,
}

pub(crate) struct Inner {
	config: KqueueConfig,
	fs: Arc<dyn FileSystem>,
	runtime: Handle,
	/// Open descriptor to the subscription watching through it.
	subscriptions: Mutex<HashMap<RawFd, Arc<Subscription>>>,
	missing: MissingFiles,
	thread: EventThread,
	next_id: AtomicU64,
	dispatcher: Mutex<Option<JoinHandle<()>>>,
	is_shut_down: AtomicBool,
}

impl Inner {
	fn subscriptions(&self) -> MutexGuard<'_, HashMap<RawFd, Arc<Subscription>>> {
		self.subscriptions
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	pub(crate) const fn missing(&self) -> &MissingFiles {
		&self.missing
	}

	fn lookup(&self, fd: RawFd, id: SubscriptionId) -> Option<Arc<Subscription>> {
		self.subscriptions()
			.get(&fd)
			.filter(|sub| sub.id() == id)
			.map(Arc::clone)
	}

	fn try_start(&self, sub: &Arc<Subscription>) -> StartOutcome {
		let opened = match self.fs.open(sub.path()) {
			Ok(opened) => opened,
			Err(e) => {
				trace!(?e, path = %sub.path().display(), "Unable to open watch target;");
				return StartOutcome::Unavailable;
			}
		};

		let listing = opened
			.is_directory
			.then(|| self.list_directory(sub.path()));
		let raw_fd = opened.fd.as_raw_fd();

		{
			let mut subscriptions = self.subscriptions();
			let mut state = sub.state();

			if matches!(
				state.status,
				SubscriptionStatus::Active | SubscriptionStatus::Cancelled
			) {
				trace!(id = %sub.id(), status = ?state.status, "Not starting subscription;");
				// Never handed to the kernel-event thread, so it is closed right here
				return StartOutcome::Skipped;
			}

			state.status = SubscriptionStatus::Active;
			state.fd = Some(raw_fd);
			state.is_directory = opened.is_directory;
			state.inode = Some(opened.inode);
			state.cached_listing = listing;

			subscriptions.insert(raw_fd, Arc::clone(sub));
		}

		debug!(
			id = %sub.id(),
			fd = raw_fd,
			path = %sub.path().display(),
			is_directory = opened.is_directory,
			"Watching path;"
		);

		self.thread.push_fd(sub.id(), opened.fd);

		StartOutcome::Watching
	}

	pub(crate) fn start_watching(&self, sub: &Arc<Subscription>) -> bool {
		self.try_start(sub) == StartOutcome::Watching
	}

	fn list_directory(&self, path: &Path) -> DirListing {
		self.fs.read_dir(path).unwrap_or_else(|e| {
			warn!(?e, path = %path.display(), "Failed to list directory, treating it as empty;");
			DirListing::new()
		})
	}

	fn park(self: &Arc<Self>, sub: Arc<Subscription>) {
		self.missing.add(sub, || {
			self.runtime.spawn(
				run_poller(Arc::downgrade(self), self.config.missing_poll_interval())
					.in_current_span(),
			)
		});
	}

	fn add(self: &Arc<Self>, sub: &Arc<Subscription>) {
		if self.try_start(sub) == StartOutcome::Unavailable {
			self.park(Arc::clone(sub));
		}
	}

	/// Moves an active subscription to `next`, removing it from the table and asking the
	/// kernel-event thread to close its descriptor. Returns `false` if it wasn't active.
	fn detach(&self, sub: &Subscription, next: SubscriptionStatus) -> bool {
		let fd = {
			let mut subscriptions = self.subscriptions();
			let mut state = sub.state();

			if state.status != SubscriptionStatus::Active {
				return false;
			}

			state.status = next;
			state.cached_listing = None;
			let fd = state.fd.take();

			if let Some(fd) = fd {
				if subscriptions
					.get(&fd)
					.is_some_and(|registered| registered.id() == sub.id())
				{
					subscriptions.remove(&fd);
				}
			}

			fd
		};

		if let Some(fd) = fd {
			self.thread.remove_fds(vec![fd]);
		}

		true
	}

	fn cancel(&self, sub: &Subscription) {
		let fd = {
			let mut subscriptions = self.subscriptions();
			let mut state = sub.state();

			state.status = SubscriptionStatus::Cancelled;
			state.cached_listing = None;
			let fd = state.fd.take();

			if let Some(fd) = fd {
				if subscriptions
					.get(&fd)
					.is_some_and(|registered| registered.id() == sub.id())
				{
					subscriptions.remove(&fd);
				}
			}

			fd
		};

		self.missing.remove(sub);

		if let Some(fd) = fd {
			self.thread.remove_fds(vec![fd]);
		}
	}

	pub(crate) async fn file_appeared(&self, sub: &Subscription) {
		// The path may have vanished again since it was opened
		if self.fs.exists(sub.path()) {
			send(
				sub,
				vec![MonitorEvent::created(sub.path(), monotonic_micros())],
			)
			.await;
		}
	}

	fn rescan_directory(&self, sub: &Subscription, timestamp: u64) -> Vec<MonitorEvent> {
		let listing = self.list_directory(sub.path());

		let previous = {
			let mut state = sub.state();
			if state.status != SubscriptionStatus::Active {
				return vec![];
			}
			state.cached_listing.replace(listing.clone())
		}
		.unwrap_or_default();

		let mut translator = DirectoryEvents {
			dir: sub.path(),
			timestamp,
			events: Vec::new(),
		};
		diff_with(&previous, &listing, &mut translator);

		translator.events
	}

	async fn process_notification(self: &Arc<Self>, notification: Notification) {
		let Notification { fd, id, flags } = notification;

		let Some(sub) = self.lookup(fd, id) else {
			trace!(fd, %id, ?flags, "Notification for a subscription that is gone;");
			return;
		};

		trace!(fd, %id, ?flags, path = %sub.path().display(), "Kernel event;");

		let timestamp = monotonic_micros();
		let is_directory = sub.is_directory();

		let mut events = if is_directory && flags.is_content_change() {
			self.rescan_directory(&sub, timestamp)
		} else {
			Vec::new()
		};

		events.extend(
			kind_for_flags(flags, is_directory)
				.map(|kind| MonitorEvent::new(kind, sub.path(), timestamp)),
		);

		// Revoked paths can come back after a remount, they are polled for like deleted ones
		let repark = flags.intersects(VnodeFlags::DELETE.union(VnodeFlags::REVOKE))
			&& self.detach(&sub, SubscriptionStatus::Missing);

		send(&sub, events).await;

		if repark {
			self.park(sub);
		}
	}

	fn shutdown(&self) {
		self.thread.stop();

		if let Some(dispatcher) = self
			.dispatcher
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
		{
			dispatcher.abort();
		}

		self.missing.stop();
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		self.shutdown();
	}
}

async fn send(sub: &Subscription, events: Vec<MonitorEvent>) {
	for event in events {
		if sub.sink().send(event).await.is_err() {
			trace!(id = %sub.id(), "Event receiver is gone;");
			return;
		}
	}
}

async fn dispatch_notifications(backend: Weak<Inner>, notifications_rx: chan::Receiver<Notification>) {
	while let Ok(notification) = notifications_rx.recv().await {
		let Some(backend) = backend.upgrade() else {
			break;
		};

		backend.process_notification(notification).await;
	}

	trace!("Notification channel closed, dispatcher exiting;");
}

/// Translates directory diff results into events about the directory's children.
struct DirectoryEvents<'a> {
	dir: &'a Path,
	timestamp: u64,
	events: Vec<MonitorEvent>,
}

impl DirectoryEvents<'_> {
	fn child(&self, entry: &DirEntry) -> PathBuf {
		self.dir.join(&entry.name)
	}
}

impl DiffHandler for DirectoryEvents<'_> {
	fn added(&mut self, entry: &DirEntry) {
		self.events
			.push(MonitorEvent::created(self.child(entry), self.timestamp));
	}

	fn removed(&mut self, entry: &DirEntry) {
		self.events
			.push(MonitorEvent::deleted(self.child(entry), self.timestamp));
	}

	fn replaced(&mut self, from: &DirEntry, to: &DirEntry) {
		self.events.push(MonitorEvent::renamed(
			self.child(from),
			self.child(to),
			self.timestamp,
		));
	}

	fn overwritten(&mut self, entry: &DirEntry, _new_inode: Inode) {
		let path = self.child(entry);
		self.events
			.push(MonitorEvent::deleted(path.clone(), self.timestamp));
		self.events.push(MonitorEvent::created(path, self.timestamp));
	}

	fn moved(&mut self, from: &DirEntry, to: &DirEntry) {
		self.events.push(MonitorEvent::renamed(
			self.child(from),
			self.child(to),
			self.timestamp,
		));
	}
}

/// Handle to a running kqueue backend, cheap to clone.
///
/// Must be created from within a tokio runtime, the notification dispatcher and the
/// missing-file poller run as tasks on it.
#[derive(Clone)]
pub struct Backend {
	inner: Arc<Inner>,
}

impl fmt::Debug for Backend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Backend")
			.field("config", &self.inner.config)
			.field("active", &self.active_count())
			.field("missing", &self.missing_count())
			.field("thread_running", &self.inner.thread.is_running())
			.field("is_shut_down", &self.is_shut_down())
			.finish_non_exhaustive()
	}
}

impl Backend {
	/// Starts a backend on the system's kqueue.
	#[cfg(any(
		target_os = "macos",
		target_os = "ios",
		target_os = "freebsd",
		target_os = "openbsd",
		target_os = "netbsd",
		target_os = "dragonfly"
	))]
	pub fn start(config: KqueueConfig) -> Result<Self, StartupError> {
		let queue = crate::thread::kqueue::Kqueue::new(config.event_buffer_capacity)?;
		Self::with_queue(queue, Arc::new(crate::fs::OsFileSystem), config)
	}

	/// Starts a backend over any kernel queue and filesystem.
	pub fn with_queue<K: KernelQueue>(
		queue: K,
		fs: Arc<dyn FileSystem>,
		config: KqueueConfig,
	) -> Result<Self, StartupError> {
		let runtime = Handle::try_current().map_err(|e| {
			StartupError::new(StartupStage::Runtime, io::Error::new(io::ErrorKind::Other, e))
		})?;

		let (notifications_tx, notifications_rx) = chan::unbounded();
		let thread = EventThread::spawn(queue, config.thread_name.clone(), notifications_tx)?;

		let inner = Arc::new(Inner {
			config,
			fs,
			runtime,
			subscriptions: Mutex::new(HashMap::new()),
			missing: MissingFiles::default(),
			thread,
			next_id: AtomicU64::new(1),
			dispatcher: Mutex::new(None),
			is_shut_down: AtomicBool::new(false),
		});

		let dispatcher = inner.runtime.spawn(
			dispatch_notifications(Arc::downgrade(&inner), notifications_rx).in_current_span(),
		);
		*inner
			.dispatcher
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);

		debug!("kqueue backend started;");

		Ok(Self { inner })
	}

	/// Creates a subscription without watching anything yet.
	pub fn create_subscription(
		&self,
		path: impl Into<PathBuf>,
		pair_moves: bool,
		sink: chan::Sender<MonitorEvent>,
	) -> Arc<Subscription> {
		let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
		Arc::new(Subscription::new(id, path.into(), pair_moves, sink))
	}

	/// Opens and registers `sub`'s path. Returns `false` if that wasn't possible, without
	/// parking it on the missing-file poller.
	pub fn start_watching(&self, sub: &Arc<Subscription>) -> bool {
		self.inner.start_watching(sub)
	}

	/// Watches `sub`, or polls for its path if it doesn't exist yet.
	#[instrument(skip_all, fields(id = %sub.id(), path = %sub.path().display()))]
	pub fn add(&self, sub: &Arc<Subscription>) -> Result<(), Error> {
		if self.is_shut_down() {
			return Err(Error::ShutDown);
		}

		self.inner.add(sub);
		Ok(())
	}

	/// Creates and adds a subscription in one go. Events are sent to `sink`.
	pub fn add_subscription(
		&self,
		path: impl Into<PathBuf>,
		pair_moves: bool,
		sink: chan::Sender<MonitorEvent>,
	) -> Result<Arc<Subscription>, Error> {
		let sub = self.create_subscription(path, pair_moves, sink);
		self.add(&sub)?;
		Ok(sub)
	}

	/// Stops watching `sub`. Its descriptor is closed asynchronously by the kernel-event thread.
	///
	/// Cancelling twice, or cancelling something that was never added, does nothing.
	#[instrument(skip_all, fields(id = %sub.id(), path = %sub.path().display()))]
	pub fn cancel_subscription(&self, sub: &Subscription) {
		self.inner.cancel(sub);
	}

	/// Number of subscriptions currently registered with the kernel-event thread.
	#[must_use]
	pub fn active_count(&self) -> usize {
		self.inner.subscriptions().len()
	}

	#[must_use]
	pub fn missing_count(&self) -> usize {
		self.inner.missing.len()
	}

	#[must_use]
	pub fn is_missing(&self, sub: &Subscription) -> bool {
		self.inner.missing.contains(sub)
	}

	#[must_use]
	pub fn is_polling_missing(&self) -> bool {
		self.inner.missing.is_polling()
	}

	#[must_use]
	pub fn is_shut_down(&self) -> bool {
		self.inner.is_shut_down.load(Ordering::Acquire)
	}

	/// Stops the kernel-event thread, the dispatcher and the missing-file poller.
	pub fn shutdown(&self) {
		if !self.inner.is_shut_down.swap(true, Ordering::AcqRel) {
			self.inner.shutdown();
			debug!("kqueue backend shut down;");
		}
	}
}

/// A backend started on first use.
///
/// The outcome of the first start is kept, later calls get the same backend, or the same
/// error without the start being retried.
#[derive(Debug, Default)]
pub struct LazyBackend {
	cell: OnceLock<Result<Backend, StartupError>>,
}

impl LazyBackend {
	#[must_use]
	pub const fn new() -> Self {
		Self {
			cell: OnceLock::new(),
		}
	}

	pub fn get_or_start(
		&self,
		start: impl FnOnce() -> Result<Backend, StartupError>,
	) -> Result<Backend, StartupError> {
		self.cell.get_or_init(start).clone()
	}

	#[cfg(any(
		target_os = "macos",
		target_os = "ios",
		target_os = "freebsd",
		target_os = "openbsd",
		target_os = "netbsd",
		target_os = "dragonfly"
	))]
	pub fn get(&self, config: &KqueueConfig) -> Result<Backend, StartupError> {
		self.get_or_start(|| Backend::start(config.clone()))
	}
}
