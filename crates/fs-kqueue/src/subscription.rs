use crate::{dep_list::DirListing, event::MonitorEvent};

use std::{
	fmt,
	os::fd::RawFd,
	path::{Path, PathBuf},
	sync::{Mutex, MutexGuard, PoisonError},
};

use async_channel as chan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
	/// Created but never added.
	New,
	/// The path doesn't exist, waiting on the missing-file poller.
	Missing,
	/// Descriptor open and registered with the kernel-event thread.
	Active,
	/// Removed from every table, no more events will be sent.
	Cancelled,
}

#[derive(Debug)]
pub(crate) struct State {
	pub(crate) status: SubscriptionStatus,
	/// Raw number of the descriptor owned by the kernel-event thread while `Active`.
	pub(crate) fd: Option<RawFd>,
	pub(crate) is_directory: bool,
	pub(crate) inode: Option<u64>,
	pub(crate) cached_listing: Option<DirListing>,
}

/// One watched path.
///
/// Events for it are sent to the sink handed over at creation. Dropping the last `Arc` to a
/// subscription releases it, cancel it through the backend first so its descriptor is
/// closed.
#[derive(Debug)]
pub struct Subscription {
	id: SubscriptionId,
	path: PathBuf,
	pair_moves: bool,
	sink: chan::Sender<MonitorEvent>,
	state: Mutex<State>,
}

impl Subscription {
	pub(crate) fn new(
		id: SubscriptionId,
		path: PathBuf,
		pair_moves: bool,
		sink: chan::Sender<MonitorEvent>,
	) -> Self {
		Self {
			id,
			path,
			pair_moves,
			sink,
			state: Mutex::new(State {
				status: SubscriptionStatus::New,
				fd: None,
				is_directory: false,
				inode: None,
				cached_listing: None,
			}),
		}
	}

	#[must_use]
	pub const fn id(&self) -> SubscriptionId {
		self.id
	}

	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Hint from the caller that it wants renames reported as pairs. Renames inside a watched
	/// directory are always reported as a single [`crate::MonitorEventKind::Renamed`].
	#[must_use]
	pub const fn pair_moves(&self) -> bool {
		self.pair_moves
	}

	#[must_use]
	pub fn status(&self) -> SubscriptionStatus {
		self.state().status
	}

	#[must_use]
	pub fn is_directory(&self) -> bool {
		self.state().is_directory
	}

	/// Raw number of the watched descriptor while active. The descriptor itself belongs to the
	/// kernel-event thread.
	#[must_use]
	pub fn descriptor(&self) -> Option<RawFd> {
		self.state().fd
	}

	#[must_use]
	pub fn inode(&self) -> Option<u64> {
		self.state().inode
	}

	/// Number of entries in the cached directory listing, `None` for files and while not
	/// active.
	#[must_use]
	pub fn cached_entries(&self) -> Option<usize> {
		self.state().cached_listing.as_ref().map(DirListing::len)
	}

	pub(crate) fn sink(&self) -> &chan::Sender<MonitorEvent> {
		&self.sink
	}

	pub(crate) fn state(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}
