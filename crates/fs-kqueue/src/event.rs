use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
	/// Vnode change flags as reported by the kernel queue, independent of the platform's
	/// `NOTE_*` values.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct VnodeFlags: u32 {
		const DELETE = 1 << 0;
		const WRITE = 1 << 1;
		const EXTEND = 1 << 2;
		const ATTRIB = 1 << 3;
		const LINK = 1 << 4;
		const RENAME = 1 << 5;
		const REVOKE = 1 << 6;
	}
}

impl VnodeFlags {
	/// Interest registered for every watched descriptor. `LINK` and `REVOKE` are left out,
	/// revokes are still delivered by the kernel without asking.
	pub const INTEREST: Self = Self::DELETE
		.union(Self::WRITE)
		.union(Self::EXTEND)
		.union(Self::ATTRIB)
		.union(Self::RENAME);

	#[must_use]
	pub const fn is_content_change(self) -> bool {
		self.intersects(Self::WRITE.union(Self::EXTEND))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorEventKind {
	Created,
	Deleted,
	Changed,
	AttributeChanged,
	/// Uses [`MonitorEvent::other_path`] as the new name.
	Renamed,
	Unmounted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEvent {
	pub kind: MonitorEventKind,
	pub path: PathBuf,
	pub other_path: Option<PathBuf>,
	/// Monotonic clock in microseconds, taken when the event was dispatched.
	pub timestamp: u64,
}

impl MonitorEvent {
	pub fn new(kind: MonitorEventKind, path: impl Into<PathBuf>, timestamp: u64) -> Self {
		Self {
			kind,
			path: path.into(),
			other_path: None,
			timestamp,
		}
	}

	pub fn created(path: impl Into<PathBuf>, timestamp: u64) -> Self {
		Self::new(MonitorEventKind::Created, path, timestamp)
	}

	pub fn deleted(path: impl Into<PathBuf>, timestamp: u64) -> Self {
		Self::new(MonitorEventKind::Deleted, path, timestamp)
	}

	pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>, timestamp: u64) -> Self {
		Self {
			kind: MonitorEventKind::Renamed,
			path: from.into(),
			other_path: Some(to.into()),
			timestamp,
		}
	}
}

/// Picks the outbound event kind for the flags of one kernel event on a watched path.
///
/// Only the most significant flag is reported, in the order delete, attribute change, content
/// change, rename, revoke. Content changes on a directory are left out when `is_directory` is
/// set, those are resolved by diffing the directory listing instead.
pub(crate) fn kind_for_flags(flags: VnodeFlags, is_directory: bool) -> Option<MonitorEventKind> {
	let flags = if is_directory {
		flags.difference(VnodeFlags::WRITE.union(VnodeFlags::EXTEND))
	} else {
		flags
	};

	if flags.contains(VnodeFlags::DELETE) {
		Some(MonitorEventKind::Deleted)
	} else if flags.contains(VnodeFlags::ATTRIB) {
		Some(MonitorEventKind::AttributeChanged)
	} else if flags.is_content_change() {
		Some(MonitorEventKind::Changed)
	} else if flags.contains(VnodeFlags::RENAME) {
		// The new name can't be known from the flag alone
		Some(MonitorEventKind::Deleted)
	} else if flags.contains(VnodeFlags::REVOKE) {
		Some(MonitorEventKind::Unmounted)
	} else {
		None
	}
}
