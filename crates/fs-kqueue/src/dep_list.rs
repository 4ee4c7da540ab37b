//! Directory listing snapshots and the diff that classifies changes between two of them.
//!
//! A listing only knows `(name, inode)` pairs, so everything is inferred from those: an inode
//! showing up under a new name is a move, an old inode now found under a name that already
//! existed is a replacement, and a name whose inode changed was overwritten.
//!
//! Every step is quadratic in the directory size, which is fine for the directories this is
//! used on (up to a few thousand entries).

use std::{ffi::OsString, slice};

pub type Inode = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntry {
	/// Raw file name, not necessarily valid UTF-8.
	pub name: OsString,
	pub inode: Inode,
}

impl DirEntry {
	pub fn new(name: impl Into<OsString>, inode: Inode) -> Self {
		Self {
			name: name.into(),
			inode,
		}
	}
}

/// One snapshot of a directory's entries, in no particular order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirListing(Vec<DirEntry>);

impl DirListing {
	#[must_use]
	pub const fn new() -> Self {
		Self(Vec::new())
	}

	pub fn push(&mut self, entry: DirEntry) {
		self.0.push(entry);
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> slice::Iter<'_, DirEntry> {
		self.0.iter()
	}

	#[must_use]
	pub fn entries(&self) -> &[DirEntry] {
		&self.0
	}
}

impl FromIterator<DirEntry> for DirListing {
	fn from_iter<I: IntoIterator<Item = DirEntry>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl<'a> IntoIterator for &'a DirListing {
	type Item = &'a DirEntry;
	type IntoIter = slice::Iter<'a, DirEntry>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.iter()
	}
}

/// Receives the classified changes of a [`diff_with`] pass.
///
/// Every method does nothing by default, implement only the ones you care about.
#[allow(unused_variables)]
pub trait DiffHandler {
	fn added(&mut self, entry: &DirEntry) {}

	fn removed(&mut self, entry: &DirEntry) {}

	/// `from` disappeared and its inode is now found under `to`, a name that was already
	/// present before.
	fn replaced(&mut self, from: &DirEntry, to: &DirEntry) {}

	/// `entry.name` still exists but now points to `new_inode`.
	fn overwritten(&mut self, entry: &DirEntry, new_inode: Inode) {}

	fn moved(&mut self, from: &DirEntry, to: &DirEntry) {}

	/// Everything that is reported as added, after the individual [`DiffHandler::added`] calls.
	fn many_added(&mut self, entries: &[DirEntry]) {}

	/// Everything that is reported as removed, after the individual [`DiffHandler::removed`]
	/// calls.
	fn many_removed(&mut self, entries: &[DirEntry]) {}

	/// Called once, before any added or removed entry, when at least one move or replacement
	/// was found.
	fn names_updated(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEvent {
	Added(DirEntry),
	Removed(DirEntry),
	Replaced {
		from: DirEntry,
		to: DirEntry,
	},
	Overwritten {
		name: OsString,
		old_inode: Inode,
		new_inode: Inode,
	},
	Moved {
		from: DirEntry,
		to: DirEntry,
	},
	NamesUpdated,
}

#[derive(Debug, Default)]
struct Collector(Vec<DiffEvent>);

impl DiffHandler for Collector {
	fn added(&mut self, entry: &DirEntry) {
		self.0.push(DiffEvent::Added(entry.clone()));
	}

	fn removed(&mut self, entry: &DirEntry) {
		self.0.push(DiffEvent::Removed(entry.clone()));
	}

	fn replaced(&mut self, from: &DirEntry, to: &DirEntry) {
		self.0.push(DiffEvent::Replaced {
			from: from.clone(),
			to: to.clone(),
		});
	}

	fn overwritten(&mut self, entry: &DirEntry, new_inode: Inode) {
		self.0.push(DiffEvent::Overwritten {
			name: entry.name.clone(),
			old_inode: entry.inode,
			new_inode,
		});
	}

	fn moved(&mut self, from: &DirEntry, to: &DirEntry) {
		self.0.push(DiffEvent::Moved {
			from: from.clone(),
			to: to.clone(),
		});
	}

	fn names_updated(&mut self) {
		self.0.push(DiffEvent::NamesUpdated);
	}
}

/// Diffs two listings and returns the classified changes in emission order.
#[must_use]
pub fn diff(before: &DirListing, after: &DirListing) -> Vec<DiffEvent> {
	let mut collector = Collector::default();
	diff_with(before, after, &mut collector);
	collector.0
}

/// Diffs two listings, streaming the classified changes into `handler`.
///
/// Emission order: moves, replacements, overwrites, [`DiffHandler::names_updated`], removed,
/// added, then [`DiffHandler::many_added`] and [`DiffHandler::many_removed`].
pub fn diff_with(before: &DirListing, after: &DirListing, handler: &mut impl DiffHandler) {
	if before.is_empty() && after.is_empty() {
		return;
	}

	let mut was = before.0.clone();
	let mut now = after.0.clone();

	if !before.is_empty() && !after.is_empty() {
		let pre = before.0.as_slice();
		let mut lst = after.0.clone();

		drop_same_names(&mut was, &mut now);

		let moves = pair_by_inode(&mut was, &mut now, |from, to| handler.moved(from, to));
		let replacements =
			pair_by_inode(&mut was, &mut lst, |from, to| handler.replaced(from, to));

		for old in pre {
			if let Some(new) = lst
				.iter()
				.find(|new| new.name == old.name && new.inode != old.inode)
			{
				handler.overwritten(old, new.inode);
			}
		}

		if moves + replacements > 0 {
			handler.names_updated();
		}
	}

	for entry in &was {
		handler.removed(entry);
	}
	for entry in &now {
		handler.added(entry);
	}

	handler.many_added(&now);
	handler.many_removed(&was);
}

/// Drops from both sides every entry whose name exists on the other side.
fn drop_same_names(was: &mut Vec<DirEntry>, now: &mut Vec<DirEntry>) {
	was.retain(|old| {
		now.iter()
			.position(|new| new.name == old.name)
			.map_or(true, |idx| {
				now.remove(idx);
				false
			})
	});
}

/// Pairs entries sharing an inode, reporting and dropping each pair from both sides.
/// Returns how many pairs were found.
fn pair_by_inode(
	from: &mut Vec<DirEntry>,
	to: &mut Vec<DirEntry>,
	mut on_pair: impl FnMut(&DirEntry, &DirEntry),
) -> usize {
	let mut pairs = 0;

	from.retain(|old| {
		to.iter()
			.position(|new| new.inode == old.inode)
			.map_or(true, |idx| {
				let new = to.remove(idx);
				on_pair(old, &new);
				pairs += 1;
				false
			})
	});

	pairs
}
