use crate::{
	dep_list::{DirEntry, DirListing},
	utils,
};

use std::{
	fs::{self, OpenOptions},
	io,
	os::{
		fd::{AsFd, OwnedFd},
		unix::fs::{DirEntryExt, OpenOptionsExt},
	},
	path::Path,
};

/// A freshly opened watch target.
#[derive(Debug)]
pub struct OpenedPath {
	pub fd: OwnedFd,
	pub is_directory: bool,
	pub inode: u64,
}

/// Every filesystem access the backend makes goes through here.
pub trait FileSystem: Send + Sync + 'static {
	/// Opens `path` for event notification only, never blocking on it.
	fn open(&self, path: &Path) -> io::Result<OpenedPath>;

	fn read_dir(&self, path: &Path) -> io::Result<DirListing>;

	fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

#[cfg(any(target_os = "macos", target_os = "ios"))]
const OPEN_FLAGS: libc::c_int = libc::O_EVTONLY | libc::O_NONBLOCK;

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const OPEN_FLAGS: libc::c_int = libc::O_NONBLOCK;

impl FileSystem for OsFileSystem {
	fn open(&self, path: &Path) -> io::Result<OpenedPath> {
		let file = utils::retry_on_interrupt(|| {
			OpenOptions::new()
				.read(true)
				.custom_flags(OPEN_FLAGS)
				.open(path)
		})?;

		let is_directory = utils::is_directory(file.as_fd())?;
		let inode = utils::inode(file.as_fd())?;

		Ok(OpenedPath {
			fd: file.into(),
			is_directory,
			inode,
		})
	}

	fn read_dir(&self, path: &Path) -> io::Result<DirListing> {
		let mut listing = DirListing::new();

		for entry in fs::read_dir(path)? {
			let entry = entry?;
			listing.push(DirEntry::new(entry.file_name(), entry.ino()));
		}

		Ok(listing)
	}

	fn exists(&self, path: &Path) -> bool {
		fs::symlink_metadata(path).is_ok()
	}
}
