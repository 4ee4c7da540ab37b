use crate::{
	error::{StartupError, StartupStage},
	event::VnodeFlags,
	utils::{cvt_retry, retry_on_interrupt},
};

use super::{KernelEvent, KernelQueue, QueueWaker};

use std::{
	io::{self, Read, Write},
	mem,
	os::{
		fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
		unix::net::UnixStream,
	},
	ptr,
	sync::Arc,
};

use tracing::warn;

const NOTE_FLAGS: [(VnodeFlags, u32); 7] = [
	(VnodeFlags::DELETE, libc::NOTE_DELETE),
	(VnodeFlags::WRITE, libc::NOTE_WRITE),
	(VnodeFlags::EXTEND, libc::NOTE_EXTEND),
	(VnodeFlags::ATTRIB, libc::NOTE_ATTRIB),
	(VnodeFlags::LINK, libc::NOTE_LINK),
	(VnodeFlags::RENAME, libc::NOTE_RENAME),
	(VnodeFlags::REVOKE, libc::NOTE_REVOKE),
];

fn to_note(flags: VnodeFlags) -> u32 {
	NOTE_FLAGS
		.iter()
		.filter(|(flag, _)| flags.contains(*flag))
		.fold(0, |acc, (_, note)| acc | note)
}

fn from_note(fflags: u32) -> VnodeFlags {
	NOTE_FLAGS
		.iter()
		.filter(|(_, note)| fflags & note != 0)
		.fold(VnodeFlags::empty(), |acc, (flag, _)| acc | *flag)
}

#[allow(clippy::cast_sign_loss)]
fn kevent_for(fd: RawFd) -> libc::kevent {
	// SAFETY: `kevent` is a plain C struct, all zeroes is a valid value for it
	let mut event: libc::kevent = unsafe { mem::zeroed() };
	event.ident = fd as libc::uintptr_t;
	event
}

/// A watch the kernel reports an error for is dead, it is surfaced as revoked so the
/// subscription gets torn down and polled for again.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn vnode_event(event: &libc::kevent) -> KernelEvent {
	let fd = event.ident as RawFd;

	if event.flags & libc::EV_ERROR != 0 {
		warn!(
			fd,
			errno = event.data,
			"Kernel queue reported an error for a watched descriptor, reporting it as revoked;"
		);

		KernelEvent::Vnode {
			fd,
			flags: VnodeFlags::REVOKE,
		}
	} else {
		KernelEvent::Vnode {
			fd,
			flags: from_note(event.fflags),
		}
	}
}

/// The real kernel queue.
///
/// The read end of a socket pair sits in the queue next to the vnode registrations, writing a
/// byte to the other end (see [`KqueueWaker`]) interrupts a blocking wait.
#[derive(Debug)]
pub struct Kqueue {
	kq: OwnedFd,
	control_rx: UnixStream,
	control_tx: Arc<UnixStream>,
	buffer: Vec<libc::kevent>,
}

impl Kqueue {
	pub fn new(capacity: usize) -> Result<Self, StartupError> {
		// SAFETY: plain syscall, the returned descriptor is checked before being owned
		let kq = unsafe { libc::kqueue() };
		if kq == -1 {
			return Err(StartupError::new(
				StartupStage::KernelQueue,
				io::Error::last_os_error(),
			));
		}
		// SAFETY: `kq` is a fresh descriptor nobody else owns
		let kq = unsafe { OwnedFd::from_raw_fd(kq) };

		let control_error = |e| StartupError::new(StartupStage::ControlChannel, e);

		let (control_tx, control_rx) = UnixStream::pair().map_err(control_error)?;
		control_tx.set_nonblocking(true).map_err(control_error)?;
		control_rx.set_nonblocking(true).map_err(control_error)?;

		let this = Self {
			kq,
			control_rx,
			control_tx: Arc::new(control_tx),
			// SAFETY: see `kevent_for`
			buffer: vec![unsafe { mem::zeroed() }; capacity.max(1)],
		};

		let mut control = kevent_for(this.control_rx.as_raw_fd());
		control.filter = libc::EVFILT_READ;
		control.flags = libc::EV_ADD | libc::EV_ENABLE;
		this.apply(&control).map_err(control_error)?;

		Ok(this)
	}

	fn apply(&self, change: &libc::kevent) -> io::Result<()> {
		let kq = self.kq.as_raw_fd();

		// SAFETY: one valid change in, no events out, no timeout
		cvt_retry(|| unsafe { libc::kevent(kq, change, 1, ptr::null_mut(), 0, ptr::null()) })
			.map(|_| ())
	}

	fn drain_control(&self) -> io::Result<()> {
		let mut buf = [0_u8; 64];

		loop {
			match (&self.control_rx).read(&mut buf) {
				Ok(0) => return Ok(()),
				Ok(_) => {}
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
				Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => return Err(e),
			}
		}
	}
}

impl KernelQueue for Kqueue {
	type Waker = KqueueWaker;

	fn waker(&self) -> io::Result<Self::Waker> {
		Ok(KqueueWaker(Arc::clone(&self.control_tx)))
	}

	fn register(&mut self, fd: RawFd) -> io::Result<()> {
		let mut change = kevent_for(fd);
		change.filter = libc::EVFILT_VNODE;
		change.flags = libc::EV_ADD | libc::EV_ENABLE | libc::EV_ONESHOT;
		change.fflags = to_note(VnodeFlags::INTEREST);

		self.apply(&change)
	}

	#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
	fn wait(&mut self, events: &mut Vec<KernelEvent>) -> io::Result<()> {
		let kq = self.kq.as_raw_fd();
		let capacity = self.buffer.len().min(i32::MAX as usize);
		let buffer = self.buffer.as_mut_ptr();

		// SAFETY: `buffer` holds `capacity` slots and outlives the call, no timeout means we
		// block until something fires
		let ready = cvt_retry(|| unsafe {
			libc::kevent(kq, ptr::null(), 0, buffer, capacity as _, ptr::null())
		})?;
		let ready = usize::try_from(ready).unwrap_or_default();

		let control_ident = self.control_rx.as_raw_fd() as libc::uintptr_t;
		let mut woke = false;

		for event in &self.buffer[..ready] {
			if event.ident == control_ident {
				woke = true;
			} else {
				events.push(vnode_event(event));
			}
		}

		if woke {
			self.drain_control()?;
			events.push(KernelEvent::Wake);
		}

		if ready == self.buffer.len() {
			let grown = self.buffer.len() * 2;
			// SAFETY: see `kevent_for`
			self.buffer.resize(grown, unsafe { mem::zeroed() });
		}

		Ok(())
	}
}

/// Wakes a [`Kqueue`] blocked in [`KernelQueue::wait`].
#[derive(Debug, Clone)]
pub struct KqueueWaker(Arc<UnixStream>);

impl QueueWaker for KqueueWaker {
	fn wake(&self) -> io::Result<()> {
		match retry_on_interrupt(|| (&*self.0).write(b"!")) {
			Ok(_) => Ok(()),
			// A full socket buffer already means a pending wake
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
			Err(e) => Err(e),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{fs, fs::File, os::fd::AsFd};

	use tempfile::tempdir;

	use super::*;

	#[test]
	fn note_flags_round_trip_through_the_interest() {
		assert_eq!(from_note(to_note(VnodeFlags::INTEREST)), VnodeFlags::INTEREST);
		assert_eq!(from_note(libc::NOTE_REVOKE), VnodeFlags::REVOKE);
	}

	#[test]
	fn errored_watches_are_revoked() {
		let mut event = kevent_for(5);
		event.filter = libc::EVFILT_VNODE;
		event.flags = libc::EV_ERROR;
		event.fflags = libc::NOTE_WRITE;
		event.data = libc::EBADF as _;

		assert_eq!(
			vnode_event(&event),
			KernelEvent::Vnode {
				fd: 5,
				flags: VnodeFlags::REVOKE,
			}
		);

		event.flags = 0;
		assert_eq!(
			vnode_event(&event),
			KernelEvent::Vnode {
				fd: 5,
				flags: VnodeFlags::WRITE,
			}
		);
	}

	#[test]
	fn waker_interrupts_wait() {
		let mut queue = Kqueue::new(4).unwrap();
		queue.waker().unwrap().wake().unwrap();

		let mut events = Vec::new();
		queue.wait(&mut events).unwrap();

		assert_eq!(events, vec![KernelEvent::Wake]);
	}

	#[test]
	fn writes_to_a_registered_file_fire_once_until_rearmed() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("file.txt");
		fs::write(&path, b"Monty").unwrap();

		let file = File::open(&path).unwrap();
		let fd = file.as_fd().as_raw_fd();

		let mut queue = Kqueue::new(1).unwrap();
		queue.register(fd).unwrap();

		fs::write(&path, b"Monty Python").unwrap();

		let mut events = Vec::new();
		queue.wait(&mut events).unwrap();

		assert!(matches!(
			events.as_slice(),
			[KernelEvent::Vnode { fd: event_fd, flags }] if *event_fd == fd && flags.is_content_change()
		));
		// The single slot buffer was filled, so it grows
		assert_eq!(queue.buffer.len(), 2);
	}
}
