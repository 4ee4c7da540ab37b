//! The kernel-event thread.
//!
//! One dedicated thread blocks on the kernel queue for the whole life of the backend. It is the
//! only owner of watched descriptors: they are handed to it with [`Command::Add`] and closed by
//! it when a [`Command::Remove`] for them comes in, never concurrently from another thread.
//! Commands travel over a channel, and a waker interrupts the blocking wait so they are picked
//! up before any vnode event of the same wait round.

use crate::{
	error::{StartupError, StartupStage},
	event::VnodeFlags,
	subscription::SubscriptionId,
};

use std::{
	io,
	os::fd::{AsRawFd, OwnedFd, RawFd},
	sync::{Mutex, PoisonError},
	thread::{self, JoinHandle},
};

use async_channel as chan;
use tracing::{debug, error, trace, warn};

#[cfg(any(
	target_os = "macos",
	target_os = "ios",
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly"
))]
pub(crate) mod kqueue;

/// What a [`KernelQueue`] wait can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelEvent {
	/// The control channel was written to, there are commands waiting.
	Wake,
	Vnode { fd: RawFd, flags: VnodeFlags },
}

pub trait QueueWaker: Send + Sync + 'static {
	/// Interrupts a blocking [`KernelQueue::wait`] so it returns a [`KernelEvent::Wake`].
	fn wake(&self) -> io::Result<()>;
}

/// A kqueue-style kernel multiplexer, driven exclusively by the kernel-event thread.
pub trait KernelQueue: Send + 'static {
	type Waker: QueueWaker;

	fn waker(&self) -> io::Result<Self::Waker>;

	/// Registers one-shot vnode interest ([`VnodeFlags::INTEREST`]) for `fd`.
	///
	/// A registration is consumed once it fires, registering again re-arms it.
	fn register(&mut self, fd: RawFd) -> io::Result<()>;

	/// Blocks until something happens, appending what happened to `events`.
	fn wait(&mut self, events: &mut Vec<KernelEvent>) -> io::Result<()>;
}

#[derive(Debug)]
pub(crate) enum Command {
	Add { id: SubscriptionId, fd: OwnedFd },
	Remove { fds: Vec<RawFd> },
	Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Notification {
	pub(crate) fd: RawFd,
	pub(crate) id: SubscriptionId,
	pub(crate) flags: VnodeFlags,
}

#[derive(Debug)]
struct Watch {
	id: SubscriptionId,
	fd: OwnedFd,
	armed: bool,
}

pub(crate) struct EventThread {
	commands_tx: chan::Sender<Command>,
	waker: Box<dyn QueueWaker>,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventThread {
	pub(crate) fn spawn<K: KernelQueue>(
		queue: K,
		name: String,
		notifications_tx: chan::Sender<Notification>,
	) -> Result<Self, StartupError> {
		let waker = queue
			.waker()
			.map_err(|e| StartupError::new(StartupStage::ControlChannel, e))?;

		let (commands_tx, commands_rx) = chan::unbounded();

		let handle = thread::Builder::new()
			.name(name)
			.spawn(move || {
				Runner {
					queue,
					commands_rx,
					notifications_tx,
					watches: Vec::new(),
				}
				.run();
			})
			.map_err(|e| StartupError::new(StartupStage::ThreadSpawn, e))?;

		Ok(Self {
			commands_tx,
			waker: Box::new(waker),
			handle: Mutex::new(Some(handle)),
		})
	}

	/// Hands `fd` over to the thread, it will be registered and owned by it from now on.
	pub(crate) fn push_fd(&self, id: SubscriptionId, fd: OwnedFd) {
		self.send(Command::Add { id, fd });
	}

	/// Asks the thread to close and forget `fds`.
	pub(crate) fn remove_fds(&self, fds: Vec<RawFd>) {
		if !fds.is_empty() {
			self.send(Command::Remove { fds });
		}
	}

	pub(crate) fn is_running(&self) -> bool {
		self.handle
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.as_ref()
			.is_some_and(|handle| !handle.is_finished())
	}

	/// Stops the thread and waits for it to exit, only the first call does anything.
	pub(crate) fn stop(&self) {
		let Some(handle) = self
			.handle
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
		else {
			return;
		};

		self.send(Command::Stop);

		if handle.join().is_err() {
			error!("Kernel-event thread panicked;");
		}
	}

	fn send(&self, command: Command) {
		if let Err(chan::TrySendError::Closed(command)) = self.commands_tx.try_send(command) {
			warn!(?command, "Kernel-event thread is gone, dropping command;");
			return;
		}

		if let Err(e) = self.waker.wake() {
			error!(?e, "Failed to wake the kernel-event thread;");
		}
	}
}

struct Runner<K> {
	queue: K,
	commands_rx: chan::Receiver<Command>,
	notifications_tx: chan::Sender<Notification>,
	watches: Vec<Watch>,
}

impl<K: KernelQueue> Runner<K> {
	fn run(mut self) {
		debug!("Kernel-event thread started;");

		let mut events = Vec::new();

		'wait: loop {
			events.clear();

			if let Err(e) = self.queue.wait(&mut events) {
				error!(?e, "Kernel queue wait failed, stopping the kernel-event thread;");
				break;
			}

			if events.contains(&KernelEvent::Wake) && !self.process_commands() {
				break;
			}

			for event in &events {
				if let KernelEvent::Vnode { fd, flags } = *event {
					if !self.forward(fd, flags) {
						break 'wait;
					}
				}
			}
		}

		debug!(watches = self.watches.len(), "Kernel-event thread stopped;");
	}

	/// Returns `false` once the thread must stop.
	fn process_commands(&mut self) -> bool {
		loop {
			match self.commands_rx.try_recv() {
				Ok(Command::Add { id, fd }) => {
					if !self.add_watch(id, fd) {
						return false;
					}
				}
				Ok(Command::Remove { fds }) => self.remove_watches(&fds),
				Ok(Command::Stop) => return false,
				Err(chan::TryRecvError::Empty) => return true,
				Err(chan::TryRecvError::Closed) => {
					trace!("Command channel closed;");
					return false;
				}
			}
		}
	}

	fn add_watch(&mut self, id: SubscriptionId, fd: OwnedFd) -> bool {
		let raw_fd = fd.as_raw_fd();

		match self.queue.register(raw_fd) {
			Ok(()) => {
				trace!(%id, fd = raw_fd, "Watching descriptor;");
				self.watches.push(Watch {
					id,
					fd,
					armed: true,
				});
				true
			}
			Err(e) => {
				// Keeping the descriptor open until its removal comes in, so the number can't
				// be reused while the revoke is in flight
				warn!(?e, %id, fd = raw_fd, "Failed to register descriptor, reporting it as revoked;");
				self.watches.push(Watch {
					id,
					fd,
					armed: false,
				});
				self.notify(Notification {
					fd: raw_fd,
					id,
					flags: VnodeFlags::REVOKE,
				})
			}
		}
	}

	fn remove_watches(&mut self, fds: &[RawFd]) {
		for &fd in fds {
			if let Some(idx) = self
				.watches
				.iter()
				.position(|watch| watch.fd.as_raw_fd() == fd)
			{
				let watch = self.watches.remove(idx);
				trace!(id = %watch.id, fd, "Closing watched descriptor;");
			} else {
				trace!(fd, "Asked to remove a descriptor that isn't watched;");
			}
		}
	}

	fn forward(&mut self, fd: RawFd, flags: VnodeFlags) -> bool {
		let Some(watch) = self
			.watches
			.iter_mut()
			.find(|watch| watch.fd.as_raw_fd() == fd)
		else {
			trace!(fd, ?flags, "Dropping event for a descriptor that is no longer watched;");
			return true;
		};

		match self.queue.register(fd) {
			Ok(()) => watch.armed = true,
			Err(e) => {
				watch.armed = false;
				if e.raw_os_error() != Some(libc::ENOENT) {
					warn!(?e, id = %watch.id, fd, "Failed to re-arm watched descriptor;");
				}
			}
		}

		let id = watch.id;
		self.notify(Notification { fd, id, flags })
	}

	fn notify(&self, notification: Notification) -> bool {
		if self.notifications_tx.send_blocking(notification).is_err() {
			debug!("Notification receiver is gone;");
			return false;
		}

		true
	}
}

#[cfg(test)]
mod tests {
	use std::{fs::File, time::Duration};

	use super::*;

	struct ChannelWaker(chan::Sender<KernelEvent>);

	impl QueueWaker for ChannelWaker {
		fn wake(&self) -> io::Result<()> {
			self.0
				.try_send(KernelEvent::Wake)
				.map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
		}
	}

	struct ChannelQueue {
		events_tx: chan::Sender<KernelEvent>,
		events_rx: chan::Receiver<KernelEvent>,
		reject: Option<RawFd>,
	}

	impl KernelQueue for ChannelQueue {
		type Waker = ChannelWaker;

		fn waker(&self) -> io::Result<Self::Waker> {
			Ok(ChannelWaker(self.events_tx.clone()))
		}

		fn register(&mut self, fd: RawFd) -> io::Result<()> {
			if self.reject == Some(fd) {
				Err(io::Error::from_raw_os_error(libc::EBADF))
			} else {
				Ok(())
			}
		}

		fn wait(&mut self, events: &mut Vec<KernelEvent>) -> io::Result<()> {
			let first = self
				.events_rx
				.recv_blocking()
				.map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
			events.push(first);
			while let Ok(event) = self.events_rx.try_recv() {
				events.push(event);
			}
			Ok(())
		}
	}

	fn spawn(
		reject_first_open: bool,
	) -> (
		EventThread,
		chan::Sender<KernelEvent>,
		chan::Receiver<Notification>,
		OwnedFd,
	) {
		let fd = OwnedFd::from(File::open("/dev/null").unwrap());
		let (events_tx, events_rx) = chan::unbounded();
		let (notifications_tx, notifications_rx) = chan::unbounded();

		let queue = ChannelQueue {
			events_tx: events_tx.clone(),
			events_rx,
			reject: reject_first_open.then(|| fd.as_raw_fd()),
		};

		let thread = EventThread::spawn(queue, "test-kqueue".to_string(), notifications_tx).unwrap();

		(thread, events_tx, notifications_rx, fd)
	}

	fn recv(rx: &chan::Receiver<Notification>) -> Option<Notification> {
		for _ in 0..200 {
			if let Ok(notification) = rx.try_recv() {
				return Some(notification);
			}
			std::thread::sleep(Duration::from_millis(5));
		}
		None
	}

	#[test]
	fn events_are_forwarded_for_watched_descriptors() {
		let (thread, events_tx, notifications_rx, fd) = spawn(false);
		let raw_fd = fd.as_raw_fd();
		let id = SubscriptionId(1);

		thread.push_fd(id, fd);
		// Same channel as the wake, so it is seen after the add is processed
		events_tx
			.send_blocking(KernelEvent::Vnode {
				fd: raw_fd,
				flags: VnodeFlags::WRITE,
			})
			.unwrap();

		assert_eq!(
			recv(&notifications_rx),
			Some(Notification {
				fd: raw_fd,
				id,
				flags: VnodeFlags::WRITE,
			})
		);

		thread.stop();
		assert!(!thread.is_running());
	}

	#[test]
	fn removed_descriptors_are_silenced() {
		let (thread, events_tx, notifications_rx, fd) = spawn(false);
		let raw_fd = fd.as_raw_fd();

		thread.push_fd(SubscriptionId(1), fd);
		thread.remove_fds(vec![raw_fd]);
		events_tx
			.send_blocking(KernelEvent::Vnode {
				fd: raw_fd,
				flags: VnodeFlags::DELETE,
			})
			.unwrap();

		thread.stop();
		assert!(notifications_rx.try_recv().is_err());
	}

	#[test]
	fn failed_registration_is_reported_as_revoke() {
		let (thread, _events_tx, notifications_rx, fd) = spawn(true);
		let raw_fd = fd.as_raw_fd();

		thread.push_fd(SubscriptionId(7), fd);

		assert_eq!(
			recv(&notifications_rx),
			Some(Notification {
				fd: raw_fd,
				id: SubscriptionId(7),
				flags: VnodeFlags::REVOKE,
			})
		);

		thread.stop();
	}

	#[test]
	fn stopping_twice_is_harmless() {
		let (thread, _events_tx, _notifications_rx, _fd) = spawn(false);

		thread.stop();
		thread.stop();
		assert!(!thread.is_running());
	}
}
