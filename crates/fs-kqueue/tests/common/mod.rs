#![allow(dead_code)]

use sd_fs_kqueue::{
	dep_list::{DirEntry, DirListing},
	Backend, FileSystem, KernelEvent, KernelQueue, KqueueConfig, MonitorEvent, OpenedPath,
	QueueWaker, VnodeFlags,
};

use std::{
	collections::{BTreeMap, HashSet},
	fs::File,
	io,
	os::fd::{OwnedFd, RawFd},
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_channel as chan;
use tokio::time::{sleep, timeout};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Test side of [`FakeQueue`], fires vnode events as if the kernel did.
#[derive(Clone)]
pub struct FakeKernel {
	events_tx: chan::Sender<KernelEvent>,
	armed: Arc<Mutex<HashSet<RawFd>>>,
	reject_all: Arc<AtomicBool>,
}

pub struct FakeQueue {
	events_tx: chan::Sender<KernelEvent>,
	events_rx: chan::Receiver<KernelEvent>,
	armed: Arc<Mutex<HashSet<RawFd>>>,
	reject_all: Arc<AtomicBool>,
}

pub struct FakeWaker(chan::Sender<KernelEvent>);

impl QueueWaker for FakeWaker {
	fn wake(&self) -> io::Result<()> {
		self.0
			.try_send(KernelEvent::Wake)
			.map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
	}
}

impl KernelQueue for FakeQueue {
	type Waker = FakeWaker;

	fn waker(&self) -> io::Result<Self::Waker> {
		Ok(FakeWaker(self.events_tx.clone()))
	}

	fn register(&mut self, fd: RawFd) -> io::Result<()> {
		if self.reject_all.load(Ordering::SeqCst) {
			return Err(io::Error::from_raw_os_error(libc::ENOENT));
		}

		self.armed.lock().unwrap().insert(fd);
		Ok(())
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

impl FakeKernel {
	pub fn new() -> (Self, FakeQueue) {
		let (events_tx, events_rx) = chan::unbounded();
		let armed = Arc::new(Mutex::new(HashSet::new()));
		let reject_all = Arc::new(AtomicBool::new(false));

		(
			Self {
				events_tx: events_tx.clone(),
				armed: Arc::clone(&armed),
				reject_all: Arc::clone(&reject_all),
			},
			FakeQueue {
				events_tx,
				events_rx,
				armed,
				reject_all,
			},
		)
	}

	pub fn reject_registrations(&self) {
		self.reject_all.store(true, Ordering::SeqCst);
	}

	pub fn accept_registrations(&self) {
		self.reject_all.store(false, Ordering::SeqCst);
	}

	pub fn is_armed(&self, fd: RawFd) -> bool {
		self.armed.lock().unwrap().contains(&fd)
	}

	/// Waits for `fd` to be registered, then fires `flags` on it, consuming the one-shot
	/// registration like the kernel does.
	pub async fn fire(&self, fd: RawFd, flags: VnodeFlags) {
		eventually(|| self.is_armed(fd)).await;
		self.armed.lock().unwrap().remove(&fd);

		self.events_tx
			.send(KernelEvent::Vnode { fd, flags })
			.await
			.unwrap();
	}
}

#[derive(Debug, Clone, Copy)]
struct Node {
	inode: u64,
	is_directory: bool,
}

/// In-memory filesystem. Opening an existing path hands out a descriptor to `/dev/null`.
#[derive(Debug, Default)]
pub struct StubFs {
	nodes: Mutex<BTreeMap<PathBuf, Node>>,
	unreadable: Mutex<HashSet<PathBuf>>,
}

impl StubFs {
	pub fn add_file(&self, path: impl Into<PathBuf>, inode: u64) {
		self.nodes.lock().unwrap().insert(
			path.into(),
			Node {
				inode,
				is_directory: false,
			},
		);
	}

	pub fn add_dir(&self, path: impl Into<PathBuf>, inode: u64) {
		self.nodes.lock().unwrap().insert(
			path.into(),
			Node {
				inode,
				is_directory: true,
			},
		);
	}

	pub fn remove(&self, path: impl AsRef<Path>) {
		self.nodes.lock().unwrap().remove(path.as_ref());
	}

	pub fn rename(&self, from: impl AsRef<Path>, to: impl Into<PathBuf>) {
		let mut nodes = self.nodes.lock().unwrap();
		let node = nodes.remove(from.as_ref()).unwrap();
		nodes.insert(to.into(), node);
	}

	pub fn make_unreadable(&self, path: impl Into<PathBuf>) {
		self.unreadable.lock().unwrap().insert(path.into());
	}
}

impl FileSystem for StubFs {
	fn open(&self, path: &Path) -> io::Result<OpenedPath> {
		let node = self
			.nodes
			.lock()
			.unwrap()
			.get(path)
			.copied()
			.ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;

		Ok(OpenedPath {
			fd: OwnedFd::from(File::open("/dev/null")?),
			is_directory: node.is_directory,
			inode: node.inode,
		})
	}

	fn read_dir(&self, path: &Path) -> io::Result<DirListing> {
		if self.unreadable.lock().unwrap().contains(path) {
			return Err(io::Error::from(io::ErrorKind::PermissionDenied));
		}

		let nodes = self.nodes.lock().unwrap();

		if !nodes.get(path).is_some_and(|node| node.is_directory) {
			return Err(io::Error::from(io::ErrorKind::NotFound));
		}

		Ok(nodes
			.iter()
			.filter(|(child, _)| child.parent() == Some(path))
			.filter_map(|(child, node)| {
				child
					.file_name()
					.map(|name| DirEntry::new(name, node.inode))
			})
			.collect())
	}

	fn exists(&self, path: &Path) -> bool {
		self.nodes.lock().unwrap().contains_key(path)
	}
}

pub struct Harness {
	pub backend: Backend,
	pub kernel: FakeKernel,
	pub fs: Arc<StubFs>,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_config(KqueueConfig {
			missing_poll_interval_ms: 20,
			..Default::default()
		})
	}

	pub fn with_config(config: KqueueConfig) -> Self {
		let (kernel, queue) = FakeKernel::new();
		let fs = Arc::new(StubFs::default());

		let backend = Backend::with_queue(queue, Arc::clone(&fs) as Arc<dyn FileSystem>, config)
			.expect("backend starts on a fake queue");

		Self {
			backend,
			kernel,
			fs,
		}
	}
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
	timeout(TIMEOUT, async {
		while !condition() {
			sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("condition never became true");
}

pub async fn next_event(rx: &chan::Receiver<MonitorEvent>) -> MonitorEvent {
	timeout(TIMEOUT, rx.recv())
		.await
		.expect("timed out waiting for an event")
		.expect("event channel closed")
}

/// Asserts nothing else shows up for a little while.
pub async fn assert_quiet(rx: &chan::Receiver<MonitorEvent>) {
	sleep(Duration::from_millis(100)).await;
	assert!(rx.is_empty(), "unexpected event: {:?}", rx.try_recv());
}
