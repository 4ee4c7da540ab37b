//!
//! # kqueue file monitor
//!
//! Change notifications for files and directories on platforms with a kqueue-style kernel
//! multiplexer (macOS, iOS and the BSDs).
//!
//! The moving parts:
//! - A single kernel-event thread blocks on the kernel queue and owns every watched descriptor;
//!   other threads only talk to it through a typed command channel;
//! - A dispatcher task consumes the thread's notifications, looks up the matching
//!   [`Subscription`] and translates raw vnode flags into [`MonitorEvent`]s;
//! - Directories are re-listed on every write and the old and new listings are diffed by
//!   [`dep_list`], so renames inside a watched directory come out as a single
//!   [`MonitorEventKind::Renamed`] instead of a delete and create pair;
//! - Paths that don't exist yet are parked on a missing-file poller that retries them
//!   periodically and reports [`MonitorEventKind::Created`] once they show up.
//!
//! ## Basic example
//!
//! ```no_run
//! # #[cfg(any(target_os = "macos", target_os = "freebsd"))]
//! # async fn run() -> Result<(), sd_fs_kqueue::Error> {
//! use sd_fs_kqueue::{Backend, KqueueConfig};
//!
//! let backend = Backend::start(KqueueConfig::default())?;
//! let (events_tx, events_rx) = async_channel::unbounded();
//!
//! let subscription = backend.add_subscription("/tmp/some-dir", true, events_tx)?;
//!
//! while let Ok(event) = events_rx.recv().await {
//! 	println!("{event:?}");
//! }
//!
//! backend.cancel_subscription(&subscription);
//! backend.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod dep_list;

mod config;
mod error;
mod event;
mod fs;
mod helper;
mod missing;
mod subscription;
mod thread;
mod utils;

pub use config::KqueueConfig;
pub use error::{Error, StartupError, StartupStage};
pub use event::{MonitorEvent, MonitorEventKind, VnodeFlags};
pub use fs::{FileSystem, OpenedPath, OsFileSystem};
pub use helper::{Backend, LazyBackend};
pub use subscription::{Subscription, SubscriptionId, SubscriptionStatus};
pub use thread::{KernelEvent, KernelQueue, QueueWaker};

#[cfg(any(
	target_os = "macos",
	target_os = "ios",
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly"
))]
pub use thread::kqueue::{Kqueue, KqueueWaker};

pub use utils::monotonic_micros;
