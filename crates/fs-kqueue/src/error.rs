use std::{fmt, io, sync::Arc};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Startup(#[from] StartupError),
	#[error("the kqueue backend was shut down")]
	ShutDown,
}

/// Which step of bringing the backend up failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStage {
	KernelQueue,
	ControlChannel,
	ThreadSpawn,
	Runtime,
}

impl fmt::Display for StartupStage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::KernelQueue => "kernel queue creation",
			Self::ControlChannel => "control channel creation",
			Self::ThreadSpawn => "kernel-event thread spawn",
			Self::Runtime => "tokio runtime lookup",
		})
	}
}

/// Failure to start the backend.
///
/// Cloneable so a cached failed startup can be handed out to every later caller
/// without retrying the OS calls.
#[derive(Debug, Clone, Error)]
#[error("kqueue backend unavailable, {stage} failed: {source}")]
pub struct StartupError {
	pub stage: StartupStage,
	#[source]
	pub source: Arc<io::Error>,
}

impl StartupError {
	pub fn new(stage: StartupStage, source: io::Error) -> Self {
		Self {
			stage,
			source: Arc::new(source),
		}
	}
}
