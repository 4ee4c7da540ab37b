use std::{
	io,
	mem::MaybeUninit,
	os::fd::{AsRawFd, BorrowedFd},
	sync::OnceLock,
	time::Instant,
};

/// Runs `op` again for as long as it fails with `EINTR`.
pub(crate) fn retry_on_interrupt<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
	loop {
		match op() {
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			res => return res,
		}
	}
}

/// Turns a `-1` returning libc call into an [`io::Result`], retrying on `EINTR`.
pub(crate) fn cvt_retry(mut call: impl FnMut() -> libc::c_int) -> io::Result<libc::c_int> {
	retry_on_interrupt(|| {
		let res = call();
		if res == -1 {
			Err(io::Error::last_os_error())
		} else {
			Ok(res)
		}
	})
}

/// `fstat` on an open descriptor.
pub(crate) fn fstat(fd: BorrowedFd<'_>) -> io::Result<libc::stat> {
	let mut stat = MaybeUninit::<libc::stat>::uninit();

	// SAFETY: `fd` is a valid open descriptor for the borrow's lifetime and `stat` is only
	// read after the kernel reported that it filled it
	cvt_retry(|| unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) })?;

	Ok(unsafe { stat.assume_init() })
}

pub(crate) fn is_directory(fd: BorrowedFd<'_>) -> io::Result<bool> {
	fstat(fd).map(|stat| (stat.st_mode & libc::S_IFMT) == libc::S_IFDIR)
}

#[allow(clippy::useless_conversion)] // st_ino isn't u64 everywhere
pub(crate) fn inode(fd: BorrowedFd<'_>) -> io::Result<u64> {
	fstat(fd).map(|stat| u64::from(stat.st_ino))
}

/// Microseconds on a monotonic clock, counted from the first time this is called in the
/// process.
pub fn monotonic_micros() -> u64 {
	static EPOCH: OnceLock<Instant> = OnceLock::new();

	u64::try_from(EPOCH.get_or_init(Instant::now).elapsed().as_micros()).unwrap_or(u64::MAX)
}
