// MIT/Apache2 License

//! Cross-process shared-memory fences.
//!
//! Each hardware swapchain image carries one of these: a single word in an
//! anonymous shared-memory file, mapped by both us and the server. We
//! reset it when a pixmap is handed out for presentation; the server
//! triggers it (through the SYNC fence imported from the same fd) once the
//! pixmap is idle, and acquire waits on it before reuse.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

const TRIGGERED: u32 = 1;

/// Size of the shared mapping. Only the first word is used.
const MAP_LEN: usize = 4096;

#[derive(Debug)]
pub(crate) struct ShmFence {
    word: NonNull<AtomicU32>,
}

// The mapping is shared memory operated on through atomics only.
unsafe impl Send for ShmFence {}
unsafe impl Sync for ShmFence {}

impl ShmFence {
    /// Allocate a fresh fence in an anonymous shared-memory file and map
    /// it. The returned fd is for the server's side of the mapping; it is
    /// not needed to operate the local fence.
    pub fn alloc() -> io::Result<(Self, OwnedFd)> {
        let raw = unsafe {
            libc::memfd_create(
                b"xpresent-fence\0".as_ptr().cast(),
                libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), MAP_LEN as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let fence = Self::map(fd.as_raw_fd())?;
        Ok((fence, fd))
    }

    /// Map an existing fence file, sharing its word with every other
    /// mapping of the same fd.
    pub fn from_fd(fd: BorrowedFd<'_>) -> io::Result<Self> {
        Self::map(fd.as_raw_fd())
    }

    fn map(raw: libc::c_int) -> io::Result<Self> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                MAP_LEN,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                raw,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            word: NonNull::new(addr.cast::<AtomicU32>()).expect("mmap returned null"),
        })
    }

    #[inline]
    fn word(&self) -> &AtomicU32 {
        unsafe { self.word.as_ref() }
    }

    /// Mark the fence signalled and wake every waiter, local or remote.
    pub fn trigger(&self) {
        self.word().store(TRIGGERED, Ordering::Release);
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAKE,
                libc::INT_MAX,
            );
        }
    }

    /// Whether the fence is currently signalled.
    pub fn is_triggered(&self) -> bool {
        self.word().load(Ordering::Acquire) == TRIGGERED
    }

    /// Mark the fence unsignalled.
    pub fn reset(&self) {
        self.word().store(0, Ordering::Release);
    }

    /// Block until the fence is triggered.
    pub fn wait(&self) {
        while self.word().load(Ordering::Acquire) != TRIGGERED {
            // Spurious wakeups and EINTR simply re-check the word.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.word.as_ptr(),
                    libc::FUTEX_WAIT,
                    0u32,
                    ptr::null::<libc::timespec>(),
                );
            }
        }
    }
}

impl Drop for ShmFence {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.word.as_ptr().cast(), MAP_LEN);
        }
    }
}
