//! Async write ring for the redo engine.
//!
//! One thread prepares writes, submits them in batches, and awaits
//! completions by key. The primary backend is an io_uring; when a ring
//! cannot be created (old kernels, seccomp sandboxes) a synchronous
//! `pwrite(2)` backend keeps the same submit/wait contract.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use io_uring::{opcode, types, IoUring};
use tracing::debug;

use crate::error::{Result, WalbError};

struct PendingWrite {
    offset: u64,
    buf: *const u8,
    len: usize,
}

enum Backend {
    Uring {
        ring: IoUring,
        fd: RawFd,
        /// Completions drained from the ring but not yet awaited.
        completed: HashMap<u32, i32>,
    },
    Sync {
        fd: RawFd,
        pending: Vec<(u32, PendingWrite)>,
        done: HashMap<u32, io::Result<()>>,
    },
}

/// The submission ring.
pub struct Aio {
    backend: Backend,
    next_key: u32,
}

impl Aio {
    /// Build a ring of `queue_size` entries on `fd`, falling back to
    /// synchronous writes when io_uring is unavailable.
    pub fn new(fd: RawFd, queue_size: usize) -> Self {
        let entries = (queue_size.max(2) as u32).next_power_of_two().min(4096);
        let backend = match IoUring::new(entries) {
            Ok(ring) => {
                debug!(entries, "using io_uring backend");
                Backend::Uring {
                    ring,
                    fd,
                    completed: HashMap::new(),
                }
            }
            Err(e) => {
                debug!(error = %e, "io_uring unavailable, using synchronous writes");
                Backend::Sync {
                    fd,
                    pending: Vec::new(),
                    done: HashMap::new(),
                }
            }
        };
        Self {
            backend,
            next_key: 1,
        }
    }

    /// Whether the io_uring backend is active.
    pub fn is_uring(&self) -> bool {
        matches!(self.backend, Backend::Uring { .. })
    }

    /// Stage one write and return its key.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and unmoved until [`Aio::wait_for`] returns
    /// for the returned key.
    pub unsafe fn prepare_write(&mut self, offset: u64, buf: *const u8, len: usize) -> Result<u32> {
        if offset > i64::MAX as u64 {
            return Err(WalbError::Arg(format!("write offset {offset} overflows")));
        }
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1).max(1);
        match &mut self.backend {
            Backend::Uring { ring, fd, .. } => {
                let entry = opcode::Write::new(types::Fd(*fd), buf, len as u32)
                    .offset(offset)
                    .build()
                    .user_data(key as u64);
                // Safety: the caller guarantees buffer lifetime until the
                // completion is reaped.
                unsafe {
                    if ring.submission().push(&entry).is_err() {
                        // Queue full: flush and retry once.
                        ring.submit()
                            .map_err(|e| WalbError::Io(io::Error::other(e.to_string())))?;
                        ring.submission().push(&entry).map_err(|_| {
                            WalbError::Io(io::Error::other("submission queue full"))
                        })?;
                    }
                }
            }
            Backend::Sync { pending, .. } => {
                pending.push((key, PendingWrite { offset, buf, len }));
            }
        }
        Ok(key)
    }

    /// Issue every staged write to the device.
    pub fn submit(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Uring { ring, .. } => {
                ring.submit()
                    .map_err(|e| WalbError::Io(io::Error::other(e.to_string())))?;
            }
            Backend::Sync { fd, pending, done } => {
                for (key, w) in pending.drain(..) {
                    done.insert(key, pwrite_all(*fd, w.offset, w.buf, w.len));
                }
            }
        }
        Ok(())
    }

    /// Block until the write with `key` completes, reaping other
    /// completions along the way.
    pub fn wait_for(&mut self, key: u32) -> Result<()> {
        match &mut self.backend {
            Backend::Uring {
                ring, completed, ..
            } => loop {
                if let Some(res) = completed.remove(&key) {
                    if res < 0 {
                        return Err(WalbError::Io(io::Error::from_raw_os_error(-res)));
                    }
                    return Ok(());
                }
                ring.submit_and_wait(1)
                    .map_err(|e| WalbError::Io(io::Error::other(e.to_string())))?;
                let cq = ring.completion();
                for cqe in cq {
                    completed.insert(cqe.user_data() as u32, cqe.result());
                }
            },
            Backend::Sync { done, .. } => match done.remove(&key) {
                Some(Ok(())) => Ok(()),
                Some(Err(e)) => Err(WalbError::Io(e)),
                None => Err(WalbError::Arg(format!("unknown aio key {key}"))),
            },
        }
    }
}

/// Full pwrite loop handling short writes.
fn pwrite_all(fd: RawFd, mut offset: u64, buf: *const u8, len: usize) -> io::Result<()> {
    let mut written = 0usize;
    while written < len {
        // Safety: caller guarantees buf..buf+len is valid; offset checked
        // against i64 range at prepare time.
        let n = unsafe {
            libc::pwrite(
                fd,
                buf.add(written) as *const libc::c_void,
                len - written,
                offset as libc::off_t,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "pwrite wrote 0"));
        }
        written += n as usize;
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_write_roundtrip() {
        let mut file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let mut aio = Aio::new(file.as_raw_fd(), 8);

        let data = vec![0x5Au8; 1024];
        // Safety: data outlives the wait below.
        let key = unsafe { aio.prepare_write(512, data.as_ptr(), data.len()).unwrap() };
        aio.submit().unwrap();
        aio.wait_for(key).unwrap();

        let mut buf = vec![0u8; 1024];
        file.seek(SeekFrom::Start(512)).unwrap();
        file.read_exact(&mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_multiple_writes_awaited_out_of_order() {
        let mut file = tempfile::tempfile().unwrap();
        file.set_len(8192).unwrap();
        let mut aio = Aio::new(file.as_raw_fd(), 8);

        let a = vec![1u8; 512];
        let b = vec![2u8; 512];
        let (ka, kb) = unsafe {
            let ka = aio.prepare_write(0, a.as_ptr(), a.len()).unwrap();
            let kb = aio.prepare_write(512, b.as_ptr(), b.len()).unwrap();
            (ka, kb)
        };
        aio.submit().unwrap();
        aio.wait_for(kb).unwrap();
        aio.wait_for(ka).unwrap();

        let mut buf = vec![0u8; 1024];
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut buf).unwrap();
        assert!(buf[..512].iter().all(|&x| x == 1));
        assert!(buf[512..].iter().all(|&x| x == 2));
    }

    #[test]
    fn test_offset_overflow_rejected() {
        let file = tempfile::tempfile().unwrap();
        let mut aio = Aio::new(file.as_raw_fd(), 2);
        let data = [0u8; 16];
        let result = unsafe { aio.prepare_write(u64::MAX, data.as_ptr(), data.len()) };
        assert!(result.is_err());
    }
}
