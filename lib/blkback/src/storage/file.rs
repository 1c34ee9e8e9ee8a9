// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::fs::{metadata, File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::Context;
use blkif::SECTOR_SHIFT;

use crate::storage::{DeviceInfo, Dir, IoResult, IoTicket, Storage, Transfer};
use crate::tasks::ThreadGroup;

// XXX: completely arb for now
const MAX_WORKERS: usize = 32;

/// Backing store reading/writing a host file (or device node).
pub struct FileStorage {
    state: Arc<FileState>,
    workers: ThreadGroup,
    worker_count: NonZeroUsize,
}

struct FileState {
    fp: File,
    info: DeviceInfo,
    queue: Mutex<SubmitQueue>,
    cv: Condvar,
}

struct SubmitQueue {
    entries: VecDeque<(Transfer, IoTicket)>,
    halted: bool,
}

impl FileState {
    fn processing_loop(&self) {
        loop {
            let work = {
                let mut q = self.queue.lock().unwrap();
                loop {
                    if let Some(w) = q.entries.pop_front() {
                        break Some(w);
                    }
                    // Already-queued work is drained before bailing on halt.
                    if q.halted {
                        break None;
                    }
                    q = self.cv.wait(q).unwrap();
                }
            };
            let Some((mut xfer, ticket)) = work else { return };

            let res = match self.process(&mut xfer) {
                Ok(()) => IoResult::Success,
                Err(_) => IoResult::Failure,
            };
            ticket.complete(res);
        }
    }

    fn process(
        &self,
        xfer: &mut Transfer,
    ) -> std::result::Result<(), &'static str> {
        if self.info.read_only && xfer.dir() == Dir::Write {
            return Err("read-only backing store");
        }
        let fd = self.fp.as_raw_fd();
        let mut off = (xfer.sector() << SECTOR_SHIFT) as libc::off_t;
        match xfer.dir() {
            Dir::Read => {
                // Safety: the buffer is live until the ticket fires, and
                // this worker is its only accessor.
                let buf = unsafe { xfer.buf_mut() };
                let mut done = 0;
                while done < buf.len() {
                    let nread = unsafe {
                        libc::pread(
                            fd,
                            buf[done..].as_mut_ptr() as *mut libc::c_void,
                            buf.len() - done,
                            off,
                        )
                    };
                    if nread <= 0 {
                        return Err("io error");
                    }
                    done += nread as usize;
                    off += nread as libc::off_t;
                }
            }
            Dir::Write => {
                let buf = unsafe { xfer.buf() };
                let mut done = 0;
                while done < buf.len() {
                    let nwritten = unsafe {
                        libc::pwrite(
                            fd,
                            buf[done..].as_ptr() as *const libc::c_void,
                            buf.len() - done,
                            off,
                        )
                    };
                    if nwritten <= 0 {
                        return Err("io error");
                    }
                    done += nwritten as usize;
                    off += nwritten as libc::off_t;
                }
            }
        }
        Ok(())
    }
}

impl FileStorage {
    /// Open a backing store at `path`.
    pub fn create(
        path: impl AsRef<Path>,
        read_only: Option<bool>,
        worker_count: NonZeroUsize,
    ) -> Result<Arc<Self>> {
        if worker_count.get() > MAX_WORKERS {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "too many workers",
            ));
        }
        let p: &Path = path.as_ref();

        let meta = metadata(p)?;
        let read_only = match (read_only, meta.permissions().readonly()) {
            (Some(false), true) => Err(Error::new(
                ErrorKind::Other,
                "writeable backing store with read-only file not allowed",
            )),
            (Some(ro), false) => Ok(ro),
            (_, file_ro) => Ok(file_ro),
        }?;

        let fp = OpenOptions::new().read(true).write(!read_only).open(p)?;
        let len = fp.metadata()?.len();
        if len == 0 {
            return Err(Error::new(ErrorKind::Other, "file is empty"));
        }

        Ok(Arc::new(Self {
            state: Arc::new(FileState {
                fp,
                info: DeviceInfo {
                    sectors: len >> SECTOR_SHIFT,
                    read_only,
                },
                queue: Mutex::new(SubmitQueue {
                    entries: VecDeque::new(),
                    halted: false,
                }),
                cv: Condvar::new(),
            }),
            workers: ThreadGroup::new(),
            worker_count,
        }))
    }

    fn spawn_workers(&self) -> Result<()> {
        let spawns = (0..self.worker_count.get()).map(|n| {
            let state = Arc::clone(&self.state);
            std::thread::Builder::new()
                .name(format!("file worker {n}"))
                .spawn(move || state.processing_loop())
        });
        self.workers.extend(spawns)
    }
}

impl Storage for FileStorage {
    fn info(&self) -> DeviceInfo {
        self.state.info
    }

    fn submit(&self, xfer: Transfer, ticket: IoTicket) {
        let mut q = self.state.queue.lock().unwrap();
        if q.halted {
            // Dropping the ticket reports the failure.
            return;
        }
        q.entries.push_back((xfer, ticket));
        self.state.cv.notify_one();
    }

    fn start(&self) -> anyhow::Result<()> {
        if let Err(e) = self.spawn_workers() {
            self.stop();
            Err(e).context("failure while spawning workers")
        } else {
            Ok(())
        }
    }

    fn stop(&self) {
        {
            let mut q = self.state.queue.lock().unwrap();
            q.halted = true;
            self.state.cv.notify_all();
        }
        self.workers.block_until_joined();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn create_sizes_from_file() {
        let mut tf = tempfile::NamedTempFile::new().unwrap();
        tf.write_all(&[0u8; 8192]).unwrap();
        tf.flush().unwrap();

        let storage = FileStorage::create(
            tf.path(),
            None,
            NonZeroUsize::new(1).unwrap(),
        )
        .unwrap();
        let info = storage.info();
        assert_eq!(info.sectors, 16);
        assert!(!info.read_only);
    }

    #[test]
    fn create_rejects_empty_file() {
        let tf = tempfile::NamedTempFile::new().unwrap();
        assert!(FileStorage::create(
            tf.path(),
            None,
            NonZeroUsize::new(1).unwrap(),
        )
        .is_err());
    }
}
