// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::io::{Error, ErrorKind, Result};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::Context;
use blkif::{SECTOR_SHIFT, SECTOR_SIZE};

use crate::storage::{DeviceInfo, Dir, IoResult, IoTicket, Storage, Transfer};
use crate::tasks::ThreadGroup;

/// Backing store held in anonymous memory.
///
/// Not useful for keeping data beyond the life of the process, but handy for
/// exercising the rest of the pipeline.
pub struct MemStorage {
    state: Arc<MemState>,
    workers: ThreadGroup,
}

struct MemState {
    bytes: Mutex<Vec<u8>>,
    info: DeviceInfo,
    queue: Mutex<SubmitQueue>,
    cv: Condvar,
}

struct SubmitQueue {
    entries: VecDeque<(Transfer, IoTicket)>,
    halted: bool,
}

impl MemState {
    fn processing_loop(&self) {
        loop {
            let work = {
                let mut q = self.queue.lock().unwrap();
                loop {
                    if let Some(w) = q.entries.pop_front() {
                        break Some(w);
                    }
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
        let off = (xfer.sector() << SECTOR_SHIFT) as usize;
        let mut bytes = self.bytes.lock().unwrap();
        let end = off.checked_add(xfer.len()).ok_or("extent overflow")?;
        if end > bytes.len() {
            return Err("extent beyond device");
        }
        match xfer.dir() {
            Dir::Read => {
                // Safety: the buffer is live until the ticket fires, and
                // this worker is its only accessor.
                let buf = unsafe { xfer.buf_mut() };
                buf.copy_from_slice(&bytes[off..end]);
            }
            Dir::Write => {
                if self.info.read_only {
                    return Err("read-only backing store");
                }
                let buf = unsafe { xfer.buf() };
                bytes[off..end].copy_from_slice(buf);
            }
        }
        Ok(())
    }
}

impl MemStorage {
    /// Create a zero-filled store of `size` bytes.
    pub fn create(size: usize, read_only: bool) -> Result<Arc<Self>> {
        Self::with_bytes(vec![0; size], read_only)
    }

    pub fn with_bytes(bytes: Vec<u8>, read_only: bool) -> Result<Arc<Self>> {
        let len = bytes.len();
        if len == 0 {
            return Err(Error::new(ErrorKind::Other, "size cannot be 0"));
        } else if len % SECTOR_SIZE != 0 {
            return Err(Error::new(
                ErrorKind::Other,
                format!("size {len} not multiple of sector size"),
            ));
        }

        Ok(Arc::new(Self {
            state: Arc::new(MemState {
                bytes: Mutex::new(bytes),
                info: DeviceInfo {
                    sectors: (len >> SECTOR_SHIFT) as u64,
                    read_only,
                },
                queue: Mutex::new(SubmitQueue {
                    entries: VecDeque::new(),
                    halted: false,
                }),
                cv: Condvar::new(),
            }),
            workers: ThreadGroup::new(),
        }))
    }

    /// Copy of the current contents, for inspection in tests.
    pub fn contents(&self) -> Vec<u8> {
        self.state.bytes.lock().unwrap().clone()
    }
}

impl Storage for MemStorage {
    fn info(&self) -> DeviceInfo {
        self.state.info
    }

    fn submit(&self, xfer: Transfer, ticket: IoTicket) {
        let mut q = self.state.queue.lock().unwrap();
        if q.halted {
            return;
        }
        q.entries.push_back((xfer, ticket));
        self.state.cv.notify_one();
    }

    fn start(&self) -> anyhow::Result<()> {
        let state = Arc::clone(&self.state);
        let spawn = std::thread::Builder::new()
            .name("mem worker".to_string())
            .spawn(move || state.processing_loop());
        if let Err(e) = self.workers.extend(std::iter::once(spawn)) {
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

    #[test]
    fn rejects_unaligned_size() {
        assert!(MemStorage::create(1000, false).is_err());
        assert!(MemStorage::create(0, false).is_err());
        assert!(MemStorage::create(4096, false).is_ok());
    }
}
