// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for worker threads owned by storage backends.

use std::io::Result;
use std::sync::Mutex;
use std::thread::JoinHandle;

pub type NotifyFn = dyn Fn() + Send + Sync + 'static;

/// Collection of worker threads joined together at shutdown.
#[derive(Default)]
pub struct ThreadGroup {
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb the results of a batch of thread spawns, keeping the handles
    /// of those which succeeded.  The first spawn error (if any) is
    /// returned after the whole batch has been processed.
    pub fn extend(
        &self,
        spawns: impl Iterator<Item = Result<JoinHandle<()>>>,
    ) -> Result<()> {
        let mut threads = self.threads.lock().unwrap();
        let mut res = Ok(());
        for spawn in spawns {
            match spawn {
                Ok(hdl) => threads.push(hdl),
                Err(e) => {
                    if res.is_ok() {
                        res = Err(e);
                    }
                }
            }
        }
        res
    }

    /// Block until all worker threads have exited.  The workers must have
    /// been told to bail first, or this will wait forever.
    pub fn block_until_joined(&self) {
        let threads = {
            let mut guard = self.threads.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for t in threads {
            let _ = t.join();
        }
    }
}
