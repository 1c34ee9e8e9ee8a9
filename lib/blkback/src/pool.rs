// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-size object pools with FIFO waiter handoff.
//!
//! A pool converts "no free object" into a suspension point: `acquire`
//! either yields an object or enqueues the asking instance, and a later
//! `release` hands the freed object directly to the eldest waiter instead of
//! returning it to the free list.  Resuming the waiter is the caller's job;
//! it must happen with no instance lock held, so `release` only reports the
//! handoff.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::instance::Instance;
use crate::io::{Fragment, IoEntry, ReqEntry};

pub struct Pool<T> {
    name: &'static str,
    inner: Mutex<PoolInner<T>>,
}

struct PoolInner<T> {
    free: Vec<Box<T>>,
    waiters: VecDeque<Arc<Instance>>,
}

impl<T> Pool<T> {
    pub fn new(
        name: &'static str,
        count: usize,
        mut ctor: impl FnMut() -> T,
    ) -> Self {
        let free = (0..count).map(|_| Box::new(ctor())).collect();
        Self {
            name,
            inner: Mutex::new(PoolInner { free, waiters: VecDeque::new() }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Take a free object, or enqueue `waiter` for the next release.
    ///
    /// A `None` return means the instance is now parked on this pool and
    /// must suspend; it will be resumed with the object once one frees up.
    pub fn acquire(&self, waiter: &Arc<Instance>) -> Option<Box<T>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.free.pop() {
            Some(obj) => Some(obj),
            None => {
                inner.waiters.push_back(Arc::clone(waiter));
                None
            }
        }
    }

    /// Return an object.  If an instance is waiting, the object bypasses the
    /// free list: the caller receives `(waiter, object)` and must resume the
    /// waiter with it.  Waiters are served strictly in arrival order.
    #[must_use]
    pub fn release(&self, obj: Box<T>) -> Option<(Arc<Instance>, Box<T>)> {
        let mut inner = self.inner.lock().unwrap();
        match inner.waiters.pop_front() {
            Some(waiter) => Some((waiter, obj)),
            None => {
                inner.free.push(obj);
                None
            }
        }
    }

    /// Drop `inst` from the waiter queue (instance teardown).  Returns true
    /// if it was queued.
    pub fn cancel_wait(&self, inst: &Arc<Instance>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.waiters.len();
        inner.waiters.retain(|w| !Arc::ptr_eq(w, inst));
        inner.waiters.len() != before
    }

    /// Objects currently on the free list.
    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    /// Instances currently parked on this pool.
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }
}

/// Default sizing for the three pools.
#[derive(Copy, Clone, Debug)]
pub struct PoolSizes {
    pub requests: usize,
    pub ios: usize,
    pub fragments: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self { requests: 64, ios: 64, fragments: 128 }
    }
}

/// The process-wide pool set shared by every instance.
pub struct Pools {
    pub requests: Pool<ReqEntry>,
    pub ios: Pool<IoEntry>,
    pub fragments: Pool<Fragment>,
}

impl Pools {
    pub fn new(sizes: PoolSizes) -> Self {
        Self {
            requests: Pool::new(
                "requests",
                sizes.requests,
                ReqEntry::default,
            ),
            ios: Pool::new("ios", sizes.ios, IoEntry::default),
            fragments: Pool::new(
                "fragments",
                sizes.fragments,
                Fragment::default,
            ),
        }
    }
}
