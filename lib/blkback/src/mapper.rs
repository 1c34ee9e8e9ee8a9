// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boundary to the page-sharing facility, plus the retry queue for
//! transient mapping exhaustion.
//!
//! The facility itself (hypercall plumbing, virtual-address carving) lives
//! behind [`GrantMap`].  The [`Mapper`] owns the one process-wide queue of
//! instances whose mapping attempt hit [`MapError::Exhausted`]; its drain
//! hook is registered with the facility exactly once, at construction.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, Weak};

use blkif::GrantRef;

use crate::instance::Instance;
use crate::sched::Resume;

/// Identity of the guest whose pages are being mapped.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DomId(pub u16);

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// No backend virtual-address space right now; worth retrying once the
    /// facility signals that some was released.
    #[error("grant-mapping space exhausted")]
    Exhausted,
    /// The facility refused the mapping outright (bad grant, revoked page).
    #[error("grant mapping rejected (status {0})")]
    Rejected(i32),
}

impl MapError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MapError::Exhausted)
    }
}

/// A successfully mapped, virtually contiguous run of granted pages.
///
/// The range stays valid until handed back through [`GrantMap::unmap`]; the
/// holder is responsible for doing so before the backing pages can be
/// reused.
#[derive(Debug)]
pub struct GrantMapping {
    base: NonNull<u8>,
    len: usize,
    cookie: u64,
}

// The mapping describes memory owned by the facility, not by any thread.
unsafe impl Send for GrantMapping {}

impl GrantMapping {
    pub fn new(base: NonNull<u8>, len: usize, cookie: u64) -> Self {
        Self { base, len, cookie }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Facility-private token identifying this mapping for unmap.
    pub fn cookie(&self) -> u64 {
        self.cookie
    }
}

/// The page-sharing facility.
pub trait GrantMap: Send + Sync + 'static {
    /// Map `grefs` of `domid` into one virtually contiguous range.
    fn map(
        &self,
        domid: DomId,
        grefs: &[GrantRef],
        writable: bool,
    ) -> Result<GrantMapping, MapError>;

    /// Release a mapping.  The facility may signal its space-notify hook
    /// from within this call.
    fn unmap(&self, mapping: GrantMapping);

    /// Install the hook invoked whenever mapping space may have become
    /// available.  Called exactly once, at system init.
    fn register_space_notify(&self, notify: Box<crate::tasks::NotifyFn>);
}

#[derive(Default)]
struct DrainState {
    active: bool,
    again: bool,
}

/// Core-side wrapper owning the pending-retries FIFO.
pub struct Mapper {
    facility: Arc<dyn GrantMap>,
    retries: Mutex<VecDeque<Arc<Instance>>>,
    drain_state: Mutex<DrainState>,
}

impl Mapper {
    pub fn new(facility: Arc<dyn GrantMap>) -> Arc<Self> {
        let mapper = Arc::new(Self {
            facility,
            retries: Mutex::new(VecDeque::new()),
            drain_state: Mutex::new(DrainState::default()),
        });
        let weak: Weak<Mapper> = Arc::downgrade(&mapper);
        mapper.facility.register_space_notify(Box::new(move || {
            if let Some(mapper) = weak.upgrade() {
                mapper.drain();
            }
        }));
        mapper
    }

    /// Attempt a mapping for `inst`.  `Ok(None)` means the attempt hit
    /// transient exhaustion and the instance is now queued for retry; it
    /// must suspend.  Hard failure is returned as-is.
    pub fn map_or_wait(
        &self,
        inst: &Arc<Instance>,
        domid: DomId,
        grefs: &[GrantRef],
        writable: bool,
    ) -> Result<Option<GrantMapping>, MapError> {
        match self.facility.map(domid, grefs, writable) {
            Ok(mapping) => Ok(Some(mapping)),
            Err(MapError::Exhausted) => {
                let mut retries = self.retries.lock().unwrap();
                retries.push_back(Arc::clone(inst));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// One-shot mapping with no retry queueing, for callers (ring connect)
    /// who surface exhaustion as a plain error.
    pub fn map_now(
        &self,
        domid: DomId,
        grefs: &[GrantRef],
        writable: bool,
    ) -> Result<GrantMapping, MapError> {
        self.facility.map(domid, grefs, writable)
    }

    pub fn unmap(&self, mapping: GrantMapping) {
        self.facility.unmap(mapping);
    }

    /// Drop `inst` from the retry queue (instance teardown).
    pub fn cancel_retry(&self, inst: &Arc<Instance>) -> bool {
        let mut retries = self.retries.lock().unwrap();
        let before = retries.len();
        retries.retain(|w| !Arc::ptr_eq(w, inst));
        retries.len() != before
    }

    /// Re-attempt queued mappings in FIFO order, resuming each instance on
    /// success or hard failure.  A still-exhausted attempt leaves its
    /// instance at the head and stops the pass.
    ///
    /// Re-entrant calls (an unmap performed by a resumed continuation will
    /// re-signal the facility) only flag another pass for the active
    /// drainer.
    fn drain(&self) {
        {
            let mut st = self.drain_state.lock().unwrap();
            if st.active {
                st.again = true;
                return;
            }
            st.active = true;
        }
        loop {
            self.drain_pass();
            let mut st = self.drain_state.lock().unwrap();
            if st.again {
                st.again = false;
            } else {
                st.active = false;
                return;
            }
        }
    }

    fn drain_pass(&self) {
        loop {
            let inst = { self.retries.lock().unwrap().pop_front() };
            let Some(inst) = inst else { return };
            // A cancelled waiter may still linger here if teardown raced the
            // pop; it simply has nothing left to map.
            let Some((domid, grefs, writable)) = inst.pending_map_params()
            else {
                continue;
            };
            match self.facility.map(domid, &grefs, writable) {
                Err(MapError::Exhausted) => {
                    self.retries.lock().unwrap().push_front(inst);
                    return;
                }
                res => inst.resume(Resume::Mapped(res)),
            }
        }
    }

    /// Instances currently parked for a mapping retry.
    pub fn retry_queue_len(&self) -> usize {
        self.retries.lock().unwrap().len()
    }
}
