// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backend instances and their control-plane surface.
//!
//! An [`Instance`] is one guest-facing backend: its lifecycle runs
//! `Created → Connected → Disconnecting → Disconnected`, driven by the
//! (external) control plane.  Teardown is gated by a reference count held
//! once per in-flight transfer: disconnect drains rather than aborts, and
//! the ring and event channel survive until the last completion.
//!
//! Completion handling also lives here: a fired [`IoTicket`] resolves the
//! transfer's fragments, emits ring replies for requests that finished, and
//! recycles the records, with every pool release, unmap, and guest signal
//! performed only after the instance lock is dropped, since any of them may
//! lock another instance.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, Weak};

use slog::{info, o};

use blkif::{GrantRef, RingResponse, STATUS_ERROR, STATUS_OK};

use crate::io::{Fragment, IoEntry, ReqEntry, ReqKey};
use crate::mapper::{DomId, GrantMap, GrantMapping, MapError, Mapper};
use crate::pool::{PoolSizes, Pools};
use crate::probes;
use crate::ring::Ring;
use crate::sched::{CurReq, Resume, RunState, Step, WaitSpot};
use crate::storage::{IoResult, IoTicket, Storage, Transfer};
use crate::vbd::Vbd;
use crate::EventChannel;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("operation invalid in current lifecycle state")]
    BadState,
    #[error("instance busy; disconnect must complete first")]
    Busy,
    #[error("failed to map ring page")]
    RingMap(#[source] MapError),
    #[error("vdev {0} already attached")]
    VbdExists(u16),
    #[error("vdev {0} not attached")]
    UnknownVbd(u16),
    #[error("extent outside backing store")]
    ExtentOutOfRange,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    Created,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Per-instance counters, readable by the control plane.
#[derive(Copy, Clone, Debug, Default)]
pub struct Stats {
    pub requests: u64,
    pub replies: u64,
    pub errors: u64,
    pub ios: u64,
    pub suspensions: u64,
}

/// Work that must run with the instance lock dropped.
#[derive(Default)]
pub(crate) struct Deferred {
    pub unmaps: Vec<GrantMapping>,
    pub reqs: Vec<Box<ReqEntry>>,
    pub ios: Vec<Box<IoEntry>>,
    pub frags: Vec<Box<Fragment>>,
    pub signal: bool,
}

/// Process-wide context: the pools and the mapper, shared by every
/// instance.
pub struct Backend {
    pub(crate) pools: Pools,
    pub(crate) mapper: Arc<Mapper>,
    self_ref: Weak<Backend>,
    log: slog::Logger,
}

impl Backend {
    pub fn new(
        facility: Arc<dyn GrantMap>,
        sizes: PoolSizes,
        log: slog::Logger,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            pools: Pools::new(sizes),
            mapper: Mapper::new(facility),
            self_ref: Weak::clone(self_ref),
            log,
        })
    }

    /// Control-plane "create": mint an instance for (guest, handle).
    pub fn create_instance(
        &self,
        domid: DomId,
        handle: u16,
    ) -> Arc<Instance> {
        let log = self
            .log
            .new(o!("domid" => domid.0, "handle" => handle));
        info!(log, "instance created");
        let backend =
            self.self_ref.upgrade().expect("backend is alive");
        Arc::new_cyclic(|self_ref| Instance {
            backend,
            domid,
            handle,
            log,
            self_ref: Weak::clone(self_ref),
            state: Mutex::new(InstanceState::new()),
        })
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }
}

pub(crate) struct InstanceState {
    pub lifecycle: Lifecycle,
    /// One reference per in-flight transfer; teardown waits for zero.
    pub refs: u32,
    pub ring: Option<Ring>,
    pub evtchn: Option<Arc<dyn EventChannel>>,
    pub vbds: BTreeMap<u16, Vbd>,
    pub run: RunState,
    pub step: Step,
    pub cur: Option<CurReq>,
    pub open_io: Option<Box<IoEntry>>,
    pub outstanding: BTreeMap<ReqKey, Box<ReqEntry>>,
    pub next_key: ReqKey,
    pub deferred: Deferred,
    pub stats: Stats,
}

impl InstanceState {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Created,
            refs: 0,
            ring: None,
            evtchn: None,
            vbds: BTreeMap::new(),
            run: RunState::Idle,
            step: Step::Idle,
            cur: None,
            open_io: None,
            outstanding: BTreeMap::new(),
            next_key: 1,
            deferred: Deferred::default(),
            stats: Stats::default(),
        }
    }
}

/// One guest-facing backend instance.
pub struct Instance {
    pub(crate) backend: Arc<Backend>,
    pub(crate) domid: DomId,
    handle: u16,
    pub(crate) log: slog::Logger,
    /// Self-handle for wait-list registration and completion tickets.
    self_ref: Weak<Instance>,
    pub(crate) state: Mutex<InstanceState>,
}

impl Instance {
    pub(crate) fn self_arc(&self) -> Arc<Instance> {
        self.self_ref.upgrade().expect("instance is alive")
    }

    pub fn domid(&self) -> DomId {
        self.domid
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().unwrap().lifecycle
    }

    pub fn stats(&self) -> Stats {
        self.state.lock().unwrap().stats
    }

    /// Control-plane "connect": map the ring page and go live.
    pub fn connect(
        &self,
        ring_gref: GrantRef,
        evtchn: Arc<dyn EventChannel>,
    ) -> Result<(), ControlError> {
        let mut st = self.state.lock().unwrap();
        if st.lifecycle != Lifecycle::Created {
            return Err(ControlError::BadState);
        }
        let mapping = self
            .backend
            .mapper
            .map_now(self.domid, &[ring_gref], true)
            .map_err(ControlError::RingMap)?;
        st.ring = Some(Ring::new(mapping));
        st.evtchn = Some(evtchn);
        st.lifecycle = Lifecycle::Connected;
        info!(self.log, "instance connected");
        Ok(())
    }

    /// Control-plane "disconnect": stop consuming the ring, drain in-flight
    /// transfers, and tear down once the reference count settles.
    /// Idempotent.
    pub fn disconnect(&self) -> Result<(), ControlError> {
        let mut st = self.state.lock().unwrap();
        match st.lifecycle {
            Lifecycle::Created => {
                st.lifecycle = Lifecycle::Disconnected;
                return Ok(());
            }
            Lifecycle::Disconnecting | Lifecycle::Disconnected => {
                return Ok(());
            }
            Lifecycle::Connected => {}
        }
        st.lifecycle = Lifecycle::Disconnecting;
        info!(self.log, "disconnect requested"; "refs" => st.refs);

        if let RunState::Suspended(spot) = st.run {
            // Pull the parked chain off its wait list and abandon it.
            // Losing the race against an in-progress handoff is fine: the
            // stale resume finds the chain idle and sends the resource
            // back.
            let this = self.self_arc();
            match spot {
                WaitSpot::ReqPool => {
                    self.backend.pools.requests.cancel_wait(&this)
                }
                WaitSpot::IoPool => {
                    self.backend.pools.ios.cancel_wait(&this)
                }
                WaitSpot::FragPool => {
                    self.backend.pools.fragments.cancel_wait(&this)
                }
                WaitSpot::MapRetry => {
                    self.backend.mapper.cancel_retry(&this)
                }
            };
            self.abort_chain(&mut st);
            st.run = RunState::Idle;
        }

        let ev = st.evtchn.clone();
        self.finalize_locked(&mut st);
        let deferred = std::mem::take(&mut st.deferred);
        drop(st);
        self.flush_deferred(deferred, ev);
        Ok(())
    }

    /// Control-plane "destroy": only a fully quiesced instance may go.
    pub fn destroy(&self) -> Result<(), ControlError> {
        let mut st = self.state.lock().unwrap();
        match st.lifecycle {
            Lifecycle::Created | Lifecycle::Disconnected => {
                st.lifecycle = Lifecycle::Disconnected;
                st.vbds.clear();
                info!(self.log, "instance destroyed");
                Ok(())
            }
            _ => Err(ControlError::Busy),
        }
    }

    /// Control-plane "vbd-create": expose an extent of `storage` as
    /// guest-visible device `vdev`.  `sectors` of `None` takes everything
    /// from `extent_start` to the end of the store.
    pub fn vbd_attach(
        &self,
        vdev: u16,
        storage: Arc<dyn Storage>,
        extent_start: u64,
        sectors: Option<u64>,
        read_only: bool,
    ) -> Result<(), ControlError> {
        let info = storage.info();
        let mut st = self.state.lock().unwrap();
        if st.vbds.contains_key(&vdev) {
            return Err(ControlError::VbdExists(vdev));
        }
        let avail = info
            .sectors
            .checked_sub(extent_start)
            .ok_or(ControlError::ExtentOutOfRange)?;
        let sectors = match sectors {
            None => avail,
            Some(s) if s <= avail => s,
            Some(_) => return Err(ControlError::ExtentOutOfRange),
        };
        if sectors == 0 {
            return Err(ControlError::ExtentOutOfRange);
        }
        let read_only = read_only || info.read_only;
        st.vbds.insert(
            vdev,
            Vbd { vdev, storage, extent_start, sectors, read_only },
        );
        info!(self.log, "vbd attached";
            "vdev" => vdev, "sectors" => sectors, "ro" => read_only);
        Ok(())
    }

    /// Control-plane "vbd-destroy".  In-flight transfers keep their own
    /// reference to the backing store and finish normally.
    pub fn vbd_detach(&self, vdev: u16) -> Result<(), ControlError> {
        let mut st = self.state.lock().unwrap();
        match st.vbds.remove(&vdev) {
            Some(_) => {
                info!(self.log, "vbd detached"; "vdev" => vdev);
                Ok(())
            }
            None => Err(ControlError::UnknownVbd(vdev)),
        }
    }

    /// The event-channel interrupt: the guest advanced the producer index.
    pub fn notify(&self) {
        self.kick();
    }

    /// Hand a mapped transfer to its backing store.  Runs with the
    /// instance lock dropped.
    pub(crate) fn submit_io(&self, io: Box<IoEntry>) {
        let storage =
            Arc::clone(io.storage.as_ref().expect("transfer has storage"));
        let mapping =
            io.mapping.as_ref().expect("transfer mapped before submit");
        // Safety: the transfer window lies within the mapping, which the
        // entry keeps alive until completion.
        let base = unsafe {
            NonNull::new_unchecked(
                mapping.base().as_ptr().add(io.map_offset()),
            )
        };
        let xfer =
            Transfer::new(io.dir(), io.start_sector, base, io.bytes);
        let ticket = IoTicket::new(self.self_arc(), io);
        storage.submit(xfer, ticket);
    }

    /// Host I/O completion, in strict order: unmap the pages (replies must
    /// not become visible before the data they describe), resolve each
    /// fragment, reply for requests that finished, recycle the records, and
    /// let a pending teardown proceed if this was the last reference.
    pub(crate) fn io_done(&self, mut io: Box<IoEntry>, res: IoResult) {
        if let Some(mapping) = io.mapping.take() {
            self.backend.mapper.unmap(mapping);
        }
        probes::io_complete!(|| (
            self.domid.0,
            io.start_sector,
            u8::from(!res.is_err()),
        ));

        let mut st = self.state.lock().unwrap();
        debug_assert!(st.refs > 0);
        st.refs -= 1;
        let err = res.is_err();
        for frag in io.frags.drain(..) {
            self.resolve_frag(&mut st, frag.req, err);
            st.deferred.frags.push(frag);
        }
        io.reset();
        st.deferred.ios.push(io);

        let ev = st.evtchn.clone();
        self.finalize_locked(&mut st);
        let deferred = std::mem::take(&mut st.deferred);
        drop(st);
        self.flush_deferred(deferred, ev);
    }

    /// Drop one fragment's hold on its request; the last one out emits the
    /// reply.
    pub(crate) fn resolve_frag(
        &self,
        st: &mut InstanceState,
        key: ReqKey,
        err: bool,
    ) {
        let finished = {
            let req = st
                .outstanding
                .get_mut(&key)
                .expect("fragment references live request");
            req.pending -= 1;
            if err {
                req.errors += 1;
            }
            req.pending == 0
        };
        if finished {
            let req = st.outstanding.remove(&key).unwrap();
            self.emit_reply_for(st, &req);
            st.deferred.reqs.push(req);
        }
    }

    pub(crate) fn emit_reply_for(
        &self,
        st: &mut InstanceState,
        req: &ReqEntry,
    ) {
        let status =
            if req.errors != 0 { STATUS_ERROR } else { STATUS_OK };
        self.emit_reply(st, req.id, req.op, status);
    }

    /// Write one reply slot and note that the guest needs a signal.  The
    /// response ring cannot overrun: there is at most one reply per
    /// consumed request slot.
    pub(crate) fn emit_reply(
        &self,
        st: &mut InstanceState,
        id: u64,
        op: u8,
        status: i16,
    ) {
        let Some(ring) = st.ring.as_mut() else { return };
        ring.push_response(&RingResponse {
            id,
            op,
            status,
            ..Default::default()
        });
        st.deferred.signal = true;
        st.stats.replies += 1;
        if status == STATUS_ERROR {
            st.stats.errors += 1;
        }
        probes::reply!(|| (self.domid.0, id, status));
    }

    /// Complete a pending teardown once nothing is in flight and no chain
    /// is active.
    pub(crate) fn finalize_locked(&self, st: &mut InstanceState) {
        if st.lifecycle != Lifecycle::Disconnecting {
            return;
        }
        if st.refs != 0 || st.run != RunState::Idle {
            return;
        }
        debug_assert!(st.outstanding.is_empty());
        if let Some(ring) = st.ring.take() {
            st.deferred.unmaps.push(ring.into_mapping());
        }
        st.evtchn = None;
        st.lifecycle = Lifecycle::Disconnected;
        info!(self.log, "instance torn down");
    }

    /// Run the deferred work collected under the lock: guest signal first,
    /// then unmaps, then pool returns (each of which may resume another
    /// instance).
    pub(crate) fn flush_deferred(
        &self,
        d: Deferred,
        ev: Option<Arc<dyn EventChannel>>,
    ) {
        if d.signal {
            if let Some(ev) = ev {
                ev.signal();
            }
        }
        for mapping in d.unmaps {
            self.backend.mapper.unmap(mapping);
        }
        let pools = &self.backend.pools;
        for obj in d.frags {
            if let Some((inst, obj)) = pools.fragments.release(obj) {
                inst.resume(Resume::Frag(obj));
            }
        }
        for obj in d.ios {
            if let Some((inst, obj)) = pools.ios.release(obj) {
                inst.resume(Resume::Io(obj));
            }
        }
        for obj in d.reqs {
            if let Some((inst, obj)) = pools.requests.release(obj) {
                inst.resume(Resume::Req(obj));
            }
        }
    }
}
