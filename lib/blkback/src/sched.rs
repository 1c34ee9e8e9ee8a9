// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The continuation engine: what an instance does next, as data.
//!
//! An instance's progress through the ring is a [`Step`] stored in its
//! state plus a trampoline that runs the current step until the chain either
//! finishes (nothing published below the producer index) or suspends on a
//! resource.  Suspension parks the instance on exactly one wait list; the
//! eventual holder of the resource calls [`Instance::resume`] with it and
//! the trampoline picks up where the chain left off.  At most one chain is
//! in flight per instance, so the chain itself runs free of contention: only
//! completion accounting ever interleaves with it.
//!
//! Nothing here blocks.  External calls (storage submit, grant unmap, pool
//! release, event signal) are made only with the instance lock dropped,
//! because any of them can lock another instance while handing a resource
//! over.

use std::sync::{Arc, MutexGuard};

use slog::warn;

use blkif::{
    GrantRef, RingRequest, MAX_SEGMENTS_PER_REQ, OP_PROBE, OP_READ,
    OP_WRITE, SECTOR_SHIFT, STATUS_ERROR, VBD_INFO_SIZE,
};
use zerocopy::IntoBytes;

use crate::instance::{Instance, InstanceState, Lifecycle};
use crate::io::{Admit, Fragment, IoEntry, ReqEntry, SegView};
use crate::mapper::{DomId, GrantMapping, MapError};
use crate::probes;
use crate::storage::{Dir, Storage};

/// Which wait list a suspended instance is parked on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WaitSpot {
    ReqPool,
    IoPool,
    FragPool,
    MapRetry,
}

/// Whether a continuation chain is idle, running, or parked.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RunState {
    Idle,
    Running,
    Suspended(WaitSpot),
}

/// The continuation: which piece of the pipeline runs next.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Step {
    /// No chain in progress.
    Idle,
    /// Look at the ring for the next request (or finish the chain).
    Drain,
    /// Allocate the request entry shadowing the decoded request.
    NeedReq,
    /// Process the next segment of the decoded request.
    Walk,
    /// Open a fresh transfer accumulator.
    NeedIo,
    /// Link the decoded request into the open transfer.
    NeedFrag,
    /// Map the open transfer's pages, submit it, then continue at the
    /// given point.
    MapIo(AfterFlush),
    /// Map the probe page and emit the device records.
    ProbeMap,
}

/// Where a chain continues after flushing the open transfer.
#[derive(Copy, Clone, Debug)]
pub(crate) enum AfterFlush {
    Walk,
    Drain,
}

/// What a continuation tells the trampoline.
enum Control {
    /// Run the (already stored) next step immediately.
    Cont,
    /// Park; the chain is on the wait list matching the spot.
    Suspend(WaitSpot),
    /// Chain finished; instance goes idle.
    Done,
    /// Hand a mapped transfer to its backing store, then continue.
    Submit { io: Box<IoEntry>, then: Step },
    /// Unmap the filled probe page, then answer with the record count.
    ProbeReply { mapping: GrantMapping, count: u16 },
}

/// Resource delivered to a parked instance by whoever freed it.
pub(crate) enum Resume {
    Req(Box<ReqEntry>),
    Io(Box<IoEntry>),
    Frag(Box<Fragment>),
    Mapped(Result<GrantMapping, MapError>),
}

impl Resume {
    fn spot(&self) -> WaitSpot {
        match self {
            Resume::Req(_) => WaitSpot::ReqPool,
            Resume::Io(_) => WaitSpot::IoPool,
            Resume::Frag(_) => WaitSpot::FragPool,
            Resume::Mapped(_) => WaitSpot::MapRetry,
        }
    }
}

/// Cursor over the request currently being fed into aggregation.
pub(crate) struct CurReq {
    pub raw: RingRequest,
    /// Outstanding-map key of the shadowing [`ReqEntry`] (absent for
    /// probe, which needs no entry).
    pub key: Option<u64>,
    pub seg_idx: usize,
    /// Absolute device sector the next segment must describe.
    pub next_sector: u64,
    /// Absolute end bound of the target extent.
    pub extent_end: u64,
    pub storage: Option<Arc<dyn Storage>>,
    /// Whether a fragment already links this request into the open
    /// transfer.
    pub linked: bool,
}

enum Verdict {
    Probe,
    Io { storage: Arc<dyn Storage>, abs_sector: u64, extent_end: u64 },
    Reject,
}

impl Instance {
    /// Entry point for the ring interrupt: start a chain if none is active.
    /// An active or parked chain will observe the new producer index itself
    /// before going idle, so there is nothing to do in those cases.
    pub(crate) fn kick(&self) {
        let mut st = self.state.lock().unwrap();
        if st.lifecycle != Lifecycle::Connected {
            return;
        }
        if st.run == RunState::Idle {
            st.run = RunState::Running;
            st.step = Step::Drain;
            self.trampoline(st, None);
        }
    }

    /// Hand a freed resource to this instance and re-enter its chain.
    ///
    /// A stale handoff (the chain was cancelled after being queued) sends
    /// the resource back where it came from.
    pub(crate) fn resume(&self, input: Resume) {
        let mut st = self.state.lock().unwrap();
        match st.run {
            RunState::Suspended(spot) if spot == input.spot() => {
                st.run = RunState::Running;
                self.trampoline(st, Some(input));
            }
            _ => {
                drop(st);
                self.return_stale(input);
            }
        }
    }

    fn return_stale(&self, input: Resume) {
        let pools = &self.backend.pools;
        match input {
            Resume::Req(obj) => {
                if let Some((inst, obj)) = pools.requests.release(obj) {
                    inst.resume(Resume::Req(obj));
                }
            }
            Resume::Io(obj) => {
                if let Some((inst, obj)) = pools.ios.release(obj) {
                    inst.resume(Resume::Io(obj));
                }
            }
            Resume::Frag(obj) => {
                if let Some((inst, obj)) = pools.fragments.release(obj) {
                    inst.resume(Resume::Frag(obj));
                }
            }
            Resume::Mapped(Ok(mapping)) => {
                self.backend.mapper.unmap(mapping);
            }
            Resume::Mapped(Err(_)) => {}
        }
    }

    /// Grant parameters of the mapping this instance is parked on, for the
    /// mapper's retry pass.
    pub(crate) fn pending_map_params(
        &self,
    ) -> Option<(DomId, Vec<GrantRef>, bool)> {
        let st = self.state.lock().unwrap();
        if st.run != RunState::Suspended(WaitSpot::MapRetry) {
            return None;
        }
        match st.step {
            Step::MapIo(_) => {
                let io = st.open_io.as_ref()?;
                Some((self.domid, io.grefs.clone(), io.dir() == Dir::Read))
            }
            Step::ProbeMap => {
                let cur = st.cur.as_ref()?;
                Some((self.domid, vec![cur.raw.segments[0].gref], true))
            }
            _ => None,
        }
    }

    /// Run the chain until it suspends or finishes.  The guard is dropped
    /// around every external call and the deferred work (pool releases,
    /// unmaps, guest signal) is flushed at each of those windows and at
    /// exit.
    fn trampoline<'a>(
        &'a self,
        mut guard: MutexGuard<'a, InstanceState>,
        mut input: Option<Resume>,
    ) {
        loop {
            let step = std::mem::replace(&mut guard.step, Step::Idle);
            match self.advance(&mut guard, step, &mut input) {
                Control::Cont => continue,
                Control::Suspend(spot) => {
                    if guard.lifecycle != Lifecycle::Connected {
                        // Disconnect landed in an unlock window; don't park
                        // a chain nobody will tear down.  The wait-list
                        // entry just made goes stale and the eventual
                        // handoff bounces the resource back.
                        self.abort_chain(&mut guard);
                        guard.run = RunState::Idle;
                        break;
                    }
                    guard.run = RunState::Suspended(spot);
                    guard.stats.suspensions += 1;
                    break;
                }
                Control::Done => {
                    guard.run = RunState::Idle;
                    break;
                }
                Control::Submit { io, then } => {
                    guard.step = then;
                    guard.refs += 1;
                    guard.stats.ios += 1;
                    probes::io_submit!(|| (
                        self.domid.0,
                        io.start_sector,
                        io.bytes as u64,
                        io.grefs.len() as u8,
                    ));
                    self.release_and_flush(guard);
                    self.submit_io(io);
                    guard = self.state.lock().unwrap();
                }
                Control::ProbeReply { mapping, count } => {
                    self.release_and_flush(guard);
                    // Records must be guest-visible before the reply is.
                    self.backend.mapper.unmap(mapping);
                    guard = self.state.lock().unwrap();
                    let raw =
                        guard.cur.take().expect("probe in progress").raw;
                    self.emit_reply(&mut guard, raw.id, raw.op, count as i16);
                    guard.step = Step::Drain;
                }
            }
        }
        // Capture the channel before finalize can drop it; replies written
        // by this chain still deserve their signal.
        let ev = guard.evtchn.clone();
        self.finalize_locked(&mut guard);
        let deferred = std::mem::take(&mut guard.deferred);
        drop(guard);
        self.flush_deferred(deferred, ev);
        // A delivered resource the chain never consumed (aborted before its
        // step ran) goes back where it came from rather than leaking.
        if let Some(stale) = input.take() {
            self.return_stale(stale);
        }
    }

    /// Open a window for external calls: drop the guard with the deferred
    /// work flushed.  The caller reacquires when it is ready to continue.
    fn release_and_flush(&self, mut guard: MutexGuard<'_, InstanceState>) {
        let deferred = std::mem::take(&mut guard.deferred);
        let ev = guard.evtchn.clone();
        drop(guard);
        self.flush_deferred(deferred, ev);
    }

    fn advance(
        &self,
        st: &mut InstanceState,
        step: Step,
        input: &mut Option<Resume>,
    ) -> Control {
        match step {
            Step::Idle => Control::Done,
            Step::Drain => self.step_drain(st),
            Step::NeedReq => self.step_need_req(st, input),
            Step::Walk => self.step_walk(st),
            Step::NeedIo => self.step_need_io(st, input),
            Step::NeedFrag => self.step_need_frag(st, input),
            Step::MapIo(after) => self.step_map_io(st, after, input),
            Step::ProbeMap => self.step_probe(st, input),
        }
    }

    fn step_drain(&self, st: &mut InstanceState) -> Control {
        if st.lifecycle != Lifecycle::Connected {
            self.abort_chain(st);
            return Control::Done;
        }
        let ring = st.ring.as_ref().expect("connected instance has a ring");
        probes::ring_drain!(|| (self.domid.0, ring.pending()));
        match ring.peek() {
            Some(raw) => self.accept_request(st, raw),
            None => {
                if st.open_io.is_some() {
                    // Flush the aggregation before going idle; the re-drain
                    // afterwards doubles as the final producer re-check.
                    st.step = Step::MapIo(AfterFlush::Drain);
                    Control::Cont
                } else {
                    Control::Done
                }
            }
        }
    }

    /// Validate a decoded request and route it into the pipeline.
    /// Anything malformed is answered on the spot and never touches the
    /// pools.
    fn accept_request(
        &self,
        st: &mut InstanceState,
        raw: RingRequest,
    ) -> Control {
        st.stats.requests += 1;
        probes::req_decode!(|| (
            self.domid.0,
            raw.id,
            raw.op,
            raw.nr_segments,
        ));

        let verdict = match raw.op {
            OP_PROBE => {
                if raw.nr_segments == 1
                    && raw.segments[0].sectors().is_some()
                {
                    Verdict::Probe
                } else {
                    Verdict::Reject
                }
            }
            OP_READ | OP_WRITE => {
                let nsegs = raw.nr_segments as usize;
                if nsegs == 0 || nsegs > MAX_SEGMENTS_PER_REQ {
                    Verdict::Reject
                } else {
                    match st.vbds.get(&raw.vdev) {
                        None => Verdict::Reject,
                        Some(vbd)
                            if raw.op == OP_WRITE && vbd.read_only =>
                        {
                            Verdict::Reject
                        }
                        Some(vbd) if raw.sector >= vbd.sectors => {
                            Verdict::Reject
                        }
                        Some(vbd) => Verdict::Io {
                            storage: Arc::clone(&vbd.storage),
                            abs_sector: vbd.extent_start + raw.sector,
                            extent_end: vbd.extent_start + vbd.sectors,
                        },
                    }
                }
            }
            _ => Verdict::Reject,
        };

        st.ring.as_mut().expect("ring is mapped").consume();
        match verdict {
            Verdict::Reject => {
                probes::req_reject!(|| (self.domid.0, raw.id, raw.op));
                self.emit_reply(st, raw.id, raw.op, STATUS_ERROR);
                st.step = Step::Drain;
            }
            Verdict::Probe => {
                st.cur = Some(CurReq {
                    raw,
                    key: None,
                    seg_idx: 0,
                    next_sector: 0,
                    extent_end: 0,
                    storage: None,
                    linked: false,
                });
                st.step = Step::ProbeMap;
            }
            Verdict::Io { storage, abs_sector, extent_end } => {
                st.cur = Some(CurReq {
                    raw,
                    key: None,
                    seg_idx: 0,
                    next_sector: abs_sector,
                    extent_end,
                    storage: Some(storage),
                    linked: false,
                });
                st.step = Step::NeedReq;
            }
        }
        Control::Cont
    }

    fn step_need_req(
        &self,
        st: &mut InstanceState,
        input: &mut Option<Resume>,
    ) -> Control {
        let mut entry = match input.take() {
            Some(Resume::Req(obj)) => obj,
            Some(_) => panic!("resumed with wrong resource"),
            None => {
                match self.backend.pools.requests.acquire(&self.self_arc()) {
                    Some(obj) => obj,
                    None => {
                        probes::pool_wait!(|| (self.domid.0, 0u8));
                        st.step = Step::NeedReq;
                        return Control::Suspend(WaitSpot::ReqPool);
                    }
                }
            }
        };
        let cur = st.cur.as_mut().expect("request being decoded");
        entry.init(cur.raw.id, cur.raw.op, cur.raw.vdev);
        let key = st.next_key;
        st.next_key += 1;
        cur.key = Some(key);
        st.outstanding.insert(key, entry);
        st.step = Step::Walk;
        Control::Cont
    }

    /// One segment of the current request per pass: validate it, then
    /// either extend the open transfer, or detour to allocate whatever that
    /// extension is missing (transfer, fragment), or flush the transfer the
    /// segment refuses to share.
    fn step_walk(&self, st: &mut InstanceState) -> Control {
        let view = {
            let cur = st.cur.as_ref().expect("request being walked");
            if cur.seg_idx >= cur.raw.nr_segments as usize {
                // Request fully folded in.  The open transfer stays open:
                // the next request may continue it.
                st.cur = None;
                st.step = Step::Drain;
                return Control::Cont;
            }
            let seg = cur.raw.segments[cur.seg_idx];
            SegView::resolve(cur.raw.op, cur.raw.vdev, cur.next_sector, &seg)
                .filter(|v| v.sector + v.nsects <= cur.extent_end)
        };

        let Some(view) = view else {
            // Inverted in-page range or extent overrun: poison only the
            // transfer under accumulation and this request.
            return self.fail_segment(st);
        };

        let admit = match st.open_io.as_ref() {
            None => {
                st.step = Step::NeedIo;
                return Control::Cont;
            }
            Some(io) => io.admits(&view),
        };
        match admit {
            Admit::Refuse => {
                st.step = Step::MapIo(AfterFlush::Walk);
                Control::Cont
            }
            admit => {
                if !st.cur.as_ref().unwrap().linked {
                    st.step = Step::NeedFrag;
                    return Control::Cont;
                }
                st.open_io.as_mut().unwrap().extend(&view, admit);
                let cur = st.cur.as_mut().unwrap();
                cur.seg_idx += 1;
                cur.next_sector += view.nsects;
                st.step = Step::Walk;
                Control::Cont
            }
        }
    }

    fn step_need_io(
        &self,
        st: &mut InstanceState,
        input: &mut Option<Resume>,
    ) -> Control {
        let mut io = match input.take() {
            Some(Resume::Io(obj)) => obj,
            Some(_) => panic!("resumed with wrong resource"),
            None => match self.backend.pools.ios.acquire(&self.self_arc()) {
                Some(obj) => obj,
                None => {
                    probes::pool_wait!(|| (self.domid.0, 1u8));
                    st.step = Step::NeedIo;
                    return Control::Suspend(WaitSpot::IoPool);
                }
            },
        };
        let cur = st.cur.as_mut().expect("request being walked");
        io.open(
            cur.raw.op,
            cur.raw.vdev,
            Arc::clone(cur.storage.as_ref().expect("io request has storage")),
            cur.next_sector,
        );
        cur.linked = false;
        st.open_io = Some(io);
        st.step = Step::Walk;
        Control::Cont
    }

    fn step_need_frag(
        &self,
        st: &mut InstanceState,
        input: &mut Option<Resume>,
    ) -> Control {
        let mut frag = match input.take() {
            Some(Resume::Frag(obj)) => obj,
            Some(_) => panic!("resumed with wrong resource"),
            None => {
                match self.backend.pools.fragments.acquire(&self.self_arc())
                {
                    Some(obj) => obj,
                    None => {
                        probes::pool_wait!(|| (self.domid.0, 2u8));
                        st.step = Step::NeedFrag;
                        return Control::Suspend(WaitSpot::FragPool);
                    }
                }
            }
        };
        let cur = st.cur.as_mut().expect("request being walked");
        let key = cur.key.expect("request entry allocated before linking");
        cur.linked = true;
        frag.req = key;
        st.open_io
            .as_mut()
            .expect("open transfer to link into")
            .frags
            .push(frag);
        st.outstanding
            .get_mut(&key)
            .expect("linked request is outstanding")
            .pending += 1;
        st.step = Step::Walk;
        Control::Cont
    }

    fn step_map_io(
        &self,
        st: &mut InstanceState,
        after: AfterFlush,
        input: &mut Option<Resume>,
    ) -> Control {
        let outcome = match input.take() {
            Some(Resume::Mapped(Ok(mapping))) => Ok(Some(mapping)),
            Some(Resume::Mapped(Err(e))) => Err(e),
            Some(_) => panic!("resumed with wrong resource"),
            None => {
                let io = st.open_io.as_ref().expect("open transfer to map");
                let writable = io.dir() == Dir::Read;
                self.backend.mapper.map_or_wait(
                    &self.self_arc(),
                    self.domid,
                    &io.grefs,
                    writable,
                )
            }
        };
        match outcome {
            Ok(Some(mapping)) => {
                let mut io =
                    st.open_io.take().expect("open transfer to map");
                io.mapping = Some(mapping);
                let then = match after {
                    AfterFlush::Walk => Step::Walk,
                    AfterFlush::Drain => Step::Drain,
                };
                Control::Submit { io, then }
            }
            Ok(None) => {
                probes::map_retry_wait!(|| (
                    self.domid.0,
                    st.open_io.as_ref().map_or(0, |io| io.grefs.len() as u8),
                ));
                st.step = Step::MapIo(after);
                Control::Suspend(WaitSpot::MapRetry)
            }
            Err(e) => {
                warn!(self.log, "grant mapping failed, failing transfer";
                    "error" => %e);
                let cur_affected =
                    st.cur.as_ref().map_or(false, |cur| cur.linked);
                self.fail_open_io(st);
                match after {
                    AfterFlush::Walk if !cur_affected => {
                        st.step = Step::Walk;
                        Control::Cont
                    }
                    // The request had segments in the failed transfer (or
                    // there is no request mid-walk at all): its reply is
                    // now owed down the error path.
                    _ => self.fail_cur(st),
                }
            }
        }
    }

    fn step_probe(
        &self,
        st: &mut InstanceState,
        input: &mut Option<Resume>,
    ) -> Control {
        let seg = st.cur.as_ref().expect("probe in progress").raw.segments[0];
        let outcome = match input.take() {
            Some(Resume::Mapped(Ok(mapping))) => Ok(Some(mapping)),
            Some(Resume::Mapped(Err(e))) => Err(e),
            Some(_) => panic!("resumed with wrong resource"),
            None => self.backend.mapper.map_or_wait(
                &self.self_arc(),
                self.domid,
                &[seg.gref],
                true,
            ),
        };
        match outcome {
            Ok(Some(mapping)) => {
                let window_off =
                    (seg.first_sect as usize) << SECTOR_SHIFT;
                let window_len = (seg.sectors().expect("validated segment")
                    as usize)
                    << SECTOR_SHIFT;
                let cap = window_len / VBD_INFO_SIZE;
                let mut count = 0usize;
                for vbd in st.vbds.values().take(cap) {
                    let rec = vbd.info_record();
                    // Safety: the mapping covers a full page and the window
                    // stays within it.
                    unsafe {
                        let dst = mapping
                            .base()
                            .as_ptr()
                            .add(window_off + count * VBD_INFO_SIZE);
                        std::ptr::copy_nonoverlapping(
                            rec.as_bytes().as_ptr(),
                            dst,
                            VBD_INFO_SIZE,
                        );
                    }
                    count += 1;
                }
                Control::ProbeReply { mapping, count: count as u16 }
            }
            Ok(None) => {
                probes::map_retry_wait!(|| (self.domid.0, 1u8));
                st.step = Step::ProbeMap;
                Control::Suspend(WaitSpot::MapRetry)
            }
            Err(e) => {
                warn!(self.log, "probe page mapping failed"; "error" => %e);
                let raw = st.cur.take().expect("probe in progress").raw;
                self.emit_reply(st, raw.id, raw.op, STATUS_ERROR);
                st.step = Step::Drain;
                Control::Cont
            }
        }
    }

    /// A segment violated the protocol mid-walk: abort the transfer under
    /// accumulation and finish the current request down the error path.
    fn fail_segment(&self, st: &mut InstanceState) -> Control {
        self.fail_open_io(st);
        self.fail_cur(st)
    }

    /// Resolve every fragment of the open transfer as failed and recycle
    /// it.  Pool returns are deferred; the transfer was never submitted so
    /// it holds no mapping.
    pub(crate) fn fail_open_io(&self, st: &mut InstanceState) {
        let Some(mut io) = st.open_io.take() else { return };
        debug_assert!(io.mapping.is_none());
        for frag in io.frags.drain(..) {
            self.resolve_frag(st, frag.req, true);
            st.deferred.frags.push(frag);
        }
        io.reset();
        st.deferred.ios.push(io);
    }

    /// Stop walking the current request and make sure an error reply is
    /// owed for it: immediately if nothing of it is in flight, otherwise
    /// via its recorded error count when the last transfer completes.
    pub(crate) fn fail_cur(&self, st: &mut InstanceState) -> Control {
        if let Some(cur) = st.cur.take() {
            if let Some(key) = cur.key {
                if let Some(req) = st.outstanding.get_mut(&key) {
                    req.errors += 1;
                    if req.pending == 0 {
                        let req = st.outstanding.remove(&key).unwrap();
                        self.emit_reply_for(st, &req);
                        st.deferred.reqs.push(req);
                    }
                }
            }
        }
        st.step = Step::Drain;
        Control::Cont
    }

    /// Disconnect observed mid-chain: drop whatever is under accumulation
    /// and let in-flight transfers finish on their own.
    pub(crate) fn abort_chain(&self, st: &mut InstanceState) {
        self.fail_open_io(st);
        let _ = self.fail_cur(st);
        st.step = Step::Idle;
    }
}
