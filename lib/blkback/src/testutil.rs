// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test utilities: an in-memory grant table, a guest-side ring driver, a
//! hand-cranked backing store, and a counting event channel.
//!
//! [`FakeGrantTable`] models the page-sharing facility over plain heap
//! pages with a configurable mapping capacity, so transient exhaustion and
//! the retry path can be exercised deterministically.  [`GuestRing`] plays
//! the front-end: it posts requests into a granted ring page and reads the
//! replies back out.  [`ManualStorage`] queues submitted transfers until a
//! test chooses to complete them, making completion interleavings explicit.

use std::collections::{BTreeMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use zerocopy::{FromBytes, IntoBytes};

use blkif::{
    slot_offset, GrantRef, RingRequest, RingResponse, Segment, PAGE_SIZE,
    SECTOR_SHIFT, SLOT_SIZE,
};

use crate::mapper::{DomId, GrantMap, GrantMapping, MapError};
use crate::storage::{DeviceInfo, Dir, IoResult, IoTicket, Storage, Transfer};
use crate::tasks::NotifyFn;
use crate::EventChannel;

/// A page-aligned page, so ring and data mappings look like real ones.
#[repr(C, align(4096))]
pub struct PageBuf(pub [u8; PAGE_SIZE]);

impl PageBuf {
    fn zeroed() -> Box<Self> {
        Box::new(PageBuf([0; PAGE_SIZE]))
    }
}

struct ActiveMapping {
    grefs: Vec<GrantRef>,
    writable: bool,
    /// Copy-based backing for multi-page mappings; single-page mappings
    /// point straight at the granted page and need no copy-back.
    buf: Option<Box<[PageBuf]>>,
}

struct TableInner {
    pages: BTreeMap<u32, Box<PageBuf>>,
    active: BTreeMap<u64, ActiveMapping>,
    next_cookie: u64,
    capacity: usize,
    in_use: usize,
    maps: u64,
    unmaps: u64,
}

/// In-memory stand-in for the grant-mapping facility.
pub struct FakeGrantTable {
    inner: Mutex<TableInner>,
    notify: Mutex<Option<Arc<NotifyFn>>>,
}

impl FakeGrantTable {
    /// `capacity` bounds how many pages may be mapped at once; mapping
    /// beyond it reports transient exhaustion.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TableInner {
                pages: BTreeMap::new(),
                active: BTreeMap::new(),
                next_cookie: 1,
                capacity,
                in_use: 0,
                maps: 0,
                unmaps: 0,
            }),
            notify: Mutex::new(None),
        })
    }

    /// Install a zeroed granted page under `gref`.
    pub fn grant(&self, gref: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.pages.insert(gref, PageBuf::zeroed());
    }

    /// Run `f` against the granted page's bytes (the guest's view).
    pub fn with_page<R>(&self, gref: u32, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let page = inner.pages.get_mut(&gref).expect("gref is granted");
        f(&mut page.0)
    }

    pub fn write_page(&self, gref: u32, offset: usize, bytes: &[u8]) {
        self.with_page(gref, |page| {
            page[offset..offset + bytes.len()].copy_from_slice(bytes);
        });
    }

    pub fn read_page(&self, gref: u32) -> Vec<u8> {
        self.with_page(gref, |page| page.to_vec())
    }

    /// Pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().unwrap().in_use
    }

    pub fn map_count(&self) -> u64 {
        self.inner.lock().unwrap().maps
    }

    pub fn unmap_count(&self) -> u64 {
        self.inner.lock().unwrap().unmaps
    }

    /// Grow (or shrink) the capacity and fire the space-notify hook, as a
    /// real facility would when address space frees up.
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.lock().unwrap().capacity = capacity;
        self.fire_notify();
    }

    fn fire_notify(&self) {
        let hook = self.notify.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl GrantMap for FakeGrantTable {
    fn map(
        &self,
        _domid: DomId,
        grefs: &[GrantRef],
        writable: bool,
    ) -> Result<GrantMapping, MapError> {
        assert!(!grefs.is_empty());
        let mut inner = self.inner.lock().unwrap();
        for gref in grefs {
            if !inner.pages.contains_key(&gref.0) {
                return Err(MapError::Rejected(-1));
            }
        }
        if inner.in_use + grefs.len() > inner.capacity {
            return Err(MapError::Exhausted);
        }
        inner.in_use += grefs.len();
        inner.maps += 1;
        let cookie = inner.next_cookie;
        inner.next_cookie += 1;

        let (base, buf) = if grefs.len() == 1 {
            // Single page: point straight at the granted page so guest
            // stores (ring updates!) stay visible while mapped.
            let page = inner.pages.get_mut(&grefs[0].0).unwrap();
            (NonNull::new(page.0.as_mut_ptr()).unwrap(), None)
        } else {
            let mut buf: Box<[PageBuf]> = (0..grefs.len())
                .map(|_| PageBuf([0; PAGE_SIZE]))
                .collect();
            for (i, gref) in grefs.iter().enumerate() {
                let page = inner.pages.get(&gref.0).unwrap();
                buf[i].0.copy_from_slice(&page.0);
            }
            let base = NonNull::new(buf[0].0.as_mut_ptr()).unwrap();
            (base, Some(buf))
        };
        inner.active.insert(
            cookie,
            ActiveMapping { grefs: grefs.to_vec(), writable, buf },
        );
        Ok(GrantMapping::new(base, grefs.len() * PAGE_SIZE, cookie))
    }

    fn unmap(&self, mapping: GrantMapping) {
        {
            let mut inner = self.inner.lock().unwrap();
            let active = inner
                .active
                .remove(&mapping.cookie())
                .expect("unmap of live mapping");
            if let Some(buf) = &active.buf {
                if active.writable {
                    for (i, gref) in active.grefs.iter().enumerate() {
                        let page =
                            inner.pages.get_mut(&gref.0).unwrap();
                        page.0.copy_from_slice(&buf[i].0);
                    }
                }
            }
            inner.in_use -= active.grefs.len();
            inner.unmaps += 1;
        }
        // Space came free; poke the retry hook outside our lock.
        self.fire_notify();
    }

    fn register_space_notify(&self, notify: Box<NotifyFn>) {
        let mut slot = self.notify.lock().unwrap();
        assert!(slot.is_none(), "space notify registered once");
        *slot = Some(Arc::from(notify));
    }
}

/// Guest-side view of a ring granted through a [`FakeGrantTable`].
pub struct GuestRing {
    table: Arc<FakeGrantTable>,
    gref: u32,
    state: Mutex<GuestRingState>,
}

struct GuestRingState {
    req_prod: u32,
    rsp_cons: u32,
}

impl GuestRing {
    /// Grant `gref` and lay a fresh ring out in it.
    pub fn create(table: &Arc<FakeGrantTable>, gref: u32) -> Self {
        table.grant(gref);
        Self {
            table: Arc::clone(table),
            gref,
            state: Mutex::new(GuestRingState { req_prod: 0, rsp_cons: 0 }),
        }
    }

    pub fn gref(&self) -> GrantRef {
        GrantRef(self.gref)
    }

    /// Post one request and publish the new producer index.
    pub fn push_request(&self, req: RingRequest) {
        let mut st = self.state.lock().unwrap();
        let idx = st.req_prod;
        self.table.with_page(self.gref, |page| {
            let off = slot_offset(idx);
            page[off..off + SLOT_SIZE].copy_from_slice(req.as_bytes());
            st.req_prod = idx.wrapping_add(1);
            page[0..4].copy_from_slice(&st.req_prod.to_ne_bytes());
        });
    }

    /// Backend-published response producer index.
    pub fn rsp_prod(&self) -> u32 {
        self.table.with_page(self.gref, |page| {
            u32::from_ne_bytes(page[8..12].try_into().unwrap())
        })
    }

    /// Drain any responses published since the last call.
    pub fn take_responses(&self) -> Vec<RingResponse> {
        let mut st = self.state.lock().unwrap();
        let prod = self.rsp_prod_inner();
        let mut out = Vec::new();
        while st.rsp_cons != prod {
            let idx = st.rsp_cons;
            let rsp = self.table.with_page(self.gref, |page| {
                let off = slot_offset(idx);
                RingResponse::read_from_bytes(
                    &page[off..off + core::mem::size_of::<RingResponse>()],
                )
                .unwrap()
            });
            out.push(rsp);
            st.rsp_cons = st.rsp_cons.wrapping_add(1);
        }
        out
    }

    fn rsp_prod_inner(&self) -> u32 {
        self.table.with_page(self.gref, |page| {
            u32::from_ne_bytes(page[8..12].try_into().unwrap())
        })
    }
}

/// Build a request slot from `(gref, first_sect, last_sect)` triples.
pub fn make_request(
    op: u8,
    id: u64,
    vdev: u16,
    sector: u64,
    segs: &[(u32, u8, u8)],
) -> RingRequest {
    let mut req = RingRequest {
        op,
        nr_segments: segs.len() as u8,
        vdev,
        id,
        sector,
        ..Default::default()
    };
    for (i, (gref, first, last)) in segs.iter().enumerate() {
        req.segments[i] = Segment {
            gref: GrantRef(*gref),
            first_sect: *first,
            last_sect: *last,
            _pad: 0,
        };
    }
    req
}

/// Backing store that parks every submission until the test completes it.
pub struct ManualStorage {
    info: DeviceInfo,
    data: Mutex<Vec<u8>>,
    pending: Mutex<VecDeque<(Transfer, IoTicket)>>,
}

impl ManualStorage {
    pub fn create(size: usize, read_only: bool) -> Arc<Self> {
        assert_eq!(size % blkif::SECTOR_SIZE, 0);
        Arc::new(Self {
            info: DeviceInfo {
                sectors: (size >> SECTOR_SHIFT) as u64,
                read_only,
            },
            data: Mutex::new(vec![0; size]),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Perform and complete the eldest parked transfer.
    pub fn complete_next(&self, res: IoResult) {
        let work =
            self.pending.lock().unwrap().pop_front().expect("parked transfer");
        self.finish(work, res);
    }

    /// Perform and complete the youngest parked transfer, for exercising
    /// out-of-order completion.
    pub fn complete_last(&self, res: IoResult) {
        let work =
            self.pending.lock().unwrap().pop_back().expect("parked transfer");
        self.finish(work, res);
    }

    fn finish(&self, work: (Transfer, IoTicket), res: IoResult) {
        let (mut xfer, ticket) = work;
        if res == IoResult::Success {
            let off = (xfer.sector() << SECTOR_SHIFT) as usize;
            let mut data = self.data.lock().unwrap();
            let end = off + xfer.len();
            assert!(end <= data.len(), "transfer beyond device");
            match xfer.dir() {
                // Safety: the buffer is live until the ticket below fires.
                Dir::Read => unsafe {
                    xfer.buf_mut().copy_from_slice(&data[off..end]);
                },
                Dir::Write => unsafe {
                    data[off..end].copy_from_slice(xfer.buf());
                },
            }
        }
        ticket.complete(res);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn fill(&self, bytes: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data[..bytes.len()].copy_from_slice(bytes);
    }
}

impl Storage for ManualStorage {
    fn info(&self) -> DeviceInfo {
        self.info
    }

    fn submit(&self, xfer: Transfer, ticket: IoTicket) {
        self.pending.lock().unwrap().push_back((xfer, ticket));
    }

    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&self) {}
}

/// Event channel that just counts signals.
#[derive(Default)]
pub struct CountingChan {
    hits: AtomicUsize,
}

impl CountingChan {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl EventChannel for CountingChan {
    fn signal(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Quiet logger for tests; swap in a `slog-term` drain when debugging.
pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_unmap_restores_capacity() {
        let table = FakeGrantTable::new(4);
        for gref in 0..6u32 {
            table.grant(gref);
        }

        // Map to exhaustion...
        let m1 = table
            .map(DomId(1), &[GrantRef(0), GrantRef(1)], true)
            .unwrap();
        let m2 = table
            .map(DomId(1), &[GrantRef(2), GrantRef(3)], true)
            .unwrap();
        assert!(matches!(
            table.map(DomId(1), &[GrantRef(4)], true),
            Err(MapError::Exhausted)
        ));

        // ...release, and the same footprint fits again.
        table.unmap(m1);
        table.unmap(m2);
        assert_eq!(table.mapped_pages(), 0);
        let m3 = table
            .map(
                DomId(1),
                &[GrantRef(0), GrantRef(1), GrantRef(2), GrantRef(3)],
                true,
            )
            .unwrap();
        table.unmap(m3);
        assert_eq!(table.mapped_pages(), 0);
    }

    #[test]
    fn multi_page_mapping_copies_back_on_unmap() {
        let table = FakeGrantTable::new(4);
        table.grant(10);
        table.grant(11);

        let mapping = table
            .map(DomId(1), &[GrantRef(10), GrantRef(11)], true)
            .unwrap();
        unsafe {
            let buf = std::slice::from_raw_parts_mut(
                mapping.base().as_ptr(),
                mapping.len(),
            );
            buf[0] = 0xaa;
            buf[PAGE_SIZE] = 0xbb;
        }
        // Guest view updates only once the mapping is released.
        table.unmap(mapping);
        assert_eq!(table.read_page(10)[0], 0xaa);
        assert_eq!(table.read_page(11)[0], 0xbb);
    }

    #[test]
    fn unknown_gref_is_a_hard_failure() {
        let table = FakeGrantTable::new(4);
        table.grant(1);
        assert!(matches!(
            table.map(DomId(1), &[GrantRef(1), GrantRef(99)], false),
            Err(MapError::Rejected(_))
        ));
        // Nothing was charged against capacity.
        assert_eq!(table.mapped_pages(), 0);
    }
}
