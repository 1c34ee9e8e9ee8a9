// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end exercises of the request pipeline against the fake grant
//! table, a guest-side ring driver, and a hand-cranked backing store.

use std::sync::Arc;

use slog::Drain;

use blkback::testutil::{
    make_request, CountingChan, FakeGrantTable, GuestRing, ManualStorage,
};
use blkback::{
    Backend, DomId, EventChannel, Instance, IoResult, Lifecycle, MemStorage,
    PoolSizes, Storage,
};
use blkif::{
    GrantRef, VbdFlags, VbdInfo, OP_PROBE, OP_READ, OP_WRITE, PAGE_SIZE,
    SECTOR_SIZE, STATUS_ERROR, STATUS_OK,
};
use zerocopy::FromBytes;

const RING_GREF: u32 = 1000;
const DEV_SIZE: usize = 1 << 20;

fn logger() -> slog::Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::sink());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

struct Harness {
    table: Arc<FakeGrantTable>,
    backend: Arc<Backend>,
    inst: Arc<Instance>,
    ring: GuestRing,
    chan: Arc<CountingChan>,
    store: Arc<ManualStorage>,
}

fn harness_with(map_capacity: usize, sizes: PoolSizes) -> Harness {
    let table = FakeGrantTable::new(map_capacity);
    let backend = Backend::new(table.clone(), sizes, logger());
    let inst = backend.create_instance(DomId(1), 0);
    let ring = GuestRing::create(&table, RING_GREF);
    let chan = CountingChan::new();
    inst.connect(ring.gref(), chan.clone()).unwrap();
    let store = ManualStorage::create(DEV_SIZE, false);
    inst.vbd_attach(1, store.clone(), 0, None, false).unwrap();
    Harness { table, backend, inst, ring, chan, store }
}

fn harness() -> Harness {
    harness_with(64, PoolSizes::default())
}

/// Grant `gref` and fill its page with `fill`.
fn granted_page(table: &Arc<FakeGrantTable>, gref: u32, fill: u8) {
    table.grant(gref);
    table.write_page(gref, 0, &[fill; PAGE_SIZE]);
}

#[test]
fn three_segment_write_aggregates_into_one_transfer() {
    let h = harness();
    for gref in 1..=3 {
        granted_page(&h.table, gref, gref as u8);
    }

    // Two full pages plus the first half of a third.
    h.ring.push_request(make_request(
        OP_WRITE,
        42,
        1,
        0,
        &[(1, 0, 7), (2, 0, 7), (3, 0, 3)],
    ));
    h.inst.notify();

    // One transfer, three pages mapped on top of the ring page.
    assert_eq!(h.store.pending_count(), 1);
    assert_eq!(h.table.mapped_pages(), 1 + 3);

    h.store.complete_next(IoResult::Success);
    let rsps = h.ring.take_responses();
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].id, 42);
    assert_eq!(rsps[0].op, OP_WRITE);
    assert_eq!(rsps[0].status, STATUS_OK);
    assert!(h.chan.count() >= 1);

    let contents = h.store.contents();
    assert!(contents[..PAGE_SIZE].iter().all(|b| *b == 1));
    assert!(contents[PAGE_SIZE..2 * PAGE_SIZE].iter().all(|b| *b == 2));
    assert!(contents[2 * PAGE_SIZE..2 * PAGE_SIZE + 4 * SECTOR_SIZE]
        .iter()
        .all(|b| *b == 3));

    // The data mapping was released; only the ring remains.
    assert_eq!(h.table.mapped_pages(), 1);
}

#[test]
fn read_fills_guest_page() {
    let h = harness();
    granted_page(&h.table, 5, 0);
    let mut payload = vec![0u8; 4 * SECTOR_SIZE];
    for (i, b) in payload.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    h.store.fill(&payload);

    h.ring.push_request(make_request(OP_READ, 9, 1, 0, &[(5, 0, 3)]));
    h.inst.notify();
    h.store.complete_next(IoResult::Success);

    let rsps = h.ring.take_responses();
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].status, STATUS_OK);
    assert_eq!(&h.table.read_page(5)[..payload.len()], &payload[..]);
}

#[test]
fn cross_request_aggregation_merges_contiguous_requests() {
    let h = harness();
    granted_page(&h.table, 1, 0xaa);
    granted_page(&h.table, 2, 0xbb);

    // Both posted before the interrupt: one transfer, two replies.
    h.ring.push_request(make_request(OP_WRITE, 1, 1, 0, &[(1, 0, 7)]));
    h.ring.push_request(make_request(OP_WRITE, 2, 1, 8, &[(2, 0, 7)]));
    h.inst.notify();

    assert_eq!(h.store.pending_count(), 1);
    h.store.complete_next(IoResult::Success);

    let mut ids: Vec<u64> =
        h.ring.take_responses().iter().map(|r| r.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);
    let contents = h.store.contents();
    assert!(contents[..PAGE_SIZE].iter().all(|b| *b == 0xaa));
    assert!(contents[PAGE_SIZE..2 * PAGE_SIZE].iter().all(|b| *b == 0xbb));
}

#[test]
fn replies_follow_completion_order() {
    let h = harness();
    granted_page(&h.table, 1, 1);
    granted_page(&h.table, 2, 2);

    // Discontiguous sectors force two separate transfers.
    h.ring.push_request(make_request(OP_WRITE, 1, 1, 0, &[(1, 0, 7)]));
    h.ring.push_request(make_request(OP_WRITE, 2, 1, 100, &[(2, 0, 7)]));
    h.inst.notify();
    assert_eq!(h.store.pending_count(), 2);

    // Finish them in reverse submission order.
    h.store.complete_last(IoResult::Success);
    assert_eq!(h.ring.take_responses()[0].id, 2);
    h.store.complete_next(IoResult::Success);
    assert_eq!(h.ring.take_responses()[0].id, 1);
}

#[test]
fn write_to_read_only_vbd_rejected_without_side_effects() {
    let h = harness();
    let ro_store = ManualStorage::create(DEV_SIZE, false);
    h.inst.vbd_attach(2, ro_store.clone(), 0, None, true).unwrap();
    granted_page(&h.table, 1, 7);

    let free_reqs = h.backend.pools().requests.free_count();
    h.ring.push_request(make_request(OP_WRITE, 5, 2, 0, &[(1, 0, 7)]));
    h.inst.notify();

    let rsps = h.ring.take_responses();
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].id, 5);
    assert_eq!(rsps[0].status, STATUS_ERROR);
    // No allocation, no submission, no extra mapping.
    assert_eq!(h.backend.pools().requests.free_count(), free_reqs);
    assert_eq!(ro_store.pending_count(), 0);
    assert_eq!(h.table.mapped_pages(), 1);

    // The same device still serves reads.
    h.ring.push_request(make_request(OP_READ, 6, 2, 0, &[(1, 0, 7)]));
    h.inst.notify();
    assert_eq!(ro_store.pending_count(), 1);
    ro_store.complete_next(IoResult::Success);
    assert_eq!(h.ring.take_responses()[0].status, STATUS_OK);
}

#[test]
fn malformed_requests_rejected_before_any_allocation() {
    let h = harness();
    granted_page(&h.table, 1, 0);
    let free_reqs = h.backend.pools().requests.free_count();
    let free_ios = h.backend.pools().ios.free_count();

    // Segment count zero.
    h.ring.push_request(make_request(OP_WRITE, 1, 1, 0, &[]));
    // Unknown device.
    h.ring.push_request(make_request(OP_WRITE, 2, 9, 0, &[(1, 0, 7)]));
    // Unknown opcode.
    let mut bogus = make_request(7, 3, 1, 0, &[(1, 0, 7)]);
    bogus.op = 7;
    h.ring.push_request(bogus);
    // Start sector beyond the device.
    h.ring.push_request(make_request(
        OP_WRITE,
        4,
        1,
        (DEV_SIZE / SECTOR_SIZE) as u64 + 1,
        &[(1, 0, 7)],
    ));
    h.inst.notify();

    let rsps = h.ring.take_responses();
    assert_eq!(rsps.len(), 4);
    assert!(rsps.iter().all(|r| r.status == STATUS_ERROR));
    assert_eq!(h.backend.pools().requests.free_count(), free_reqs);
    assert_eq!(h.backend.pools().ios.free_count(), free_ios);
    assert_eq!(h.store.pending_count(), 0);
}

#[test]
fn inverted_segment_fails_only_its_transfer() {
    let h = harness();
    for gref in 1..=4 {
        granted_page(&h.table, gref, gref as u8);
    }

    // seg0+seg1 aggregate and get submitted when seg2 refuses to merge
    // (seg1 stops short of its page end); seg2 opens a second transfer and
    // seg3 then poisons it with an inverted range.
    h.ring.push_request(make_request(
        OP_WRITE,
        13,
        1,
        0,
        &[(1, 0, 7), (2, 0, 6), (3, 0, 7), (4, 5, 1)],
    ));
    h.inst.notify();

    // Only the first transfer made it to the store.
    assert_eq!(h.store.pending_count(), 1);
    // No reply yet: the surviving transfer is still in flight.
    assert!(h.ring.take_responses().is_empty());

    h.store.complete_next(IoResult::Success);
    let rsps = h.ring.take_responses();
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].id, 13);
    assert_eq!(rsps[0].status, STATUS_ERROR);

    // The first transfer's data still landed.
    let contents = h.store.contents();
    assert!(contents[..PAGE_SIZE].iter().all(|b| *b == 1));
    assert!(contents[PAGE_SIZE..PAGE_SIZE + 7 * SECTOR_SIZE]
        .iter()
        .all(|b| *b == 2));
    // Nothing leaked.
    assert_eq!(h.table.mapped_pages(), 1);
    assert_eq!(
        h.backend.pools().ios.free_count(),
        PoolSizes::default().ios
    );
    assert_eq!(
        h.backend.pools().fragments.free_count(),
        PoolSizes::default().fragments
    );
}

#[test]
fn probe_reports_attached_vbds() {
    let h = harness();
    let ro_store = ManualStorage::create(DEV_SIZE, false);
    h.inst.vbd_attach(2, ro_store, 0, None, true).unwrap();
    h.table.grant(50);

    h.ring.push_request(make_request(OP_PROBE, 77, 0, 0, &[(50, 0, 7)]));
    h.inst.notify();

    let rsps = h.ring.take_responses();
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].id, 77);
    assert_eq!(rsps[0].op, OP_PROBE);
    assert_eq!(rsps[0].status, 2);

    let page = h.table.read_page(50);
    let rec_size = core::mem::size_of::<VbdInfo>();
    let first = VbdInfo::read_from_bytes(&page[..rec_size]).unwrap();
    let second =
        VbdInfo::read_from_bytes(&page[rec_size..2 * rec_size]).unwrap();
    assert_eq!(first.vdev, 1);
    assert_eq!(first.sectors, (DEV_SIZE / SECTOR_SIZE) as u64);
    assert!(!VbdFlags::from_bits_truncate(first.flags)
        .contains(VbdFlags::READ_ONLY));
    assert_eq!(second.vdev, 2);
    assert!(VbdFlags::from_bits_truncate(second.flags)
        .contains(VbdFlags::READ_ONLY));
}

#[test]
fn request_pool_backpressure_resumes_fifo() {
    let sizes = PoolSizes { requests: 1, ..PoolSizes::default() };
    let h = harness_with(64, sizes);
    granted_page(&h.table, 1, 1);

    // Second instance contending for the single request entry.
    let inst_b = h.backend.create_instance(DomId(2), 0);
    let ring_b = GuestRing::create(&h.table, RING_GREF + 1);
    let chan_b = CountingChan::new();
    inst_b.connect(ring_b.gref(), chan_b).unwrap();
    let store_b = ManualStorage::create(DEV_SIZE, false);
    inst_b.vbd_attach(1, store_b.clone(), 0, None, false).unwrap();
    granted_page(&h.table, 2, 2);

    h.ring.push_request(make_request(OP_WRITE, 1, 1, 0, &[(1, 0, 7)]));
    h.inst.notify();
    assert_eq!(h.store.pending_count(), 1);

    ring_b.push_request(make_request(OP_WRITE, 2, 1, 0, &[(2, 0, 7)]));
    inst_b.notify();
    // Exactly one instance parked, nothing submitted for it.
    assert_eq!(h.backend.pools().requests.waiter_count(), 1);
    assert_eq!(inst_b.stats().suspensions, 1);
    assert_eq!(store_b.pending_count(), 0);

    // Releasing the entry resumes the waiter, which then submits.
    h.store.complete_next(IoResult::Success);
    assert_eq!(h.ring.take_responses()[0].id, 1);
    assert_eq!(h.backend.pools().requests.waiter_count(), 0);
    assert_eq!(store_b.pending_count(), 1);
    store_b.complete_next(IoResult::Success);
    assert_eq!(ring_b.take_responses()[0].id, 2);
}

#[test]
fn transient_map_exhaustion_delays_but_delivers() {
    // Room for the ring page plus one more; the two-page transfer must
    // wait.
    let h = harness_with(2, PoolSizes::default());
    granted_page(&h.table, 1, 3);
    granted_page(&h.table, 2, 4);

    h.ring.push_request(make_request(
        OP_WRITE,
        21,
        1,
        0,
        &[(1, 0, 7), (2, 0, 7)],
    ));
    h.inst.notify();

    // Parked on the retry queue; nothing submitted, no reply.
    assert_eq!(h.store.pending_count(), 0);
    assert_eq!(h.backend.mapper().retry_queue_len(), 1);
    assert_eq!(h.inst.stats().suspensions, 1);
    assert!(h.ring.take_responses().is_empty());

    // Space opens up; the retry hook fires and the transfer proceeds.
    h.table.set_capacity(3);
    assert_eq!(h.backend.mapper().retry_queue_len(), 0);
    assert_eq!(h.store.pending_count(), 1);
    h.store.complete_next(IoResult::Success);

    // Exactly one reply, same guarantees as the unexhausted path.
    let rsps = h.ring.take_responses();
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].id, 21);
    assert_eq!(rsps[0].status, STATUS_OK);
    assert_eq!(h.ring.take_responses().len(), 0);
}

#[test]
fn host_io_failure_reflected_only_in_owning_reply() {
    let h = harness();
    granted_page(&h.table, 1, 1);
    granted_page(&h.table, 2, 2);

    h.ring.push_request(make_request(OP_WRITE, 1, 1, 0, &[(1, 0, 7)]));
    h.ring.push_request(make_request(OP_WRITE, 2, 1, 100, &[(2, 0, 7)]));
    h.inst.notify();
    assert_eq!(h.store.pending_count(), 2);

    h.store.complete_next(IoResult::Failure);
    h.store.complete_next(IoResult::Success);
    let rsps = h.ring.take_responses();
    assert_eq!(rsps.len(), 2);
    assert_eq!(rsps[0].id, 1);
    assert_eq!(rsps[0].status, STATUS_ERROR);
    assert_eq!(rsps[1].id, 2);
    assert_eq!(rsps[1].status, STATUS_OK);
}

#[test]
fn disconnect_drains_inflight_before_teardown() {
    let h = harness();
    granted_page(&h.table, 1, 9);

    h.ring.push_request(make_request(OP_WRITE, 3, 1, 0, &[(1, 0, 7)]));
    h.inst.notify();
    assert_eq!(h.store.pending_count(), 1);

    h.inst.disconnect().unwrap();
    // Teardown waits on the in-flight transfer; the ring stays mapped.
    assert_eq!(h.inst.lifecycle(), Lifecycle::Disconnecting);
    assert!(h.table.mapped_pages() >= 1);

    h.store.complete_next(IoResult::Success);
    // The drained request was still answered, then everything unmapped.
    assert_eq!(h.ring.take_responses().len(), 1);
    assert_eq!(h.inst.lifecycle(), Lifecycle::Disconnected);
    assert_eq!(h.table.mapped_pages(), 0);
    h.inst.destroy().unwrap();
}

#[test]
fn interrupt_during_drain_is_not_lost() {
    let h = harness();
    granted_page(&h.table, 1, 1);
    granted_page(&h.table, 2, 2);

    h.ring.push_request(make_request(OP_WRITE, 1, 1, 0, &[(1, 0, 7)]));
    h.inst.notify();
    // Posted after the first drain went idle; a fresh interrupt picks it
    // up from the cached cursor.
    h.ring.push_request(make_request(OP_WRITE, 2, 1, 100, &[(2, 0, 7)]));
    h.inst.notify();
    assert_eq!(h.store.pending_count(), 2);
    h.store.complete_next(IoResult::Success);
    h.store.complete_next(IoResult::Success);
    assert_eq!(h.ring.take_responses().len(), 2);
    assert_eq!(h.inst.stats().requests, 2);
    assert_eq!(h.inst.stats().replies, 2);
}

#[test]
fn threaded_mem_storage_completes_asynchronously() {
    struct ChanSignal(crossbeam_channel::Sender<()>);
    impl EventChannel for ChanSignal {
        fn signal(&self) {
            let _ = self.0.send(());
        }
    }

    let table = FakeGrantTable::new(64);
    let backend = Backend::new(table.clone(), PoolSizes::default(), logger());
    let inst = backend.create_instance(DomId(5), 0);
    let ring = GuestRing::create(&table, RING_GREF);
    let (tx, rx) = crossbeam_channel::bounded(16);
    inst.connect(ring.gref(), Arc::new(ChanSignal(tx))).unwrap();

    let store = MemStorage::create(DEV_SIZE, false).unwrap();
    store.start().unwrap();
    inst.vbd_attach(1, store.clone(), 0, None, false).unwrap();
    granted_page(&table, 1, 0x77);

    ring.push_request(make_request(OP_WRITE, 4, 1, 0, &[(1, 0, 7)]));
    inst.notify();

    // The completion arrives from the backing store's worker thread.
    rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap();
    let rsps = ring.take_responses();
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].id, 4);
    assert_eq!(rsps[0].status, STATUS_OK);
    assert_eq!(&store.contents()[..PAGE_SIZE], &[0x77u8; PAGE_SIZE][..]);
    store.stop();
}

#[test]
fn vbd_extent_offsets_into_backing_store() {
    let h = harness();
    h.inst.vbd_attach(3, h.store.clone(), 100, None, false).unwrap();
    granted_page(&h.table, 1, 0x5a);

    h.ring.push_request(make_request(OP_WRITE, 8, 3, 0, &[(1, 0, 7)]));
    h.inst.notify();
    h.store.complete_next(IoResult::Success);

    assert_eq!(h.ring.take_responses()[0].status, STATUS_OK);
    let contents = h.store.contents();
    let off = 100 * SECTOR_SIZE;
    assert!(contents[off..off + PAGE_SIZE].iter().all(|b| *b == 0x5a));
}

#[test]
fn connect_is_single_shot() {
    let h = harness();
    let chan = CountingChan::new();
    assert!(h.inst.connect(GrantRef(RING_GREF), chan).is_err());
}
