// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backend view of the shared request/response ring.
//!
//! The guest owns `req_prod`, the backend owns `rsp_prod`; each side keeps
//! its consumer position private.  An acquire fence separates reading
//! `req_prod` from reading the request bodies it covers, and a release fence
//! separates writing a response body from publishing `rsp_prod`, matching
//! the front-end's ordering assumptions.
//!
//! Decoding is side-effect-free: [`Ring::peek`] may be repeated at will and
//! only [`Ring::consume`] commits the private consumer cursor.  At most one
//! response exists per consumed request slot, so the response ring can never
//! overrun.

use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use zerocopy::{FromBytes, IntoBytes};

use blkif::{
    slot_offset, RingRequest, RingResponse, PAGE_SIZE, RING_SIZE, SLOT_SIZE,
};

use crate::mapper::GrantMapping;

// Offsets of the shared counters within the ring header.
const OFF_REQ_PROD: usize = 0;
const OFF_RSP_PROD: usize = 8;

pub struct Ring {
    mapping: GrantMapping,
    req_cons: Wrapping<u32>,
    rsp_prod_pvt: Wrapping<u32>,
}

// The ring page is only ever touched through one instance's state lock.
unsafe impl Send for Ring {}

impl Ring {
    /// Wrap a mapped ring page.  The mapping facility hands out page-sized,
    /// page-aligned ranges; anything else is a facility bug.
    pub fn new(mapping: GrantMapping) -> Self {
        assert!(mapping.len() >= PAGE_SIZE);
        assert_eq!(mapping.base().as_ptr() as usize & (PAGE_SIZE - 1), 0);
        Self { mapping, req_cons: Wrapping(0), rsp_prod_pvt: Wrapping(0) }
    }

    fn counter_ptr(&self, off: usize) -> *mut u32 {
        // Alignment holds: the page is 4k-aligned and `off` is a multiple
        // of 4.
        unsafe { self.mapping.base().as_ptr().add(off) as *mut u32 }
    }

    /// Guest-published producer index, ordered before any request-body read.
    pub fn req_prod(&self) -> Wrapping<u32> {
        let prod =
            unsafe { self.counter_ptr(OFF_REQ_PROD).read_volatile() };
        fence(Ordering::Acquire);
        Wrapping(prod)
    }

    /// Requests published but not yet consumed.  A count beyond the ring
    /// size means the producer index is garbage.
    pub fn pending(&self) -> u32 {
        (self.req_prod() - self.req_cons).0
    }

    /// Decode the request at the consumer cursor, if one is published.
    /// Repeatable; does not advance the cursor.
    pub fn peek(&self) -> Option<RingRequest> {
        let pending = self.pending();
        if pending == 0 || pending > RING_SIZE {
            return None;
        }
        let mut raw = [0u8; SLOT_SIZE];
        unsafe {
            let src = self
                .mapping
                .base()
                .as_ptr()
                .add(slot_offset(self.req_cons.0));
            std::ptr::copy_nonoverlapping(src, raw.as_mut_ptr(), SLOT_SIZE);
        }
        Some(
            RingRequest::read_from_bytes(&raw[..])
                .expect("slot buffer sized for a request"),
        )
    }

    /// Commit the cursor past the request last peeked.
    pub fn consume(&mut self) {
        self.req_cons += Wrapping(1);
    }

    /// Write one response and publish it to the guest.
    pub fn push_response(&mut self, rsp: &RingResponse) {
        let bytes = rsp.as_bytes();
        unsafe {
            let dst = self
                .mapping
                .base()
                .as_ptr()
                .add(slot_offset(self.rsp_prod_pvt.0));
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                dst,
                bytes.len(),
            );
        }
        self.rsp_prod_pvt += Wrapping(1);
        fence(Ordering::Release);
        unsafe {
            self.counter_ptr(OFF_RSP_PROD)
                .write_volatile(self.rsp_prod_pvt.0);
        }
    }

    pub fn req_cons(&self) -> Wrapping<u32> {
        self.req_cons
    }

    pub fn rsp_prod(&self) -> Wrapping<u32> {
        self.rsp_prod_pvt
    }

    /// Surrender the underlying mapping for unmap at teardown.
    pub fn into_mapping(self) -> GrantMapping {
        self.mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    #[repr(C, align(4096))]
    struct TestPage([u8; PAGE_SIZE]);

    fn test_ring(page: &mut Box<TestPage>) -> Ring {
        let base = NonNull::new(page.0.as_mut_ptr()).unwrap();
        Ring::new(GrantMapping::new(base, PAGE_SIZE, 0))
    }

    fn guest_post(page: &mut TestPage, idx: u32, req: &RingRequest) {
        let off = slot_offset(idx);
        page.0[off..off + SLOT_SIZE].copy_from_slice(req.as_bytes());
        page.0[OFF_REQ_PROD..OFF_REQ_PROD + 4]
            .copy_from_slice(&(idx + 1).to_ne_bytes());
    }

    #[test]
    fn empty_ring_has_nothing_to_peek() {
        let mut page = Box::new(TestPage([0; PAGE_SIZE]));
        let ring = test_ring(&mut page);
        assert_eq!(ring.pending(), 0);
        assert!(ring.peek().is_none());
    }

    #[test]
    fn peek_is_repeatable_and_consume_commits() {
        let mut page = Box::new(TestPage([0; PAGE_SIZE]));
        let mut ring = test_ring(&mut page);

        let mut req = RingRequest::default();
        req.op = blkif::OP_READ;
        req.id = 77;
        req.nr_segments = 1;
        guest_post(&mut page, 0, &req);

        assert_eq!(ring.pending(), 1);
        assert_eq!(ring.peek().unwrap().id, 77);
        // Decoding had no side effect.
        assert_eq!(ring.peek().unwrap().id, 77);
        ring.consume();
        assert_eq!(ring.pending(), 0);
        assert!(ring.peek().is_none());
    }

    #[test]
    fn responses_publish_in_order() {
        let mut page = Box::new(TestPage([0; PAGE_SIZE]));
        let mut ring = test_ring(&mut page);

        for (i, id) in [11u64, 22, 33].iter().enumerate() {
            ring.push_response(&RingResponse {
                id: *id,
                op: blkif::OP_WRITE,
                status: blkif::STATUS_OK,
                ..Default::default()
            });
            let prod = u32::from_ne_bytes(
                page.0[OFF_RSP_PROD..OFF_RSP_PROD + 4].try_into().unwrap(),
            );
            assert_eq!(prod, i as u32 + 1);
        }
        let off = slot_offset(1);
        let rsp = RingResponse::read_from_bytes(
            &page.0[off..off + core::mem::size_of::<RingResponse>()],
        )
        .unwrap();
        assert_eq!(rsp.id, 22);
    }

    #[test]
    fn garbage_producer_index_yields_nothing() {
        let mut page = Box::new(TestPage([0; PAGE_SIZE]));
        let ring = test_ring(&mut page);
        page.0[OFF_REQ_PROD..OFF_REQ_PROD + 4]
            .copy_from_slice(&(RING_SIZE * 3).to_ne_bytes());
        assert!(ring.peek().is_none());
    }
}
