// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pooled records of the request pipeline and the segment-merge predicate.
//!
//! A [`ReqEntry`] shadows one guest ring request until its reply is emitted.
//! An [`IoEntry`] accumulates segments (possibly from several consecutive
//! requests) into one host transfer.  A [`Fragment`] links a contributing
//! request into an [`IoEntry`] so that neither side needs a fixed-size
//! back-reference array; resolving the fragment at completion time drops the
//! request's pending count.

use std::sync::Arc;

use blkif::{GrantRef, Segment, SECTORS_PER_PAGE, SECTOR_SHIFT};

use crate::mapper::GrantMapping;
use crate::storage::{Dir, Storage};
use crate::MAX_PAGES_PER_IO;

/// Instance-private key into the outstanding-request map.
pub type ReqKey = u64;

/// One guest request, alive from decode until its reply is emitted.
#[derive(Default)]
pub struct ReqEntry {
    /// Guest cookie, echoed in the reply.
    pub id: u64,
    pub op: u8,
    pub vdev: u16,
    /// Host transfers this request has contributed segments to and which
    /// have not yet completed.  The entry is released when this returns to
    /// zero; the reply status is ERROR iff `errors` is nonzero by then.
    pub pending: u32,
    pub errors: u32,
}

impl ReqEntry {
    pub fn init(&mut self, id: u64, op: u8, vdev: u16) {
        self.id = id;
        self.op = op;
        self.vdev = vdev;
        self.pending = 0;
        self.errors = 0;
    }
}

/// Link between one [`IoEntry`] and one contributing [`ReqEntry`].
#[derive(Default)]
pub struct Fragment {
    pub req: ReqKey,
}

/// A segment resolved against its request context: operation kind, target
/// device, and absolute device sector already computed.
#[derive(Copy, Clone, Debug)]
pub struct SegView {
    pub op: u8,
    pub vdev: u16,
    /// Absolute device sector this segment starts at.
    pub sector: u64,
    pub gref: GrantRef,
    pub first_sect: u8,
    pub last_sect: u8,
    pub nsects: u64,
}

impl SegView {
    /// Resolve a wire segment.  `None` marks the "non-positive computed
    /// length" protocol violation.
    pub fn resolve(
        op: u8,
        vdev: u16,
        sector: u64,
        seg: &Segment,
    ) -> Option<Self> {
        let nsects = seg.sectors()?;
        Some(Self {
            op,
            vdev,
            sector,
            gref: seg.gref,
            first_sect: seg.first_sect,
            last_sect: seg.last_sect,
            nsects,
        })
    }
}

/// How an open [`IoEntry`] can take on one more segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Admit {
    /// Continues within the most recent granted page; no new page needed.
    SamePage,
    /// Starts at sector 0 of a fresh page appended to the mapping.
    NewPage,
    /// Cannot merge; the open entry must be closed and submitted first.
    Refuse,
}

/// One host transfer being accumulated, then in flight until completion.
#[derive(Default)]
pub struct IoEntry {
    pub op: u8,
    pub vdev: u16,
    pub storage: Option<Arc<dyn Storage>>,
    /// First device sector of the transfer.
    pub start_sector: u64,
    /// Device sector the next admitted segment must start at.
    pub next_sector: u64,
    /// In-page sector offset of the transfer start within the first page.
    pub first_sect: u8,
    /// Pages backing the transfer, in buffer order.
    pub grefs: Vec<GrantRef>,
    last_gref: GrantRef,
    last_sect: u8,
    /// Total transfer length in bytes.
    pub bytes: usize,
    pub frags: Vec<Box<Fragment>>,
    /// Present only between a successful map and the completion-time unmap.
    pub mapping: Option<GrantMapping>,
}

impl IoEntry {
    /// Prime a recycled entry for a new accumulation.
    pub fn open(
        &mut self,
        op: u8,
        vdev: u16,
        storage: Arc<dyn Storage>,
        start_sector: u64,
    ) {
        assert!(self.frags.is_empty());
        assert!(self.mapping.is_none());
        self.op = op;
        self.vdev = vdev;
        self.storage = Some(storage);
        self.start_sector = start_sector;
        self.next_sector = start_sector;
        self.first_sect = 0;
        self.grefs.clear();
        self.last_gref = GrantRef(0);
        self.last_sect = 0;
        self.bytes = 0;
    }

    /// The merge predicate: can `seg` extend this entry, and how?
    ///
    /// An empty (just-opened) entry admits its first segment outright; the
    /// caller primed it from the same request context.  After that a segment
    /// merges iff it is the same kind of operation on the same device, its
    /// device sectors follow on exactly, and the guest buffer stays
    /// contiguous once mapped: either continuing within the last granted
    /// page, or starting at sector 0 of a new page while the previous
    /// segment filled its page to the last sector and the page budget
    /// allows one more.
    pub fn admits(&self, seg: &SegView) -> Admit {
        if self.grefs.is_empty() {
            return Admit::NewPage;
        }
        if seg.op != self.op || seg.vdev != self.vdev {
            return Admit::Refuse;
        }
        if seg.sector != self.next_sector {
            return Admit::Refuse;
        }
        if seg.gref == self.last_gref
            && self.last_sect < SECTORS_PER_PAGE - 1
            && seg.first_sect == self.last_sect + 1
        {
            return Admit::SamePage;
        }
        if self.last_sect == SECTORS_PER_PAGE - 1
            && seg.first_sect == 0
            && self.grefs.len() < MAX_PAGES_PER_IO
        {
            return Admit::NewPage;
        }
        Admit::Refuse
    }

    /// Fold an admitted segment in.
    pub fn extend(&mut self, seg: &SegView, admit: Admit) {
        match admit {
            Admit::NewPage => {
                if self.grefs.is_empty() {
                    self.first_sect = seg.first_sect;
                }
                self.grefs.push(seg.gref);
            }
            Admit::SamePage => {}
            Admit::Refuse => panic!("refused segment folded into transfer"),
        }
        self.last_gref = seg.gref;
        self.last_sect = seg.last_sect;
        self.bytes += (seg.nsects as usize) << SECTOR_SHIFT;
        self.next_sector += seg.nsects;
    }

    pub fn dir(&self) -> Dir {
        if self.op == blkif::OP_READ {
            Dir::Read
        } else {
            Dir::Write
        }
    }

    /// Byte offset of the transfer start within the mapped range.
    pub fn map_offset(&self) -> usize {
        (self.first_sect as usize) << SECTOR_SHIFT
    }

    /// Return the entry to its pristine state before going back to the pool.
    pub fn reset(&mut self) {
        assert!(self.frags.is_empty());
        assert!(self.mapping.is_none());
        self.storage = None;
        self.grefs.clear();
        self.bytes = 0;
    }
}
