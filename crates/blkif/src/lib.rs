// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire format for the paravirtualized block-device ring.
//!
//! One granted page is shared between the guest front-end and the backend.
//! It holds a [`RingHeader`] followed by a power-of-two array of slots, each
//! large enough for a [`RingRequest`].  Responses are written back into the
//! same slot array.  Producer/consumer positions are free-running counters;
//! a slot index is always derived by masking with [`ring_mask`].

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Granted pages are always this size.
pub const PAGE_SIZE: usize = 4096;

/// Sector size the protocol is denominated in.
pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_SHIFT: u32 = 9;

/// Sectors per granted page.
pub const SECTORS_PER_PAGE: u8 = (PAGE_SIZE / SECTOR_SIZE) as u8;

/// Most segments a single request slot can carry.
pub const MAX_SEGMENTS_PER_REQ: usize = 11;

/// Read data from the device into the segment pages.
pub const OP_READ: u8 = 0;
/// Write data from the segment pages to the device.
pub const OP_WRITE: u8 = 1;
/// Enumerate the virtual block devices of this backend into the (single)
/// segment page; the reply status carries the record count.
pub const OP_PROBE: u8 = 2;

pub const STATUS_OK: i16 = 0;
pub const STATUS_ERROR: i16 = -1;

/// Reference to a page the guest has granted the backend access to.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(transparent)]
pub struct GrantRef(pub u32);

/// One (page, in-page sector range) unit of a request.
#[derive(Copy, Clone, Debug, Default)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Segment {
    pub gref: GrantRef,
    /// First sector of the page covered by this segment.
    pub first_sect: u8,
    /// Last sector of the page covered by this segment (inclusive).
    pub last_sect: u8,
    pub _pad: u16,
}

impl Segment {
    /// Sector count described by this segment, or `None` if the range is
    /// inverted or runs off the end of the page.  An inverted range is the
    /// "negative computed length" protocol violation.
    pub fn sectors(&self) -> Option<u64> {
        if self.last_sect < self.first_sect
            || self.last_sect >= SECTORS_PER_PAGE
        {
            return None;
        }
        Some(u64::from(self.last_sect - self.first_sect) + 1)
    }
}

/// Guest-to-backend request slot.
#[derive(Copy, Clone, Debug)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RingRequest {
    pub op: u8,
    pub nr_segments: u8,
    /// Guest-visible device number this request targets.
    pub vdev: u16,
    pub _pad: u32,
    /// Opaque guest cookie, echoed in the reply.
    pub id: u64,
    /// First device sector of the transfer.
    pub sector: u64,
    pub segments: [Segment; MAX_SEGMENTS_PER_REQ],
}

impl Default for RingRequest {
    fn default() -> Self {
        RingRequest {
            op: 0,
            nr_segments: 0,
            vdev: 0,
            _pad: 0,
            id: 0,
            sector: 0,
            segments: [Segment::default(); MAX_SEGMENTS_PER_REQ],
        }
    }
}

/// Backend-to-guest response slot, overlaying the request slot it answers.
#[derive(Copy, Clone, Debug, Default)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RingResponse {
    /// Echo of [`RingRequest::id`].
    pub id: u64,
    /// Echo of [`RingRequest::op`].
    pub op: u8,
    pub _pad: u8,
    /// [`STATUS_OK`], [`STATUS_ERROR`], or a non-negative probe record count.
    pub status: i16,
    pub _pad2: u32,
}

/// Shared counters at the head of the ring page.
///
/// `req_prod` is written only by the guest; `rsp_prod` only by the backend.
/// The consumer positions are private to their respective sides.  The event
/// fields are reserved for notification hold-off and are not interpreted
/// here.
#[derive(Copy, Clone, Debug)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RingHeader {
    pub req_prod: u32,
    pub req_event: u32,
    pub rsp_prod: u32,
    pub rsp_event: u32,
    pub _pad: [u8; 48],
}

pub const HEADER_SIZE: usize = core::mem::size_of::<RingHeader>();
pub const SLOT_SIZE: usize = core::mem::size_of::<RingRequest>();

/// Slots in the ring: the largest power of two that fits in the page after
/// the header.
pub const RING_SIZE: u32 = {
    let avail = (PAGE_SIZE - HEADER_SIZE) / SLOT_SIZE;
    let mut size = 1usize;
    while size * 2 <= avail {
        size *= 2;
    }
    size as u32
};

pub const fn ring_mask() -> u32 {
    RING_SIZE - 1
}

/// Byte offset of slot `idx` (a free-running counter) within the ring page.
pub const fn slot_offset(idx: u32) -> usize {
    HEADER_SIZE + (idx & ring_mask()) as usize * SLOT_SIZE
}

bitflags::bitflags! {
    /// Attribute flags in a probe record.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct VbdFlags: u16 {
        const READ_ONLY = 1 << 0;
    }
}

/// One record of the probe reply, packed into the probe segment's page.
#[derive(Copy, Clone, Debug, Default)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct VbdInfo {
    pub vdev: u16,
    /// [`VbdFlags`] bits.
    pub flags: u16,
    pub _pad: u32,
    /// Device size in sectors.
    pub sectors: u64,
}

pub const VBD_INFO_SIZE: usize = core::mem::size_of::<VbdInfo>();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes() {
        assert_eq!(core::mem::size_of::<Segment>(), 8);
        assert_eq!(SLOT_SIZE, 112);
        assert_eq!(core::mem::size_of::<RingResponse>(), 16);
        assert_eq!(HEADER_SIZE, 64);
        assert_eq!(VBD_INFO_SIZE, 16);
    }

    #[test]
    fn ring_geometry() {
        // Power-of-two slot count, and everything fits in one page.
        assert!(RING_SIZE.is_power_of_two());
        assert!(HEADER_SIZE + RING_SIZE as usize * SLOT_SIZE <= PAGE_SIZE);
        assert_eq!(RING_SIZE, 32);

        // Slot stride keeps 8-byte alignment for the 64-bit slot fields.
        assert_eq!(SLOT_SIZE % 8, 0);

        // Free-running indices wrap through the mask.
        assert_eq!(slot_offset(0), slot_offset(RING_SIZE));
        assert_eq!(slot_offset(3), HEADER_SIZE + 3 * SLOT_SIZE);
    }

    #[test]
    fn segment_sectors() {
        let seg = |first, last| Segment {
            gref: GrantRef(1),
            first_sect: first,
            last_sect: last,
            _pad: 0,
        };
        assert_eq!(seg(0, 7).sectors(), Some(8));
        assert_eq!(seg(3, 3).sectors(), Some(1));
        assert_eq!(seg(2, 6).sectors(), Some(5));
        // Inverted and out-of-page ranges are refused.
        assert_eq!(seg(5, 4).sectors(), None);
        assert_eq!(seg(0, 8).sectors(), None);
    }
}
