// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest-visible devices of an instance.

use std::sync::Arc;

use blkif::{VbdFlags, VbdInfo};

use crate::storage::Storage;

/// One virtual block device: a guest-visible device number bound to a
/// contiguous extent of a backing store.
///
/// Entries are created and removed only by the control plane, outside any
/// active continuation chain; request aggregation reads them and never
/// mutates them.
pub struct Vbd {
    pub vdev: u16,
    pub storage: Arc<dyn Storage>,
    /// First backing-store sector of the extent.
    pub extent_start: u64,
    /// Guest-visible size in sectors.
    pub sectors: u64,
    pub read_only: bool,
}

impl Vbd {
    /// The record describing this device in a probe reply.
    pub fn info_record(&self) -> VbdInfo {
        let mut flags = VbdFlags::empty();
        if self.read_only {
            flags |= VbdFlags::READ_ONLY;
        }
        VbdInfo {
            vdev: self.vdev,
            flags: flags.bits(),
            _pad: 0,
            sectors: self.sectors,
        }
    }
}
