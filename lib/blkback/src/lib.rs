// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side backend for paravirtualized block devices.
//!
//! Each guest-facing [`Instance`](instance::Instance) consumes requests from
//! a shared-memory ring ([`ring`]), aggregates their segments into larger
//! host transfers ([`io`]), and hands those to a [`Storage`](storage::Storage)
//! implementation, replying to the guest as each transfer completes.  The
//! whole pipeline is driven by external callbacks and never blocks the
//! calling context: when a resource pool ([`pool`]) is empty or grant-mapping
//! space ([`mapper`]) is exhausted, the instance parks itself and is resumed
//! by the eventual release.

pub extern crate usdt;

pub mod instance;
pub mod io;
pub mod mapper;
pub mod pool;
pub mod ring;
mod sched;
pub mod storage;
pub mod tasks;
pub mod testutil;
pub mod vbd;

pub use instance::{Backend, ControlError, Instance, Lifecycle, Stats};
pub use mapper::{DomId, GrantMap, GrantMapping, MapError, Mapper};
pub use pool::{Pool, PoolSizes, Pools};
pub use storage::{
    DeviceInfo, Dir, FileStorage, IoResult, IoTicket, MemStorage, Storage,
    Transfer,
};

/// Lightweight notification primitive toward the guest: the backend rings it
/// after publishing replies, and the platform delivers it to the front-end.
pub trait EventChannel: Send + Sync + 'static {
    fn signal(&self);
}

/// Most granted pages a single host transfer may span.
pub const MAX_PAGES_PER_IO: usize = 16;

#[usdt::provider(provider = "blkback")]
mod probes {
    fn ring_drain(domid: u16, pending: u32) {}
    fn req_decode(domid: u16, id: u64, op: u8, nsegs: u8) {}
    fn req_reject(domid: u16, id: u64, op: u8) {}
    fn io_submit(domid: u16, sector: u64, bytes: u64, pages: u8) {}
    fn io_complete(domid: u16, sector: u64, ok: u8) {}
    fn reply(domid: u16, id: u64, status: i16) {}
    fn pool_wait(domid: u16, pool: u8) {}
    fn map_retry_wait(domid: u16, pages: u8) {}
}
