//! `ktsn-core`: wire-format types shared by every process on the fabric.
//!
//! These types cross the process boundary by being memcpy'd through shared
//! memory, never by serialization. Every type here is `#[repr(C)]` (or
//! `#[repr(u16)]` for the one enum) and `Copy`, and field order is chosen
//! for minimal padding rather than mirroring the C prototype's layout — the
//! two processes that share an arena always run from the same build, so
//! there is no cross-version compatibility to preserve.

use std::mem::size_of;

/// Payload buffer paired 1:1 with a [`Metadata`] slot at the same index.
pub const MBUF_SIZE: usize = 2048;

/// Default size in bytes of the data region (`ktsnd_data_memory`).
pub const DEFAULT_DATA_MEMORY_SIZE: usize = 1024 * 1024;

/// Default number of slots in the free-ring / tx-ring (must be a power of two).
pub const DEFAULT_RING_CAPACITY: usize = 128;

/// Default page size the one-shot allocator carves the data region into.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Default "emit now" window: if `deadline - now <= tx_delta`, send immediately.
pub const DEFAULT_TX_DELTA_NS: i64 = 50_000;

/// Fixed UDP source port used for every outgoing datagram (§4.5 / §6).
pub const SHIM_SRC_PORT: u16 = 9999;

/// Name of the control-region POSIX shared memory object.
pub const CTRL_MEMORY_NAME: &str = "ktsnd_meta_memory";

/// Name of the data-region POSIX shared memory object.
pub const DATA_MEMORY_NAME: &str = "ktsnd_data_memory";

/// Fixed-size payload buffer. One per ring slot index.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Mbuf {
    pub data: [u8; MBUF_SIZE],
}

impl Default for Mbuf {
    fn default() -> Self {
        Mbuf { data: [0u8; MBUF_SIZE] }
    }
}

/// Which L2/L3/L4 stack the sender should materialise for a given slot.
///
/// The source only ever builds UDP-over-IPv4-over-Ethernet frames; `Ethernet`
/// is kept as a documented extension point (a raw-frame transport with no
/// IP/UDP framing) rather than removed, since `kt_memory.h` reserves both
/// `KT_METADATA_TRANSPORT_ETHERNET` and `KT_METADATA_TRANSPORT_UDP` bits.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Ethernet = 1,
    Udp = 2,
}

/// Per-slot packet metadata. Same index as the paired [`Mbuf`].
///
/// `txtime == 0` is the "slot not yet filled" sentinel — the shim always
/// writes a non-zero TAI-nanosecond deadline before handing a slot to the
/// tx-ring (§3 invariant: "txtime: i64 ... required non-zero").
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Metadata {
    pub txtime: i64,
    pub ip_src: u32,
    pub ip_dst: u32,
    pub size: u32,
    pub udp_dport: u16,
    pub transport: Transport,
    pub eth_src: [u8; 6],
    pub eth_dst: [u8; 6],
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            txtime: 0,
            ip_src: 0,
            ip_dst: 0,
            size: 0,
            udp_dport: 0,
            transport: Transport::Udp,
            eth_src: [0; 6],
            eth_dst: [0; 6],
        }
    }
}

/// Broadcast Ethernet destination, used when the shim cannot resolve a
/// peer's hardware address (§3: "dst defaults to broadcast").
pub const BROADCAST_MAC: [u8; 6] = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff];

/// Header stored at offset 0 of the control region (`ktsnd_meta_memory`).
///
/// Every field is a byte offset into the data region — never an absolute
/// pointer, since the two processes map the same object at different base
/// addresses (§9 Design Notes: "Shared-memory offsets, not pointers").
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ShmLayout {
    pub tx_ring_off: u64,
    pub free_ring_off: u64,
    pub mbuf_pool_off: u64,
    pub metadata_pool_off: u64,
}

impl ShmLayout {
    pub const SIZE: usize = size_of::<ShmLayout>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbuf_is_exactly_the_slot_size() {
        assert_eq!(size_of::<Mbuf>(), MBUF_SIZE);
    }

    #[test]
    fn metadata_txtime_zero_is_the_empty_sentinel() {
        assert_eq!(Metadata::default().txtime, 0);
    }

    #[test]
    fn shm_layout_fits_well_inside_one_page() {
        assert!(ShmLayout::SIZE <= 4096);
    }
}
