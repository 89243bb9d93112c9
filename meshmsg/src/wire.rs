//! Message header wire format.
//!
//! Every message starts with a 12-byte header. Bulk-carrying messages
//! (flag bit 0) append a 40-byte sub-header. Only identical builds
//! interoperate, so multi-byte fields are written little-endian relative to
//! fixed byte offsets:
//!
//! ```text
//! offset  size  field
//!  0      2     type
//!  2      1     priority
//!  3      1     flags: bit0 bulk, bit1 ack, bit2 write,
//!                      bit3 polled, bit4 notify-variant
//!  4      1     from_node
//!  5      1     reserved
//!  6      2     reserved
//!  8      4     total_size (including this header)
//! ```
//!
//! Bulk sub-header, following immediately:
//!
//! ```text
//! offset  size  field
//!  0      8     peer_addr
//!  8      4     peer_key
//! 12      4     transfer_size
//! 16      2     reply_type
//! 18      2     region_slot
//! 20      4     rendezvous_tag
//! 24      8     local_dma_addr
//! 32      8     padding
//! ```

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 12;

/// Size of the bulk sub-header.
pub const RDMA_HEADER_SIZE: usize = 40;

/// Exclusive upper bound on message types.
pub const TYPE_MAX: u16 = 128;

/// Reserved type: sentinel key advertisement.
pub const MSG_TYPE_SENTINEL_KEY_REQUEST: u16 = 0;

/// Reserved type: sentinel key acknowledgment.
pub const MSG_TYPE_SENTINEL_KEY_RESPONSE: u16 = 1;

/// First type available to clients.
pub const FIRST_USER_TYPE: u16 = 2;

/// Normal delivery priority.
pub const PRIO_NORMAL: u8 = 0;

pub const FLAG_RDMA: u8 = 1 << 0;
pub const FLAG_RDMA_ACK: u8 = 1 << 1;
pub const FLAG_WRITE: u8 = 1 << 2;
pub const FLAG_POLLED: u8 = 1 << 3;
pub const FLAG_NOTIFY: u8 = 1 << 4;

/// The fixed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: u16,
    pub priority: u8,
    pub flags: u8,
    pub from_node: u8,
    /// Total message size, this header included.
    pub total_size: u32,
}

impl MessageHeader {
    pub fn new(msg_type: u16, flags: u8) -> Self {
        Self {
            msg_type,
            priority: PRIO_NORMAL,
            flags,
            from_node: 0,
            total_size: 0,
        }
    }

    #[inline]
    pub fn is_rdma(&self) -> bool {
        self.flags & FLAG_RDMA != 0
    }

    #[inline]
    pub fn rdma_ack(&self) -> bool {
        self.flags & FLAG_RDMA_ACK != 0
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.flags & FLAG_WRITE != 0
    }

    #[inline]
    pub fn polled(&self) -> bool {
        self.flags & FLAG_POLLED != 0
    }

    #[inline]
    pub fn notify_variant(&self) -> bool {
        self.flags & FLAG_NOTIFY != 0
    }

    /// Encode into `buf`.
    ///
    /// # Safety
    /// `buf` must be valid for `HEADER_SIZE` bytes of writes.
    #[inline]
    pub unsafe fn write_to(&self, buf: *mut u8) {
        std::ptr::write_unaligned(buf as *mut u16, self.msg_type.to_le());
        std::ptr::write(buf.add(2), self.priority);
        std::ptr::write(buf.add(3), self.flags);
        std::ptr::write(buf.add(4), self.from_node);
        std::ptr::write(buf.add(5), 0u8);
        std::ptr::write_bytes(buf.add(6), 0, 2);
        std::ptr::write_unaligned(buf.add(8) as *mut u32, self.total_size.to_le());
    }

    /// Decode from `buf`.
    ///
    /// # Safety
    /// `buf` must be valid for `HEADER_SIZE` bytes of reads.
    #[inline]
    pub unsafe fn read_from(buf: *const u8) -> Self {
        Self {
            msg_type: u16::from_le(std::ptr::read_unaligned(buf as *const u16)),
            priority: std::ptr::read(buf.add(2)),
            flags: std::ptr::read(buf.add(3)),
            from_node: std::ptr::read(buf.add(4)),
            total_size: u32::from_le(std::ptr::read_unaligned(buf.add(8) as *const u32)),
        }
    }
}

/// The bulk sub-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RdmaHeader {
    /// Initiator-advertised virtual address the responder targets.
    pub peer_addr: u64,
    /// Key under which `peer_addr` is reachable.
    pub peer_key: u32,
    /// Requested transfer size in bytes.
    pub transfer_size: u32,
    /// Message type the acknowledgment will carry.
    pub reply_type: u16,
    /// Initiator's region slot, echoed back through the acknowledgment.
    pub region_slot: u16,
    /// Opaque token re-attaching the acknowledgment to the blocked caller.
    pub rendezvous_tag: u32,
    /// Initiator-side mapping, threaded back through the acknowledgment.
    pub local_dma_addr: u64,
}

impl RdmaHeader {
    /// Encode into `buf` (positioned at the sub-header, i.e. `HEADER_SIZE`
    /// bytes into the message).
    ///
    /// # Safety
    /// `buf` must be valid for `RDMA_HEADER_SIZE` bytes of writes.
    #[inline]
    pub unsafe fn write_to(&self, buf: *mut u8) {
        std::ptr::write_unaligned(buf as *mut u64, self.peer_addr.to_le());
        std::ptr::write_unaligned(buf.add(8) as *mut u32, self.peer_key.to_le());
        std::ptr::write_unaligned(buf.add(12) as *mut u32, self.transfer_size.to_le());
        std::ptr::write_unaligned(buf.add(16) as *mut u16, self.reply_type.to_le());
        std::ptr::write_unaligned(buf.add(18) as *mut u16, self.region_slot.to_le());
        std::ptr::write_unaligned(buf.add(20) as *mut u32, self.rendezvous_tag.to_le());
        std::ptr::write_unaligned(buf.add(24) as *mut u64, self.local_dma_addr.to_le());
        std::ptr::write_bytes(buf.add(32), 0, 8);
    }

    /// Decode from `buf`.
    ///
    /// # Safety
    /// `buf` must be valid for `RDMA_HEADER_SIZE` bytes of reads.
    #[inline]
    pub unsafe fn read_from(buf: *const u8) -> Self {
        Self {
            peer_addr: u64::from_le(std::ptr::read_unaligned(buf as *const u64)),
            peer_key: u32::from_le(std::ptr::read_unaligned(buf.add(8) as *const u32)),
            transfer_size: u32::from_le(std::ptr::read_unaligned(buf.add(12) as *const u32)),
            reply_type: u16::from_le(std::ptr::read_unaligned(buf.add(16) as *const u16)),
            region_slot: u16::from_le(std::ptr::read_unaligned(buf.add(18) as *const u16)),
            rendezvous_tag: u32::from_le(std::ptr::read_unaligned(buf.add(20) as *const u32)),
            local_dma_addr: u64::from_le(std::ptr::read_unaligned(buf.add(24) as *const u64)),
        }
    }
}
