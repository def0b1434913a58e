//! Buffer headers: the unit of payload exchanged with the native engine
//!
//! A [`Buffer`] is a handle to one header of a [`Pool`](super::Pool). Each
//! handle is one reference: [`Buffer::acquire`] hands out another, and the
//! header goes back to the owning pool's free queue only when the last one is
//! released or dropped. If the pool has been destroyed (or resized) in the
//! meantime the header is freed instead, so a late release can never touch a
//! dead pool.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::{Arc, Weak};

use tracing::trace;

use super::errors::{AllocationError, BufferError};
use super::pool::PoolShared;

/// Bitset of buffer flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const EMPTY: Self = Self(0);
    /// No more data will follow on this stream
    pub const END_OF_STREAM: Self = Self(1 << 0);
    pub const FRAME_START: Self = Self(1 << 1);
    pub const FRAME_END: Self = Self(1 << 2);
    /// Both frame boundaries: the buffer holds a whole frame
    pub const COMPLETE_FRAME: Self = Self(Self::FRAME_START.0 | Self::FRAME_END.0);
    pub const KEYFRAME: Self = Self(1 << 3);
    pub const DISCONTINUITY: Self = Self(1 << 4);
    /// Codec configuration data rather than a frame
    pub const CONFIG: Self = Self(1 << 5);
    pub const ENCRYPTED: Self = Self(1 << 6);
    pub const CODEC_SIDE_INFO: Self = Self(1 << 7);
    pub const SNAPSHOT: Self = Self(1 << 8);
    pub const CORRUPTED: Self = Self(1 << 9);
    /// The engine failed to fill this buffer
    pub const TRANSMISSION_FAILED: Self = Self(1 << 10);
    pub const DECODE_ONLY: Self = Self(1 << 11);
    pub const NAL_END: Self = Self(1 << 12);

    const NAMES: [(Self, &'static str); 13] = [
        (Self::END_OF_STREAM, "EOS"),
        (Self::FRAME_START, "FRAME_START"),
        (Self::FRAME_END, "FRAME_END"),
        (Self::KEYFRAME, "KEYFRAME"),
        (Self::DISCONTINUITY, "DISCONTINUITY"),
        (Self::CONFIG, "CONFIG"),
        (Self::ENCRYPTED, "ENCRYPTED"),
        (Self::CODEC_SIDE_INFO, "CODEC_SIDE_INFO"),
        (Self::SNAPSHOT, "SNAPSHOT"),
        (Self::CORRUPTED, "CORRUPTED"),
        (Self::TRANSMISSION_FAILED, "TRANSMISSION_FAILED"),
        (Self::DECODE_ONLY, "DECODE_ONLY"),
        (Self::NAL_END, "NAL_END"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any flag in `other` is set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for BufferFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "BufferFlags(EMPTY)");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "BufferFlags({})", names.join(" | "))
    }
}

/// Storage for one buffer header, owned by its pool while free
pub(crate) struct Header {
    index: u32,
    data: Box<[u8]>,
    offset: u32,
    length: u32,
    flags: BufferFlags,
    pts: Option<i64>,
    dts: Option<i64>,
}

impl Header {
    /// Allocate a header with `size` payload bytes, reporting allocator failure
    pub(crate) fn allocate(index: u32, size: u32) -> Result<Box<Self>, AllocationError> {
        let mut data = Vec::new();
        data.try_reserve_exact(size as usize)
            .map_err(|_| AllocationError::OutOfMemory { index, size })?;
        data.resize(size as usize, 0);
        Ok(Box::new(Self {
            index,
            data: data.into_boxed_slice(),
            offset: 0,
            length: 0,
            flags: BufferFlags::EMPTY,
            pts: None,
            dts: None,
        }))
    }

    /// Clear metadata; payload bytes are left as they are
    pub(crate) fn reset(&mut self) {
        self.offset = 0;
        self.length = 0;
        self.flags = BufferFlags::EMPTY;
        self.pts = None;
        self.dts = None;
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    fn allocated(&self) -> u32 {
        self.data.len() as u32
    }
}

/// One in-flight header and the pool it returns to
struct Slot {
    header: Option<Box<Header>>,
    home: Weak<PoolShared>,
    generation: u64,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let Some(header) = self.header.take() else {
            return;
        };
        match self.home.upgrade() {
            Some(pool) => pool.queue().recycle(header, self.generation),
            None => trace!("Buffer {} released after its pool was destroyed", header.index),
        }
    }
}

/// Reference to an in-flight buffer header
///
/// Obtained from [`Queue::get`](super::Queue::get) / [`Queue::wait`](super::Queue::wait)
/// as the only reference. Payload and metadata are writable only through a
/// sole reference; the mutating methods panic while the header is shared.
pub struct Buffer {
    slot: Arc<Slot>,
}

impl Buffer {
    pub(crate) fn new(header: Box<Header>, home: Weak<PoolShared>, generation: u64) -> Self {
        Self {
            slot: Arc::new(Slot {
                header: Some(header),
                home,
                generation,
            }),
        }
    }

    fn header(&self) -> &Header {
        self.slot
            .header
            .as_deref()
            .expect("buffer header is present until the last reference is released")
    }

    fn header_mut(&mut self) -> &mut Header {
        Arc::get_mut(&mut self.slot)
            .and_then(|slot| slot.header.as_deref_mut())
            .expect("buffer is shared; it is read-only until the other references are released")
    }

    /// Position of this header within its pool
    pub fn index(&self) -> u32 {
        self.header().index
    }

    pub fn allocated_size(&self) -> u32 {
        self.header().allocated()
    }

    /// Number of valid payload bytes
    pub fn length(&self) -> u32 {
        self.header().length
    }

    /// Start of valid payload within the allocation
    pub fn offset(&self) -> u32 {
        self.header().offset
    }

    pub fn flags(&self) -> BufferFlags {
        self.header().flags
    }

    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.header_mut().flags = flags;
    }

    pub fn insert_flags(&mut self, flags: BufferFlags) {
        self.header_mut().flags.insert(flags);
    }

    /// Presentation timestamp in microseconds
    pub fn pts(&self) -> Option<i64> {
        self.header().pts
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.header_mut().pts = pts;
    }

    /// Decode timestamp in microseconds
    pub fn dts(&self) -> Option<i64> {
        self.header().dts
    }

    pub fn set_dts(&mut self, dts: Option<i64>) {
        self.header_mut().dts = dts;
    }

    /// The valid payload: `length` bytes starting at `offset`
    pub fn data(&self) -> &[u8] {
        let header = self.header();
        let start = header.offset as usize;
        &header.data[start..start + header.length as usize]
    }

    /// The whole allocation, for producers filling the buffer in place
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.header_mut().data
    }

    /// Copy `bytes` to the start of the allocation and mark them valid.
    ///
    /// Bytes beyond the allocated size are not copied; returns the number written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let header = self.header_mut();
        let n = bytes.len().min(header.data.len());
        header.data[..n].copy_from_slice(&bytes[..n]);
        header.offset = 0;
        header.length = n as u32;
        n
    }

    /// Mark `length` bytes starting at `offset` as the valid payload
    pub fn set_range(&mut self, offset: u32, length: u32) -> Result<(), BufferError> {
        let header = self.header_mut();
        let allocated = header.allocated();
        match offset.checked_add(length) {
            Some(end) if end <= allocated => {
                header.offset = offset;
                header.length = length;
                Ok(())
            }
            _ => Err(BufferError::OutOfRange {
                offset,
                length,
                allocated,
            }),
        }
    }

    /// Clear metadata (length, offset, flags, timestamps) for reuse
    pub fn reset(&mut self) {
        self.header_mut().reset();
    }

    /// Number of live references to this header
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.slot)
    }

    pub fn is_shared(&self) -> bool {
        self.ref_count() > 1
    }

    /// Take an additional reference to the same header
    pub fn acquire(&self) -> Buffer {
        Buffer {
            slot: Arc::clone(&self.slot),
        }
    }

    /// Drop this reference.
    ///
    /// Returns true when it was the last one: the header has then been reset
    /// and recycled into its pool, or freed if the pool is gone.
    pub fn release(self) -> bool {
        Arc::into_inner(self.slot).is_some()
    }

    /// True once the owning pool is gone; releasing will free the header
    pub fn is_orphaned(&self) -> bool {
        match self.slot.home.upgrade() {
            Some(pool) => !pool.queue().accepts(self.slot.generation),
            None => true,
        }
    }

    pub(crate) fn belongs_to(&self, home: &Weak<PoolShared>) -> bool {
        Weak::ptr_eq(&self.slot.home, home)
    }

    /// Take the header out without recycling it, if this is the last reference.
    ///
    /// Otherwise only this reference is dropped and `None` is returned.
    pub(crate) fn detach(self) -> Option<(Box<Header>, u64)> {
        let mut slot = Arc::into_inner(self.slot)?;
        let generation = slot.generation;
        slot.header.take().map(|header| (header, generation))
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.slot.header.as_deref() {
            Some(header) => f
                .debug_struct("Buffer")
                .field("index", &header.index)
                .field("offset", &header.offset)
                .field("length", &header.length)
                .field("allocated", &header.allocated())
                .field("flags", &header.flags)
                .field("refs", &self.ref_count())
                .finish(),
            None => write!(f, "Buffer(released)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Pool;

    #[test]
    fn test_complete_frame_is_union_of_boundaries() {
        let flags = BufferFlags::COMPLETE_FRAME;
        assert!(flags.contains(BufferFlags::FRAME_START));
        assert!(flags.contains(BufferFlags::FRAME_END));
        assert!(!flags.is_empty());
        assert!(BufferFlags::FRAME_END.intersects(flags));
    }

    #[test]
    fn test_flag_insert_remove() {
        let mut flags = BufferFlags::KEYFRAME;
        flags.insert(BufferFlags::END_OF_STREAM);
        assert!(flags.contains(BufferFlags::KEYFRAME | BufferFlags::END_OF_STREAM));
        flags.remove(BufferFlags::KEYFRAME);
        assert_eq!(flags, BufferFlags::END_OF_STREAM);
        assert_eq!(format!("{:?}", flags), "BufferFlags(EOS)");
    }

    #[test]
    fn test_write_truncates_to_allocation() {
        let pool = Pool::create(1, 8).unwrap();
        let mut buffer = pool.get().unwrap();
        assert_eq!(buffer.write(b"0123456789"), 8);
        assert_eq!(buffer.length(), 8);
        assert_eq!(buffer.data(), b"01234567");
    }

    #[test]
    fn test_set_range_rejects_overflow() {
        let pool = Pool::create(1, 16).unwrap();
        let mut buffer = pool.get().unwrap();
        buffer.write(b"hello world");
        buffer.set_range(6, 5).unwrap();
        assert_eq!(buffer.data(), b"world");
        assert!(matches!(
            buffer.set_range(10, 7),
            Err(BufferError::OutOfRange { allocated: 16, .. })
        ));
        assert!(buffer.set_range(u32::MAX, 2).is_err());
    }

    #[test]
    fn test_release_recycles_only_at_zero() {
        let pool = Pool::create(2, 16).unwrap();
        let buffer = pool.get().unwrap();
        let extra = buffer.acquire();
        assert_eq!(buffer.ref_count(), 2);
        assert!(extra.is_shared());

        assert!(!buffer.release());
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(extra.ref_count(), 1);

        assert!(extra.release());
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_dropping_one_of_two_references_keeps_buffer_in_flight() {
        let pool = Pool::create(2, 16).unwrap();
        let mut buffer = pool.get().unwrap();
        buffer.write(b"payload");
        let extra = buffer.acquire();

        pool.queue().put(buffer);
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.available(), 1);
        assert_eq!(extra.data(), b"payload");

        let again = extra.acquire();
        drop(extra);
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(again.ref_count(), 1);

        drop(again);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    #[should_panic(expected = "buffer is shared")]
    fn test_shared_buffer_is_read_only() {
        let pool = Pool::create(1, 16).unwrap();
        let mut buffer = pool.get().unwrap();
        let _extra = buffer.acquire();
        buffer.write(b"abc");
    }

    #[test]
    fn test_recycled_buffer_is_reset() {
        let pool = Pool::create(1, 16).unwrap();
        let mut buffer = pool.get().unwrap();
        buffer.write(b"abc");
        buffer.set_flags(BufferFlags::END_OF_STREAM);
        buffer.set_pts(Some(42));
        drop(buffer);

        let buffer = pool.get().unwrap();
        assert_eq!(buffer.length(), 0);
        assert!(buffer.flags().is_empty());
        assert_eq!(buffer.pts(), None);
    }

    #[test]
    fn test_release_after_pool_destroyed_is_noop() {
        let pool = Pool::create(2, 16).unwrap();
        let buffer = pool.get().unwrap();
        pool.close();
        assert!(buffer.is_orphaned());
        assert!(buffer.release());
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_flight(), 0);

        let pool = Pool::create(1, 16).unwrap();
        let buffer = pool.get().unwrap();
        drop(pool);
        drop(buffer);
    }
}
