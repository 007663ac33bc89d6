use crate::error::TtError;
use bytes::{Buf, BufMut, BytesMut};

/// Length of an Ethernet MAC header (destination, source, EtherType).
pub const ETH_HLEN: usize = 14;
/// EtherType of IPv4, restored when the TT header is popped.
pub const ETH_P_IPV4: u16 = 0x0800;

/// An owned Ethernet frame with explicit headroom in front of the MAC header.
///
/// Header push operations move the start of the frame *backwards* into the
/// headroom instead of shifting the whole payload, which mirrors how a real
/// datapath avoids copying packet bodies. A frame that runs out of headroom
/// cannot be grown, and the caller sees that as an error rather than a
/// reallocation.
#[derive(Clone)]
pub struct Frame {
    buf: BytesMut,
    head: usize,
}

impl Frame {
    /// Default headroom reserved in front of ingested frames. Enough for the
    ///  TT header with room to spare.
    pub const DEFAULT_HEADROOM: usize = 16;

    pub fn from_ethernet(data: &[u8]) -> Frame {
        Self::with_headroom(data, Self::DEFAULT_HEADROOM)
    }

    pub fn with_headroom(data: &[u8], headroom: usize) -> Frame {
        let mut buf = BytesMut::with_capacity(headroom + data.len());
        buf.resize(headroom, 0);
        buf.extend_from_slice(data);
        Frame { buf, head: headroom }
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..]
    }

    /// Grow the frame at the head by `n` bytes, claiming them from the
    ///  headroom. The new bytes keep whatever content they had.
    pub fn grow_head(&mut self, n: usize) -> Result<(), TtError> {
        if self.head < n {
            return Err(TtError::OutOfMemory);
        }
        self.head -= n;
        Ok(())
    }

    /// Shrink the frame at the head by `n` bytes, giving them back to the
    ///  headroom.
    pub fn shrink_head(&mut self, n: usize) -> Result<(), TtError> {
        if self.len() < n {
            return Err(TtError::NotWritable);
        }
        self.head += n;
        Ok(())
    }

    pub fn read_u16_be(&self, offset: usize) -> Option<u16> {
        let data = self.as_slice();
        if offset + 2 > data.len() {
            return None;
        }
        let mut field = &data[offset..];
        Some(field.get_u16())
    }

    pub fn write_u16_be(&mut self, offset: usize, value: u16) {
        let mut field = &mut self.as_mut_slice()[offset..];
        field.put_u16(value);
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}
impl Eq for Frame {}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len())
            .field("headroom", &self.head)
            .finish()
    }
}
