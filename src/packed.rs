//! The on-disk header and the growable buffer the finalizer packs sections
//! into.
//!
//! The image is strictly little-endian: a fixed `HEADER_SIZE` header at
//! offset 0, then the MPH section (no TOC, extent implied by the next
//! section's offset), the key→values section and the id→value section. The
//! latter two each start with a TOC of `N + 1` absolute `u64` offsets; record
//! `i` spans `[toc[i], toc[i+1])`.

use integer_encoding::FixedInt;

use crate::error::{Result, Status, StatusCode};
use crate::huffman::CODEBOOK_SIZE;

/// `D`, `D`, `B`, `1` in little-endian byte order.
pub const MAGIC: u32 = 0x3142_4444;

pub const F_MULTISET: u32 = 1 << 0;
pub const F_COMPRESSED: u32 = 1 << 1;
pub const F_HASH: u32 = 1 << 2;

/// Fixed byte size of the header, codebook region included.
pub const HEADER_SIZE: usize = 52 + CODEBOOK_SIZE;

/// Buffer growth granularity.
const GRANULARITY: usize = 64 << 20;

#[derive(Clone)]
pub struct Header {
    pub flags: u32,
    pub size: u64,
    pub num_keys: u32,
    pub num_uniq_values: u32,
    pub num_values: u32,
    pub hash_offs: u64,
    pub key2values_offs: u64,
    pub id2value_offs: u64,
    pub codebook: [u8; CODEBOOK_SIZE],
}

impl Header {
    pub fn new() -> Header {
        Header {
            flags: 0,
            size: 0,
            num_keys: 0,
            num_uniq_values: 0,
            num_values: 0,
            hash_offs: 0,
            key2values_offs: 0,
            id2value_offs: 0,
            codebook: [0; CODEBOOK_SIZE],
        }
    }

    pub fn set(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn encode(&self, dst: &mut [u8]) {
        debug_assert!(dst.len() >= HEADER_SIZE);
        dst[0..4].copy_from_slice(MAGIC.encode_fixed_light().as_ref());
        dst[4..8].copy_from_slice(self.flags.encode_fixed_light().as_ref());
        dst[8..16].copy_from_slice(self.size.encode_fixed_light().as_ref());
        dst[16..20].copy_from_slice(self.num_keys.encode_fixed_light().as_ref());
        dst[20..24].copy_from_slice(self.num_uniq_values.encode_fixed_light().as_ref());
        dst[24..28].copy_from_slice(self.num_values.encode_fixed_light().as_ref());
        dst[28..36].copy_from_slice(self.hash_offs.encode_fixed_light().as_ref());
        dst[36..44].copy_from_slice(self.key2values_offs.encode_fixed_light().as_ref());
        dst[44..52].copy_from_slice(self.id2value_offs.encode_fixed_light().as_ref());
        dst[52..HEADER_SIZE].copy_from_slice(&self.codebook);
    }

    pub fn decode(src: &[u8]) -> Result<Header> {
        fn corrupt(msg: &str) -> Status {
            Status::new(StatusCode::Corruption, msg)
        }

        if src.len() < HEADER_SIZE {
            return Err(corrupt("image shorter than header"));
        }
        let magic = u32::decode_fixed(&src[0..4]).ok_or_else(|| corrupt("bad magic"))?;
        if magic != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let mut head = Header::new();
        head.flags = u32::decode_fixed(&src[4..8]).ok_or_else(|| corrupt("bad flags"))?;
        head.size = u64::decode_fixed(&src[8..16]).ok_or_else(|| corrupt("bad size"))?;
        head.num_keys = u32::decode_fixed(&src[16..20]).ok_or_else(|| corrupt("bad key count"))?;
        head.num_uniq_values =
            u32::decode_fixed(&src[20..24]).ok_or_else(|| corrupt("bad value count"))?;
        head.num_values =
            u32::decode_fixed(&src[24..28]).ok_or_else(|| corrupt("bad pair count"))?;
        head.hash_offs = u64::decode_fixed(&src[28..36]).ok_or_else(|| corrupt("bad offset"))?;
        head.key2values_offs =
            u64::decode_fixed(&src[36..44]).ok_or_else(|| corrupt("bad offset"))?;
        head.id2value_offs =
            u64::decode_fixed(&src[44..52]).ok_or_else(|| corrupt("bad offset"))?;
        head.codebook.copy_from_slice(&src[52..HEADER_SIZE]);
        Ok(head)
    }
}

/// A monotonically growing byte buffer with a write cursor and the cursor of
/// the section TOC currently being filled in.
pub struct PackedBuffer {
    buf: Vec<u8>,
    offs: usize,
    toc_offs: usize,
}

impl PackedBuffer {
    /// Reserves the (zeroed) header prefix and positions the cursor after it.
    pub fn new() -> Result<PackedBuffer> {
        let mut pack = PackedBuffer {
            buf: Vec::new(),
            offs: 0,
            toc_offs: 0,
        };
        pack.grow(HEADER_SIZE)?;
        pack.offs = HEADER_SIZE;
        Ok(pack)
    }

    fn grow(&mut self, n: usize) -> Result<()> {
        let needed = self.offs + n;
        if needed > self.buf.len() {
            let target = needed + GRANULARITY;
            self.buf
                .try_reserve_exact(target - self.buf.len())
                .map_err(|_| Status::new(StatusCode::OutOfMemory, "image buffer grow"))?;
            self.buf.resize(target, 0);
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        self.offs as u64
    }

    /// Opens a section by reserving a zeroed TOC of `num_entries` u64 slots.
    pub fn new_section(&mut self, num_entries: usize) -> Result<()> {
        self.grow(num_entries * 8)?;
        self.toc_offs = self.offs;
        self.offs += num_entries * 8;
        Ok(())
    }

    /// Records the current write position as the next TOC entry.
    pub fn toc_mark(&mut self) {
        let entry = (self.offs as u64).encode_fixed_light();
        self.buf[self.toc_offs..self.toc_offs + 8].copy_from_slice(entry.as_ref());
        self.toc_offs += 8;
    }

    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        self.grow(src.len())?;
        self.buf[self.offs..self.offs + src.len()].copy_from_slice(src);
        self.offs += src.len();
        Ok(())
    }

    /// Encodes the header into the reserved prefix, truncates the buffer to
    /// the bytes actually written and returns the finished image.
    pub fn finish(mut self, head: &Header) -> Vec<u8> {
        head.encode(&mut self.buf[..HEADER_SIZE]);
        self.buf.truncate(self.offs);
        self.buf.shrink_to_fit();
        self.buf
    }
}
