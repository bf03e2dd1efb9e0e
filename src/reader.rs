//! Read-only view over a finalized image.
//!
//! `Db` owns the image bytes, validates the header up front and answers
//! lookups either through the packed minimal perfect hash (confirming
//! membership against the stored key, since the hash is undefined on
//! non-members) or by a linear scan when the image was built without one.

use integer_encoding::FixedInt;
use log::debug;

use crate::delta;
use crate::error::{Result, Status, StatusCode};
use crate::hash::Mph;
use crate::huffman::Codebook;
use crate::packed::{Header, F_COMPRESSED, F_HASH, F_MULTISET, HEADER_SIZE};

fn corrupt(msg: &str) -> Status {
    Status::new(StatusCode::Corruption, msg)
}

pub struct Db {
    data: Vec<u8>,
    head: Header,
    hash: Option<Mph>,
    codebook: Option<Codebook>,
}

impl Db {
    /// Validates the image and prepares it for lookups.
    pub fn new(data: Vec<u8>) -> Result<Db> {
        let head = Header::decode(&data)?;
        if head.size != data.len() as u64 {
            return Err(corrupt("image size does not match header"));
        }
        if head.hash_offs < HEADER_SIZE as u64
            || head.hash_offs > head.key2values_offs
            || head.key2values_offs > head.id2value_offs
            || head.id2value_offs > head.size
        {
            return Err(corrupt("section offsets out of order"));
        }
        let k2v_toc_end = head
            .key2values_offs
            .checked_add((head.num_keys as u64 + 1) * 8)
            .ok_or_else(|| corrupt("key toc overflow"))?;
        let i2v_toc_end = head
            .id2value_offs
            .checked_add((head.num_uniq_values as u64 + 1) * 8)
            .ok_or_else(|| corrupt("value toc overflow"))?;
        if k2v_toc_end > head.id2value_offs || i2v_toc_end > head.size {
            return Err(corrupt("section toc out of bounds"));
        }

        let hash = if head.has(F_HASH) {
            let section = &data[head.hash_offs as usize..head.key2values_offs as usize];
            Some(Mph::from_bytes(section)?)
        } else {
            None
        };
        let codebook = if head.has(F_COMPRESSED) {
            Some(Codebook::load(&head.codebook)?)
        } else {
            None
        };

        debug!(
            "opened image: {} keys, {} unique values, {} bytes",
            head.num_keys,
            head.num_uniq_values,
            head.size
        );
        Ok(Db {
            data,
            head,
            hash,
            codebook,
        })
    }

    pub fn num_keys(&self) -> usize {
        self.head.num_keys as usize
    }

    /// Total pairs added at build time, duplicates included.
    pub fn num_values(&self) -> usize {
        self.head.num_values as usize
    }

    pub fn num_unique_values(&self) -> usize {
        self.head.num_uniq_values as usize
    }

    /// Whether some key holds the same value more than once.
    pub fn is_multiset(&self) -> bool {
        self.head.has(F_MULTISET)
    }

    pub fn is_compressed(&self) -> bool {
        self.head.has(F_COMPRESSED)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn toc_entry(&self, section: u64, ix: usize) -> Result<u64> {
        let at = section as usize + ix * 8;
        let bytes = self
            .data
            .get(at..at + 8)
            .ok_or_else(|| corrupt("toc out of bounds"))?;
        u64::decode_fixed(bytes).ok_or_else(|| corrupt("toc out of bounds"))
    }

    fn record(&self, section: u64, ix: usize) -> Result<&[u8]> {
        let start = self.toc_entry(section, ix)?;
        let end = self.toc_entry(section, ix + 1)?;
        if start > end {
            return Err(corrupt("toc not monotonic"));
        }
        self.data
            .get(start as usize..end as usize)
            .ok_or_else(|| corrupt("record out of bounds"))
    }

    /// The stored key and its encoded id list at `slot`.
    fn key_record(&self, slot: usize) -> Result<(&[u8], &[u8])> {
        let rec = self.record(self.head.key2values_offs, slot)?;
        if rec.len() < 4 {
            return Err(corrupt("truncated key record"));
        }
        let klen = u32::decode_fixed(&rec[..4]).ok_or_else(|| corrupt("truncated key record"))?;
        let rest = &rec[4..];
        if klen as usize > rest.len() {
            return Err(corrupt("key length out of range"));
        }
        Ok((&rest[..klen as usize], &rest[klen as usize..]))
    }

    fn value(&self, id: u64) -> Result<Vec<u8>> {
        if id == 0 || id > self.head.num_uniq_values as u64 {
            return Err(corrupt("value id out of range"));
        }
        let rec = self.record(self.head.id2value_offs, id as usize - 1)?;
        match &self.codebook {
            Some(codebook) => codebook.decompress(rec),
            None => Ok(rec.to_vec()),
        }
    }

    fn slot_of(&self, key: &[u8]) -> Result<Option<usize>> {
        let num_keys = self.num_keys();
        if let Some(hash) = &self.hash {
            match hash.slot(key) {
                Some(slot) if (slot as usize) < num_keys => {
                    let (stored, _) = self.key_record(slot as usize)?;
                    Ok(if stored == key {
                        Some(slot as usize)
                    } else {
                        None
                    })
                }
                _ => Ok(None),
            }
        } else {
            for slot in 0..num_keys {
                let (stored, _) = self.key_record(slot)?;
                if stored == key {
                    return Ok(Some(slot));
                }
            }
            Ok(None)
        }
    }

    /// All values added under `key`, duplicates preserved, in sorted-id
    /// order. `None` when the key is not in the store.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        let slot = match self.slot_of(key)? {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let (_, blob) = self.key_record(slot)?;
        let ids = delta::delta_decode(blob)?;
        let mut values = Vec::with_capacity(ids.len());
        for id in ids {
            values.push(self.value(id)?);
        }
        Ok(Some(values))
    }

    /// Stored keys in record (hash-slot) order.
    pub fn keys(&self) -> Keys {
        Keys { db: self, slot: 0 }
    }
}

pub struct Keys<'a> {
    db: &'a Db,
    slot: usize,
}

impl<'a> Iterator for Keys<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.slot >= self.db.num_keys() {
            return None;
        }
        let result = self.db.key_record(self.slot).map(|(key, _)| key);
        self.slot += 1;
        Some(result)
    }
}
