//! Construction side of the store: accumulates (key, value) pairs in memory
//! and finalizes them into a self-contained packed image.
//!
//! Values are interned on first sight and identified by a positive id in
//! first-insertion order (id 0 means "absent"). Each key owns the list of ids
//! added under it, duplicates included. `finalize` reorders key records by
//! their minimal-perfect-hash slot, gap-encodes the id lists and writes the
//! unique values (optionally codebook-compressed) in id order.

use indexmap::{IndexMap, IndexSet};
use integer_encoding::FixedInt;
use log::debug;

use crate::delta;
use crate::error::{Result, Status, StatusCode};
use crate::hash::{Mph, HASH_MIN_KEYS};
use crate::huffman::Codebook;
use crate::options::BuildOptions;
use crate::packed::{Header, PackedBuffer, F_COMPRESSED, F_HASH, F_MULTISET};

enum BuilderState {
    Populating,
    Failed,
}

pub struct DbBuilder {
    values_map: IndexSet<Box<[u8]>>,
    keys_map: IndexMap<Box<[u8]>, Vec<u64>>,
    num_values: u32,
    state: BuilderState,
}

impl Default for DbBuilder {
    fn default() -> DbBuilder {
        DbBuilder::new()
    }
}

impl DbBuilder {
    pub fn new() -> DbBuilder {
        DbBuilder {
            values_map: IndexSet::new(),
            keys_map: IndexMap::new(),
            num_values: 0,
            state: BuilderState::Populating,
        }
    }

    /// Adds one (key, value) pair. The same pair may be added repeatedly; a
    /// key maps to the multiset of all values added under it.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let BuilderState::Failed = self.state {
            return Err(Status::new(
                StatusCode::InvalidState,
                "builder failed earlier",
            ));
        }
        self.add_inner(key, value).map_err(|e| {
            self.state = BuilderState::Failed;
            e
        })
    }

    fn add_inner(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > u32::MAX as usize || value.len() > u32::MAX as usize {
            return Err(Status::new(
                StatusCode::InvalidArgument,
                "entry longer than 2^32-1 bytes",
            ));
        }
        let num_values = self.num_values.checked_add(1).ok_or_else(|| {
            Status::new(StatusCode::InvalidArgument, "pair count overflows u32")
        })?;

        let value_id = match self.values_map.get_index_of(value) {
            Some(ix) => ix as u64 + 1,
            None => self.values_map.insert_full(Box::from(value)).0 as u64 + 1,
        };
        match self.keys_map.get_mut(key) {
            Some(ids) => ids.push(value_id),
            None => {
                self.keys_map.insert(Box::from(key), vec![value_id]);
            }
        }
        self.num_values = num_values;
        Ok(())
    }

    pub fn num_keys(&self) -> usize {
        self.keys_map.len()
    }

    pub fn num_unique_values(&self) -> usize {
        self.values_map.len()
    }

    pub fn num_values(&self) -> usize {
        self.num_values as usize
    }

    /// Consumes the builder and packs the accumulated pairs into the final
    /// image. The returned buffer is the complete store; writing it to disk
    /// durably is the caller's business.
    pub fn finalize(self, opt: &BuildOptions) -> Result<Vec<u8>> {
        if let BuilderState::Failed = self.state {
            return Err(Status::new(
                StatusCode::InvalidState,
                "builder failed earlier",
            ));
        }
        let DbBuilder {
            values_map,
            keys_map,
            num_values,
            ..
        } = self;

        debug!(
            "finalizing image: {} keys, {} unique values, {} pairs",
            keys_map.len(),
            values_map.len(),
            num_values
        );

        let mut head = Header::new();
        head.num_keys = keys_map.len() as u32;
        head.num_uniq_values = values_map.len() as u32;
        head.num_values = num_values;

        let mut pack = PackedBuffer::new()?;

        head.hash_offs = pack.offset();
        let order = pack_hash(&mut pack, &keys_map, &mut head)?;

        head.key2values_offs = pack.offset();
        pack_key2values(&mut pack, &order, &keys_map, &mut head)?;

        head.id2value_offs = pack.offset();
        // values_map moves here and is dropped once its section is written
        pack_id2value(&mut pack, values_map, opt, &mut head)?;

        head.size = pack.offset();
        Ok(pack.finish(&head))
    }
}

/// Emits the MPH section when there are enough keys to be worth it and
/// returns the slot-ordered key indices. Without a hash the order is simply
/// insertion order and the reader scans linearly.
fn pack_hash(
    pack: &mut PackedBuffer,
    keys_map: &IndexMap<Box<[u8]>, Vec<u64>>,
    head: &mut Header,
) -> Result<Vec<u32>> {
    let num_keys = keys_map.len();
    let mut order: Vec<u32> = (0..num_keys as u32).collect();

    if num_keys > HASH_MIN_KEYS {
        let keys: Vec<&[u8]> = keys_map.keys().map(|k| &k[..]).collect();
        let mph = Mph::build(&keys)?;

        // single blob, no TOC: the reader recovers its length from the next
        // section's offset
        pack.new_section(0)?;
        pack.write(&mph.to_bytes()?)?;
        head.set(F_HASH);

        for (ix, &key) in keys.iter().enumerate() {
            let slot = mph
                .slot(key)
                .ok_or_else(|| Status::new(StatusCode::MphBuildFailed, "key lost its slot"))?;
            order[slot as usize] = ix as u32;
        }
    }
    Ok(order)
}

/// Writes the key→values section: a TOC of `num_keys + 1` offsets, then per
/// key `(u32 key_len, key_bytes, delta_encoded_ids)` in slot order.
fn pack_key2values(
    pack: &mut PackedBuffer,
    order: &[u32],
    keys_map: &IndexMap<Box<[u8]>, Vec<u64>>,
    head: &mut Header,
) -> Result<()> {
    pack.new_section(keys_map.len() + 1)?;

    let mut scratch = Vec::new();
    for &key_ix in order {
        let (key, ids) = keys_map
            .get_index(key_ix as usize)
            .ok_or_else(|| Status::new(StatusCode::MphBuildFailed, "slot order out of range"))?;
        scratch.clear();
        scratch.extend_from_slice(ids);
        let (blob, duplicates) = delta::delta_encode(&mut scratch);
        if duplicates {
            head.set(F_MULTISET);
        }

        pack.toc_mark();
        pack.write((key.len() as u32).encode_fixed_light().as_ref())?;
        pack.write(key)?;
        pack.write(&blob)?;
    }
    pack.toc_mark();
    Ok(())
}

/// Writes the id→value section: a TOC of `num_uniq_values + 1` offsets, then
/// every unique value in id order, compressed through the learned codebook
/// unless disabled. Takes ownership of the values map and drops it.
fn pack_id2value(
    pack: &mut PackedBuffer,
    values_map: IndexSet<Box<[u8]>>,
    opt: &BuildOptions,
    head: &mut Header,
) -> Result<()> {
    pack.new_section(values_map.len() + 1)?;

    let codebook = if opt.compression {
        head.set(F_COMPRESSED);
        let codebook = Codebook::train(values_map.iter().map(|v| &v[..]));
        codebook.serialize(&mut head.codebook)?;
        Some(codebook)
    } else {
        None
    };

    for value in &values_map {
        pack.toc_mark();
        match &codebook {
            Some(codebook) => pack.write(&codebook.compress(value)?)?,
            None => pack.write(value)?,
        }
    }
    pack.toc_mark();

    // trailing zero-length record so the reader's decoder never runs past the
    // section while decoding the last value
    pack.write(0u32.encode_fixed_light().as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packed::HEADER_SIZE;

    fn toc_at(img: &[u8], section: u64, n: usize) -> Vec<u64> {
        (0..n)
            .map(|i| {
                let at = section as usize + i * 8;
                u64::decode_fixed(&img[at..at + 8]).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_finalize_empty() {
        let img = DbBuilder::new().finalize(&BuildOptions::default()).unwrap();
        let head = Header::decode(&img).unwrap();
        assert_eq!(head.num_keys, 0);
        assert_eq!(head.num_uniq_values, 0);
        assert_eq!(head.num_values, 0);
        assert_eq!(head.size, img.len() as u64);
        assert!(head.has(F_COMPRESSED));
        assert!(!head.has(F_MULTISET) && !head.has(F_HASH));
        assert_eq!(head.hash_offs, HEADER_SIZE as u64);
        assert_eq!(head.hash_offs, head.key2values_offs);
    }

    #[test]
    fn test_finalize_empty_uncompressed_has_no_flags() {
        let img = DbBuilder::new()
            .finalize(&BuildOptions::no_compression())
            .unwrap();
        let head = Header::decode(&img).unwrap();
        assert_eq!(head.flags, 0);
    }

    #[test]
    fn test_finalize_single_pair() {
        let mut b = DbBuilder::new();
        b.add(b"a", b"1").unwrap();
        assert_eq!((b.num_keys(), b.num_unique_values(), b.num_values()), (1, 1, 1));

        let img = b.finalize(&BuildOptions::default()).unwrap();
        let head = Header::decode(&img).unwrap();
        assert_eq!(head.num_keys, 1);
        assert_eq!(head.num_uniq_values, 1);
        assert_eq!(head.num_values, 1);
        assert!(!head.has(F_MULTISET) && !head.has(F_HASH));
        assert_eq!(head.size, img.len() as u64);

        // the key record starts right after the two-entry TOC and holds the
        // key verbatim
        let toc = toc_at(&img, head.key2values_offs, 2);
        assert_eq!(toc[0], head.key2values_offs + 16);
        assert!(toc[1] > toc[0] && toc[1] <= head.size);
        let rec = &img[toc[0] as usize..toc[1] as usize];
        assert_eq!(u32::decode_fixed(&rec[0..4]).unwrap(), 1);
        assert_eq!(rec[4], b'a');
    }

    #[test]
    fn test_finalize_duplicates_set_multiset_flag() {
        let mut b = DbBuilder::new();
        b.add(b"k", b"v").unwrap();
        b.add(b"k", b"v").unwrap();
        b.add(b"k", b"v").unwrap();

        let img = b.finalize(&BuildOptions::default()).unwrap();
        let head = Header::decode(&img).unwrap();
        assert_eq!(head.num_values, 3);
        assert_eq!(head.num_uniq_values, 1);
        assert!(head.has(F_MULTISET));
    }

    #[test]
    fn test_finalize_distinct_values_clear_multiset_flag() {
        let mut b = DbBuilder::new();
        b.add(b"k", b"a").unwrap();
        b.add(b"k", b"b").unwrap();
        b.add(b"j", b"a").unwrap();

        let img = b.finalize(&BuildOptions::default()).unwrap();
        let head = Header::decode(&img).unwrap();
        assert_eq!(head.num_keys, 2);
        assert_eq!(head.num_uniq_values, 2);
        assert_eq!(head.num_values, 3);
        assert!(!head.has(F_MULTISET));
    }

    #[test]
    fn test_finalize_many_keys_emits_hash() {
        let mut b = DbBuilder::new();
        for i in 0..HASH_MIN_KEYS + 100 {
            b.add(format!("key-{}", i).as_bytes(), format!("val-{}", i).as_bytes())
                .unwrap();
        }
        let img = b.finalize(&BuildOptions::default()).unwrap();
        let head = Header::decode(&img).unwrap();
        assert!(head.has(F_HASH));
        // the hash blob occupies [hash_offs, key2values_offs)
        assert!(head.key2values_offs > head.hash_offs);
    }

    #[test]
    fn test_finalize_at_hash_threshold_stays_linear() {
        let mut b = DbBuilder::new();
        for i in 0..HASH_MIN_KEYS {
            b.add(format!("key-{}", i).as_bytes(), b"v").unwrap();
        }
        let img = b.finalize(&BuildOptions::default()).unwrap();
        let head = Header::decode(&img).unwrap();
        assert!(!head.has(F_HASH));
    }

    #[test]
    fn test_uncompressed_value_is_verbatim() {
        let mut b = DbBuilder::new();
        b.add(b"k", b"aaaaaaaaaa").unwrap();
        let img = b.finalize(&BuildOptions::no_compression()).unwrap();
        let head = Header::decode(&img).unwrap();
        assert!(!head.has(F_COMPRESSED));

        let toc = toc_at(&img, head.id2value_offs, 2);
        assert_eq!(&img[toc[0] as usize..toc[1] as usize], b"aaaaaaaaaa");
        // trailing guard record past the section end
        assert_eq!(&img[toc[1] as usize..toc[1] as usize + 4], &[0, 0, 0, 0]);
        assert_eq!(head.size, toc[1] + 4);
    }

    #[test]
    fn test_toc_monotonic_and_bounded() {
        let mut b = DbBuilder::new();
        for i in 0..200u32 {
            b.add(format!("key-{}", i).as_bytes(), format!("{}", i % 17).as_bytes())
                .unwrap();
            b.add(format!("key-{}", i).as_bytes(), b"shared").unwrap();
        }
        let img = b.finalize(&BuildOptions::default()).unwrap();
        let head = Header::decode(&img).unwrap();

        for (section, n) in [
            (head.key2values_offs, head.num_keys as usize),
            (head.id2value_offs, head.num_uniq_values as usize),
        ] {
            let toc = toc_at(&img, section, n + 1);
            assert!(toc[0] >= section + 8 * (n as u64 + 1));
            for w in toc.windows(2) {
                assert!(w[0] <= w[1]);
            }
            assert!(*toc.last().unwrap() <= head.size);
        }
    }

    #[test]
    fn test_value_ids_assigned_in_first_insertion_order() {
        let mut b = DbBuilder::new();
        b.add(b"k1", b"x").unwrap();
        b.add(b"k2", b"y").unwrap();
        b.add(b"k3", b"x").unwrap();
        assert_eq!(b.num_unique_values(), 2);

        let img = b.finalize(&BuildOptions::no_compression()).unwrap();
        let head = Header::decode(&img).unwrap();
        let toc = toc_at(&img, head.id2value_offs, 3);
        // id 1 = first-seen value "x", id 2 = "y"
        assert_eq!(&img[toc[0] as usize..toc[1] as usize], b"x");
        assert_eq!(&img[toc[1] as usize..toc[2] as usize], b"y");
    }
}
