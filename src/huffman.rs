//! Value compression with a learned codebook.
//!
//! A single binary Huffman code over byte symbols is trained on the whole
//! corpus of unique values and every value is encoded independently with it.
//! The code table is serialized into the fixed `CODEBOOK_SIZE` header region
//! using `minimum_redundancy`'s canonical representation, so the reader
//! reconstructs exactly the code the writer used.
//!
//! A compressed value record is `(u32 bit_count, ceil(bit_count/8) bytes)` of
//! LSB-first packed code fragments.

use std::collections::HashMap;
use std::io;

use integer_encoding::FixedInt;
use minimum_redundancy::{Code, Coding, DecodingResult};

use crate::bitio::{BitReader, BitWriter};
use crate::error::{Result, Status, StatusCode};

/// Size of the serialized code table region in the header. A table for the
/// full 256-symbol byte alphabet fits with room to spare; the rest is
/// zero-padded.
pub const CODEBOOK_SIZE: usize = 512;

pub struct Codebook {
    coding: Coding<u8>,
    codes: HashMap<u8, Code>,
}

impl Codebook {
    /// Learns a code from the byte frequencies of the given values.
    pub fn train<'a>(values: impl Iterator<Item = &'a [u8]>) -> Codebook {
        let mut freq = HashMap::<u8, u32>::new();
        for value in values {
            for &b in value {
                let n = freq.entry(b).or_insert(0);
                *n = n.saturating_add(1);
            }
        }
        let coding = Coding::from_frequencies_bits_per_fragment(freq, 1);
        let codes = coding.codes_for_values();
        Codebook { coding, codes }
    }

    /// Serializes the code table into `dst`, which must be exactly
    /// `CODEBOOK_SIZE` bytes; unused tail bytes are left zeroed.
    pub fn serialize(&self, dst: &mut [u8]) -> Result<()> {
        debug_assert_eq!(dst.len(), CODEBOOK_SIZE);
        if self.coding.write_pow2_bytes(1) > CODEBOOK_SIZE {
            return Err(Status::new(
                StatusCode::CompressionFailed,
                "code table exceeds codebook region",
            ));
        }
        let mut cur = io::Cursor::new(dst);
        self.coding
            .write_pow2(&mut cur, |out, v| out.write_all(&[*v]))?;
        Ok(())
    }

    /// Reconstructs a codebook from a header region written by `serialize`.
    pub fn load(region: &[u8]) -> Result<Codebook> {
        fn corrupt() -> Status {
            Status::new(StatusCode::Corruption, "malformed codebook")
        }

        if region.len() != CODEBOOK_SIZE {
            return Err(corrupt());
        }
        // Layout: u8 bits-per-fragment, u32 level count, levels, u32 symbol
        // count, symbols. Bound the counts before handing the region to the
        // deserializer.
        if region[0] != 1 {
            return Err(corrupt());
        }
        let levels = u32::decode_fixed(&region[1..5]).ok_or_else(corrupt)?;
        if 9 + levels as usize * 4 > CODEBOOK_SIZE {
            return Err(corrupt());
        }
        let nsyms_at = 5 + levels as usize * 4;
        let nsyms = u32::decode_fixed(&region[nsyms_at..nsyms_at + 4]).ok_or_else(corrupt)?;
        if nsyms > 256 {
            return Err(corrupt());
        }

        let mut cur = io::Cursor::new(region);
        let coding = Coding::read_pow2(&mut cur, |inp| {
            let mut b = [0u8; 1];
            inp.read_exact(&mut b)?;
            Ok(b[0])
        })?;
        let codes = coding.codes_for_values();
        Ok(Codebook { coding, codes })
    }

    /// Encodes one value into a self-contained record.
    pub fn compress(&self, value: &[u8]) -> Result<Vec<u8>> {
        let mut w = BitWriter::new();
        for b in value {
            let code = self.codes.get(b).ok_or_else(|| {
                Status::new(StatusCode::CompressionFailed, "byte missing from code table")
            })?;
            for fragment in *code {
                w.write_bits(fragment as u64, 1);
            }
        }
        let nbits = w.bit_len();
        if nbits > u32::MAX as u64 {
            return Err(Status::new(
                StatusCode::CompressionFailed,
                "compressed value exceeds 2^32 bits",
            ));
        }
        let bits = w.finish();
        let mut record = Vec::with_capacity(4 + bits.len());
        record.extend_from_slice((nbits as u32).encode_fixed_light().as_ref());
        record.extend_from_slice(&bits);
        Ok(record)
    }

    /// Decodes a record produced by `compress`.
    pub fn decompress(&self, record: &[u8]) -> Result<Vec<u8>> {
        fn corrupt(msg: &str) -> Status {
            Status::new(StatusCode::Corruption, msg)
        }

        if record.len() < 4 {
            return Err(corrupt("truncated value record"));
        }
        let nbits = u32::decode_fixed(&record[..4]).ok_or_else(|| corrupt("bad bit count"))?;
        let data = &record[4..];
        if nbits as u64 > data.len() as u64 * 8 {
            return Err(corrupt("value record bit count out of range"));
        }

        let mut r = BitReader::new(data);
        let mut out = Vec::new();
        let mut decoder = self.coding.decoder();
        let mut mid_code = false;
        for _ in 0..nbits {
            let fragment = r.read_bits(1).ok_or_else(|| corrupt("truncated bit stream"))?;
            match decoder.consume(fragment as u32) {
                DecodingResult::Value(v) => {
                    out.push(*v);
                    decoder = self.coding.decoder();
                    mid_code = false;
                }
                DecodingResult::Incomplete => mid_code = true,
                DecodingResult::Invalid => return Err(corrupt("invalid code fragment")),
            }
        }
        if mid_code {
            return Err(corrupt("value record ends mid-code"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<&'static [u8]> {
        vec![
            b"mississippi",
            b"missouri",
            b"mister",
            b"",
            b"\x00\xff\x00\xff",
        ]
    }

    fn trained() -> Codebook {
        Codebook::train(corpus().into_iter())
    }

    #[test]
    fn test_compress_roundtrip() {
        let cb = trained();
        for v in corpus() {
            let rec = cb.compress(v).unwrap();
            assert_eq!(cb.decompress(&rec).unwrap(), v);
        }
    }

    #[test]
    fn test_compress_shrinks_skewed_input() {
        let cb = Codebook::train([&b"aaaaaaaaaaaaaaaaaaaaaaaab"[..]].into_iter());
        let rec = cb.compress(b"aaaaaaaaaaaaaaaaaaaaaaaab").unwrap();
        // 25 symbols in at most 2 bits each, plus the length prefix
        assert!(rec.len() < 4 + 13);
    }

    #[test]
    fn test_serialize_load_roundtrip() {
        let cb = trained();
        let mut region = [0u8; CODEBOOK_SIZE];
        cb.serialize(&mut region).unwrap();

        let loaded = Codebook::load(&region).unwrap();
        for v in corpus() {
            let rec = cb.compress(v).unwrap();
            assert_eq!(loaded.decompress(&rec).unwrap(), v);
            // and the reloaded table encodes identically
            assert_eq!(loaded.compress(v).unwrap(), rec);
        }
    }

    #[test]
    fn test_single_symbol_corpus() {
        let cb = Codebook::train([&b"aaaa"[..]].into_iter());
        let rec = cb.compress(b"aaaa").unwrap();
        assert_eq!(cb.decompress(&rec).unwrap(), b"aaaa");
    }

    #[test]
    fn test_empty_corpus_serializes() {
        let cb = Codebook::train(std::iter::empty());
        let mut region = [0u8; CODEBOOK_SIZE];
        cb.serialize(&mut region).unwrap();
        let loaded = Codebook::load(&region).unwrap();
        assert_eq!(loaded.compress(b"").unwrap(), cb.compress(b"").unwrap());
    }

    #[test]
    fn test_unknown_byte_fails() {
        let cb = Codebook::train([&b"aaaa"[..]].into_iter());
        assert!(cb.compress(b"b").is_err());
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        let cb = trained();
        assert!(cb.decompress(&[]).is_err());
        // bit count larger than payload
        let mut rec = vec![0u8; 4];
        rec[0] = 0xff;
        assert!(cb.decompress(&rec).is_err());
    }
}
