//! Minimal perfect hashing over the unique keys, wrapping `ph`'s FMPH.

use std::io;

use log::debug;
use ph::fmph;
use ph::fmph::keyset::SliceSourceWithRefs;

use crate::error::{Result, Status, StatusCode};

/// Number of unique keys above which an MPH section is emitted. Below this a
/// linear key scan at read time is cheaper than the hash overhead.
pub const HASH_MIN_KEYS: usize = 32;

fn build_failed() -> Status {
    Status::new(
        StatusCode::MphBuildFailed,
        "hash does not map keys bijectively",
    )
}

pub struct Mph {
    function: fmph::Function,
}

impl Mph {
    /// Builds the hash over `keys` and verifies that it maps them bijectively
    /// onto `[0, keys.len())`. A key set the hash family cannot separate is
    /// reported as `MphBuildFailed`, never a panic.
    pub fn build(keys: &[&[u8]]) -> Result<Mph> {
        let conf = fmph::BuildConf {
            use_multiple_threads: false,
            ..Default::default()
        };
        let function = fmph::Function::try_with_conf_stats(
            SliceSourceWithRefs::<_, u8>::new(keys),
            conf,
            &mut (),
        )
        .ok_or_else(build_failed)?;
        let mph = Mph { function };

        // construction succeeding does not prove the evaluated slots form a
        // bijection; check before any record is placed by them
        let mut seen = vec![false; keys.len()];
        for &key in keys {
            match mph.slot(key) {
                Some(slot) if (slot as usize) < keys.len() && !seen[slot as usize] => {
                    seen[slot as usize] = true
                }
                _ => return Err(build_failed()),
            }
        }
        debug!(
            "built minimal perfect hash over {} keys ({} bytes packed)",
            keys.len(),
            mph.function.write_bytes()
        );
        Ok(mph)
    }

    /// The slot of `key` in `[0, num_keys)`. Arbitrary (possibly `None`) for
    /// keys the hash was not built over; callers confirm membership against
    /// the stored key.
    pub fn slot(&self, key: &[u8]) -> Option<u32> {
        self.function.get(key).map(|slot| slot as u32)
    }

    /// Serializes the hash into its packed section image.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.function.write_bytes());
        self.function.write(&mut out)?;
        Ok(out)
    }

    /// Reconstructs the hash from a packed section.
    pub fn from_bytes(bytes: &[u8]) -> Result<Mph> {
        let function = fmph::Function::read(&mut io::Cursor::new(bytes))
            .map_err(|e| Status::from(e).annotate("mph section"))?;
        Ok(Mph { function })
    }
}
