//! Key placement. The key space is split into 16 buckets by the top four
//! bits of a 32-bit FNV-1a hash, and each bucket maps to the backends that
//! report the deepest inventory for it.

use rand::seq::SliceRandom;
use rand::Rng;

/// Number of key-space partitions.
pub const BUCKET_COUNT: usize = 16;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a. The whole placement scheme keys off this exact function,
/// so it is pinned here rather than taken from a hashing crate.
pub fn fnv1a(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The bucket a key lives in: the top four bits of its hash.
pub fn bucket_of(key: &[u8]) -> usize {
    ((u64::from(fnv1a(key)) * BUCKET_COUNT as u64) >> 32) as usize
}

/// Parse the `@` inventory listing: one line per bucket whose third
/// whitespace-separated field is the item count. Anything malformed yields
/// `None`, leaving the backend to be asked again on a later refresh.
pub(crate) fn parse_inventory(listing: &[u8]) -> Option<Vec<u64>> {
    let text = std::str::from_utf8(listing).ok()?;
    let counts = text
        .trim()
        .split('\n')
        .map(|line| line.split_whitespace().nth(2)?.parse().ok())
        .collect::<Option<Vec<u64>>>()?;
    if counts.len() == BUCKET_COUNT {
        Some(counts)
    } else {
        None
    }
}

/// Build the bucket-to-replica table from whatever inventories are known.
///
/// Per bucket: rank backends by that bucket's count descending, keep the top
/// `n`, drop any below 90% of the leader, and shuffle the survivors so load
/// spreads across equally-good replicas. Backends without an inventory are
/// invisible to every bucket.
pub(crate) fn assign_buckets<R: Rng>(
    inventories: &[Option<Vec<u64>>],
    n: usize,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    (0..BUCKET_COUNT)
        .map(|bucket| {
            let mut ranked: Vec<(u64, usize)> = inventories
                .iter()
                .enumerate()
                .filter_map(|(i, inv)| inv.as_ref().map(|counts| (counts[bucket], i)))
                .collect();
            ranked.sort_unstable_by(|a, b| b.cmp(a));
            ranked.truncate(n);
            let top = match ranked.first() {
                Some(&(top, _)) => top,
                None => return Vec::new(),
            };
            let mut picks: Vec<usize> = ranked
                .into_iter()
                .filter(|&(count, _)| count as f64 >= top as f64 * 0.9)
                .map(|(_, i)| i)
                .collect();
            picks.shuffle(rng);
            picks
        })
        .collect()
}
