//! Key filters for sorted tables.
//!
//! A filter policy summarizes a set of keys into a small byte string the
//! table reader consults before touching a data block; a negative answer
//! skips the block read entirely. The policy must never answer "no" for
//! a key that was in the set.

/// Pluggable filter over user keys.
pub trait FilterPolicy: Send + Sync {
    /// Persisted in the table's metaindex; a table written under one
    /// policy name is only consulted by a reader configured with the same
    /// name.
    fn name(&self) -> &str;

    /// Appends a filter summarizing `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// May return false only if `key` was not passed to `create_filter`.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter with double hashing.
///
/// `bits_per_key` trades space for false-positive rate; 10 bits/key gives
/// roughly a 1% false-positive rate. The probe count is derived from the
/// bit budget and stored as the filter's final byte so readers do not
/// depend on the writer's configuration.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2), clamped to a sane probe count.
        let k = ((bits_per_key as f64) * 0.69) as usize;
        BloomFilterPolicy {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }

    fn bloom_hash(key: &[u8]) -> u32 {
        hash(key, 0xbc9f1d34)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &str {
        "tephradb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        // Round up to cover small key sets; tiny filters have terrible
        // false-positive rates.
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let init_len = dst.len();
        dst.resize(init_len + bytes, 0);
        dst.push(self.k as u8);

        let array = &mut dst[init_len..init_len + bytes];
        for key in keys {
            // Double hashing: advance by a rotated copy of the hash.
            let mut h = Self::bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit = (h as usize) % bits;
                array[bit / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }
        let bits = (filter.len() - 1) * 8;
        let k = filter[filter.len() - 1] as usize;
        if k > 30 {
            // Reserved for future encodings; err on returning a match.
            return true;
        }
        let array = &filter[..filter.len() - 1];
        let mut h = Self::bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit = (h as usize) % bits;
            if array[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

/// 32-bit multiplicative hash over a byte string.
fn hash(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0xc6a4a793;
    let mut h = seed ^ (data.len() as u32).wrapping_mul(M);
    let mut chunks = data.chunks_exact(4);
    for word in &mut chunks {
        let w = u32::from_le_bytes(word.try_into().unwrap());
        h = h.wrapping_add(w).wrapping_mul(M);
        h ^= h >> 16;
    }
    // Mix in the trailing bytes.
    let rest = chunks.remainder();
    for (i, &byte) in rest.iter().enumerate().rev() {
        h = h.wrapping_add((byte as u32) << (8 * i));
    }
    if !rest.is_empty() {
        h = h.wrapping_mul(M);
        h ^= h >> 24;
    }
    h
}
