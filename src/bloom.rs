use std::hash::Hasher;

/// Fixed-size bloom filter over string keys using double hashing (Kirsch-Mitzenmacher).
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits:       Vec<u64>,
    num_bits:   usize,
    num_hashes: u32,
    capacity:   usize,
    inserted:   u64,
}

impl BloomFilter {
    /// A filter sized for `capacity` keys at the given false-positive rate.
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let fp_rate = fp_rate.clamp(1e-10, 0.5);

        // m = -n * ln(p) / (ln2)^2
        let num_bits = (-(capacity as f64) * fp_rate.ln() / 2.0_f64.ln().powi(2)).ceil() as usize;
        let num_bits = num_bits.max(64);

        // k = (m/n) * ln2
        let num_hashes = ((num_bits as f64 / capacity as f64) * 2.0_f64.ln()).ceil() as u32;
        let num_hashes = num_hashes.clamp(1, 30);

        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_hashes,
            capacity,
            inserted: 0,
        }
    }

    /// Returns `false` when every bit of the key was already set, i.e. the key (or a colliding one) is in.
    pub fn insert(&mut self, key: &str) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        let mut fresh = false;
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            let mask = 1u64 << (idx % 64);
            fresh |= self.bits[idx / 64] & mask == 0;
            self.bits[idx / 64] |= mask;
        }
        if fresh {
            self.inserted += 1;
        }
        fresh
    }

    /// `false` means the key has definitely never been inserted.
    pub fn may_contain(&self, key: &str) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        (0..self.num_hashes).all(|i| {
            let idx = self.bit_index(h1, h2, i);
            self.bits[idx / 64] & (1u64 << (idx % 64)) != 0
        })
    }

    /// Approximate number of distinct keys inserted. Repeats don't count, and neither does the rare new key whose
    /// bits were all set already.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn size_bits(&self) -> usize {
        self.num_bits
    }

    fn hash_pair(key: &str) -> (u64, u64) {
        let mut hasher = FnvHasher::new();
        hasher.write(key.as_bytes());
        let h1 = hasher.finish();

        let mut hasher = FnvHasher::with_seed(0x517cc1b727220a95);
        hasher.write(key.as_bytes());
        // An odd step visits distinct bits for any table size.
        let h2 = hasher.finish() | 1;

        (h1, h2)
    }

    #[inline]
    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }
}

/// FNV-1a
struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    fn new() -> Self {
        Self {
            state: 0xcbf29ce484222325,
        }
    }

    fn with_seed(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(0x100000001b3);
        }
    }
}
