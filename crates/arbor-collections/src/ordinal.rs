//! Growable bitset of non-negative ordinals.

/// Set of `usize` ordinals stored as a bit vector.
///
/// Iteration is always ascending. The list grows to fit the largest ordinal
/// added and never shrinks until cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrdinalList {
    words: Vec<u64>,
    count: usize,
}

impl OrdinalList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a list from its little-endian bit bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut list = Self::new();
        for (i, byte) in bytes.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    list.add(i * 8 + bit);
                }
            }
        }
        list
    }

    /// Returns the bits as little-endian bytes, trimmed after the highest set bit.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        bytes
    }

    /// Number of ordinals the list can hold without growing.
    pub fn ceiling(&self) -> usize {
        self.words.len() * 64
    }

    /// Grows the backing storage so ordinals below `ceiling` fit.
    pub fn set_ceiling(&mut self, ceiling: usize) {
        let words = ceiling.div_ceil(64);
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
    }

    /// Number of ordinals in the list.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds `ordinal`. Returns false if it was already present.
    pub fn add(&mut self, ordinal: usize) -> bool {
        self.set_ceiling(ordinal + 1);
        let (word, mask) = locate(ordinal);
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.count += 1;
        true
    }

    /// Adds every ordinal in `range`.
    pub fn add_range(&mut self, range: std::ops::Range<usize>) {
        for ordinal in range {
            self.add(ordinal);
        }
    }

    /// Removes `ordinal`. Returns false if it was absent.
    pub fn remove(&mut self, ordinal: usize) -> bool {
        let (word, mask) = locate(ordinal);
        match self.words.get_mut(word) {
            Some(bits) if *bits & mask != 0 => {
                *bits &= !mask;
                self.count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Returns true if `ordinal` is present.
    pub fn contains(&self, ordinal: usize) -> bool {
        let (word, mask) = locate(ordinal);
        self.words.get(word).is_some_and(|bits| bits & mask != 0)
    }

    /// Removes every ordinal and releases the storage.
    pub fn clear(&mut self) {
        self.words.clear();
        self.count = 0;
    }

    /// Returns the ordinals in `0..=max` that are not in this list.
    pub fn invert(&self, max: usize) -> OrdinalList {
        let mut out = OrdinalList::new();
        out.set_ceiling(max + 1);
        for ordinal in 0..=max {
            if !self.contains(ordinal) {
                let (word, mask) = locate(ordinal);
                out.words[word] |= mask;
                out.count += 1;
            }
        }
        out
    }

    /// Returns the smallest ordinal `>= from`, if any.
    pub fn next_from(&self, from: usize) -> Option<usize> {
        let (mut word, _) = locate(from);
        if word >= self.words.len() {
            return None;
        }
        let mut bits = self.words[word] & (!0u64 << (from % 64));
        loop {
            if bits != 0 {
                return Some(word * 64 + bits.trailing_zeros() as usize);
            }
            word += 1;
            if word >= self.words.len() {
                return None;
            }
            bits = self.words[word];
        }
    }

    /// Iterates the ordinals in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * 64 + bit)
            })
        })
    }
}

#[inline]
fn locate(ordinal: usize) -> (usize, u64) {
    (ordinal / 64, 1u64 << (ordinal % 64))
}

impl FromIterator<usize> for OrdinalList {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut list = OrdinalList::new();
        for ordinal in iter {
            list.add(ordinal);
        }
        list
    }
}
