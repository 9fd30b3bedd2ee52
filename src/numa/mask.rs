//! Node bitmasks in the layout the memory-policy syscalls expect.

use libc::c_ulong;

const WORD_BITS: usize = c_ulong::BITS as usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeMask {
    words: Vec<c_ulong>,
}

impl NodeMask {
    /// Empty mask able to name every node up to `max_node`.
    ///
    /// One spare bit is reserved because the kernel reads `maxnode - 1` bits.
    pub fn for_max_node(max_node: u32) -> Self {
        let bits = max_node as usize + 2;
        Self {
            words: vec![0; bits.div_ceil(WORD_BITS)],
        }
    }

    /// Mask with exactly `node` set.
    pub fn single(max_node: u32, node: u32) -> Self {
        let mut mask = Self::for_max_node(max_node);
        mask.set(node);
        mask
    }

    /// Every bit set ("any node").
    pub fn all(max_node: u32) -> Self {
        let mut mask = Self::for_max_node(max_node);
        mask.words.fill(c_ulong::MAX);
        mask
    }

    pub fn set(&mut self, node: u32) {
        let node = node as usize;
        let bit: c_ulong = 1 << (node % WORD_BITS);
        if let Some(word) = self.words.get_mut(node / WORD_BITS) {
            *word |= bit;
        }
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    pub fn is_set(&self, node: u32) -> bool {
        let node = node as usize;
        let bit: c_ulong = 1 << (node % WORD_BITS);
        self.words
            .get(node / WORD_BITS)
            .is_some_and(|word| word & bit != 0)
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|word| word.count_ones()).sum()
    }

    /// Capacity in bits, passed as the syscalls' `maxnode`.
    pub fn max_nodes(&self) -> c_ulong {
        (self.words.len() * WORD_BITS) as c_ulong
    }

    pub fn as_ptr(&self) -> *const c_ulong {
        self.words.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut c_ulong {
        self.words.as_mut_ptr()
    }
}
