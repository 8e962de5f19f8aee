use crate::PageEntryBits;

/// One 4 KiB page-table node.
///
/// Stored as 512 64-bit words. 8-byte entry formats use one word per
/// entry; the 4-byte legacy format packs two entries per word, the even
/// index in the low half (matching the little-endian `[u32; 1024]` layout
/// the CPU expects).
#[repr(C, align(4096))]
pub struct PageTable {
    words: [u64; 512],
}

impl PageTable {
    /// Number of entries for the given entry `width` in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(width: u64) -> usize {
        if width == 4 { 1024 } else { 512 }
    }

    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { words: [0; 512] }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.words = [0; 512];
    }

    /// Read entry `index` of a table with `width`-byte entries.
    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize, width: u64) -> PageEntryBits {
        let raw = if width == 4 {
            let word = self.words[index / 2];
            if index.is_multiple_of(2) {
                word & 0xFFFF_FFFF
            } else {
                word >> 32
            }
        } else {
            self.words[index]
        };
        PageEntryBits::from_raw(raw, width)
    }

    /// Write entry `index` of a table with `width`-byte entries.
    #[inline]
    pub const fn set(&mut self, index: usize, width: u64, entry: PageEntryBits) {
        let raw = entry.to_raw(width);
        if width == 4 {
            let word = &mut self.words[index / 2];
            *word = if index.is_multiple_of(2) {
                (*word & 0xFFFF_FFFF_0000_0000) | raw
            } else {
                (*word & 0xFFFF_FFFF) | (raw << 32)
            };
        } else {
            self.words[index] = raw;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }
}
