//! CRC-CCITT (x^16 + x^12 + x^5 + 1) as used by SDO block transfers.
//!
//! Seed 0, MSB first, no final xor. The accumulator is fed with the payload
//! bytes of each accepted block segment and knows nothing about sequence
//! numbers or windows.

const POLY: u16 = 0x1021;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Extend `crc` over `data`.
pub fn update(crc: u16, data: &[u8]) -> u16 {
    data.iter().fold(crc, |crc, &byte| {
        let idx = ((crc >> 8) as u8 ^ byte) as usize;
        (crc << 8) ^ TABLE[idx]
    })
}

/// CRC of a complete buffer.
pub fn checksum(data: &[u8]) -> u16 {
    update(0, data)
}

/// Running CRC that tracks how many payload bytes it has covered.
///
/// Retransmitted segments start below `covered` and are skipped, so a
/// window repeat never counts the same bytes twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc {
    value: u16,
    covered: usize,
}

impl Crc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `data` located at payload offset `offset`.
    pub fn feed(&mut self, offset: usize, data: &[u8]) {
        if offset == self.covered {
            self.value = update(self.value, data);
            self.covered += data.len();
        }
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn covered(&self) -> usize {
        self.covered
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_head_matches_ccitt() {
        assert_eq!(&TABLE[..4], &[0x0000, 0x1021, 0x2042, 0x3063]);
        assert_eq!(TABLE[255], 0x1EF0);
    }

    #[test]
    fn check_value() {
        assert_eq!(checksum(b"123456789"), 0x31C3);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn incremental_equals_one_shot() {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut crc = Crc::new();
        for (i, chunk) in data.chunks(7).enumerate() {
            crc.feed(i * 7, chunk);
        }
        assert_eq!(crc.value(), checksum(&data));
        assert_eq!(crc.covered(), data.len());
    }

    #[test]
    fn repeated_segments_are_ignored() {
        let mut crc = Crc::new();
        crc.feed(0, b"abcdefg");
        crc.feed(7, b"hijklmn");
        // window repeat from offset 7
        crc.feed(7, b"hijklmn");
        crc.feed(14, b"op");
        assert_eq!(crc.value(), checksum(b"abcdefghijklmnop"));
    }
}
