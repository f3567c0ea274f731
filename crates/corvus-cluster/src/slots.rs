//! Hash slots: CRC16 key mapping, ranges, and the slot ownership bitmap.
//!
//! The keyspace is partitioned into 16384 slots, Redis Cluster style. A
//! key's slot is CRC16 (XMODEM polynomial) of the key — or of its `{tag}`
//! when one is present — modulo 16384.

/// Total number of hash slots in the cluster.
pub const CLUSTER_SLOTS: u16 = 16384;

/// Bytes in the wire representation of a full slot bitmap.
pub const SLOT_BITMAP_BYTES: usize = CLUSTER_SLOTS as usize / 8;

/// CRC16 lookup table, CCITT polynomial, as used by Redis crc16.c.
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let idx = ((crc >> 8) ^ (byte as u16)) as usize;
        crc = (crc << 8) ^ CRC16_TABLE[idx];
    }
    crc
}

/// The hashable portion of a key: the content of the first non-empty
/// `{tag}` if present, the whole key otherwise.
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|&b| b == b'}') {
        Some(0) | None => key,
        Some(close) => &rest[..close],
    }
}

/// The slot a key hashes to, in `[0, 16384)`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % CLUSTER_SLOTS
}

/// An inclusive run of consecutive slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// Validating constructor for untrusted input.
    pub fn try_new(start: u16, end: u16) -> Result<Self, SlotParseError> {
        if start > end {
            return Err(SlotParseError::Inverted { start, end });
        }
        if end >= CLUSTER_SLOTS {
            return Err(SlotParseError::OutOfRange(end));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, slot: u16) -> bool {
        (self.start..=self.end).contains(&slot)
    }

    /// Number of slots in the range (always >= 1).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        (self.end - self.start) as u32 + 1
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Errors from parsing slot numbers, ranges, bitmaps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotParseError {
    #[error("slot {0} out of range (max {max})", max = CLUSTER_SLOTS - 1)]
    OutOfRange(u16),
    #[error("inverted slot range {start}-{end}")]
    Inverted { start: u16, end: u16 },
    #[error("invalid slot token '{0}'")]
    BadToken(String),
    #[error("slot ranges overlap at {0}")]
    Overlap(u16),
    #[error("truncated slot bitmap")]
    Truncated,
}

/// A set of slots as a fixed 16384-bit bitmap. Bit layout matches the wire:
/// byte `s / 8`, bit `s % 8` (LSB of byte 0 is slot 0).
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    bits: Box<[u8; SLOT_BITMAP_BYTES]>,
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBitmap {
    pub fn new() -> Self {
        Self {
            bits: Box::new([0u8; SLOT_BITMAP_BYTES]),
        }
    }

    /// Bitmap with every slot set.
    pub fn full() -> Self {
        Self {
            bits: Box::new([0xff; SLOT_BITMAP_BYTES]),
        }
    }

    pub fn set(&mut self, slot: u16) {
        self.bits[slot as usize / 8] |= 1 << (slot % 8);
    }

    pub fn clear(&mut self, slot: u16) {
        self.bits[slot as usize / 8] &= !(1 << (slot % 8));
    }

    pub fn test(&self, slot: u16) -> bool {
        self.bits[slot as usize / 8] & (1 << (slot % 8)) != 0
    }

    pub fn count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    pub fn union_with(&mut self, other: &SlotBitmap) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= b;
        }
    }

    /// Slots present in `self` and absent from `other`.
    pub fn difference(&self, other: &SlotBitmap) -> SlotBitmap {
        let mut out = SlotBitmap::new();
        for (i, (a, b)) in self.bits.iter().zip(other.bits.iter()).enumerate() {
            out.bits[i] = a & !b;
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..CLUSTER_SLOTS).filter(|&s| self.test(s))
    }

    /// Coalesces set slots into inclusive ranges, ascending.
    pub fn ranges(&self) -> Vec<SlotRange> {
        let mut out = Vec::new();
        let mut run: Option<(u16, u16)> = None;
        for slot in 0..CLUSTER_SLOTS {
            if self.test(slot) {
                run = match run {
                    Some((start, _)) => Some((start, slot)),
                    None => Some((slot, slot)),
                };
            } else if let Some((start, end)) = run.take() {
                out.push(SlotRange { start, end });
            }
        }
        if let Some((start, end)) = run {
            out.push(SlotRange { start, end });
        }
        out
    }

    /// Raw 2048-byte wire form.
    pub fn as_bytes(&self) -> &[u8; SLOT_BITMAP_BYTES] {
        &self.bits
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SlotParseError> {
        if bytes.len() != SLOT_BITMAP_BYTES {
            return Err(SlotParseError::Truncated);
        }
        let mut bits = Box::new([0u8; SLOT_BITMAP_BYTES]);
        bits.copy_from_slice(bytes);
        Ok(Self { bits })
    }

    /// Run-length wire encoding: `u16 pair-count`, then `(start, len)` u16
    /// pairs, little-endian. Compact for the common few-ranges case.
    pub fn encode_runs(&self) -> Vec<u8> {
        let ranges = self.ranges();
        let mut out = Vec::with_capacity(2 + ranges.len() * 4);
        out.extend_from_slice(&(ranges.len() as u16).to_le_bytes());
        for r in ranges {
            out.extend_from_slice(&r.start.to_le_bytes());
            out.extend_from_slice(&r.len().min(u16::MAX as u32).to_le_bytes()[..2]);
        }
        out
    }

    /// Decodes the run-length form. Empty runs (length 0) are tolerated and
    /// contribute nothing; overlapping or out-of-range runs are rejected.
    pub fn decode_runs(data: &[u8]) -> Result<Self, SlotParseError> {
        if data.len() < 2 {
            return Err(SlotParseError::Truncated);
        }
        let count = u16::from_le_bytes([data[0], data[1]]) as usize;
        if data.len() < 2 + count * 4 {
            return Err(SlotParseError::Truncated);
        }
        let mut map = SlotBitmap::new();
        for i in 0..count {
            let off = 2 + i * 4;
            let start = u16::from_le_bytes([data[off], data[off + 1]]);
            let len = u16::from_le_bytes([data[off + 2], data[off + 3]]) as u32;
            if len == 0 {
                continue;
            }
            let end = start as u32 + len - 1;
            if end >= CLUSTER_SLOTS as u32 {
                return Err(SlotParseError::OutOfRange(end.min(u16::MAX as u32) as u16));
            }
            for slot in start..=(end as u16) {
                if map.test(slot) {
                    return Err(SlotParseError::Overlap(slot));
                }
                map.set(slot);
            }
        }
        Ok(map)
    }

    /// Textual form used by nodes.conf and admin replies:
    /// space-separated slots and `start-end` runs, e.g. `"0-8000 9001"`.
    pub fn to_text(&self) -> String {
        self.ranges()
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parses the textual form. Blank input yields an empty bitmap;
    /// duplicate coverage is rejected.
    pub fn from_text(text: &str) -> Result<Self, SlotParseError> {
        let mut map = SlotBitmap::new();
        for token in text.split_whitespace() {
            let range = parse_slot_token(token)?;
            for slot in range.start..=range.end {
                if map.test(slot) {
                    return Err(SlotParseError::Overlap(slot));
                }
                map.set(slot);
            }
        }
        Ok(map)
    }
}

impl std::fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlotBitmap[{}]", self.to_text())
    }
}

impl FromIterator<u16> for SlotBitmap {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut map = SlotBitmap::new();
        for slot in iter {
            map.set(slot);
        }
        map
    }
}

/// Parses one slot token: `"42"`, `"100-200"`, or the brace range form
/// `"{100..200}"` accepted by CLUSTER ADDSLOTS.
pub fn parse_slot_token(token: &str) -> Result<SlotRange, SlotParseError> {
    let parse_one = |s: &str| -> Result<u16, SlotParseError> {
        let n: u32 = s
            .parse()
            .map_err(|_| SlotParseError::BadToken(token.to_string()))?;
        if n >= CLUSTER_SLOTS as u32 {
            return Err(SlotParseError::OutOfRange(n.min(u16::MAX as u32) as u16));
        }
        Ok(n as u16)
    };

    if let Some(inner) = token.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
        let (a, b) = inner
            .split_once("..")
            .ok_or_else(|| SlotParseError::BadToken(token.to_string()))?;
        return SlotRange::try_new(parse_one(a)?, parse_one(b)?);
    }
    if let Some((a, b)) = token.split_once('-') {
        return SlotRange::try_new(parse_one(a)?, parse_one(b)?);
    }
    let slot = parse_one(token)?;
    SlotRange::try_new(slot, slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verified against Redis CLUSTER KEYSLOT.
    #[test]
    fn crc16_matches_redis() {
        assert_eq!(key_slot(b""), 0);
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        assert_eq!(key_slot(b"hello"), 866);
        assert_eq!(key_slot(b"123456789"), 12739);
    }

    #[test]
    fn hash_tag_rules() {
        assert_eq!(key_slot(b"user:{123}:profile"), key_slot(b"123"));
        assert_eq!(key_slot(b"{user}:a"), key_slot(b"user"));
        // Empty tag and unterminated tag hash the whole key.
        assert_eq!(key_slot(b"foo{}bar"), key_slot(b"foo{}bar"));
        assert_eq!(key_slot(b"foo{bar"), key_slot(b"foo{bar"));
        // Only the first tag counts.
        assert_eq!(key_slot(b"{a}{b}"), key_slot(b"a"));
    }

    #[test]
    fn bitmap_set_test_clear() {
        let mut map = SlotBitmap::new();
        assert!(map.is_empty());
        map.set(0);
        map.set(16383);
        map.set(4310);
        assert!(map.test(0) && map.test(16383) && map.test(4310));
        assert!(!map.test(1));
        assert_eq!(map.count(), 3);
        map.clear(4310);
        assert!(!map.test(4310));
        assert_eq!(map.count(), 2);
    }

    #[test]
    fn ranges_coalesce() {
        let map: SlotBitmap = [0u16, 1, 2, 10, 11, 16383].into_iter().collect();
        assert_eq!(
            map.ranges(),
            vec![
                SlotRange { start: 0, end: 2 },
                SlotRange { start: 10, end: 11 },
                SlotRange {
                    start: 16383,
                    end: 16383
                },
            ]
        );
    }

    #[test]
    fn run_encoding_roundtrip() {
        let map: SlotBitmap = (0u16..8001).chain(9001..9002).collect();
        let encoded = map.encode_runs();
        let decoded = SlotBitmap::decode_runs(&encoded).unwrap();
        assert_eq!(map, decoded);

        let empty = SlotBitmap::new();
        assert_eq!(
            SlotBitmap::decode_runs(&empty.encode_runs()).unwrap(),
            empty
        );

        let full = SlotBitmap::full();
        assert_eq!(SlotBitmap::decode_runs(&full.encode_runs()).unwrap(), full);
    }

    #[test]
    fn run_decoding_tolerates_empty_runs() {
        // one pair: start=5, len=0
        let mut data = 1u16.to_le_bytes().to_vec();
        data.extend_from_slice(&5u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        let map = SlotBitmap::decode_runs(&data).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn run_decoding_rejects_overlap() {
        // pairs (0, 10) and (5, 10) overlap at slot 5
        let mut data = 2u16.to_le_bytes().to_vec();
        for (start, len) in [(0u16, 10u16), (5, 10)] {
            data.extend_from_slice(&start.to_le_bytes());
            data.extend_from_slice(&len.to_le_bytes());
        }
        assert_eq!(
            SlotBitmap::decode_runs(&data),
            Err(SlotParseError::Overlap(5))
        );
    }

    #[test]
    fn run_decoding_rejects_out_of_range() {
        let mut data = 1u16.to_le_bytes().to_vec();
        data.extend_from_slice(&16380u16.to_le_bytes());
        data.extend_from_slice(&10u16.to_le_bytes());
        assert!(SlotBitmap::decode_runs(&data).is_err());
    }

    #[test]
    fn text_roundtrip() {
        let map: SlotBitmap = [0u16, 1, 2, 100, 200, 201].into_iter().collect();
        let text = map.to_text();
        assert_eq!(text, "0-2 100 200-201");
        assert_eq!(SlotBitmap::from_text(&text).unwrap(), map);
        assert_eq!(SlotBitmap::from_text("  0-2  100 200-201 ").unwrap(), map);
        assert!(SlotBitmap::from_text("").unwrap().is_empty());
    }

    #[test]
    fn text_rejects_duplicates() {
        assert_eq!(
            SlotBitmap::from_text("0-10 5"),
            Err(SlotParseError::Overlap(5))
        );
    }

    #[test]
    fn slot_token_forms() {
        assert_eq!(
            parse_slot_token("42").unwrap(),
            SlotRange { start: 42, end: 42 }
        );
        assert_eq!(
            parse_slot_token("100-200").unwrap(),
            SlotRange {
                start: 100,
                end: 200
            }
        );
        assert_eq!(
            parse_slot_token("{0..8000}").unwrap(),
            SlotRange {
                start: 0,
                end: 8000
            }
        );
        assert!(parse_slot_token("16384").is_err());
        assert!(parse_slot_token("20-10").is_err());
        assert!(parse_slot_token("abc").is_err());
    }

    #[test]
    fn raw_bytes_roundtrip() {
        let map: SlotBitmap = [7u16, 8, 9000].into_iter().collect();
        let restored = SlotBitmap::from_bytes(map.as_bytes()).unwrap();
        assert_eq!(map, restored);
        assert!(SlotBitmap::from_bytes(&[0u8; 100]).is_err());
    }

    #[test]
    fn difference_and_union() {
        let a: SlotBitmap = [1u16, 2, 3].into_iter().collect();
        let b: SlotBitmap = [2u16, 3, 4].into_iter().collect();
        let d = a.difference(&b);
        assert_eq!(d.iter().collect::<Vec<_>>(), vec![1]);

        let mut u = a.clone();
        u.union_with(&b);
        assert_eq!(u.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }
}
