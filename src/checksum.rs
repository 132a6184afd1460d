use std::fmt::{Debug, Formatter};
use crc::{Crc, CRC_32_ISO_HDLC};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ProtocolError;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Wire type codes for the per-message checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ChecksumKind {
    None = 0x00,
    Crc32 = 0x01,
    Farmhash32 = 0x02,
}

impl ChecksumKind {
    /// number of checksum bytes each fragment of this kind carries
    pub fn value_len(&self) -> usize {
        match self {
            ChecksumKind::None => 0,
            ChecksumKind::Crc32 | ChecksumKind::Farmhash32 => 4,
        }
    }

    pub fn deser(raw: u8) -> Result<ChecksumKind, ProtocolError> {
        ChecksumKind::try_from(raw).map_err(|_| ProtocolError::UnknownChecksumKind(raw))
    }
}

/// Rolling digest over the chunk bytes of one message. A single instance
///  lives for the whole message: each fragment's checksum field is the
///  digest state after that fragment's chunks, i.e. implicitly seeded with
///  all previous fragments.
pub enum Checksum {
    None,
    Crc32(crc::Digest<'static, u32>),
    /// FarmHash has no incremental API, so this variant accumulates the
    ///  chunk bytes and hashes on demand.
    Farmhash32(Vec<u8>),
}

impl Checksum {
    pub fn new(kind: ChecksumKind) -> Checksum {
        match kind {
            ChecksumKind::None => Checksum::None,
            ChecksumKind::Crc32 => Checksum::Crc32(CRC32.digest()),
            ChecksumKind::Farmhash32 => Checksum::Farmhash32(Vec::new()),
        }
    }

    pub fn kind(&self) -> ChecksumKind {
        match self {
            Checksum::None => ChecksumKind::None,
            Checksum::Crc32(_) => ChecksumKind::Crc32,
            Checksum::Farmhash32(_) => ChecksumKind::Farmhash32,
        }
    }

    pub fn value_len(&self) -> usize {
        self.kind().value_len()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Checksum::None => {}
            Checksum::Crc32(digest) => digest.update(bytes),
            Checksum::Farmhash32(acc) => acc.extend_from_slice(bytes),
        }
    }

    fn value(&self) -> Option<u32> {
        match self {
            Checksum::None => None,
            Checksum::Crc32(digest) => Some(digest.clone().finalize()),
            Checksum::Farmhash32(acc) => Some(farmhash::hash32(acc)),
        }
    }

    /// big-endian checksum bytes for the fragment being flushed; `out` must
    ///  have exactly `value_len()` bytes
    pub fn write_value(&self, out: &mut [u8]) {
        match self.value() {
            None => assert!(out.is_empty()),
            Some(value) => out.copy_from_slice(&value.to_be_bytes()),
        }
    }

    /// compares the digest state against the checksum bytes a fragment declared
    pub fn matches(&self, claimed: &[u8]) -> bool {
        match self.value() {
            None => claimed.is_empty(),
            Some(value) => claimed == value.to_be_bytes(),
        }
    }
}

impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.value() {
            None => write!(f, "Checksum(None)"),
            Some(value) => write!(f, "Checksum({:?}, {:08x})", self.kind(), value),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::none(0x00, Ok(ChecksumKind::None), 0)]
    #[case::crc32(0x01, Ok(ChecksumKind::Crc32), 4)]
    #[case::farmhash(0x02, Ok(ChecksumKind::Farmhash32), 4)]
    #[case::unknown(0x03, Err(ProtocolError::UnknownChecksumKind(0x03)), 0)]
    fn test_kind_deser(#[case] raw: u8, #[case] expected: Result<ChecksumKind, ProtocolError>, #[case] value_len: usize) {
        let actual = ChecksumKind::deser(raw);
        assert_eq!(actual, expected);
        if let Ok(kind) = actual {
            assert_eq!(kind.value_len(), value_len);
            assert_eq!(u8::from(kind), raw);
        }
    }

    #[test]
    fn test_crc32_known_value() {
        let mut checksum = Checksum::new(ChecksumKind::Crc32);
        checksum.update(b"123456789");
        assert_eq!(checksum.value(), Some(0xcbf43926));
    }

    #[rstest]
    #[case::crc32(ChecksumKind::Crc32)]
    #[case::farmhash(ChecksumKind::Farmhash32)]
    fn test_rolling_equals_oneshot(#[case] kind: ChecksumKind) {
        let mut rolling = Checksum::new(kind);
        rolling.update(b"hello ");
        rolling.update(b"");
        rolling.update(b"world");

        let mut oneshot = Checksum::new(kind);
        oneshot.update(b"hello world");

        assert_eq!(rolling.value(), oneshot.value());
    }

    #[rstest]
    #[case::crc32(ChecksumKind::Crc32)]
    #[case::farmhash(ChecksumKind::Farmhash32)]
    fn test_value_progresses_across_fragments(#[case] kind: ChecksumKind) {
        let mut checksum = Checksum::new(kind);
        checksum.update(b"fragment one");
        let first = checksum.value();

        checksum.update(b"fragment two");
        assert_ne!(checksum.value(), first);
    }

    #[rstest]
    #[case::none(ChecksumKind::None)]
    #[case::crc32(ChecksumKind::Crc32)]
    #[case::farmhash(ChecksumKind::Farmhash32)]
    fn test_write_value_matches(#[case] kind: ChecksumKind) {
        let mut checksum = Checksum::new(kind);
        checksum.update(b"payload");

        let mut claimed = vec![0u8; checksum.value_len()];
        checksum.write_value(&mut claimed);
        assert!(checksum.matches(&claimed));
    }

    #[test]
    fn test_mismatch_detected() {
        let mut checksum = Checksum::new(ChecksumKind::Crc32);
        checksum.update(b"payload");

        let mut claimed = vec![0u8; 4];
        checksum.write_value(&mut claimed);
        claimed[2] ^= 0x01;
        assert!(!checksum.matches(&claimed));
    }

    #[test]
    fn test_none_matches_empty_only() {
        let checksum = Checksum::new(ChecksumKind::None);
        assert!(checksum.matches(b""));
        assert!(!checksum.matches(&[0, 0, 0, 0]));
    }
}
