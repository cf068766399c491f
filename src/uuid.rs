//! Canonical-text ↔ 16-byte conversion for the `--vfio-vf-token` UUID.
//!
//! Mirrors `uuid.c`'s packed field layout (big-endian `time_low`, `time_mid`,
//! `time_hi_and_version`, `clock_seq`, then six raw node bytes) without
//! depending on a general-purpose UUID crate, since the only operation this
//! program needs is parse/format of that one fixed layout.

use byteorder::{BigEndian, ByteOrder};

pub const UUID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Uuid(pub [u8; UUID_LEN]);

impl Uuid {
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Parses a canonical `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` string.
    pub fn parse(input: &str) -> Option<Uuid> {
        let bytes = input.as_bytes();
        if bytes.len() != 36 {
            return None;
        }
        for (i, b) in bytes.iter().enumerate() {
            match i {
                8 | 13 | 18 | 23 => {
                    if *b != b'-' {
                        return None;
                    }
                }
                _ => {
                    if !(*b as char).is_ascii_hexdigit() {
                        return None;
                    }
                }
            }
        }

        let time_low = u32::from_str_radix(&input[0..8], 16).ok()?;
        let time_mid = u16::from_str_radix(&input[9..13], 16).ok()?;
        let time_hi_and_version = u16::from_str_radix(&input[14..18], 16).ok()?;
        let clock_seq = u16::from_str_radix(&input[19..23], 16).ok()?;

        let mut node = [0u8; 6];
        for (i, slot) in node.iter_mut().enumerate() {
            let start = 24 + i * 2;
            *slot = u8::from_str_radix(&input[start..start + 2], 16).ok()?;
        }

        let mut out = [0u8; UUID_LEN];
        BigEndian::write_u32(&mut out[0..4], time_low);
        BigEndian::write_u16(&mut out[4..6], time_mid);
        BigEndian::write_u16(&mut out[6..8], time_hi_and_version);
        BigEndian::write_u16(&mut out[8..10], clock_seq);
        out[10..16].copy_from_slice(&node);

        Some(Uuid(out))
    }

    pub fn to_canonical_string(&self) -> String {
        let time_low = BigEndian::read_u32(&self.0[0..4]);
        let time_mid = BigEndian::read_u16(&self.0[4..6]);
        let time_hi_and_version = BigEndian::read_u16(&self.0[6..8]);
        let clock_seq = BigEndian::read_u16(&self.0[8..10]);
        let node = &self.0[10..16];

        format!(
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq >> 8,
            clock_seq & 0xff,
            node[0],
            node[1],
            node[2],
            node[3],
            node[4],
            node[5],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrips_through_canonical_string() {
        let input = "12345678-9abc-def0-1234-56789abcdef0";
        let uuid = Uuid::parse(input).expect("valid uuid");
        assert_eq!(uuid.to_canonical_string(), input);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Uuid::parse("too-short").is_none());
    }

    #[test]
    fn rejects_misplaced_hyphens() {
        let input = "1234567-89abcdef0-1234-56789abcdef0";
        assert!(Uuid::parse(input).is_none());
    }

    #[test]
    fn rejects_non_hex_digit() {
        let input = "1234567g-9abc-def0-1234-56789abcdef0";
        assert!(Uuid::parse(input).is_none());
    }

    #[test]
    fn default_is_null() {
        assert!(Uuid::default().is_null());
    }
}
