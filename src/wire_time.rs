use chrono::NaiveDateTime;
use thiserror::Error;

/// Timestamps travel as fixed 20-byte ascii `YYYYDDD HH:MM:SS.MMM` (year + ordinal day,
///  millisecond resolution).
pub const WIRE_TIME_LEN: usize = 20;

const WIRE_TIME_FORMAT: &str = "%Y%j %H:%M:%S%.3f";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireTimeError {
    #[error("wire timestamp is not ascii: {0:?}")]
    NotAscii(Vec<u8>),
    #[error("malformed wire timestamp {0:?}")]
    Malformed(String),
}

pub fn parse_wire_time(raw: &[u8]) -> Result<NaiveDateTime, WireTimeError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| WireTimeError::NotAscii(raw.to_vec()))?;
    let text = text.trim_end_matches(['\0', ' ']);
    NaiveDateTime::parse_from_str(text, WIRE_TIME_FORMAT)
        .map_err(|_| WireTimeError::Malformed(text.to_string()))
}

pub fn format_wire_time(time: NaiveDateTime) -> [u8; WIRE_TIME_LEN] {
    let text = time.format(WIRE_TIME_FORMAT).to_string();
    let mut raw = [0u8; WIRE_TIME_LEN];
    let len = text.len().min(WIRE_TIME_LEN);
    raw[..len].copy_from_slice(&text.as_bytes()[..len]);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};
    use rstest::rstest;

    #[rstest]
    #[case::plain("2025032 10:30:00.000", 2025, 32, (10, 30, 0, 0))]
    #[case::with_millis("2024366 23:59:59.999", 2024, 366, (23, 59, 59, 999))]
    #[case::first_day("1999001 00:00:00.001", 1999, 1, (0, 0, 0, 1))]
    fn test_parse(#[case] text: &str, #[case] year: i32, #[case] ordinal: u32, #[case] hmsm: (u32, u32, u32, u32)) {
        let parsed = parse_wire_time(text.as_bytes()).unwrap();
        let expected = NaiveDate::from_yo_opt(year, ordinal).unwrap()
            .and_hms_milli_opt(hmsm.0, hmsm.1, hmsm.2, hmsm.3).unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.time().nanosecond() / 1_000_000, hmsm.3);
    }

    #[rstest]
    #[case::empty("")]
    #[case::truncated("2025032 10:30")]
    #[case::bad_ordinal("2025999 10:30:00.000")]
    #[case::not_a_time("garbage garbage!!")]
    fn test_parse_malformed(#[case] text: &str) {
        assert!(matches!(parse_wire_time(text.as_bytes()), Err(WireTimeError::Malformed(_))));
    }

    #[test]
    fn test_parse_non_ascii() {
        assert!(matches!(parse_wire_time(&[0xff, 0xfe, 0x00]), Err(WireTimeError::NotAscii(_))));
    }

    #[test]
    fn test_round_trip() {
        let time = NaiveDate::from_yo_opt(2025, 217).unwrap()
            .and_hms_milli_opt(13, 7, 42, 123).unwrap();

        let raw = format_wire_time(time);
        assert_eq!(&raw, b"2025217 13:07:42.123");
        assert_eq!(parse_wire_time(&raw).unwrap(), time);
    }
}
