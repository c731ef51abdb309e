//! NMEA 0183 sentence parsing.
//!
//! Grounded in `gclue-nmea-utils.c`: a sentence matches a given type if it
//! starts with `$`, is at least seven characters long (two-character talker
//! ID plus a three-character type plus the leading `$`), and the three
//! characters after the talker ID equal the requested type.

use smallvec::SmallVec;

use crate::error::NmeaError;

/// NMEA sentences rarely carry more than a dozen comma-separated fields, so
/// a stack-allocated buffer avoids a heap allocation per parsed line.
type Fields<'a> = SmallVec<[&'a str; 16]>;

/// Checks whether `sentence` is of the given three-letter NMEA type (e.g.
/// `"GGA"`, `"RMC"`), independent of the two-letter talker ID prefix.
pub fn sentence_is(sentence: &str, kind: &str) -> bool {
    debug_assert_eq!(kind.len(), 3);
    let bytes = sentence.as_bytes();
    bytes.len() > 6 && bytes[0] == b'$' && sentence[3..].starts_with(kind)
}

/// Verify the trailing `*hh` checksum of a raw NMEA line (without the
/// `\r\n` line ending). The checksum is the XOR of every byte between `$`
/// and `*`.
pub fn verify_checksum(line: &str) -> Result<&str, NmeaError> {
    let body = line.strip_prefix('$').ok_or_else(|| NmeaError::Malformed(line.into()))?;
    let (payload, checksum_str) =
        body.split_once('*').ok_or_else(|| NmeaError::Malformed(line.into()))?;

    let expected = u8::from_str_radix(checksum_str.trim(), 16).map_err(|_| NmeaError::BadChecksum)?;
    let actual = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual != expected {
        return Err(NmeaError::BadChecksum);
    }

    Ok(payload)
}

/// Parsed `hhmmss.ss` NMEA timestamp, as microseconds since midnight UTC.
pub fn parse_timestamp(field: &str) -> Result<i64, NmeaError> {
    if field.len() < 6 {
        return Err(NmeaError::BadTimestamp);
    }
    let hours: i64 = field[0..2].parse().map_err(|_| NmeaError::BadTimestamp)?;
    let minutes: i64 = field[2..4].parse().map_err(|_| NmeaError::BadTimestamp)?;
    let seconds: f64 = field[4..].parse().map_err(|_| NmeaError::BadTimestamp)?;

    if hours > 23 || minutes > 59 || seconds >= 60.0 {
        return Err(NmeaError::BadTimestamp);
    }

    let micros = (hours * 3_600 + minutes * 60) * 1_000_000 + (seconds * 1_000_000.0) as i64;
    Ok(micros)
}

/// A GGA fix: position, altitude and fix quality.
#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    pub timestamp_us: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub fix_quality: u8,
    pub altitude: Option<f64>,
}

/// An RMC fix: position, speed and heading over ground.
#[derive(Debug, Clone, PartialEq)]
pub struct Rmc {
    pub timestamp_us: i64,
    pub active: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_knots: Option<f64>,
    pub heading: Option<f64>,
}

/// A parsed sentence the multiplexer cares about. Unrecognized sentence
/// types are silently dropped by the caller, same as the original source.
#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Gga(Gga),
    Rmc(Rmc),
}

/// Parse a single line (without the trailing `\r\n`) into a [`Sentence`], if
/// it is a type this daemon understands.
///
/// The `*hh` checksum is verified when present, but isn't required: some
/// receivers (and the NMEA standard itself) permit sending it without one.
pub fn parse_sentence(line: &str) -> Result<Option<Sentence>, NmeaError> {
    let payload = if line.contains('*') {
        verify_checksum(line)?
    } else {
        line.strip_prefix('$').ok_or_else(|| NmeaError::Malformed(line.into()))?
    };
    let fields: Fields = payload.split(',').collect();

    if sentence_is(line, "GGA") {
        return Ok(Some(Sentence::Gga(parse_gga(&fields)?)));
    }
    if sentence_is(line, "RMC") {
        return Ok(Some(Sentence::Rmc(parse_rmc(&fields)?)));
    }
    Ok(None)
}

fn parse_coordinate(value: &str, hemisphere: &str, positive: &str) -> Result<f64, NmeaError> {
    if value.is_empty() {
        return Err(NmeaError::Malformed(value.into()));
    }
    let dot = value.find('.').ok_or_else(|| NmeaError::Malformed(value.into()))?;
    let deg_len = dot - 2;
    let degrees: f64 =
        value[..deg_len].parse().map_err(|_| NmeaError::Malformed(value.into()))?;
    let minutes: f64 =
        value[deg_len..].parse().map_err(|_| NmeaError::Malformed(value.into()))?;
    let mut decimal = degrees + minutes / 60.0;
    if hemisphere != positive {
        decimal = -decimal;
    }
    Ok(decimal)
}

fn parse_gga(fields: &[&str]) -> Result<Gga, NmeaError> {
    let field = |i: usize| fields.get(i).copied().unwrap_or("");
    let timestamp_us = parse_timestamp(field(1))?;
    let latitude = parse_coordinate(field(2), field(3), "N")?;
    let longitude = parse_coordinate(field(4), field(5), "E")?;
    let fix_quality = field(6).parse().unwrap_or(0);
    let altitude = field(9).parse().ok();

    Ok(Gga { timestamp_us, latitude, longitude, fix_quality, altitude })
}

fn parse_rmc(fields: &[&str]) -> Result<Rmc, NmeaError> {
    let field = |i: usize| fields.get(i).copied().unwrap_or("");
    let timestamp_us = parse_timestamp(field(1))?;
    let active = field(2) == "A";
    let latitude = parse_coordinate(field(3), field(4), "N")?;
    let longitude = parse_coordinate(field(5), field(6), "E")?;
    let speed_knots = field(7).parse().ok();
    let heading = field(8).parse().ok();

    Ok(Rmc { timestamp_us, active, latitude, longitude, speed_knots, heading })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentence_is_matches_exact_type_after_talker() {
        assert!(sentence_is("$GPGGA,120000", "GGA"));
        assert!(sentence_is("$GNRMC,120000", "RMC"));
        assert!(!sentence_is("$GPGSV,1,1", "GGA"));
        assert!(!sentence_is("$G", "GGA"));
    }

    #[test]
    fn checksum_rejects_mismatch() {
        let line = "$GPGGA,bad*00";
        assert!(matches!(verify_checksum(line), Err(NmeaError::BadChecksum)));
    }

    #[test]
    fn checksum_accepts_valid() {
        // Manually computed XOR checksum for the payload "GPGGA,A".
        let payload = "GPGGA,A";
        let checksum = payload.bytes().fold(0u8, |acc, b| acc ^ b);
        let line = format!("${payload}*{checksum:02X}");
        assert_eq!(verify_checksum(&line).unwrap(), payload);
    }

    #[test]
    fn timestamp_out_of_range_is_rejected() {
        assert!(matches!(parse_timestamp("245960.00"), Err(NmeaError::BadTimestamp)));
        assert!(parse_timestamp("235959.99").is_ok());
    }

    #[test]
    fn parses_gga_sentence() {
        let payload = "GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,";
        let checksum = payload.bytes().fold(0u8, |acc, b| acc ^ b);
        let line = format!("${payload}*{checksum:02X}");

        let sentence = parse_sentence(&line).unwrap().unwrap();
        match sentence {
            Sentence::Gga(gga) => {
                assert!((gga.latitude - 48.1173).abs() < 1e-3);
                assert!((gga.longitude - 11.516_67).abs() < 1e-3);
                assert_eq!(gga.altitude, Some(545.4));
            },
            _ => panic!("expected GGA"),
        }
    }

    #[test]
    fn checksum_less_sentence_is_still_parsed() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,";
        let sentence = parse_sentence(line).unwrap().unwrap();
        assert!(matches!(sentence, Sentence::Gga(_)));
    }
}
