//! Datetime parsing at the query edge.

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset, format_description};

use crate::{Error, Result};

/// Parses a datetime string into a Unix timestamp.
///
/// Accepts RFC 3339 (`2017-03-30T21:20:30Z`), or a bare
/// `YYYY-MM-DD HH:MM:SS` which is interpreted in the given offset.
/// Parse failures come back as [`Error::InvalidDate`]; nothing panics
/// on user input.
pub fn parse_datetime(input: &str, offset: UtcOffset) -> Result<i64> {
    if let Ok(parsed) = OffsetDateTime::parse(input, &Rfc3339) {
        return Ok(parsed.unix_timestamp());
    }

    let format = format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
        .map_err(|err| Error::InvalidDate(err.to_string()))?;

    match PrimitiveDateTime::parse(input, &format) {
        Ok(parsed) => Ok(parsed.assume_offset(offset).unix_timestamp()),
        Err(err) => Err(Error::InvalidDate(format!("{input}: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339() {
        let ts = parse_datetime("1970-01-01T00:00:10Z", UtcOffset::UTC).unwrap();
        assert_eq!(ts, 10);
    }

    #[test]
    fn parses_bare_datetime_in_offset() {
        let utc = parse_datetime("1970-01-02 00:00:00", UtcOffset::UTC).unwrap();
        assert_eq!(utc, 86_400);

        let plus_two = UtcOffset::from_hms(2, 0, 0).unwrap();
        let shifted = parse_datetime("1970-01-02 00:00:00", plus_two).unwrap();
        assert_eq!(shifted, 86_400 - 2 * 3600);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_datetime("not a date", UtcOffset::UTC).is_err());
        assert!(parse_datetime("1970-13-40 99:00:00", UtcOffset::UTC).is_err());
    }
}
