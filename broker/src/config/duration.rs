//! ISO-8601 duration parsing for delivery backoff delays
//!
//! Supports the designator form `PnDTnHnMnS` (plus weeks) with an optional
//! fractional seconds component. Calendar units (years, months) are rejected:
//! a retry delay must map to an exact number of seconds.

use std::time::Duration;

const SECS_PER_MINUTE: f64 = 60.0;
const SECS_PER_HOUR: f64 = 3600.0;
const SECS_PER_DAY: f64 = 86_400.0;
const SECS_PER_WEEK: f64 = 604_800.0;

/// Parse an ISO-8601 duration such as `PT1S`, `PT1.5S`, `PT2M`, `P1DT12H`.
pub fn parse_iso8601(input: &str) -> Result<Duration, String> {
    let rest = input
        .strip_prefix('P')
        .ok_or_else(|| format!("not an ISO-8601 duration: {input:?}"))?;
    if rest.is_empty() {
        return Err(format!("not an ISO-8601 duration: {input:?}"));
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    if let Some(t) = time_part {
        if t.is_empty() {
            return Err(format!("empty time component in duration: {input:?}"));
        }
    }

    let mut secs = 0.0;
    secs += parse_components(date_part, &[('W', SECS_PER_WEEK), ('D', SECS_PER_DAY)], input)?;
    if let Some(t) = time_part {
        secs += parse_components(
            t,
            [('H', SECS_PER_HOUR), ('M', SECS_PER_MINUTE), ('S', 1.0)].as_slice(),
            input,
        )?;
    }

    Ok(Duration::from_secs_f64(secs))
}

fn parse_components(part: &str, units: &[(char, f64)], input: &str) -> Result<f64, String> {
    let mut secs = 0.0;
    let mut number = String::new();
    let mut allowed = units;

    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }

        // Units must appear in order, each at most once.
        let position = allowed
            .iter()
            .position(|(unit, _)| *unit == c)
            .ok_or_else(|| format!("unexpected designator {c:?} in duration: {input:?}"))?;
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number {number:?} in duration: {input:?}"))?;
        secs += value * allowed[position].1;
        allowed = &allowed[position + 1..];
        number.clear();
    }

    if !number.is_empty() {
        return Err(format!("trailing number without designator in duration: {input:?}"));
    }
    Ok(secs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds() {
        assert_eq!(parse_iso8601("PT1S").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_iso8601("PT0S").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parses_fractional_seconds() {
        assert_eq!(parse_iso8601("PT0.5S").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_iso8601("PT1.25S").unwrap(), Duration::from_millis(1250));
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_iso8601("PT2M").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_iso8601("PT1H30M").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_iso8601("P1DT12H").unwrap(),
            Duration::from_secs(36 * 3600)
        );
        assert_eq!(parse_iso8601("P2W").unwrap(), Duration::from_secs(1_209_600));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_iso8601("1s").is_err());
        assert!(parse_iso8601("P").is_err());
        assert!(parse_iso8601("PT").is_err());
        assert!(parse_iso8601("PTS").is_err());
        assert!(parse_iso8601("PT5").is_err());
        assert!(parse_iso8601("PT1X").is_err());
        assert!(parse_iso8601("").is_err());
    }

    #[test]
    fn rejects_out_of_order_designators() {
        assert!(parse_iso8601("PT1S2M").is_err());
    }

    #[test]
    fn rejects_calendar_units() {
        assert!(parse_iso8601("P1Y").is_err());
        assert!(parse_iso8601("P3M").is_err());
    }
}
