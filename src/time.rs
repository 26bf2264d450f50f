//! CF-convention time decoding (`"hours since 1979-02-01 00:00:00"`).

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

/// Parsed `"<unit> since <epoch>"` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfUnits {
    pub step_seconds: i64,
    pub epoch: DateTime<Utc>,
}

impl CfUnits {
    pub fn parse(units: &str) -> Result<Self> {
        let (unit, epoch) = units
            .split_once(" since ")
            .ok_or_else(|| anyhow!("time units '{units}' are not '<unit> since <epoch>'"))?;
        let step_seconds = match unit.trim().to_ascii_lowercase().as_str() {
            "seconds" | "second" | "secs" | "s" => 1,
            "minutes" | "minute" | "mins" | "min" => 60,
            "hours" | "hour" | "hrs" | "h" => 3600,
            "days" | "day" | "d" => 86_400,
            other => bail!("unsupported time unit '{other}'"),
        };
        let epoch = parse_epoch(epoch.trim()).with_context(|| format!("time units '{units}'"))?;
        Ok(Self {
            step_seconds,
            epoch,
        })
    }

    pub fn decode(&self, value: f64) -> DateTime<Utc> {
        let millis = (value * self.step_seconds as f64 * 1000.0).round() as i64;
        self.epoch + Duration::milliseconds(millis)
    }
}

fn parse_epoch(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim_end_matches('Z').trim_end_matches("+00:00").trim();
    let s = s.strip_suffix(" UTC").unwrap_or(s);
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc());
        }
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("unrecognized epoch '{s}'"))?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
}

/// Decodes raw time coordinate values using CF `units`.
pub fn decode_cf_times(values: &[f64], units: &str) -> Result<Vec<DateTime<Utc>>> {
    let units = CfUnits::parse(units)?;
    Ok(values.iter().map(|&v| units.decode(v)).collect())
}

/// Timestamp format used in CSV outputs.
pub const CSV_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn parse_csv_time(s: &str) -> Result<DateTime<Utc>> {
    parse_epoch(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_hours_since() {
        let units = CfUnits::parse("hours since 1979-02-01 00:00:00").unwrap();
        assert_eq!(units.step_seconds, 3600);
        assert_eq!(
            units.decode(25.0),
            Utc.with_ymd_and_hms(1979, 2, 2, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_date_only_epoch() {
        let times = decode_cf_times(&[0.0, 1.5], "days since 2000-01-01").unwrap();
        assert_eq!(times[0], Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(times[1], Utc.with_ymd_and_hms(2000, 1, 2, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_iso_epoch() {
        let units = CfUnits::parse("seconds since 1970-01-01T00:00:00Z").unwrap();
        assert_eq!(units.decode(3600.0).timestamp(), 3600);
    }

    #[test]
    fn test_rejects_bad_units() {
        assert!(CfUnits::parse("fortnights since 2000-01-01").is_err());
        assert!(CfUnits::parse("hours").is_err());
    }

    #[test]
    fn test_parse_csv_time() {
        assert_eq!(
            parse_csv_time("2020-10-01 13:00:00").unwrap(),
            Utc.with_ymd_and_hms(2020, 10, 1, 13, 0, 0).unwrap()
        );
    }
}
