pub mod bins;
pub mod keyed;
pub mod lock;
pub mod process;

pub mod time {
    use anyhow::{Context, Result, anyhow};
    use time::{
        OffsetDateTime, UtcOffset, format_description::well_known::Rfc3339, macros::format_description,
    };

    #[inline]
    pub fn current_epoch() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn fmt_utc(ts: u64) -> Result<String> {
        let ts = i64::try_from(ts).map_err(|_| anyhow!("unix timestamp doesn't fit into i64"))?;
        let dt = OffsetDateTime::from_unix_timestamp(ts)?;
        Ok(dt.format(&Rfc3339)?) // "YYYY-MM-DDTHH:MM:SSZ"
    }

    /// The `YYYY-MM-DD HH:MM:SS` form restic expects for `backup --time`.
    pub fn fmt_restic_time(ts: u64) -> Result<String> {
        let ts = i64::try_from(ts).map_err(|_| anyhow!("unix timestamp doesn't fit into i64"))?;
        let dt = OffsetDateTime::from_unix_timestamp(ts)?;
        let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        Ok(dt.format(&fmt)?)
    }

    /// Parse a restic snapshot `time` field (RFC3339, any offset) to epoch
    /// seconds.
    pub fn parse_rfc3339_to_unix(s: &str) -> Result<u64> {
        let dt = OffsetDateTime::parse(s, &Rfc3339)
            .with_context(|| format!("invalid RFC3339 datetime: {s}"))?
            .to_offset(UtcOffset::UTC);

        let ts = dt.unix_timestamp();
        u64::try_from(ts).map_err(|_| anyhow!("timestamp is negative: {}", ts))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn epoch_nonzero() {
            assert!(current_epoch() > 1_600_000_000);
        }

        #[test]
        fn restic_time_shape() {
            assert_eq!(fmt_restic_time(1_700_000_000).unwrap(), "2023-11-14 22:13:20");
        }

        #[test]
        fn rfc3339_roundtrip_with_offset() {
            let ts = parse_rfc3339_to_unix("2023-11-14T23:13:20+01:00").unwrap();
            assert_eq!(ts, 1_700_000_000);
            assert_eq!(fmt_utc(ts).unwrap(), "2023-11-14T22:13:20Z");
        }

        #[test]
        fn rfc3339_rejects_garbage() {
            assert!(parse_rfc3339_to_unix("yesterday").is_err());
        }
    }
}
