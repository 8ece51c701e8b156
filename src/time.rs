use chrono::{DateTime, SecondsFormat, Utc};

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `20261019-134501`, used for backup directory names.
pub fn dir_stamp(at: &DateTime<Utc>) -> String {
    at.format("%Y%m%d-%H%M%S").to_string()
}

/// `20261019_134501`, used for report file names.
pub fn file_stamp(at: &DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Normalizes a legacy timestamp to RFC 3339, falling back to now.
pub fn normalize_or_now(raw: Option<&str>) -> String {
    raw.and_then(|value| DateTime::parse_from_rfc3339(value.trim()).ok())
        .map(|dt| {
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        })
        .unwrap_or_else(now_rfc3339)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stamps_are_sortable() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 13, 45, 1).unwrap();
        assert_eq!(dir_stamp(&at), "20261019-134501");
        assert_eq!(file_stamp(&at), "20261019_134501");
    }

    #[test]
    fn normalizes_offsets_to_utc() {
        let value = normalize_or_now(Some("2024-01-02T03:04:05+02:00"));
        assert_eq!(value, "2024-01-02T01:04:05.000Z");
    }

    #[test]
    fn garbage_falls_back_to_now() {
        let value = normalize_or_now(Some("yesterday"));
        assert!(DateTime::parse_from_rfc3339(&value).is_ok());
    }
}
