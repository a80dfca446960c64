use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Vendor-declared local zone for the irrigation fleet.
pub const PROJECT_TZ: Tz = chrono_tz::Asia::Bangkok;

const BE_OFFSET: i32 = 543;

/// Parses a Buddhist-Era date in `DD/MM/YYYY` form (e.g. `07/07/2568`) into
/// the Gregorian calendar day it names.
pub fn parse_be_date(raw: &str) -> Result<NaiveDate, String> {
    let parts: Vec<&str> = raw.trim().split('/').collect();
    if parts.len() != 3 {
        return Err(format!("invalid Buddhist date '{raw}', expected DD/MM/YYYY"));
    }
    let day: u32 = parts[0]
        .parse()
        .map_err(|_| format!("invalid day in '{raw}'"))?;
    let month: u32 = parts[1]
        .parse()
        .map_err(|_| format!("invalid month in '{raw}'"))?;
    let be_year: i32 = parts[2]
        .parse()
        .map_err(|_| format!("invalid year in '{raw}'"))?;
    if be_year <= BE_OFFSET {
        return Err(format!("year {be_year} is not a Buddhist-Era year"));
    }
    NaiveDate::from_ymd_opt(be_year - BE_OFFSET, month, day)
        .ok_or_else(|| format!("invalid calendar date '{raw}'"))
}

/// UTC half-open window `[00:00, 24:00)` of the given calendar day in
/// Asia/Bangkok. Bangkok carries a fixed +07:00 offset, so local midnights
/// always resolve to a single instant.
pub fn local_day_utc_range(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_local = day.and_time(NaiveTime::MIN);
    let end_local = start_local + Duration::days(1);
    (local_to_utc(start_local), local_to_utc(end_local))
}

fn local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    match PROJECT_TZ.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        // Kept total for hypothetical transitions: prefer the earlier instant.
        chrono::LocalResult::Ambiguous(a, b) => a.min(b).with_timezone(&Utc),
        chrono::LocalResult::None => PROJECT_TZ
            .from_utc_datetime(&(naive - Duration::hours(7)))
            .with_timezone(&Utc),
    }
}

/// Formats a UTC instant as the Buddhist-Era `DD/MM/YYYY` string of its
/// Asia/Bangkok calendar day.
pub fn format_be_date(instant: DateTime<Utc>) -> String {
    let local = instant.with_timezone(&PROJECT_TZ).date_naive();
    format!(
        "{:02}/{:02}/{:04}",
        local.day0() + 1,
        local.month0() + 1,
        local.year() + BE_OFFSET
    )
}

/// Millisecond epoch timestamps as sent by the water-level vendor.
pub fn from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Vendor `YYYY/MM/DD` + `HH:MM:SS` pairs. Fields suffixed `_utc` are UTC;
/// everything else is Asia/Bangkok local.
pub fn from_vendor_date_time(date: &str, time: &str, is_utc: bool) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y/%m/%d").ok()?;
    let time = NaiveTime::parse_from_str(time.trim(), "%H:%M:%S").ok()?;
    let naive = date.and_time(time);
    if is_utc {
        Some(Utc.from_utc_datetime(&naive))
    } else {
        Some(local_to_utc(naive))
    }
}
