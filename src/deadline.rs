use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use thiserror::Error;

/// Raised when free-text input matches none of the recognized deadline
/// forms. Carries the original input for display back to the user.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Не могу распознать дедлайн: «{0}»")]
pub struct UnparseableDeadline(pub String);

/// Turn free-text input into a deadline, relative to `now`.
///
/// Recognized forms, tried in order:
/// - "завтра" / "tomorrow": tomorrow at 23:59
/// - "ДД.ММ.ГГГГ ЧЧ:ММ": exactly as given
/// - "ДД.ММ.ГГГГ": that date at 23:59
/// - "ЧЧ:ММ": the next occurrence of that clock time
/// - blank input: no deadline
///
/// A deadline with no explicit time defaults to the end of that day.
pub fn parse_deadline(
    text: &str,
    now: DateTime<Local>,
) -> Result<Option<DateTime<Local>>, UnparseableDeadline> {
    let t = text.trim().to_lowercase();
    if t.is_empty() {
        return Ok(None);
    }

    let end_of_day = NaiveTime::from_hms_opt(23, 59, 0).unwrap();

    if t == "завтра" || t == "tomorrow" {
        let date = now.date_naive() + Duration::days(1);
        return Ok(Some(to_local(date.and_time(end_of_day), text)?));
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(&t, "%d.%m.%Y %H:%M") {
        return Ok(Some(to_local(dt, text)?));
    }

    if let Ok(date) = NaiveDate::parse_from_str(&t, "%d.%m.%Y") {
        return Ok(Some(to_local(date.and_time(end_of_day), text)?));
    }

    if let Ok(time) = NaiveTime::parse_from_str(&t, "%H:%M") {
        // a bare clock time always refers to its next occurrence
        let today = to_local(now.date_naive().and_time(time), text)?;
        if today > now {
            return Ok(Some(today));
        }
        let tomorrow = (now.date_naive() + Duration::days(1)).and_time(time);
        return Ok(Some(to_local(tomorrow, text)?));
    }

    Err(UnparseableDeadline(text.trim().to_string()))
}

fn to_local(dt: NaiveDateTime, original: &str) -> Result<DateTime<Local>, UnparseableDeadline> {
    Local
        .from_local_datetime(&dt)
        .single()
        .ok_or_else(|| UnparseableDeadline(original.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn tomorrow_means_end_of_next_day() {
        let now = at(2024, 1, 1, 10, 0);
        assert_eq!(
            parse_deadline("завтра", now).unwrap(),
            Some(at(2024, 1, 2, 23, 59))
        );
        assert_eq!(
            parse_deadline("Tomorrow", now).unwrap(),
            Some(at(2024, 1, 2, 23, 59))
        );
    }

    #[test]
    fn full_date_time_is_taken_verbatim() {
        let now = at(2024, 1, 1, 10, 0);
        assert_eq!(
            parse_deadline("25.12.2024 18:00", now).unwrap(),
            Some(at(2024, 12, 25, 18, 0))
        );
    }

    #[test]
    fn date_only_defaults_to_end_of_day() {
        let now = at(2024, 1, 1, 10, 0);
        assert_eq!(
            parse_deadline("25.12.2024", now).unwrap(),
            Some(at(2024, 12, 25, 23, 59))
        );
    }

    #[test]
    fn time_only_picks_the_next_occurrence() {
        assert_eq!(
            parse_deadline("18:00", at(2024, 1, 1, 10, 0)).unwrap(),
            Some(at(2024, 1, 1, 18, 0))
        );
        assert_eq!(
            parse_deadline("18:00", at(2024, 1, 1, 20, 0)).unwrap(),
            Some(at(2024, 1, 2, 18, 0))
        );
        // exactly "now" is not strictly after now, so it rolls forward
        assert_eq!(
            parse_deadline("18:00", at(2024, 1, 1, 18, 0)).unwrap(),
            Some(at(2024, 1, 2, 18, 0))
        );
    }

    #[test]
    fn blank_input_means_no_deadline() {
        let now = at(2024, 1, 1, 10, 0);
        assert_eq!(parse_deadline("", now).unwrap(), None);
        assert_eq!(parse_deadline("   ", now).unwrap(), None);
    }

    #[test]
    fn garbage_is_rejected_with_the_original_text() {
        let now = at(2024, 1, 1, 10, 0);
        let err = parse_deadline("not a date", now).unwrap_err();
        assert_eq!(err, UnparseableDeadline("not a date".to_string()));
        assert!(parse_deadline("32.13.2024", now).is_err());
        assert!(parse_deadline("25:99", now).is_err());
    }

    #[test]
    fn input_is_trimmed_and_case_normalized() {
        let now = at(2024, 1, 1, 10, 0);
        assert_eq!(
            parse_deadline("  ЗАВТРА  ", now).unwrap(),
            Some(at(2024, 1, 2, 23, 59))
        );
    }
}
