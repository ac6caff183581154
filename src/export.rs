use chrono::NaiveDate;

use crate::model::*;

pub const CSV_HEADER: &str =
    "booking_id,slot_date,start_time,end_time,grower_name,cultivar_name,quantity,status,notes";

/// Suggested download name for an export of `[start, end]`.
pub fn filename(start: NaiveDate, end: NaiveDate) -> String {
    format!("bookings_{}_{}.csv", fmt_date(start), fmt_date(end))
}

/// Quote a field only when it holds a comma, quote, CR or LF.
fn field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn line(b: &BookingInfo) -> String {
    [
        b.id.to_string(),
        fmt_date(b.slot_date),
        fmt_time(b.start_time),
        fmt_time(b.end_time),
        b.grower_name.clone().unwrap_or_default(),
        b.cultivar_name.clone().unwrap_or_default(),
        b.quantity.to_string(),
        b.status.as_str().to_string(),
        b.notes.clone().unwrap_or_default(),
    ]
    .iter()
    .map(|v| field(v))
    .collect::<Vec<_>>()
    .join(",")
}

/// Header plus one line per booking, each terminated by `\n`.
pub fn to_csv(bookings: &[BookingInfo]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + 1 + bookings.len() * 96);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for b in bookings {
        out.push_str(&line(b));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use ulid::Ulid;

    fn booking(notes: Option<&str>, grower: &str) -> BookingInfo {
        BookingInfo {
            id: Ulid::from_string("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap(),
            slot_id: Ulid::new(),
            slot_date: NaiveDate::from_ymd_opt(2031, 3, 3).unwrap(),
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            grower_id: Ulid::new(),
            grower_name: Some(grower.into()),
            cultivar_id: None,
            cultivar_name: None,
            quantity: 12,
            status: BookingStatus::Confirmed,
            created_at: 0,
            notes: notes.map(str::to_string),
        }
    }

    #[test]
    fn header_only_when_empty() {
        assert_eq!(to_csv(&[]), format!("{CSV_HEADER}\n"));
    }

    #[test]
    fn plain_fields_are_not_quoted() {
        let csv = to_csv(&[booking(None, "Hill Farm")]);
        let row = csv.lines().nth(1).unwrap();
        assert_eq!(
            row,
            "01ARZ3NDEKTSV4RRFFQ69G5FAV,2031-03-03,08:00,08:30,Hill Farm,,12,confirmed,"
        );
    }

    #[test]
    fn special_characters_are_quoted() {
        assert_eq!(field("a,b"), "\"a,b\"");
        assert_eq!(field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(field("two\nlines"), "\"two\nlines\"");
        assert_eq!(field("cr\rhere"), "\"cr\rhere\"");
        assert_eq!(field("Ölbaum"), "Ölbaum");
    }

    #[test]
    fn notes_with_comma_stay_one_field() {
        let csv = to_csv(&[booking(Some("late, via north gate"), "Smith & Sons")]);
        assert!(csv.ends_with(",12,confirmed,\"late, via north gate\"\n"));
    }

    #[test]
    fn filename_uses_range() {
        let start = NaiveDate::from_ymd_opt(2031, 3, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2031, 3, 31).unwrap();
        assert_eq!(filename(start, end), "bookings_2031-03-01_2031-03-31.csv");
    }
}
