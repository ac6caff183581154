//! Pure slot planning: bulk expansion, template plans, plan-vs-calendar diff
//! and blackout ranges. Nothing here touches engine state.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Timelike, Weekday};
use serde::Deserialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

const DEFAULT_DAY_START: &str = "08:00";
const DEFAULT_DAY_END: &str = "17:00";

fn default_slot_length() -> u32 {
    30
}

fn default_capacity() -> u32 {
    10
}

fn default_resource_unit() -> String {
    "tons".into()
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DayConfig {
    pub enabled: Option<bool>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub capacity: Option<u32>,
    pub resource_unit: Option<String>,
    pub notes: Option<String>,
}

impl DayConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// `{}`: the day is listed but says nothing, so it is not planned.
    pub fn is_blank(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionKind {
    Blackout,
    Override,
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TemplateException {
    pub date: String,
    #[serde(rename = "type")]
    pub kind: ExceptionKind,
    #[serde(flatten)]
    pub day: DayConfig,
}

/// Parsed template `config` JSON.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TemplateConfig {
    #[serde(default)]
    pub weekdays: BTreeMap<String, DayConfig>,
    #[serde(default = "default_slot_length")]
    pub slot_length_min: u32,
    #[serde(default)]
    pub exceptions: Vec<TemplateException>,
    #[serde(default = "default_capacity")]
    pub default_capacity: u32,
    #[serde(default = "default_resource_unit")]
    pub default_resource_unit: String,
    #[serde(default)]
    pub default_notes: String,
}

fn weekday_key(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

const WEEKDAY_KEYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// Parse and validate a template config. Every time, capacity and date in it
/// must be usable so planning can't fail halfway through a publish.
pub fn parse_config(raw: &str) -> Result<TemplateConfig, EngineError> {
    if raw.len() > MAX_TEMPLATE_CONFIG_LEN {
        return Err(EngineError::LimitExceeded("template config too large"));
    }
    let config: TemplateConfig = serde_json::from_str(raw)
        .map_err(|e| EngineError::invalid(format!("invalid template config: {e}")))?;

    if !(1..=1440).contains(&config.slot_length_min) {
        return Err(EngineError::invalid("slot_length_min must be between 1 and 1440"));
    }
    if config.default_capacity == 0 {
        return Err(EngineError::invalid("default_capacity must be greater than 0"));
    }
    check_unit(&config.default_resource_unit)?;
    for (key, day) in &config.weekdays {
        if !WEEKDAY_KEYS.contains(&key.as_str()) {
            return Err(EngineError::invalid(format!("unknown weekday key: {key}")));
        }
        check_day(day)?;
    }
    for exception in &config.exceptions {
        if parse_date(&exception.date).is_none() {
            return Err(EngineError::invalid(format!(
                "invalid exception date: {}",
                exception.date
            )));
        }
        if exception.kind == ExceptionKind::Override {
            check_day(&exception.day)?;
        }
    }
    Ok(config)
}

fn check_unit(unit: &str) -> Result<(), EngineError> {
    if unit.trim().is_empty() {
        return Err(EngineError::invalid("resource_unit must not be empty"));
    }
    if unit.len() > MAX_RESOURCE_UNIT_LEN {
        return Err(EngineError::LimitExceeded("resource_unit too long"));
    }
    Ok(())
}

fn check_day(day: &DayConfig) -> Result<(), EngineError> {
    let (start, end) = day_bounds(day)?;
    if end <= start {
        return Err(EngineError::invalid("end_time must be after start_time"));
    }
    if day.capacity == Some(0) {
        return Err(EngineError::invalid("capacity must be greater than 0"));
    }
    if let Some(unit) = &day.resource_unit {
        check_unit(unit)?;
    }
    Ok(())
}

fn day_bounds(day: &DayConfig) -> Result<(NaiveTime, NaiveTime), EngineError> {
    let parse = |raw: Option<&String>, default: &str| {
        let raw = raw.map(String::as_str).unwrap_or(default);
        parse_time(raw).ok_or_else(|| EngineError::invalid(format!("invalid time: {raw}")))
    };
    Ok((
        parse(day.start_time.as_ref(), DEFAULT_DAY_START)?,
        parse(day.end_time.as_ref(), DEFAULT_DAY_END)?,
    ))
}

/// Consecutive `[start, end)` pieces of `length_min` minutes. A trailing
/// piece that would run past `day_end` is not produced.
pub fn cut_day(day_start: NaiveTime, day_end: NaiveTime, length_min: u32) -> Vec<(NaiveTime, NaiveTime)> {
    let mut out = Vec::new();
    if length_min == 0 {
        return out;
    }
    let end = day_end.num_seconds_from_midnight() / 60;
    let mut cur = day_start.num_seconds_from_midnight() / 60;
    while cur + length_min <= end {
        let next = cur + length_min;
        match (
            NaiveTime::from_hms_opt(cur / 60, cur % 60, 0),
            NaiveTime::from_hms_opt(next / 60, next % 60, 0),
        ) {
            (Some(a), Some(b)) => out.push((a, b)),
            _ => break,
        }
        cur = next;
    }
    out
}

pub fn clean_notes(notes: Option<String>) -> Option<String> {
    notes.filter(|n| !n.trim().is_empty())
}

/// Every date in `[start, end]`.
pub fn dates(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |d| *d <= end)
}

/// Desired slots for each day of `[start, end]` according to the template.
pub fn plan_slots(
    config: &TemplateConfig,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<SlotSpec>, EngineError> {
    let mut by_date: HashMap<NaiveDate, &TemplateException> = HashMap::new();
    for exception in &config.exceptions {
        if exception.kind == ExceptionKind::Ignored {
            continue;
        }
        if let Some(d) = parse_date(&exception.date) {
            // First matching exception wins.
            by_date.entry(d).or_insert(exception);
        }
    }

    let mut planned = Vec::new();
    for date in dates(start, end) {
        let day = match by_date.get(&date) {
            Some(exception) if exception.kind == ExceptionKind::Blackout => continue,
            Some(exception) => &exception.day,
            None => match config.weekdays.get(weekday_key(date.weekday())) {
                Some(day) if !day.is_blank() => day,
                _ => continue,
            },
        };
        if !day.is_enabled() {
            continue;
        }

        let (day_start, day_end) = day_bounds(day)?;
        let capacity = day.capacity.unwrap_or(config.default_capacity);
        let unit = day
            .resource_unit
            .clone()
            .unwrap_or_else(|| config.default_resource_unit.clone());
        let notes = clean_notes(Some(
            day.notes.clone().unwrap_or_else(|| config.default_notes.clone()),
        ));

        for (start_time, end_time) in cut_day(day_start, day_end, config.slot_length_min) {
            if planned.len() >= MAX_SLOTS_PER_APPLY {
                return Err(EngineError::LimitExceeded("template plan too large"));
            }
            planned.push(SlotSpec {
                date,
                start_time,
                end_time,
                capacity,
                resource_unit: unit.clone(),
                blackout: false,
                notes: notes.clone(),
            });
        }
    }
    Ok(planned)
}

/// Classify planned slots against what the calendar already holds.
///
/// Keyed by `(date, start, end)`. A planned slot whose `(date, start)` is taken
/// by a slot with a different end time can't be created and is skipped.
pub fn diff(planned: Vec<SlotSpec>, existing: &[(Ulid, SlotSpec)]) -> Vec<PlannedSlot> {
    let exact: HashMap<(NaiveDate, NaiveTime, NaiveTime), (Ulid, &SlotSpec)> = existing
        .iter()
        .map(|(id, s)| ((s.date, s.start_time, s.end_time), (*id, s)))
        .collect();
    let occupied: HashMap<SlotKey, Ulid> = existing.iter().map(|(id, s)| (s.key(), *id)).collect();

    planned
        .into_iter()
        .map(|spec| {
            match exact.get(&(spec.date, spec.start_time, spec.end_time)) {
                Some((id, current)) => {
                    let changed = current.capacity != spec.capacity
                        || current.resource_unit != spec.resource_unit
                        || current.blackout != spec.blackout
                        || current.notes != spec.notes;
                    PlannedSlot {
                        action: if changed { PlanAction::Update } else { PlanAction::Skip },
                        slot_id: Some(*id),
                        spec,
                    }
                }
                None => match occupied.get(&spec.key()) {
                    Some(id) => PlannedSlot {
                        action: PlanAction::Skip,
                        slot_id: Some(*id),
                        spec,
                    },
                    None => PlannedSlot {
                        action: PlanAction::Create,
                        slot_id: None,
                        spec,
                    },
                },
            }
        })
        .collect()
}

/// Validate a bulk-create request against `today` (tenant local date).
pub fn validate_bulk(req: &BulkSlots, today: NaiveDate) -> Result<(), EngineError> {
    if req.start_date < today {
        return Err(EngineError::invalid("start_date cannot be in the past"));
    }
    if req.end_date < req.start_date {
        return Err(EngineError::invalid("end_date must be on or after start_date"));
    }
    if (req.end_date - req.start_date).num_days() > MAX_BULK_RANGE_DAYS {
        return Err(EngineError::invalid(format!(
            "Date range cannot exceed {MAX_BULK_RANGE_DAYS} days"
        )));
    }
    if req.weekdays.is_empty() {
        return Err(EngineError::invalid(
            "weekdays must include at least one day (Mon=1..Sun=7)",
        ));
    }
    if let Some(bad) = req.weekdays.iter().find(|d| !(1..=7).contains(*d)) {
        return Err(EngineError::invalid(format!(
            "weekday {bad} out of range (Mon=1..Sun=7)"
        )));
    }
    if !(1..=1440).contains(&req.slot_length_min) {
        return Err(EngineError::invalid("slot_length_min must be between 1 and 1440"));
    }
    if req.capacity == 0 {
        return Err(EngineError::invalid("capacity must be greater than 0"));
    }
    if req.day_end <= req.day_start {
        return Err(EngineError::invalid("end_time must be after start_time"));
    }
    if let Some(unit) = &req.resource_unit {
        check_unit(unit)?;
    }
    Ok(())
}

/// All slots a bulk request describes, before checking what already exists.
pub fn expand_bulk(req: &BulkSlots) -> Vec<SlotSpec> {
    let unit = req.resource_unit.clone().unwrap_or_else(default_resource_unit);
    let notes = clean_notes(req.notes.clone());
    let pieces = cut_day(req.day_start, req.day_end, req.slot_length_min);
    dates(req.start_date, req.end_date)
        .filter(|d| req.weekdays.contains(&d.weekday().number_from_monday()))
        .flat_map(|date| {
            let unit = unit.clone();
            let notes = notes.clone();
            pieces.iter().map(move |(start_time, end_time)| SlotSpec {
                date,
                start_time: *start_time,
                end_time: *end_time,
                capacity: req.capacity,
                resource_unit: unit.clone(),
                blackout: false,
                notes: notes.clone(),
            })
        })
        .collect()
}

/// Validate a bulk-blackout range and widen it to whole Monday–Sunday weeks
/// for the week scope.
pub fn blackout_range(
    scope: BlackoutScope,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), EngineError> {
    if start > end {
        return Err(EngineError::invalid("start_date must be <= end_date"));
    }
    if (end - start).num_days() > MAX_BULK_RANGE_DAYS {
        return Err(EngineError::invalid(format!(
            "Date range cannot exceed {MAX_BULK_RANGE_DAYS} days"
        )));
    }
    Ok(match scope {
        BlackoutScope::Day => (start, end),
        BlackoutScope::Week => (
            start - Duration::days(start.weekday().num_days_from_monday() as i64),
            end + Duration::days(6 - end.weekday().num_days_from_monday() as i64),
        ),
    })
}

/// Range check shared by template preview and publish.
pub fn check_apply_range(start: NaiveDate, end: NaiveDate) -> Result<(), EngineError> {
    if start > end {
        return Err(EngineError::invalid("start_date must be <= end_date"));
    }
    if (end - start).num_days() > MAX_BULK_RANGE_DAYS {
        return Err(EngineError::invalid(format!(
            "Date range cannot exceed {MAX_BULK_RANGE_DAYS} days"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        parse_time(s).unwrap()
    }

    fn spec(date: &str, start: &str, end: &str, capacity: u32) -> SlotSpec {
        SlotSpec {
            date: d(date),
            start_time: t(start),
            end_time: t(end),
            capacity,
            resource_unit: "tons".into(),
            blackout: false,
            notes: None,
        }
    }

    #[test]
    fn cut_day_drops_partial_tail() {
        let pieces = cut_day(t("08:00"), t("09:45"), 30);
        let starts: Vec<String> = pieces.iter().map(|(s, _)| fmt_time(*s)).collect();
        assert_eq!(starts, vec!["08:00", "08:30", "09:00"]);
        assert_eq!(fmt_time(pieces[2].1), "09:30");
    }

    #[test]
    fn cut_day_exact_fit_and_too_short() {
        assert_eq!(cut_day(t("08:00"), t("10:00"), 60).len(), 2);
        assert!(cut_day(t("08:00"), t("08:20"), 30).is_empty());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = parse_config(r#"{"weekdays": {"mon": {"enabled": true}}}"#).unwrap();
        assert_eq!(cfg.slot_length_min, 30);
        assert_eq!(cfg.default_capacity, 10);
        assert_eq!(cfg.default_resource_unit, "tons");

        // 2031-03-03 is a Monday; 08:00–17:00 in 30 minute slots.
        let plan = plan_slots(&cfg, d("2031-03-03"), d("2031-03-09")).unwrap();
        assert_eq!(plan.len(), 18);
        assert!(plan.iter().all(|s| s.date == d("2031-03-03") && s.capacity == 10));
        assert_eq!(plan[0].notes, None);
    }

    #[test]
    fn empty_weekday_config_is_skipped() {
        let cfg = parse_config(r#"{"weekdays": {"mon": {}, "tue": {"capacity": 4}}}"#).unwrap();
        let plan = plan_slots(&cfg, d("2031-03-03"), d("2031-03-09")).unwrap();
        assert_eq!(plan.len(), 18);
        assert!(plan.iter().all(|s| s.date == d("2031-03-04") && s.capacity == 4));
    }

    #[test]
    fn config_rejects_bad_input() {
        assert!(parse_config("not json").is_err());
        assert!(parse_config(r#"{"weekdays": {"funday": {}}}"#).is_err());
        assert!(parse_config(r#"{"weekdays": {"mon": {"start_time": "8am"}}}"#).is_err());
        assert!(parse_config(r#"{"weekdays": {"mon": {"start_time": "10:00", "end_time": "09:00"}}}"#).is_err());
        assert!(parse_config(r#"{"slot_length_min": 0}"#).is_err());
        assert!(parse_config(r#"{"exceptions": [{"date": "soon", "type": "blackout"}]}"#).is_err());
    }

    #[test]
    fn exceptions_blackout_and_override() {
        let cfg = parse_config(
            r#"{
                "weekdays": {
                    "mon": {"start_time": "08:00", "end_time": "10:00", "capacity": 5},
                    "tue": {"start_time": "08:00", "end_time": "10:00", "capacity": 5}
                },
                "slot_length_min": 60,
                "exceptions": [
                    {"date": "2031-03-03", "type": "blackout"},
                    {"date": "2031-03-04", "type": "override", "start_time": "12:00", "end_time": "13:00", "capacity": 2, "notes": "half day"}
                ]
            }"#,
        )
        .unwrap();
        let plan = plan_slots(&cfg, d("2031-03-03"), d("2031-03-04")).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].date, d("2031-03-04"));
        assert_eq!(fmt_time(plan[0].start_time), "12:00");
        assert_eq!(plan[0].capacity, 2);
        assert_eq!(plan[0].notes.as_deref(), Some("half day"));
    }

    #[test]
    fn disabled_day_is_skipped() {
        let cfg = parse_config(r#"{"weekdays": {"mon": {"enabled": false}}}"#).unwrap();
        assert!(plan_slots(&cfg, d("2031-03-03"), d("2031-03-03")).unwrap().is_empty());
    }

    #[test]
    fn diff_classifies_create_update_skip() {
        let existing_same = spec("2031-03-03", "08:00", "08:30", 10);
        let existing_changed = spec("2031-03-03", "08:30", "09:00", 4);
        let existing = vec![(Ulid::new(), existing_same.clone()), (Ulid::new(), existing_changed)];

        let planned = vec![
            existing_same,
            spec("2031-03-03", "08:30", "09:00", 10),
            spec("2031-03-03", "09:00", "09:30", 10),
        ];
        let actions: Vec<PlanAction> = diff(planned, &existing).iter().map(|p| p.action).collect();
        assert_eq!(actions, vec![PlanAction::Skip, PlanAction::Update, PlanAction::Create]);
    }

    #[test]
    fn diff_notes_and_blackout_count_as_changes() {
        let mut current = spec("2031-03-03", "08:00", "08:30", 10);
        current.blackout = true;
        let existing = vec![(Ulid::new(), current)];
        let out = diff(vec![spec("2031-03-03", "08:00", "08:30", 10)], &existing);
        assert_eq!(out[0].action, PlanAction::Update);
    }

    #[test]
    fn diff_skips_occupied_start_with_other_end() {
        let existing = vec![(Ulid::new(), spec("2031-03-03", "08:00", "09:00", 10))];
        let out = diff(vec![spec("2031-03-03", "08:00", "08:30", 10)], &existing);
        assert_eq!(out[0].action, PlanAction::Skip);
        assert_eq!(out[0].slot_id, Some(existing[0].0));
    }

    fn bulk() -> BulkSlots {
        BulkSlots {
            start_date: d("2031-03-03"),
            end_date: d("2031-03-09"),
            weekdays: vec![1, 3, 5],
            slot_length_min: 60,
            capacity: 8,
            day_start: t("08:00"),
            day_end: t("11:00"),
            resource_unit: None,
            notes: Some("  ".into()),
        }
    }

    #[test]
    fn bulk_expands_selected_weekdays() {
        let slots = expand_bulk(&bulk());
        // Mon, Wed, Fri × 3 hourly slots.
        assert_eq!(slots.len(), 9);
        assert!(slots.iter().all(|s| s.capacity == 8 && s.notes.is_none()));
        assert_eq!(slots[3].date, d("2031-03-05"));
    }

    #[test]
    fn bulk_validation_messages() {
        let today = d("2031-01-01");
        let mut req = bulk();
        req.start_date = d("2030-12-31");
        assert_eq!(
            validate_bulk(&req, today).unwrap_err().to_string(),
            "start_date cannot be in the past"
        );

        let mut req = bulk();
        req.end_date = d("2031-03-01");
        assert_eq!(
            validate_bulk(&req, today).unwrap_err().to_string(),
            "end_date must be on or after start_date"
        );

        let mut req = bulk();
        req.weekdays.clear();
        assert!(validate_bulk(&req, today).unwrap_err().to_string().contains("at least one day"));

        let mut req = bulk();
        req.weekdays = vec![0, 8];
        assert!(validate_bulk(&req, today).is_err());

        let mut req = bulk();
        req.slot_length_min = 1441;
        assert!(validate_bulk(&req, today).is_err());

        let mut req = bulk();
        req.capacity = 0;
        assert!(validate_bulk(&req, today).is_err());

        assert!(validate_bulk(&bulk(), today).is_ok());
    }

    #[test]
    fn week_scope_widens_to_calendar_weeks() {
        // Wednesday to the following Tuesday.
        let (start, end) = blackout_range(BlackoutScope::Week, d("2031-03-05"), d("2031-03-11")).unwrap();
        assert_eq!(start, d("2031-03-03"));
        assert_eq!(end, d("2031-03-16"));

        let (start, end) = blackout_range(BlackoutScope::Day, d("2031-03-05"), d("2031-03-05")).unwrap();
        assert_eq!((start, end), (d("2031-03-05"), d("2031-03-05")));
    }

    #[test]
    fn blackout_range_errors() {
        assert_eq!(
            blackout_range(BlackoutScope::Day, d("2031-03-05"), d("2031-03-04")).unwrap_err().to_string(),
            "start_date must be <= end_date"
        );
        assert_eq!(
            blackout_range(BlackoutScope::Day, d("2031-01-01"), d("2032-06-01")).unwrap_err().to_string(),
            "Date range cannot exceed 365 days"
        );
    }
}
