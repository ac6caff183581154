use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{slots_between, Engine, EngineError};

fn check_range(start: NaiveDate, end: NaiveDate, max_days: i64) -> Result<(), EngineError> {
    if start > end {
        return Err(EngineError::invalid("start_date must be <= end_date"));
    }
    if (end - start).num_days() > max_days {
        return Err(EngineError::invalid(format!("Date range cannot exceed {max_days} days")));
    }
    Ok(())
}

impl Engine {
    async fn slot_ids_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<Ulid> {
        let calendar = self.calendar.read().await;
        slots_between(&calendar, start, end)
    }

    async fn all_slot_ids(&self) -> Vec<Ulid> {
        self.calendar.read().await.values().copied().collect()
    }

    async fn slot_infos(&self, ids: Vec<Ulid>) -> Vec<SlotInfo> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(slot) = self.get_slot(&id) {
                out.push(SlotInfo::from_state(&*slot.read().await));
            }
        }
        out
    }

    /// Slots on `date`, or every slot from today on when no date is given.
    pub async fn list_slots(&self, date: Option<NaiveDate>) -> Vec<SlotInfo> {
        let ids = match date {
            Some(d) => self.slot_ids_between(d, d).await,
            None => self.slot_ids_between(self.today(), NaiveDate::MAX).await,
        };
        self.slot_infos(ids).await
    }

    pub async fn slots_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<SlotInfo>, EngineError> {
        check_range(start, end, MAX_SLOT_RANGE_DAYS)?;
        Ok(self.slot_infos(self.slot_ids_between(start, end).await).await)
    }

    pub async fn slot_info(&self, id: Ulid) -> Result<SlotInfo, EngineError> {
        let slot = self.get_slot(&id).ok_or(EngineError::NotFound("Slot", id))?;
        let guard = slot.read().await;
        Ok(SlotInfo::from_state(&guard))
    }

    pub async fn slot_usage(&self, id: Ulid) -> Result<SlotUsage, EngineError> {
        let slot = self.get_slot(&id).ok_or(EngineError::NotFound("Slot", id))?;
        let guard = slot.read().await;
        Ok(guard.usage())
    }

    pub async fn list_restrictions(&self, slot_id: Ulid) -> Result<RestrictionInfo, EngineError> {
        let slot = self.get_slot(&slot_id).ok_or(EngineError::NotFound("Slot", slot_id))?;
        let guard = slot.read().await;
        Ok(RestrictionInfo {
            slot_id,
            grower_ids: guard.allowed_growers.iter().copied().collect(),
            cultivar_ids: guard.allowed_cultivars.iter().copied().collect(),
        })
    }

    // ── Bookings ─────────────────────────────────────────────

    fn booking_info(&self, slot: &SlotState, b: &Booking) -> BookingInfo {
        BookingInfo {
            id: b.id,
            slot_id: slot.id,
            slot_date: slot.spec.date,
            start_time: slot.spec.start_time,
            end_time: slot.spec.end_time,
            grower_id: b.grower_id,
            grower_name: self.growers.get(&b.grower_id).map(|n| n.value().clone()),
            cultivar_id: b.cultivar_id,
            cultivar_name: b
                .cultivar_id
                .and_then(|c| self.cultivars.get(&c).map(|n| n.value().clone())),
            quantity: b.quantity,
            status: b.status,
            created_at: b.created_at,
            notes: b.notes.clone(),
        }
    }

    pub async fn get_booking(&self, principal: Principal, id: Ulid) -> Result<BookingInfo, EngineError> {
        let slot_id = self
            .slot_for_booking(&id)
            .ok_or(EngineError::NotFound("Booking", id))?;
        let slot = self.get_slot(&slot_id).ok_or(EngineError::NotFound("Booking", id))?;
        let guard = slot.read().await;
        match guard.booking(id) {
            Some(b) if principal.can_act_for(b.grower_id) => Ok(self.booking_info(&guard, b)),
            _ => Err(EngineError::NotFound("Booking", id)),
        }
    }

    /// Bookings newest slot first. Growers only ever see their own.
    pub async fn list_bookings(
        &self,
        principal: Principal,
        date: Option<NaiveDate>,
        grower_id: Option<Ulid>,
    ) -> Vec<BookingInfo> {
        let grower_id = principal.grower_id().or(grower_id);
        let ids = match date {
            Some(d) => self.slot_ids_between(d, d).await,
            None => self.all_slot_ids().await,
        };

        let mut out = Vec::new();
        for id in ids.into_iter().rev() {
            let Some(slot) = self.get_slot(&id) else { continue };
            let guard = slot.read().await;
            let mut rows: Vec<BookingInfo> = guard
                .bookings
                .iter()
                .filter(|b| grower_id.is_none_or(|g| b.grower_id == g))
                .map(|b| self.booking_info(&guard, b))
                .collect();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            out.extend(rows);
        }
        out
    }

    /// Bookings on slots dated within `[start, end]`, ordered by slot date,
    /// start time and creation.
    pub async fn export_bookings(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        filter: &ExportFilter,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        if start > end {
            return Err(EngineError::invalid("start date must be <= end date"));
        }
        if (end - start).num_days() > MAX_EXPORT_RANGE_DAYS {
            return Err(EngineError::invalid(format!(
                "Date range cannot exceed {MAX_EXPORT_RANGE_DAYS} days"
            )));
        }

        let mut out = Vec::new();
        for id in self.slot_ids_between(start, end).await {
            let Some(slot) = self.get_slot(&id) else { continue };
            let guard = slot.read().await;
            let mut rows: Vec<BookingInfo> = guard
                .bookings
                .iter()
                .filter(|b| filter.grower_id.is_none_or(|g| b.grower_id == g))
                .filter(|b| filter.cultivar_id.is_none_or(|c| b.cultivar_id == Some(c)))
                .filter(|b| filter.status.is_none_or(|s| b.status == s))
                .map(|b| self.booking_info(&guard, b))
                .collect();
            rows.sort_by_key(|b| b.created_at);
            out.extend(rows);
        }
        Ok(out)
    }

    // ── Availability ─────────────────────────────────────────

    /// Interpret a client datetime in packhouse local time. Offset-aware
    /// values (RFC 3339, `Z` included) are converted; naive ones are taken
    /// as local already.
    pub fn parse_local_datetime(&self, raw: &str) -> Result<NaiveDateTime, EngineError> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&self.utc_offset()).naive_local());
        }
        ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .ok_or_else(|| EngineError::invalid(format!("Invalid datetime format: {raw}")))
    }

    /// Bookable slots starting at or after `from`, earliest first. Grower and
    /// cultivar filters apply the slots' allowlists.
    pub async fn next_available(
        &self,
        from: NaiveDateTime,
        grower_id: Option<Ulid>,
        cultivar_id: Option<Ulid>,
        limit: usize,
    ) -> Result<Vec<AvailableSlot>, EngineError> {
        if !(1..=MAX_NEXT_AVAILABLE).contains(&limit) {
            return Err(EngineError::invalid(format!(
                "limit must be between 1 and {MAX_NEXT_AVAILABLE}"
            )));
        }
        let ids: Vec<Ulid> = {
            let calendar = self.calendar.read().await;
            calendar
                .range((from.date(), from.time())..)
                .map(|(_, id)| *id)
                .collect()
        };

        let mut out = Vec::new();
        for id in ids {
            let Some(slot) = self.get_slot(&id) else { continue };
            let guard = slot.read().await;
            if guard.spec.blackout || guard.remaining() == 0 {
                continue;
            }
            if grower_id.is_some_and(|g| !guard.admits_grower(g)) {
                continue;
            }
            if cultivar_id.is_some_and(|c| !guard.admits_cultivar(Some(c))) {
                continue;
            }
            out.push(AvailableSlot {
                slot_id: guard.id,
                date: guard.spec.date,
                start_time: guard.spec.start_time,
                end_time: guard.spec.end_time,
                remaining: guard.remaining(),
                notes: guard.spec.notes.clone(),
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    // ── Reference data ───────────────────────────────────────

    /// Checks `password` against the credential stored for `principal`.
    /// `None` when this tenant has never set one.
    pub fn login_matches(&self, principal: Principal, password: &str) -> Option<bool> {
        self.credentials.get(&principal).map(|c| c.matches(password))
    }

    pub fn list_growers(&self) -> Vec<NamedInfo> {
        let mut out: Vec<NamedInfo> = self
            .growers
            .iter()
            .map(|e| NamedInfo { id: *e.key(), name: e.value().clone() })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub fn list_cultivars(&self) -> Vec<NamedInfo> {
        let mut out: Vec<NamedInfo> = self
            .cultivars
            .iter()
            .map(|e| NamedInfo { id: *e.key(), name: e.value().clone() })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub fn list_templates(&self) -> Vec<Template> {
        let mut out: Vec<Template> = self.templates.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub fn get_template(&self, id: Ulid) -> Result<Template, EngineError> {
        self.templates
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(EngineError::NotFound("Template", id))
    }

    /// Earliest moment a slot could be listed from: midnight today.
    pub fn start_of_today(&self) -> NaiveDateTime {
        self.today().and_time(NaiveTime::MIN)
    }
}
