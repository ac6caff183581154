use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::capacity::validate_name;
use super::planner::{check_apply_range, diff, parse_config, plan_slots};
use super::{slots_between, Calendar, Engine, EngineError};

fn check_window(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<(), EngineError> {
    if let (Some(from), Some(to)) = (from, to)
        && from > to
    {
        return Err(EngineError::invalid("active_from must be on or before active_to"));
    }
    Ok(())
}

fn check_description(description: Option<&str>) -> Result<(), EngineError> {
    if description.is_some_and(|d| d.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_template(&self, id: Ulid, input: TemplateInput) -> Result<(), EngineError> {
        validate_name(&input.name)?;
        check_description(input.description.as_deref())?;
        parse_config(&input.config)?;
        check_window(input.active_from, input.active_to)?;

        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.templates.len() >= MAX_TEMPLATES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many templates"));
        }
        if self.templates.contains_key(&id) {
            return Err(EngineError::AlreadyExists("Template", id.to_string()));
        }

        let event = Event::TemplateSaved {
            id,
            name: input.name,
            description: input.description,
            config: input.config,
            active_from: input.active_from,
            active_to: input.active_to,
        };
        self.wal_append(&event).await?;
        self.apply_catalog(&event);
        Ok(())
    }

    pub async fn update_template(&self, id: Ulid, changes: TemplateChanges) -> Result<(), EngineError> {
        let current = self
            .templates
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(EngineError::NotFound("Template", id))?;

        let name = changes.name.unwrap_or(current.name);
        validate_name(&name)?;
        let description = changes.description.or(current.description);
        check_description(description.as_deref())?;
        let config = changes.config.unwrap_or(current.config);
        parse_config(&config)?;
        let active_from = changes.active_from.or(current.active_from);
        let active_to = changes.active_to.or(current.active_to);
        check_window(active_from, active_to)?;

        let event = Event::TemplateSaved { id, name, description, config, active_from, active_to };
        let _gate = self.commit_gate.read().await;
        if !self.templates.contains_key(&id) {
            return Err(EngineError::NotFound("Template", id));
        }
        self.wal_append(&event).await?;
        self.apply_catalog(&event);
        Ok(())
    }

    pub async fn delete_template(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if !self.templates.contains_key(&id) {
            return Err(EngineError::NotFound("Template", id));
        }
        let event = Event::TemplateDeleted { id };
        self.wal_append(&event).await?;
        self.apply_catalog(&event);
        Ok(())
    }

    /// Template plan for `[start, end]` classified against the calendar,
    /// without writing anything.
    pub async fn preview_template(
        &self,
        id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PlannedSlot>, EngineError> {
        let calendar = self.calendar.read().await;
        self.plan_template(&calendar, id, start, end).await
    }

    /// Write every create and update of the plan as one WAL record. Any update
    /// that would leave a slot's capacity below what is booked on it aborts
    /// the whole publish.
    pub async fn publish_template(
        &self,
        id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PublishSummary, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut calendar = self.calendar.write().await;
        let plan = self.plan_template(&calendar, id, start, end).await?;

        let mut summary = PublishSummary::default();
        let mut creates = Vec::new();
        let mut updates = Vec::new();
        for planned in plan {
            match (planned.action, planned.slot_id) {
                (PlanAction::Create, _) => creates.push(planned.spec),
                (PlanAction::Update, Some(slot_id)) => updates.push((slot_id, planned.spec)),
                _ => summary.skipped += 1,
            }
        }
        if self.slots.len() + creates.len() > MAX_SLOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many slots"));
        }

        let mut guards = self
            .lock_slots_sorted(updates.iter().map(|(slot_id, _)| *slot_id).collect())
            .await;
        let mut events = Vec::with_capacity(creates.len() + updates.len());
        let mut touched = Vec::with_capacity(updates.len());
        for (slot_id, spec) in &updates {
            let Some(i) = guards.iter().position(|g| g.id == *slot_id) else {
                return Err(EngineError::NotFound("Slot", *slot_id));
            };
            let booked = guards[i].booked();
            if spec.capacity < booked {
                return Err(EngineError::CapacityBelowBooked { capacity: spec.capacity, booked });
            }
            touched.push(i);
            events.push(Event::SlotUpdated {
                id: *slot_id,
                capacity: spec.capacity,
                resource_unit: spec.resource_unit.clone(),
                blackout: spec.blackout,
                notes: spec.notes.clone(),
            });
        }
        let created: Vec<(Ulid, SlotSpec)> = creates.into_iter().map(|spec| (Ulid::new(), spec)).collect();
        events.extend(
            created
                .iter()
                .map(|(id, spec)| Event::SlotCreated { id: *id, spec: spec.clone() }),
        );

        if !events.is_empty() {
            self.wal_append(&Event::Batch(events.clone())).await?;
        }
        for (&i, event) in touched.iter().zip(&events) {
            self.apply_to_slot(&mut guards[i], event);
        }
        for (slot_id, spec) in &created {
            self.apply_slot_created(&mut calendar, *slot_id, spec);
        }

        summary.created = created.len();
        summary.updated = touched.len();
        tracing::info!(
            "published template {id} for {start}..={end}: {} created, {} updated, {} skipped",
            summary.created,
            summary.updated,
            summary.skipped
        );
        Ok(summary)
    }

    async fn plan_template(
        &self,
        calendar: &Calendar,
        id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PlannedSlot>, EngineError> {
        check_apply_range(start, end)?;
        let template = self
            .templates
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(EngineError::NotFound("Template", id))?;
        let config = parse_config(&template.config)?;

        // Only the part of the range inside the template's active window.
        let start = template.active_from.map_or(start, |from| start.max(from));
        let end = template.active_to.map_or(end, |to| end.min(to));
        if start > end {
            return Ok(Vec::new());
        }

        let planned = plan_slots(&config, start, end)?;
        let mut existing = Vec::new();
        for slot_id in slots_between(calendar, start, end) {
            if let Some(slot) = self.get_slot(&slot_id) {
                existing.push((slot_id, slot.read().await.spec.clone()));
            }
        }
        Ok(diff(planned, &existing))
    }
}
