use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::BOOKINGS_REJECTED;

use super::capacity::{
    check_admission, now_ms, validate_capacity_change, validate_name, validate_notes,
    validate_password, validate_quantity, validate_spec,
};
use super::planner::{blackout_range, clean_notes, expand_bulk, validate_bulk};
use super::{slots_between, Engine, EngineError, WalCommand};

fn rejected(e: EngineError) -> EngineError {
    metrics::counter!(BOOKINGS_REJECTED, "reason" => e.reason()).increment(1);
    e
}

impl Engine {
    async fn persist_and_apply(&self, slot: &mut SlotState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_slot(slot, event);
        Ok(())
    }

    async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        Ok(())
    }

    // ── Reference data ───────────────────────────────────────

    /// Register a grower, optionally with the password it logs in with.
    pub async fn register_grower(
        &self,
        id: Ulid,
        name: String,
        password: Option<String>,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        if let Some(p) = &password {
            validate_password(p)?;
        }
        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.growers.len() >= MAX_GROWERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many growers"));
        }
        if self.growers.contains_key(&id) {
            return Err(EngineError::AlreadyExists("Grower", id.to_string()));
        }

        let registered = Event::GrowerRegistered { id, name };
        match password {
            None => self.persist_catalog(&registered).await,
            Some(p) => {
                let credential = Event::CredentialSet {
                    principal: Principal::Grower(id),
                    credential: Credential::new(&p),
                };
                self.wal_append(&Event::Batch(vec![registered.clone(), credential.clone()]))
                    .await?;
                self.apply_catalog(&registered);
                self.apply_catalog(&credential);
                Ok(())
            }
        }
    }

    /// Set or replace the tenant's login secret for `principal`. Growers
    /// must be registered first.
    pub async fn set_credential(&self, principal: Principal, password: String) -> Result<(), EngineError> {
        validate_password(&password)?;
        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if let Principal::Grower(id) = principal
            && !self.growers.contains_key(&id)
        {
            return Err(EngineError::NotFound("Grower", id));
        }
        self.persist_catalog(&Event::CredentialSet {
            principal,
            credential: Credential::new(&password),
        })
        .await?;
        tracing::info!("{} credential updated", principal.role());
        Ok(())
    }

    pub async fn register_cultivar(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        validate_name(&name)?;
        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.cultivars.len() >= MAX_CULTIVARS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many cultivars"));
        }
        if self.cultivars.contains_key(&id) {
            return Err(EngineError::AlreadyExists("Cultivar", id.to_string()));
        }
        self.persist_catalog(&Event::CultivarRegistered { id, name }).await
    }

    // ── Slots ────────────────────────────────────────────────

    pub async fn create_slot(&self, id: Ulid, mut spec: SlotSpec) -> Result<(), EngineError> {
        spec.notes = clean_notes(spec.notes);
        validate_spec(&spec)?;
        if self.slots.len() >= MAX_SLOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many slots"));
        }

        let _gate = self.commit_gate.read().await;
        let mut calendar = self.calendar.write().await;
        if self.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists("Slot", id.to_string()));
        }
        if calendar.contains_key(&spec.key()) {
            return Err(EngineError::AlreadyExists(
                "Slot",
                format!("{} {}", fmt_date(spec.date), fmt_time(spec.start_time)),
            ));
        }

        self.wal_append(&Event::SlotCreated { id, spec: spec.clone() }).await?;
        self.apply_slot_created(&mut calendar, id, &spec);
        Ok(())
    }

    pub async fn update_slot(&self, id: Ulid, changes: SlotChanges) -> Result<(), EngineError> {
        if changes.is_empty() {
            return Err(EngineError::invalid("No fields to update"));
        }
        validate_notes(changes.notes.as_deref())?;

        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_slot(id, "Slot").await?;
        if let Some(capacity) = changes.capacity {
            validate_capacity_change(&guard, capacity)?;
        }
        let mut next = guard.spec.clone();
        next.capacity = changes.capacity.unwrap_or(next.capacity);
        next.blackout = changes.blackout.unwrap_or(next.blackout);
        if let Some(unit) = changes.resource_unit {
            next.resource_unit = unit;
        }
        if let Some(notes) = changes.notes {
            next.notes = clean_notes(Some(notes));
        }
        validate_spec(&next)?;

        let event = Event::SlotUpdated {
            id,
            capacity: next.capacity,
            resource_unit: next.resource_unit,
            blackout: next.blackout,
            notes: next.notes,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Only slots without confirmed bookings can go.
    pub async fn delete_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut calendar = self.calendar.write().await;
        let guard = self.lock_slot(id, "Slot").await?;
        if guard.has_confirmed_bookings() {
            return Err(EngineError::InvalidState("Cannot delete slot with confirmed bookings"));
        }
        self.wal_append(&Event::SlotDeleted { id }).await?;
        self.apply_slot_deleted(&mut calendar, &guard);
        tracing::debug!("deleted slot {id}");
        Ok(())
    }

    /// Create every slot `req` describes whose `(date, start)` is still free.
    /// Returns how many were created.
    pub async fn bulk_create_slots(&self, req: BulkSlots) -> Result<usize, EngineError> {
        validate_bulk(&req, self.today())?;
        let specs = expand_bulk(&req);
        if specs.len() > MAX_SLOTS_PER_APPLY {
            return Err(EngineError::LimitExceeded("too many slots in one request"));
        }

        let _gate = self.commit_gate.read().await;
        let mut calendar = self.calendar.write().await;
        let events: Vec<Event> = specs
            .into_iter()
            .filter(|spec| !calendar.contains_key(&spec.key()))
            .map(|spec| Event::SlotCreated { id: Ulid::new(), spec })
            .collect();
        if events.is_empty() {
            return Ok(0);
        }
        if self.slots.len() + events.len() > MAX_SLOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many slots"));
        }

        self.wal_append(&Event::Batch(events.clone())).await?;
        for event in &events {
            if let Event::SlotCreated { id, spec } = event {
                self.apply_slot_created(&mut calendar, *id, spec);
            }
        }
        tracing::info!(
            "bulk created {} slots between {} and {}",
            events.len(),
            req.start_date,
            req.end_date
        );
        Ok(events.len())
    }

    // ── Blackouts ────────────────────────────────────────────

    /// Black out one slot. Notes are replaced only when a note is given.
    pub async fn blackout_slot(&self, id: Ulid, note: Option<String>) -> Result<(), EngineError> {
        validate_notes(note.as_deref())?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_slot(id, "Slot").await?;
        let notes = clean_notes(note).or_else(|| guard.spec.notes.clone());
        let event = Event::SlotUpdated {
            id,
            capacity: guard.spec.capacity,
            resource_unit: guard.spec.resource_unit.clone(),
            blackout: true,
            notes,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Black out every slot in the range (widened to whole weeks for the week
    /// scope). Slots already blacked out are left alone.
    pub async fn bulk_blackout(
        &self,
        scope: BlackoutScope,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
        note: Option<String>,
    ) -> Result<BlackoutSummary, EngineError> {
        validate_notes(note.as_deref())?;
        let (start, end) = blackout_range(scope, start, end)?;
        let note = clean_notes(note);

        let _gate = self.commit_gate.read().await;
        let calendar = self.calendar.write().await;
        let mut guards = self.lock_slots_sorted(slots_between(&calendar, start, end)).await;

        let pending: Vec<usize> = (0..guards.len()).filter(|&i| !guards[i].spec.blackout).collect();
        let events: Vec<Event> = pending
            .iter()
            .map(|&i| {
                let g = &guards[i];
                Event::SlotUpdated {
                    id: g.id,
                    capacity: g.spec.capacity,
                    resource_unit: g.spec.resource_unit.clone(),
                    blackout: true,
                    notes: note.clone().or_else(|| g.spec.notes.clone()),
                }
            })
            .collect();

        if !events.is_empty() {
            self.wal_append(&Event::Batch(events.clone())).await?;
            for (&i, event) in pending.iter().zip(&events) {
                self.apply_to_slot(&mut guards[i], event);
            }
        }

        let affected_slots = guards.iter().filter(|g| g.spec.blackout).count();
        tracing::info!(
            "blackout {} {start}..={end}: {affected_slots} slots blacked out",
            scope.as_str()
        );
        Ok(BlackoutSummary {
            affected_slots,
            scope: scope.as_str(),
            start_date: start,
            end_date: end,
        })
    }

    // ── Restrictions ─────────────────────────────────────────

    /// Add growers and cultivars to the allowlists of one slot or of every
    /// slot on a date. Returns the number of slots touched.
    pub async fn apply_restrictions(
        &self,
        target: RestrictionTarget,
        grower_ids: Vec<Ulid>,
        cultivar_ids: Vec<Ulid>,
    ) -> Result<usize, EngineError> {
        if grower_ids.len() + cultivar_ids.len() > MAX_RESTRICTION_IDS {
            return Err(EngineError::LimitExceeded("too many restriction ids"));
        }
        if let Some(id) = grower_ids.iter().find(|id| !self.growers.contains_key(id)) {
            return Err(EngineError::NotFound("Grower", *id));
        }
        if let Some(id) = cultivar_ids.iter().find(|id| !self.cultivars.contains_key(id)) {
            return Err(EngineError::NotFound("Cultivar", *id));
        }

        let _gate = self.commit_gate.read().await;
        let mut guards = match target {
            RestrictionTarget::Slot(id) => vec![self.lock_slot(id, "Slot").await?],
            RestrictionTarget::Date(date) => {
                let calendar = self.calendar.read().await;
                self.lock_slots_sorted(slots_between(&calendar, date, date)).await
            }
        };
        if grower_ids.is_empty() && cultivar_ids.is_empty() {
            return Ok(0);
        }

        let events: Vec<Event> = guards
            .iter()
            .map(|g| Event::RestrictionsGranted {
                slot_id: g.id,
                grower_ids: grower_ids.clone(),
                cultivar_ids: cultivar_ids.clone(),
            })
            .collect();
        if events.is_empty() {
            return Ok(0);
        }
        self.wal_append(&Event::Batch(events.clone())).await?;
        for (guard, event) in guards.iter_mut().zip(&events) {
            self.apply_to_slot(guard, event);
        }
        Ok(guards.len())
    }

    pub async fn clear_restrictions(&self, slot_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_slot(slot_id, "Slot").await?;
        self.persist_and_apply(&mut guard, &Event::RestrictionsCleared { slot_id })
            .await
    }

    // ── Bookings ─────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_booking(
        &self,
        principal: Principal,
        id: Ulid,
        slot_id: Ulid,
        grower_id: Ulid,
        cultivar_id: Option<Ulid>,
        quantity: u32,
        notes: Option<String>,
    ) -> Result<(), EngineError> {
        if !principal.can_act_for(grower_id) {
            return Err(rejected(EngineError::Forbidden("Growers can only book for themselves")));
        }
        validate_quantity(quantity).map_err(rejected)?;
        validate_notes(notes.as_deref())?;
        if !self.growers.contains_key(&grower_id) {
            return Err(rejected(EngineError::NotFound("Grower", grower_id)));
        }
        if let Some(c) = cultivar_id
            && !self.cultivars.contains_key(&c)
        {
            return Err(rejected(EngineError::NotFound("Cultivar", c)));
        }
        if self.booking_to_slot.contains_key(&id) {
            return Err(EngineError::AlreadyExists("Booking", id.to_string()));
        }

        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_slot(slot_id, "Slot").await.map_err(rejected)?;
        check_admission(&guard, grower_id, cultivar_id, quantity, None, false).map_err(rejected)?;

        // Claim the id before the write; a concurrent create with the same
        // id (possibly on another slot) loses here.
        match self.booking_to_slot.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists("Booking", id.to_string())),
            Entry::Vacant(v) => {
                v.insert(slot_id);
            }
        }

        let event = Event::BookingCreated {
            id,
            slot_id,
            grower_id,
            cultivar_id,
            quantity,
            created_at: now_ms(),
            notes: clean_notes(notes),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.booking_to_slot.remove(&id);
            return Err(e);
        }
        self.publish_booking_event(&event, None);
        Ok(())
    }

    /// Soft delete: the booking stays on the slot with status `cancelled`.
    pub async fn cancel_booking(&self, principal: Principal, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_booking_write(id).await?;
        let before = guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::NotFound("Booking", id))?;
        if !principal.can_act_for(before.grower_id) {
            return Err(EngineError::Forbidden("Growers can only cancel their own bookings"));
        }
        if !before.is_confirmed() {
            return Err(EngineError::InvalidState("Booking is already cancelled"));
        }

        let slot_id = guard.id;
        let event = Event::BookingCancelled { id, slot_id, at: now_ms() };
        self.persist_and_apply(&mut guard, &event).await?;
        self.publish_booking_event(&event, Some(&before));
        Ok(slot_id)
    }

    /// Resize, re-cultivar and/or move a confirmed booking.
    ///
    /// A move holds both slot locks (ascending id order) across the check and
    /// the write, so the target can't fill up in between.
    pub async fn update_booking(
        &self,
        principal: Principal,
        id: Ulid,
        changes: BookingChanges,
    ) -> Result<(), EngineError> {
        if changes.is_empty() {
            return Err(EngineError::invalid("No fields to update"));
        }
        if let Some(q) = changes.quantity {
            validate_quantity(q).map_err(rejected)?;
        }
        if let Some(c) = changes.cultivar_id
            && !self.cultivars.contains_key(&c)
        {
            return Err(rejected(EngineError::NotFound("Cultivar", c)));
        }

        let _gate = self.commit_gate.read().await;
        let from_id = self
            .slot_for_booking(&id)
            .ok_or(EngineError::NotFound("Booking", id))?;
        let to_id = changes.slot_id.unwrap_or(from_id);

        if to_id == from_id {
            let mut guard = self.resolve_booking_write(id).await?;
            let before = self.check_updatable(&guard, principal, id)?;
            let quantity = changes.quantity.unwrap_or(before.quantity);
            let cultivar_id = changes.cultivar_id.or(before.cultivar_id);
            if cultivar_id != before.cultivar_id && !guard.admits_cultivar(cultivar_id) {
                return Err(rejected(EngineError::Restricted("Cultivar is not allowed in this slot")));
            }
            let available = guard.spec.capacity.saturating_sub(guard.booked_excluding(Some(id)));
            if quantity > before.quantity && quantity > available {
                return Err(rejected(EngineError::InsufficientCapacity {
                    available,
                    requested: quantity,
                    moving: false,
                }));
            }

            let event = Event::BookingAmended {
                id,
                from_slot: from_id,
                to_slot: to_id,
                cultivar_id,
                quantity,
                at: now_ms(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            self.publish_booking_event(&event, Some(&before));
            return Ok(());
        }

        let (mut from, mut to) = if from_id < to_id {
            let from = self.lock_slot(from_id, "Booking").await?;
            let to = self.lock_slot(to_id, "Target slot").await.map_err(rejected)?;
            (from, to)
        } else {
            let to = self.lock_slot(to_id, "Target slot").await.map_err(rejected)?;
            let from = self.lock_slot(from_id, "Booking").await?;
            (from, to)
        };
        let before = self.check_updatable(&from, principal, id)?;
        let quantity = changes.quantity.unwrap_or(before.quantity);
        let cultivar_id = changes.cultivar_id.or(before.cultivar_id);
        check_admission(&to, before.grower_id, cultivar_id, quantity, None, true).map_err(rejected)?;

        let event = Event::BookingAmended {
            id,
            from_slot: from_id,
            to_slot: to_id,
            cultivar_id,
            quantity,
            at: now_ms(),
        };
        self.wal_append(&event).await?;
        self.apply_move(&mut from, &mut to, &event);
        self.publish_booking_event(&event, Some(&before));
        Ok(())
    }

    /// The booking as it stands, if `principal` may change it.
    fn check_updatable(
        &self,
        slot: &SlotState,
        principal: Principal,
        id: Ulid,
    ) -> Result<Booking, EngineError> {
        // A concurrent move may have taken it elsewhere between lookup and lock.
        let booking = slot
            .booking(id)
            .cloned()
            .ok_or(EngineError::NotFound("Booking", id))?;
        if !principal.can_act_for(booking.grower_id) {
            return Err(EngineError::Forbidden("Growers can only update their own bookings"));
        }
        if !booking.is_confirmed() {
            return Err(EngineError::InvalidState("Cannot update cancelled booking"));
        }
        Ok(booking)
    }

    /// Rewrite the WAL with just the events needed to rebuild current state.
    /// Holds the commit gate exclusively so the snapshot and the swap see no
    /// concurrent writes.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut growers: Vec<(Ulid, String)> =
            self.growers.iter().map(|e| (*e.key(), e.value().clone())).collect();
        growers.sort();
        events.extend(growers.into_iter().map(|(id, name)| Event::GrowerRegistered { id, name }));

        let mut cultivars: Vec<(Ulid, String)> =
            self.cultivars.iter().map(|e| (*e.key(), e.value().clone())).collect();
        cultivars.sort();
        events.extend(cultivars.into_iter().map(|(id, name)| Event::CultivarRegistered { id, name }));

        let mut credentials: Vec<(Principal, Credential)> =
            self.credentials.iter().map(|e| (*e.key(), e.value().clone())).collect();
        credentials.sort_by_key(|(p, _)| p.grower_id());
        events.extend(
            credentials
                .into_iter()
                .map(|(principal, credential)| Event::CredentialSet { principal, credential }),
        );

        let mut templates: Vec<Template> = self.templates.iter().map(|e| e.value().clone()).collect();
        templates.sort_by_key(|t| t.id);
        events.extend(templates.into_iter().map(|t| Event::TemplateSaved {
            id: t.id,
            name: t.name,
            description: t.description,
            config: t.config,
            active_from: t.active_from,
            active_to: t.active_to,
        }));

        let calendar = self.calendar.read().await;
        for id in calendar.values() {
            let Some(slot) = self.get_slot(id) else { continue };
            let guard = slot.read().await;
            events.push(Event::SlotCreated { id: guard.id, spec: guard.spec.clone() });
            if !guard.allowed_growers.is_empty() || !guard.allowed_cultivars.is_empty() {
                events.push(Event::RestrictionsGranted {
                    slot_id: guard.id,
                    grower_ids: guard.allowed_growers.iter().copied().collect(),
                    cultivar_ids: guard.allowed_cultivars.iter().copied().collect(),
                });
            }
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    slot_id: guard.id,
                    grower_id: b.grower_id,
                    cultivar_id: b.cultivar_id,
                    quantity: b.quantity,
                    created_at: b.created_at,
                    notes: b.notes.clone(),
                });
                if !b.is_confirmed() {
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        slot_id: guard.id,
                        at: b.created_at,
                    });
                }
            }
        }
        drop(calendar);

        let mut consignments: Vec<Consignment> =
            self.consignments.iter().map(|e| e.value().clone()).collect();
        consignments.sort_by_key(|c| (c.created_at, c.id));
        for c in consignments {
            events.push(Event::ConsignmentCreated {
                id: c.id,
                booking_id: c.booking_id,
                grower_id: c.grower_id,
                number: c.number,
                supplier_id: c.supplier_id,
                transporter_id: c.transporter_id,
                expected_quantity: c.expected_quantity,
                created_at: c.created_at,
            });
            events.extend(c.checkpoints.into_iter().map(|cp| Event::CheckpointRecorded {
                id: cp.id,
                consignment_id: c.id,
                kind: cp.kind,
                at: cp.at,
                payload: cp.payload,
                created_by: cp.created_by,
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
