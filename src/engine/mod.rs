mod capacity;
mod error;
mod logistics;
mod mutations;
pub mod planner;
mod queries;
mod templates;

pub use error::EngineError;
pub use planner::TemplateConfig;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{DomainEventKind, NotifyHub};
use crate::wal::Wal;

pub(crate) use capacity::now_ms;

pub type SharedSlotState = Arc<RwLock<SlotState>>;
pub type Calendar = BTreeMap<SlotKey, Ulid>;
pub(super) type SlotWriteGuard = OwnedRwLockWriteGuard<SlotState>;

/// Ids of the slots dated within `[start, end]`, in calendar order.
pub(super) fn slots_between(calendar: &Calendar, start: NaiveDate, end: NaiveDate) -> Vec<Ulid> {
    calendar
        .range((start, NaiveTime::MIN)..)
        .take_while(|((date, _), _)| *date <= end)
        .map(|(_, id)| *id)
        .collect()
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, then one
/// flush + fsync for the lot before answering every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {}: {e}", wal.path().display());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak into
    // the next batch; the callers of this one are told it failed.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// One tenant's booking state, rebuilt from its WAL on open.
///
/// Lock order: `commit_gate` (shared by every mutation, exclusive for
/// compaction), then `calendar`, `catalog_lock` or `logistics_lock`, then
/// slot locks in ascending id order.
pub struct Engine {
    pub(super) slots: DashMap<Ulid, SharedSlotState>,
    /// `(date, start)` → slot id. Writers that add or remove slots, or touch
    /// many slots at once, hold its write lock.
    pub(super) calendar: RwLock<Calendar>,
    pub(super) booking_to_slot: DashMap<Ulid, Ulid>,
    pub(super) growers: DashMap<Ulid, String>,
    pub(super) cultivars: DashMap<Ulid, String>,
    /// Login secrets set in this tenant: its admin and any grower.
    pub(super) credentials: DashMap<Principal, Credential>,
    pub(super) templates: DashMap<Ulid, Template>,
    pub(super) consignments: DashMap<Ulid, Consignment>,
    /// Serializes grower, cultivar and template creation so the id check and
    /// the write are one step.
    pub(super) catalog_lock: Mutex<()>,
    /// Serializes consignment writes so number uniqueness and checkpoint
    /// order hold.
    pub(super) logistics_lock: Mutex<()>,
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    utc_offset: FixedOffset,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, utc_offset: FixedOffset) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self {
            slots: DashMap::new(),
            calendar: RwLock::new(BTreeMap::new()),
            booking_to_slot: DashMap::new(),
            growers: DashMap::new(),
            cultivars: DashMap::new(),
            credentials: DashMap::new(),
            templates: DashMap::new(),
            consignments: DashMap::new(),
            catalog_lock: Mutex::new(()),
            logistics_lock: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
            utc_offset,
        };

        let mut calendar = Calendar::new();
        for event in &events {
            engine.replay_event(&mut calendar, event);
        }
        *engine.calendar.get_mut() = calendar;
        tracing::info!(
            "replayed {} WAL records from {}: {} slots, {} bookings",
            events.len(),
            wal_path.display(),
            engine.slots.len(),
            engine.booking_to_slot.len()
        );

        Ok(engine)
    }

    /// Today's date in the packhouse's local time.
    pub fn today(&self) -> NaiveDate {
        self.local_now().date()
    }

    pub fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.utc_offset).naive_local()
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_slot.get(booking_id).map(|e| *e.value())
    }

    /// Write-lock a live slot. A slot deleted while we waited is reported missing.
    pub(super) async fn lock_slot(
        &self,
        id: Ulid,
        what: &'static str,
    ) -> Result<SlotWriteGuard, EngineError> {
        let slot = self.get_slot(&id).ok_or(EngineError::NotFound(what, id))?;
        let guard = slot.write_owned().await;
        if !self.slots.contains_key(&id) {
            return Err(EngineError::NotFound(what, id));
        }
        Ok(guard)
    }

    /// Write-lock several slots in ascending id order. Slots deleted in the
    /// meantime are left out.
    pub(super) async fn lock_slots_sorted(&self, mut ids: Vec<Ulid>) -> Vec<SlotWriteGuard> {
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(guard) = self.lock_slot(id, "Slot").await {
                guards.push(guard);
            }
        }
        guards
    }

    /// Lookup booking → slot, then write-lock that slot.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: Ulid,
    ) -> Result<SlotWriteGuard, EngineError> {
        let slot_id = self
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::NotFound("Booking", booking_id))?;
        let guard = self.lock_slot(slot_id, "Booking").await?;
        // A concurrent move may have taken it elsewhere between lookup and lock.
        if guard.booking(booking_id).is_none() {
            return Err(EngineError::NotFound("Booking", booking_id));
        }
        Ok(guard)
    }

    // ── Apply ────────────────────────────────────────────────

    pub(super) fn apply_slot_created(&self, calendar: &mut Calendar, id: Ulid, spec: &SlotSpec) {
        calendar.insert(spec.key(), id);
        self.slots
            .insert(id, Arc::new(RwLock::new(SlotState::new(id, spec.clone()))));
    }

    pub(super) fn apply_slot_deleted(&self, calendar: &mut Calendar, slot: &SlotState) {
        calendar.remove(&slot.spec.key());
        for booking in &slot.bookings {
            self.booking_to_slot.remove(&booking.id);
        }
        self.slots.remove(&slot.id);
    }

    /// Apply an event that touches exactly one slot (no locking, the caller holds it).
    pub(super) fn apply_to_slot(&self, slot: &mut SlotState, event: &Event) {
        match event {
            Event::SlotUpdated { capacity, resource_unit, blackout, notes, .. } => {
                slot.spec.capacity = *capacity;
                slot.spec.resource_unit = resource_unit.clone();
                slot.spec.blackout = *blackout;
                slot.spec.notes = notes.clone();
            }
            Event::RestrictionsGranted { grower_ids, cultivar_ids, .. } => {
                slot.allowed_growers.extend(grower_ids.iter().copied());
                slot.allowed_cultivars.extend(cultivar_ids.iter().copied());
            }
            Event::RestrictionsCleared { .. } => {
                slot.allowed_growers.clear();
                slot.allowed_cultivars.clear();
            }
            Event::BookingCreated { id, grower_id, cultivar_id, quantity, created_at, notes, .. } => {
                slot.bookings.push(Booking {
                    id: *id,
                    grower_id: *grower_id,
                    cultivar_id: *cultivar_id,
                    quantity: *quantity,
                    status: BookingStatus::Confirmed,
                    created_at: *created_at,
                    notes: notes.clone(),
                });
                self.booking_to_slot.insert(*id, slot.id);
            }
            Event::BookingCancelled { id, .. } => {
                if let Some(b) = slot.booking_mut(*id) {
                    b.status = BookingStatus::Cancelled;
                }
            }
            Event::BookingAmended { id, cultivar_id, quantity, .. } => {
                if let Some(b) = slot.booking_mut(*id) {
                    b.cultivar_id = *cultivar_id;
                    b.quantity = *quantity;
                }
            }
            _ => {}
        }
    }

    /// Apply a `BookingAmended` that moves a booking between two locked slots.
    pub(super) fn apply_move(&self, from: &mut SlotState, to: &mut SlotState, event: &Event) {
        if let Event::BookingAmended { id, cultivar_id, quantity, .. } = event
            && let Some(mut booking) = from.take_booking(*id)
        {
            booking.cultivar_id = *cultivar_id;
            booking.quantity = *quantity;
            to.bookings.push(booking);
            self.booking_to_slot.insert(*id, to.id);
        }
    }

    /// Apply catalog events (growers, cultivars, templates, consignments).
    pub(super) fn apply_catalog(&self, event: &Event) {
        match event {
            Event::GrowerRegistered { id, name } => {
                self.growers.insert(*id, name.clone());
            }
            Event::CultivarRegistered { id, name } => {
                self.cultivars.insert(*id, name.clone());
            }
            Event::CredentialSet { principal, credential } => {
                self.credentials.insert(*principal, credential.clone());
            }
            Event::TemplateSaved { id, name, description, config, active_from, active_to } => {
                self.templates.insert(
                    *id,
                    Template {
                        id: *id,
                        name: name.clone(),
                        description: description.clone(),
                        config: config.clone(),
                        active_from: *active_from,
                        active_to: *active_to,
                    },
                );
            }
            Event::TemplateDeleted { id } => {
                self.templates.remove(id);
            }
            Event::ConsignmentCreated {
                id,
                booking_id,
                grower_id,
                number,
                supplier_id,
                transporter_id,
                expected_quantity,
                created_at,
            } => {
                self.consignments.insert(
                    *id,
                    Consignment {
                        id: *id,
                        booking_id: *booking_id,
                        grower_id: *grower_id,
                        number: number.clone(),
                        supplier_id: *supplier_id,
                        transporter_id: *transporter_id,
                        expected_quantity: *expected_quantity,
                        actual_quantity: None,
                        status: ConsignmentStatus::Pending,
                        created_at: *created_at,
                        checkpoints: Vec::new(),
                    },
                );
            }
            Event::CheckpointRecorded { id, consignment_id, kind, at, payload, created_by } => {
                if let Some(mut c) = self.consignments.get_mut(consignment_id) {
                    logistics::apply_checkpoint(
                        &mut c,
                        Checkpoint {
                            id: *id,
                            kind: kind.clone(),
                            at: *at,
                            payload: payload.clone(),
                            created_by: created_by.clone(),
                        },
                    );
                }
            }
            _ => {}
        }
    }

    /// Replay a single event at startup. We're the sole owner of every lock
    /// here, so `try_write` always succeeds.
    fn replay_event(&self, calendar: &mut Calendar, event: &Event) {
        match event {
            Event::Batch(events) => {
                for e in events {
                    self.replay_event(calendar, e);
                }
            }
            Event::SlotCreated { id, spec } => self.apply_slot_created(calendar, *id, spec),
            Event::SlotDeleted { id } => {
                if let Some(slot) = self.get_slot(id)
                    && let Ok(guard) = slot.try_read()
                {
                    self.apply_slot_deleted(calendar, &guard);
                }
            }
            Event::BookingAmended { from_slot, to_slot, .. } if from_slot != to_slot => {
                let (Some(from), Some(to)) = (self.get_slot(from_slot), self.get_slot(to_slot)) else {
                    tracing::warn!("replay: move references a missing slot");
                    return;
                };
                if let (Ok(mut from), Ok(mut to)) = (from.try_write(), to.try_write()) {
                    self.apply_move(&mut from, &mut to, event);
                }
            }
            other => match event_slot_id(other) {
                Some(slot_id) => {
                    if let Some(slot) = self.get_slot(&slot_id)
                        && let Ok(mut guard) = slot.try_write()
                    {
                        self.apply_to_slot(&mut guard, other);
                    }
                }
                None => self.apply_catalog(other),
            },
        }
    }

    /// Publish the outbox record for a booking event.
    pub(super) fn publish_booking_event(&self, event: &Event, before: Option<&Booking>) {
        match event {
            Event::BookingCreated { id, slot_id, grower_id, cultivar_id, quantity, created_at, .. } => {
                self.notify.publish(
                    DomainEventKind::BookingCreated,
                    *id,
                    json!({
                        "booking_id": id.to_string(),
                        "slot_id": slot_id.to_string(),
                        "grower_id": grower_id.to_string(),
                        "cultivar_id": cultivar_id.map(|c| c.to_string()),
                        "quantity": quantity,
                    }),
                    *created_at,
                );
            }
            Event::BookingAmended { id, from_slot, to_slot, cultivar_id, quantity, at } => {
                self.notify.publish(
                    DomainEventKind::BookingUpdated,
                    *id,
                    json!({
                        "booking_id": id.to_string(),
                        "old_slot_id": from_slot.to_string(),
                        "new_slot_id": to_slot.to_string(),
                        "old_quantity": before.map(|b| b.quantity),
                        "new_quantity": quantity,
                        "old_cultivar_id": before.and_then(|b| b.cultivar_id).map(|c| c.to_string()),
                        "new_cultivar_id": cultivar_id.map(|c| c.to_string()),
                        "is_moved": from_slot != to_slot,
                    }),
                    *at,
                );
            }
            Event::BookingCancelled { id, slot_id, at } => {
                self.notify.publish(
                    DomainEventKind::BookingCancelled,
                    *id,
                    json!({
                        "booking_id": id.to_string(),
                        "slot_id": slot_id.to_string(),
                        "grower_id": before.map(|b| b.grower_id.to_string()),
                        "quantity": before.map(|b| b.quantity),
                    }),
                    *at,
                );
            }
            _ => {}
        }
    }
}

/// The slot a single-slot event applies to. `None` for catalog events.
fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotUpdated { id, .. } | Event::SlotCreated { id, .. } | Event::SlotDeleted { id } => Some(*id),
        Event::RestrictionsGranted { slot_id, .. }
        | Event::RestrictionsCleared { slot_id }
        | Event::BookingCreated { slot_id, .. }
        | Event::BookingCancelled { slot_id, .. } => Some(*slot_id),
        Event::BookingAmended { to_slot, .. } => Some(*to_slot),
        Event::GrowerRegistered { .. }
        | Event::CultivarRegistered { .. }
        | Event::TemplateSaved { .. }
        | Event::TemplateDeleted { .. }
        | Event::ConsignmentCreated { .. }
        | Event::CheckpointRecorded { .. }
        | Event::CredentialSet { .. }
        | Event::Batch(_) => None,
    }
}
