use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Unix milliseconds: instants (creation times, checkpoint stamps).
pub type Ms = i64;

/// Calendar key of a slot. At most one slot per key per tenant.
pub type SlotKey = (NaiveDate, NaiveTime);

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

pub fn fmt_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

pub fn fmt_time(t: NaiveTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

/// `HH:MM`, with `HH:MM:SS` tolerated for clients that send full times.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, TIME_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

/// Who is issuing a command. Admins manage the calendar; growers act only
/// for themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    Admin,
    Grower(Ulid),
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        matches!(self, Principal::Admin)
    }

    pub fn grower_id(&self) -> Option<Ulid> {
        match self {
            Principal::Admin => None,
            Principal::Grower(id) => Some(*id),
        }
    }

    pub fn can_act_for(&self, grower_id: Ulid) -> bool {
        match self {
            Principal::Admin => true,
            Principal::Grower(id) => *id == grower_id,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Principal::Admin => "admin",
            Principal::Grower(_) => "grower",
        }
    }
}

/// A tenant-scoped login secret. Only the salted SHA-256 of the password is
/// kept, in memory and in the WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub salt: String,
    pub digest: String,
}

impl Credential {
    pub fn new(password: &str) -> Self {
        let salt = Ulid::new().to_string();
        let digest = salted_digest(&salt, password);
        Self { salt, digest }
    }

    pub fn matches(&self, password: &str) -> bool {
        salted_digest(&self.salt, password) == self.digest
    }
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub grower_id: Ulid,
    pub cultivar_id: Option<Ulid>,
    pub quantity: u32,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub notes: Option<String>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// Everything about a slot apart from its bookings and restrictions.
/// This is also what templates plan and what bulk creation produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
    pub resource_unit: String,
    pub blackout: bool,
    pub notes: Option<String>,
}

impl SlotSpec {
    pub fn key(&self) -> SlotKey {
        (self.date, self.start_time)
    }
}

#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: Ulid,
    pub spec: SlotSpec,
    /// Growers allowed to book. Empty means everyone.
    pub allowed_growers: BTreeSet<Ulid>,
    /// Cultivars allowed to be booked. Empty means any (or none).
    pub allowed_cultivars: BTreeSet<Ulid>,
    /// All bookings ever made on this slot, cancelled ones included, in creation order.
    pub bookings: Vec<Booking>,
}

impl SlotState {
    pub fn new(id: Ulid, spec: SlotSpec) -> Self {
        Self {
            id,
            spec,
            allowed_growers: BTreeSet::new(),
            allowed_cultivars: BTreeSet::new(),
            bookings: Vec::new(),
        }
    }

    /// Sum of confirmed quantities.
    pub fn booked(&self) -> u32 {
        self.booked_excluding(None)
    }

    pub fn booked_excluding(&self, skip: Option<Ulid>) -> u32 {
        self.bookings
            .iter()
            .filter(|b| b.is_confirmed() && Some(b.id) != skip)
            .fold(0u32, |acc, b| acc.saturating_add(b.quantity))
    }

    pub fn remaining(&self) -> u32 {
        self.spec.capacity.saturating_sub(self.booked())
    }

    pub fn usage(&self) -> SlotUsage {
        let booked = self.booked();
        SlotUsage {
            capacity: self.spec.capacity,
            booked,
            remaining: self.spec.capacity.saturating_sub(booked),
        }
    }

    pub fn admits_grower(&self, grower_id: Ulid) -> bool {
        self.allowed_growers.is_empty() || self.allowed_growers.contains(&grower_id)
    }

    /// A cultivar allowlist requires the booking to name one of the listed cultivars.
    pub fn admits_cultivar(&self, cultivar_id: Option<Ulid>) -> bool {
        if self.allowed_cultivars.is_empty() {
            return true;
        }
        cultivar_id.is_some_and(|c| self.allowed_cultivars.contains(&c))
    }

    pub fn has_confirmed_bookings(&self) -> bool {
        self.bookings.iter().any(Booking::is_confirmed)
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn take_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUsage {
    pub capacity: u32,
    pub booked: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    /// Raw JSON as supplied; validated on save.
    pub config: String,
    pub active_from: Option<NaiveDate>,
    pub active_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsignmentStatus {
    Pending,
    InTransit,
    Delivered,
    Rejected,
}

impl ConsignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsignmentStatus::Pending => "pending",
            ConsignmentStatus::InTransit => "in_transit",
            ConsignmentStatus::Delivered => "delivered",
            ConsignmentStatus::Rejected => "rejected",
        }
    }

    /// Status a checkpoint of the given type moves the consignment to, if any.
    pub fn after_checkpoint(kind: &str) -> Option<Self> {
        match kind {
            "gate_in" | "weigh" | "quality_check" => Some(ConsignmentStatus::InTransit),
            "delivered" => Some(ConsignmentStatus::Delivered),
            "rejected" => Some(ConsignmentStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub id: Ulid,
    pub kind: String,
    pub at: Ms,
    pub payload: String,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consignment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub grower_id: Ulid,
    pub number: String,
    pub supplier_id: Ulid,
    pub transporter_id: Option<Ulid>,
    pub expected_quantity: u32,
    pub actual_quantity: Option<u32>,
    pub status: ConsignmentStatus,
    pub created_at: Ms,
    pub checkpoints: Vec<Checkpoint>,
}

/// The event types: flat, no nesting except `Batch`. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    GrowerRegistered {
        id: Ulid,
        name: String,
    },
    CultivarRegistered {
        id: Ulid,
        name: String,
    },
    SlotCreated {
        id: Ulid,
        spec: SlotSpec,
    },
    /// Full replacement of the editable fields; date and times never change.
    SlotUpdated {
        id: Ulid,
        capacity: u32,
        resource_unit: String,
        blackout: bool,
        notes: Option<String>,
    },
    SlotDeleted {
        id: Ulid,
    },
    RestrictionsGranted {
        slot_id: Ulid,
        grower_ids: Vec<Ulid>,
        cultivar_ids: Vec<Ulid>,
    },
    RestrictionsCleared {
        slot_id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        slot_id: Ulid,
        grower_id: Ulid,
        cultivar_id: Option<Ulid>,
        quantity: u32,
        created_at: Ms,
        notes: Option<String>,
    },
    /// Moves and/or resizes a confirmed booking. `from_slot == to_slot` when it stays put.
    BookingAmended {
        id: Ulid,
        from_slot: Ulid,
        to_slot: Ulid,
        cultivar_id: Option<Ulid>,
        quantity: u32,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
    TemplateSaved {
        id: Ulid,
        name: String,
        description: Option<String>,
        config: String,
        active_from: Option<NaiveDate>,
        active_to: Option<NaiveDate>,
    },
    TemplateDeleted {
        id: Ulid,
    },
    ConsignmentCreated {
        id: Ulid,
        booking_id: Ulid,
        grower_id: Ulid,
        number: String,
        supplier_id: Ulid,
        transporter_id: Option<Ulid>,
        expected_quantity: u32,
        created_at: Ms,
    },
    CheckpointRecorded {
        id: Ulid,
        consignment_id: Ulid,
        kind: String,
        at: Ms,
        payload: String,
        created_by: String,
    },
    /// Several events committed as one WAL record: replay sees all or none.
    Batch(Vec<Event>),
    /// Replaces the login secret of the tenant admin or one grower.
    CredentialSet {
        principal: Principal,
        credential: Credential,
    },
}

// ── Query results ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub spec: SlotSpec,
    pub usage: SlotUsage,
    pub allowed_growers: Vec<Ulid>,
    pub allowed_cultivars: Vec<Ulid>,
}

impl SlotInfo {
    pub fn from_state(slot: &SlotState) -> Self {
        Self {
            id: slot.id,
            spec: slot.spec.clone(),
            usage: slot.usage(),
            allowed_growers: slot.allowed_growers.iter().copied().collect(),
            allowed_cultivars: slot.allowed_cultivars.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub grower_id: Ulid,
    pub grower_name: Option<String>,
    pub cultivar_id: Option<Ulid>,
    pub cultivar_name: Option<String>,
    pub quantity: u32,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableSlot {
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub remaining: u32,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictionInfo {
    pub slot_id: Ulid,
    pub grower_ids: Vec<Ulid>,
    pub cultivar_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Skip,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanAction::Create => "create",
            PlanAction::Update => "update",
            PlanAction::Skip => "skip",
        }
    }
}

/// One row of a template preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSlot {
    pub action: PlanAction,
    /// Existing slot for updates and skips.
    pub slot_id: Option<Ulid>,
    pub spec: SlotSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlackoutSummary {
    pub affected_slots: usize,
    pub scope: &'static str,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsignmentInfo {
    pub consignment: Consignment,
    pub slot_date: Option<NaiveDate>,
}

impl ConsignmentInfo {
    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.consignment.checkpoints.last()
    }
}

// ── Command inputs ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkSlots {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// ISO weekday numbers, Mon=1..Sun=7.
    pub weekdays: Vec<u32>,
    pub slot_length_min: u32,
    pub capacity: u32,
    pub day_start: NaiveTime,
    pub day_end: NaiveTime,
    pub resource_unit: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotChanges {
    pub capacity: Option<u32>,
    pub blackout: Option<bool>,
    pub notes: Option<String>,
    pub resource_unit: Option<String>,
}

impl SlotChanges {
    pub fn is_empty(&self) -> bool {
        self.capacity.is_none()
            && self.blackout.is_none()
            && self.notes.is_none()
            && self.resource_unit.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingChanges {
    pub slot_id: Option<Ulid>,
    pub quantity: Option<u32>,
    pub cultivar_id: Option<Ulid>,
}

impl BookingChanges {
    pub fn is_empty(&self) -> bool {
        self.slot_id.is_none() && self.quantity.is_none() && self.cultivar_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlackoutScope {
    Day,
    Week,
}

impl BlackoutScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Some(BlackoutScope::Day),
            "week" => Some(BlackoutScope::Week),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlackoutScope::Day => "day",
            BlackoutScope::Week => "week",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionTarget {
    Slot(Ulid),
    Date(NaiveDate),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportFilter {
    pub grower_id: Option<Ulid>,
    pub cultivar_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInput {
    pub name: String,
    pub description: Option<String>,
    pub config: String,
    pub active_from: Option<NaiveDate>,
    pub active_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Option<String>,
    pub active_from: Option<NaiveDate>,
    pub active_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConsignment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub number: String,
    pub supplier_id: Ulid,
    pub transporter_id: Option<Ulid>,
    pub expected_quantity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(capacity: u32) -> SlotSpec {
        SlotSpec {
            date: NaiveDate::from_ymd_opt(2031, 3, 3).unwrap(),
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            capacity,
            resource_unit: "tons".into(),
            blackout: false,
            notes: None,
        }
    }

    fn booking(quantity: u32, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            grower_id: Ulid::new(),
            cultivar_id: None,
            quantity,
            status,
            created_at: 0,
            notes: None,
        }
    }

    #[test]
    fn usage_ignores_cancelled_bookings() {
        let mut slot = SlotState::new(Ulid::new(), spec(10));
        slot.bookings.push(booking(4, BookingStatus::Confirmed));
        slot.bookings.push(booking(5, BookingStatus::Cancelled));
        let usage = slot.usage();
        assert_eq!(usage.booked, 4);
        assert_eq!(usage.remaining, 6);
    }

    #[test]
    fn booked_excluding_skips_one_booking() {
        let mut slot = SlotState::new(Ulid::new(), spec(10));
        let a = booking(3, BookingStatus::Confirmed);
        let a_id = a.id;
        slot.bookings.push(a);
        slot.bookings.push(booking(2, BookingStatus::Confirmed));
        assert_eq!(slot.booked_excluding(Some(a_id)), 2);
    }

    #[test]
    fn cultivar_allowlist_requires_a_cultivar() {
        let mut slot = SlotState::new(Ulid::new(), spec(10));
        assert!(slot.admits_cultivar(None));
        let c = Ulid::new();
        slot.allowed_cultivars.insert(c);
        assert!(!slot.admits_cultivar(None));
        assert!(!slot.admits_cultivar(Some(Ulid::new())));
        assert!(slot.admits_cultivar(Some(c)));
    }

    #[test]
    fn dates_and_times_round_trip_text() {
        let d = parse_date("2031-12-01").unwrap();
        assert_eq!(fmt_date(d), "2031-12-01");
        assert_eq!(fmt_time(parse_time("07:05:00").unwrap()), "07:05");
        assert!(parse_date("01/12/2031").is_none());
        assert!(parse_time("25:00").is_none());
    }

    #[test]
    fn credential_keeps_only_a_salted_digest() {
        let a = Credential::new("orchard");
        let b = Credential::new("orchard");
        assert!(a.matches("orchard"));
        assert!(!a.matches("Orchard"));
        assert!(!a.matches(""));
        assert_ne!(a.digest, b.digest);
        assert!(!a.digest.contains("orchard"));
    }

    #[test]
    fn checkpoint_types_map_to_status() {
        assert_eq!(ConsignmentStatus::after_checkpoint("weigh"), Some(ConsignmentStatus::InTransit));
        assert_eq!(ConsignmentStatus::after_checkpoint("delivered"), Some(ConsignmentStatus::Delivered));
        assert_eq!(ConsignmentStatus::after_checkpoint("note"), None);
    }
}
