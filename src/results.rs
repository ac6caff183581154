//! Row shapes of every result set the server returns, and their encoding.

use std::sync::Arc;

use futures::stream;
use pgwire::api::Type;
use pgwire::api::results::{DataRowEncoder, FieldFormat, FieldInfo, QueryResponse, Response};
use pgwire::error::PgWireResult;
use ulid::Ulid;

use crate::model::*;
use crate::notify::DomainEvent;
use crate::sql::Verb;

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn text(name: &str) -> FieldInfo {
    field(name, Type::VARCHAR)
}

fn int(name: &str) -> FieldInfo {
    field(name, Type::INT8)
}

fn boolean(name: &str) -> FieldInfo {
    field(name, Type::BOOL)
}

fn opt_id(id: Option<Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn join_ids(ids: &[Ulid]) -> String {
    ids.iter().map(Ulid::to_string).collect::<Vec<_>>().join(",")
}

/// One query response with a row per item.
fn respond<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<_> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Schemas ───────────────────────────────────────────────────

pub fn named_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name")]
}

pub fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        int("capacity"),
        int("booked"),
        int("remaining"),
        text("resource_unit"),
        boolean("blackout"),
        text("notes"),
        text("grower_ids"),
        text("cultivar_ids"),
    ]
}

pub fn usage_schema() -> Vec<FieldInfo> {
    vec![text("slot_id"), int("capacity"), int("booked"), int("remaining")]
}

pub fn series_schema() -> Vec<FieldInfo> {
    vec![int("count"), text("message")]
}

pub fn blackout_schema() -> Vec<FieldInfo> {
    vec![int("affected_slots"), text("scope"), text("start_date"), text("end_date")]
}

pub fn restriction_schema() -> Vec<FieldInfo> {
    vec![text("slot_id"), text("grower_ids"), text("cultivar_ids")]
}

pub fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("slot_id"),
        text("slot_date"),
        text("start_time"),
        text("end_time"),
        text("grower_id"),
        text("grower_name"),
        text("cultivar_id"),
        text("cultivar_name"),
        int("quantity"),
        text("status"),
        int("created_at"),
        text("notes"),
    ]
}

pub fn available_schema() -> Vec<FieldInfo> {
    vec![
        text("slot_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        int("remaining"),
        text("notes"),
    ]
}

pub fn template_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        text("description"),
        text("config"),
        text("active_from"),
        text("active_to"),
    ]
}

pub fn plan_schema() -> Vec<FieldInfo> {
    vec![
        text("action"),
        text("slot_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        int("capacity"),
        text("resource_unit"),
        boolean("blackout"),
        text("notes"),
    ]
}

pub fn publication_schema() -> Vec<FieldInfo> {
    vec![text("mode"), int("created"), int("updated"), int("skipped")]
}

pub fn export_schema() -> Vec<FieldInfo> {
    vec![
        text("booking_id"),
        text("slot_date"),
        text("start_time"),
        text("end_time"),
        text("grower_name"),
        text("cultivar_name"),
        int("quantity"),
        text("status"),
        text("notes"),
    ]
}

pub fn csv_schema() -> Vec<FieldInfo> {
    vec![text("filename"), text("content")]
}

pub fn consignment_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("booking_id"),
        text("consignment_number"),
        text("supplier_id"),
        text("transporter_id"),
        int("expected_quantity"),
        int("actual_quantity"),
        text("status"),
        text("slot_date"),
        int("created_at"),
        text("latest_checkpoint"),
        int("latest_checkpoint_at"),
    ]
}

pub fn checkpoint_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("type"),
        int("at"),
        text("payload"),
        text("created_by"),
    ]
}

pub fn checkpoint_status_schema() -> Vec<FieldInfo> {
    vec![text("consignment_id"), text("status")]
}

pub fn event_schema() -> Vec<FieldInfo> {
    vec![
        int("seq"),
        text("kind"),
        text("aggregate_id"),
        text("payload"),
        int("at"),
    ]
}

pub fn whoami_schema() -> Vec<FieldInfo> {
    vec![text("role"), text("grower_id"), text("tenant")]
}

pub fn health_schema() -> Vec<FieldInfo> {
    vec![text("status"), text("version")]
}

/// Result columns of a statement, known from its verb and table alone.
/// Empty for statements that only return a command tag.
pub fn schema_for(verb: Verb, table: &str) -> Vec<FieldInfo> {
    match (verb, table) {
        (Verb::Select, "growers" | "cultivars") => named_schema(),
        (Verb::Select, "slots") => slot_schema(),
        (Verb::Select, "slot_usage") => usage_schema(),
        (Verb::Select, "restrictions") => restriction_schema(),
        (Verb::Select, "bookings") => booking_schema(),
        (Verb::Select, "next_available") => available_schema(),
        (Verb::Select, "templates") => template_schema(),
        (Verb::Select, "template_plan") => plan_schema(),
        (Verb::Select, "bookings_export") => export_schema(),
        (Verb::Select, "bookings_csv") => csv_schema(),
        (Verb::Select, "consignments") => consignment_schema(),
        (Verb::Select, "checkpoints") => checkpoint_schema(),
        (Verb::Select, "domain_events") => event_schema(),
        (Verb::Select, "whoami") => whoami_schema(),
        (Verb::Select, "health") => health_schema(),
        (Verb::Insert, "slot_series") => series_schema(),
        (Verb::Insert, "blackouts") => blackout_schema(),
        (Verb::Insert, "template_publications") => publication_schema(),
        (Verb::Insert, "checkpoints") => checkpoint_status_schema(),
        _ => Vec::new(),
    }
}

// ── Rows ──────────────────────────────────────────────────────

pub fn named(items: Vec<NamedInfo>) -> Response {
    respond(named_schema(), items, |e, n| {
        e.encode_field(&n.id.to_string())?;
        e.encode_field(&n.name)
    })
}

pub fn slots(items: Vec<SlotInfo>) -> Response {
    respond(slot_schema(), items, |e, s| {
        e.encode_field(&s.id.to_string())?;
        e.encode_field(&fmt_date(s.spec.date))?;
        e.encode_field(&fmt_time(s.spec.start_time))?;
        e.encode_field(&fmt_time(s.spec.end_time))?;
        e.encode_field(&i64::from(s.usage.capacity))?;
        e.encode_field(&i64::from(s.usage.booked))?;
        e.encode_field(&i64::from(s.usage.remaining))?;
        e.encode_field(&s.spec.resource_unit)?;
        e.encode_field(&s.spec.blackout)?;
        e.encode_field(&s.spec.notes)?;
        e.encode_field(&join_ids(&s.allowed_growers))?;
        e.encode_field(&join_ids(&s.allowed_cultivars))
    })
}

pub fn usage(slot_id: Ulid, u: SlotUsage) -> Response {
    respond(usage_schema(), [u], |e, u| {
        e.encode_field(&slot_id.to_string())?;
        e.encode_field(&i64::from(u.capacity))?;
        e.encode_field(&i64::from(u.booked))?;
        e.encode_field(&i64::from(u.remaining))
    })
}

pub fn series(count: usize) -> Response {
    respond(series_schema(), [count], |e, count| {
        e.encode_field(&(count as i64))?;
        e.encode_field(&format!("Created {count} slots"))
    })
}

pub fn blackout(summary: BlackoutSummary) -> Response {
    respond(blackout_schema(), [summary], |e, s| {
        e.encode_field(&(s.affected_slots as i64))?;
        e.encode_field(&s.scope)?;
        e.encode_field(&fmt_date(s.start_date))?;
        e.encode_field(&fmt_date(s.end_date))
    })
}

pub fn restrictions(info: RestrictionInfo) -> Response {
    respond(restriction_schema(), [info], |e, r| {
        e.encode_field(&r.slot_id.to_string())?;
        e.encode_field(&join_ids(&r.grower_ids))?;
        e.encode_field(&join_ids(&r.cultivar_ids))
    })
}

pub fn bookings(items: Vec<BookingInfo>) -> Response {
    respond(booking_schema(), items, |e, b| {
        e.encode_field(&b.id.to_string())?;
        e.encode_field(&b.slot_id.to_string())?;
        e.encode_field(&fmt_date(b.slot_date))?;
        e.encode_field(&fmt_time(b.start_time))?;
        e.encode_field(&fmt_time(b.end_time))?;
        e.encode_field(&b.grower_id.to_string())?;
        e.encode_field(&b.grower_name)?;
        e.encode_field(&opt_id(b.cultivar_id))?;
        e.encode_field(&b.cultivar_name)?;
        e.encode_field(&i64::from(b.quantity))?;
        e.encode_field(&b.status.as_str())?;
        e.encode_field(&b.created_at)?;
        e.encode_field(&b.notes)
    })
}

pub fn available(items: Vec<AvailableSlot>) -> Response {
    respond(available_schema(), items, |e, a| {
        e.encode_field(&a.slot_id.to_string())?;
        e.encode_field(&fmt_date(a.date))?;
        e.encode_field(&fmt_time(a.start_time))?;
        e.encode_field(&fmt_time(a.end_time))?;
        e.encode_field(&i64::from(a.remaining))?;
        e.encode_field(&a.notes)
    })
}

pub fn templates(items: Vec<Template>) -> Response {
    respond(template_schema(), items, |e, t| {
        e.encode_field(&t.id.to_string())?;
        e.encode_field(&t.name)?;
        e.encode_field(&t.description)?;
        e.encode_field(&t.config)?;
        e.encode_field(&t.active_from.map(fmt_date))?;
        e.encode_field(&t.active_to.map(fmt_date))
    })
}

pub fn plan(items: Vec<PlannedSlot>) -> Response {
    respond(plan_schema(), items, |e, p| {
        e.encode_field(&p.action.as_str())?;
        e.encode_field(&opt_id(p.slot_id))?;
        e.encode_field(&fmt_date(p.spec.date))?;
        e.encode_field(&fmt_time(p.spec.start_time))?;
        e.encode_field(&fmt_time(p.spec.end_time))?;
        e.encode_field(&i64::from(p.spec.capacity))?;
        e.encode_field(&p.spec.resource_unit)?;
        e.encode_field(&p.spec.blackout)?;
        e.encode_field(&p.spec.notes)
    })
}

pub fn publication(mode: &'static str, summary: PublishSummary) -> Response {
    respond(publication_schema(), [summary], |e, s| {
        e.encode_field(&mode)?;
        e.encode_field(&(s.created as i64))?;
        e.encode_field(&(s.updated as i64))?;
        e.encode_field(&(s.skipped as i64))
    })
}

pub fn export(items: Vec<BookingInfo>) -> Response {
    respond(export_schema(), items, |e, b| {
        e.encode_field(&b.id.to_string())?;
        e.encode_field(&fmt_date(b.slot_date))?;
        e.encode_field(&fmt_time(b.start_time))?;
        e.encode_field(&fmt_time(b.end_time))?;
        e.encode_field(&b.grower_name)?;
        e.encode_field(&b.cultivar_name)?;
        e.encode_field(&i64::from(b.quantity))?;
        e.encode_field(&b.status.as_str())?;
        e.encode_field(&b.notes)
    })
}

pub fn csv(filename: String, content: String) -> Response {
    respond(csv_schema(), [(filename, content)], |e, (filename, content)| {
        e.encode_field(&filename)?;
        e.encode_field(&content)
    })
}

pub fn consignments(items: Vec<ConsignmentInfo>) -> Response {
    respond(consignment_schema(), items, |e, info| {
        let latest = info.latest_checkpoint();
        let latest_kind = latest.map(|cp| cp.kind.clone());
        let latest_at = latest.map(|cp| cp.at);
        let c = &info.consignment;
        e.encode_field(&c.id.to_string())?;
        e.encode_field(&c.booking_id.to_string())?;
        e.encode_field(&c.number)?;
        e.encode_field(&c.supplier_id.to_string())?;
        e.encode_field(&opt_id(c.transporter_id))?;
        e.encode_field(&i64::from(c.expected_quantity))?;
        e.encode_field(&c.actual_quantity.map(i64::from))?;
        e.encode_field(&c.status.as_str())?;
        e.encode_field(&info.slot_date.map(fmt_date))?;
        e.encode_field(&c.created_at)?;
        e.encode_field(&latest_kind)?;
        e.encode_field(&latest_at)
    })
}

pub fn checkpoints(items: Vec<Checkpoint>) -> Response {
    respond(checkpoint_schema(), items, |e, cp| {
        e.encode_field(&cp.id.to_string())?;
        e.encode_field(&cp.kind)?;
        e.encode_field(&cp.at)?;
        e.encode_field(&cp.payload)?;
        e.encode_field(&cp.created_by)
    })
}

pub fn checkpoint_status(consignment_id: Ulid, status: ConsignmentStatus) -> Response {
    respond(checkpoint_status_schema(), [status], |e, status| {
        e.encode_field(&consignment_id.to_string())?;
        e.encode_field(&status.as_str())
    })
}

pub fn events(items: Vec<DomainEvent>) -> Response {
    respond(event_schema(), items, |e, ev| {
        e.encode_field(&(ev.seq as i64))?;
        e.encode_field(&ev.kind.as_str())?;
        e.encode_field(&ev.aggregate_id.to_string())?;
        e.encode_field(&ev.payload.to_string())?;
        e.encode_field(&ev.at)
    })
}

pub fn whoami(principal: Principal, tenant: &str) -> Response {
    let tenant = tenant.to_string();
    respond(whoami_schema(), [principal], |e, p| {
        e.encode_field(&p.role())?;
        e.encode_field(&opt_id(p.grower_id()))?;
        e.encode_field(&tenant)
    })
}

pub fn health() -> Response {
    respond(health_schema(), [()], |e, ()| {
        e.encode_field(&"ok")?;
        e.encode_field(&env!("CARGO_PKG_VERSION"))
    })
}
