use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::DEFAULT_NEXT_AVAILABLE;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertGrower {
        id: Ulid,
        name: String,
        password: Option<String>,
    },
    /// Sets the password `login` (`admin` or `grower_<ULID>`) uses for this tenant.
    InsertCredential {
        principal: Principal,
        password: String,
    },
    SelectGrowers,
    InsertCultivar {
        id: Ulid,
        name: String,
    },
    SelectCultivars,
    InsertSlot {
        id: Ulid,
        spec: SlotSpec,
    },
    UpdateSlot {
        id: Ulid,
        changes: SlotChanges,
    },
    DeleteSlot {
        id: Ulid,
    },
    SelectSlots {
        date: Option<NaiveDate>,
    },
    SelectSlotRange {
        start: NaiveDate,
        end: NaiveDate,
    },
    SelectSlot {
        id: Ulid,
    },
    SelectSlotUsage {
        slot_id: Ulid,
    },
    InsertSlotSeries(BulkSlots),
    InsertBlackout {
        slot_id: Ulid,
        note: Option<String>,
    },
    InsertBulkBlackout {
        scope: BlackoutScope,
        start: NaiveDate,
        end: NaiveDate,
        note: Option<String>,
    },
    InsertRestrictions {
        target: RestrictionTarget,
        grower_ids: Vec<Ulid>,
        cultivar_ids: Vec<Ulid>,
    },
    DeleteRestrictions {
        slot_id: Ulid,
    },
    SelectRestrictions {
        slot_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        slot_id: Ulid,
        /// Growers may leave this out; it defaults to the caller.
        grower_id: Option<Ulid>,
        cultivar_id: Option<Ulid>,
        quantity: u32,
        notes: Option<String>,
    },
    UpdateBooking {
        id: Ulid,
        changes: BookingChanges,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        date: Option<NaiveDate>,
        grower_id: Option<Ulid>,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectNextAvailable {
        /// Raw text; interpreted in the tenant's local time by the engine.
        from: Option<String>,
        grower_id: Option<Ulid>,
        cultivar_id: Option<Ulid>,
        limit: usize,
    },
    InsertTemplate {
        id: Ulid,
        input: TemplateInput,
    },
    UpdateTemplate {
        id: Ulid,
        changes: TemplateChanges,
    },
    DeleteTemplate {
        id: Ulid,
    },
    SelectTemplates,
    SelectTemplate {
        id: Ulid,
    },
    SelectTemplatePlan {
        template_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
    InsertTemplatePublication {
        template_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        mode: ApplyMode,
    },
    SelectExport {
        start: NaiveDate,
        end: NaiveDate,
        filter: ExportFilter,
        csv: bool,
    },
    InsertConsignment(NewConsignment),
    SelectConsignments {
        date: Option<NaiveDate>,
    },
    InsertCheckpoint {
        id: Ulid,
        consignment_id: Ulid,
        kind: String,
        payload: Option<String>,
    },
    SelectCheckpoints {
        consignment_id: Ulid,
    },
    SelectDomainEvents {
        after_seq: u64,
    },
    SelectWhoami,
    SelectHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Preview,
    Publish,
}

impl ApplyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyMode::Preview => "preview",
            ApplyMode::Publish => "publish",
        }
    }
}

impl Command {
    /// Commands only the packhouse admin may run.
    pub fn admin_only(&self) -> bool {
        match self {
            Command::InsertGrower { .. }
            | Command::InsertCredential { .. }
            | Command::InsertCultivar { .. }
            | Command::InsertSlot { .. }
            | Command::UpdateSlot { .. }
            | Command::DeleteSlot { .. }
            | Command::InsertSlotSeries(_)
            | Command::InsertBlackout { .. }
            | Command::InsertBulkBlackout { .. }
            | Command::InsertRestrictions { .. }
            | Command::DeleteRestrictions { .. }
            | Command::InsertTemplate { .. }
            | Command::UpdateTemplate { .. }
            | Command::DeleteTemplate { .. }
            | Command::SelectTemplates
            | Command::SelectTemplate { .. }
            | Command::SelectTemplatePlan { .. }
            | Command::InsertTemplatePublication { .. }
            | Command::SelectExport { .. }
            | Command::SelectDomainEvents { .. } => true,
            Command::SelectGrowers
            | Command::SelectCultivars
            | Command::SelectSlots { .. }
            | Command::SelectSlotRange { .. }
            | Command::SelectSlot { .. }
            | Command::SelectSlotUsage { .. }
            | Command::SelectRestrictions { .. }
            | Command::InsertBooking { .. }
            | Command::UpdateBooking { .. }
            | Command::DeleteBooking { .. }
            | Command::SelectBookings { .. }
            | Command::SelectBooking { .. }
            | Command::SelectNextAvailable { .. }
            | Command::InsertConsignment(_)
            | Command::SelectConsignments { .. }
            | Command::InsertCheckpoint { .. }
            | Command::SelectCheckpoints { .. }
            | Command::SelectWhoami
            | Command::SelectHealth => false,
        }
    }
}

/// Statement kind, used to describe a prepared statement before its
/// parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Insert,
    Update,
    Delete,
    Select,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            let name = table_factor_name(&table.relation)?;
            parse_update(&name, assignments, selection.as_ref())
        }
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The verb and table of a statement, without interpreting its values.
pub fn statement_target(sql: &str) -> Option<(Verb, String)> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => Some((Verb::Insert, insert_table_name(insert).ok()?)),
        Statement::Update { table, .. } => Some((Verb::Update, table_factor_name(&table.relation).ok()?)),
        Statement::Delete(delete) => Some((Verb::Delete, delete_table_name(delete).ok()?)),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => {
                let from = select.from.first()?;
                Some((Verb::Select, table_factor_name(&from.relation).ok()?))
            }
            _ => None,
        },
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "growers" => {
            let row = Row::from_insert(&table, insert, &["id", "name", "password"])?;
            Ok(Command::InsertGrower {
                id: row.id()?,
                name: row.text("name")?,
                password: row.opt_text("password")?,
            })
        }
        "credentials" => {
            let row = Row::from_insert(&table, insert, &["login", "password"])?;
            let login = row.text("login")?;
            let principal = crate::auth::principal_for(&login)
                .ok_or_else(|| SqlError::Invalid(format!("unknown login: {login}")))?;
            Ok(Command::InsertCredential { principal, password: row.text("password")? })
        }
        "cultivars" => {
            let row = Row::from_insert(&table, insert, &["id", "name"])?;
            Ok(Command::InsertCultivar { id: row.id()?, name: row.text("name")? })
        }
        "slots" => {
            let row = Row::from_insert(&table, insert, &[
                "id", "date", "start_time", "end_time", "capacity", "resource_unit", "blackout", "notes",
            ])?;
            Ok(Command::InsertSlot {
                id: row.id()?,
                spec: SlotSpec {
                    date: row.date("date")?,
                    start_time: row.time("start_time")?,
                    end_time: row.time("end_time")?,
                    capacity: row.u32("capacity")?,
                    resource_unit: row.opt_text("resource_unit")?.unwrap_or_else(|| "tons".into()),
                    blackout: row.opt_bool("blackout")?.unwrap_or(false),
                    notes: row.opt_text("notes")?,
                },
            })
        }
        "slot_series" => {
            let row = Row::from_insert(&table, insert, &[
                "start_date",
                "end_date",
                "weekdays",
                "slot_length_min",
                "capacity",
                "day_start",
                "day_end",
                "resource_unit",
                "notes",
            ])?;
            let weekdays = row
                .list("weekdays")?
                .iter()
                .map(|s| {
                    s.parse::<u32>()
                        .map_err(|_| SqlError::Invalid(format!("invalid weekday: {s}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Command::InsertSlotSeries(BulkSlots {
                start_date: row.date("start_date")?,
                end_date: row.date("end_date")?,
                weekdays,
                slot_length_min: row.u32("slot_length_min")?,
                capacity: row.u32("capacity")?,
                day_start: row.opt_time("day_start")?.unwrap_or_else(|| default_day(true)),
                day_end: row.opt_time("day_end")?.unwrap_or_else(|| default_day(false)),
                resource_unit: row.opt_text("resource_unit")?,
                notes: row.opt_text("notes")?,
            }))
        }
        "blackouts" => {
            let row = Row::from_insert(&table, insert, &["slot_id", "scope", "start_date", "end_date", "note"])?;
            let note = row.opt_text("note")?;
            if let Some(slot_id) = row.opt_ulid("slot_id")? {
                return Ok(Command::InsertBlackout { slot_id, note });
            }
            let scope = match row.opt_text("scope")? {
                Some(s) => BlackoutScope::parse(&s).ok_or_else(|| SqlError::Invalid("Invalid scope".into()))?,
                None => BlackoutScope::Day,
            };
            Ok(Command::InsertBulkBlackout {
                scope,
                start: row.date("start_date")?,
                end: row.date("end_date")?,
                note,
            })
        }
        "restrictions" => {
            // `note` is accepted for compatibility and not stored.
            let row = Row::from_insert(&table, insert, &["slot_id", "restriction_date", "grower_ids", "cultivar_ids", "note"])?;
            let target = match (row.opt_ulid("slot_id")?, row.opt_date("restriction_date")?) {
                (Some(slot_id), _) => RestrictionTarget::Slot(slot_id),
                (None, Some(date)) => RestrictionTarget::Date(date),
                (None, None) => {
                    return Err(SqlError::Invalid(
                        "Either slot_id or restriction_date must be specified".into(),
                    ));
                }
            };
            Ok(Command::InsertRestrictions {
                target,
                grower_ids: row.ulids("grower_ids")?,
                cultivar_ids: row.ulids("cultivar_ids")?,
            })
        }
        "bookings" => {
            let row = Row::from_insert(&table, insert, &["id", "slot_id", "grower_id", "cultivar_id", "quantity", "notes"])?;
            Ok(Command::InsertBooking {
                id: row.id()?,
                slot_id: row.ulid("slot_id")?,
                grower_id: row.opt_ulid("grower_id")?,
                cultivar_id: row.opt_ulid("cultivar_id")?,
                quantity: row.u32("quantity")?,
                notes: row.opt_text("notes")?,
            })
        }
        "templates" => {
            let row = Row::from_insert(&table, insert, &["id", "name", "description", "config", "active_from", "active_to"])?;
            Ok(Command::InsertTemplate {
                id: row.id()?,
                input: TemplateInput {
                    name: row.text("name")?,
                    description: row.opt_text("description")?,
                    config: row.text("config")?,
                    active_from: row.opt_date("active_from")?,
                    active_to: row.opt_date("active_to")?,
                },
            })
        }
        "template_publications" => {
            let row = Row::from_insert(&table, insert, &["template_id", "start_date", "end_date", "mode"])?;
            let mode = match row.opt_text("mode")?.as_deref().map(str::to_ascii_lowercase).as_deref() {
                None | Some("publish") => ApplyMode::Publish,
                Some("preview") => ApplyMode::Preview,
                Some(other) => return Err(SqlError::Invalid(format!("Invalid mode: {other}"))),
            };
            Ok(Command::InsertTemplatePublication {
                template_id: row.ulid("template_id")?,
                start: row.date("start_date")?,
                end: row.date("end_date")?,
                mode,
            })
        }
        "consignments" => {
            let row = Row::from_insert(&table, insert, &[
                "id",
                "booking_id",
                "consignment_number",
                "supplier_id",
                "transporter_id",
                "expected_quantity",
            ])?;
            Ok(Command::InsertConsignment(NewConsignment {
                id: row.id()?,
                booking_id: row.ulid("booking_id")?,
                number: row.text("consignment_number")?,
                supplier_id: row.ulid("supplier_id")?,
                transporter_id: row.opt_ulid("transporter_id")?,
                expected_quantity: row.u32("expected_quantity")?,
            }))
        }
        "checkpoints" => {
            let row = Row::from_insert(&table, insert, &["id", "consignment_id", "type", "payload"])?;
            Ok(Command::InsertCheckpoint {
                id: row.id()?,
                consignment_id: row.ulid("consignment_id")?,
                kind: row.text("type")?,
                payload: row.opt_text("payload")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Bulk creation cuts 08:00-17:00 unless told otherwise.
fn default_day(start: bool) -> NaiveTime {
    let hour = if start { 8 } else { 17 };
    NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN)
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &str,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let id = || -> Result<Ulid, SqlError> { Row::from_filter(table, selection, &["id"])?.ulid("id") };

    match table {
        "slots" => {
            let row = Row::from_assignments(
                table,
                assignments,
                &["capacity", "blackout", "notes", "resource_unit"],
            )?;
            Ok(Command::UpdateSlot {
                id: id()?,
                changes: SlotChanges {
                    capacity: row.opt_u32("capacity")?,
                    blackout: row.opt_bool("blackout")?,
                    notes: row.opt_text("notes")?,
                    resource_unit: row.opt_text("resource_unit")?,
                },
            })
        }
        "bookings" => {
            let row = Row::from_assignments(table, assignments, &["slot_id", "quantity", "cultivar_id"])?;
            Ok(Command::UpdateBooking {
                id: id()?,
                changes: BookingChanges {
                    slot_id: row.opt_ulid("slot_id")?,
                    quantity: row.opt_u32("quantity")?,
                    cultivar_id: row.opt_ulid("cultivar_id")?,
                },
            })
        }
        "templates" => {
            let row = Row::from_assignments(
                table,
                assignments,
                &["name", "description", "config", "active_from", "active_to"],
            )?;
            Ok(Command::UpdateTemplate {
                id: id()?,
                changes: TemplateChanges {
                    name: row.opt_text("name")?,
                    description: row.opt_text("description")?,
                    config: row.opt_text("config")?,
                    active_from: row.opt_date("active_from")?,
                    active_to: row.opt_date("active_to")?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let selection = delete.selection.as_ref();

    match table.as_str() {
        "slots" => {
            let id = Row::from_filter(&table, selection, &["id"])?.ulid("id")?;
            Ok(Command::DeleteSlot { id })
        }
        "bookings" => {
            let id = Row::from_filter(&table, selection, &["id"])?.ulid("id")?;
            Ok(Command::DeleteBooking { id })
        }
        "templates" => {
            let id = Row::from_filter(&table, selection, &["id"])?.ulid("id")?;
            Ok(Command::DeleteTemplate { id })
        }
        "restrictions" => {
            let slot_id = Row::from_filter(&table, selection, &["slot_id"])?.ulid("slot_id")?;
            Ok(Command::DeleteRestrictions { slot_id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let selection = select.selection.as_ref();

    match table.as_str() {
        "growers" => {
            Row::from_filter(&table, selection, &[])?;
            Ok(Command::SelectGrowers)
        }
        "cultivars" => {
            Row::from_filter(&table, selection, &[])?;
            Ok(Command::SelectCultivars)
        }
        "slots" => {
            let row = Row::from_filter(&table, selection, &["id", "date", "start_date", "end_date"])?;
            if let Some(id) = row.opt_ulid("id")? {
                return Ok(Command::SelectSlot { id });
            }
            match (row.opt_date("start_date")?, row.opt_date("end_date")?) {
                (Some(start), Some(end)) => Ok(Command::SelectSlotRange { start, end }),
                (None, None) => Ok(Command::SelectSlots { date: row.opt_date("date")? }),
                (None, Some(_)) => Err(SqlError::MissingColumn("start_date")),
                (Some(_), None) => Err(SqlError::MissingColumn("end_date")),
            }
        }
        "slot_usage" => Ok(Command::SelectSlotUsage {
            slot_id: Row::from_filter(&table, selection, &["slot_id"])?.ulid("slot_id")?,
        }),
        "restrictions" => Ok(Command::SelectRestrictions {
            slot_id: Row::from_filter(&table, selection, &["slot_id"])?.ulid("slot_id")?,
        }),
        "bookings" => {
            let row = Row::from_filter(&table, selection, &["id", "date", "grower_id"])?;
            if let Some(id) = row.opt_ulid("id")? {
                return Ok(Command::SelectBooking { id });
            }
            Ok(Command::SelectBookings {
                date: row.opt_date("date")?,
                grower_id: row.opt_ulid("grower_id")?,
            })
        }
        "next_available" => {
            let row = Row::from_filter(&table, selection, &["from_datetime", "grower_id", "cultivar_id", "max_results"])?;
            Ok(Command::SelectNextAvailable {
                from: row.opt_text("from_datetime")?,
                grower_id: row.opt_ulid("grower_id")?,
                cultivar_id: row.opt_ulid("cultivar_id")?,
                limit: row
                    .opt_u32("max_results")?
                    .map_or(DEFAULT_NEXT_AVAILABLE, |n| n as usize),
            })
        }
        "templates" => {
            let row = Row::from_filter(&table, selection, &["id"])?;
            match row.opt_ulid("id")? {
                Some(id) => Ok(Command::SelectTemplate { id }),
                None => Ok(Command::SelectTemplates),
            }
        }
        "template_plan" => {
            let row = Row::from_filter(&table, selection, &["template_id", "start_date", "end_date"])?;
            Ok(Command::SelectTemplatePlan {
                template_id: row.ulid("template_id")?,
                start: row.date("start_date")?,
                end: row.date("end_date")?,
            })
        }
        "bookings_export" | "bookings_csv" => {
            let row = Row::from_filter(&table, selection, &["start_date", "end_date", "grower_id", "cultivar_id", "status"])?;
            let status = match row.opt_text("status")? {
                Some(s) => Some(
                    BookingStatus::parse(&s).ok_or_else(|| SqlError::Invalid(format!("Invalid status: {s}")))?,
                ),
                None => None,
            };
            Ok(Command::SelectExport {
                start: row.date("start_date")?,
                end: row.date("end_date")?,
                filter: ExportFilter {
                    grower_id: row.opt_ulid("grower_id")?,
                    cultivar_id: row.opt_ulid("cultivar_id")?,
                    status,
                },
                csv: table == "bookings_csv",
            })
        }
        "consignments" => Ok(Command::SelectConsignments {
            date: Row::from_filter(&table, selection, &["date"])?.opt_date("date")?,
        }),
        "checkpoints" => Ok(Command::SelectCheckpoints {
            consignment_id: Row::from_filter(&table, selection, &["consignment_id"])?.ulid("consignment_id")?,
        }),
        "domain_events" => {
            let row = Row::from_filter(&table, selection, &["after_seq"])?;
            let after_seq = match row.opt_text("after_seq")? {
                Some(s) => s
                    .parse()
                    .map_err(|_| SqlError::Invalid(format!("invalid after_seq: {s}")))?,
                None => 0,
            };
            Ok(Command::SelectDomainEvents { after_seq })
        }
        "whoami" => {
            Row::from_filter(&table, selection, &[])?;
            Ok(Command::SelectWhoami)
        }
        "health" => {
            Row::from_filter(&table, selection, &[])?;
            Ok(Command::SelectHealth)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Named columns ─────────────────────────────────────────────

/// Column/value pairs from an INSERT row, an UPDATE's SET list or a WHERE
/// clause of `col = value` terms joined by AND. Values are kept as text,
/// `None` for NULL.
struct Row {
    values: Vec<(String, Option<String>)>,
}

impl Row {
    fn new(table: &str, values: Vec<(String, Option<String>)>, allowed: &[&str]) -> Result<Self, SqlError> {
        if let Some((column, _)) = values.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn { table: table.to_string(), column: column.clone() });
        }
        Ok(Self { values })
    }

    fn from_insert(table: &str, insert: &ast::Insert, allowed: &[&str]) -> Result<Self, SqlError> {
        if insert.columns.is_empty() {
            return Err(SqlError::Parse(format!("INSERT INTO {table} requires a column list")));
        }
        let rows = extract_insert_rows(insert)?;
        if rows.len() != 1 {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        }
        let row = &rows[0];
        if row.len() != insert.columns.len() {
            return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
        }
        let values = insert
            .columns
            .iter()
            .zip(row)
            .map(|(col, expr)| Ok((col.value.to_lowercase(), literal(expr)?)))
            .collect::<Result<Vec<_>, SqlError>>()?;
        Self::new(table, values, allowed)
    }

    fn from_assignments(table: &str, assignments: &[ast::Assignment], allowed: &[&str]) -> Result<Self, SqlError> {
        let values = assignments
            .iter()
            .map(|a| {
                let column = match &a.target {
                    AssignmentTarget::ColumnName(name) => object_name_last(name),
                    AssignmentTarget::Tuple(_) => None,
                }
                .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
                Ok((column, literal(&a.value)?))
            })
            .collect::<Result<Vec<_>, SqlError>>()?;
        Self::new(table, values, allowed)
    }

    fn from_filter(table: &str, selection: Option<&Expr>, allowed: &[&str]) -> Result<Self, SqlError> {
        let mut values = Vec::new();
        if let Some(expr) = selection {
            collect_equalities(expr, &mut values)?;
        }
        Self::new(table, values, allowed)
    }

    fn get(&self, column: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(c, _)| c == column)
            .and_then(|(_, v)| v.as_deref())
    }

    fn require(&self, column: &'static str) -> Result<&str, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    /// The row's `id`, minted when the client leaves it out.
    fn id(&self) -> Result<Ulid, SqlError> {
        Ok(self.opt_ulid("id")?.unwrap_or_else(Ulid::new))
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        self.require(column).map(str::to_string)
    }

    fn opt_text(&self, column: &str) -> Result<Option<String>, SqlError> {
        Ok(self.get(column).map(str::to_string))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(column, self.require(column)?)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(|s| parse_ulid(column, s)).transpose()
    }

    fn ulids(&self, column: &str) -> Result<Vec<Ulid>, SqlError> {
        self.list(column)?.iter().map(|s| parse_ulid(column, s)).collect()
    }

    /// Comma separated, optionally wrapped in `{}` as PostgreSQL prints arrays.
    fn list(&self, column: &str) -> Result<Vec<String>, SqlError> {
        let Some(raw) = self.get(column) else {
            return Ok(Vec::new());
        };
        let raw = raw.trim();
        let raw = raw
            .strip_prefix('{')
            .and_then(|r| r.strip_suffix('}'))
            .unwrap_or(raw);
        Ok(raw
            .split(',')
            .map(|s| s.trim().trim_matches('"').to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    fn date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date(self.require(column)?).ok_or_else(|| SqlError::Invalid("Invalid date format".into()))
    }

    fn opt_date(&self, column: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.get(column)
            .map(|s| parse_date(s).ok_or_else(|| SqlError::Invalid("Invalid date format".into())))
            .transpose()
    }

    fn time(&self, column: &'static str) -> Result<NaiveTime, SqlError> {
        let raw = self.require(column)?;
        parse_time(raw).ok_or_else(|| SqlError::Invalid(format!("Invalid time format: {raw}")))
    }

    fn opt_time(&self, column: &str) -> Result<Option<NaiveTime>, SqlError> {
        self.get(column)
            .map(|raw| parse_time(raw).ok_or_else(|| SqlError::Invalid(format!("Invalid time format: {raw}"))))
            .transpose()
    }

    fn u32(&self, column: &'static str) -> Result<u32, SqlError> {
        parse_u32(column, self.require(column)?)
    }

    fn opt_u32(&self, column: &str) -> Result<Option<u32>, SqlError> {
        self.get(column).map(|s| parse_u32(column, s)).transpose()
    }

    fn opt_bool(&self, column: &str) -> Result<Option<bool>, SqlError> {
        self.get(column).map(|s| parse_bool(column, s)).transpose()
    }
}

fn collect_equalities(expr: &Expr, out: &mut Vec<(String, Option<String>)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, literal(right)?));
            Ok(())
        }
        Expr::Nested(inner) => collect_equalities(inner, out),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// Text of a literal. `ARRAY[...]` is flattened to comma separated text and
/// casts are looked through.
fn literal(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        return match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s)
            | Value::EscapedStringLiteral(s)
            | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            Value::Placeholder(p) => Err(SqlError::Parse(format!("unbound parameter {p}"))),
            _ => Err(SqlError::Parse(format!("unsupported value {value}"))),
        };
    }
    match expr {
        Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => {
            Ok(literal(expr)?.map(|s| format!("-{s}")))
        }
        Expr::Cast { expr, .. } | Expr::Nested(expr) => literal(expr),
        Expr::Array(array) => {
            let items = array
                .elem
                .iter()
                .map(|e| literal(e).map(Option::unwrap_or_default))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(items.join(",")))
        }
        _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(column: &str, s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Invalid(format!("invalid {column} '{s}': {e}")))
}

fn parse_u32(column: &str, s: &str) -> Result<u32, SqlError> {
    let s = s.trim();
    let v: i64 = s
        .parse()
        .map_err(|_| SqlError::Invalid(format!("{column} must be a whole number, got {s}")))?;
    u32::try_from(v).map_err(|_| SqlError::Invalid(format!("{column} must be positive, got {v}")))
}

fn parse_bool(column: &str, s: &str) -> Result<bool, SqlError> {
    match s.trim().to_lowercase().as_str() {
        "true" | "t" | "1" | "yes" => Ok(true),
        "false" | "f" | "0" | "no" => Ok(false),
        _ => Err(SqlError::Invalid(format!("{column} must be a boolean, got {s}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn { table: String, column: String },
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    /// Well-formed SQL carrying a value the command can't accept.
    Invalid(String),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Invalid(_) => "22023",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn { .. } => "42703",
            _ => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn { table, column } => write!(f, "unknown column {column} for {table}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SqlError {}
