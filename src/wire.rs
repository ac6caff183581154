use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DescribePortalResponse, DescribeStatementResponse, FieldInfo, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{self, PackslotStartupHandler};
use crate::engine::{Engine, EngineError};
use crate::export;
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::results;
use crate::sql::{self, ApplyMode, Command, SqlError};
use crate::tenant::TenantManager;

/// Who is connected, and to which tenant.
struct Session {
    engine: Arc<Engine>,
    principal: Principal,
    tenant: String,
}

pub struct PackslotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<PackslotQueryParser>,
}

impl PackslotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(PackslotQueryParser),
        }
    }

    async fn session<C: ClientInfo + Sync>(&self, client: &C) -> PgWireResult<Session> {
        let metadata = client.metadata();
        let user = metadata.get("user").map(String::as_str).unwrap_or_default();
        let principal = auth::principal_for(user)
            .ok_or_else(|| user_error("28000", format!("no role for user {user:?}")))?;
        let tenant = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let engine = self
            .tenant_manager
            .get_or_create(&tenant)
            .await
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))?;
        Ok(Session { engine, principal, tenant })
    }

    /// Parse, authorize and run one statement, recording query metrics.
    async fn run(&self, session: &Session, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(session, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!("{label} failed for {}: {e}", session.tenant);
        }
        result
    }

    async fn execute_command(&self, session: &Session, cmd: Command) -> PgWireResult<Response> {
        let Session { engine, principal, tenant } = session;
        let principal = *principal;
        if cmd.admin_only() && !principal.is_admin() {
            return Err(user_error("42501", "Admin access required".into()));
        }

        match cmd {
            // ── Reference data ───────────────────────────────
            Command::InsertGrower { id, name, password } => {
                engine.register_grower(id, name, password).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertCredential { principal, password } => {
                engine.set_credential(principal, password).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SelectGrowers => Ok(results::named(engine.list_growers())),
            Command::InsertCultivar { id, name } => {
                engine.register_cultivar(id, name).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SelectCultivars => Ok(results::named(engine.list_cultivars())),

            // ── Slots ────────────────────────────────────────
            Command::InsertSlot { id, spec } => {
                engine.create_slot(id, spec).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateSlot { id, changes } => {
                engine.update_slot(id, changes).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteSlot { id } => {
                engine.delete_slot(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectSlots { date } => Ok(results::slots(engine.list_slots(date).await)),
            Command::SelectSlotRange { start, end } => {
                let slots = engine.slots_range(start, end).await.map_err(engine_err)?;
                Ok(results::slots(slots))
            }
            Command::SelectSlot { id } => {
                let slot = engine.slot_info(id).await.map_err(engine_err)?;
                Ok(results::slots(vec![slot]))
            }
            Command::SelectSlotUsage { slot_id } => {
                let usage = engine.slot_usage(slot_id).await.map_err(engine_err)?;
                Ok(results::usage(slot_id, usage))
            }
            Command::InsertSlotSeries(req) => {
                let count = engine.bulk_create_slots(req).await.map_err(engine_err)?;
                Ok(results::series(count))
            }

            // ── Blackouts and restrictions ───────────────────
            Command::InsertBlackout { slot_id, note } => {
                engine.blackout_slot(slot_id, note).await.map_err(engine_err)?;
                let date = engine.slot_info(slot_id).await.map_err(engine_err)?.spec.date;
                Ok(results::blackout(BlackoutSummary {
                    affected_slots: 1,
                    scope: "slot",
                    start_date: date,
                    end_date: date,
                }))
            }
            Command::InsertBulkBlackout { scope, start, end, note } => {
                let summary = engine
                    .bulk_blackout(scope, start, end, note)
                    .await
                    .map_err(engine_err)?;
                Ok(results::blackout(summary))
            }
            Command::InsertRestrictions { target, grower_ids, cultivar_ids } => {
                let touched = engine
                    .apply_restrictions(target, grower_ids, cultivar_ids)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(touched))
            }
            Command::DeleteRestrictions { slot_id } => {
                engine.clear_restrictions(slot_id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectRestrictions { slot_id } => {
                let info = engine.list_restrictions(slot_id).await.map_err(engine_err)?;
                Ok(results::restrictions(info))
            }

            // ── Bookings ─────────────────────────────────────
            Command::InsertBooking { id, slot_id, grower_id, cultivar_id, quantity, notes } => {
                let grower_id = grower_id
                    .or(principal.grower_id())
                    .ok_or_else(|| sql_err(SqlError::MissingColumn("grower_id")))?;
                engine
                    .create_booking(principal, id, slot_id, grower_id, cultivar_id, quantity, notes)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateBooking { id, changes } => {
                engine.update_booking(principal, id, changes).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(principal, id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectBookings { date, grower_id } => {
                Ok(results::bookings(engine.list_bookings(principal, date, grower_id).await))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(principal, id).await.map_err(engine_err)?;
                Ok(results::bookings(vec![booking]))
            }
            Command::SelectNextAvailable { from, grower_id, cultivar_id, limit } => {
                let from = match from {
                    Some(raw) => engine.parse_local_datetime(&raw).map_err(engine_err)?,
                    None => engine.local_now(),
                };
                let grower_id = principal.grower_id().or(grower_id);
                let slots = engine
                    .next_available(from, grower_id, cultivar_id, limit)
                    .await
                    .map_err(engine_err)?;
                Ok(results::available(slots))
            }

            // ── Templates ────────────────────────────────────
            Command::InsertTemplate { id, input } => {
                engine.create_template(id, input).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateTemplate { id, changes } => {
                engine.update_template(id, changes).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteTemplate { id } => {
                engine.delete_template(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectTemplates => Ok(results::templates(engine.list_templates())),
            Command::SelectTemplate { id } => {
                let template = engine.get_template(id).map_err(engine_err)?;
                Ok(results::templates(vec![template]))
            }
            Command::SelectTemplatePlan { template_id, start, end } => {
                let plan = engine
                    .preview_template(template_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(results::plan(plan))
            }
            Command::InsertTemplatePublication { template_id, start, end, mode } => {
                let summary = match mode {
                    ApplyMode::Preview => {
                        let plan = engine
                            .preview_template(template_id, start, end)
                            .await
                            .map_err(engine_err)?;
                        summarize(&plan)
                    }
                    ApplyMode::Publish => engine
                        .publish_template(template_id, start, end)
                        .await
                        .map_err(engine_err)?,
                };
                Ok(results::publication(mode.as_str(), summary))
            }

            // ── Exports ──────────────────────────────────────
            Command::SelectExport { start, end, filter, csv } => {
                let rows = engine
                    .export_bookings(start, end, &filter)
                    .await
                    .map_err(engine_err)?;
                if csv {
                    Ok(results::csv(export::filename(start, end), export::to_csv(&rows)))
                } else {
                    Ok(results::export(rows))
                }
            }

            // ── Logistics ────────────────────────────────────
            Command::InsertConsignment(req) => {
                engine.create_consignment(principal, req).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SelectConsignments { date } => {
                Ok(results::consignments(engine.list_consignments(principal, date).await))
            }
            Command::InsertCheckpoint { id, consignment_id, kind, payload } => {
                let status = engine
                    .record_checkpoint(principal, id, consignment_id, kind, payload)
                    .await
                    .map_err(engine_err)?;
                Ok(results::checkpoint_status(consignment_id, status))
            }
            Command::SelectCheckpoints { consignment_id } => {
                let checkpoints = engine
                    .list_checkpoints(principal, consignment_id)
                    .map_err(engine_err)?;
                Ok(results::checkpoints(checkpoints))
            }

            // ── Events and identity ──────────────────────────
            Command::SelectDomainEvents { after_seq } => {
                Ok(results::events(engine.notify.since(after_seq)))
            }
            Command::SelectWhoami => Ok(results::whoami(principal, tenant)),
            Command::SelectHealth => Ok(results::health()),
        }
    }
}

/// What a publish of `plan` would do.
fn summarize(plan: &[PlannedSlot]) -> PublishSummary {
    let mut summary = PublishSummary::default();
    for planned in plan {
        match planned.action {
            PlanAction::Create => summary.created += 1,
            PlanAction::Update => summary.updated += 1,
            PlanAction::Skip => summary.skipped += 1,
        }
    }
    summary
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

#[async_trait]
impl SimpleQueryHandler for PackslotHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let session = self.session(client).await?;
        Ok(vec![self.run(&session, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct PackslotQueryParser;

#[async_trait]
impl QueryParser for PackslotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe(stmt))
    }
}

/// Result columns of a statement, resolved before its parameters are bound.
fn describe(sql: &str) -> Vec<FieldInfo> {
    sql::statement_target(sql)
        .map(|(verb, table)| results::schema_for(verb, &table))
        .unwrap_or_default()
}

#[async_trait]
impl ExtendedQueryHandler for PackslotHandler {
    type Statement = String;
    type QueryParser = PackslotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let session = self.session(client).await?;
        let sql = substitute_params(portal);
        self.run(&session, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, describe(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(describe(&target.statement.statement)))
    }
}

/// Walk `sql` once and splice in what `param` returns for each `$N` outside
/// quoted text. Quoted literals and identifiers, and anything spliced in, are
/// never rescanned.
fn rewrite_placeholders(sql: &str, mut param: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;
    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                // A doubled quote closes here and reopens on the next char.
                if c == q {
                    quote = None;
                }
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == '$' => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                match sql[i + 1..end].parse::<usize>().ok().and_then(&mut param) {
                    Some(text) => out.push_str(&text),
                    None => out.push_str(&sql[i..end]),
                }
            }
            None => out.push(c),
        }
    }
    out
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    rewrite_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &values)
}

fn substitute(sql: &str, values: &[Option<String>]) -> String {
    rewrite_placeholders(sql, |n| {
        let value = values.get(n.checked_sub(1)?)?;
        Some(match value {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        })
    })
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PackslotFactory {
    handler: Arc<PackslotHandler>,
    auth_handler: Arc<PackslotStartupHandler>,
    noop: Arc<NoopHandler>,
}

impl PackslotFactory {
    /// `admin_password` opens any packhouse that has not set its own admin
    /// credential.
    pub fn new(tenant_manager: Arc<TenantManager>, admin_password: String) -> Self {
        Self {
            handler: Arc::new(PackslotHandler::new(tenant_manager.clone())),
            auth_handler: Arc::new(PackslotStartupHandler::new(tenant_manager, admin_password)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for PackslotFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<PackslotFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, PackslotFactory::clone(&factory)).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE date = $1 AND grower_id = $2"), 2);
        assert_eq!(count_params("INSERT INTO growers (id, name) VALUES ($2, $1)"), 2);
    }

    #[test]
    fn substitutes_quoted_text_and_nulls() {
        let sql = "INSERT INTO bookings (slot_id, quantity, notes) VALUES ($1, $2, $3)";
        let out = substitute(
            sql,
            &[Some("01ARZ3NDEKTSV4RRFFQ69G5FAV".into()), Some("5".into()), None],
        );
        assert_eq!(
            out,
            "INSERT INTO bookings (slot_id, quantity, notes) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', '5', NULL)"
        );
    }

    #[test]
    fn substitution_escapes_quotes_and_keeps_high_indexes() {
        let values: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(substitute("$1 $10", &values), "'1' '10'");
        assert_eq!(substitute("$1", &[Some("O'Neil".into())]), "'O''Neil'");
    }

    #[test]
    fn bound_text_is_not_rescanned() {
        let sql = "INSERT INTO bookings (slot_id, quantity, notes) VALUES ($1, $2, $3)";
        let out = substitute(sql, &[
            Some("01ARZ3NDEKTSV4RRFFQ69G5FAV".into()),
            Some("4".into()),
            Some("price $10 per ton".into()),
        ]);
        assert_eq!(
            out,
            "INSERT INTO bookings (slot_id, quantity, notes) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', '4', 'price $10 per ton')"
        );
        match sql::parse_sql(&out).unwrap() {
            Command::InsertBooking { quantity, notes, .. } => {
                assert_eq!(quantity, 4);
                assert_eq!(notes.as_deref(), Some("price $10 per ton"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // A value that looks like a placeholder stays text.
        let out = substitute("SELECT * FROM bookings WHERE id = $1 AND date = $2", &[
            Some("$2".into()),
            Some("2031-03-03".into()),
        ]);
        assert_eq!(out, "SELECT * FROM bookings WHERE id = '$2' AND date = '2031-03-03'");
    }

    #[test]
    fn placeholders_inside_literals_are_left_alone() {
        let sql = "INSERT INTO slots (notes, capacity) VALUES ('costs $1 ''or'' $2', $1)";
        assert_eq!(count_params(sql), 1);
        assert_eq!(
            substitute(sql, &[Some("5".into())]),
            "INSERT INTO slots (notes, capacity) VALUES ('costs $1 ''or'' $2', '5')"
        );
        assert_eq!(substitute("SELECT $3", &[Some("x".into())]), "SELECT $3");
    }

    #[test]
    fn preview_summary_counts_actions() {
        let spec = SlotSpec {
            date: chrono::NaiveDate::from_ymd_opt(2031, 3, 3).unwrap(),
            start_time: chrono::NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            capacity: 5,
            resource_unit: "tons".into(),
            blackout: false,
            notes: None,
        };
        let plan: Vec<PlannedSlot> = [PlanAction::Create, PlanAction::Create, PlanAction::Skip]
            .into_iter()
            .map(|action| PlannedSlot { action, slot_id: None, spec: spec.clone() })
            .collect();
        assert_eq!(summarize(&plan), PublishSummary { created: 2, updated: 0, skipped: 1 });
    }

    #[test]
    fn describe_uses_table_schema() {
        assert_eq!(describe("SELECT * FROM next_available WHERE grower_id = $1").len(), 6);
        assert!(describe("DELETE FROM bookings WHERE id = $1").is_empty());
        assert!(describe("not sql").is_empty());
    }
}
