use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{process_socket, TlsAcceptor};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use ulid::Ulid;

use crate::auth::ParkdAuthSource;
use crate::calendar;
use crate::campus::CampusManager;
use crate::engine::{now_ms, validate_instant, Engine, ParkError};
use crate::limits::DEFAULT_WINDOW_DAYS;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::window;

pub struct ParkdHandler {
    campuses: Arc<CampusManager>,
    query_parser: Arc<ParkdQueryParser>,
    /// LISTEN subscriptions of this connection, keyed by channel name.
    subscriptions: Mutex<HashMap<String, broadcast::Receiver<ReservationEvent>>>,
}

impl ParkdHandler {
    pub fn new(campuses: Arc<CampusManager>) -> Self {
        Self {
            campuses,
            query_parser: Arc::new(ParkdQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.campuses.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("campus error: {e}"),
            )))
        })
    }

    /// Queued events from this connection's LISTEN subscriptions, drained in
    /// arrival order per channel. Delivery rides the query loop: pending
    /// notifications are flushed to the client ahead of each response.
    async fn pending_notifications(&self) -> Vec<NotificationResponse> {
        let pid = std::process::id() as i32;
        let mut notes = Vec::new();
        let mut subs = self.subscriptions.lock().await;
        for (channel, rx) in subs.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else {
                            continue;
                        };
                        notes.push(NotificationResponse::new(pid, channel.clone(), payload));
                    }
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        }
        notes
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertSite {
                id,
                name,
                lat,
                lng,
                category,
            } => {
                engine
                    .create_site(id, name, lat, lng, category)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertBuilding { id, site_id, name } => {
                engine
                    .create_building(id, site_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSchedule { building_id, rule } => {
                engine
                    .add_schedule_rule(building_id, rule)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSlot {
                building_id,
                key,
                vehicle,
            } => {
                engine
                    .add_slot(building_id, key, vehicle)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::BatchInsertSlots { slots } => {
                let count = slots.len();
                for (building_id, key, vehicle) in slots {
                    engine
                        .add_slot(building_id, key, vehicle)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::InsertReservation {
                user,
                building_id,
                vehicle,
                booking,
                start,
                end,
                floor,
                zone,
                slot,
            } => {
                let span = span_of(start, end)?;
                let quote = Quote {
                    span,
                    amount: window::price(booking, &span),
                };
                let mut draft =
                    BookingDraft::new(user, building_id, vehicle, booking).with_window(quote);
                if let Some(scope) = zone_scope(floor, zone)? {
                    draft = draft.with_zone(scope);
                }
                if let Some(key) = slot {
                    draft = draft.with_slot(key);
                }

                let info = match engine.reserve(draft, now_ms()).await {
                    Ok(info) => info,
                    Err(e) => {
                        if e.is_conflict() {
                            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL)
                                .increment(1);
                        }
                        return Err(engine_err(e));
                    }
                };
                metrics::counter!(
                    observability::RESERVATIONS_CREATED_TOTAL,
                    "booking" => info.booking.as_str()
                )
                .increment(1);

                // The id is generated server-side, so the created row is
                // returned the way INSERT .. RETURNING would.
                let schema = Arc::new(reservations_schema());
                let row = reservation_row(schema.clone(), &info);
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                ))])
            }
            Command::UpdateReservationStatus { id, status } => {
                engine.set_status(id, status).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteReservation { id } => {
                engine.cancel(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSites => {
                let schema = Arc::new(sites_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_sites()
                    .into_iter()
                    .map(|site| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&site.id.to_string())?;
                        encoder.encode_field(&site.name)?;
                        encoder.encode_field(&site.lat)?;
                        encoder.encode_field(&site.lng)?;
                        encoder.encode_field(&site.category.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBuildings { site_id } => {
                let infos = engine.list_buildings(site_id, now_ms()).await;
                let schema = Arc::new(buildings_schema());
                let rows: Vec<PgWireResult<_>> = infos
                    .into_iter()
                    .map(|info| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&info.id.to_string())?;
                        encoder.encode_field(&info.site_id.to_string())?;
                        encoder.encode_field(&info.name)?;
                        encoder.encode_field(&(info.capacity.total() as i32))?;
                        encoder.encode_field(&(info.available.total() as i32))?;
                        encoder.encode_field(&info.open_now)?;
                        encoder.encode_field(&info.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSchedules { building_id } => {
                let rules = engine.list_schedule(building_id).await;
                let schema = Arc::new(schedules_schema());
                let bid = building_id.to_string();
                let rows: Vec<PgWireResult<_>> = rules
                    .into_iter()
                    .map(|rule| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&bid)?;
                        encoder.encode_field(&calendar::format_days(rule.days))?;
                        encoder.encode_field(&calendar::format_wall(rule.open_min))?;
                        encoder.encode_field(&calendar::format_wall(rule.close_min))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSlots { building_id } => {
                let slots = engine.list_slots(building_id).await;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.building_id.to_string())?;
                        encoder.encode_field(&slot.floor)?;
                        encoder.encode_field(&slot.zone)?;
                        encoder.encode_field(&(slot.seq as i32))?;
                        encoder.encode_field(&slot.label)?;
                        encoder.encode_field(&slot.vehicle.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectReservations { filter } => {
                let infos = engine
                    .list_reservations(&filter)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = infos
                    .iter()
                    .map(|info| reservation_row(schema.clone(), info))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability {
                building_id,
                start,
                end,
                vehicle,
            } => {
                let window = span_of(start, end)?;
                let floors = engine
                    .availability_by_floor(building_id, window, vehicle)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let bid = building_id.to_string();
                let mut rows: Vec<PgWireResult<DataRow>> = Vec::new();
                for floor in &floors {
                    for zone in &floor.zones {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&bid)?;
                        encoder.encode_field(&floor.floor)?;
                        encoder.encode_field(&zone.zone)?;
                        encoder.encode_field(&(zone.capacity as i32))?;
                        encoder.encode_field(&(zone.available as i32))?;
                        encoder.encode_field(&zone.status())?;
                        rows.push(Ok(encoder.take_row()));
                    }
                }
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectZones {
                building_id,
                start,
                end,
                vehicle,
            } => {
                let window = span_of(start, end)?;
                let zones = engine
                    .availability_by_zone(building_id, window, vehicle)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(zones_schema());
                let bid = building_id.to_string();
                let rows: Vec<PgWireResult<_>> = zones
                    .into_iter()
                    .map(|zone| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&bid)?;
                        encoder.encode_field(&zone.zone)?;
                        encoder.encode_field(&(zone.capacity as i32))?;
                        encoder.encode_field(&(zone.available as i32))?;
                        encoder.encode_field(&zone.status())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectWindows {
                building_id,
                booking,
                granularity,
                vehicle,
                floor,
                zone,
                anchor,
                days,
            } => {
                let scope = zone_scope(floor, zone)?;
                let now = now_ms();
                let anchor = anchor.unwrap_or_else(|| calendar::date_of(now));
                let days = days.unwrap_or(DEFAULT_WINDOW_DAYS);
                let sections = engine
                    .selectable_windows(
                        building_id,
                        booking,
                        granularity,
                        vehicle,
                        scope.as_ref(),
                        anchor,
                        days,
                        now,
                    )
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(windows_schema());
                let mut rows: Vec<PgWireResult<DataRow>> = Vec::new();
                // Pad sections exist for weekday-grid alignment only and
                // carry no bookable cells; a closed day keeps one marker
                // row so the date is not silently absent.
                for day in sections.iter().filter(|d| !d.pad) {
                    let date = day.date.to_string();
                    if day.cells.is_empty() {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&None::<i64>)?;
                        encoder.encode_field(&None::<i64>)?;
                        encoder.encode_field(&0i32)?;
                        encoder.encode_field(&0i32)?;
                        encoder.encode_field(&false)?;
                        rows.push(Ok(encoder.take_row()));
                        continue;
                    }
                    for cell in &day.cells {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&cell.span.start)?;
                        encoder.encode_field(&cell.span.end)?;
                        encoder.encode_field(&(cell.duration_min as i32))?;
                        encoder.encode_field(&(cell.remaining as i32))?;
                        encoder.encode_field(&cell.selectable)?;
                        rows.push(Ok(encoder.take_row()));
                    }
                }
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectQuotes {
                booking,
                start,
                end_cell,
                cell_min,
            } => {
                let quote =
                    window::resolve(booking, start, end_cell, cell_min).map_err(engine_err)?;
                let schema = Arc::new(quotes_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&booking.as_str())?;
                encoder.encode_field(&quote.span.start)?;
                encoder.encode_field(&quote.span.end)?;
                encoder.encode_field(&quote.amount)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectOccupied {
                building_id,
                start,
                end,
            } => {
                let window = span_of(start, end)?;
                let claims = engine
                    .occupied_slots(building_id, window)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(occupied_schema());
                let bid = building_id.to_string();
                let rows: Vec<PgWireResult<_>> = claims
                    .into_iter()
                    .map(|(key, reservation)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&bid)?;
                        encoder.encode_field(&key.label())?;
                        encoder.encode_field(&reservation.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let building_id = parse_channel(&channel)?;
                let rx = engine.notify.subscribe(building_id);
                // Re-LISTEN replaces the receiver, so a duplicate LISTEN
                // still delivers each event once.
                self.subscriptions.lock().await.insert(channel, rx);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let mut subs = self.subscriptions.lock().await;
                if channel == "*" {
                    subs.clear();
                } else {
                    subs.remove(&channel);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

// ── Table schemas ────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn sites_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("lat", Type::FLOAT8),
        text_field("lng", Type::FLOAT8),
        text_field("category", Type::VARCHAR),
    ]
}

fn buildings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("site_id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("capacity", Type::INT4),
        text_field("available", Type::INT4),
        text_field("open_now", Type::BOOL),
        text_field("status", Type::VARCHAR),
    ]
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        text_field("building_id", Type::VARCHAR),
        text_field("days", Type::VARCHAR),
        text_field("open", Type::VARCHAR),
        text_field("close", Type::VARCHAR),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("building_id", Type::VARCHAR),
        text_field("floor", Type::VARCHAR),
        text_field("zone", Type::VARCHAR),
        text_field("seq", Type::INT4),
        text_field("label", Type::VARCHAR),
        text_field("vehicle", Type::VARCHAR),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user", Type::VARCHAR),
        text_field("building_id", Type::VARCHAR),
        text_field("slot", Type::VARCHAR),
        text_field("vehicle", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("booking", Type::VARCHAR),
        text_field("amount", Type::INT8),
        text_field("created_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("building_id", Type::VARCHAR),
        text_field("floor", Type::VARCHAR),
        text_field("zone", Type::VARCHAR),
        text_field("capacity", Type::INT4),
        text_field("available", Type::INT4),
        text_field("status", Type::VARCHAR),
    ]
}

fn zones_schema() -> Vec<FieldInfo> {
    vec![
        text_field("building_id", Type::VARCHAR),
        text_field("zone", Type::VARCHAR),
        text_field("capacity", Type::INT4),
        text_field("available", Type::INT4),
        text_field("status", Type::VARCHAR),
    ]
}

fn windows_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("duration_min", Type::INT4),
        text_field("remaining", Type::INT4),
        text_field("selectable", Type::BOOL),
    ]
}

fn quotes_schema() -> Vec<FieldInfo> {
    vec![
        text_field("booking", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("amount", Type::INT8),
    ]
}

fn occupied_schema() -> Vec<FieldInfo> {
    vec![
        text_field("building_id", Type::VARCHAR),
        text_field("slot", Type::VARCHAR),
        text_field("reservation_id", Type::VARCHAR),
    ]
}

fn reservation_row(schema: Arc<Vec<FieldInfo>>, info: &ReservationInfo) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema);
    encoder.encode_field(&info.id.to_string())?;
    encoder.encode_field(&info.user)?;
    encoder.encode_field(&info.building_id.to_string())?;
    encoder.encode_field(&info.slot_label)?;
    encoder.encode_field(&info.vehicle.as_str())?;
    encoder.encode_field(&info.start)?;
    encoder.encode_field(&info.end)?;
    encoder.encode_field(&info.status.as_str())?;
    encoder.encode_field(&info.booking.as_str())?;
    encoder.encode_field(&info.amount)?;
    encoder.encode_field(&info.created_at)?;
    Ok(encoder.take_row())
}

/// Result schema for Describe, resolved textually from the statement the
/// way the simple-path dispatch resolves tables.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("SELECT") {
        if upper.contains("AVAILABILITY") {
            availability_schema()
        } else if upper.contains("ZONES") {
            zones_schema()
        } else if upper.contains("WINDOWS") {
            windows_schema()
        } else if upper.contains("QUOTES") {
            quotes_schema()
        } else if upper.contains("OCCUPIED") {
            occupied_schema()
        } else if upper.contains("SCHEDULES") {
            schedules_schema()
        } else if upper.contains("SLOTS") {
            slots_schema()
        } else if upper.contains("RESERVATIONS") {
            reservations_schema()
        } else if upper.contains("BUILDINGS") {
            buildings_schema()
        } else if upper.contains("SITES") {
            sites_schema()
        } else {
            vec![]
        }
    } else if upper.contains("INSERT") && upper.contains("RESERVATIONS") {
        // INSERT INTO reservations answers with the created row.
        reservations_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ParkdHandler {
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
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let result = self.run_command(&engine, cmd).await;
        for note in self.pending_notifications().await {
            client
                .feed(PgWireBackendMessage::NotificationResponse(note))
                .await?;
        }
        result
    }
}

impl ParkdHandler {
    /// Execute with RED metrics around the command.
    async fn run_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            observability::QUERIES_TOTAL,
            "command" => label,
            "status" => status
        )
        .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParkdQueryParser;

#[async_trait]
impl QueryParser for ParkdQueryParser {
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
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ParkdHandler {
    type Statement = String;
    type QueryParser = ParkdQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let result = self.run_command(&engine, cmd).await;
        for note in self.pending_notifications().await {
            client
                .feed(PgWireBackendMessage::NotificationResponse(note))
                .await?;
        }
        let mut responses = result?;
        Ok(responses.remove(0))
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
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_sql(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Render one bound parameter as a quoted SQL literal (text format).
fn param_literal(param: Option<&Bytes>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

/// Substitute $1, $2, ... placeholders with bound parameter values.
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        result = result.replace(&placeholder, &param_literal(param.as_ref()));
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ParkdFactory {
    handler: Arc<ParkdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ParkdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ParkdFactory {
    pub fn new(campuses: Arc<CampusManager>, password: String) -> Self {
        let auth_source = ParkdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ParkdHandler::new(campuses)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParkdFactory {
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

/// Drive one client connection through the pgwire machinery. The factory
/// is built per connection, so LISTEN subscriptions stay connection-local
/// and die with the socket.
pub async fn process_connection(
    socket: TcpStream,
    campuses: Arc<CampusManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    process_socket(socket, tls, ParkdFactory::new(campuses, password)).await
}

fn engine_err(e: ParkError) -> PgWireError {
    let code = if e.is_conflict() { "23P01" } else { "P0001" };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

fn span_of(start: Ms, end: Ms) -> PgWireResult<Span> {
    if start >= end {
        return Err(engine_err(ParkError::InvalidSpan));
    }
    validate_instant(start).map_err(engine_err)?;
    validate_instant(end).map_err(engine_err)?;
    Ok(Span::new(start, end))
}

fn zone_scope(floor: Option<String>, zone: Option<String>) -> PgWireResult<Option<ZoneScope>> {
    match (floor, zone) {
        (floor, Some(zone)) => Ok(Some(ZoneScope { floor, zone })),
        (Some(_), None) => Err(PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "P0001".into(),
            "a floor filter requires a zone filter".into(),
        )))),
        (None, None) => Ok(None),
    }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id_str = channel.strip_prefix("building_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected building_{{id}})"),
        )))
    })?;
    Ulid::from_string(id_str).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}
