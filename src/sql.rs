use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{self, Granularity};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSite {
        id: Ulid,
        name: String,
        lat: f64,
        lng: f64,
        category: SiteCategory,
    },
    InsertBuilding {
        id: Ulid,
        site_id: Ulid,
        name: String,
    },
    InsertSchedule {
        building_id: Ulid,
        rule: ScheduleRule,
    },
    InsertSlot {
        building_id: Ulid,
        key: SlotKey,
        vehicle: VehicleType,
    },
    BatchInsertSlots {
        slots: Vec<(Ulid, SlotKey, VehicleType)>, // (building_id, key, vehicle)
    },
    InsertReservation {
        user: String,
        building_id: Ulid,
        vehicle: VehicleType,
        booking: BookingKind,
        start: Ms,
        end: Ms,
        floor: Option<String>,
        zone: Option<String>,
        slot: Option<SlotKey>,
    },
    UpdateReservationStatus {
        id: Ulid,
        status: ReservationStatus,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectSites,
    SelectBuildings {
        site_id: Option<Ulid>,
    },
    SelectSchedules {
        building_id: Ulid,
    },
    SelectSlots {
        building_id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectAvailability {
        building_id: Ulid,
        start: Ms,
        end: Ms,
        vehicle: Option<VehicleType>,
    },
    SelectZones {
        building_id: Ulid,
        start: Ms,
        end: Ms,
        vehicle: Option<VehicleType>,
    },
    SelectWindows {
        building_id: Ulid,
        booking: BookingKind,
        granularity: Granularity,
        vehicle: Option<VehicleType>,
        floor: Option<String>,
        zone: Option<String>,
        anchor: Option<NaiveDate>,
        days: Option<u32>,
    },
    SelectQuotes {
        booking: BookingKind,
        start: Ms,
        end_cell: Option<Ms>,
        cell_min: u32,
    },
    SelectOccupied {
        building_id: Ulid,
        start: Ms,
        end: Ms,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if trimmed.to_uppercase().starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches(';').to_string();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    // Slots are the bulk-loaded table; everything else is single-row.
    if table == "slots" {
        let all_rows = extract_all_insert_rows(insert)?;
        if all_rows.len() == 1 {
            let (building_id, key, vehicle) = parse_slot_row(&all_rows[0])?;
            return Ok(Command::InsertSlot { building_id, key, vehicle });
        }
        let mut slots = Vec::with_capacity(all_rows.len());
        for (i, row) in all_rows.iter().enumerate() {
            slots.push(
                parse_slot_row(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
            );
        }
        return Ok(Command::BatchInsertSlots { slots });
    }

    let values = extract_insert_values(insert)?;
    match table.as_str() {
        "sites" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("sites", 2, values.len()));
            }
            let id = parse_ulid(&values[0])?;
            let name = parse_string_expr(&values[1])?;
            let lat = if values.len() >= 3 { parse_f64_expr(&values[2])? } else { 0.0 };
            let lng = if values.len() >= 4 { parse_f64_expr(&values[3])? } else { 0.0 };
            let category = if values.len() >= 5 {
                parse_category_expr(&values[4])?
            } else {
                SiteCategory::Parking
            };
            Ok(Command::InsertSite { id, name, lat, lng, category })
        }
        "buildings" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("buildings", 3, values.len()));
            }
            Ok(Command::InsertBuilding {
                id: parse_ulid(&values[0])?,
                site_id: parse_ulid(&values[1])?,
                name: parse_string_expr(&values[2])?,
            })
        }
        "schedules" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("schedules", 4, values.len()));
            }
            let rule = ScheduleRule {
                days: parse_days_expr(&values[1])?,
                open_min: parse_wall_expr(&values[2])?,
                close_min: parse_wall_expr(&values[3])?,
            };
            Ok(Command::InsertSchedule { building_id: parse_ulid(&values[0])?, rule })
        }
        "reservations" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("reservations", 6, values.len()));
            }
            let floor = if values.len() >= 7 { parse_string_or_null(&values[6])? } else { None };
            let zone = if values.len() >= 8 { parse_string_or_null(&values[7])? } else { None };
            let slot = if values.len() >= 9 { parse_slot_or_null(&values[8])? } else { None };
            Ok(Command::InsertReservation {
                user: parse_string_expr(&values[0])?,
                building_id: parse_ulid(&values[1])?,
                vehicle: parse_vehicle_expr(&values[2])?,
                booking: parse_booking_expr(&values[3])?,
                start: parse_i64(&values[4])?,
                end: parse_i64(&values[5])?,
                floor,
                zone,
                slot,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_slot_row(row: &[Expr]) -> Result<(Ulid, SlotKey, VehicleType), SqlError> {
    if row.len() < 4 {
        return Err(SqlError::WrongArity("slots", 4, row.len()));
    }
    let building_id = parse_ulid(&row[0])?;
    let key = SlotKey::new(
        parse_string_expr(&row[1])?,
        parse_string_expr(&row[2])?,
        parse_u32(&row[3])?,
    );
    let vehicle = if row.len() >= 5 {
        parse_vehicle_expr(&row[4])?
    } else {
        VehicleType::Normal
    };
    Ok((building_id, key, vehicle))
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "reservations" {
        return Err(SqlError::Unsupported(format!("UPDATE on {name}")));
    }
    let id = extract_where_id(selection)?;
    for assignment in assignments {
        if assignment_column(assignment).as_deref() == Some("status") {
            let status = parse_status_expr(&assignment.value)?;
            return Ok(Command::UpdateReservationStatus { id, status });
        }
    }
    Err(SqlError::Parse("UPDATE must set status".into()))
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::Unsupported(format!("DELETE on {table}")));
    }
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::DeleteReservation { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let selection = &select.selection;

    match table.as_str() {
        "sites" => Ok(Command::SelectSites),
        "buildings" => {
            let site_id = match selection {
                Some(sel) => find_eq_ulid(sel, "site_id")?,
                None => None,
            };
            Ok(Command::SelectBuildings { site_id })
        }
        "schedules" => {
            Ok(Command::SelectSchedules { building_id: extract_where_building(selection)? })
        }
        "slots" => Ok(Command::SelectSlots { building_id: extract_where_building(selection)? }),
        "reservations" => {
            let mut filter = ReservationFilter::default();
            if let Some(sel) = selection {
                extract_reservation_filters(sel, &mut filter)?;
            }
            Ok(Command::SelectReservations { filter })
        }
        "availability" => {
            let f = span_filters(selection)?;
            Ok(Command::SelectAvailability {
                building_id: f.building_id.ok_or(SqlError::MissingFilter("building_id"))?,
                start: f.start.ok_or(SqlError::MissingFilter("start"))?,
                end: f.end.ok_or(SqlError::MissingFilter("end"))?,
                vehicle: f.vehicle,
            })
        }
        "zones" => {
            let f = span_filters(selection)?;
            Ok(Command::SelectZones {
                building_id: f.building_id.ok_or(SqlError::MissingFilter("building_id"))?,
                start: f.start.ok_or(SqlError::MissingFilter("start"))?,
                end: f.end.ok_or(SqlError::MissingFilter("end"))?,
                vehicle: f.vehicle,
            })
        }
        "windows" => {
            let mut f = WindowFilters::default();
            if let Some(sel) = selection {
                extract_window_filters(sel, &mut f)?;
            }
            Ok(Command::SelectWindows {
                building_id: f.building_id.ok_or(SqlError::MissingFilter("building_id"))?,
                booking: f.booking.unwrap_or(BookingKind::Hourly),
                granularity: f.granularity.unwrap_or(Granularity::Minutes(60)),
                vehicle: f.vehicle,
                floor: f.floor,
                zone: f.zone,
                anchor: f.anchor,
                days: f.days,
            })
        }
        "quotes" => {
            let mut f = QuoteFilters::default();
            if let Some(sel) = selection {
                extract_quote_filters(sel, &mut f)?;
            }
            Ok(Command::SelectQuotes {
                booking: f.booking.ok_or(SqlError::MissingFilter("booking"))?,
                start: f.start.ok_or(SqlError::MissingFilter("start"))?,
                end_cell: f.end_cell,
                cell_min: f.cell_min.unwrap_or(60),
            })
        }
        "occupied" => {
            let f = span_filters(selection)?;
            Ok(Command::SelectOccupied {
                building_id: f.building_id.ok_or(SqlError::MissingFilter("building_id"))?,
                start: f.start.ok_or(SqlError::MissingFilter("start"))?,
                end: f.end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE-clause extraction ───────────────────────────────────

/// Shared filter shape of the span-windowed computed tables
/// (`availability`, `zones`, `occupied`).
#[derive(Default)]
struct SpanFilters {
    building_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    vehicle: Option<VehicleType>,
}

fn span_filters(selection: &Option<Expr>) -> Result<SpanFilters, SqlError> {
    let mut f = SpanFilters::default();
    if let Some(sel) = selection {
        extract_span_filters(sel, &mut f)?;
    }
    Ok(f)
}

fn extract_span_filters(expr: &Expr, f: &mut SpanFilters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_span_filters(left, f)?;
                extract_span_filters(right, f)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("building_id") => f.building_id = Some(parse_ulid_expr(right)?),
                Some("vehicle") => f.vehicle = Some(parse_vehicle_expr(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    f.start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    f.end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[derive(Default)]
struct WindowFilters {
    building_id: Option<Ulid>,
    booking: Option<BookingKind>,
    granularity: Option<Granularity>,
    vehicle: Option<VehicleType>,
    floor: Option<String>,
    zone: Option<String>,
    anchor: Option<NaiveDate>,
    days: Option<u32>,
}

fn extract_window_filters(expr: &Expr, f: &mut WindowFilters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_window_filters(left, f)?;
                extract_window_filters(right, f)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("building_id") => f.building_id = Some(parse_ulid_expr(right)?),
                Some("booking") => f.booking = Some(parse_booking_expr(right)?),
                Some("granularity") => f.granularity = Some(parse_granularity_expr(right)?),
                Some("vehicle") => f.vehicle = Some(parse_vehicle_expr(right)?),
                Some("floor") => f.floor = Some(parse_string_expr(right)?),
                Some("zone") => f.zone = Some(parse_string_expr(right)?),
                Some("anchor") => f.anchor = Some(parse_date_expr(right)?),
                Some("days") => f.days = Some(parse_u32(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

#[derive(Default)]
struct QuoteFilters {
    booking: Option<BookingKind>,
    start: Option<Ms>,
    end_cell: Option<Ms>,
    cell_min: Option<u32>,
}

fn extract_quote_filters(expr: &Expr, f: &mut QuoteFilters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_quote_filters(left, f)?;
                extract_quote_filters(right, f)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("booking") => f.booking = Some(parse_booking_expr(right)?),
                Some("start") => f.start = Some(parse_i64_expr(right)?),
                Some("end_cell") => f.end_cell = Some(parse_i64_expr(right)?),
                Some("cell_min") => f.cell_min = Some(parse_u32(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

fn extract_reservation_filters(expr: &Expr, f: &mut ReservationFilter) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_reservation_filters(left, f)?;
                extract_reservation_filters(right, f)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("building_id") => f.building = Some(parse_ulid_expr(right)?),
                Some("user") => f.user = Some(parse_string_expr(right)?),
                Some("status") => f.status = Some(parse_status_expr(right)?),
                Some("id") => f.ids = Some(vec![parse_ulid_expr(right)?]),
                _ => {}
            },
            _ => {}
        },
        Expr::InList { expr, list, negated: false } => {
            if expr_column_name(expr).as_deref() == Some("id") {
                let mut ids = Vec::with_capacity(list.len());
                for item in list {
                    ids.push(parse_ulid_expr(item)?);
                }
                f.ids = Some(ids);
            }
        }
        _ => {}
    }
    Ok(())
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

fn assignment_column(assignment: &ast::Assignment) -> Option<String> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// First `col = '<ulid>'` conjunct anywhere in the expression, if present.
fn find_eq_ulid(expr: &Expr, col: &str) -> Result<Option<Ulid>, SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                if let Some(id) = find_eq_ulid(left, col)? {
                    return Ok(Some(id));
                }
                return find_eq_ulid(right, col);
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some(col) {
                    return Ok(Some(parse_ulid_expr(right)?));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    find_eq_ulid(sel, "id")?.ok_or(SqlError::MissingFilter("id"))
}

fn extract_where_building(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection
        .as_ref()
        .ok_or(SqlError::MissingFilter("building_id"))?;
    find_eq_ulid(sel, "building_id")?.ok_or(SqlError::MissingFilter("building_id"))
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_f64_expr(expr: &Expr) -> Result<f64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad f64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_f64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    Ok(Some(parse_string_expr(expr)?))
}

fn parse_slot_or_null(expr: &Expr) -> Result<Option<SlotKey>, SqlError> {
    let Some(label) = parse_string_or_null(expr)? else {
        return Ok(None);
    };
    SlotKey::parse(&label)
        .map(Some)
        .ok_or_else(|| SqlError::Parse(format!("bad slot label: {label}")))
}

fn parse_vehicle_expr(expr: &Expr) -> Result<VehicleType, SqlError> {
    let s = parse_string_expr(expr)?;
    VehicleType::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown vehicle type: {s}")))
}

fn parse_booking_expr(expr: &Expr) -> Result<BookingKind, SqlError> {
    let s = parse_string_expr(expr)?;
    BookingKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown booking kind: {s}")))
}

fn parse_status_expr(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    let s = parse_string_expr(expr)?;
    ReservationStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown status: {s}")))
}

fn parse_category_expr(expr: &Expr) -> Result<SiteCategory, SqlError> {
    let s = parse_string_expr(expr)?;
    SiteCategory::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown site category: {s}")))
}

fn parse_granularity_expr(expr: &Expr) -> Result<Granularity, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(n, _) => {
                let min: u32 = n
                    .parse()
                    .map_err(|_| SqlError::Parse(format!("bad granularity: {n}")))?;
                Ok(Granularity::Minutes(min))
            }
            Value::SingleQuotedString(s) => match s.as_str() {
                "half_day" => Ok(Granularity::HalfDay),
                "full_day" => Ok(Granularity::FullDay),
                _ => Err(SqlError::Parse(format!("unknown granularity: {s}"))),
            },
            _ => Err(SqlError::Parse(format!("expected granularity, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

/// Weekday set: either a bitmask number or a day-name list ('mon,tue,fri').
fn parse_days_expr(expr: &Expr) -> Result<u8, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(n, _) => {
                let v: i64 = n
                    .parse()
                    .map_err(|_| SqlError::Parse(format!("bad day mask: {n}")))?;
                u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of day-mask range")))
            }
            Value::SingleQuotedString(s) => {
                calendar::parse_days(s).map_err(|e| SqlError::Parse(e.to_string()))
            }
            _ => Err(SqlError::Parse(format!("expected day list, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Wall time: either minutes from midnight or an 'HH:MM' literal.
fn parse_wall_expr(expr: &Expr) -> Result<u16, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(n, _) => {
                let v: i64 = n
                    .parse()
                    .map_err(|_| SqlError::Parse(format!("bad wall time: {n}")))?;
                u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
            }
            Value::SingleQuotedString(s) => {
                calendar::parse_hhmm(s).map_err(|e| SqlError::Parse(e.to_string()))
            }
            _ => Err(SqlError::Parse(format!("expected wall time, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
