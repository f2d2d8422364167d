use chrono::{Datelike, Months, NaiveDate, NaiveDateTime};

use crate::engine::ParkError;
use crate::model::*;

// ── Time conversion ──────────────────────────────────────────────
//
// All engine timestamps are unix milliseconds interpreted as campus-local
// wall time. Conversions go through naive chrono types so interval
// arithmetic never sees DST.

pub fn ms_of(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn datetime_of(t: Ms) -> NaiveDateTime {
    chrono::DateTime::from_timestamp_millis(t)
        .map(|d| d.naive_utc())
        .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::UNIX_EPOCH.naive_utc())
}

pub fn date_of(t: Ms) -> NaiveDate {
    datetime_of(t).date()
}

/// Absolute millis of a wall-clock minute offset on a date.
/// `minutes` is validated < 1440 at ingestion.
fn wall_ms(date: NaiveDate, minutes: u16) -> Ms {
    let h = (minutes / 60) as u32;
    let m = (minutes % 60) as u32;
    ms_of(date.and_hms_opt(h, m, 0).unwrap())
}

// ── Schedule parsing & validation ────────────────────────────────

const DAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// Parse "HH:MM" into minutes from midnight.
pub fn parse_hhmm(s: &str) -> Result<u16, ParkError> {
    let (h, m) = s
        .split_once(':')
        .ok_or(ParkError::InvalidSchedule("time literal must be HH:MM"))?;
    let h: u16 = h
        .parse()
        .map_err(|_| ParkError::InvalidSchedule("time literal must be HH:MM"))?;
    let m: u16 = m
        .parse()
        .map_err(|_| ParkError::InvalidSchedule("time literal must be HH:MM"))?;
    if h >= 24 || m >= 60 {
        return Err(ParkError::InvalidSchedule("time out of range"));
    }
    Ok(h * 60 + m)
}

pub fn format_wall(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Parse a comma-separated weekday list ("mon,tue,fri") into the day bitmask
/// (bit 0 = Monday). Repeated names are harmless.
pub fn parse_days(s: &str) -> Result<u8, ParkError> {
    let mut mask: u8 = 0;
    for part in s.split(',') {
        let name = part.trim().to_ascii_lowercase();
        let bit = DAY_NAMES
            .iter()
            .position(|d| *d == name)
            .ok_or(ParkError::InvalidSchedule("unknown weekday name"))?;
        mask |= 1 << bit;
    }
    if mask == 0 {
        return Err(ParkError::InvalidSchedule("empty weekday list"));
    }
    Ok(mask)
}

pub fn format_days(mask: u8) -> String {
    let mut out = Vec::new();
    for (bit, name) in DAY_NAMES.iter().enumerate() {
        if mask & (1 << bit) != 0 {
            out.push(*name);
        }
    }
    out.join(",")
}

/// Ingestion-time validation of a new schedule rule against a building's
/// existing rules. Two rules claiming the same weekday are rejected here,
/// never resolved at lookup time.
pub fn validate_new_rule(existing: &[ScheduleRule], rule: &ScheduleRule) -> Result<(), ParkError> {
    if rule.days == 0 || rule.days & 0x80 != 0 {
        return Err(ParkError::InvalidSchedule("invalid weekday mask"));
    }
    if rule.open_min >= 1440 || rule.close_min >= 1440 {
        return Err(ParkError::InvalidSchedule("time out of range"));
    }
    if rule.open_min == rule.close_min {
        return Err(ParkError::InvalidSchedule("open and close are equal"));
    }
    for r in existing {
        if r.days & rule.days != 0 {
            return Err(ParkError::ScheduleConflict);
        }
    }
    Ok(())
}

/// The unique rule covering a weekday, if any. Uniqueness is the ingestion
/// invariant enforced by [`validate_new_rule`].
pub fn rule_for_weekday(schedule: &[ScheduleRule], weekday: chrono::Weekday) -> Option<&ScheduleRule> {
    let bit = weekday.num_days_from_monday();
    schedule.iter().find(|r| r.covers_day(bit))
}

/// The absolute open span of a date, or None when the building is closed
/// that day. A close wall earlier than the open wall rolls past midnight.
pub fn open_span_for_date(schedule: &[ScheduleRule], date: NaiveDate) -> Option<Span> {
    let rule = rule_for_weekday(schedule, date.weekday())?;
    let start = wall_ms(date, rule.open_min);
    let open_minutes = if rule.close_min > rule.open_min {
        (rule.close_min - rule.open_min) as Ms
    } else {
        (1440 - rule.open_min + rule.close_min) as Ms
    };
    Some(Span::new(start, start + open_minutes * 60_000))
}

/// Whether the building is open at instant `t`. Checks the previous date
/// too so an overnight span (close past midnight) still covers its tail.
pub fn is_open_at(schedule: &[ScheduleRule], t: Ms) -> bool {
    let today = date_of(t);
    for date in [today.pred_opt(), Some(today)].into_iter().flatten() {
        if let Some(span) = open_span_for_date(schedule, date)
            && span.contains_instant(t)
        {
            return true;
        }
    }
    false
}

// ── Grid generation ──────────────────────────────────────────────

/// Step size for selectable start times within an open day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Fixed interval in minutes (60 and 240 are the usual values).
    Minutes(u32),
    /// Two cells of floor(open/2) minutes each.
    HalfDay,
    /// One cell covering the whole open span.
    FullDay,
}

impl Granularity {
    pub fn validate(&self) -> Result<(), ParkError> {
        if let Granularity::Minutes(n) = self
            && (*n < crate::limits::MIN_GRANULARITY_MIN || *n > 1440)
        {
            return Err(ParkError::InvalidGranularity(*n));
        }
        Ok(())
    }
}

const DAY_MIN: u32 = 1440;

/// Generate the selectable day/cell grid for a booking mode.
///
/// hourly/flat_24h: `window_days` consecutive days from `anchor`; a day with
/// no schedule rule yields an empty cell list (closed, not an error).
/// monthly modes: one section per calendar day of the anchor month, with
/// leading pad sections for Sunday-first weekday alignment.
///
/// Cell `remaining` counts are provisional placeholders; the engine fills
/// them from the oracle.
pub fn generate_days(
    schedule: &[ScheduleRule],
    mode: BookingKind,
    gran: Granularity,
    anchor: NaiveDate,
    window_days: u32,
    now: Ms,
) -> Vec<DaySection> {
    if mode.is_monthly() {
        return monthly_sections(anchor, date_of(now));
    }

    let mut sections = Vec::with_capacity(window_days as usize);
    let mut date = anchor;
    for _ in 0..window_days {
        let cells = match open_span_for_date(schedule, date) {
            Some(open) => day_cells(&open, mode, gran, now),
            None => Vec::new(),
        };
        sections.push(DaySection { date, pad: false, cells });
        let Some(next) = date.succ_opt() else { break };
        date = next;
    }
    sections
}

fn day_cells(open: &Span, mode: BookingKind, gran: Granularity, now: Ms) -> Vec<GridCell> {
    let mut cells = Vec::new();
    let total_min = (open.duration_ms() / 60_000) as u32;

    if mode == BookingKind::Flat24h {
        // Start selectable hourly while open; the blocked duration is
        // always 24 hours regardless of close time.
        let step = 60 * 60_000;
        let dur = DAY_MIN as Ms * 60_000;
        let mut cursor = open.start;
        while cursor < open.end {
            push_cell(&mut cells, cursor, dur, DAY_MIN, now);
            cursor += step;
        }
        return cells;
    }

    match gran {
        Granularity::Minutes(n) => {
            // Every start strictly before close gets a cell; the tail cell
            // may overrun the close time.
            let dur = n as Ms * 60_000;
            let mut cursor = open.start;
            while cursor < open.end {
                push_cell(&mut cells, cursor, dur, n, now);
                cursor += dur;
            }
        }
        Granularity::HalfDay => {
            let half = total_min / 2;
            if half > 0 {
                let dur = half as Ms * 60_000;
                push_cell(&mut cells, open.start, dur, half, now);
                // Second cell only if it still fits before close.
                if open.start + 2 * dur <= open.end {
                    push_cell(&mut cells, open.start + dur, dur, half, now);
                }
            }
        }
        Granularity::FullDay => {
            if total_min > 0 {
                push_cell(&mut cells, open.start, open.duration_ms(), total_min, now);
            }
        }
    }
    cells
}

fn push_cell(cells: &mut Vec<GridCell>, start: Ms, dur: Ms, duration_min: u32, now: Ms) {
    cells.push(GridCell {
        span: Span::new(start, start + dur),
        duration_min,
        remaining: 0,
        selectable: start >= now,
    });
}

/// One section per day of the anchor's month; a day's single cell means
/// "contract starts this date". Past dates are never selectable.
fn monthly_sections(anchor: NaiveDate, today: NaiveDate) -> Vec<DaySection> {
    let first = NaiveDate::from_ymd_opt(anchor.year(), anchor.month(), 1).unwrap();
    let next_month = first
        .checked_add_months(Months::new(1))
        .unwrap_or(first);
    let days = next_month.signed_duration_since(first).num_days().max(0) as u32;

    let mut sections = Vec::new();
    for _ in 0..first.weekday().num_days_from_sunday() {
        sections.push(DaySection { date: first, pad: true, cells: Vec::new() });
    }
    let mut date = first;
    for _ in 0..days {
        let start = wall_ms(date, 0);
        let cell = GridCell {
            span: Span::new(start, start + DAY_MIN as Ms * 60_000),
            duration_min: DAY_MIN,
            remaining: 0,
            selectable: date >= today,
        };
        sections.push(DaySection { date, pad: false, cells: vec![cell] });
        let Some(next) = date.succ_opt() else { break };
        date = next;
    }
    sections
}
