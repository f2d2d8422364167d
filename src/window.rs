use chrono::Months;

use crate::calendar::{date_of, ms_of};
use crate::engine::{validate_instant, ParkError};
use crate::model::*;

// ── Tariffs ──────────────────────────────────────────────────────

/// Hourly rate, charged per started hour.
pub const HOURLY_RATE: i64 = 20;
/// Fixed price of a 24-hour flat booking.
pub const FLAT24_AMOUNT: i64 = 200;
/// Fixed price of a monthly pass (regular and night).
pub const MONTHLY_AMOUNT: i64 = 1500;

const HOUR_MS: Ms = 3_600_000;

/// Resolve a grid selection into the canonical booking window and price.
///
/// Selection shape by mode:
/// - hourly: `start` is the start cell's start; `end_cell` the end cell's
///   start (None or == start books a single cell); the resolved end is the
///   end cell's start PLUS its duration (`cell_min`).
/// - flat_24h: `start` only; the window is exactly 24 hours, crossing
///   closed days if it must.
/// - monthly_regular: the date of `start` at 00:00 through one calendar
///   month later at 23:59:59.
/// - monthly_night: the date of `start` at 18:00 through one calendar month
///   later at 08:00.
pub fn resolve(
    mode: BookingKind,
    start: Ms,
    end_cell: Option<Ms>,
    cell_min: u32,
) -> Result<Quote, ParkError> {
    validate_instant(start)?;
    if let Some(last) = end_cell {
        validate_instant(last)?;
    }
    let span = match mode {
        BookingKind::Hourly => {
            if cell_min == 0 {
                return Err(ParkError::InvalidGranularity(cell_min));
            }
            let last = end_cell.unwrap_or(start);
            if last < start {
                return Err(ParkError::InvalidSpan);
            }
            Span::new(start, last + cell_min as Ms * 60_000)
        }
        BookingKind::Flat24h => Span::new(start, start + 24 * HOUR_MS),
        BookingKind::MonthlyRegular => {
            let date = date_of(start);
            let until = date
                .checked_add_months(Months::new(1))
                .ok_or(ParkError::InvalidSpan)?;
            Span::new(
                ms_of(date.and_hms_opt(0, 0, 0).unwrap()),
                ms_of(until.and_hms_opt(23, 59, 59).unwrap()),
            )
        }
        BookingKind::MonthlyNight => {
            let date = date_of(start);
            let until = date
                .checked_add_months(Months::new(1))
                .ok_or(ParkError::InvalidSpan)?;
            Span::new(
                ms_of(date.and_hms_opt(18, 0, 0).unwrap()),
                ms_of(until.and_hms_opt(8, 0, 0).unwrap()),
            )
        }
    };
    Ok(Quote { span, amount: price(mode, &span) })
}

/// Deterministic price of a resolved window. Hourly charges every started
/// hour; the flat modes are fixed tariffs.
pub fn price(mode: BookingKind, span: &Span) -> i64 {
    match mode {
        BookingKind::Hourly => {
            // Stable equivalent of `i64::div_ceil` (positive divisor).
            let dur = span.duration_ms();
            (dur / HOUR_MS + (dur % HOUR_MS > 0) as i64) * HOURLY_RATE
        }
        BookingKind::Flat24h => FLAT24_AMOUNT,
        BookingKind::MonthlyRegular | BookingKind::MonthlyNight => MONTHLY_AMOUNT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Ms {
        ms_of(
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, 0)
                .unwrap(),
        )
    }

    #[test]
    fn hourly_single_cell_defaults_to_one_interval() {
        let start = at(2025, 12, 4, 9, 0);
        let q = resolve(BookingKind::Hourly, start, None, 60).unwrap();
        assert_eq!(q.span, Span::new(start, start + HOUR_MS));
        assert_eq!(q.amount, 20);
    }

    #[test]
    fn hourly_range_ends_after_last_cell() {
        // 09:00 through the 11:00 cell → window closes at 12:00
        let start = at(2025, 12, 4, 9, 0);
        let last = at(2025, 12, 4, 11, 0);
        let q = resolve(BookingKind::Hourly, start, Some(last), 60).unwrap();
        assert_eq!(q.span.end, at(2025, 12, 4, 12, 0));
        assert_eq!(q.amount, 60);
    }

    #[test]
    fn hourly_end_before_start_rejected() {
        let start = at(2025, 12, 4, 11, 0);
        let last = at(2025, 12, 4, 9, 0);
        assert_eq!(
            resolve(BookingKind::Hourly, start, Some(last), 60),
            Err(ParkError::InvalidSpan)
        );
    }

    #[test]
    fn out_of_range_timestamps_rejected_before_arithmetic() {
        // Quote requests carry raw i64 millis; an unbounded start or end
        // cell would overflow the window math.
        let err = Err(ParkError::LimitExceeded("timestamp out of range"));
        assert_eq!(resolve(BookingKind::Flat24h, i64::MAX - 1, None, 60), err);
        assert_eq!(resolve(BookingKind::MonthlyRegular, i64::MAX - 1, None, 60), err);
        assert_eq!(resolve(BookingKind::Hourly, -1, None, 60), err);
        assert_eq!(resolve(BookingKind::Hourly, 0, Some(i64::MAX - 1), 60), err);
    }

    #[test]
    fn flat24_is_exactly_24_hours() {
        let start = at(2025, 12, 4, 9, 0);
        let q = resolve(BookingKind::Flat24h, start, None, 60).unwrap();
        assert_eq!(q.span.end, at(2025, 12, 5, 9, 0));
        assert_eq!(q.amount, FLAT24_AMOUNT);
    }

    #[test]
    fn monthly_regular_window() {
        let q = resolve(BookingKind::MonthlyRegular, at(2025, 12, 4, 0, 0), None, 60).unwrap();
        assert_eq!(q.span.start, at(2025, 12, 4, 0, 0));
        let end = ms_of(
            NaiveDate::from_ymd_opt(2026, 1, 4)
                .unwrap()
                .and_hms_opt(23, 59, 59)
                .unwrap(),
        );
        assert_eq!(q.span.end, end);
        assert_eq!(q.amount, MONTHLY_AMOUNT);
    }

    #[test]
    fn monthly_regular_clamps_short_month() {
        // Jan 31 + 1 month clamps to Feb 28 (2026 is not a leap year)
        let q = resolve(BookingKind::MonthlyRegular, at(2026, 1, 31, 0, 0), None, 60).unwrap();
        assert_eq!(date_of(q.span.end), NaiveDate::from_ymd_opt(2026, 2, 28).unwrap());
    }

    #[test]
    fn monthly_night_window() {
        let q = resolve(BookingKind::MonthlyNight, at(2025, 12, 1, 0, 0), None, 60).unwrap();
        assert_eq!(q.span.start, at(2025, 12, 1, 18, 0));
        assert_eq!(q.span.end, at(2026, 1, 1, 8, 0));
        assert_eq!(q.amount, MONTHLY_AMOUNT);
    }

    #[test]
    fn price_rounds_hours_up() {
        // 13:00–15:30 is 2.5 hours → billed as 3
        let span = Span::new(at(2025, 12, 4, 13, 0), at(2025, 12, 4, 15, 30));
        assert_eq!(price(BookingKind::Hourly, &span), 60);
        // Determinism
        assert_eq!(price(BookingKind::Hourly, &span), 60);
    }

    #[test]
    fn price_exact_hours_no_rounding() {
        let span = Span::new(at(2025, 12, 4, 9, 0), at(2025, 12, 4, 11, 0));
        assert_eq!(price(BookingKind::Hourly, &span), 40);
    }

    #[test]
    fn flat_prices_ignore_duration() {
        let span = Span::new(0, 1);
        assert_eq!(price(BookingKind::Flat24h, &span), 200);
        assert_eq!(price(BookingKind::MonthlyRegular, &span), 1500);
        assert_eq!(price(BookingKind::MonthlyNight, &span), 1500);
    }
}
