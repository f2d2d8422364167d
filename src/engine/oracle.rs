use ulid::Ulid;

use crate::model::*;

use super::ParkError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Timestamps arrive as raw i64 millis; bound them before any window
/// arithmetic can overflow.
pub(crate) fn validate_instant(ms: Ms) -> Result<(), ParkError> {
    use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(ParkError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), ParkError> {
    // Span's fields are pub, so an inverted interval can reach the engine
    // boundary; it must never enter the occupancy index.
    if span.end <= span.start {
        return Err(ParkError::InvalidSpan);
    }
    validate_instant(span.start)?;
    validate_instant(span.end)?;
    if span.duration_ms() > crate::limits::MAX_SPAN_DURATION_MS {
        return Err(ParkError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// True when the slot falls inside the zone scope. `None` matches everything;
/// a scope without a floor pools same-named zones across floors.
pub(crate) fn in_scope(key: &SlotKey, scope: Option<&ZoneScope>) -> bool {
    match scope {
        None => true,
        Some(s) => {
            if key.zone != s.zone {
                return false;
            }
            match &s.floor {
                Some(f) => key.floor == *f,
                None => true,
            }
        }
    }
}

/// Free slots in scope over the window: slots accepting the vehicle type,
/// minus those carrying at least one occupying claim that overlaps the
/// window. A slot with several overlapping claims still subtracts once.
pub(crate) fn free_count(
    bs: &BuildingState,
    scope: Option<&ZoneScope>,
    vehicle: Option<VehicleType>,
    window: &Span,
) -> u32 {
    let mut total = 0u32;
    let mut occupied = 0u32;
    for (key, slot) in &bs.slots {
        if !in_scope(key, scope) {
            continue;
        }
        if let Some(v) = vehicle
            && slot.vehicle != v
        {
            continue;
        }
        total += 1;
        if !slot.is_free(window) {
            occupied += 1;
        }
    }
    total - occupied
}

/// Slot keys with at least one occupying claim overlapping the window,
/// each paired with its claiming reservation ids.
pub(crate) fn occupied_slots(bs: &BuildingState, window: &Span) -> Vec<(SlotKey, Vec<Ulid>)> {
    let mut out = Vec::new();
    for (key, slot) in &bs.slots {
        let claims: Vec<Ulid> = slot.overlapping(window).map(|o| o.reservation).collect();
        if !claims.is_empty() {
            out.push((key.clone(), claims));
        }
    }
    out
}

/// Commit-time check: the slot must carry no occupying claim overlapping
/// the span. Reports the first conflicting reservation otherwise.
pub(crate) fn check_slot_free(
    bs: &BuildingState,
    key: &SlotKey,
    span: &Span,
) -> Result<(), ParkError> {
    let slot = bs
        .slots
        .get(key)
        .ok_or_else(|| ParkError::SlotNotFound(key.clone()))?;
    if let Some(occ) = slot.overlapping(span).next() {
        return Err(ParkError::Conflict(occ.reservation));
    }
    Ok(())
}
