use crate::model::*;

use super::oracle;
use super::ParkError;

/// Pick the first slot that matches the scope and vehicle type and is free
/// over the span. Iteration follows slot-key order (floor, zone, seq), so
/// the pick is deterministic for equal state.
pub(super) fn best_candidate(
    bs: &BuildingState,
    scope: Option<&ZoneScope>,
    vehicle: VehicleType,
    span: &Span,
) -> Result<SlotKey, ParkError> {
    for (key, slot) in &bs.slots {
        if !oracle::in_scope(key, scope) {
            continue;
        }
        if slot.vehicle != vehicle {
            continue;
        }
        if slot.is_free(span) {
            return Ok(key.clone());
        }
    }
    Err(ParkError::ZoneFull)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn building() -> BuildingState {
        let mut bs = BuildingState::new(Ulid::new(), Ulid::new(), "lot".into());
        bs.slots
            .insert(SlotKey::new("1F", "A", 1), SlotState::new(VehicleType::Normal));
        bs.slots
            .insert(SlotKey::new("1F", "A", 2), SlotState::new(VehicleType::Normal));
        bs.slots
            .insert(SlotKey::new("1F", "B", 1), SlotState::new(VehicleType::Ev));
        bs.slots
            .insert(SlotKey::new("2F", "A", 1), SlotState::new(VehicleType::Normal));
        bs
    }

    fn claim(bs: &mut BuildingState, key: &SlotKey, span: Span) {
        bs.slots.get_mut(key).unwrap().insert_occupancy(Occupancy {
            reservation: Ulid::new(),
            span,
        });
    }

    #[test]
    fn picks_lowest_key_first() {
        let bs = building();
        let span = Span::new(10 * H, 12 * H);
        assert_eq!(
            best_candidate(&bs, None, VehicleType::Normal, &span),
            Ok(SlotKey::new("1F", "A", 1))
        );
    }

    #[test]
    fn skips_busy_slots() {
        let mut bs = building();
        let span = Span::new(10 * H, 12 * H);
        claim(&mut bs, &SlotKey::new("1F", "A", 1), span);
        assert_eq!(
            best_candidate(&bs, None, VehicleType::Normal, &span),
            Ok(SlotKey::new("1F", "A", 2))
        );
    }

    #[test]
    fn honors_zone_scope_and_vehicle() {
        let bs = building();
        let span = Span::new(10 * H, 12 * H);
        let scope = ZoneScope { floor: None, zone: "B".into() };
        assert_eq!(
            best_candidate(&bs, Some(&scope), VehicleType::Ev, &span),
            Ok(SlotKey::new("1F", "B", 1))
        );
        // Zone B holds no normal slots.
        assert_eq!(
            best_candidate(&bs, Some(&scope), VehicleType::Normal, &span),
            Err(ParkError::ZoneFull)
        );
    }

    #[test]
    fn scoped_to_floor_ignores_other_floors() {
        let mut bs = building();
        let span = Span::new(10 * H, 12 * H);
        let scope = ZoneScope { floor: Some("2F".into()), zone: "A".into() };
        assert_eq!(
            best_candidate(&bs, Some(&scope), VehicleType::Normal, &span),
            Ok(SlotKey::new("2F", "A", 1))
        );
        claim(&mut bs, &SlotKey::new("2F", "A", 1), span);
        assert_eq!(
            best_candidate(&bs, Some(&scope), VehicleType::Normal, &span),
            Err(ParkError::ZoneFull)
        );
    }

    #[test]
    fn all_busy_is_zone_full() {
        let mut bs = building();
        let span = Span::new(10 * H, 12 * H);
        for key in [
            SlotKey::new("1F", "A", 1),
            SlotKey::new("1F", "A", 2),
            SlotKey::new("2F", "A", 1),
        ] {
            claim(&mut bs, &key, span);
        }
        assert_eq!(
            best_candidate(&bs, None, VehicleType::Normal, &span),
            Err(ParkError::ZoneFull)
        );
        // An adjacent window is still fine.
        assert!(best_candidate(&bs, None, VehicleType::Normal, &Span::new(12 * H, 13 * H)).is_ok());
    }
}
