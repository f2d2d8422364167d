use std::collections::BTreeMap;

use crate::model::*;

use super::oracle;

// ── Availability rollups ──────────────────────────────────────────

/// Per-floor, per-zone free counts over a window. Output follows slot-key
/// order, so floors and their zones come out sorted. A vehicle filter
/// restricts both capacity and free counts to slots of that type.
pub fn floor_availability(
    bs: &BuildingState,
    window: &Span,
    vehicle: Option<VehicleType>,
) -> Vec<FloorAvailability> {
    let mut grouped: BTreeMap<(String, String), (u32, u32)> = BTreeMap::new();
    for (key, slot) in &bs.slots {
        if let Some(v) = vehicle
            && slot.vehicle != v
        {
            continue;
        }
        let counts = grouped
            .entry((key.floor.clone(), key.zone.clone()))
            .or_default();
        counts.0 += 1;
        if slot.is_free(window) {
            counts.1 += 1;
        }
    }

    let mut floors: Vec<FloorAvailability> = Vec::new();
    for ((floor, zone), (capacity, available)) in grouped {
        let row = ZoneAvailability {
            zone,
            capacity,
            available,
        };
        match floors.last_mut() {
            Some(f) if f.floor == floor => f.zones.push(row),
            _ => floors.push(FloorAvailability {
                floor,
                zones: vec![row],
            }),
        }
    }
    floors
}

/// Zone free counts pooled across floors: same-named zones on different
/// floors report as one row.
pub fn zone_availability(
    bs: &BuildingState,
    window: &Span,
    vehicle: Option<VehicleType>,
) -> Vec<ZoneAvailability> {
    let mut grouped: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    for (key, slot) in &bs.slots {
        if let Some(v) = vehicle
            && slot.vehicle != v
        {
            continue;
        }
        let counts = grouped.entry(key.zone.clone()).or_default();
        counts.0 += 1;
        if slot.is_free(window) {
            counts.1 += 1;
        }
    }
    grouped
        .into_iter()
        .map(|(zone, (capacity, available))| ZoneAvailability {
            zone,
            capacity,
            available,
        })
        .collect()
}

/// Bookable count over a multi-cell selection: the minimum of the per-cell
/// free counts. Different slots may be taken in different cells, so the
/// free count of the merged window would under-report.
pub fn min_free_across(
    bs: &BuildingState,
    scope: Option<&ZoneScope>,
    vehicle: Option<VehicleType>,
    cells: &[Span],
) -> u32 {
    cells
        .iter()
        .map(|cell| oracle::free_count(bs, scope, vehicle, cell))
        .min()
        .unwrap_or(0)
}

/// Free slots per vehicle type at one instant.
pub fn available_counts(bs: &BuildingState, now: Ms) -> VehicleCounts {
    let mut counts = VehicleCounts::default();
    for slot in bs.slots.values() {
        let taken = slot
            .occupancy
            .iter()
            .any(|o| o.span.contains_instant(now));
        if !taken {
            counts.bump(slot.vehicle);
        }
    }
    counts
}

/// Coarse building status: full when nothing is free, low when less than a
/// tenth of capacity remains.
pub fn rollup_status(capacity: u32, available: u32) -> BuildingStatus {
    if available == 0 {
        BuildingStatus::Full
    } else if available * 10 < capacity {
        BuildingStatus::Low
    } else {
        BuildingStatus::Available
    }
}

pub fn building_info(bs: &BuildingState, now: Ms) -> BuildingInfo {
    let capacity = bs.capacity_counts();
    let available = available_counts(bs, now);
    BuildingInfo {
        id: bs.id,
        site_id: bs.site_id,
        name: bs.name.clone(),
        capacity,
        available,
        open_now: crate::calendar::is_open_at(&bs.schedule, now),
        status: rollup_status(capacity.total(), available.total()),
    }
}
