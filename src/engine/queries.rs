use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::{self, Granularity};
use crate::limits::*;
use crate::model::*;

use super::{availability, oracle, Engine, ParkError};

impl Engine {
    pub fn get_site(&self, id: &Ulid) -> Option<Site> {
        self.sites.get(id).map(|e| e.value().clone())
    }

    pub fn list_sites(&self) -> Vec<Site> {
        let mut sites: Vec<Site> = self.sites.iter().map(|e| e.value().clone()).collect();
        sites.sort_by_key(|s| s.id);
        sites
    }

    /// Building rows with their occupancy rollups as of `now`.
    pub async fn list_buildings(&self, site: Option<Ulid>, now: Ms) -> Vec<BuildingInfo> {
        let mut building_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        building_ids.sort();

        let mut out = Vec::new();
        for id in building_ids {
            let Some(shared) = self.get_building(&id) else {
                continue;
            };
            let guard = shared.read().await;
            if let Some(site_id) = site
                && guard.site_id != site_id
            {
                continue;
            }
            out.push(availability::building_info(&guard, now));
        }
        out
    }

    pub async fn get_building_info(&self, id: Ulid, now: Ms) -> Option<BuildingInfo> {
        let shared = self.get_building(&id)?;
        let guard = shared.read().await;
        Some(availability::building_info(&guard, now))
    }

    pub async fn list_slots(&self, building_id: Ulid) -> Vec<SlotInfo> {
        let Some(shared) = self.get_building(&building_id) else {
            return Vec::new();
        };
        let guard = shared.read().await;
        guard
            .slots
            .iter()
            .map(|(key, slot)| SlotInfo {
                building_id,
                floor: key.floor.clone(),
                zone: key.zone.clone(),
                seq: key.seq,
                label: key.label(),
                vehicle: slot.vehicle,
            })
            .collect()
    }

    pub async fn list_schedule(&self, building_id: Ulid) -> Vec<ScheduleRule> {
        let Some(shared) = self.get_building(&building_id) else {
            return Vec::new();
        };
        let guard = shared.read().await;
        guard.schedule.clone()
    }

    /// Reservations matching every present filter, ordered by creation time.
    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Vec<ReservationInfo>, ParkError> {
        if let Some(ids) = &filter.ids
            && ids.len() > MAX_IN_CLAUSE_IDS
        {
            return Err(ParkError::LimitExceeded("too many ids in filter"));
        }

        let building_ids: Vec<Ulid> = if let Some(b) = filter.building {
            vec![b]
        } else if let Some(ids) = &filter.ids {
            let mut bids: Vec<Ulid> = ids
                .iter()
                .filter_map(|id| self.building_of_reservation(id))
                .collect();
            bids.sort();
            bids.dedup();
            bids
        } else {
            let mut bids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
            bids.sort();
            bids
        };

        let id_set: Option<HashSet<Ulid>> =
            filter.ids.as_ref().map(|ids| ids.iter().copied().collect());

        let mut out = Vec::new();
        for bid in building_ids {
            let Some(shared) = self.get_building(&bid) else {
                continue;
            };
            let guard = shared.read().await;
            for r in guard.reservations.values() {
                if let Some(set) = &id_set
                    && !set.contains(&r.id)
                {
                    continue;
                }
                if let Some(u) = &filter.user
                    && r.user != *u
                {
                    continue;
                }
                if let Some(s) = filter.status
                    && r.status != s
                {
                    continue;
                }
                out.push(ReservationInfo::from_reservation(r));
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Per-floor zone rollup for a window. Unknown building reads as empty.
    pub async fn availability_by_floor(
        &self,
        building_id: Ulid,
        window: Span,
        vehicle: Option<VehicleType>,
    ) -> Result<Vec<FloorAvailability>, ParkError> {
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(ParkError::LimitExceeded("query window too wide"));
        }
        let Some(shared) = self.get_building(&building_id) else {
            return Ok(Vec::new());
        };
        let guard = shared.read().await;
        Ok(availability::floor_availability(&guard, &window, vehicle))
    }

    /// Zone rollup pooled across floors for a window.
    pub async fn availability_by_zone(
        &self,
        building_id: Ulid,
        window: Span,
        vehicle: Option<VehicleType>,
    ) -> Result<Vec<ZoneAvailability>, ParkError> {
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(ParkError::LimitExceeded("query window too wide"));
        }
        let Some(shared) = self.get_building(&building_id) else {
            return Ok(Vec::new());
        };
        let guard = shared.read().await;
        Ok(availability::zone_availability(&guard, &window, vehicle))
    }

    /// Bookable count for a consecutive multi-cell selection: the minimum of
    /// the per-cell free counts.
    pub async fn free_for_cells(
        &self,
        building_id: Ulid,
        scope: Option<&ZoneScope>,
        vehicle: Option<VehicleType>,
        cells: &[Span],
    ) -> Result<u32, ParkError> {
        if let (Some(first), Some(last)) = (cells.first(), cells.last())
            && last.end - first.start > MAX_QUERY_WINDOW_MS
        {
            return Err(ParkError::LimitExceeded("query window too wide"));
        }
        let Some(shared) = self.get_building(&building_id) else {
            return Ok(0);
        };
        let guard = shared.read().await;
        Ok(availability::min_free_across(&guard, scope, vehicle, cells))
    }

    /// The day/cell selection grid for a booking mode, with each cell's
    /// remaining count filled in. Cells with nothing free stop being
    /// selectable.
    pub async fn selectable_windows(
        &self,
        building_id: Ulid,
        mode: BookingKind,
        gran: Granularity,
        vehicle: Option<VehicleType>,
        scope: Option<&ZoneScope>,
        anchor: NaiveDate,
        window_days: u32,
        now: Ms,
    ) -> Result<Vec<DaySection>, ParkError> {
        gran.validate()?;
        if window_days > MAX_WINDOW_DAYS {
            return Err(ParkError::LimitExceeded("too many days in window"));
        }
        let Some(shared) = self.get_building(&building_id) else {
            return Ok(Vec::new());
        };
        let guard = shared.read().await;

        let mut days = calendar::generate_days(&guard.schedule, mode, gran, anchor, window_days, now);
        for day in &mut days {
            for cell in &mut day.cells {
                cell.remaining = oracle::free_count(&guard, scope, vehicle, &cell.span);
                if cell.remaining == 0 {
                    cell.selectable = false;
                }
            }
        }
        Ok(days)
    }

    /// Slots carrying an occupying claim in a window, one row per claim.
    pub async fn occupied_slots(
        &self,
        building_id: Ulid,
        window: Span,
    ) -> Result<Vec<(SlotKey, Ulid)>, ParkError> {
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(ParkError::LimitExceeded("query window too wide"));
        }
        let Some(shared) = self.get_building(&building_id) else {
            return Ok(Vec::new());
        };
        let guard = shared.read().await;
        let mut out = Vec::new();
        for (key, claims) in oracle::occupied_slots(&guard, &window) {
            for reservation in claims {
                out.push((key.clone(), reservation));
            }
        }
        Ok(out)
    }
}
