use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Kind of vehicle a slot accepts and a reservation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleType {
    Normal,
    Ev,
    Motorcycle,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Normal => "normal",
            VehicleType::Ev => "ev",
            VehicleType::Motorcycle => "motorcycle",
        }
    }

    /// Accepts "car" as an alias for normal (legacy client vocabulary).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" | "car" => Some(VehicleType::Normal),
            "ev" => Some(VehicleType::Ev),
            "motorcycle" => Some(VehicleType::Motorcycle),
            _ => None,
        }
    }

    pub const ALL: [VehicleType; 3] =
        [VehicleType::Normal, VehicleType::Ev, VehicleType::Motorcycle];
}

/// Booking mode. Determines how a grid selection resolves to a window and a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingKind {
    Hourly,
    Flat24h,
    MonthlyRegular,
    MonthlyNight,
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingKind::Hourly => "hourly",
            BookingKind::Flat24h => "flat_24h",
            BookingKind::MonthlyRegular => "monthly_regular",
            BookingKind::MonthlyNight => "monthly_night",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(BookingKind::Hourly),
            "flat_24h" => Some(BookingKind::Flat24h),
            "monthly_regular" => Some(BookingKind::MonthlyRegular),
            "monthly_night" => Some(BookingKind::MonthlyNight),
            _ => None,
        }
    }

    pub fn is_monthly(&self) -> bool {
        matches!(self, BookingKind::MonthlyRegular | BookingKind::MonthlyNight)
    }
}

/// Reservation lifecycle status. Only occupying statuses block a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::CheckedIn => "checked_in",
            ReservationStatus::CheckedOut => "checked_out",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "checked_in" => Some(ReservationStatus::CheckedIn),
            "checked_out" => Some(ReservationStatus::CheckedOut),
            "cancelled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether a reservation in this status counts against slot availability.
    pub fn is_occupying(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending
                | ReservationStatus::Confirmed
                | ReservationStatus::CheckedIn
        )
    }

    /// Legal lifecycle moves. Cancelled and checked_out are terminal.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, CheckedIn)
                | (Confirmed, Cancelled)
                | (CheckedIn, CheckedOut)
        )
    }
}

/// Structured slot identity within a building: floor name, zone name, sequence.
/// Ordering is (floor, zone, seq), the allocator's best-fit order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub floor: String,
    pub zone: String,
    pub seq: u32,
}

impl SlotKey {
    pub fn new(floor: impl Into<String>, zone: impl Into<String>, seq: u32) -> Self {
        Self { floor: floor.into(), zone: zone.into(), seq }
    }

    /// Display label, e.g. `3F-A-012`.
    pub fn label(&self) -> String {
        format!("{}-{}-{:03}", self.floor, self.zone, self.seq)
    }

    /// Inverse of [`label`](Self::label). Splits from the right so floor
    /// names may themselves contain `-`.
    pub fn parse(label: &str) -> Option<Self> {
        let mut parts = label.rsplitn(3, '-');
        let seq = parts.next()?.parse().ok()?;
        let zone = parts.next()?;
        let floor = parts.next()?;
        if floor.is_empty() || zone.is_empty() {
            return None;
        }
        Some(SlotKey::new(floor, zone, seq))
    }
}

/// Restricts slot selection to a zone name, optionally on one floor.
/// `floor: None` treats same-named zones across floors as one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneScope {
    pub floor: Option<String>,
    pub zone: String,
}

/// Site category as displayed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteCategory {
    Parking,
    Building,
}

impl SiteCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteCategory::Parking => "parking",
            SiteCategory::Building => "building",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parking" => Some(SiteCategory::Parking),
            "building" => Some(SiteCategory::Building),
            _ => None,
        }
    }
}

/// A physical campus location owning one or more buildings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: Ulid,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub category: SiteCategory,
}

/// One weekly operating rule: a set of weekdays and an open/close wall.
/// Times are minutes from midnight; close < open means close is next-day.
/// Invariant (ingestion-checked): no two rules of a building share a weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    /// Bitmask, bit 0 = Monday .. bit 6 = Sunday.
    pub days: u8,
    pub open_min: u16,
    pub close_min: u16,
}

impl ScheduleRule {
    pub fn covers_day(&self, weekday_from_monday: u32) -> bool {
        self.days & (1 << weekday_from_monday) != 0
    }
}

/// One occupying reservation's claim on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub reservation: Ulid,
    pub span: Span,
}

/// Per-slot state: accepted vehicle type plus the occupying claims,
/// sorted by `span.start`. Non-occupying reservations are never indexed here.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub vehicle: VehicleType,
    pub occupancy: Vec<Occupancy>,
}

impl SlotState {
    pub fn new(vehicle: VehicleType) -> Self {
        Self { vehicle, occupancy: Vec::new() }
    }

    /// Insert a claim maintaining sort order by span.start.
    pub fn insert_occupancy(&mut self, occ: Occupancy) {
        let pos = self
            .occupancy
            .binary_search_by_key(&occ.span.start, |o| o.span.start)
            .unwrap_or_else(|e| e);
        self.occupancy.insert(pos, occ);
    }

    /// Remove the claim of a reservation, if present.
    pub fn remove_occupancy(&mut self, reservation: Ulid) -> Option<Occupancy> {
        if let Some(pos) = self.occupancy.iter().position(|o| o.reservation == reservation) {
            Some(self.occupancy.remove(pos))
        } else {
            None
        }
    }

    /// Claims whose span overlaps the query window.
    /// Uses binary search to skip claims starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Occupancy> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.occupancy.partition_point(|o| o.span.start < query.end);
        self.occupancy[..right_bound]
            .iter()
            .filter(move |o| o.span.end > query.start)
    }

    pub fn is_free(&self, query: &Span) -> bool {
        self.overlapping(query).next().is_none()
    }
}

/// The central mutable entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user: String,
    pub building: Ulid,
    /// None only for drafts that defer the slot pick; the commit path
    /// always allocates before insert.
    pub slot: Option<SlotKey>,
    pub vehicle: VehicleType,
    pub span: Span,
    pub status: ReservationStatus,
    pub booking: BookingKind,
    pub amount: i64,
    pub created_at: Ms,
}

/// A building's full in-memory state: schedule, slot inventory, reservations.
#[derive(Debug, Clone)]
pub struct BuildingState {
    pub id: Ulid,
    pub site_id: Ulid,
    pub name: String,
    pub schedule: Vec<ScheduleRule>,
    pub slots: BTreeMap<SlotKey, SlotState>,
    pub reservations: HashMap<Ulid, Reservation>,
}

impl BuildingState {
    pub fn new(id: Ulid, site_id: Ulid, name: String) -> Self {
        Self {
            id,
            site_id,
            name,
            schedule: Vec::new(),
            slots: BTreeMap::new(),
            reservations: HashMap::new(),
        }
    }

    /// Total slots accepting the given vehicle type.
    pub fn capacity_of(&self, vehicle: VehicleType) -> u32 {
        self.slots.values().filter(|s| s.vehicle == vehicle).count() as u32
    }

    pub fn capacity_counts(&self) -> VehicleCounts {
        let mut counts = VehicleCounts::default();
        for slot in self.slots.values() {
            counts.bump(slot.vehicle);
        }
        counts
    }
}

/// Per-vehicle-type counters for capacity/availability rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VehicleCounts {
    pub normal: u32,
    pub ev: u32,
    pub motorcycle: u32,
}

impl VehicleCounts {
    pub fn get(&self, vehicle: VehicleType) -> u32 {
        match vehicle {
            VehicleType::Normal => self.normal,
            VehicleType::Ev => self.ev,
            VehicleType::Motorcycle => self.motorcycle,
        }
    }

    pub fn set(&mut self, vehicle: VehicleType, value: u32) {
        match vehicle {
            VehicleType::Normal => self.normal = value,
            VehicleType::Ev => self.ev = value,
            VehicleType::Motorcycle => self.motorcycle = value,
        }
    }

    pub fn bump(&mut self, vehicle: VehicleType) {
        let v = self.get(vehicle) + 1;
        self.set(vehicle, v);
    }

    pub fn total(&self) -> u32 {
        self.normal + self.ev + self.motorcycle
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SiteCreated {
        id: Ulid,
        name: String,
        lat: f64,
        lng: f64,
        category: SiteCategory,
    },
    BuildingCreated {
        id: Ulid,
        site_id: Ulid,
        name: String,
    },
    ScheduleRuleAdded {
        building_id: Ulid,
        rule: ScheduleRule,
    },
    SlotAdded {
        building_id: Ulid,
        key: SlotKey,
        vehicle: VehicleType,
    },
    ReservationCreated {
        building_id: Ulid,
        reservation: Reservation,
    },
    ReservationStatusChanged {
        building_id: Ulid,
        id: Ulid,
        status: ReservationStatus,
    },
}

impl Event {
    /// The building a committed event belongs to, for notify fan-out.
    /// Site creation precedes any building and has no channel.
    pub fn building_id(&self) -> Option<Ulid> {
        match self {
            Event::SiteCreated { .. } => None,
            Event::BuildingCreated { id, .. } => Some(*id),
            Event::ScheduleRuleAdded { building_id, .. }
            | Event::SlotAdded { building_id, .. }
            | Event::ReservationCreated { building_id, .. }
            | Event::ReservationStatusChanged { building_id, .. } => Some(*building_id),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BuildingInfo {
    pub id: Ulid,
    pub site_id: Ulid,
    pub name: String,
    pub capacity: VehicleCounts,
    pub available: VehicleCounts,
    pub open_now: bool,
    pub status: BuildingStatus,
}

/// Coarse occupancy rollup for building lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildingStatus {
    Available,
    Low,
    Full,
}

impl BuildingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildingStatus::Available => "available",
            BuildingStatus::Low => "low",
            BuildingStatus::Full => "full",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub building_id: Ulid,
    pub floor: String,
    pub zone: String,
    pub seq: u32,
    pub label: String,
    pub vehicle: VehicleType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub user: String,
    pub building_id: Ulid,
    pub slot_label: Option<String>,
    pub vehicle: VehicleType,
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
    pub booking: BookingKind,
    pub amount: i64,
    pub created_at: Ms,
}

impl ReservationInfo {
    pub fn from_reservation(r: &Reservation) -> Self {
        Self {
            id: r.id,
            user: r.user.clone(),
            building_id: r.building,
            slot_label: r.slot.as_ref().map(SlotKey::label),
            vehicle: r.vehicle,
            start: r.span.start,
            end: r.span.end,
            status: r.status,
            booking: r.booking,
            amount: r.amount,
            created_at: r.created_at,
        }
    }
}

/// WHERE-clause filters a reservation listing can combine. All present
/// filters must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub building: Option<Ulid>,
    pub ids: Option<Vec<Ulid>>,
    pub user: Option<String>,
    pub status: Option<ReservationStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneAvailability {
    pub zone: String,
    pub capacity: u32,
    pub available: u32,
}

impl ZoneAvailability {
    pub fn status(&self) -> &'static str {
        if self.available > 0 { "available" } else { "full" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloorAvailability {
    pub floor: String,
    pub zones: Vec<ZoneAvailability>,
}

/// One selectable cell in a generated day grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCell {
    pub span: Span,
    pub duration_min: u32,
    /// Free slots of the requested type over the cell's span.
    /// Provisional until the oracle fills it.
    pub remaining: u32,
    pub selectable: bool,
}

/// One calendar day of the selection grid. A closed day has no cells.
/// Monthly grids pad the first week with `pad: true` entries for
/// weekday alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaySection {
    pub date: chrono::NaiveDate,
    pub pad: bool,
    pub cells: Vec<GridCell>,
}

/// A resolved booking window with its price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub span: Span,
    pub amount: i64,
}

/// Immutable staged state of one booking attempt. Each stage returns a new
/// value; nothing is mutated in place, so a superseded stage result can be
/// dropped without partial updates.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingDraft {
    pub user: String,
    pub building: Ulid,
    pub vehicle: VehicleType,
    pub booking: BookingKind,
    pub window: Option<Quote>,
    pub zone: Option<ZoneScope>,
    pub slot: Option<SlotKey>,
}

impl BookingDraft {
    pub fn new(
        user: impl Into<String>,
        building: Ulid,
        vehicle: VehicleType,
        booking: BookingKind,
    ) -> Self {
        Self {
            user: user.into(),
            building,
            vehicle,
            booking,
            window: None,
            zone: None,
            slot: None,
        }
    }

    pub fn with_window(self, window: Quote) -> Self {
        Self { window: Some(window), ..self }
    }

    pub fn with_zone(self, zone: ZoneScope) -> Self {
        Self { zone: Some(zone), ..self }
    }

    pub fn with_slot(self, slot: SlotKey) -> Self {
        Self { slot: Some(slot), ..self }
    }
}

/// Event published to building listeners after a committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationEvent {
    pub building_id: Ulid,
    pub reservation_id: Ulid,
    pub status: ReservationStatus,
    pub slot_label: Option<String>,
    pub start: Ms,
    pub end: Ms,
}
