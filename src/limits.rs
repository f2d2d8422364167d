//! Hard limits enforced at the engine edges. Every mutation and query
//! validates against these before touching state.

use crate::model::Ms;

/// Max sites per campus.
pub const MAX_SITES: usize = 1_000;

/// Max buildings per campus.
pub const MAX_BUILDINGS: usize = 10_000;

/// Max physical slots in one building.
pub const MAX_SLOTS_PER_BUILDING: usize = 50_000;

/// Max weekly schedule rules per building. Seven is already one per day.
pub const MAX_SCHEDULE_RULES: usize = 7;

/// Max live reservation rows per building (all statuses).
pub const MAX_RESERVATIONS_PER_BUILDING: usize = 100_000;

/// Max length of site/building names.
pub const MAX_NAME_LEN: usize = 256;

/// Max length of floor and zone names.
pub const MAX_LABEL_LEN: usize = 32;

/// Max length of user identifiers.
pub const MAX_USER_LEN: usize = 128;

/// Max ids accepted in one `IN (...)` clause.
pub const MAX_IN_CLAUSE_IDS: usize = 100;

/// Widest availability/occupancy query window (covers any monthly span).
pub const MAX_QUERY_WINDOW_MS: Ms = 62 * 24 * 3_600_000;

/// Widest reservation span (a monthly window is at most ~32 days).
pub const MAX_SPAN_DURATION_MS: Ms = 35 * 24 * 3_600_000;

/// Timestamp sanity bounds: [1970-01-01, 2100-01-01).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Day-grid generation bounds.
pub const DEFAULT_WINDOW_DAYS: u32 = 5;
pub const MAX_WINDOW_DAYS: u32 = 31;

/// Smallest selectable grid granularity in minutes.
pub const MIN_GRANULARITY_MIN: u32 = 15;

/// How long a pending reservation may stay unconfirmed before the sweep
/// cancels it.
pub const PENDING_GRACE_MS: Ms = 15 * 60 * 1_000;

/// Max campuses one server will host.
pub const MAX_CAMPUSES: usize = 256;

/// Max length of a campus (database) name.
pub const MAX_CAMPUS_NAME_LEN: usize = 64;
