use chrono::{DateTime, Duration, Utc};

/// Two next-lookup instants closer than this are treated as the same schedule.
pub const NEXT_LOOKUP_TOLERANCE_SECS: i64 = 5;

/// Checks whether `last_lookup + existing_ttl` and `now + current_ttl` are
/// within [`NEXT_LOOKUP_TOLERANCE_SECS`] of each other, in either direction.
pub fn is_same_next_lookup_time(last_lookup: DateTime<Utc>, existing_ttl: i32, current_ttl: i32) -> bool {
    is_same_next_lookup_time_at(Utc::now(), last_lookup, existing_ttl, current_ttl)
}

pub fn is_same_next_lookup_time_at(
    now: DateTime<Utc>,
    last_lookup: DateTime<Utc>,
    existing_ttl: i32,
    current_ttl: i32,
) -> bool {
    let existing_next = last_lookup + Duration::seconds(existing_ttl as i64);
    let current_next = now + Duration::seconds(current_ttl as i64);
    let delta = existing_next - current_next;
    let tolerance = Duration::seconds(NEXT_LOOKUP_TOLERANCE_SECS);
    delta <= tolerance && delta >= -tolerance
}
