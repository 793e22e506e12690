//! Awake-window arithmetic shared by the greeting scheduler and the
//! prospect ingestor: both key off the same configured morning/night hours,
//! just on opposite sides of the window.

use chrono::{TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// True when the current hour in `tz` falls within `[morning, night]`.
pub fn in_awake_window(tz: &Tz, morning: u32, night: u32) -> bool {
    let now = Utc::now().with_timezone(tz);
    let hour = now.hour();
    morning <= hour && hour <= night
}

/// True outside the awake window — prospecting and heavy DB scans run at
/// night, when live conversations are quiet.
pub fn in_night_window(tz: &Tz, morning: u32, night: u32) -> bool {
    !in_awake_window(tz, morning, night)
}

/// Parses a configured timezone name, falling back to Moscow time the same
/// way the rest of the fleet does when the name doesn't resolve.
pub fn resolve_timezone(name: &str) -> Tz {
    name.parse().unwrap_or(chrono_tz::Europe::Moscow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_timezone_falls_back_on_unknown_name() {
        assert_eq!(resolve_timezone("Not/A_Zone"), chrono_tz::Europe::Moscow);
        assert_eq!(resolve_timezone("Europe/Moscow"), chrono_tz::Europe::Moscow);
    }

}
