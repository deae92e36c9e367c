use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use std::sync::Mutex;

pub const DEFAULT_ZONE: &str = "Asia/Riyadh";

/// Wall-clock and display zone used for every human-readable time field.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn zone(&self) -> Tz;

    fn local_now(&self) -> DateTime<FixedOffset> {
        in_zone(self.now(), &self.zone())
    }
}

pub fn in_zone(moment: DateTime<Utc>, zone: &Tz) -> DateTime<FixedOffset> {
    let local = moment.with_timezone(zone);
    local.with_timezone(&local.offset().fix())
}

pub fn parse_zone(name: &str) -> Result<Tz, String> {
    name.trim()
        .parse::<Tz>()
        .map_err(|err| format!("unknown time zone {name:?}: {err}"))
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    zone: Tz,
}

impl SystemClock {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn zone(&self) -> Tz {
        self.zone
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    zone: Tz,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>, zone: Tz) -> Self {
        Self {
            now: Mutex::new(now),
            zone,
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn zone(&self) -> Tz {
        self.zone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn local_now_carries_zone_offset() {
        let zone = parse_zone(DEFAULT_ZONE).expect("zone");
        let clock = ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
                .single()
                .expect("valid timestamp"),
            zone,
        );
        let local = clock.local_now();
        assert_eq!(local.offset().local_minus_utc(), 3 * 3600);
        assert_eq!(local.to_rfc3339(), "2026-02-23T17:00:00+03:00");

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.local_now().to_rfc3339(), "2026-02-23T17:05:00+03:00");
    }

    #[test]
    fn rejects_unknown_zone() {
        assert!(parse_zone("Mars/Olympus").is_err());
    }
}
