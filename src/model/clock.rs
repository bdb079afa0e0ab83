use super::Event;

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Monotonic timestamp source for one stored series.
///
/// The durable store keys values by timestamp within a series, so two events
/// sharing a timestamp would overwrite each other. Each timestamp handed out
/// is strictly greater than the previous one: a repeat (or a step backwards)
/// is bumped to one microsecond past the last value.
#[derive(Debug, Default)]
pub struct InterpolatedClock {
    last: Option<i64>,
}

impl InterpolatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose first stamp is strictly after `last`.
    pub fn resume_after(last: Option<i64>) -> Self {
        Self { last }
    }

    /// Last timestamp handed out.
    pub fn last(&self) -> Option<i64> {
        self.last
    }

    /// Sort `events` by time and rewrite their timestamps from this clock.
    pub fn stamp(&mut self, events: &mut [Event]) {
        events.sort_by_key(|e| e.timestamp);
        for event in events.iter_mut() {
            event.timestamp = self.next(event.timestamp);
        }
    }

    /// Return the timestamp to store for an event that happened at `ts`.
    pub fn next(&mut self, ts: i64) -> i64 {
        let out = match self.last {
            Some(last) if ts <= last => last + 1,
            _ => ts,
        };
        self.last = Some(out);
        out
    }
}

/// Sort events by timestamp and rewrite timestamps to be strictly increasing.
pub fn interpolate(events: &mut [Event]) {
    InterpolatedClock::new().stamp(events);
}
