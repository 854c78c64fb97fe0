use time::OffsetDateTime;
use tracing::warn;
use waldo_domain::now_utc;

/// Hands out event timestamps that never go backwards within one run.
#[derive(Debug, Clone, Default)]
pub struct RunClock {
    last: Option<OffsetDateTime>,
}

impl RunClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) -> OffsetDateTime {
        self.observe(now_utc())
    }

    /// Accepts a caller-supplied timestamp, clamping it to the last one issued
    /// if it is earlier.
    pub fn observe(&mut self, timestamp: OffsetDateTime) -> OffsetDateTime {
        let issued = match self.last {
            Some(last) if timestamp < last => {
                warn!(
                    supplied = %timestamp,
                    last = %last,
                    "event timestamp earlier than previous event in run; clamping"
                );
                last
            }
            _ => timestamp,
        };
        self.last = Some(issued);
        issued
    }

    #[must_use]
    pub fn last(&self) -> Option<OffsetDateTime> {
        self.last
    }
}
