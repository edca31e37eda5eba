use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which eligible run a claim picks first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimOrder {
    /// Earliest `scheduled_at` first.
    #[default]
    OldestFirst,
    /// Latest `scheduled_at` first.
    NewestFirst,
}

impl ClaimOrder {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            ClaimOrder::OldestFirst => "ASC",
            ClaimOrder::NewestFirst => "DESC",
        }
    }
}

/// Parameters for selecting the next claimable run.
///
/// A run is claimable when it is `pending` and due (`scheduled_at <= now`),
/// or when it is `executing` and its lease ran out before `now`. The same
/// rule applies to workflow runs and activity runs.
#[derive(Debug, Clone, Copy)]
pub struct ClaimParams {
    /// Reference time for due dates and lease expiry
    pub now: DateTime<Utc>,
    /// Ordering among eligible runs
    pub order: ClaimOrder,
}

impl ClaimParams {
    pub fn new(order: ClaimOrder) -> Self {
        Self {
            now: Utc::now(),
            order,
        }
    }
}

/// Parameters for taking or renewing ownership of a claimed run.
#[derive(Debug, Clone, Copy)]
pub struct LeaseParams<'a> {
    /// Worker taking the run
    pub worker_id: &'a str,
    /// When the claim lapses unless renewed
    pub expires_at: DateTime<Utc>,
}
