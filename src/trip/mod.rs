//! Trip and user records, and the services that own them.
//!
//! Calls only need two things from a trip: who the counterpart is, and
//! whether the trip is active.

pub mod auth;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use auth::{AuthProvider, StaticAuth};
pub use store::{MemoryTripStore, TripStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Searching,
    Accepted,
    DriverArriving,
    InProgress,
    Completed,
    Cancelled,
}

impl TripStatus {
    /// A counterpart is known and the trip is not over.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TripStatus::Accepted | TripStatus::DriverArriving | TripStatus::InProgress
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }
}

impl std::fmt::Display for TripStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TripStatus::Searching => "searching",
            TripStatus::Accepted => "accepted",
            TripStatus::DriverArriving => "driver_arriving",
            TripStatus::InProgress => "in_progress",
            TripStatus::Completed => "completed",
            TripStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub rider_id: String,
    pub driver_id: Option<String>,
    pub status: TripStatus,
    pub pickup: String,
    pub dropoff: String,
    pub created_at: DateTime<Utc>,
}

impl Trip {
    /// The other party of the trip as seen by `local_user_id`.
    pub fn counterpart(&self, local_user_id: &str) -> Option<&str> {
        if local_user_id == self.rider_id {
            self.driver_id.as_deref()
        } else if self.driver_id.as_deref() == Some(local_user_id) {
            Some(&self.rider_id)
        } else {
            None
        }
    }
}

/// Rider's request for a new trip.
#[derive(Debug, Clone)]
pub struct TripRequest {
    pub rider_id: String,
    pub pickup: String,
    pub dropoff: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip(driver: Option<&str>) -> Trip {
        Trip {
            id: "t1".into(),
            rider_id: "rider".into(),
            driver_id: driver.map(str::to_string),
            status: TripStatus::Accepted,
            pickup: "A".into(),
            dropoff: "B".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_counterpart() {
        let t = trip(Some("driver"));
        assert_eq!(t.counterpart("rider"), Some("driver"));
        assert_eq!(t.counterpart("driver"), Some("rider"));
        assert_eq!(t.counterpart("someone"), None);
        assert_eq!(trip(None).counterpart("rider"), None);
    }

    #[test]
    fn test_active_statuses() {
        assert!(!TripStatus::Searching.is_active());
        assert!(TripStatus::Accepted.is_active());
        assert!(TripStatus::InProgress.is_active());
        assert!(!TripStatus::Completed.is_active());
        assert!(TripStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_trip_json_shape() {
        let v = serde_json::to_value(trip(Some("driver"))).unwrap();
        assert_eq!(v["riderId"], "rider");
        assert_eq!(v["driverId"], "driver");
        assert_eq!(v["status"], "accepted");
    }
}
