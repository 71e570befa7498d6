//! Trip persistence seam and an in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{Trip, TripRequest, TripStatus};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TripError {
    #[error("trip {0} not found")]
    NotFound(String),
    #[error("trip {trip_id} cannot go from {from} to {to}")]
    InvalidTransition {
        trip_id: String,
        from: TripStatus,
        to: TripStatus,
    },
}

#[async_trait]
pub trait TripStore: Send + Sync {
    async fn create_trip(&self, request: TripRequest) -> Result<Trip, TripError>;
    async fn accept_trip(&self, trip_id: &str, driver_id: &str) -> Result<Trip, TripError>;
    async fn update_trip_status(&self, trip_id: &str, status: TripStatus)
        -> Result<Trip, TripError>;
    /// Every later change to the trip.
    async fn subscribe(&self, trip_id: &str) -> Result<broadcast::Receiver<Trip>, TripError>;
    async fn get_trip_by_id(&self, trip_id: &str) -> Result<Trip, TripError>;
}

struct Entry {
    trip: Trip,
    changes: broadcast::Sender<Trip>,
}

#[derive(Default)]
pub struct MemoryTripStore {
    trips: Mutex<HashMap<String, Entry>>,
}

impl MemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `trip` as-is, replacing any trip with the same id.
    pub fn insert(&self, trip: Trip) {
        let (changes, _) = broadcast::channel(16);
        self.trips
            .lock()
            .insert(trip.id.clone(), Entry { trip, changes });
    }

    fn modify(
        &self,
        trip_id: &str,
        apply: impl FnOnce(&mut Trip) -> Result<(), TripError>,
    ) -> Result<Trip, TripError> {
        let mut trips = self.trips.lock();
        let entry = trips
            .get_mut(trip_id)
            .ok_or_else(|| TripError::NotFound(trip_id.to_string()))?;
        apply(&mut entry.trip)?;
        let _ = entry.changes.send(entry.trip.clone());
        Ok(entry.trip.clone())
    }
}

/// Trips only move forward; cancelling is allowed until the trip is over.
fn allowed(from: TripStatus, to: TripStatus) -> bool {
    use TripStatus::*;
    matches!(
        (from, to),
        (Searching, Accepted)
            | (Accepted, DriverArriving)
            | (Accepted, InProgress)
            | (DriverArriving, InProgress)
            | (InProgress, Completed)
    ) || (to == Cancelled && !from.is_terminal())
}

#[async_trait]
impl TripStore for MemoryTripStore {
    async fn create_trip(&self, request: TripRequest) -> Result<Trip, TripError> {
        let trip = Trip {
            id: uuid::Uuid::new_v4().to_string(),
            rider_id: request.rider_id,
            driver_id: None,
            status: TripStatus::Searching,
            pickup: request.pickup,
            dropoff: request.dropoff,
            created_at: Utc::now(),
        };
        tracing::info!("Trip {} created for rider {}", trip.id, trip.rider_id);
        self.insert(trip.clone());
        Ok(trip)
    }

    async fn accept_trip(&self, trip_id: &str, driver_id: &str) -> Result<Trip, TripError> {
        self.modify(trip_id, |trip| {
            if trip.status != TripStatus::Searching {
                return Err(TripError::InvalidTransition {
                    trip_id: trip.id.clone(),
                    from: trip.status,
                    to: TripStatus::Accepted,
                });
            }
            trip.driver_id = Some(driver_id.to_string());
            trip.status = TripStatus::Accepted;
            tracing::info!("Trip {} accepted by {}", trip.id, driver_id);
            Ok(())
        })
    }

    async fn update_trip_status(
        &self,
        trip_id: &str,
        status: TripStatus,
    ) -> Result<Trip, TripError> {
        self.modify(trip_id, |trip| {
            if !allowed(trip.status, status) {
                return Err(TripError::InvalidTransition {
                    trip_id: trip.id.clone(),
                    from: trip.status,
                    to: status,
                });
            }
            tracing::debug!("Trip {}: {} -> {}", trip.id, trip.status, status);
            trip.status = status;
            Ok(())
        })
    }

    async fn subscribe(&self, trip_id: &str) -> Result<broadcast::Receiver<Trip>, TripError> {
        self.trips
            .lock()
            .get(trip_id)
            .map(|e| e.changes.subscribe())
            .ok_or_else(|| TripError::NotFound(trip_id.to_string()))
    }

    async fn get_trip_by_id(&self, trip_id: &str) -> Result<Trip, TripError> {
        self.trips
            .lock()
            .get(trip_id)
            .map(|e| e.trip.clone())
            .ok_or_else(|| TripError::NotFound(trip_id.to_string()))
    }
}
