// libs/appointment-cell/src/services/locking.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::AppointmentError;

/// Entries beyond this count trigger a sweep of idle locks.
const PRUNE_THRESHOLD: usize = 1024;

pub type DoctorDayGuard = OwnedMutexGuard<()>;

/// Serializes slot-claiming transitions per `(doctor_id, date)` so overlap
/// checks and the following write see a consistent calendar.
pub struct DoctorDayLocks {
    locks: DashMap<(Uuid, NaiveDate), Arc<Mutex<()>>>,
    wait: Duration,
}

impl DoctorDayLocks {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            wait,
        }
    }

    /// Waits at most the configured time for the doctor-day lock, failing with
    /// the retryable `Busy` error instead of blocking indefinitely.
    pub async fn acquire(&self, doctor_id: Uuid, date: NaiveDate) -> Result<DoctorDayGuard, AppointmentError> {
        self.prune_idle();

        let lock = self.locks
            .entry((doctor_id, date))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        match tokio::time::timeout(self.wait, lock.lock_owned()).await {
            Ok(guard) => {
                debug!("Acquired schedule lock for doctor {} on {}", doctor_id, date);
                Ok(guard)
            }
            Err(_) => {
                warn!("Timed out after {:?} waiting for schedule lock of doctor {} on {}",
                      self.wait, doctor_id, date);
                Err(AppointmentError::Busy { doctor_id, date })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn prune_idle(&self) {
        if self.locks.len() > PRUNE_THRESHOLD {
            // The map's own reference is the only one left on an idle lock.
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
    }

    #[tokio::test]
    async fn second_acquire_times_out_as_busy() {
        let locks = DoctorDayLocks::new(Duration::from_millis(20));
        let doctor_id = Uuid::new_v4();

        let _held = locks.acquire(doctor_id, day()).await.unwrap();
        let err = locks.acquire(doctor_id, day()).await.unwrap_err();

        assert_eq!(err, AppointmentError::Busy { doctor_id, date: day() });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn lock_is_released_with_guard() {
        let locks = DoctorDayLocks::new(Duration::from_millis(20));
        let doctor_id = Uuid::new_v4();

        drop(locks.acquire(doctor_id, day()).await.unwrap());
        locks.acquire(doctor_id, day()).await.unwrap();
    }

    #[tokio::test]
    async fn different_days_and_doctors_are_independent() {
        let locks = DoctorDayLocks::new(Duration::from_millis(20));
        let doctor_id = Uuid::new_v4();
        let next_day = day().succ_opt().unwrap();

        let _a = locks.acquire(doctor_id, day()).await.unwrap();
        let _b = locks.acquire(doctor_id, next_day).await.unwrap();
        let _c = locks.acquire(Uuid::new_v4(), day()).await.unwrap();

        assert_eq!(locks.len(), 3);
    }

    #[tokio::test]
    async fn idle_locks_are_pruned_past_threshold() {
        let locks = DoctorDayLocks::new(Duration::from_millis(20));
        for _ in 0..=PRUNE_THRESHOLD {
            drop(locks.acquire(Uuid::new_v4(), day()).await.unwrap());
        }
        assert_eq!(locks.len(), PRUNE_THRESHOLD + 1);

        let _held = locks.acquire(Uuid::new_v4(), day()).await.unwrap();
        assert_eq!(locks.len(), 1);
    }
}
