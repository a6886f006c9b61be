use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

/// Bounds how many jobs one scheduler instance runs at once.
///
/// Tracks the ids of in-flight jobs; a slot is released when the returned
/// [`InFlightGuard`] is dropped, whether the attempt succeeded or not.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    cap: usize,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl ConcurrencyLimiter {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.cap.saturating_sub(self.in_flight())
    }

    /// Reserve a slot for `job_id`. Returns `None` when the cap is reached or the
    /// job is already in flight here.
    pub fn admit(&self, job_id: Uuid) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if set.len() >= self.cap || !set.insert(job_id) {
            return None;
        }
        Some(InFlightGuard {
            job_id,
            in_flight: Arc::clone(&self.in_flight),
        })
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    job_id: Uuid,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_cap() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.admit(Uuid::new_v4());
        let b = limiter.admit(Uuid::new_v4());
        assert!(a.is_some() && b.is_some());
        assert!(limiter.admit(Uuid::new_v4()).is_none());
        assert_eq!(limiter.available(), 0);
    }

    #[test]
    fn test_drop_releases_slot() {
        let limiter = ConcurrencyLimiter::new(1);
        let guard = limiter.admit(Uuid::new_v4());
        assert_eq!(limiter.in_flight(), 1);
        drop(guard);
        assert_eq!(limiter.available(), 1);
    }

    #[test]
    fn test_same_job_not_admitted_twice() {
        let limiter = ConcurrencyLimiter::new(3);
        let id = Uuid::new_v4();
        let _guard = limiter.admit(id);
        assert!(limiter.admit(id).is_none());
    }
}
