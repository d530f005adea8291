//! Per-key single-flight coordination
//!
//! One refresh may be in progress per key. The first caller to join a key
//! becomes the leader and must eventually call [`InFlightTable::complete`];
//! everyone else gets a receiver on the same broadcast channel and adopts
//! the leader's outcome. The registration is torn down the moment the
//! outcome is published, so late arrivals start a fresh flight instead of
//! observing a stale one.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::cache::error::RefreshError;

pub type FlightOutcome<T> = Result<T, RefreshError>;

/// What a caller got when joining a key
pub enum FlightTicket<T: Clone> {
    /// This caller must run the refresh and publish via `complete`.
    /// The receiver observes its own broadcast, so a leader whose caller
    /// disconnects can still be awaited by others.
    Leader(broadcast::Receiver<FlightOutcome<T>>),
    /// Another caller is already refreshing this key.
    Waiter(broadcast::Receiver<FlightOutcome<T>>),
}

pub struct InFlightTable<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    flights: Mutex<HashMap<K, broadcast::Sender<FlightOutcome<T>>>>,
}

impl<K, T> InFlightTable<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, broadcast::Sender<FlightOutcome<T>>>> {
        // The map stays valid even if a holder panicked mid-operation
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomic check-and-insert: exactly one concurrent caller per key
    /// becomes the leader.
    pub fn join(&self, key: &K) -> FlightTicket<T> {
        let mut flights = self.lock();
        if let Some(sender) = flights.get(key) {
            return FlightTicket::Waiter(sender.subscribe());
        }
        let (sender, receiver) = broadcast::channel(1);
        flights.insert(key.clone(), sender);
        FlightTicket::Leader(receiver)
    }

    /// Publish the terminal outcome to every waiter and tear down the
    /// registration. Removal happens under the lock, so no caller can
    /// subscribe between the broadcast and the teardown.
    pub fn complete(&self, key: &K, outcome: FlightOutcome<T>) {
        let mut flights = self.lock();
        if let Some(sender) = flights.remove(key) {
            // No receivers left is fine; every waiter may have gone away
            let _ = sender.send(outcome);
        }
    }

    /// True while a refresh for the key is executing.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<K, T> Default for InFlightTable<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
