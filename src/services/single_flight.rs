use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// Collapses concurrent calls for the same key into one execution.
///
/// The first caller for a key runs the closure; callers that arrive while it
/// is running block and receive a clone of its result. Once the leader
/// finishes, the key is forgotten and a later call runs again.
pub struct SingleFlight<K, V> {
    in_flight: Mutex<HashMap<K, Arc<OnceLock<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value and whether this call was the one that computed it.
    pub fn run(&self, key: K, f: impl FnOnce() -> V) -> (V, bool) {
        let cell = {
            let mut in_flight = self.lock();
            Arc::clone(in_flight.entry(key.clone()).or_default())
        };

        // Forgets the key once the leader is done, even if `f` panics.
        let mut landing = Landing {
            flights: self,
            key,
            cell: Arc::clone(&cell),
            armed: false,
        };
        let value = cell
            .get_or_init(|| {
                landing.armed = true;
                f()
            })
            .clone();

        (value, landing.armed)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Arc<OnceLock<V>>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

struct Landing<'a, K: Eq + Hash, V> {
    flights: &'a SingleFlight<K, V>,
    key: K,
    cell: Arc<OnceLock<V>>,
    armed: bool,
}

impl<K: Eq + Hash, V> Drop for Landing<'_, K, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut in_flight = self
            .flights
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.cell))
        {
            in_flight.remove(&self.key);
        }
    }
}
