//! Output channels for published measurements.

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::debug;

/// Nanoseconds since the Unix epoch.
pub type Timestamp = u64;

/// Default number of measurements a slow consumer may lag behind.
pub const DEFAULT_PORT_CAPACITY: usize = 4;

/// A timestamped value handed to downstream consumers.
#[derive(Debug)]
pub struct Measurement<T> {
    /// When the value was observed.
    pub timestamp: Timestamp,
    /// The value, shared between all consumers of the port.
    pub value: Arc<T>,
}

impl<T> Measurement<T> {
    /// Wrap `value` observed at `timestamp`.
    pub fn new(timestamp: Timestamp, value: T) -> Self {
        Self {
            timestamp,
            value: Arc::new(value),
        }
    }
}

impl<T> Clone for Measurement<T> {
    fn clone(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            value: Arc::clone(&self.value),
        }
    }
}

/// A push port fanning measurements out to any number of subscribers.
///
/// A port counts as connected while it has subscribers. Subscribers whose
/// receiver was dropped are pruned on the next send. Sending never blocks: a
/// subscriber whose queue is full misses that measurement.
#[derive(Debug)]
pub struct PushPort<T> {
    name: &'static str,
    capacity: usize,
    subscribers: Mutex<Vec<Sender<Measurement<T>>>>,
}

impl<T> PushPort<T> {
    /// Create a port with the default queue capacity.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self::with_capacity(name, DEFAULT_PORT_CAPACITY)
    }

    /// Create a port whose subscribers queue up to `capacity` measurements.
    #[must_use]
    pub const fn with_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Port name.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Subscribe to the port.
    pub fn connect(&self) -> Receiver<Measurement<T>> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Whether anybody is subscribed.
    pub fn is_connected(&self) -> bool {
        !self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Drop all subscribers.
    pub fn disconnect_all(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Publish `measurement`; returns how many subscribers received it.
    pub fn send(&self, measurement: &Measurement<T>) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(measurement.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!(port = self.name, "subscriber queue full, measurement dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        delivered
    }
}
