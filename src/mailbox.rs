//! Single-slot hand-off between the acquisition task and its consumers
//!
//! Backed by `tokio::sync::watch`: publishing overwrites the slot without waiting,
//! consumers see only the latest value, and several publications between two
//! reads coalesce into one notification. The link status and the poll metrics
//! travel on their own channels so a consumer can tell a stale measurement from a
//! fresh one.

use log::debug;
use tokio::sync::watch;

use crate::error::{GatewayError, GatewayResult};
use crate::measurement::Measurement;
use crate::utils::PerformanceMetrics;

/// Create a connected publisher/subscriber pair with an empty slot
pub fn channel() -> (MeasurementPublisher, MeasurementSubscriber) {
    let (measurement_tx, measurement_rx) = watch::channel(None);
    let (link_tx, link_rx) = watch::channel(false);
    let (metrics_tx, metrics_rx) = watch::channel(PerformanceMetrics::default());

    (
        MeasurementPublisher {
            measurement: measurement_tx,
            link: link_tx,
            metrics: metrics_tx,
        },
        MeasurementSubscriber {
            measurement: measurement_rx,
            link: link_rx,
            metrics: metrics_rx,
        },
    )
}

/// Writing side, owned by the acquisition loop
#[derive(Debug)]
pub struct MeasurementPublisher {
    measurement: watch::Sender<Option<Measurement>>,
    link: watch::Sender<bool>,
    metrics: watch::Sender<PerformanceMetrics>,
}

impl MeasurementPublisher {
    /// Replace the slot content and wake waiting consumers
    ///
    /// Never blocks and never fails; with no subscriber left the value is simply
    /// kept for the next one.
    pub fn publish(&self, measurement: Measurement) {
        self.measurement.send_replace(Some(measurement));
    }

    /// Record the link state, notifying only on change
    pub fn set_connected(&self, connected: bool) {
        self.link.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                debug!("Link status -> {}", if connected { "up" } else { "down" });
                *current = connected;
                true
            }
        });
    }

    pub fn publish_metrics(&self, metrics: &PerformanceMetrics) {
        self.metrics.send_replace(metrics.clone());
    }

    /// Another subscriber on the same slot
    pub fn subscribe(&self) -> MeasurementSubscriber {
        MeasurementSubscriber {
            measurement: self.measurement.subscribe(),
            link: self.link.subscribe(),
            metrics: self.metrics.subscribe(),
        }
    }
}

/// Reading side
#[derive(Debug, Clone)]
pub struct MeasurementSubscriber {
    measurement: watch::Receiver<Option<Measurement>>,
    link: watch::Receiver<bool>,
    metrics: watch::Receiver<PerformanceMetrics>,
}

impl MeasurementSubscriber {
    /// Copy of the most recent measurement, if one was ever published
    pub fn latest(&self) -> Option<Measurement> {
        self.measurement.borrow().clone()
    }

    /// Whether a publication happened since this subscriber last looked
    pub fn has_changed(&self) -> bool {
        self.measurement.has_changed().unwrap_or(false)
    }

    /// Wait for the next publication and return a copy of it
    ///
    /// Returns immediately when a value was published since the last call. Fails
    /// once the acquisition loop has gone away.
    pub async fn changed(&mut self) -> GatewayResult<Measurement> {
        loop {
            self.measurement
                .changed()
                .await
                .map_err(|_| GatewayError::internal("Acquisition loop stopped"))?;

            if let Some(measurement) = self.measurement.borrow_and_update().clone() {
                return Ok(measurement);
            }
        }
    }

    /// Last link state reported by the acquisition loop
    pub fn is_connected(&self) -> bool {
        *self.link.borrow()
    }

    /// Poll metrics as of the last finished cycle
    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics.borrow().clone()
    }

    /// Wait for the link state to change and return the new value
    pub async fn link_changed(&mut self) -> GatewayResult<bool> {
        self.link
            .changed()
            .await
            .map_err(|_| GatewayError::internal("Acquisition loop stopped"))?;
        Ok(*self.link.borrow_and_update())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(power: f32) -> Measurement {
        Measurement {
            ac_power: power,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_slot() {
        let (_publisher, subscriber) = channel();
        assert!(subscriber.latest().is_none());
        assert!(!subscriber.is_connected());
        assert!(!subscriber.has_changed());
    }

    #[tokio::test]
    async fn test_latest_value_wins() {
        let (publisher, mut subscriber) = channel();

        publisher.publish(sample(1.0));
        publisher.publish(sample(2.0));
        publisher.publish(sample(3.0));

        let received = subscriber.changed().await.unwrap();
        assert_eq!(received.ac_power, 3.0);
        assert!(!subscriber.has_changed());
        assert_eq!(subscriber.latest().unwrap().ac_power, 3.0);
    }

    #[tokio::test]
    async fn test_changed_wakes_waiting_consumer() {
        let (publisher, mut subscriber) = channel();

        let waiter = tokio::spawn(async move { subscriber.changed().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        publisher.publish(sample(500.0));

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.ac_power, 500.0);
    }

    #[tokio::test]
    async fn test_closed_publisher() {
        let (publisher, mut subscriber) = channel();
        publisher.publish(sample(7.0));
        drop(publisher);

        // The pending value is still delivered, then the closure is reported
        assert_eq!(subscriber.changed().await.unwrap().ac_power, 7.0);
        assert!(subscriber.changed().await.is_err());
        assert_eq!(subscriber.latest().unwrap().ac_power, 7.0);
    }

    #[test]
    fn test_link_status_notifies_on_change_only() {
        let (publisher, subscriber) = channel();
        let mut link = subscriber.link.clone();

        publisher.set_connected(false);
        assert!(!link.has_changed().unwrap());

        publisher.set_connected(true);
        assert!(link.has_changed().unwrap());
        assert!(*link.borrow_and_update());
        assert!(subscriber.is_connected());
    }
}
