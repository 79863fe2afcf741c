//! Single-slot sample mailbox between the gauge reader and the control loop.
//!
//! Built on `tokio::sync::watch`: the slot always holds the freshest state, a write overwrites
//! whatever the consumer has not read yet, and the receiver's seen/unseen version is the "new
//! sample" flag. Faults travel through the same slot so the consumer sees them in order.

use crate::error::{AppResult, FdmError};
use crate::hardware::capabilities::ForceSensor;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// One decoded force reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Force in gauge units (negative = pushing)
    pub value: f64,
    /// When the reading was decoded
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// Stamp `value` with the current time.
    pub fn now(value: f64) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Terminal condition published by the producer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFault {
    /// Gauge reading reached the rated maximum
    Overload {
        /// Offending reading
        force: f64,
        /// Configured threshold
        max: f64,
    },
    /// Serial link dropped
    LinkLost(String),
}

impl From<ChannelFault> for FdmError {
    fn from(fault: ChannelFault) -> Self {
        match fault {
            ChannelFault::Overload { force, max } => FdmError::Overload { force, max },
            ChannelFault::LinkLost(msg) => FdmError::LinkLost(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Empty,
    Sample(Sample),
    Fault(ChannelFault),
}

/// Create a connected sender/receiver pair.
pub fn sample_channel() -> (SampleSender, SampleReceiver) {
    let (tx, rx) = watch::channel(Slot::Empty);
    (
        SampleSender { tx },
        SampleReceiver {
            rx: Mutex::new(rx),
            timeout: None,
        },
    )
}

/// Producer half, owned by the gauge reader.
#[derive(Debug)]
pub struct SampleSender {
    tx: watch::Sender<Slot>,
}

impl SampleSender {
    /// Overwrite the slot with a new sample.
    pub fn publish(&self, sample: Sample) {
        // send_replace never fails, even with no receiver attached
        self.tx.send_replace(Slot::Sample(sample));
    }

    /// Overwrite the slot with a fault.
    pub fn fault(&self, fault: ChannelFault) {
        self.tx.send_replace(Slot::Fault(fault));
    }
}

/// Consumer half, read by the control loop.
#[derive(Debug)]
pub struct SampleReceiver {
    rx: Mutex<watch::Receiver<Slot>>,
    timeout: Option<Duration>,
}

impl SampleReceiver {
    /// Fail with `DeviceUnresponsive` if no new sample arrives within `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait for a sample newer than the last one returned, then mark it seen.
    ///
    /// # Errors
    /// - `Overload` / `LinkLost` if the producer published a fault
    /// - `LinkLost` if the producer was dropped
    /// - `DeviceUnresponsive` if a timeout is set and elapses
    pub async fn get(&self) -> AppResult<Sample> {
        let mut rx = self.rx.lock().await;
        loop {
            let changed = match self.timeout {
                Some(limit) => tokio::time::timeout(limit, rx.changed())
                    .await
                    .map_err(|_| FdmError::DeviceUnresponsive(limit))?,
                None => rx.changed().await,
            };
            changed.map_err(|_| FdmError::LinkLost("gauge reader stopped".to_string()))?;

            let slot = rx.borrow_and_update().clone();
            match slot {
                Slot::Sample(sample) => return Ok(sample),
                Slot::Fault(fault) => return Err(fault.into()),
                Slot::Empty => continue,
            }
        }
    }

    /// True if an unread sample or fault is waiting.
    pub async fn has_new(&self) -> bool {
        self.rx.lock().await.has_changed().unwrap_or(false)
    }
}

#[async_trait]
impl ForceSensor for SampleReceiver {
    async fn next_sample(&self) -> Result<Sample> {
        Ok(self.get().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_latest_and_drops_overwritten() {
        let (tx, rx) = sample_channel();
        tx.publish(Sample::now(-0.1));
        tx.publish(Sample::now(-0.2));
        tx.publish(Sample::now(-0.3));

        assert!(rx.has_new().await);
        let sample = rx.get().await.unwrap();
        assert_eq!(sample.value, -0.3);
        assert!(!rx.has_new().await);
    }

    #[tokio::test]
    async fn get_blocks_until_a_newer_sample() {
        let (tx, rx) = sample_channel();
        tx.publish(Sample::now(1.0));
        assert_eq!(rx.get().await.unwrap().value, 1.0);

        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.publish(Sample::now(2.0));
            tx
        });

        assert_eq!(rx.get().await.unwrap().value, 2.0);
        drop(producer.await.unwrap());
    }

    #[tokio::test]
    async fn fault_is_surfaced_as_error() {
        let (tx, rx) = sample_channel();
        tx.fault(ChannelFault::Overload {
            force: -3.6,
            max: 3.5,
        });
        assert!(matches!(rx.get().await, Err(FdmError::Overload { .. })));
    }

    #[tokio::test]
    async fn dropped_sender_is_link_lost() {
        let (tx, rx) = sample_channel();
        drop(tx);
        assert!(matches!(rx.get().await, Err(FdmError::LinkLost(_))));
    }

    #[tokio::test]
    async fn timeout_reports_unresponsive_device() {
        let (_tx, rx) = sample_channel();
        let rx = rx.with_timeout(Some(Duration::from_millis(10)));
        assert!(matches!(
            rx.get().await,
            Err(FdmError::DeviceUnresponsive(_))
        ));
    }
}
