//! Periodic event producer

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, Instrument};

use super::LogHandle;

/// Appends a `{seq, ts}` event to the log at a fixed interval
pub struct EventProducer {
    log: LogHandle,
    interval: Duration,
}

impl EventProducer {
    pub fn new(log: LogHandle, interval: Duration) -> Self {
        Self { log, interval }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run().instrument(info_span!("producer")))
    }

    /// Run until the log stops
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "Event producer started");

        loop {
            tokio::select! {
                _ = self.log.closed() => break,
                _ = ticker.tick() => {
                    match self.log.append_stamped().await {
                        Ok(seq) => debug!(seq, "Produced event"),
                        Err(_) => break,
                    }
                }
            }
        }

        info!("Event producer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{BroadcastLog, BroadcastLogConfig};

    #[tokio::test]
    async fn test_producer_appends_until_log_stops() {
        let (log, task) = BroadcastLog::start(BroadcastLogConfig {
            publish_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();
        let producer = EventProducer::new(log.clone(), Duration::from_millis(10)).spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let window = log.window().await.unwrap();
        assert!(window.next_seq >= 3);
        assert_eq!(window.first_seq, Some(0));

        log.shutdown().await.unwrap();
        task.await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
    }
}
