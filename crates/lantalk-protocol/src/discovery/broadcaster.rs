/// DiscoveryBroadcaster: periodic presence announcements.
///
/// One tokio task per broadcaster. `stop()` cancels cooperatively and joins
/// the task, so nothing is announced once it returns.
use std::time::Duration;

use async_trait::async_trait;
use lantalk_transport::{DatagramPublisher, Identity};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::{ops, to_payload, Announce, DISCOVERY_IDENTITY};
use crate::SessionError;

/// Where announcements go. Fire-and-forget: no acknowledgment.
#[async_trait]
pub trait AnnounceSink: Send + Sync + 'static {
    async fn announce(&self, announce: &Announce) -> Result<(), SessionError>;
}

#[async_trait]
impl AnnounceSink for DatagramPublisher {
    async fn announce(&self, announce: &Announce) -> Result<(), SessionError> {
        let payload = to_payload(announce)?;
        self.send_oneway(&Identity::from_static(DISCOVERY_IDENTITY), ops::ANNOUNCE, payload)
            .await?;
        Ok(())
    }
}

/// Announce through every sink; the first error is returned after all
/// sinks were tried.
#[async_trait]
impl<S: AnnounceSink> AnnounceSink for Vec<S> {
    async fn announce(&self, announce: &Announce) -> Result<(), SessionError> {
        let mut first_err = None;
        for sink in self {
            if let Err(e) = sink.announce(announce).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

pub struct DiscoveryBroadcaster {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DiscoveryBroadcaster {
    /// Spawn the announcement task. The first announcement goes out after
    /// one `interval`, then one per `interval`.
    pub fn start<S: AnnounceSink>(sink: S, announce: Announce, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(announce_loop(sink, announce, interval, cancel.clone()));
        Self { cancel, task }
    }

    /// Stop announcing and wait for the task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("broadcaster task ended abnormally: {e}");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

async fn announce_loop<S: AnnounceSink>(
    sink: S,
    announce: Announce,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::debug!(name = %announce.name, peer = %announce.peer, ?interval, "broadcaster started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = sink.announce(&announce).await {
            tracing::debug!("announcement failed: {e}");
        }
    }
    tracing::debug!("broadcaster stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::types::PeerRef;

    /// Records announcements instead of sending them.
    #[derive(Clone, Default)]
    struct MockSink {
        sent: Arc<Mutex<Vec<Announce>>>,
        fail: bool,
    }

    #[async_trait]
    impl AnnounceSink for MockSink {
        async fn announce(&self, announce: &Announce) -> Result<(), SessionError> {
            self.sent.lock().unwrap().push(announce.clone());
            if self.fail {
                return Err(SessionError::Shutdown);
            }
            Ok(())
        }
    }

    fn alice() -> Announce {
        Announce {
            name: "alice".into(),
            peer: PeerRef::new(Identity::from_static("peer"), ([10, 0, 0, 1], 4061).into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn announces_every_interval() {
        let sink = MockSink::default();
        let b = DiscoveryBroadcaster::start(sink.clone(), alice(), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(sink.sent.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(4600)).await;
        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|a| a == &alice()));

        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_sent_after_stop() {
        let sink = MockSink::default();
        let b = DiscoveryBroadcaster::start(sink.clone(), alice(), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);

        b.stop().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_joins_task() {
        let b = DiscoveryBroadcaster::start(MockSink::default(), alice(), Duration::from_secs(2));
        assert!(b.is_running());

        let cancel = b.cancel.clone();
        b.stop().await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn send_errors_do_not_stop_broadcasting() {
        let sink = MockSink {
            fail: true,
            ..MockSink::default()
        };
        let b = DiscoveryBroadcaster::start(sink.clone(), alice(), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 2);

        b.stop().await;
    }
}
