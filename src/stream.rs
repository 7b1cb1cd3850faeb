//! Background frame publisher.
//!
//! While streaming is enabled and at least one client is connected, the
//! loop captures a screenshot every `1000 / fps` milliseconds and publishes
//! it to the [`FrameStore`]. With nobody watching it only checks the
//! connection count, every [`IDLE_POLL`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capture::ScreenCapture;

pub const IDLE_POLL: Duration = Duration::from_millis(500);

/// One published frame. Ids increase monotonically from 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub bytes: Arc<Vec<u8>>,
}

/// Latest-frame slot, locked separately from the session.
#[derive(Default)]
pub struct FrameStore {
    latest: RwLock<Option<Frame>>,
    next_id: AtomicU64,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, bytes: Vec<u8>) -> u64 {
        let mut latest = self.latest.write().await;
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        *latest = Some(Frame {
            id,
            bytes: Arc::new(bytes),
        });
        id
    }

    pub async fn latest(&self) -> Option<Frame> {
        self.latest.read().await.clone()
    }
}

pub trait ConnectionCounter: Send + Sync {
    fn connection_count(&self) -> usize;
}

#[derive(Clone, Copy, Debug)]
pub struct StreamSettings {
    pub enabled: bool,
    pub fps: u32,
}

impl StreamSettings {
    pub fn period(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.clamp(1, 30)))
    }
}

/// Run until `cancel` fires.
pub async fn run_stream_loop(
    settings: StreamSettings,
    screen: Arc<dyn ScreenCapture>,
    frames: Arc<FrameStore>,
    connections: Arc<dyn ConnectionCounter>,
    cancel: CancellationToken,
) {
    let period = settings.period();
    info!(enabled = settings.enabled, period_ms = period.as_millis() as u64, "stream loop started");

    while !cancel.is_cancelled() {
        if !settings.enabled || connections.connection_count() == 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(IDLE_POLL) => continue,
            }
        }

        let started = Instant::now();
        match screen.capture().await {
            Ok(bytes) => {
                let id = frames.publish(bytes).await;
                debug!(frame = id, "frame published");
            }
            Err(e) => debug!(error = %e, "frame capture failed"),
        }

        let wait = period.saturating_sub(started.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!("stream loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AssistError, AssistResult};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingScreen {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScreenCapture for CountingScreen {
        async fn capture(&self) -> AssistResult<Vec<u8>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AssistError::Capture("display asleep".into()));
            }
            Ok(vec![n as u8])
        }
    }

    struct Fixed(usize);

    impl ConnectionCounter for Fixed {
        fn connection_count(&self) -> usize {
            self.0
        }
    }

    #[tokio::test]
    async fn frame_ids_increase() {
        let store = FrameStore::new();
        assert!(store.latest().await.is_none());
        assert_eq!(store.publish(vec![1]).await, 1);
        assert_eq!(store.publish(vec![2]).await, 2);
        let frame = store.latest().await.unwrap();
        assert_eq!(frame.id, 2);
        assert_eq!(*frame.bytes, vec![2]);
    }

    #[test]
    fn period_follows_clamped_fps() {
        assert_eq!(StreamSettings { enabled: true, fps: 2 }.period(), Duration::from_millis(500));
        assert_eq!(StreamSettings { enabled: true, fps: 0 }.period(), Duration::from_millis(1000));
        assert_eq!(StreamSettings { enabled: true, fps: 99 }.period(), Duration::from_millis(33));
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_only_with_viewers() {
        let screen = Arc::new(CountingScreen {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let frames = Arc::new(FrameStore::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_stream_loop(
            StreamSettings { enabled: true, fps: 10 },
            screen.clone(),
            frames.clone(),
            Arc::new(Fixed(0)),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(screen.calls.load(Ordering::SeqCst), 0);
        cancel.cancel();
        handle.await.unwrap();
        assert!(frames.latest().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn capture_failures_do_not_stop_the_loop() {
        let screen = Arc::new(CountingScreen {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let frames = Arc::new(FrameStore::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_stream_loop(
            StreamSettings { enabled: true, fps: 10 },
            screen.clone(),
            frames.clone(),
            Arc::new(Fixed(1)),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(1050)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(screen.calls.load(Ordering::SeqCst) >= 5);
        assert!(frames.latest().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn streams_to_connected_clients() {
        let screen = Arc::new(CountingScreen {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let frames = Arc::new(FrameStore::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_stream_loop(
            StreamSettings { enabled: true, fps: 5 },
            screen,
            frames.clone(),
            Arc::new(Fixed(1)),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(frames.latest().await.unwrap().id >= 3);
    }
}
