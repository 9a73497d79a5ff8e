//! Keepalive heartbeat driver for pipes.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pipe::{Pipe, PipeEvent};

/// Emit [`PipeEvent::Keepalive`] on `pipe` every `interval`.
///
/// The task holds only a weak reference and exits once the pipe is dropped.
pub fn spawn_keepalive(pipe: Weak<dyn Pipe>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pipe) = pipe.upgrade() else {
                tracing::trace!("keepalive stopped, pipe dropped");
                return;
            };
            pipe.events().emit(pipe.id(), PipeEvent::Keepalive);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{LivenessObserver, PipeId};
    use crate::testing::MemoryPipe;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use telehash_core::Path;

    #[derive(Default)]
    struct Beats(AtomicUsize);

    impl LivenessObserver for Beats {
        fn on_pipe_event(&self, _pipe: PipeId, event: &PipeEvent) {
            if *event == PipeEvent::Keepalive {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ticks_until_pipe_dropped() {
        let pipe = MemoryPipe::new(Path::new("test"));
        let beats = Arc::new(Beats::default());
        pipe.events()
            .subscribe(Arc::downgrade(&beats) as Weak<dyn LivenessObserver>);

        let dyn_pipe: Arc<dyn Pipe> = pipe.clone();
        let handle = spawn_keepalive(Arc::downgrade(&dyn_pipe), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(beats.0.load(Ordering::SeqCst), 3);

        drop(dyn_pipe);
        drop(pipe);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.is_finished());
    }
}
