// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Creates a drain pair. Every component that must finish before shutdown
/// holds a clone of the [`DrainWatcher`]; the [`DrainTrigger`] signals them
/// and waits until all clones are gone.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    let (signal_tx, signal_rx) = watch::channel(None);
    let (drained_tx, drained_rx) = mpsc::channel(1);
    (
        DrainTrigger {
            drained_rx,
            signal_tx,
        },
        DrainWatcher {
            drained_tx,
            signal_rx,
        },
    )
}

enum Never {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    Immediate,
    Graceful,
}

pub struct DrainTrigger {
    drained_rx: mpsc::Receiver<Never>,
    signal_tx: watch::Sender<Option<DrainMode>>,
}

#[derive(Clone)]
pub struct DrainWatcher {
    drained_tx: mpsc::Sender<Never>,
    signal_rx: watch::Receiver<Option<DrainMode>>,
}

/// Held while a component finishes up after a drain was signaled.
#[must_use = "dropping the blocker releases the drain"]
pub struct DrainBlocker {
    _drained_tx: mpsc::Sender<Never>,
    mode: DrainMode,
}

impl DrainBlocker {
    pub fn mode(&self) -> DrainMode {
        self.mode
    }
}

impl DrainTrigger {
    pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
        let _ = self.signal_tx.send(Some(mode));
        match self.drained_rx.recv().await {
            None => {}
            Some(never) => match never {},
        }
    }

    /// Drains gracefully, giving up after `deadline`.
    pub async fn drain_with_deadline(self, deadline: Duration) {
        info!("draining, waiting up to {:?} for components to finish", deadline);
        if tokio::time::timeout(deadline, self.start_drain_and_wait(DrainMode::Graceful))
            .await
            .is_err()
        {
            warn!("drain deadline expired with components still running");
        } else {
            info!("drain complete");
        }
    }
}

impl DrainWatcher {
    /// Completes once a drain is signaled. If the trigger was dropped without
    /// signaling, the drain is immediate.
    pub async fn wait_for_drain(mut self) -> DrainBlocker {
        let mode = match self.signal_rx.wait_for(Option::is_some).await {
            Ok(mode) => (*mode).unwrap_or(DrainMode::Immediate),
            Err(_) => DrainMode::Immediate,
        };
        DrainBlocker {
            _drained_tx: self.drained_tx,
            mode,
        }
    }
}

impl std::fmt::Debug for DrainTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainTrigger").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for DrainWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainWatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waits_for_blockers() {
        let (trigger, watcher) = new();
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let worker = watcher.clone();
        tokio::spawn(async move {
            let blocker = worker.wait_for_drain().await;
            assert_eq!(blocker.mode(), DrainMode::Graceful);
            done_tx.send(()).await.unwrap();
            drop(blocker);
        });
        drop(watcher);
        trigger.start_drain_and_wait(DrainMode::Graceful).await;
        assert!(done_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_the_drain() {
        let (trigger, watcher) = new();
        // Never released.
        let _held = watcher;
        trigger.drain_with_deadline(Duration::from_secs(1)).await;
    }
}
