//! Strictly-FIFO audio playback sequencing.
//!
//! Audio segments arrive faster than they play. The sequencer owns the queue
//! and a single worker task, so at most one segment plays at a time, in
//! arrival order, with a short gap between consecutive segments. Playback
//! itself is delegated to an [`AudioPlayer`] supplied by the embedding
//! application.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One queued playback unit, minted by the aggregator per audio-bearing
/// frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTask {
    pub id: u64,
    /// Base64 audio payload, opaque to the sequencer.
    pub payload: String,
    /// Display text of the segment, when the frame carried one.
    pub text: Option<String>,
}

/// Plays one audio task to completion. Implementations decode and render the
/// payload however the host application does audio.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, task: &AudioTask) -> anyhow::Result<()>;
}

type CompletionHook = Box<dyn Fn(&AudioTask) + Send + Sync>;

struct SequencerInner {
    queue: Mutex<VecDeque<AudioTask>>,
    notify: Notify,
    busy: AtomicBool,
    /// Bumped by clear(); playback epochs from before the bump finish
    /// silently (or are cancelled when `stop_in_flight` is set).
    generation: watch::Sender<u64>,
    gap: Duration,
    stop_in_flight: bool,
    player: Arc<dyn AudioPlayer>,
    on_complete: Mutex<Option<CompletionHook>>,
}

/// The playback queue plus its worker task.
pub struct AudioSequencer {
    inner: Arc<SequencerInner>,
    worker: JoinHandle<()>,
}

impl AudioSequencer {
    /// Spawns the worker. `gap` is the pause inserted after each completed
    /// task; `stop_in_flight` makes [`clear`](Self::clear) also cancel the
    /// currently playing task.
    pub fn new(player: Arc<dyn AudioPlayer>, gap: Duration, stop_in_flight: bool) -> Self {
        let (generation, gen_rx) = watch::channel(0u64);
        let inner = Arc::new(SequencerInner {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            busy: AtomicBool::new(false),
            generation,
            gap,
            stop_in_flight,
            player,
            on_complete: Mutex::new(None),
        });
        let worker = tokio::spawn(run_worker(inner.clone(), gen_rx));
        Self { inner, worker }
    }

    /// Appends a task to the tail of the queue.
    pub fn enqueue(&self, task: AudioTask) {
        debug!(task_id = task.id, "audio task queued");
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(task);
        self.inner.notify.notify_one();
    }

    /// Drops every queued task and suppresses the completion hook and gap of
    /// the in-flight one, cancelling it too when configured.
    pub fn clear(&self) {
        let dropped = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            let n = queue.len();
            queue.clear();
            n
        };
        self.inner.generation.send_modify(|g| *g += 1);
        debug!(dropped, "playback queue cleared");
    }

    /// True when nothing is queued or playing.
    pub fn is_idle(&self) -> bool {
        let queued = !self
            .inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty();
        !queued && !self.inner.busy.load(Ordering::SeqCst)
    }

    /// Resolves once the queue has drained and playback has stopped.
    pub async fn wait_for_idle(&self) {
        while !self.is_idle() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Installs the hook invoked after each task finishes playing. Tasks
    /// cleared mid-flight never reach the hook.
    pub fn set_on_complete<F>(&self, hook: F)
    where
        F: Fn(&AudioTask) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_complete
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }
}

impl Drop for AudioSequencer {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(inner: Arc<SequencerInner>, mut gen_rx: watch::Receiver<u64>) {
    loop {
        // Pop under the lock and flip busy in the same critical section so
        // is_idle never observes a task in neither state.
        let task = {
            let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            let task = queue.pop_front();
            if task.is_some() {
                inner.busy.store(true, Ordering::SeqCst);
            }
            task
        };
        let Some(task) = task else {
            inner.notify.notified().await;
            continue;
        };

        let epoch = *gen_rx.borrow_and_update();
        let outcome = if inner.stop_in_flight {
            tokio::select! {
                result = inner.player.play(&task) => Some(result),
                _ = gen_rx.changed() => None,
            }
        } else {
            Some(inner.player.play(&task).await)
        };

        match outcome {
            None => {
                debug!(task_id = task.id, "playback cancelled");
                inner.busy.store(false, Ordering::SeqCst);
                continue;
            }
            Some(Err(e)) => {
                // One bad segment must not stall the rest of the turn.
                warn!(task_id = task.id, error = %e, "playback failed, continuing");
            }
            Some(Ok(())) => {}
        }

        if *gen_rx.borrow() == epoch {
            if let Some(hook) = inner
                .on_complete
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
            {
                hook(&task);
            }
            tokio::time::sleep(inner.gap).await;
        }
        inner.busy.store(false, Ordering::SeqCst);
    }
}
