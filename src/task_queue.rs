use crate::error::AggregateError;
use anyhow::{anyhow, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often `add` re-checks for a free slot
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct QueueState {
    next_id: u64,
    pending: HashSet<u64>,
    finished: usize,
    peak: usize,
    faults: Vec<anyhow::Error>,
    handles: Vec<JoinHandle<()>>,
}

/// Caps how many spawned tasks are unfinished at once. Failures are kept
/// and raised together by `wait_all`.
pub struct BoundedTaskQueue {
    cap: usize,
    state: Arc<Mutex<QueueState>>,
}

impl BoundedTaskQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Waits until fewer than `cap` tasks are unfinished, then spawns `task`
    pub async fn add<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut task = Some(task);
        loop {
            {
                let mut st = self.state.lock();
                if st.pending.len() < self.cap {
                    let id = st.next_id;
                    st.next_id += 1;
                    st.pending.insert(id);
                    st.peak = st.peak.max(st.pending.len());
                    let state = self.state.clone();
                    let Some(task) = task.take() else { return };
                    let handle = tokio::spawn(async move {
                        let result = AssertUnwindSafe(task)
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| Err(anyhow!("queued task panicked")));
                        let mut st = state.lock();
                        st.pending.remove(&id);
                        st.finished += 1;
                        if let Err(e) = result {
                            st.faults.push(e);
                        }
                    });
                    st.handles.push(handle);
                    return;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Join every task added so far; any failures come back as one `AggregateError`
    pub async fn wait_all(&self) -> Result<()> {
        loop {
            let handles = std::mem::take(&mut self.state.lock().handles);
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    self.state.lock().faults.push(anyhow!("queued task aborted: {e}"));
                }
            }
        }
        let faults = std::mem::take(&mut self.state.lock().faults);
        if faults.is_empty() {
            Ok(())
        } else {
            Err(AggregateError { errors: faults }.into())
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn finished(&self) -> usize {
        self.state.lock().finished
    }

    /// Highest number of tasks that were unfinished at the same time
    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }
}
