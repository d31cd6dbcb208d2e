//! Asynchronous regeneration of chunk and overview composites.
//!
//! Writes only flip a composite's [`RenderState`]; the render itself runs on
//! the blocking pool. A key is queued when it leaves `Clean`, so any number of
//! writes before the render starts collapse into one job, and writes landing
//! during a render collapse into exactly one follow-up pass. Only the job that
//! moved a key to `Rendering` may commit it, which keeps at most one render in
//! flight per key and versions strictly increasing. Commit listeners run after
//! every successful commit and may mark further keys dirty.

mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime};

use tesserae_config::SchedulerConfig;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info};

use crate::broadcaster::Broadcaster;
use crate::renderer::{CompositeRenderer, RenderError};
use crate::storage::{CompositeKey, ImageStorage, StoredComposite};

pub use state::RenderState;

const CLEAN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Point-in-time view of one composite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeSnapshot {
    pub key: CompositeKey,
    pub state: RenderState,
    /// Last committed version, 0 if never rendered
    pub version: u64,
    /// Committed bytes held in memory, if any
    pub bytes: Option<Arc<[u8]>>,
    pub rendered_at: Option<SystemTime>,
}

impl CompositeSnapshot {
    /// Composite lags behind tile state
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.state.is_stale()
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: RenderState,
    version: u64,
    bytes: Option<Arc<[u8]>>,
    rendered_at: Option<SystemTime>,
}

type CommitListener = Box<dyn Fn(&RenderScheduler, CompositeKey, u64) + Send + Sync>;

struct Shared {
    config: SchedulerConfig,
    renderer: Arc<dyn CompositeRenderer>,
    storage: Arc<dyn ImageStorage>,
    broadcaster: Arc<Broadcaster>,
    slots: Mutex<HashMap<CompositeKey, Slot>>,
    listeners: RwLock<Vec<CommitListener>>,
    queue: mpsc::UnboundedSender<CompositeKey>,
    permits: Arc<Semaphore>,
    /// Commits whose listeners have not finished yet
    committing: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Handle to the render scheduler; clones share one scheduler
#[derive(Clone)]
pub struct RenderScheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RenderScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderScheduler")
            .field("config", &self.shared.config)
            .field("pending", &self.pending())
            .field("completed", &self.completed_renders())
            .finish()
    }
}

impl RenderScheduler {
    /// Start the dispatcher on the current tokio runtime
    pub fn start(
        config: SchedulerConfig,
        renderer: Arc<dyn CompositeRenderer>,
        storage: Arc<dyn ImageStorage>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            renderer,
            storage,
            broadcaster,
            slots: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            queue,
            permits: Arc::new(Semaphore::new(config.max_concurrent_renders.max(1))),
            committing: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        tokio::spawn(dispatch(Arc::downgrade(&shared), jobs));
        info!(
            "Render scheduler started (chunk debounce {}ms, overview debounce {}ms, {} workers)",
            config.chunk_debounce_ms,
            config.overview_debounce_ms,
            config.max_concurrent_renders.max(1)
        );

        Self { shared }
    }

    /// Register a callback for every committed render
    pub fn add_commit_listener<F>(&self, listener: F)
    where
        F: Fn(&RenderScheduler, CompositeKey, u64) + Send + Sync + 'static,
    {
        let mut listeners = self.shared.listeners.write().expect("RenderScheduler lock poisoned");
        listeners.push(Box::new(listener));
    }

    /// Record that a composite no longer reflects tile state
    ///
    /// Never blocks on rendering.
    pub fn mark_dirty(&self, key: CompositeKey) {
        let enqueue = {
            let mut slots = self.shared.slots.lock().expect("RenderScheduler lock poisoned");
            slots.entry(key).or_default().state.mark_dirty()
        };
        if enqueue {
            debug!("Marked {} dirty", key);
            self.shared.enqueue(key);
        }
    }

    pub fn state(&self, key: CompositeKey) -> RenderState {
        let slots = self.shared.slots.lock().expect("RenderScheduler lock poisoned");
        slots.get(&key).map(|slot| slot.state).unwrap_or_default()
    }

    pub fn snapshot(&self, key: CompositeKey) -> CompositeSnapshot {
        let slots = self.shared.slots.lock().expect("RenderScheduler lock poisoned");
        match slots.get(&key) {
            Some(slot) => CompositeSnapshot {
                key,
                state: slot.state,
                version: slot.version,
                bytes: slot.bytes.clone(),
                rendered_at: slot.rendered_at,
            },
            None => CompositeSnapshot {
                key,
                state: RenderState::Clean,
                version: 0,
                bytes: None,
                rendered_at: None,
            },
        }
    }

    /// Last committed version, 0 if never rendered
    pub fn version(&self, key: CompositeKey) -> u64 {
        let slots = self.shared.slots.lock().expect("RenderScheduler lock poisoned");
        slots.get(&key).map_or(0, |slot| slot.version)
    }

    /// Keep bytes loaded from storage, unless a newer version was committed meanwhile
    pub fn cache_bytes(&self, key: CompositeKey, version: u64, bytes: Arc<[u8]>) {
        let mut slots = self.shared.slots.lock().expect("RenderScheduler lock poisoned");
        if let Some(slot) = slots.get_mut(&key) {
            if slot.version == version && slot.bytes.is_none() {
                slot.bytes = Some(bytes);
            }
        }
    }

    /// Seed committed versions from what storage already holds
    pub fn restore(&self, stored: &[StoredComposite]) {
        let mut slots = self.shared.slots.lock().expect("RenderScheduler lock poisoned");
        for composite in stored {
            let slot = slots.entry(composite.key).or_default();
            if composite.version > slot.version {
                slot.version = composite.version;
                slot.rendered_at = Some(composite.rendered_at);
                slot.bytes = None;
            }
        }
        info!("Restored {} composites from storage", stored.len());
    }

    /// Composites that are dirty, rendering, or still running commit listeners
    pub fn pending(&self) -> usize {
        let committing = self.shared.committing.load(Ordering::SeqCst) as usize;
        let stale = self
            .shared
            .slots
            .lock()
            .map(|slots| slots.values().filter(|slot| slot.state.is_stale()).count())
            .unwrap_or(0);
        stale + committing
    }

    /// Renders committed since start
    pub fn completed_renders(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Renders that failed since start
    pub fn failed_renders(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    /// Wait until nothing is dirty or rendering. Returns `false` on timeout.
    pub async fn wait_until_clean(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(CLEAN_POLL_INTERVAL).await;
        }
    }
}

async fn dispatch(shared: Weak<Shared>, mut jobs: mpsc::UnboundedReceiver<CompositeKey>) {
    while let Some(key) = jobs.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        tokio::spawn(shared.run(key));
    }
    debug!("Render dispatcher stopped");
}

impl Shared {
    fn enqueue(&self, key: CompositeKey) {
        if self.queue.send(key).is_err() {
            debug!("Render dispatcher gone, dropping job for {}", key);
        }
    }

    fn emit_commit(self: &Arc<Self>, key: CompositeKey, version: u64) {
        let handle = RenderScheduler {
            shared: self.clone(),
        };
        let listeners = self.listeners.read().expect("RenderScheduler lock poisoned");
        for listener in listeners.iter() {
            listener(&handle, key, version);
        }
    }

    fn debounce(&self, key: CompositeKey) -> Duration {
        let ms = match key {
            CompositeKey::Chunk(_) => self.config.chunk_debounce_ms,
            CompositeKey::Overview => self.config.overview_debounce_ms,
        };
        Duration::from_millis(ms)
    }

    async fn run(self: Arc<Self>, key: CompositeKey) {
        let delay = self.debounce(key);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        let previous = {
            let mut slots = self.slots.lock().expect("RenderScheduler lock poisoned");
            let slot = slots.entry(key).or_default();
            if !slot.state.start_render() {
                return;
            }
            slot.version
        };
        let version = previous + 1;
        let started = Instant::now();

        let renderer = self.renderer.clone();
        let storage = self.storage.clone();
        let outcome = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, RenderError> {
            let bytes = renderer.render(key)?;
            storage.write_composite(key, version, &bytes, (previous > 0).then_some(previous))?;
            Ok(bytes)
        })
        .await
        .unwrap_or_else(|e| Err(RenderError::Task(e.to_string())));

        match outcome {
            Ok(bytes) => {
                self.committing.fetch_add(1, Ordering::SeqCst);
                let again = {
                    let mut slots = self.slots.lock().expect("RenderScheduler lock poisoned");
                    let slot = slots.entry(key).or_default();
                    slot.version = version;
                    slot.bytes = Some(bytes.into());
                    slot.rendered_at = Some(SystemTime::now());
                    slot.state.finish_render()
                };
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Rendered {} version {} in {:?}",
                    key,
                    version,
                    started.elapsed()
                );

                match key {
                    CompositeKey::Chunk(chunk) => self.broadcaster.on_chunk_rendered(chunk, version),
                    CompositeKey::Overview => self.broadcaster.on_overview_rendered(version),
                };
                self.emit_commit(key, version);

                if again {
                    self.enqueue(key);
                }
                self.committing.fetch_sub(1, Ordering::SeqCst);
            }
            Err(e) => {
                {
                    let mut slots = self.slots.lock().expect("RenderScheduler lock poisoned");
                    slots.entry(key).or_default().state.abort_render();
                }
                self.failed.fetch_add(1, Ordering::Relaxed);
                let retry = Duration::from_millis(self.config.retry_delay_ms);
                error!("Render of {} failed, retrying in {:?}: {}", key, retry, e);

                let shared = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(retry).await;
                    shared.enqueue(key);
                });
            }
        }
    }
}
