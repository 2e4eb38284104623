//! Background peak build queue
//!
//! One worker thread builds peak files for queued sources, one at a
//! time. Queueing the same source twice is a no-op while a build is
//! pending, and a cancel takes effect within one 64k-frame chunk of the
//! running build (whose partial files are then removed).

use crate::error::{EngineError, PeakError};
use crate::peak::builder;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use travada_common::{EngineEvent, EventBus};

struct BuildJob {
    source_id: i64,
    source_path: PathBuf,
    peakfiles_dir: PathBuf,
}

struct Shared {
    /// Source ids queued or running; deduplicates requests.
    pending: Mutex<HashSet<i64>>,
    /// Ids cancelled while still queued.
    cancelled: Mutex<HashSet<i64>>,
    /// Id of the build in progress (0 = none).
    current: AtomicI64,
    /// Interrupt flag for the running build.
    interrupt: AtomicBool,
}

/// FIFO build queue with a single worker thread.
pub struct PeakProcessor {
    tx: Sender<BuildJob>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PeakProcessor {
    pub fn spawn(events: EventBus) -> Self {
        let (tx, rx) = mpsc::channel::<BuildJob>();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
            current: AtomicI64::new(0),
            interrupt: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("travada-peaks".to_string())
            .spawn(move || Self::run(rx, worker_shared, events))
            .expect("failed to spawn peak builder thread");

        PeakProcessor {
            tx,
            shared,
            worker: Some(worker),
        }
    }

    /// Queue a peak build. Duplicate requests for a source already
    /// queued or building are dropped.
    pub fn queue_build(&self, source_id: i64, source_path: PathBuf, peakfiles_dir: PathBuf) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if !pending.insert(source_id) {
                debug!("Peak build for source {} already queued", source_id);
                return;
            }
        }
        self.shared.cancelled.lock().unwrap().remove(&source_id);
        let _ = self.tx.send(BuildJob {
            source_id,
            source_path,
            peakfiles_dir,
        });
    }

    /// Cancel a queued or running build. A running build stops within
    /// one chunk and removes its partial output.
    pub fn cancel(&self, source_id: i64) {
        if self.shared.current.load(Ordering::Acquire) == source_id {
            self.shared.interrupt.store(true, Ordering::Release);
            return;
        }
        let pending = self.shared.pending.lock().unwrap();
        if pending.contains(&source_id) {
            self.shared.cancelled.lock().unwrap().insert(source_id);
        }
    }

    fn run(rx: Receiver<BuildJob>, shared: Arc<Shared>, events: EventBus) {
        while let Ok(job) = rx.recv() {
            if shared.cancelled.lock().unwrap().remove(&job.source_id) {
                shared.pending.lock().unwrap().remove(&job.source_id);
                debug!("Peak build for source {} cancelled before start", job.source_id);
                continue;
            }

            shared.current.store(job.source_id, Ordering::Release);
            shared.interrupt.store(false, Ordering::Release);

            let result = builder::build_peaks(
                &job.source_path,
                &job.peakfiles_dir,
                &shared.interrupt,
                |percent| {
                    events.emit(EngineEvent::PeakBuildProgress {
                        source_id: job.source_id,
                        percent,
                    });
                },
            );

            shared.current.store(0, Ordering::Release);
            shared.pending.lock().unwrap().remove(&job.source_id);

            match result {
                Ok(()) => {
                    info!("Peak build finished for {}", job.source_path.display());
                    events.emit(EngineEvent::PeakBuildFinished {
                        source_id: job.source_id,
                        success: true,
                    });
                }
                Err(EngineError::Peak(PeakError::Interrupted)) => {
                    debug!("Peak build for {} interrupted", job.source_path.display());
                }
                Err(e) => {
                    warn!(
                        "Peak build failed for {}: {}",
                        job.source_path.display(),
                        e
                    );
                    events.emit(EngineEvent::PeakBuildFinished {
                        source_id: job.source_id,
                        success: false,
                    });
                    events.emit(EngineEvent::warning(format!(
                        "No waveform for {}: {}",
                        job.source_path.display(),
                        e
                    )));
                }
            }
        }
    }
}

impl Drop for PeakProcessor {
    fn drop(&mut self) {
        // Graceful: the worker drains whatever is queued, then exits
        // when the channel disconnects.
        let (tx, _) = mpsc::channel();
        drop(std::mem::replace(&mut self.tx, tx));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
