//! Sequential conversion queue backed by one worker thread.
//!
//! Requests run strictly in enqueue order. Each one gets its own
//! [`CancelToken`], so cancelling a queued or running item leaves the rest
//! of the queue untouched.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use crate::cancel::CancelToken;
use crate::config::ConverterConfig;
use crate::events::EventSink;
use crate::pipeline::{ConversionPipeline, ConversionRequest, ConversionResult};

struct Job {
    id: u64,
    request: ConversionRequest,
    cancel: CancelToken,
}

/// Handle returned by [`ConversionQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct QueueTicket {
    pub id: u64,
    pub cancel: CancelToken,
}

/// Cancels every pending and running job of a queue from another thread.
///
/// Once used, jobs enqueued afterwards start out cancelled.
#[derive(Debug, Clone, Default)]
pub struct QueueCanceller {
    tokens: Arc<Mutex<HashMap<u64, CancelToken>>>,
    closed: CancelToken,
}

impl QueueCanceller {
    pub fn cancel_all(&self) {
        self.closed.cancel();
        if let Ok(tokens) = self.tokens.lock() {
            for token in tokens.values() {
                token.cancel();
            }
        }
    }

    fn register(&self, id: u64) -> CancelToken {
        let cancel = CancelToken::new();
        if self.closed.is_cancelled() {
            cancel.cancel();
        }
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(id, cancel.clone());
        }
        cancel
    }
}

pub struct ConversionQueue {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<Vec<(u64, ConversionResult)>>>,
    canceller: QueueCanceller,
    next_id: u64,
}

impl ConversionQueue {
    /// Start the worker. All events from every job go to `events`.
    pub fn new(config: ConverterConfig, events: EventSink) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let canceller = QueueCanceller::default();
        let worker_tokens = Arc::clone(&canceller.tokens);

        let worker = thread::spawn(move || {
            let pipeline = ConversionPipeline::new(&config, events);
            let mut results = Vec::new();
            for job in rx {
                info!("queue: starting job {}", job.id);
                let result = pipeline.run(&job.request, &job.cancel);
                if let Ok(mut tokens) = worker_tokens.lock() {
                    tokens.remove(&job.id);
                }
                results.push((job.id, result));
            }
            results
        });

        Self {
            tx: Some(tx),
            worker: Some(worker),
            canceller,
            next_id: 1,
        }
    }

    pub fn enqueue(&mut self, request: ConversionRequest) -> QueueTicket {
        let id = self.next_id;
        self.next_id += 1;
        let cancel = self.canceller.register(id);

        let job = Job {
            id,
            request,
            cancel: cancel.clone(),
        };
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                error!("queue worker is gone; job {} will not run", id);
            }
        }
        QueueTicket { id, cancel }
    }

    /// Cancel a pending or running job. Returns false if it already finished.
    pub fn cancel(&self, id: u64) -> bool {
        match self.canceller.tokens.lock() {
            Ok(tokens) => match tokens.get(&id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn cancel_all(&self) {
        self.canceller.cancel_all();
    }

    /// Handle for cancelling the whole queue from another thread.
    pub fn canceller(&self) -> QueueCanceller {
        self.canceller.clone()
    }

    /// Close the queue, wait for remaining jobs and return every result in
    /// enqueue order.
    pub fn finish(mut self) -> Vec<(u64, ConversionResult)> {
        self.tx.take();
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(results)) => results,
            Some(Err(_)) => {
                error!("queue worker panicked");
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

impl Drop for ConversionQueue {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cancel_all();
            self.tx.take();
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::BuilderTool;
    use crate::events::{ConversionEvent, Stage};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Build mode writes `${10}`; test mode reports a fixed size.
    const FAKE_BUILDER: &str = r#"
if [ "$2" = "--test" ]; then echo "Image size: 4096 bytes"; exit 1; fi
printf 'IMG' > "${10}"
"#;

    fn config(tmp: &TempDir) -> ConverterConfig {
        let script = tmp.path().join("fake-builder.sh");
        fs::write(&script, FAKE_BUILDER).unwrap();
        ConverterConfig {
            builder: BuilderTool {
                program: PathBuf::from("sh"),
                leading_args: vec![script.display().to_string()],
                filesystem: "ufs2".to_string(),
            },
            cache_dir: tmp.path().join("cache"),
            ..ConverterConfig::default()
        }
    }

    fn request(tmp: &TempDir, name: &str) -> ConversionRequest {
        let input = tmp.path().join(name);
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("eboot.bin"), name.as_bytes()).unwrap();
        ConversionRequest {
            input_dir: input,
            output_path: tmp.path().join(format!("{name}.img")),
            label: name.to_string(),
            title_id: name.to_string(),
            compat_mode: false,
        }
    }

    #[test]
    fn test_runs_in_order() {
        let tmp = TempDir::new().unwrap();
        let mut queue = ConversionQueue::new(config(&tmp), EventSink::discard());
        let a = queue.enqueue(request(&tmp, "PPSA00001"));
        let b = queue.enqueue(request(&tmp, "PPSA00002"));

        let results = queue.finish();
        let ids: Vec<u64> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert!(results.iter().all(|(_, r)| r.success));
    }

    #[test]
    fn test_cancel_one_job() {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let mut queue = ConversionQueue::new(config(&tmp), EventSink::new(tx));
        let ticket = queue.enqueue(request(&tmp, "PPSA00001"));
        ticket.cancel.cancel();
        let kept = queue.enqueue(request(&tmp, "PPSA00002"));

        let results = queue.finish();
        assert_eq!(results.len(), 2);
        assert!(results[0].1.cancelled);
        assert_eq!(results[1].0, kept.id);
        assert!(results[1].1.success);
        assert!(rx.try_iter().any(|e| matches!(
            e,
            ConversionEvent::Progress(p) if p.stage == Stage::Cancelled
        )));
    }

    #[test]
    fn test_canceller_stops_pending_and_later_jobs() {
        let tmp = TempDir::new().unwrap();
        let mut queue = ConversionQueue::new(config(&tmp), EventSink::discard());
        let canceller = queue.canceller();
        let first = queue.enqueue(request(&tmp, "PPSA00001"));
        canceller.cancel_all();
        let later = queue.enqueue(request(&tmp, "PPSA00002"));

        assert!(later.cancel.is_cancelled());
        let results = queue.finish();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, first.id);
        assert_eq!(results[1].0, later.id);
        assert!(results[1].1.cancelled);
        assert!(!results[1].1.success);
    }

    #[test]
    fn test_cancel_finished_job_returns_false() {
        let tmp = TempDir::new().unwrap();
        let mut queue = ConversionQueue::new(config(&tmp), EventSink::discard());
        let ticket = queue.enqueue(request(&tmp, "PPSA00001"));
        assert!(!queue.cancel(ticket.id + 100));
        let results = queue.finish();
        assert_eq!(results.len(), 1);
    }
}
