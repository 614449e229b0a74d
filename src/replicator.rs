//! §4.3 — best-effort fan-out of a timer write to its non-local replicas.
//!
//! Modeled on the teacher's `http_client.rs`: one `reqwest::Client` shared
//! across a pool of workers, each request built and executed independently,
//! with a `thiserror` enum for the ways a send can fail. The one addition
//! §4.3 calls for that the teacher's bounded `mpsc` channel doesn't give
//! for free is "drop the oldest queued job on overflow" rather than
//! backpressure the caller, so the queue here is a small hand-rolled
//! ring buffer guarded by a mutex instead of `tokio::sync::mpsc`.

use crate::errors::ReplicationError;
use crate::logging::{self, PrintSender};
use crate::timer::Timer;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

const DEFAULT_WORKERS: usize = 50;
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

struct Job {
    addr: String,
    url: String,
    body: String,
}

struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
    capacity: usize,
}

pub struct Replicator {
    queue: Arc<Queue>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl Replicator {
    pub fn new(print_tx: PrintSender) -> Self {
        Self::with_pool_size(DEFAULT_WORKERS, print_tx)
    }

    pub fn with_pool_size(workers: usize, print_tx: PrintSender) -> Self {
        let queue = Arc::new(Queue {
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: DEFAULT_QUEUE_CAPACITY,
        });
        let client = reqwest::Client::new();
        let dropped = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        for _ in 0..workers {
            let queue = queue.clone();
            let client = client.clone();
            let print_tx = print_tx.clone();
            let failed = failed.clone();
            tokio::spawn(async move {
                worker_loop(queue, client, print_tx, failed).await;
            });
        }

        Replicator {
            queue,
            dropped,
            failed,
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Fan out `timer` to every replica except `local_addr`. Fire-and-forget:
    /// no acknowledgement is awaited, and enqueue failures (overflow) are
    /// logged and counted rather than propagated (§4.3, §7 `ReplicationFail`).
    pub async fn replicate(&self, timer: &Timer, local_addr: &str, bloom_hash: u64) {
        let body = serde_json::to_string(&timer.to_json()).expect("Timer always serializes");
        for addr in &timer.replicas {
            if addr == local_addr {
                continue;
            }
            let url = timer.url(addr, bloom_hash);
            self.enqueue(Job {
                addr: addr.clone(),
                url,
                body: body.clone(),
            })
            .await;
        }
    }

    async fn enqueue(&self, job: Job) {
        let mut jobs = self.queue.jobs.lock().await;
        if jobs.len() >= self.queue.capacity {
            jobs.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        jobs.push_back(job);
        drop(jobs);
        self.queue.notify.notify_one();
    }
}

async fn worker_loop(
    queue: Arc<Queue>,
    client: reqwest::Client,
    print_tx: PrintSender,
    failed: Arc<AtomicU64>,
) {
    loop {
        let job = loop {
            let mut jobs = queue.jobs.lock().await;
            if let Some(job) = jobs.pop_front() {
                break job;
            }
            drop(jobs);
            queue.notify.notified().await;
        };

        if let Err(e) = perform(&client, &job).await {
            failed.fetch_add(1, Ordering::Relaxed);
            logging::debug(&print_tx, format!("replicator: {e}")).await;
        }
    }
}

async fn perform(client: &reqwest::Client, job: &Job) -> Result<(), ReplicationError> {
    let response = client
        .put(&job.url)
        .header("content-type", "application/json")
        .body(job.body.clone())
        .send()
        .await
        .map_err(|source| ReplicationError::Transport {
            addr: job.addr.clone(),
            source,
        })?;

    if !response.status().is_success() {
        return Err(ReplicationError::BadStatus {
            addr: job.addr.clone(),
            status: response.status().as_u16(),
        });
    }
    Ok(())
}
