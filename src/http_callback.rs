//! §4.4 — the fixed-size worker pool that actually fires a timer's HTTP
//! callback. Ownership of the timer passes into the pool and comes back out
//! over a completion channel, rather than the pool holding a reference back
//! into the handler — breaking the cyclic-ownership problem the teacher
//! solves the same way between `http_client` and the kernel loop (§9).

use crate::errors::CallbackError;
use crate::logging::{self, PrintSender};
use crate::timer::Timer;
use tokio::sync::{mpsc, Mutex};

const DEFAULT_WORKERS: usize = 50;
const COMPLETION_CHANNEL_CAPACITY: usize = 1_000;

/// Reported back to whoever submitted the timer once the HTTP attempt
/// (successful or not) has finished. §4.4: a non-2xx or transport failure
/// still counts as "popped".
pub struct CallbackCompletion {
    pub timer: Timer,
    pub success: bool,
}

pub type CompletionSender = mpsc::Sender<CallbackCompletion>;
pub type CompletionReceiver = mpsc::Receiver<CallbackCompletion>;

pub struct HttpCallback {
    job_tx: mpsc::Sender<Timer>,
}

impl HttpCallback {
    /// Spawns `workers` tasks pulling from a shared queue and returns the
    /// handle plus the receiving end of the completion channel.
    pub fn new(print_tx: PrintSender) -> (Self, CompletionReceiver) {
        Self::with_pool_size(DEFAULT_WORKERS, print_tx)
    }

    pub fn with_pool_size(workers: usize, print_tx: PrintSender) -> (Self, CompletionReceiver) {
        let (job_tx, job_rx) = mpsc::channel::<Timer>(workers.max(1) * 4);
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);
        let job_rx = std::sync::Arc::new(Mutex::new(job_rx));
        let client = reqwest::Client::new();

        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let client = client.clone();
            let completion_tx = completion_tx.clone();
            let print_tx = print_tx.clone();
            tokio::spawn(async move {
                loop {
                    let timer = {
                        let mut rx = job_rx.lock().await;
                        match rx.recv().await {
                            Some(timer) => timer,
                            None => return, // all senders dropped: pool shuts down
                        }
                    };
                    let success = match perform(&client, &timer).await {
                        Ok(()) => true,
                        Err(e) => {
                            logging::debug(&print_tx, format!("callback: {e}")).await;
                            false
                        }
                    };
                    let _ = completion_tx.send(CallbackCompletion { timer, success }).await;
                }
            });
        }

        (HttpCallback { job_tx }, completion_rx)
    }

    /// Takes ownership of `timer` and submits it to the pool. The timer
    /// comes back out via the `CompletionReceiver` once the attempt
    /// finishes; the handler must not call `perform` again for this id
    /// until that happens (§4.4's no-concurrent-pop-for-one-id rule — the
    /// handler, not this pool, enforces it by tracking in-flight ids).
    pub async fn perform(&self, timer: Timer) {
        let _ = self.job_tx.send(timer).await;
    }
}

async fn perform(client: &reqwest::Client, timer: &Timer) -> Result<(), CallbackError> {
    let response = client
        .post(&timer.callback_url)
        .header("X-Sequence-Number", timer.sequence_number.to_string())
        .body(timer.callback_body.clone())
        .send()
        .await
        .map_err(|source| CallbackError::Transport {
            id: timer.id,
            source,
        })?;

    if !response.status().is_success() {
        return Err(CallbackError::BadStatus {
            id: timer.id,
            status: response.status().as_u16(),
        });
    }
    Ok(())
}
