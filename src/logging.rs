//! A terminal printout channel, in the spirit of the runtime modules this
//! service is built from: rather than pull in a logging crate, every
//! component sends human-readable lines to a single consumer over an
//! `mpsc` channel and never blocks waiting for them to be written.

use tokio::sync::mpsc;

pub type PrintSender = mpsc::Sender<Printout>;
pub type PrintReceiver = mpsc::Receiver<Printout>;

const PRINT_CHANNEL_CAPACITY: usize = 1_000;

/// A single line bound for the terminal. Verbosity 0 is always shown;
/// verbosity 1 is only shown when the process was started with `--verbose`.
/// Numbers greater than 1 are reserved and currently treated as 1.
#[derive(Debug, Clone)]
pub struct Printout {
    pub verbosity: u8,
    pub content: String,
}

pub fn print_channel() -> (PrintSender, PrintReceiver) {
    mpsc::channel(PRINT_CHANNEL_CAPACITY)
}

/// Send a verbosity-0 (always shown) line. Best-effort: a full or closed
/// channel never blocks or panics the caller.
pub async fn info(tx: &PrintSender, content: impl Into<String>) {
    let _ = tx
        .send(Printout {
            verbosity: 0,
            content: content.into(),
        })
        .await;
}

/// Send a verbosity-1 (verbose-only) line.
pub async fn debug(tx: &PrintSender, content: impl Into<String>) {
    let _ = tx
        .send(Printout {
            verbosity: 1,
            content: content.into(),
        })
        .await;
}

/// Send a line that should stand out as an error/alarm condition.
pub async fn warn(tx: &PrintSender, content: impl Into<String>) {
    let _ = tx
        .send(Printout {
            verbosity: 0,
            content: format!("\x1b[38;5;196m{}\x1b[0m", content.into()),
        })
        .await;
}

/// Drains the print channel and writes to stdout, honoring `verbose`.
/// Runs forever; intended to be spawned as its own task and left running
/// until the sender side is dropped at shutdown.
pub async fn print_loop(mut rx: PrintReceiver, verbose: bool) {
    while let Some(Printout { verbosity, content }) = rx.recv().await {
        if verbosity == 0 || verbose {
            println!("{content}\r");
        }
    }
}
