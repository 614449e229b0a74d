//! Binary entry point. Startup order follows §6 "Process-wide state": load
//! config, construct store/replicator/callback pool/handler, bind the HTTP
//! listener. Shutdown is the reverse, cooperative via `TimerHandler::stop()`
//! (§5), matching the teacher's `main.rs` tokio::select!-on-signals-then-
//! drain-tasks shutdown shape.

use chronos_rs::alarm::AlarmTracker;
use chronos_rs::clock::SystemClock;
use chronos_rs::clock::Clock;
use chronos_rs::config;
use chronos_rs::handler::TimerHandler;
use chronos_rs::http_api::{self, ApiState};
use chronos_rs::http_callback::HttpCallback;
use chronos_rs::logging;
use chronos_rs::replicator::Replicator;
use chronos_rs::timer_store::TimerStore;

use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cli = config::parse_cli();

    let (print_tx, print_rx) = logging::print_channel();
    let print_task = tokio::spawn(logging::print_loop(print_rx, cli.verbose));

    let topology = match config::load_topology(&cli.config_path, &cli.local_addr) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("\x1b[38;5;196mchronosd: failed to load cluster config: {e}\x1b[0m");
            std::process::exit(1);
        }
    };
    let alarm_threshold = config::alarm_threshold(&cli.config_path).unwrap_or(5);
    let topology_handle = config::topology_handle(topology);

    let clock = Arc::new(SystemClock);
    let store = TimerStore::new(clock.now_ms());
    let (callback, completion_rx) = HttpCallback::with_pool_size(cli.worker_threads, print_tx.clone());
    let replicator = Arc::new(Replicator::with_pool_size(cli.worker_threads, print_tx.clone()));
    let alarm = AlarmTracker::new(alarm_threshold);

    let handler = Arc::new(TimerHandler::new(
        store,
        clock,
        callback,
        completion_rx,
        replicator.clone(),
        topology_handle.clone(),
        alarm,
        print_tx.clone(),
    ));

    config::spawn_reload_task(
        topology_handle.clone(),
        cli.config_path.clone(),
        cli.local_addr.clone(),
        print_tx.clone(),
    );

    let api_state = ApiState {
        handler: handler.clone(),
        replicator,
        topology: topology_handle,
        print_tx: print_tx.clone(),
    };
    let routes = http_api::routes(api_state);
    let bind_addr: SocketAddr = ([0, 0, 0, 0], cli.bind_port).into();
    let (http_shutdown_tx, http_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(bind_addr, async {
        let _ = http_shutdown_rx.await;
    });

    logging::info(&print_tx, format!("chronosd: listening on {bind_addr}")).await;
    let server_task = tokio::spawn(server);

    let signal_name = config::wait_for_shutdown_signal().await;
    logging::info(&print_tx, format!("chronosd: received {signal_name}, shutting down")).await;

    let _ = http_shutdown_tx.send(());
    handler.stop().await;
    let _ = server_task.await;

    drop(print_tx);
    let _ = print_task.await;
}
