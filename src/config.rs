//! EXPANSION 1 — CLI flags (`clap`, builder API, matching the teacher's
//! `main.rs` rather than the derive macro) plus the JSON cluster config file
//! and its `SIGHUP` reload, mirroring Chronos's `Globals::update_config()`
//! (`original_source/src/main/main.cpp`) and the teacher's
//! `intercept_sigs.rs` signal-handling idiom.

use crate::logging::{self, PrintSender};
use crate::topology::{NodeInfo, Topology, TopologyHandle};
use anyhow::{anyhow, Context, Result};
use clap::{arg, value_parser, Command};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

fn default_replication_factor() -> usize {
    2
}

fn default_alarm_threshold() -> u32 {
    5
}

/// On-disk shape of the cluster config file: membership plus cluster-wide
/// tuning knobs (§6 "Configuration").
#[derive(Debug, Deserialize)]
struct ClusterConfigFile {
    nodes: Vec<NodeEntry>,
    bloom_bits: u32,
    #[serde(default = "default_replication_factor")]
    default_replication_factor: usize,
    #[serde(default = "default_alarm_threshold")]
    alarm_threshold: u32,
}

/// A node entry as written by hand: `signature` is optional, since a
/// human adding a node to the cluster shouldn't have to compute a
/// well-formed bloom signature themselves.
#[derive(Debug, Deserialize)]
struct NodeEntry {
    addr: String,
    signature: Option<u64>,
}

pub struct Cli {
    pub config_path: PathBuf,
    pub local_addr: String,
    pub bind_port: u16,
    pub worker_threads: usize,
    pub verbose: bool,
}

pub fn parse_cli() -> Cli {
    let matches = Command::new("chronosd")
        .about("A distributed, replicated timer service")
        .arg(arg!(<config> "Path to the cluster config file").required(true))
        .arg(arg!(--node <ADDR> "This node's address as listed in the cluster config").required(true))
        .arg(
            arg!(--port <PORT> "HTTP bind port")
                .default_value("8080")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            arg!(--"worker-threads" <N> "Size of the replication and callback worker pools")
                .default_value("50")
                .value_parser(value_parser!(usize)),
        )
        .arg(arg!(--verbose "Show verbosity-1 log lines"))
        .get_matches();

    Cli {
        config_path: PathBuf::from(matches.get_one::<String>("config").unwrap()),
        local_addr: matches.get_one::<String>("node").unwrap().clone(),
        bind_port: *matches.get_one::<u16>("port").unwrap(),
        worker_threads: *matches.get_one::<usize>("worker-threads").unwrap(),
        verbose: matches.get_flag("verbose"),
    }
}

/// §6: "Configuration ... cluster address list, per-node signature, bloom-bit
/// count". `local_addr` must appear in the file's node list, or this fails —
/// a node doesn't get to run the cluster it isn't a member of.
pub fn load_topology(path: &Path, local_addr: &str) -> Result<Topology> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading cluster config {}", path.display()))?;
    let file: ClusterConfigFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing cluster config {}", path.display()))?;

    let nodes: Vec<NodeInfo> = file
        .nodes
        .into_iter()
        .map(|n| {
            let signature = n
                .signature
                .unwrap_or_else(|| Topology::derive_signature(&n.addr, file.bloom_bits));
            NodeInfo {
                addr: n.addr,
                signature,
            }
        })
        .collect();

    let local = nodes
        .iter()
        .find(|n| n.addr == local_addr)
        .cloned()
        .ok_or_else(|| anyhow!("local node '{local_addr}' is not present in the cluster config"))?;

    Ok(Topology {
        local,
        nodes,
        bloom_bits: file.bloom_bits,
        default_replication_factor: file.default_replication_factor,
    })
}

pub fn alarm_threshold(path: &Path) -> Result<u32> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading cluster config {}", path.display()))?;
    let file: ClusterConfigFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing cluster config {}", path.display()))?;
    Ok(file.alarm_threshold)
}

/// Spawns the task that reloads the topology snapshot on `SIGHUP` (§9
/// "Global configuration": atomic swap, never an in-place mutation). A
/// malformed config on reload is logged and the prior snapshot kept.
pub fn spawn_reload_task(
    topology: TopologyHandle,
    config_path: PathBuf,
    local_addr: String,
    print_tx: PrintSender,
) {
    tokio::spawn(async move {
        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(s) => s,
            Err(e) => {
                logging::warn(&print_tx, format!("config: failed to install SIGHUP handler: {e}"))
                    .await;
                return;
            }
        };
        loop {
            sighup.recv().await;
            match load_topology(&config_path, &local_addr) {
                Ok(new_topology) => {
                    *topology.write().await = Arc::new(new_topology);
                    logging::info(&print_tx, "config: reloaded cluster topology on SIGHUP").await;
                }
                Err(e) => {
                    logging::warn(
                        &print_tx,
                        format!("config: SIGHUP reload failed, keeping prior topology: {e}"),
                    )
                    .await;
                }
            }
        }
    });
}

/// Resolves on `SIGINT` or `SIGTERM`, naming whichever arrived, for the
/// graceful-shutdown sequence in `main`.
pub async fn wait_for_shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

/// Builds the initial `TopologyHandle` snapshot wrapper other modules share.
pub fn topology_handle(topology: Topology) -> TopologyHandle {
    Arc::new(RwLock::new(Arc::new(topology)))
}
