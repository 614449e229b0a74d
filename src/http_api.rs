//! §4.6 — the HTTP front door. A thin `warp` adapter translating verbs on
//! `/timers/<hex>` into store/handler/replicator calls; handlers never
//! block on I/O themselves, matching the teacher's `http_server/mod.rs`
//! single-reactor note (§5).

use crate::errors::ApiError;
use crate::handler::TimerHandler;
use crate::logging::{self, PrintSender};
use crate::replicator::Replicator;
use crate::timer::{decode_hex_id, parse_timer_json, Timer};
use crate::topology::TopologyHandle;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Reply};

/// Everything a request handler needs; cloned cheaply per-request the way
/// the teacher threads its channel/state clones through `warp::any().map`.
#[derive(Clone)]
pub struct ApiState {
    pub handler: Arc<TimerHandler>,
    pub replicator: Arc<Replicator>,
    pub topology: TopologyHandle,
    pub print_tx: PrintSender,
}

fn with_state(
    state: ApiState,
) -> impl Filter<Extract = (ApiState,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

pub fn routes(
    state: ApiState,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let ping = warp::path("ping")
        .and(warp::get())
        .map(|| Box::new(warp::reply::with_status("OK", StatusCode::OK)) as Box<dyn Reply>);

    let post_timers = warp::path("timers")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(post_timer);

    let get_timers = warp::path("timers")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_timers_summary);

    let get_timer = warp::path("timers")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_timer);

    let put_timer = warp::path("timers")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::put())
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(put_timer);

    let delete_timer = warp::path("timers")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_state(state))
        .and_then(delete_timer);

    ping.or(post_timers)
        .unify()
        .or(get_timers)
        .unify()
        .or(get_timer)
        .unify()
        .or(put_timer)
        .unify()
        .or(delete_timer)
        .unify()
}

async fn post_timer(
    body: warp::hyper::body::Bytes,
    state: ApiState,
) -> Result<Box<dyn Reply>, std::convert::Infallible> {
    let id: u64 = rand::random();
    let topology = state.topology.read().await.clone();

    let parsed = match parse_timer_json(&body) {
        Ok(p) => p,
        Err(e) => return Ok(reply_error(ApiError::MalformedBody(e))),
    };
    let (timer, already_replicated) = match Timer::from_json(id, 0, &parsed, &topology, now_ms()) {
        Ok(t) => t,
        Err(e) => return Ok(reply_error(ApiError::MalformedBody(e))),
    };
    warn_if_cluster_too_small(&state.print_tx, &timer).await;

    let bloom_hash = topology.bloom_hash_of(timer.replicas.iter().map(String::as_str));
    state.handler.add_timer(timer.clone());
    if !already_replicated {
        state
            .replicator
            .replicate(&timer, topology.local_addr(), bloom_hash)
            .await;
    }

    let location = timer.url(topology.local_addr(), bloom_hash);
    logging::debug(&state.print_tx, format!("POST /timers -> {location}")).await;

    Ok(Box::new(warp::reply::with_header(
        warp::reply::with_status("", StatusCode::OK),
        "Location",
        location,
    )))
}

/// §4.6 / §8 scenario 6: a client GETting `/timers/<id-prefix>` on any
/// replica must be routed to a replica that owns it. The bloom hash in the
/// URL is only a hint (§6), so a node that has no local record still checks
/// whether the hash names it as a candidate before giving up; either way it
/// never looks anywhere but its own store (routing the request onward is
/// the client's job, not this node's).
async fn get_timer(
    hex_id: String,
    state: ApiState,
) -> Result<Box<dyn Reply>, std::convert::Infallible> {
    let Some((id, bloom_hash)) = decode_hex_id(&hex_id) else {
        return Ok(reply_error(ApiError::BadHex(format!(
            "'{hex_id}' is not a valid 32-character hex timer id"
        ))));
    };

    if let Some(timer) = state.handler.get_timer(id) {
        return Ok(Box::new(warp::reply::json(&timer.to_json())));
    }

    let topology = state.topology.read().await.clone();
    let hint = topology
        .candidates_for_hash(bloom_hash)
        .into_iter()
        .map(|n| n.addr.as_str())
        .find(|addr| *addr != topology.local_addr());

    let message = match hint {
        Some(addr) => format!("not found on this replica, try {addr}"),
        None => "not found on this replica".to_string(),
    };
    Ok(Box::new(warp::reply::with_status(
        message,
        StatusCode::NOT_FOUND,
    )))
}

async fn put_timer(
    hex_id: String,
    body: warp::hyper::body::Bytes,
    state: ApiState,
) -> Result<Box<dyn Reply>, std::convert::Infallible> {
    let Some((id, bloom_hash)) = decode_hex_id(&hex_id) else {
        return Ok(reply_error(ApiError::BadHex(format!(
            "'{hex_id}' is not a valid 32-character hex timer id"
        ))));
    };

    if body.is_empty() {
        state.handler.delete_timer(id).await;
        return Ok(Box::new(warp::reply::with_status("", StatusCode::OK)));
    }

    let topology = state.topology.read().await.clone();
    let parsed = match parse_timer_json(&body) {
        Ok(p) => p,
        Err(e) => return Ok(reply_error(ApiError::MalformedBody(e))),
    };
    let (timer, already_replicated) = match Timer::from_json(id, bloom_hash, &parsed, &topology, now_ms()) {
        Ok(t) => t,
        Err(e) => return Ok(reply_error(ApiError::MalformedBody(e))),
    };
    warn_if_cluster_too_small(&state.print_tx, &timer).await;

    if !timer.is_local(topology.local_addr()) {
        return Ok(reply_error(ApiError::NotAReplica));
    }

    state.handler.add_timer(timer.clone());
    if !already_replicated {
        let fresh_hash = topology.bloom_hash_of(timer.replicas.iter().map(String::as_str));
        state
            .replicator
            .replicate(&timer, topology.local_addr(), fresh_hash)
            .await;
    }

    Ok(Box::new(warp::reply::with_status("", StatusCode::OK)))
}

async fn delete_timer(
    hex_id: String,
    state: ApiState,
) -> Result<Box<dyn Reply>, std::convert::Infallible> {
    let Some((id, _bloom_hash)) = decode_hex_id(&hex_id) else {
        return Ok(reply_error(ApiError::BadHex(format!(
            "'{hex_id}' is not a valid 32-character hex timer id"
        ))));
    };
    state.handler.delete_timer(id).await;
    Ok(Box::new(warp::reply::with_status("", StatusCode::OK)))
}

/// EXPANSION 5 — additive debug endpoint, not part of `spec.md`'s wire
/// contract: a count of pending timers, nothing sensitive.
async fn get_timers_summary(state: ApiState) -> Result<Box<dyn Reply>, std::convert::Infallible> {
    let body = serde_json::json!({ "pending": state.handler.store_len() });
    Ok(Box::new(warp::reply::json(&body)))
}

/// §7 `ClusterTooSmall`: the selection algorithm (`Topology::select_replicas`)
/// silently hands back fewer replicas than requested when the cluster itself
/// is smaller than the replication factor. The timer is still accepted --
/// this only logs the shortfall, it never rejects the request.
async fn warn_if_cluster_too_small(print_tx: &PrintSender, timer: &Timer) {
    if timer.replicas.len() < timer.replication_factor {
        logging::warn(
            print_tx,
            format!(
                "timer {}: cluster has only {} of {} requested replicas, accepting with fewer",
                timer.id,
                timer.replicas.len(),
                timer.replication_factor
            ),
        )
        .await;
    }
}

fn reply_error(err: ApiError) -> Box<dyn Reply> {
    Box::new(warp::reply::with_status(err.to_string(), err.status()))
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}
