//! §8 "Concrete end-to-end scenarios", driven over real HTTP and real
//! wall-clock time (short intervals, generous margins) rather than through
//! the in-process unit-test seams the per-module `#[cfg(test)]` blocks use.

use chronos_rs::alarm::AlarmTracker;
use chronos_rs::clock::{Clock, SystemClock};
use chronos_rs::handler::TimerHandler;
use chronos_rs::http_api::{self, ApiState};
use chronos_rs::http_callback::HttpCallback;
use chronos_rs::logging;
use chronos_rs::replicator::Replicator;
use chronos_rs::timer_store::TimerStore;
use chronos_rs::topology::{NodeInfo, Topology, TopologyHandle};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warp::Filter;

/// A captured callback POST: the `opaque` body and the `X-Sequence-Number`
/// header, in arrival order.
#[derive(Debug, Clone)]
struct Received {
    body: String,
    sequence_number: String,
}

/// Spins up a tiny real HTTP sink on an ephemeral loopback port that records
/// every POST it receives, standing in for the client endpoint named in a
/// timer's `callback.http.uri`.
async fn spawn_sink() -> (SocketAddr, Arc<Mutex<Vec<Received>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let captured = received.clone();

    let route = warp::path("cb")
        .and(warp::post())
        .and(warp::header::<String>("x-sequence-number"))
        .and(warp::body::bytes())
        .map(move |seq: String, body: warp::hyper::body::Bytes| {
            captured.lock().unwrap().push(Received {
                body: String::from_utf8_lossy(&body).into_owned(),
                sequence_number: seq,
            });
            warp::reply::with_status("", warp::http::StatusCode::OK)
        });

    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, received)
}

/// Grabs a free loopback port by binding and immediately dropping a
/// listener, so a topology's `addr` can name the real port a node will
/// serve on before that node's warp server actually binds it.
fn reserve_addr() -> String {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    format!("127.0.0.1:{}", listener.local_addr().unwrap().port())
}

/// One fully-wired node: store, handler, HTTP front door, bound on the
/// loopback port named by `local_addr` ("host:port"), so the
/// `Location`/replication URLs it hands out are reachable from the test.
async fn spawn_node(topology: TopologyHandle, local_addr: &str) -> Arc<TimerHandler> {
    let (print_tx, _print_rx) = logging::print_channel();
    let clock = Arc::new(SystemClock);
    let store = TimerStore::new(clock.now_ms());
    let (callback, completion_rx) = HttpCallback::with_pool_size(4, print_tx.clone());
    let replicator = Arc::new(Replicator::with_pool_size(4, print_tx.clone()));

    let handler = Arc::new(TimerHandler::new(
        store,
        clock,
        callback,
        completion_rx,
        replicator.clone(),
        topology.clone(),
        AlarmTracker::new(3),
        print_tx.clone(),
    ));

    let state = ApiState {
        handler: handler.clone(),
        replicator,
        topology,
        print_tx,
    };
    let routes = http_api::routes(state);
    let bind_addr: SocketAddr = local_addr.parse().expect("local_addr is host:port");
    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(bind_addr, async {
        std::future::pending::<()>().await;
    });
    tokio::spawn(server);
    handler
}

fn single_node_topology(addr: &str) -> TopologyHandle {
    let topology = Topology {
        local: NodeInfo {
            addr: addr.to_string(),
            signature: 0b001,
        },
        nodes: vec![NodeInfo {
            addr: addr.to_string(),
            signature: 0b001,
        }],
        bloom_bits: 1,
        default_replication_factor: 1,
    };
    Arc::new(tokio::sync::RwLock::new(Arc::new(topology)))
}

#[tokio::test]
async fn single_shot_timer_fires_exactly_once() {
    let (sink_addr, received) = spawn_sink().await;
    let node_addr = reserve_addr();
    let topology = single_node_topology(&node_addr);
    let _handler = spawn_node(topology, &node_addr).await;

    let client = reqwest::Client::new();
    let body = format!(
        r#"{{"timing":{{"interval":80,"repeat-for":80}},
             "callback":{{"http":{{"uri":"http://{sink_addr}/cb","opaque":"x"}}}},
             "reliability":{{}}}}"#
    );
    let resp = client
        .post(format!("http://{node_addr}/timers"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert!(resp.headers().contains_key("location"));

    tokio::time::sleep(Duration::from_millis(400)).await;

    let calls = received.lock().unwrap().clone();
    assert_eq!(calls.len(), 1, "expected exactly one pop, got {calls:?}");
    assert_eq!(calls[0].body, "x");
    assert_eq!(calls[0].sequence_number, "1");
}

#[tokio::test]
async fn repeating_timer_pops_exactly_twice_within_its_window() {
    // §8 scenario 2: interval=90, repeat-for=225 ⇒ pops allowed at k=1 (90
    // ≤ 225) and k=2 (180 ≤ 225) but not k=3 (270 > 225).
    let (sink_addr, received) = spawn_sink().await;
    let node_addr = reserve_addr();
    let topology = single_node_topology(&node_addr);
    let _handler = spawn_node(topology, &node_addr).await;

    let client = reqwest::Client::new();
    let body = format!(
        r#"{{"timing":{{"interval":90,"repeat-for":225}},
             "callback":{{"http":{{"uri":"http://{sink_addr}/cb","opaque":"y"}}}},
             "reliability":{{}}}}"#
    );
    client
        .post(format!("http://{node_addr}/timers"))
        .body(body)
        .send()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;

    let calls = received.lock().unwrap().clone();
    assert_eq!(calls.len(), 2, "expected exactly two pops, got {calls:?}");
    assert_eq!(calls[0].sequence_number, "1");
    assert_eq!(calls[1].sequence_number, "2");
}

#[tokio::test]
async fn delete_tombstones_and_stops_further_pops() {
    let (sink_addr, received) = spawn_sink().await;
    let node_addr = reserve_addr();
    let topology = single_node_topology(&node_addr);
    let handler = spawn_node(topology, &node_addr).await;

    let client = reqwest::Client::new();
    let body = format!(
        r#"{{"timing":{{"interval":80,"repeat-for":400}},
             "callback":{{"http":{{"uri":"http://{sink_addr}/cb","opaque":"z"}}}},
             "reliability":{{}}}}"#
    );
    let resp = client
        .post(format!("http://{node_addr}/timers"))
        .body(body)
        .send()
        .await
        .unwrap();
    let location = resp
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    assert_eq!(handler.store_len(), 1);

    let del = client.delete(&location).send().await.unwrap();
    assert_eq!(del.status(), reqwest::StatusCode::OK);

    // Give the dispatcher one more tick to evict the tombstone, then check
    // no further pops arrive even though the original schedule would still
    // have due pops left.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let calls = received.lock().unwrap().clone();
    assert!(
        calls.len() <= 1,
        "tombstone should prevent further pops, got {calls:?}"
    );
}

#[tokio::test]
async fn malformed_body_is_rejected_and_nothing_is_stored() {
    let node_addr = reserve_addr();
    let topology = single_node_topology(&node_addr);
    let handler = spawn_node(topology, &node_addr).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{node_addr}/timers"))
        .body(r#"{"timing":{"interval":"not-a-number","repeat-for":200}}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let text = resp.text().await.unwrap();
    assert!(!text.is_empty());
    assert_eq!(handler.store_len(), 0);
}

#[tokio::test]
async fn replication_fans_out_to_the_other_node() {
    let (sink_addr, received) = spawn_sink().await;

    let node_a = reserve_addr();
    let node_b = reserve_addr();
    let topology = Arc::new(tokio::sync::RwLock::new(Arc::new(Topology {
        local: NodeInfo {
            addr: node_a.clone(),
            signature: 0b01,
        },
        nodes: vec![
            NodeInfo {
                addr: node_a.clone(),
                signature: 0b01,
            },
            NodeInfo {
                addr: node_b.clone(),
                signature: 0b10,
            },
        ],
        bloom_bits: 1,
        default_replication_factor: 2,
    })));

    let _handler_a = spawn_node(topology.clone(), &node_a).await;
    let handler_b = spawn_node(topology, &node_b).await;

    let client = reqwest::Client::new();
    let body = format!(
        r#"{{"timing":{{"interval":10000,"repeat-for":10000}},
             "callback":{{"http":{{"uri":"http://{sink_addr}/cb","opaque":"w"}}}},
             "reliability":{{"replication-factor":2}}}}"#
    );
    let resp = client
        .post(format!("http://{node_a}/timers"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        handler_b.store_len(),
        1,
        "expected the timer to be replicated onto node B"
    );
    // The long interval means no pop should have fired yet on either node.
    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn put_with_explicit_replicas_recovers_an_orphaned_entry() {
    // §8 scenario 6: a node that never held a given id still accepts a PUT
    // naming it as an explicit replica (bloom-derived ownership is advisory
    // only; the explicit replica list in the body is authoritative).
    let node_a = reserve_addr();
    let node_b = reserve_addr();
    let topology = Arc::new(tokio::sync::RwLock::new(Arc::new(Topology {
        local: NodeInfo {
            addr: node_b.clone(),
            signature: 0b10,
        },
        nodes: vec![
            NodeInfo {
                addr: node_a.clone(),
                signature: 0b01,
            },
            NodeInfo {
                addr: node_b.clone(),
                signature: 0b10,
            },
        ],
        bloom_bits: 1,
        default_replication_factor: 2,
    })));
    let handler = spawn_node(topology, &node_b).await;

    let client = reqwest::Client::new();
    let hex_id = chronos_rs::timer::encode_hex_id(0xdead_beef, 0b11);
    let body = format!(
        r#"{{"timing":{{"interval":50000,"repeat-for":50000}},
             "callback":{{"http":{{"uri":"http://sink/cb","opaque":"recovered"}}}},
             "reliability":{{"replicas":["{node_a}","{node_b}"]}}}}"#
    );
    let resp = client
        .put(format!("http://{node_b}/timers/{hex_id}"))
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(handler.store_len(), 1);
}

#[tokio::test]
async fn get_unknown_timer_404s_with_a_candidate_hint() {
    // §8 scenario 6, the GET half: a node that is a bloom candidate but has
    // no local record returns 404 naming another candidate to retry.
    let node_a = reserve_addr();
    let node_b = reserve_addr();
    let topology = Arc::new(tokio::sync::RwLock::new(Arc::new(Topology {
        local: NodeInfo {
            addr: node_b.clone(),
            signature: 0b10,
        },
        nodes: vec![
            NodeInfo {
                addr: node_a.clone(),
                signature: 0b01,
            },
            NodeInfo {
                addr: node_b.clone(),
                signature: 0b10,
            },
        ],
        bloom_bits: 1,
        default_replication_factor: 2,
    })));
    let _handler = spawn_node(topology, &node_b).await;

    let client = reqwest::Client::new();
    let hex_id = chronos_rs::timer::encode_hex_id(0xfeed_face, 0b11);
    let resp = client
        .get(format!("http://{node_b}/timers/{hex_id}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    let text = resp.text().await.unwrap();
    assert_eq!(text, format!("not found on this replica, try {node_a}"));
}

#[tokio::test]
async fn get_known_timer_returns_200() {
    let (sink_addr, _received) = spawn_sink().await;
    let node_addr = reserve_addr();
    let topology = single_node_topology(&node_addr);
    let _handler = spawn_node(topology, &node_addr).await;

    let client = reqwest::Client::new();
    let body = format!(
        r#"{{"timing":{{"interval":100000,"repeat-for":100000}},
             "callback":{{"http":{{"uri":"http://{sink_addr}/cb","opaque":"g"}}}},
             "reliability":{{}}}}"#
    );
    let post = client
        .post(format!("http://{node_addr}/timers"))
        .body(body)
        .send()
        .await
        .unwrap();
    let location = post
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let get = client.get(&location).send().await.unwrap();
    assert_eq!(get.status(), reqwest::StatusCode::OK);
}
