//! Integration tests: real routers over in-memory duplex links.
//!
//! Nodes attach with the authenticated handshake, converge on a spanning
//! tree and on snake neighbours, and exchange traffic and pings end to end.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::time::timeout;

use snakewood::{Addr, Config, Router};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Routers for `n` fresh keys, sorted ascending by public key.
fn make_routers(n: usize) -> Vec<Arc<Router>> {
    let mut keys: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate(&mut OsRng)).collect();
    keys.sort_by_key(|k| k.verifying_key().to_bytes());
    keys.into_iter()
        .map(|k| Router::new(k, Config::default()))
        .collect()
}

/// Connect two routers over a duplex pipe with the authenticated handshake.
async fn connect(a: &Arc<Router>, b: &Arc<Router>) {
    let (conn_a, conn_b) = tokio::io::duplex(65536);
    let b2 = b.clone();
    let handle =
        tokio::spawn(async move { b2.attach_authenticated(Box::new(conn_b), "", 0).await });
    a.attach_authenticated(Box::new(conn_a), "", 0)
        .await
        .expect("attach a");
    handle.await.expect("join").expect("attach b");
}

/// Poll until `check` passes or the deadline runs out.
async fn wait_for<F, Fut>(what: &str, deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await {
            return;
        }
        if start.elapsed() > deadline {
            panic!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn two_nodes_form_a_snake() {
    init_tracing();
    let routers = make_routers(2);
    let (a, b) = (routers[0].clone(), routers[1].clone());
    connect(&a, &b).await;

    // Tree: both sides agree that the higher key is the root.
    wait_for("tree convergence", Duration::from_secs(10), || {
        let (a, b) = (a.clone(), b.clone());
        async move {
            let sa = a.debug_snapshot().await;
            let sb = b.debug_snapshot().await;
            sa.root == b.public_key() && sb.root == b.public_key()
        }
    })
    .await;

    // Snake: A's ascending is B, B's descending is A.
    wait_for("snake convergence", Duration::from_secs(15), || {
        let (a, b) = (a.clone(), b.clone());
        async move {
            let sa = a.debug_snapshot().await;
            let sb = b.debug_snapshot().await;
            sa.ascending == Some(b.public_key()) && sb.descending == Some(a.public_key())
        }
    })
    .await;

    // The root never has an ascending path.
    let sb = b.debug_snapshot().await;
    assert_eq!(sb.ascending, None);

    for r in &routers {
        r.close();
    }
}

#[tokio::test]
async fn two_nodes_exchange_traffic() {
    init_tracing();
    let routers = make_routers(2);
    let (a, b) = (routers[0].clone(), routers[1].clone());
    connect(&a, &b).await;

    let addr_a = a.public_key();
    let addr_b = b.public_key();

    // Reader on B.
    let b2 = b.clone();
    let reader = tokio::spawn(async move {
        loop {
            match b2.recv().await {
                Some((from, payload)) if from == addr_a => return payload,
                Some(_) => continue,
                None => return Vec::new(),
            }
        }
    });

    // Sender on A: send once a second until the reader is satisfied.
    let a2 = a.clone();
    let sender = tokio::spawn(async move {
        loop {
            a2.send(addr_b, b"snake oil").await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });

    let result = timeout(Duration::from_secs(30), reader).await;
    sender.abort();
    assert_eq!(result.expect("timeout").expect("panic"), b"snake oil");

    for r in &routers {
        r.close();
    }
}

#[tokio::test]
async fn three_node_chain_converges_and_routes() {
    init_tracing();
    let routers = make_routers(3);
    let (a, b, c) = (
        routers[0].clone(),
        routers[1].clone(),
        routers[2].clone(),
    );

    // A - B - C, keys ascending; C is the strongest root.
    connect(&a, &b).await;
    connect(&b, &c).await;

    wait_for("tree convergence", Duration::from_secs(15), || {
        let (a, b, c) = (a.clone(), b.clone(), c.clone());
        async move {
            let root = c.public_key();
            let sa = a.debug_snapshot().await;
            let sb = b.debug_snapshot().await;
            let sc = c.debug_snapshot().await;
            sa.root == root && sb.root == root && sc.root == root
        }
    })
    .await;

    // The snake orders the chain by key: A - B - C.
    wait_for("snake convergence", Duration::from_secs(20), || {
        let (a, b, c) = (a.clone(), b.clone(), c.clone());
        async move {
            let sa = a.debug_snapshot().await;
            let sb = b.debug_snapshot().await;
            let sc = c.debug_snapshot().await;
            sa.ascending == Some(b.public_key())
                && sb.ascending == Some(c.public_key())
                && sb.descending == Some(a.public_key())
                && sc.descending == Some(b.public_key())
        }
    })
    .await;

    // Traffic from the lowest key to the highest crosses the middle node.
    let addr_a = a.public_key();
    let addr_c = c.public_key();
    let c2 = c.clone();
    let reader = tokio::spawn(async move {
        loop {
            match c2.recv().await {
                Some((from, payload)) if from == addr_a => return payload,
                Some(_) => continue,
                None => return Vec::new(),
            }
        }
    });
    let a2 = a.clone();
    let sender = tokio::spawn(async move {
        loop {
            a2.send(addr_c, b"across the chain").await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
    let result = timeout(Duration::from_secs(30), reader).await;
    sender.abort();
    assert_eq!(result.expect("timeout").expect("panic"), b"across the chain");

    for r in &routers {
        r.close();
    }
}

#[tokio::test]
async fn snek_ping_round_trip() {
    init_tracing();
    let routers = make_routers(2);
    let (a, b) = (routers[0].clone(), routers[1].clone());
    connect(&a, &b).await;

    wait_for("tree convergence", Duration::from_secs(10), || {
        let (a, b) = (a.clone(), b.clone());
        async move { a.debug_snapshot().await.root == b.public_key() }
    })
    .await;

    // Pings ride on the same routing as traffic; retry until the first one
    // makes it through.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        match a.snek_ping(b.public_key(), Duration::from_secs(2)).await {
            Ok(rtt) => {
                assert!(rtt < Duration::from_secs(2));
                break;
            }
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(e) => panic!("ping never completed: {e}"),
        }
    }

    for r in &routers {
        r.close();
    }
}

#[tokio::test]
async fn detached_peer_loses_connectivity() {
    init_tracing();
    let routers = make_routers(2);
    let (a, b) = (routers[0].clone(), routers[1].clone());
    connect(&a, &b).await;

    wait_for("attachment", Duration::from_secs(5), || {
        let (a, b) = (a.clone(), b.clone());
        async move { a.is_connected(b.public_key(), "") && b.is_connected(a.public_key(), "") }
    })
    .await;

    a.detach(1).await;

    let key_b = b.public_key();
    wait_for("detachment", Duration::from_secs(5), || {
        let a = a.clone();
        async move { !a.is_connected(key_b, "") }
    })
    .await;

    // The dropped link eventually clears the snake pointers on A.
    wait_for("snake cleanup", Duration::from_secs(10), || {
        let a = a.clone();
        async move {
            let sa = a.debug_snapshot().await;
            sa.ascending.is_none() && sa.table_len == 0
        }
    })
    .await;

    for r in &routers {
        r.close();
    }
}

#[tokio::test]
async fn addr_round_trips_through_display() {
    let key = SigningKey::generate(&mut OsRng);
    let addr = Addr(key.verifying_key().to_bytes());
    let shown = format!("{addr}");
    assert_eq!(shown.len(), 64);
    assert!(shown.chars().all(|c| c.is_ascii_hexdigit()));
}
