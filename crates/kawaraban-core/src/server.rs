//! Inbound side of the wire protocol
//!
//! Every endpoint is a GET returning plain text, one `<>`-separated item
//! per line. Malformed input never earns an error page: the reply is an
//! empty body, and the peer's line parser skips it. The range segment of
//! `/head`, `/get` and `/recent` is a wildcard because an exact selector
//! (`stamp/id`) contains a slash.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::routing::get;
use axum::Router;
use tracing::debug;

use crate::engine::BbsEngine;
use crate::node::NodeAddr;
use crate::record::Head;
use crate::wire::Range;

/// Build the protocol router, nested under the configured server path.
pub fn router(engine: Arc<BbsEngine>) -> Router {
    let path = engine.config.server_path.clone();
    let inner = Router::new()
        .route("/ping", get(ping))
        .route("/node", get(node))
        .route("/join/:addr", get(join))
        .route("/bye/:addr", get(bye))
        .route("/have/:topic", get(have))
        .route("/head/:topic/*range", get(head))
        .route("/get/:topic/*range", get(get_records))
        .route("/update/:topic/:stamp/:id/:teller", get(update))
        .route("/recent/*range", get(recent))
        .with_state(engine);
    Router::new().nest(&path, inner)
}

/// Serve the protocol on the given listener until the process exits.
pub async fn serve(engine: Arc<BbsEngine>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
    let app = router(engine);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

/// `PONG` plus the IP we observed the caller from, which is how a peer
/// behind NAT learns its own address.
async fn ping(ConnectInfo(addr): ConnectInfo<SocketAddr>) -> String {
    format!("PONG\n{}\n", addr.ip())
}

/// One random known peer
async fn node(State(engine): State<Arc<BbsEngine>>) -> String {
    match engine.registry.random(&[], 1).first() {
        Some(node) => format!("{}\n", node.to_wire()),
        None => String::new(),
    }
}

/// Admit a joiner after a ping-back, or point a full list at another peer.
async fn join(State(engine): State<Arc<BbsEngine>>, Path(addr): Path<String>) -> String {
    let Ok(node) = NodeAddr::parse(&addr) else {
        return String::new();
    };
    if !engine.registry.accepts(&node) {
        debug!(%node, "Join refused by filter");
        return String::new();
    }
    // The joiner must be reachable from our side before we vouch for it
    if engine.client().ping(&node).await.is_err() {
        debug!(%node, "Join ping-back failed");
        return String::new();
    }
    if engine.registry.global().contains(&node) {
        return "WELCOME\n".to_string();
    }
    if engine.registry.is_full("") {
        // Full: welcome without adding, suggesting a peer with room
        return match engine.registry.random(&[node], 1).first() {
            Some(other) => format!("WELCOME\n{}\n", other.to_wire()),
            None => "WELCOME\n".to_string(),
        };
    }
    if engine.registry.append("", &node) {
        "WELCOME\n".to_string()
    } else {
        String::new()
    }
}

/// Drop the caller from the global list
async fn bye(State(engine): State<Arc<BbsEngine>>, Path(addr): Path<String>) -> String {
    if let Ok(node) = NodeAddr::parse(&addr) {
        engine.registry.remove("", &node);
    }
    "BYEBYE\n".to_string()
}

/// Whether we hold any records of a topic
async fn have(State(engine): State<Arc<BbsEngine>>, Path(topic): Path<String>) -> String {
    match engine.stats(&topic) {
        Some(stats) if stats.count > 0 => "YES\n".to_string(),
        _ => "NO\n".to_string(),
    }
}

/// Heads of a topic inside a range, `stamp<>id` per line
async fn head(
    State(engine): State<Arc<BbsEngine>>,
    Path((topic, range)): Path<(String, String)>,
) -> String {
    let Ok(range) = Range::parse(&range) else {
        return String::new();
    };
    let Some(cache) = engine.store.get(&topic) else {
        return String::new();
    };
    let mut out = String::new();
    for h in cache.read().heads_in(&range) {
        out.push_str(&h.to_wire());
        out.push('\n');
    }
    out
}

/// Full records inside a range. Serving an exact selector confirms any
/// broadcast of that record still waiting for a fetch.
async fn get_records(
    State(engine): State<Arc<BbsEngine>>,
    Path((topic, range)): Path<(String, String)>,
) -> String {
    let Ok(range) = Range::parse(&range) else {
        return String::new();
    };
    let records = engine.list_records(&topic, &range);
    if let Range::Exact { stamp, id } = &range {
        if !records.is_empty() {
            engine.updates.confirm(&Head::new(topic.clone(), *stamp, id.clone()));
        }
    }
    let mut out = String::new();
    for r in records {
        out.push_str(&r.to_wire());
        out.push('\n');
    }
    out
}

/// Accept an update notice; processing happens off the request path so
/// the teller is never blocked on our fetch.
async fn update(
    State(engine): State<Arc<BbsEngine>>,
    Path((topic, stamp, id, teller)): Path<(String, String, String, String)>,
) -> String {
    let Ok(stamp) = stamp.parse::<i64>() else {
        return String::new();
    };
    if topic.is_empty() || id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return String::new();
    }
    let Ok(teller) = NodeAddr::parse(&teller) else {
        return String::new();
    };
    let head = Head::new(topic, stamp, id);
    tokio::spawn(async move { engine.handle_update(head, teller).await });
    "OK\n".to_string()
}

/// Recently-seen heads, each with this node's suggested tags as hints
async fn recent(State(engine): State<Arc<BbsEngine>>, Path(range): Path<String>) -> String {
    let Ok(range) = Range::parse(&range) else {
        return String::new();
    };
    let mut out = String::new();
    for h in engine.recent.heads_in(&range) {
        let tags: Vec<String> = engine
            .suggest
            .get(&h.topic)
            .into_iter()
            .map(|t| t.text)
            .collect();
        let entry = crate::client::RecentEntry { head: h, tags };
        out.push_str(&entry.to_wire());
        out.push('\n');
    }
    out
}
