//! Test helpers: an in-process mock cluster.
//!
//! Spawns N RESP listeners that share one programmable topology view and
//! one key-value store. Each node answers `CLUSTER SLOTS` from the shared
//! view and emits `MOVED` for keys whose slot it doesn't own, so slot
//! moves at runtime exercise the client's refresh machinery exactly like
//! a live resharding. Fault injection queues canned error replies per
//! node, and per-verb hit counters let tests assert attempt counts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use shoal_cluster::{key_slot, script_sha, ClusterConfig, SLOT_COUNT};
use shoal_pool::NodeAddr;
use shoal_protocol::{parse_frame, Frame};

/// Shared key-value state. One store backs every node so a slot move
/// doesn't need data migration — ownership is purely a routing concern
/// here, which is all the client under test can observe.
#[derive(Default)]
struct StoreInner {
    kv: HashMap<Vec<u8>, Bytes>,
    hashes: HashMap<Vec<u8>, HashMap<Vec<u8>, Bytes>>,
    /// Per-key write counters backing the mock WATCH implementation.
    versions: HashMap<Vec<u8>, u64>,
    scripts: HashSet<String>,
}

impl StoreInner {
    fn version_of(&self, key: &[u8]) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: &[u8]) {
        *self.versions.entry(key.to_vec()).or_insert(0) += 1;
    }
}

/// Per-connection protocol state.
#[derive(Default)]
struct ConnState {
    authed: bool,
    in_multi: bool,
    aborted: bool,
    queued: Vec<Vec<Bytes>>,
    watched: Vec<(Vec<u8>, u64)>,
}

/// One mock cluster node.
pub struct MockNode {
    idx: usize,
    password: Option<String>,
    store: Arc<Mutex<StoreInner>>,
    view: Arc<Mutex<Vec<usize>>>,
    addrs: Arc<Vec<NodeAddr>>,
    fail_queue: Mutex<VecDeque<Frame>>,
    hits: Mutex<HashMap<String, usize>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// An in-process cluster of mock nodes with a programmable slot view.
pub struct TestCluster {
    pub nodes: Vec<Arc<MockNode>>,
    view: Arc<Mutex<Vec<usize>>>,
    addrs: Arc<Vec<NodeAddr>>,
    store: Arc<Mutex<StoreInner>>,
    password: Option<String>,
}

impl TestCluster {
    /// Starts `n` nodes with the slot space split contiguously between
    /// them.
    pub async fn start(n: usize) -> Self {
        Self::start_with(n, None).await
    }

    /// Starts `n` nodes requiring the given password.
    pub async fn start_with(n: usize, password: Option<String>) -> Self {
        assert!(n > 0);

        let mut listeners = Vec::with_capacity(n);
        let mut addrs = Vec::with_capacity(n);
        for _ in 0..n {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            addrs.push(NodeAddr::new("127.0.0.1", port));
            listeners.push(listener);
        }
        let addrs = Arc::new(addrs);

        // contiguous even split of the slot space
        let per_node = SLOT_COUNT as usize / n;
        let view: Vec<usize> = (0..SLOT_COUNT as usize)
            .map(|slot| (slot / per_node).min(n - 1))
            .collect();
        let view = Arc::new(Mutex::new(view));

        let store = Arc::new(Mutex::new(StoreInner::default()));

        let mut nodes = Vec::with_capacity(n);
        for (idx, listener) in listeners.into_iter().enumerate() {
            let node = Arc::new(MockNode {
                idx,
                password: password.clone(),
                store: Arc::clone(&store),
                view: Arc::clone(&view),
                addrs: Arc::clone(&addrs),
                fail_queue: Mutex::new(VecDeque::new()),
                hits: Mutex::new(HashMap::new()),
                accept_task: Mutex::new(None),
            });

            let accepting = Arc::clone(&node);
            let task = tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    let node = Arc::clone(&accepting);
                    tokio::spawn(handle_conn(node, socket));
                }
            });
            *node.accept_task.lock().unwrap() = Some(task);
            nodes.push(node);
        }

        Self {
            nodes,
            view,
            addrs,
            store,
            password,
        }
    }

    /// Node addresses, in index order.
    pub fn addrs(&self) -> Vec<NodeAddr> {
        self.addrs.to_vec()
    }

    /// A client config pointing at every node, tuned for fast tests.
    pub fn config(&self, name: &str) -> ClusterConfig {
        let mut config = ClusterConfig::new(name, self.addrs());
        config.password = self.password.clone();
        config.retry_delay = Duration::from_millis(5);
        config.checkout_timeout = Duration::from_millis(500);
        config
    }

    /// Which node currently owns the slot of `key`.
    pub fn owner_of(&self, key: &[u8]) -> usize {
        self.view.lock().unwrap()[key_slot(key) as usize]
    }

    /// Reassigns the slot of `key` to another node. Existing data stays
    /// visible — the shared store makes the move purely topological.
    pub fn move_key(&self, key: &[u8], to: usize) {
        assert!(to < self.nodes.len());
        self.view.lock().unwrap()[key_slot(key) as usize] = to;
    }

    /// Queues `count` canned error replies on a node. They are consumed
    /// by data commands (never by `CLUSTER SLOTS` or `AUTH`), one per
    /// command, before normal handling resumes.
    pub fn fail_next(&self, node: usize, count: usize, error: &str) {
        let mut queue = self.nodes[node].fail_queue.lock().unwrap();
        for _ in 0..count {
            queue.push_back(Frame::Error(error.to_owned()));
        }
    }

    /// How many times a node has seen a verb (case-insensitive),
    /// including commands answered by the fail queue.
    pub fn hits(&self, node: usize, verb: &str) -> usize {
        self.nodes[node]
            .hits
            .lock()
            .unwrap()
            .get(&verb.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }

    /// Bumps a key's write version without changing its value, as if a
    /// competing client wrote it. Any transaction watching the key will
    /// see its `EXEC` return null.
    pub fn touch(&self, key: &[u8]) {
        self.store.lock().unwrap().bump(key);
    }

    /// Stops a node's listener. Established connections stay up; new
    /// connections are refused.
    pub fn stop(&self, node: usize) {
        if let Some(task) = self.nodes[node].accept_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn handle_conn(node: Arc<MockNode>, mut socket: TcpStream) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut conn = ConnState::default();

    loop {
        let frame = loop {
            match parse_frame(&buf) {
                Ok(Some((frame, consumed))) => {
                    let _ = buf.split_to(consumed);
                    break frame;
                }
                Ok(None) => match socket.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                },
                Err(_) => return,
            }
        };

        let Some(tokens) = tokens_of(frame) else {
            return;
        };
        if tokens.is_empty() {
            return;
        }

        let reply = node.handle_command(&tokens, &mut conn);
        let mut out = BytesMut::new();
        reply.serialize(&mut out);
        if socket.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn tokens_of(frame: Frame) -> Option<Vec<Bytes>> {
    let Frame::Array(items) = frame else {
        return None;
    };
    items
        .into_iter()
        .map(|item| match item {
            Frame::Bulk(data) => Some(data),
            _ => None,
        })
        .collect()
}

fn ok() -> Frame {
    Frame::Simple("OK".into())
}

impl MockNode {
    fn handle_command(&self, tokens: &[Bytes], conn: &mut ConnState) -> Frame {
        let verb = String::from_utf8_lossy(&tokens[0]).to_ascii_uppercase();
        *self.hits.lock().unwrap().entry(verb.clone()).or_insert(0) += 1;

        if let Some(expected) = &self.password {
            if verb == "AUTH" {
                return if tokens.get(1).map(|t| t.as_ref()) == Some(expected.as_bytes()) {
                    conn.authed = true;
                    ok()
                } else {
                    Frame::Error("WRONGPASS invalid username-password pair".into())
                };
            }
            if !conn.authed {
                return Frame::Error("NOAUTH Authentication required.".into());
            }
        } else if verb == "AUTH" {
            return Frame::Error("ERR Client sent AUTH, but no password is set.".into());
        }

        // canned failures never swallow topology traffic
        if verb != "CLUSTER" {
            if let Some(frame) = self.fail_queue.lock().unwrap().pop_front() {
                return frame;
            }
        }

        if conn.in_multi && !matches!(verb.as_str(), "EXEC" | "DISCARD") {
            if let Some(moved) = self.moved_check(&verb, tokens) {
                conn.aborted = true;
                return moved;
            }
            conn.queued.push(tokens.to_vec());
            return Frame::Simple("QUEUED".into());
        }

        match verb.as_str() {
            "PING" => Frame::Simple("PONG".into()),
            "CLUSTER" => self.cluster_command(tokens),
            "MULTI" => {
                conn.in_multi = true;
                conn.aborted = false;
                conn.queued.clear();
                ok()
            }
            "EXEC" => self.exec(conn),
            "DISCARD" => {
                conn.in_multi = false;
                conn.aborted = false;
                conn.queued.clear();
                ok()
            }
            "WATCH" => {
                if let Some(moved) = self.moved_check(&verb, tokens) {
                    return moved;
                }
                let Some(key) = tokens.get(1) else {
                    return Frame::Error("ERR wrong number of arguments for 'watch'".into());
                };
                let version = self.store.lock().unwrap().version_of(key);
                conn.watched.push((key.to_vec(), version));
                ok()
            }
            "UNWATCH" => {
                conn.watched.clear();
                ok()
            }
            "SCRIPT" => self.script_command(tokens),
            "EVALSHA" => {
                if let Some(moved) = self.moved_check(&verb, tokens) {
                    return moved;
                }
                self.evalsha(tokens)
            }
            "FLUSHDB" => {
                let mut store = self.store.lock().unwrap();
                store.kv.clear();
                store.hashes.clear();
                ok()
            }
            _ => {
                if let Some(moved) = self.moved_check(&verb, tokens) {
                    return moved;
                }
                let mut store = self.store.lock().unwrap();
                apply_in_store(&mut store, tokens)
            }
        }
    }

    /// Emits `MOVED` when this node doesn't own the slot of the
    /// command's key under the current view.
    fn moved_check(&self, verb: &str, tokens: &[Bytes]) -> Option<Frame> {
        let key = match verb {
            "EVALSHA" | "EVAL" => {
                let numkeys: usize = std::str::from_utf8(tokens.get(2)?).ok()?.parse().ok()?;
                if numkeys == 0 {
                    return None;
                }
                tokens.get(3)?
            }
            "GET" | "SET" | "DEL" | "INCR" | "HGET" | "HSET" | "WATCH" => tokens.get(1)?,
            _ => return None,
        };

        let slot = key_slot(key);
        let owner = self.view.lock().unwrap()[slot as usize];
        if owner == self.idx {
            return None;
        }
        Some(Frame::Error(format!("MOVED {slot} {}", self.addrs[owner])))
    }

    fn cluster_command(&self, tokens: &[Bytes]) -> Frame {
        let is_slots = tokens
            .get(1)
            .is_some_and(|sub| sub.eq_ignore_ascii_case(b"SLOTS"));
        if !is_slots {
            return Frame::Error("ERR unsupported CLUSTER subcommand".into());
        }

        let view = self.view.lock().unwrap();
        let mut entries = Vec::new();
        let mut run_start = 0usize;
        for slot in 1..=view.len() {
            if slot == view.len() || view[slot] != view[run_start] {
                let owner = view[run_start];
                let addr = &self.addrs[owner];
                entries.push(Frame::Array(vec![
                    Frame::Integer(run_start as i64),
                    Frame::Integer((slot - 1) as i64),
                    Frame::Array(vec![
                        Frame::Bulk(Bytes::copy_from_slice(addr.host.as_bytes())),
                        Frame::Integer(addr.port as i64),
                    ]),
                ]));
                run_start = slot;
            }
        }
        Frame::Array(entries)
    }

    fn script_command(&self, tokens: &[Bytes]) -> Frame {
        let is_load = tokens
            .get(1)
            .is_some_and(|sub| sub.eq_ignore_ascii_case(b"LOAD"));
        if !is_load {
            return Frame::Error("ERR unsupported SCRIPT subcommand".into());
        }
        let Some(body) = tokens.get(2) else {
            return Frame::Error("ERR wrong number of arguments for 'script'".into());
        };

        let sha = script_sha(body);
        self.store.lock().unwrap().scripts.insert(sha.clone());
        Frame::Bulk(Bytes::from(sha.into_bytes()))
    }

    /// Known scripts all "evaluate" to 1; the client only cares about
    /// the NOSCRIPT protocol, not script semantics.
    fn evalsha(&self, tokens: &[Bytes]) -> Frame {
        let Some(sha) = tokens.get(1) else {
            return Frame::Error("ERR wrong number of arguments for 'evalsha'".into());
        };
        let sha = String::from_utf8_lossy(sha).to_lowercase();
        if self.store.lock().unwrap().scripts.contains(&sha) {
            Frame::Integer(1)
        } else {
            Frame::Error("NOSCRIPT No matching script. Please use EVAL.".into())
        }
    }

    fn exec(&self, conn: &mut ConnState) -> Frame {
        if !conn.in_multi {
            return Frame::Error("ERR EXEC without MULTI".into());
        }
        conn.in_multi = false;
        let queued = std::mem::take(&mut conn.queued);
        let watched = std::mem::take(&mut conn.watched);

        if conn.aborted {
            conn.aborted = false;
            return Frame::Error(
                "EXECABORT Transaction discarded because of previous errors.".into(),
            );
        }

        // one lock across the check and all writes makes EXEC atomic
        let mut store = self.store.lock().unwrap();
        for (key, version) in &watched {
            if store.version_of(key) != *version {
                return Frame::Null;
            }
        }

        let replies = queued
            .iter()
            .map(|tokens| apply_in_store(&mut store, tokens))
            .collect();
        Frame::Array(replies)
    }
}

/// Data-command dispatch against the locked store.
fn apply_in_store(store: &mut StoreInner, tokens: &[Bytes]) -> Frame {
    let verb = String::from_utf8_lossy(&tokens[0]).to_ascii_uppercase();
    match (verb.as_str(), tokens.len()) {
        ("GET", 2) => match store.kv.get(tokens[1].as_ref()) {
            Some(value) => Frame::Bulk(value.clone()),
            None => Frame::Null,
        },
        ("SET", 3) => {
            store.kv.insert(tokens[1].to_vec(), tokens[2].clone());
            store.bump(&tokens[1]);
            ok()
        }
        ("DEL", 2) => {
            let removed = store.kv.remove(tokens[1].as_ref()).is_some();
            store.bump(&tokens[1]);
            Frame::Integer(removed as i64)
        }
        ("INCR", 2) => {
            let current = match store.kv.get(tokens[1].as_ref()) {
                Some(value) => match std::str::from_utf8(value).ok().and_then(|s| s.parse::<i64>().ok())
                {
                    Some(n) => n,
                    None => {
                        return Frame::Error(
                            "ERR value is not an integer or out of range".into(),
                        )
                    }
                },
                None => 0,
            };
            let next = current + 1;
            store
                .kv
                .insert(tokens[1].to_vec(), Bytes::from(next.to_string().into_bytes()));
            store.bump(&tokens[1]);
            Frame::Integer(next)
        }
        ("HGET", 3) => match store
            .hashes
            .get(tokens[1].as_ref())
            .and_then(|h| h.get(tokens[2].as_ref()))
        {
            Some(value) => Frame::Bulk(value.clone()),
            None => Frame::Null,
        },
        ("HSET", 4) => {
            let new = store
                .hashes
                .entry(tokens[1].to_vec())
                .or_default()
                .insert(tokens[2].to_vec(), tokens[3].clone())
                .is_none();
            store.bump(&tokens[1]);
            Frame::Integer(new as i64)
        }
        _ => Frame::Error(format!("ERR unknown command '{verb}'")),
    }
}
