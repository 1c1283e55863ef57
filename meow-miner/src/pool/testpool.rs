//! Scriptable in-process stratum pool for tests.
//!
//! Speaks just enough line JSON-RPC to exercise the client state machines:
//! dialect negotiation, authorization, job notification, and submission
//! acknowledgement. Behavior is fixed per instance by a [`PoolScript`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// How submissions are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitReply {
    Accept,
    AcceptStale,
    Reject,
    Silent,
}

/// Fixed behavior of one mock pool.
#[derive(Debug, Clone)]
pub struct PoolScript {
    /// Accept `mining.subscribe` advertising EthereumStratum/2.0.0.
    pub accept_v2: bool,
    /// Accept `mining.subscribe` advertising EthereumStratum/1.0.0.
    pub accept_v1: bool,
    /// Accept `eth_submitLogin`.
    pub accept_proxy: bool,
    /// Refuse `mining.authorize` with an error reply.
    pub reject_auth: bool,
    /// Stop answering anything once the subscribe reply went out.
    pub mute_after_subscribe: bool,
    /// Extranonce returned in the 1.0.0 subscribe result.
    pub extranonce: String,
    /// `mining.notify` params pushed right after authorization.
    pub notify: Option<Value>,
    /// A second notify pushed the given number of milliseconds after
    /// authorization.
    pub later_notify: Option<(u64, Value)>,
    pub submit_reply: SubmitReply,
}

impl Default for PoolScript {
    fn default() -> Self {
        Self {
            accept_v2: false,
            accept_v1: true,
            accept_proxy: false,
            reject_auth: false,
            mute_after_subscribe: false,
            extranonce: String::new(),
            notify: None,
            later_notify: None,
            submit_reply: SubmitReply::Accept,
        }
    }
}

/// A `mining.notify` params array in the EthereumStratum/1.0.0 shape used
/// by [`PoolScript::notify`].
pub fn notify_params(job: &str, header_hex: &str, seed_hex: &str, block: u64) -> Value {
    json!([
        job,
        seed_hex,
        header_hex,
        format!("{:#x}", block),
        true,
        "0x00ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
    ])
}

pub struct MockPool {
    pub addr: SocketAddr,
    /// Every submission params array received, any dialect.
    pub submits: Arc<Mutex<Vec<Value>>>,
    /// Number of accepted TCP connections.
    pub connections: Arc<AtomicU32>,
}

impl MockPool {
    pub async fn spawn(script: PoolScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let submits = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicU32::new(0));

        let task_submits = Arc::clone(&submits);
        let task_connections = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                task_connections.fetch_add(1, Ordering::SeqCst);
                let script = script.clone();
                let submits = Arc::clone(&task_submits);
                tokio::spawn(handle_connection(stream, script, submits));
            }
        });

        Self {
            addr,
            submits,
            connections,
        }
    }

    /// Connection string for this pool.
    pub fn uri(&self, user: &str) -> String {
        format!("stratum+tcp://{}@{}:{}", user, self.addr.ip(), self.addr.port())
    }

    pub fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }
}

async fn handle_connection(stream: TcpStream, script: PoolScript, submits: Arc<Mutex<Vec<Value>>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut muted = false;
    let mut delayed_push: Option<(tokio::time::Instant, Value)> = None;

    loop {
        let mut line = String::new();
        let n = tokio::select! {
            read = reader.read_line(&mut line) => read,
            _ = async {
                match delayed_push.as_ref() {
                    Some((at, _)) => tokio::time::sleep_until(*at).await,
                    None => std::future::pending().await,
                }
            } => {
                let (_, notify) = delayed_push.take().unwrap();
                let push = json!({"id": null, "method": "mining.notify", "params": notify});
                let mut line = push.to_string();
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
                continue;
            }
        };
        match n {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let message: Value = match serde_json::from_str(line.trim()) {
            Ok(message) => message,
            Err(_) => continue,
        };
        if muted {
            continue;
        }

        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let method = message
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let mut replies: Vec<Value> = Vec::new();
        match method.as_str() {
            "mining.subscribe" => {
                let protocol = params
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let accepted = (protocol == "EthereumStratum/2.0.0" && script.accept_v2)
                    || (protocol == "EthereumStratum/1.0.0" && script.accept_v1);
                if accepted {
                    let result = if protocol == "EthereumStratum/1.0.0" {
                        json!([["mining.notify", "s-1", protocol], script.extranonce])
                    } else {
                        json!([protocol])
                    };
                    replies.push(json!({"id": id, "result": result, "error": null}));
                } else {
                    replies.push(json!({
                        "id": id,
                        "result": null,
                        "error": [20, "unsupported subscription", null],
                    }));
                }
                if script.mute_after_subscribe {
                    muted = true;
                }
            }

            "mining.authorize" => {
                if script.reject_auth {
                    replies.push(json!({
                        "id": id,
                        "result": null,
                        "error": [24, "unauthorized worker", null],
                    }));
                } else {
                    replies.push(json!({"id": id, "result": true, "error": null}));
                    if let Some(notify) = &script.notify {
                        replies.push(json!({
                            "id": null,
                            "method": "mining.notify",
                            "params": notify,
                        }));
                    }
                    if let Some((delay_ms, notify)) = &script.later_notify {
                        delayed_push = Some((
                            tokio::time::Instant::now()
                                + std::time::Duration::from_millis(*delay_ms),
                            notify.clone(),
                        ));
                    }
                }
            }

            "eth_submitLogin" => {
                if script.accept_proxy {
                    replies.push(json!({"id": id, "result": true, "error": null}));
                } else {
                    replies.push(json!({
                        "id": id,
                        "result": null,
                        "error": [20, "unknown method", null],
                    }));
                }
            }

            "mining.submit" | "eth_submitWork" => {
                submits.lock().unwrap().push(params.clone());
                match script.submit_reply {
                    SubmitReply::Accept => {
                        replies.push(json!({"id": id, "result": true, "error": null}))
                    }
                    SubmitReply::AcceptStale => replies.push(json!({
                        "id": id,
                        "result": true,
                        "error": null,
                        "data": "stale share",
                    })),
                    SubmitReply::Reject => replies.push(json!({
                        "id": id,
                        "result": false,
                        "error": [23, "invalid share", null],
                    })),
                    SubmitReply::Silent => {}
                }
            }

            "mining.submit_hashrate" | "eth_submitHashrate" => {
                replies.push(json!({"id": id, "result": true, "error": null}));
            }

            _ => {
                replies.push(json!({"id": id, "result": null, "error": null}));
            }
        }

        for reply in replies {
            let mut line = reply.to_string();
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
