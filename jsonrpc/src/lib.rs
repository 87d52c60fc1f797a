//! json-rpc 2.0 client multiplexed over a single persistent websocket
//! connection as described in spec: https://www.jsonrpc.org/specification.
//!
//! The appliance speaks json-rpc on `wss://<host>/websocket`. One
//! authenticated session carries every request of the process, so the client
//! is built around a supervisor task that owns the socket:
//!
//!   * callers hand it requests through a queue (single sender path),
//!   * replies are demultiplexed back through per-request oneshot channels
//!     keyed by the monotonic request id,
//!   * a ping is sent every 30s and a 120s read deadline is enforced (the
//!     appliance never pings on its own, it only pongs),
//!   * on any I/O error the session is torn down, every outstanding request
//!     fails with `ConnectionLost` and the supervisor re-dials with bounded
//!     exponential backoff.
//!
//! In-flight calls are never retried here. Callers are expected to be
//! idempotent and retry at a higher level once `healthy()` is true again.

#[macro_use]
extern crate tracing;

pub mod error;
#[cfg(test)]
mod test;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_tungstenite::{tungstenite::Message, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

pub use crate::error::Error;
use crate::error::{EncodeRequestSnafu, EndpointSnafu, TlsSnafu, WsSnafu};

/// Interval at which websocket pings are sent.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Read deadline on the socket, 4x the ping interval. Three missed pongs
/// therefore force a reconnect.
pub const READ_DEADLINE: Duration = Duration::from_secs(120);
/// Cap on the reconnect backoff.
pub const RECONNECT_CAP: Duration = Duration::from_secs(30);
/// How long to wait for the login reply before giving up on a dial attempt.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
/// A JSONRPC request object
pub struct Request<'a> {
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: &'a str,
    /// Identifier for this Request, which should appear in the response
    pub id: u64,
    /// The name of the RPC call
    pub method: &'a str,
    /// Parameters to the RPC call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize)]
/// A JSONRPC response object
pub struct Response {
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: Option<String>,
    /// Identifier matching a request, absent for server-pushed events
    #[serde(default)]
    pub id: Option<Value>,
    /// A result if there is one, or null
    #[serde(default)]
    pub result: Option<Value>,
    /// An error if there is one, or null
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A JSONRPC error object
pub struct RpcError {
    /// The integer identifier of the error
    pub code: i64,
    /// A string describing the error
    pub message: String,
    /// Additional data specific to the error
    #[serde(default)]
    pub data: Option<Value>,
}

/// Connection parameters, immutable for the life of the client.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Full websocket endpoint, e.g. `wss://nas.example.com/websocket`.
    pub url: Url,
    /// API key passed to `auth.login_with_api_key` on every (re)connect.
    pub api_key: String,
    /// Skip TLS certificate verification (self-signed appliances).
    pub accept_invalid_certs: bool,
}

impl RpcClientConfig {
    /// Standard configuration for an appliance reachable at `host`.
    pub fn new(host: &str, api_key: &str) -> Result<Self, Error> {
        let endpoint = format!("wss://{host}/websocket");
        let url = Url::parse(&endpoint).context(EndpointSnafu {
            endpoint: endpoint.clone(),
        })?;
        Ok(RpcClientConfig {
            url,
            api_key: api_key.to_string(),
            accept_invalid_certs: false,
        })
    }
}

struct Outbound {
    method: String,
    params: Option<Value>,
    reply: oneshot::Sender<Result<Value, Error>>,
}

/// Handle to the shared websocket session. Cheap to clone; all clones feed
/// the same supervisor task.
#[derive(Clone)]
pub struct RpcClient {
    tx: mpsc::Sender<Outbound>,
    healthy: Arc<AtomicBool>,
    endpoint: Arc<String>,
}

impl RpcClient {
    /// Dial the appliance, authenticate, and spawn the supervisor task.
    /// Fails if the first dial or login does not succeed; reconnection after
    /// that is automatic.
    pub async fn connect(config: RpcClientConfig) -> Result<Self, Error> {
        let endpoint = config.url.to_string();
        let mut ws = dial(&config).await?;
        login(&mut ws, &config).await?;
        info!("authenticated json-rpc session established with {}", endpoint);

        let (tx, rx) = mpsc::channel(64);
        let healthy = Arc::new(AtomicBool::new(true));
        let supervisor = Supervisor {
            config,
            rx,
            healthy: healthy.clone(),
            next_id: 1,
        };
        tokio::spawn(supervisor.run(ws));

        Ok(RpcClient {
            tx,
            healthy,
            endpoint: Arc::new(endpoint),
        })
    }

    /// Issue a json-rpc call and await its correlated reply. Dropping the
    /// returned future abandons the call; its id slot is reaped when the
    /// reply (if any) arrives.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let (reply, rx) = oneshot::channel();
        let outbound = Outbound {
            method: method.to_string(),
            params,
            reply,
        };
        self.tx
            .send(outbound)
            .await
            .map_err(|_| self.connection_lost())?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.connection_lost()),
        }
    }

    /// Whether an authenticated session is currently established.
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn connection_lost(&self) -> Error {
        Error::ConnectionLost {
            endpoint: self.endpoint.as_ref().clone(),
        }
    }
}

enum ServeExit {
    /// The socket failed or timed out; reconnect.
    Lost,
    /// Every client handle is gone; stop the supervisor.
    Shutdown,
}

struct Supervisor {
    config: RpcClientConfig,
    rx: mpsc::Receiver<Outbound>,
    healthy: Arc<AtomicBool>,
    next_id: u64,
}

impl Supervisor {
    async fn run(mut self, ws: WsStream) {
        let mut session = Some(ws);
        loop {
            let ws = match session.take() {
                Some(ws) => ws,
                None => match self.reconnect().await {
                    Some(ws) => ws,
                    None => return,
                },
            };
            self.healthy.store(true, Ordering::Relaxed);
            let exit = self.serve(ws).await;
            self.healthy.store(false, Ordering::Relaxed);
            match exit {
                ServeExit::Shutdown => return,
                ServeExit::Lost => {
                    warn!(
                        "json-rpc session with {} lost, reconnecting",
                        self.config.url
                    );
                }
            }
        }
    }

    /// Serve one established session until it fails. Outstanding requests
    /// are failed with `ConnectionLost` on the way out.
    async fn serve(&mut self, mut ws: WsStream) -> ServeExit {
        let mut pending: HashMap<u64, oneshot::Sender<Result<Value, Error>>> = HashMap::new();
        let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();

        let exit = loop {
            tokio::select! {
                outbound = self.rx.recv() => match outbound {
                    Some(out) => {
                        let id = self.next_id;
                        self.next_id += 1;
                        let frame = match encode(id, &out.method, out.params) {
                            Ok(frame) => frame,
                            Err(error) => {
                                let _ = out.reply.send(Err(error));
                                continue;
                            }
                        };
                        trace!("-> [{}] {}", id, out.method);
                        if let Err(error) = ws.send(Message::Text(frame)).await {
                            warn!("websocket send failed: {}", error);
                            let _ = out.reply.send(Err(self.connection_lost()));
                            break ServeExit::Lost;
                        }
                        pending.insert(id, out.reply);
                    }
                    None => break ServeExit::Shutdown,
                },
                frame = ws.next() => match frame {
                    Some(Ok(message)) => {
                        last_frame = Instant::now();
                        match message {
                            Message::Text(text) => dispatch(&text, &mut pending),
                            Message::Close(_) => break ServeExit::Lost,
                            // Pongs only refresh the read deadline. The
                            // appliance never pings us.
                            _ => {}
                        }
                    }
                    Some(Err(error)) => {
                        warn!("websocket read failed: {}", error);
                        break ServeExit::Lost;
                    }
                    None => break ServeExit::Lost,
                },
                _ = ping.tick() => {
                    if let Err(error) = ws.send(Message::Ping(Vec::new())).await {
                        warn!("websocket ping failed: {}", error);
                        break ServeExit::Lost;
                    }
                }
                _ = tokio::time::sleep_until(last_frame + READ_DEADLINE) => {
                    warn!(
                        "no frame from {} within {:?}, forcing reconnect",
                        self.config.url, READ_DEADLINE
                    );
                    break ServeExit::Lost;
                }
            }
        };

        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(self.connection_lost()));
        }
        exit
    }

    /// Bounded exponential backoff redial loop. Requests arriving while the
    /// session is down fail immediately with a transport error so callers
    /// can apply their own retry policy.
    async fn reconnect(&mut self) -> Option<WsStream> {
        let mut attempt: u32 = 0;
        loop {
            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!("reconnect attempt {} in {:?}", attempt, delay);

            let wake = tokio::time::sleep(delay);
            tokio::pin!(wake);
            loop {
                tokio::select! {
                    _ = &mut wake => break,
                    outbound = self.rx.recv() => match outbound {
                        Some(out) => {
                            let _ = out.reply.send(Err(self.connection_lost()));
                        }
                        None => return None,
                    },
                }
            }

            match dial(&self.config).await {
                Ok(mut ws) => match login(&mut ws, &self.config).await {
                    Ok(()) => {
                        info!("re-established json-rpc session with {}", self.config.url);
                        return Some(ws);
                    }
                    Err(error) => error!("re-authentication failed: {}", error),
                },
                Err(error) => warn!("reconnect dial failed: {}", error),
            }
        }
    }

    fn connection_lost(&self) -> Error {
        Error::ConnectionLost {
            endpoint: self.config.url.to_string(),
        }
    }
}

fn encode(id: u64, method: &str, params: Option<Value>) -> Result<String, Error> {
    let request = Request {
        jsonrpc: "2.0",
        id,
        method,
        params,
    };
    serde_json::to_string(&request).context(EncodeRequestSnafu)
}

/// Route one inbound text frame to its caller. Frames without a numeric id
/// are server-pushed events and are ignored; replies to abandoned calls are
/// dropped, reaping their id slot.
fn dispatch(text: &str, pending: &mut HashMap<u64, oneshot::Sender<Result<Value, Error>>>) {
    let response: Response = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(error) => {
            warn!("discarding malformed json-rpc frame: {}", error);
            return;
        }
    };
    if let Some(version) = &response.jsonrpc {
        if version != "2.0" {
            warn!("discarding reply with json-rpc version {:?}", version);
            return;
        }
    }
    let id = match response.id.as_ref().and_then(Value::as_u64) {
        Some(id) => id,
        None => {
            trace!("ignoring server event frame");
            return;
        }
    };
    let reply = match pending.remove(&id) {
        Some(reply) => reply,
        None => {
            trace!("reply for abandoned or unknown request id {}", id);
            return;
        }
    };
    let outcome = match response.error {
        Some(error) => Err(Error::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    trace!("<- [{}]", id);
    let _ = reply.send(outcome);
}

async fn dial(config: &RpcClientConfig) -> Result<WsStream, Error> {
    let connector = if config.url.scheme() == "wss" {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context(TlsSnafu)?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };
    let (ws, _) = tokio_tungstenite::connect_async_tls_with_config(
        config.url.as_str(),
        None,
        false,
        connector,
    )
    .await
    .context(WsSnafu)?;
    Ok(ws)
}

/// Perform `auth.login_with_api_key` on a fresh socket. The appliance may
/// interleave event frames before the reply, so read until the login id
/// comes back or the timeout fires.
async fn login(ws: &mut WsStream, config: &RpcClientConfig) -> Result<(), Error> {
    let frame = encode(
        0,
        "auth.login_with_api_key",
        Some(Value::Array(vec![Value::String(config.api_key.clone())])),
    )?;
    ws.send(Message::Text(frame)).await.context(WsSnafu)?;

    let deadline = Instant::now() + LOGIN_TIMEOUT;
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| Error::LoginTimeout {
                endpoint: config.url.to_string(),
            })?;
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(error)) => return Err(Error::Ws { source: error }),
            None => {
                return Err(Error::ConnectionLost {
                    endpoint: config.url.to_string(),
                })
            }
        };
        let text = match message {
            Message::Text(text) => text,
            _ => continue,
        };
        let response: Response = match serde_json::from_str(&text) {
            Ok(response) => response,
            Err(_) => continue,
        };
        if response.id.as_ref().and_then(Value::as_u64) != Some(0) {
            continue;
        }
        if response.error.is_some() || response.result != Some(Value::Bool(true)) {
            return Err(Error::LoginFailed {
                endpoint: config.url.to_string(),
            });
        }
        return Ok(());
    }
}

/// Delay before reconnect attempt `attempt`: 1s, 2s, 4s, ... capped at 30s,
/// with up to 250ms of jitter so a fleet of plugins does not redial in sync.
fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << attempt.min(5));
    let base = base.min(RECONNECT_CAP);
    let jitter = rand::thread_rng().gen_range(0..250);
    base + Duration::from_millis(jitter)
}
