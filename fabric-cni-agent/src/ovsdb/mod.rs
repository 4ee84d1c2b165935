//! Minimal OVSDB JSON-RPC client (RFC 7047) over a Unix domain socket.
//!
//! One persistent connection is shared by all callers; a background task
//! owns the stream, matches replies to requests by id and answers the
//! server's `echo` keepalives. Typed bridge operations live in
//! [`bridge`].

pub mod bridge;
#[cfg(test)]
pub mod testing;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub const DEFAULT_OVSDB_SOCKET: &str = "/run/openvswitch/db.sock";

const OPENVSWITCH_SCHEMA: &str = "Open_vSwitch";
const MAX_DIAL_BACKOFF: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvsdbErrorKind {
    /// The operation may succeed if retried: transport failures, commit
    /// conflicts, timeouts.
    Transient,
    /// Retrying will not help: schema violations, malformed replies.
    Permanent,
    /// A row the caller asserted present does not exist.
    NotFound,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct OvsdbError {
    pub kind: OvsdbErrorKind,
    pub message: String,
}

impl OvsdbError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: OvsdbErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: OvsdbErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: OvsdbErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == OvsdbErrorKind::Transient
    }
}

/// Handle to the shared OVSDB connection. Cheap to clone.
#[derive(Clone)]
pub struct OvsdbConnection {
    tx: mpsc::UnboundedSender<Pending>,
}

struct Pending {
    ops: Vec<Value>,
    resp: oneshot::Sender<Result<Value, OvsdbError>>,
}

impl OvsdbConnection {
    /// Connects to the OVSDB Unix socket, retrying forever. Progress is
    /// logged with exponential backoff capped at 8 s between messages;
    /// the daemon never starts without a reachable OVSDB.
    pub async fn dial(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        info!("connecting to OVSDB at {}", path.display());
        let mut backoff = Duration::from_secs(1);
        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(e) => {
                    info!("not connected yet ({e}), will try again in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_DIAL_BACKOFF);
                }
            }
        };
        info!("connected to OVSDB");
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(stream, rx));
        Self { tx }
    }

    /// Commits a transaction and fails on the first operation error.
    /// Partial application on commit failure is the server's concern; no
    /// compensating writes are issued here.
    pub async fn transact(&self, ops: Vec<Value>) -> Result<Vec<Value>, OvsdbError> {
        let results = self.transact_raw(ops).await?;
        for member in &results {
            if let Some(err) = operation_error(member) {
                return Err(err);
            }
        }
        Ok(results)
    }

    /// Commits a transaction and returns the per-operation results
    /// without inspecting them. Callers that tolerate individual
    /// operation errors (e.g. a `wait` timeout) use this directly.
    pub async fn transact_raw(&self, ops: Vec<Value>) -> Result<Vec<Value>, OvsdbError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Pending {
                ops,
                resp: resp_tx,
            })
            .map_err(|_| OvsdbError::transient("OVSDB connection closed"))?;
        let result = resp_rx
            .await
            .map_err(|_| OvsdbError::transient("OVSDB connection closed"))??;
        match result {
            Value::Array(members) => Ok(members),
            other => Err(OvsdbError::permanent(format!(
                "malformed transact reply: {other}"
            ))),
        }
    }
}

/// Maps an operation result member to an error, if it carries one.
pub(crate) fn operation_error(member: &Value) -> Option<OvsdbError> {
    let err = member.get("error")?.as_str()?;
    let details = member.get("details").and_then(Value::as_str).unwrap_or("");
    let message = if details.is_empty() {
        format!("OVSDB operation failed: {err}")
    } else {
        format!("OVSDB operation failed: {err} ({details})")
    };
    // RFC 7047 marks these as the retriable commit failures.
    let kind = match err {
        "timed out" | "resources exhausted" | "I/O error" => OvsdbErrorKind::Transient,
        _ => OvsdbErrorKind::Permanent,
    };
    Some(OvsdbError { kind, message })
}

pub(crate) fn is_wait_timeout(member: &Value) -> bool {
    member.get("error").and_then(Value::as_str) == Some("timed out")
}

async fn run_connection(stream: UnixStream, mut rx: mpsc::UnboundedReceiver<Pending>) {
    let (mut reader, mut writer) = stream.into_split();
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value, OvsdbError>>> = HashMap::new();
    let mut next_id: u64 = 0;
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        tokio::select! {
            req = rx.recv() => {
                let Some(req) = req else {
                    // Every handle dropped; nothing left to serve.
                    return;
                };
                let id = next_id;
                next_id += 1;
                let mut params = vec![Value::String(OPENVSWITCH_SCHEMA.to_owned())];
                params.extend(req.ops);
                let message = json!({"method": "transact", "params": params, "id": id});
                if let Err(e) = write_message(&mut writer, &message).await {
                    let _ = req.resp.send(Err(OvsdbError::transient(format!(
                        "failed to send to OVSDB: {e}"
                    ))));
                    fail_pending(&mut pending, OvsdbError::transient("OVSDB connection closed"));
                    return;
                }
                pending.insert(id, req.resp);
            }
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        warn!("OVSDB server closed the connection");
                        fail_pending(&mut pending, OvsdbError::transient("OVSDB connection closed"));
                        return;
                    }
                    Err(e) => {
                        warn!("OVSDB read failed: {e}");
                        fail_pending(&mut pending, OvsdbError::transient(format!("OVSDB read failed: {e}")));
                        return;
                    }
                    Ok(_) => {
                        let messages = match drain_messages(&mut buf) {
                            Ok(messages) => messages,
                            Err(e) => {
                                error!("malformed message from OVSDB server: {e}");
                                fail_pending(&mut pending, OvsdbError::permanent(format!(
                                    "malformed message from OVSDB server: {e}"
                                )));
                                return;
                            }
                        };
                        for message in messages {
                            if let Err(e) = dispatch_message(message, &mut pending, &mut writer).await {
                                warn!("OVSDB write failed: {e}");
                                fail_pending(&mut pending, OvsdbError::transient(format!("OVSDB write failed: {e}")));
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn dispatch_message(
    message: Value,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value, OvsdbError>>>,
    writer: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    if message.get("method").and_then(Value::as_str) == Some("echo") {
        let reply = json!({
            "id": message.get("id").cloned().unwrap_or(Value::Null),
            "result": message.get("params").cloned().unwrap_or_else(|| json!([])),
            "error": Value::Null,
        });
        return write_message(writer, &reply).await;
    }

    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        debug!("ignoring OVSDB message without a request id: {message}");
        return Ok(());
    };
    let Some(resp) = pending.remove(&id) else {
        debug!("reply for unknown request id {id}");
        return Ok(());
    };
    let error = message.get("error").cloned().unwrap_or(Value::Null);
    if !error.is_null() {
        let _ = resp.send(Err(OvsdbError::permanent(format!(
            "OVSDB request failed: {error}"
        ))));
        return Ok(());
    }
    let result = message.get("result").cloned().unwrap_or(Value::Null);
    let _ = resp.send(Ok(result));
    Ok(())
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &Value) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(message)?;
    writer.write_all(&bytes).await
}

/// OVSDB frames are bare JSON values concatenated on the stream; pull
/// out every complete value and leave the tail in the buffer.
fn drain_messages(buf: &mut BytesMut) -> Result<Vec<Value>, serde_json::Error> {
    let mut messages = Vec::new();
    loop {
        let mut iter = serde_json::Deserializer::from_slice(&buf[..]).into_iter::<Value>();
        match iter.next() {
            Some(Ok(value)) => {
                let consumed = iter.byte_offset();
                buf.advance(consumed);
                messages.push(value);
            }
            Some(Err(e)) if e.is_eof() => break,
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(messages)
}

fn fail_pending(
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value, OvsdbError>>>,
    error: OvsdbError,
) {
    for (_, resp) in pending.drain() {
        let _ = resp.send(Err(error.clone()));
    }
}

// Column value encoding helpers. OVSDB wraps composite values in
// tagged arrays: ["set", [..]], ["map", [[k, v], ..]], ["uuid", id],
// ["named-uuid", name].

pub(crate) fn ovsdb_set(items: Vec<Value>) -> Value {
    json!(["set", items])
}

pub(crate) fn ovsdb_string_set(items: &[String]) -> Value {
    ovsdb_set(items.iter().map(|s| json!(s)).collect())
}

pub(crate) fn ovsdb_uuid_set(uuids: &[String]) -> Value {
    ovsdb_set(uuids.iter().map(|u| json!(["uuid", u])).collect())
}

pub(crate) fn ovsdb_named_uuid_set(names: &[&str]) -> Value {
    ovsdb_set(names.iter().map(|n| json!(["named-uuid", n])).collect())
}

pub(crate) fn ovsdb_map<'a, I>(pairs: I) -> Value
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut pairs: Vec<(&String, &String)> = pairs.into_iter().collect();
    pairs.sort();
    let pairs: Vec<Value> = pairs.into_iter().map(|(k, v)| json!([k, v])).collect();
    json!(["map", pairs])
}

/// Decodes `["map", [[k, v], ..]]` into a string map. Anything else
/// yields an empty map.
pub(crate) fn map_from_ovsdb(value: &Value) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(items) = value.as_array() else {
        return out;
    };
    if items.first().and_then(Value::as_str) != Some("map") {
        return out;
    }
    let Some(pairs) = items.get(1).and_then(Value::as_array) else {
        return out;
    };
    for pair in pairs {
        if let (Some(k), Some(v)) = (
            pair.get(0).and_then(Value::as_str),
            pair.get(1).and_then(Value::as_str),
        ) {
            out.insert(k.to_owned(), v.to_owned());
        }
    }
    out
}

/// Decodes a uuid column that may be a single `["uuid", id]` atom or a
/// `["set", [...]]` of them.
pub(crate) fn uuid_list_from_ovsdb(value: &Value) -> Vec<String> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    match items.first().and_then(Value::as_str) {
        Some("uuid") => items
            .get(1)
            .and_then(Value::as_str)
            .map(|u| vec![u.to_owned()])
            .unwrap_or_default(),
        Some("set") => items
            .get(1)
            .and_then(Value::as_array)
            .map(|atoms| atoms.iter().filter_map(uuid_from_ovsdb).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

pub(crate) fn uuid_from_ovsdb(value: &Value) -> Option<String> {
    let items = value.as_array()?;
    if items.first().and_then(Value::as_str) != Some("uuid") {
        return None;
    }
    items.get(1).and_then(Value::as_str).map(str::to_owned)
}
