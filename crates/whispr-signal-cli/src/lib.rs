//! signal-cli adapter.
//!
//! Talks to `signal-cli -a <account> jsonRpc`: one JSON-RPC record per line on
//! stdin/stdout. A background reader task splits stdout into inbound
//! envelopes and send acknowledgments.

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, oneshot, Mutex},
};

use whispr_core::{
    domain::UserId,
    errors::Error,
    messaging::{
        port::Transport,
        types::{Envelope, OutboundMessage},
    },
    utils::{now_millis, truncate_text},
    Result,
};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

type Ack = std::result::Result<(), String>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Ack>>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// [`Transport`] over a signal-cli JSON-RPC channel.
pub struct SignalCliTransport {
    /// Held across write and acknowledgment: at most one send in flight.
    writer: Mutex<Writer>,
    inbound: Mutex<mpsc::UnboundedReceiver<Result<Envelope>>>,
    pending: Pending,
    seq: AtomicU64,
    ack_timeout: Duration,
    stderr_tail: Arc<Mutex<StderrTail>>,
    child: Mutex<Option<Child>>,
}

impl SignalCliTransport {
    /// Spawn `signal-cli -a <account> jsonRpc` and attach to its stdio.
    pub fn spawn(program: &Path, account: &str, ack_timeout: Duration) -> Result<Self> {
        let mut child = Command::new(program)
            .args(["-a", account, "jsonRpc"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("signal-cli stdout was not captured".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External("signal-cli stdin was not captured".to_string()))?;
        let stderr = child.stderr.take();

        let transport = Self::from_io(BufReader::new(stdout), stdin, ack_timeout);

        // Drain stderr in background to avoid blocking on a full pipe.
        if let Some(stderr) = stderr {
            let tail = transport.stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tracing::debug!("signal-cli: {line}");
                    tail.lock().await.push_line(line);
                }
            });
        }

        tracing::info!(program = %program.display(), "signal-cli started");
        Ok(Self {
            child: Mutex::new(Some(child)),
            ..transport
        })
    }

    /// Attach to an already-open line channel (a subprocess, or an in-memory
    /// pipe in tests).
    pub fn from_io<R, W>(reader: R, writer: W, ack_timeout: Duration) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(read_loop(reader, tx, pending.clone()));

        Self {
            writer: Mutex::new(Box::new(writer)),
            inbound: Mutex::new(rx),
            pending,
            seq: AtomicU64::new(0),
            ack_timeout,
            stderr_tail: Arc::new(Mutex::new(StderrTail::default())),
            child: Mutex::new(None),
        }
    }

    /// Recent stderr lines from the subprocess (empty for in-memory channels).
    pub async fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().await.snapshot()
    }

    /// Kill and reap the subprocess, if any.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        // If it's already exited, `try_wait` reaps it.
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        child.kill().await?;
        tracing::info!("signal-cli stopped");
        Ok(())
    }

    fn next_request_id(&self, recipient: &UserId) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{recipient}:{}:{seq}", now_millis())
    }
}

#[async_trait]
impl Transport for SignalCliTransport {
    async fn receive(&self) -> Result<Option<Envelope>> {
        let mut rx = self.inbound.lock().await;
        match rx.recv().await {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;

        let id = self.next_request_id(&msg.recipient);
        let request = RpcRequest {
            jsonrpc: "2.0",
            method: "send",
            params: SendParams {
                recipient: [msg.recipient.as_str()],
                message: &msg.text,
            },
            id: &id,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), ack_tx);

        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            self.pending.lock().await.remove(&id);
            return Err(Error::delivery(&msg.recipient, format!("write failed: {e}")));
        }

        tracing::debug!(
            recipient = %msg.recipient,
            request = %id,
            correlation = msg.correlation_id.as_deref().unwrap_or("-"),
            "send request written"
        );

        let outcome = tokio::time::timeout(self.ack_timeout, ack_rx).await;
        self.pending.lock().await.remove(&id);
        drop(writer);

        match outcome {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(Error::delivery(&msg.recipient, reason)),
            Ok(Err(_)) => Err(Error::delivery(
                &msg.recipient,
                "signal-cli closed before acknowledging",
            )),
            Err(_) => Err(Error::delivery(
                &msg.recipient,
                format!("no acknowledgment within {}ms", self.ack_timeout.as_millis()),
            )),
        }
    }
}

// ============== Wire format ==============

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: SendParams<'a>,
    id: &'a str,
}

#[derive(Serialize)]
struct SendParams<'a> {
    recipient: [&'a str; 1],
    message: &'a str,
}

#[derive(Deserialize)]
struct RpcLine {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ReceiveParams {
    envelope: RawEnvelope,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    source_number: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    data_message: Option<DataMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataMessage {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    group_info: Option<GroupInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupInfo {
    #[serde(default)]
    group_id: Option<String>,
}

/// One classified stdout line.
enum Inbound {
    Envelope(Envelope),
    Ack { id: String, ack: Ack },
    /// Well-formed but nothing for us (receipts, typing, sync, other methods).
    Ignored(&'static str),
}

fn parse_line(line: &str) -> Result<Inbound> {
    let rpc: RpcLine = serde_json::from_str(line)
        .map_err(|e| Error::MalformedEnvelope(format!("{e}: {}", truncate_text(line, 200))))?;

    if rpc.method.is_none() {
        let Some(id) = rpc.id.as_ref().map(id_string) else {
            return Ok(Inbound::Ignored("response without id"));
        };
        let ack = match (rpc.error, rpc.result) {
            (Some(err), _) => Err(format!(
                "signal-cli error {}: {}",
                err.code.unwrap_or_default(),
                err.message.unwrap_or_default()
            )),
            (None, Some(result)) => check_send_result(&result),
            (None, None) => Ok(()),
        };
        return Ok(Inbound::Ack { id, ack });
    }

    if rpc.method.as_deref() != Some("receive") {
        return Ok(Inbound::Ignored("notification"));
    }

    let params: ReceiveParams = serde_json::from_value(rpc.params.unwrap_or(Value::Null))
        .map_err(|e| Error::MalformedEnvelope(format!("receive params: {e}")))?;
    let raw = params.envelope;

    let Some(data) = raw.data_message else {
        return Ok(Inbound::Ignored("not a data message"));
    };
    let Some(text) = data.message else {
        return Ok(Inbound::Ignored("data message without text"));
    };
    let sender = raw
        .source_number
        .or(raw.source)
        .ok_or_else(|| Error::MalformedEnvelope("envelope has no source".to_string()))?;

    Ok(Inbound::Envelope(Envelope {
        sender: UserId::new(sender),
        text,
        timestamp: raw.timestamp.unwrap_or_else(now_millis),
        group_id: data.group_info.map(|g| g.group_id.unwrap_or_default()),
    }))
}

/// signal-cli reports per-recipient results; any non-success type fails the send.
fn check_send_result(result: &Value) -> Ack {
    let Some(results) = result.get("results").and_then(|v| v.as_array()) else {
        return Ok(());
    };
    for r in results {
        match r.get("type").and_then(|v| v.as_str()) {
            None | Some("SUCCESS") => {}
            Some(other) => return Err(format!("signal-cli send result: {other}")),
        }
    }
    Ok(())
}

fn id_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn read_loop<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<Result<Envelope>>,
    pending: Pending,
) where
    R: AsyncBufRead + Send + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Err(Error::Io(e)));
                break;
            }
        }

        let line = match String::from_utf8(std::mem::take(&mut buf)) {
            Ok(line) => line,
            Err(e) => {
                let preview = String::from_utf8_lossy(e.as_bytes()).to_string();
                let err = Error::MalformedEnvelope(format!(
                    "line is not valid utf-8: {}",
                    truncate_text(preview.trim_end(), 200)
                ));
                if tx.send(Err(err)).is_err() {
                    break;
                }
                continue;
            }
        };
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(line) {
            Ok(Inbound::Envelope(env)) => {
                if tx.send(Ok(env)).is_err() {
                    break;
                }
            }
            Ok(Inbound::Ack { id, ack }) => match pending.lock().await.remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(ack);
                }
                None => tracing::debug!(request = %id, "acknowledgment for unknown request"),
            },
            Ok(Inbound::Ignored(what)) => {
                tracing::debug!("ignoring {what}: {}", truncate_text(line, 200));
            }
            Err(e) => {
                if tx.send(Err(e)).is_err() {
                    break;
                }
            }
        }
    }

    // Dropping the waiters fails any send still waiting for an ack.
    pending.lock().await.clear();
    tracing::warn!("signal-cli stdout closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    const ALICE: &str = "+15550000001";

    /// The far end of the pipe, playing signal-cli.
    struct FakeSignalCli {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        out: WriteHalf<DuplexStream>,
    }

    impl FakeSignalCli {
        async fn emit(&mut self, line: &str) {
            self.out.write_all(line.as_bytes()).await.unwrap();
            self.out.write_all(b"\n").await.unwrap();
            self.out.flush().await.unwrap();
        }

        async fn next_request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn pair(ack_timeout: Duration) -> (SignalCliTransport, FakeSignalCli) {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = split(ours);
        let (their_read, their_write) = split(theirs);
        let transport =
            SignalCliTransport::from_io(BufReader::new(our_read), our_write, ack_timeout);
        let fake = FakeSignalCli {
            lines: BufReader::new(their_read).lines(),
            out: their_write,
        };
        (transport, fake)
    }

    fn receive_line(source: &str, text: &str) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "receive",
            "params": {"envelope": {
                "source": source,
                "sourceNumber": source,
                "timestamp": 1_605_478_095_592_i64,
                "dataMessage": {"timestamp": 1_605_478_095_592_i64, "message": text, "groupInfo": null}
            }}
        })
        .to_string()
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_fatal() {
        let (transport, mut fake) = pair(Duration::from_secs(1));
        fake.emit("this is not json").await;
        fake.emit(r#"{"jsonrpc":"2.0","method":"receive","params":{"envelope":{"source":"+15550000001","timestamp":1,"receiptMessage":{}}}}"#)
            .await;
        fake.emit(&receive_line(ALICE, "hello")).await;

        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope(_)));

        let env = transport.receive().await.unwrap().unwrap();
        assert_eq!(env.sender, UserId::new(ALICE));
        assert_eq!(env.text, "hello");
        assert_eq!(env.timestamp, 1_605_478_095_592);
        assert!(!env.is_group());
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped_not_fatal() {
        let (transport, mut fake) = pair(Duration::from_secs(1));
        fake.out.write_all(b"\xff\xfe garbage\n").await.unwrap();
        fake.emit(&receive_line(ALICE, "after the garbage")).await;

        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope(_)));

        let env = transport.receive().await.unwrap().unwrap();
        assert_eq!(env.sender, UserId::new(ALICE));
        assert_eq!(env.text, "after the garbage");
    }

    #[tokio::test]
    async fn group_context_is_carried() {
        let (transport, mut fake) = pair(Duration::from_secs(1));
        fake.emit(r#"{"jsonrpc":"2.0","method":"receive","params":{"envelope":{"sourceNumber":"+15550000001","timestamp":5,"dataMessage":{"message":"hi all","groupInfo":{"groupId":"abc="}}}}}"#)
            .await;

        let env = transport.receive().await.unwrap().unwrap();
        assert_eq!(env.group_id.as_deref(), Some("abc="));
    }

    #[tokio::test]
    async fn send_waits_for_matching_ack() {
        let (transport, mut fake) = pair(Duration::from_secs(5));
        let transport = Arc::new(transport);

        let t = transport.clone();
        let send = tokio::spawn(async move {
            t.send(&OutboundMessage::new(UserId::new(ALICE), "hi alice")).await
        });

        let req = fake.next_request().await;
        assert_eq!(req["method"], "send");
        assert_eq!(req["params"]["recipient"][0], ALICE);
        assert_eq!(req["params"]["message"], "hi alice");
        let id = req["id"].as_str().unwrap().to_string();
        assert!(id.starts_with(&format!("{ALICE}:")));

        // An inbound message between request and ack must not confuse routing.
        fake.emit(&receive_line("+15550000002", "meanwhile")).await;
        fake.emit(&format!(
            r#"{{"jsonrpc":"2.0","id":"{id}","result":{{"timestamp":1,"results":[{{"type":"SUCCESS"}}]}}}}"#
        ))
        .await;

        send.await.unwrap().unwrap();
        let env = transport.receive().await.unwrap().unwrap();
        assert_eq!(env.text, "meanwhile");
    }

    #[tokio::test]
    async fn error_response_is_delivery_failure() {
        let (transport, mut fake) = pair(Duration::from_secs(5));
        let transport = Arc::new(transport);

        let t = transport.clone();
        let send = tokio::spawn(async move {
            t.send(&OutboundMessage::new(UserId::new(ALICE), "x"))
                .await
        });

        let req = fake.next_request().await;
        let id = req["id"].as_str().unwrap().to_string();
        fake.emit(&format!(
            r#"{{"jsonrpc":"2.0","id":"{id}","error":{{"code":-1,"message":"Unregistered user"}}}}"#
        ))
        .await;

        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed { .. }));
        assert!(err.to_string().contains("Unregistered user"));
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let (transport, mut fake) = pair(Duration::from_millis(50));
        let err = transport
            .send(&OutboundMessage::new(UserId::new(ALICE), "anyone?"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed { .. }));
        assert!(err.to_string().contains("no acknowledgment"));
        let _ = fake.next_request().await;
    }

    #[tokio::test]
    async fn sends_are_serialized() {
        let (transport, mut fake) = pair(Duration::from_secs(5));
        let transport = Arc::new(transport);

        let mut handles = Vec::new();
        for n in 0..3 {
            let t = transport.clone();
            handles.push(tokio::spawn(async move {
                t.send(&OutboundMessage::new(UserId::new(ALICE), format!("m{n}")))
                    .await
            }));
        }

        for _ in 0..3 {
            let req = fake.next_request().await;
            let id = req["id"].as_str().unwrap().to_string();
            // Nothing else may be written until this one is acked.
            let early =
                tokio::time::timeout(Duration::from_millis(30), fake.lines.next_line()).await;
            assert!(early.is_err());
            fake.emit(&format!(r#"{{"jsonrpc":"2.0","id":"{id}","result":{{}}}}"#))
                .await;
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn eof_ends_stream_and_fails_pending_send() {
        let (transport, fake) = pair(Duration::from_secs(5));
        drop(fake);

        assert!(transport.receive().await.unwrap().is_none());
        let err = transport
            .send(&OutboundMessage::new(UserId::new(ALICE), "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed { .. }));
    }

    #[test]
    fn non_success_result_type_fails() {
        let ok = serde_json::json!({"results": [{"type": "SUCCESS"}]});
        let bad = serde_json::json!({"results": [{"type": "UNREGISTERED_FAILURE"}]});
        assert!(check_send_result(&ok).is_ok());
        assert!(check_send_result(&bad).is_err());
        assert!(check_send_result(&Value::Null).is_ok());
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let mut tail = StderrTail::default();
        for n in 0..(STDERR_TAIL_MAX_LINES + 10) {
            tail.push_line(format!("line {n}"));
        }
        assert_eq!(tail.lines.len(), STDERR_TAIL_MAX_LINES);
        assert!(tail.snapshot().ends_with(&format!("line {}", STDERR_TAIL_MAX_LINES + 9)));
    }
}
