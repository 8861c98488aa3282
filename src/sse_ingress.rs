//! SSE ingress client — component I.
//!
//! Consumes a Server-Sent Events response from an upstream agent and turns
//! its frames into task-store mutations. The frame splitter is byte-
//! oriented and chunk-boundary tolerant: a frame can arrive split across an
//! arbitrary number of `bytes_stream()` chunks, and the two-byte `\n\n`
//! delimiter can itself straddle a chunk boundary.
//!
//! The first frame that decodes to a result is treated as the task's
//! initial status and acknowledged back to the caller of
//! [`crate::worker::AgentWorker::stream`] immediately; everything after
//! that is folded into the store as ordinary status/artifact updates until
//! a terminal frame arrives or the connection closes.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::debug;

use crate::adapter::{AdapterOutcome, ProtocolAdapter};
use crate::clock::Clock;
use crate::error::{GatewayError, GatewayResult, REMOTE_ERROR};
use crate::store::TaskStore;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::types::{CanonicalMethod, Envelope, Task, TaskState, TaskStatus};

/// Accumulates raw bytes and yields complete, blank-line-delimited SSE
/// frames. Tolerant of `\n`, `\r\n`, and bare `\r` line endings, and of the
/// delimiter itself arriving split across pushes.
struct SseFrameSplitter {
    buf: Vec<u8>,
}

impl SseFrameSplitter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_frame(&mut self) -> Option<String> {
        let (frame_end, delim_end) = find_blank_line(&self.buf)?;
        let frame_bytes: Vec<u8> = self.buf.drain(..frame_end).collect();
        self.buf.drain(..delim_end - frame_end);
        let text = String::from_utf8_lossy(&frame_bytes).into_owned();
        Some(text.replace("\r\n", "\n").replace('\r', "\n"))
    }
}

/// Finds the first blank-line delimiter, returning `(frame_end, delim_end)`
/// byte offsets. Recognizes `\n\n` and `\r\n\r\n`.
fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf.get(i + 1) == Some(&b'\n') && buf.get(i + 2) == Some(&b'\r') && buf.get(i + 3) == Some(&b'\n') {
            return Some((i, i + 4));
        }
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, i + 2));
        }
        i += 1;
    }
    None
}

/// Joins every `data:` line in a frame (the only field this gateway reads);
/// `:`-prefixed comment lines (used as keep-alives) and any other field are
/// ignored. Returns `None` for a frame with no `data:` lines at all.
fn extract_data(frame: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn decode_frame(adapter: &dyn ProtocolAdapter, frame: &str) -> GatewayResult<Option<Envelope>> {
    let Some(data) = extract_data(frame) else {
        return Ok(None);
    };
    match adapter.decode_stream_event(data.as_bytes())? {
        AdapterOutcome::Result(envelope) | AdapterOutcome::Notification(envelope) => Ok(Some(envelope)),
        AdapterOutcome::Error { message, data } => Err(GatewayError::JsonRpc {
            code: REMOTE_ERROR,
            message,
            data,
        }),
    }
}

fn status_from_envelope(envelope: &Envelope, clock: &dyn Clock) -> GatewayResult<TaskStatus> {
    #[derive(serde::Deserialize)]
    struct StatusPayload {
        state: TaskState,
        #[serde(default)]
        message: Option<Envelope>,
    }
    let payload: StatusPayload = serde_json::from_value(envelope.data.clone())
        .map_err(|e| GatewayError::InvalidJson(e.to_string()))?;
    Ok(TaskStatus {
        state: payload.state,
        message: payload.message,
        timestamp: Some(clock.now_rfc3339()),
    })
}

/// Reads the next complete frame off `stream`, pulling more chunks through
/// `splitter` as needed. `Ok(None)` means the stream closed cleanly with no
/// more frames buffered.
async fn next_frame<S>(
    stream: &mut S,
    splitter: &mut SseFrameSplitter,
    chunk_timeout: Duration,
    agent_id: &str,
) -> GatewayResult<Option<String>>
where
    S: futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    if let Some(frame) = splitter.next_frame() {
        return Ok(Some(frame));
    }
    loop {
        match tokio::time::timeout(chunk_timeout, stream.next()).await {
            Ok(Some(Ok(chunk))) => {
                splitter.push(&chunk);
                if let Some(frame) = splitter.next_frame() {
                    return Ok(Some(frame));
                }
            }
            Ok(Some(Err(e))) => {
                return Err(GatewayError::Unreachable(agent_id.to_string(), e.to_string()))
            }
            Ok(None) => return Ok(None),
            Err(_elapsed) => return Err(GatewayError::Timeout(agent_id.to_string())),
        }
    }
}

async fn mark_synthetic_failure(store: &dyn TaskStore, task_id: &str, clock: &dyn Clock) {
    let _ = store
        .apply_status_update(
            task_id,
            TaskStatus {
                state: TaskState::Failed,
                message: None,
                timestamp: Some(clock.now_rfc3339()),
            },
        )
        .await;
}

/// Applies a non-initial frame to the store. Returns whether the task
/// reached a terminal state.
async fn apply_frame(
    store: &dyn TaskStore,
    task_id: &str,
    envelope: Envelope,
    clock: &dyn Clock,
) -> GatewayResult<bool> {
    if envelope.kind == "artifact" {
        store.apply_artifact_update(task_id, envelope.data).await?;
        return Ok(false);
    }
    let status = status_from_envelope(&envelope, clock)?;
    let terminal = status.state.is_terminal();
    store.apply_status_update(task_id, status).await?;
    Ok(terminal)
}

/// Drives one streamed call end to end: connects, parses the first frame
/// and acknowledges it through `init_ack`, then folds every subsequent
/// frame into `store` until a terminal frame arrives or the connection
/// closes. A clean close without a terminal frame is treated as a failure —
/// the task is moved to `Failed` synthetically so no subscriber is left
/// waiting on a task that will never reach a terminal state on its own.
#[allow(clippy::too_many_arguments)]
pub async fn run_ingress(
    http: &reqwest::Client,
    adapter: &dyn ProtocolAdapter,
    store: &dyn TaskStore,
    clock: &dyn Clock,
    telemetry: &TelemetrySink,
    agent_id: &str,
    agent_url: &str,
    token: Option<&str>,
    task_id: &str,
    context_id: Option<&str>,
    envelope: &Envelope,
    connect_timeout: Duration,
    init_ack: oneshot::Sender<GatewayResult<Envelope>>,
) -> GatewayResult<()> {
    let mut init_ack = Some(init_ack);
    let send_init = |slot: &mut Option<oneshot::Sender<GatewayResult<Envelope>>>, result: GatewayResult<Envelope>| {
        if let Some(tx) = slot.take() {
            let _ = tx.send(result);
        }
    };

    let body = adapter.encode_request(CanonicalMethod::Stream, envelope)?;
    let mut request = http
        .post(agent_url)
        .header("accept", "text/event-stream")
        .header("content-type", "application/json");
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let connected = tokio::time::timeout(connect_timeout, request.body(body).send()).await;
    let response = match connected {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            let err = GatewayError::Unreachable(agent_id.to_string(), e.to_string());
            send_init(&mut init_ack, Err(err.clone()));
            return Err(err);
        }
        Err(_elapsed) => {
            let err = GatewayError::Timeout(agent_id.to_string());
            send_init(&mut init_ack, Err(err.clone()));
            return Err(err);
        }
    };

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body_text = response.text().await.unwrap_or_default();
        let err = GatewayError::Remote { status, body: body_text };
        send_init(&mut init_ack, Err(err.clone()));
        return Err(err);
    }

    let mut splitter = SseFrameSplitter::new();
    let mut stream = response.bytes_stream();

    let first_envelope = loop {
        match next_frame(&mut stream, &mut splitter, connect_timeout, agent_id).await {
            Ok(Some(frame)) => match decode_frame(adapter, &frame) {
                Ok(Some(envelope)) => break envelope,
                Ok(None) => continue,
                Err(e) => {
                    send_init(&mut init_ack, Err(e.clone()));
                    return Err(e);
                }
            },
            Ok(None) => {
                let e = GatewayError::Unreachable(
                    agent_id.to_string(),
                    "stream closed before any frame arrived".to_string(),
                );
                send_init(&mut init_ack, Err(e.clone()));
                return Err(e);
            }
            Err(e) => {
                send_init(&mut init_ack, Err(e.clone()));
                return Err(e);
            }
        }
    };

    let initial_status = status_from_envelope(&first_envelope, clock)?;
    let terminal_after_first = initial_status.state.is_terminal();
    let mut task = Task::new(task_id, agent_id, initial_status.state);
    task.status = initial_status;
    task.context_id = context_id.map(ToString::to_string);
    store.put(task).await?;

    telemetry.publish(TelemetryEvent::StreamInit {
        agent_id: agent_id.to_string(),
        task_id: task_id.to_string(),
    });
    send_init(&mut init_ack, Ok(first_envelope));

    if terminal_after_first {
        return Ok(());
    }

    loop {
        match next_frame(&mut stream, &mut splitter, connect_timeout, agent_id).await {
            Ok(Some(frame)) => match decode_frame(adapter, &frame) {
                Ok(Some(envelope)) => {
                    if apply_frame(store, task_id, envelope, clock).await? {
                        return Ok(());
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    mark_synthetic_failure(store, task_id, clock).await;
                    telemetry.publish(TelemetryEvent::StreamError {
                        agent_id: agent_id.to_string(),
                        task_id: Some(task_id.to_string()),
                        reason: e.reason().to_string(),
                    });
                    return Err(e);
                }
            },
            Ok(None) => {
                debug!(task_id, "stream closed without a terminal frame");
                mark_synthetic_failure(store, task_id, clock).await;
                telemetry.publish(TelemetryEvent::StreamError {
                    agent_id: agent_id.to_string(),
                    task_id: Some(task_id.to_string()),
                    reason: "closed_without_terminal".to_string(),
                });
                return Err(GatewayError::Unreachable(
                    agent_id.to_string(),
                    "stream closed without a terminal frame".to_string(),
                ));
            }
            Err(e) => {
                mark_synthetic_failure(store, task_id, clock).await;
                telemetry.publish(TelemetryEvent::StreamError {
                    agent_id: agent_id.to_string(),
                    task_id: Some(task_id.to_string()),
                    reason: e.reason().to_string(),
                });
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_splitter_joins_multiline_data_and_ignores_comments() {
        let mut splitter = SseFrameSplitter::new();
        splitter.push(b": keep-alive\ndata: {\"a\":1,\ndata: \"b\":2}\n\n");
        let frame = splitter.next_frame().unwrap();
        assert_eq!(extract_data(&frame).unwrap(), "{\"a\":1,\n\"b\":2}");
    }

    #[test]
    fn frame_splitter_tolerates_delimiter_split_across_pushes() {
        let mut splitter = SseFrameSplitter::new();
        splitter.push(b"data: hello\n");
        assert!(splitter.next_frame().is_none());
        splitter.push(b"\n");
        let frame = splitter.next_frame().unwrap();
        assert_eq!(extract_data(&frame).unwrap(), "hello");
    }

    #[test]
    fn frame_splitter_tolerates_crlf() {
        let mut splitter = SseFrameSplitter::new();
        splitter.push(b"data: hello\r\n\r\n");
        let frame = splitter.next_frame().unwrap();
        assert_eq!(extract_data(&frame).unwrap(), "hello");
    }

    #[test]
    fn frame_with_no_data_lines_extracts_nothing() {
        let mut splitter = SseFrameSplitter::new();
        splitter.push(b": just a comment\n\n");
        let frame = splitter.next_frame().unwrap();
        assert!(extract_data(&frame).is_none());
    }
}
