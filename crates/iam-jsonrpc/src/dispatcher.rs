//! Protocol dispatcher
//!
//! Turns an operation into a request frame on a [`FramedChannel`] and waits for
//! the response carrying the same correlation id. A background task owns the
//! reading half, so a call that times out or is cancelled never leaves a
//! half-read frame behind; late responses are discarded by the next call.

use std::sync::Arc;
use std::time::Duration;

use iam_core::{EngineEvent, Error, EventSink, ResourceTypeId, Result, TracingSink};
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::protocol::{JsonRpcError, Method, OperationRequest, OperationResponse};
use crate::transport::{FrameReader, FrameWriter, FramedChannel};

const INBOX_CAPACITY: usize = 32;

struct CallState {
    writer: FrameWriter,
    inbox: mpsc::Receiver<Result<Vec<u8>>>,
    /// Set while a frame is being written; left set when the write never finished
    broken: bool,
}

/// One provider channel with at most one call in flight
pub struct Dispatcher {
    name: String,
    state: Mutex<CallState>,
    reader_task: JoinHandle<()>,
    sink: Arc<dyn EventSink>,
    // Killed on drop
    _child: Option<Child>,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>, channel: FramedChannel) -> Self {
        Self::with_sink(name, channel, Arc::new(TracingSink))
    }

    pub fn with_sink(
        name: impl Into<String>,
        channel: FramedChannel,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let name = name.into();
        let (reader, writer, child) = channel.into_parts();
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let reader_task = tokio::spawn(read_loop(name.clone(), reader, tx));

        Self {
            name,
            state: Mutex::new(CallState {
                writer,
                inbox,
                broken: false,
            }),
            reader_task,
            sink,
            _child: child,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send one request and wait up to `timeout` for its response.
    ///
    /// A timeout leaves the channel usable; the late response is dropped when
    /// it arrives.
    #[instrument(skip(self, payload), fields(provider = %self.name))]
    pub async fn call(
        &self,
        method: Method,
        resource_type: Option<&ResourceTypeId>,
        payload: Value,
        timeout: Duration,
    ) -> Result<OperationResponse> {
        let request = OperationRequest::new(method, resource_type.cloned(), payload);
        let correlation_id = request.correlation_id;
        let frame = serde_json::to_vec(&request.to_jsonrpc()?)?;
        let deadline = Instant::now() + timeout;

        let mut state = self.state.lock().await;
        if state.broken {
            return Err(Error::ChannelClosed);
        }

        debug!(%correlation_id, "Sending request");
        // Stays set if this future is dropped mid-frame
        state.broken = true;
        match tokio::time::timeout_at(deadline, state.writer.write_frame(&frame)).await {
            Ok(result) => {
                result?;
                state.broken = false;
            }
            Err(_) => {
                warn!(%correlation_id, "Write timed out; channel marked broken");
                return Err(Error::Timeout(timeout));
            }
        }

        loop {
            let frame = match tokio::time::timeout_at(deadline, state.inbox.recv()).await {
                Err(_) => {
                    warn!(%correlation_id, ?timeout, "Provider call timed out");
                    return Err(Error::Timeout(timeout));
                }
                Ok(None) => return Err(Error::ChannelClosed),
                Ok(Some(frame)) => frame?,
            };

            match self.match_response(correlation_id, method, &frame)? {
                Some(response) => return Ok(response),
                None => continue,
            }
        }
    }

    /// Decode a frame; `None` when it belongs to another (earlier) call
    fn match_response(
        &self,
        correlation_id: Uuid,
        method: Method,
        frame: &[u8],
    ) -> Result<Option<OperationResponse>> {
        let value: Value = serde_json::from_slice(frame)
            .map_err(|e| Error::protocol("frame", format!("invalid JSON: {e}")))?;

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("id", "missing or not a string"))?;

        if id != correlation_id.to_string() {
            warn!(expected = %correlation_id, received = %id, "Discarding response with unknown correlation id");
            self.sink.emit(&EngineEvent::StaleResponseDiscarded {
                correlation_id: id.to_string(),
            });
            return Ok(None);
        }

        if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(Error::protocol("jsonrpc", "expected \"2.0\""));
        }

        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let error: JsonRpcError = serde_json::from_value(error.clone())
                .map_err(|e| Error::protocol("error", e.to_string()))?;
            return Err(Error::Provider {
                code: error.code,
                message: error.message,
            });
        }

        let payload = value
            .get("result")
            .cloned()
            .ok_or_else(|| Error::protocol("result", "missing"))?;

        Ok(Some(OperationResponse {
            correlation_id,
            method,
            payload,
        }))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(name: String, mut reader: FrameReader, tx: mpsc::Sender<Result<Vec<u8>>>) {
    loop {
        match reader.read_frame().await {
            Ok(frame) => {
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(provider = %name, error = %e, "Provider channel reader stopped");
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}
