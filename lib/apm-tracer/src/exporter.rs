use std::time::Duration;

use reqwest::Client;
use snafu::{ResultExt as _, Snafu};
use tokio::{
    select,
    sync::oneshot,
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, warn};
use url::Url;

use crate::{sink::TraceReceiver, span::Trace};

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_BATCH_TRACES: usize = 1000;
const TRACES_PATH: &str = "/v0.4/traces";

/// A tracer error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TracerError {
    /// The configured agent host and port do not form a valid URL.
    #[snafu(display("invalid trace agent address '{}:{}': {}", host, port, source))]
    InvalidAgentAddress {
        /// Agent host.
        host: String,

        /// Agent port.
        port: u16,

        /// Source of the error.
        source: url::ParseError,
    },

    /// The HTTP client could not be created.
    #[snafu(display("failed to create HTTP client: {}", source))]
    FailedToCreateClient {
        /// Source of the error.
        source: reqwest::Error,
    },
}

/// Trace exporter configuration.
#[derive(Clone, Debug)]
pub struct ExporterConfig {
    agent_host: String,
    agent_port: u16,
    flush_interval: Duration,
    request_timeout: Duration,
    max_batch_traces: usize,
}

impl ExporterConfig {
    /// Creates a new `ExporterConfig` targeting the trace agent at the given host and port.
    pub fn new<H: Into<String>>(agent_host: H, agent_port: u16) -> Self {
        Self {
            agent_host: agent_host.into(),
            agent_port,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_batch_traces: DEFAULT_MAX_BATCH_TRACES,
        }
    }

    /// Sets how often buffered traces are flushed.
    ///
    /// Defaults to one second.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Sets the maximum number of traces buffered before a flush is forced.
    ///
    /// Defaults to 1000.
    pub fn with_max_batch_traces(mut self, max_batch_traces: usize) -> Self {
        self.max_batch_traces = max_batch_traces.max(1);
        self
    }

    /// Returns the URL of the trace intake endpoint.
    ///
    /// # Errors
    ///
    /// If the host and port do not form a valid URL, an error is returned.
    pub fn traces_endpoint(&self) -> Result<Url, TracerError> {
        Url::parse(&format!("http://{}:{}{}", self.agent_host, self.agent_port, TRACES_PATH)).context(
            InvalidAgentAddress {
                host: self.agent_host.clone(),
                port: self.agent_port,
            },
        )
    }
}

/// Exports traces to the trace intake of a Datadog Agent.
///
/// Traces are buffered and sent as a JSON batch once per flush interval, or as soon as the batch reaches its maximum
/// size. A failed flush is logged and the batch is discarded: there are no retries.
pub struct AgentExporter {
    client: Client,
    endpoint: Url,
    config: ExporterConfig,
    receiver: TraceReceiver,
}

impl AgentExporter {
    /// Creates a new `AgentExporter` that exports the traces received from `receiver`.
    ///
    /// # Errors
    ///
    /// If the agent endpoint is invalid, or the HTTP client cannot be created, an error is returned.
    pub fn new(config: ExporterConfig, receiver: TraceReceiver) -> Result<Self, TracerError> {
        let endpoint = config.traces_endpoint()?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context(FailedToCreateClient)?;

        Ok(Self {
            client,
            endpoint,
            config,
            receiver,
        })
    }

    /// Spawns the exporter as a background task on the current Tokio runtime.
    pub fn spawn(self) -> TracerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));

        TracerHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        debug!(endpoint = %self.endpoint, "Trace exporter started.");

        let mut flush_timer = interval(self.config.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut pending = Vec::new();

        loop {
            select! {
                _ = &mut shutdown_rx => {
                    while let Some(trace) = self.receiver.try_recv() {
                        pending.push(trace);
                    }
                    break;
                },
                maybe_trace = self.receiver.recv() => match maybe_trace {
                    Some(trace) => {
                        pending.push(trace);
                        if pending.len() >= self.config.max_batch_traces {
                            self.flush(&mut pending).await;
                        }
                    },
                    None => break,
                },
                _ = flush_timer.tick() => self.flush(&mut pending).await,
            }
        }

        self.flush(&mut pending).await;

        debug!("Trace exporter stopped.");
    }

    async fn flush(&self, pending: &mut Vec<Trace>) {
        if pending.is_empty() {
            return;
        }

        let traces = std::mem::take(pending);
        let trace_count = traces.len();

        let result = self
            .client
            .put(self.endpoint.clone())
            .header("Datadog-Meta-Lang", "rust")
            .header("Datadog-Meta-Tracer-Version", env!("CARGO_PKG_VERSION"))
            .header("X-Datadog-Trace-Count", trace_count.to_string())
            .json(&traces)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(trace_count, "Flushed traces to agent.");
            }
            Ok(response) => {
                warn!(trace_count, status = %response.status(), "Trace agent rejected traces. Dropping batch.");
            }
            Err(e) => {
                warn!(trace_count, error = %e, "Failed to send traces to agent. Dropping batch.");
            }
        }
    }
}

/// Handle to a running [`AgentExporter`].
pub struct TracerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TracerHandle {
    /// Stops the exporter, flushing any traces that were already queued.
    ///
    /// Waits at most `max_wait` for the final flush to complete before giving up on it.
    pub async fn shutdown(mut self, max_wait: Duration) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        match timeout(max_wait, &mut self.task).await {
            Ok(Ok(())) => debug!("Tracer stopped."),
            Ok(Err(e)) => warn!(error = %e, "Trace exporter task failed."),
            Err(_) => {
                warn!("Timed out waiting for final trace flush.");
                self.task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        body::Bytes,
        extract::State,
        http::{HeaderMap, StatusCode},
        routing::put,
        Router,
    };
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        sink::{trace_channel, TraceSink as _},
        span::FinishedSpan,
    };

    #[derive(Clone, Default)]
    struct CapturedRequests {
        requests: Arc<Mutex<Vec<(HeaderMap, serde_json::Value)>>>,
    }

    async fn capture(State(captured): State<CapturedRequests>, headers: HeaderMap, body: Bytes) -> StatusCode {
        let payload = serde_json::from_slice(&body).expect("payload should be valid JSON");
        captured.requests.lock().unwrap().push((headers, payload));
        StatusCode::OK
    }

    async fn spawn_fake_agent() -> (u16, CapturedRequests) {
        let captured = CapturedRequests::default();
        let app = Router::new()
            .route(TRACES_PATH, put(capture))
            .with_state(captured.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind listener");
        let port = listener.local_addr().expect("should have local address").port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake agent should not fail");
        });

        (port, captured)
    }

    fn span(name: &str, trace_id: u64) -> FinishedSpan {
        FinishedSpan {
            trace_id,
            span_id: trace_id + 1,
            parent_id: 0,
            service: "hello-apm".to_string(),
            name: name.to_string(),
            resource: name.to_string(),
            span_type: String::new(),
            start: 0,
            duration: 1,
            error: 0,
            meta: Default::default(),
            metrics: Default::default(),
        }
    }

    #[test]
    fn endpoint_from_host_and_port() {
        let config = ExporterConfig::new("10.0.0.7", 8126);
        let endpoint = config.traces_endpoint().expect("endpoint should be valid");
        assert_eq!(endpoint.as_str(), "http://10.0.0.7:8126/v0.4/traces");

        let config = ExporterConfig::new("not a host", 8126);
        assert!(config.traces_endpoint().is_err());
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_traces() {
        let (port, captured) = spawn_fake_agent().await;

        // A long flush interval ensures the traces are only sent by the shutdown flush.
        let config = ExporterConfig::new("127.0.0.1", port).with_flush_interval(Duration::from_secs(3600));
        let (sink, receiver) = trace_channel(16);
        let handle = AgentExporter::new(config, receiver)
            .expect("exporter should be created")
            .spawn();

        sink.submit(vec![span("first", 10)]);
        sink.submit(vec![span("second", 20)]);

        handle.shutdown(Duration::from_secs(5)).await;

        let requests = captured.requests.lock().unwrap();
        let traces = requests
            .iter()
            .flat_map(|(_, payload)| payload.as_array().expect("payload should be an array").clone())
            .collect::<Vec<_>>();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0][0]["name"], "first");
        assert_eq!(traces[1][0]["trace_id"], 20);

        let (headers, _) = &requests[0];
        assert_eq!(headers["datadog-meta-lang"], "rust");
        assert!(headers.contains_key("x-datadog-trace-count"));
    }

    #[tokio::test]
    async fn full_batch_is_flushed_immediately() {
        let (port, captured) = spawn_fake_agent().await;

        let config = ExporterConfig::new("127.0.0.1", port)
            .with_flush_interval(Duration::from_secs(3600))
            .with_max_batch_traces(2);
        let (sink, receiver) = trace_channel(16);
        let handle = AgentExporter::new(config, receiver)
            .expect("exporter should be created")
            .spawn();

        sink.submit(vec![span("a", 1)]);
        sink.submit(vec![span("b", 2)]);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while captured.requests.lock().unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "batch was never flushed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let count = captured.requests.lock().unwrap()[0].1.as_array().map(Vec::len);
        assert_eq!(count, Some(2));

        handle.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn unreachable_agent_does_not_block_shutdown() {
        // Grab a free port and release it, so nothing is listening there.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind listener");
            listener.local_addr().expect("should have local address").port()
        };

        let config = ExporterConfig::new("127.0.0.1", port);
        let (sink, receiver) = trace_channel(16);
        let handle = AgentExporter::new(config, receiver)
            .expect("exporter should be created")
            .spawn();

        sink.submit(vec![span("lost", 1)]);
        handle.shutdown(Duration::from_secs(5)).await;
    }
}
