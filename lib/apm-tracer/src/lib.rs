//! A small APM tracer built on top of `tracing`.
//!
//! Spans created with the [`APM_TARGET`] target are captured by [`ApmLayer`], converted into Datadog APM spans, and
//! grouped into traces. Once the root span of a trace closes, the whole trace is handed to a [`TraceSink`]. The default
//! sink queues traces for an [`AgentExporter`], which periodically sends them to the trace intake of a Datadog Agent.
//!
//! Span fields are mapped as follows:
//!
//! - `resource`: the span resource (defaults to the span name)
//! - `span.type`: the span type (`web`, `redis`, and so on)
//! - `service`: overrides the service configured in [`TracerSettings`]
//! - `error`: a boolean marking the span as errored
//!
//! All other fields are attached as metadata (strings, booleans, and debug-formatted values) or metrics (numbers).
#![deny(missing_docs)]

/// Target that spans must be created with in order to be captured by [`ApmLayer`].
///
/// ```
/// let span = tracing::info_span!(target: apm_tracer::APM_TARGET, "web.request", resource = "/hello");
/// ```
pub const APM_TARGET: &str = "apm";

mod exporter;
pub use self::exporter::{AgentExporter, ExporterConfig, TracerError, TracerHandle};

mod layer;
pub use self::layer::{ApmLayer, TracerSettings};

mod sink;
pub use self::sink::{trace_channel, ChannelSink, TraceReceiver, TraceSink};

mod span;
pub use self::span::{FinishedSpan, Trace};
