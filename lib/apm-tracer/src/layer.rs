use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use tracing::{
    field::{Field, Visit},
    span::{Attributes, Id, Record},
    Subscriber,
};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use crate::{
    sink::TraceSink,
    span::{FinishedSpan, Trace, SAMPLING_PRIORITY_KEY},
    APM_TARGET,
};

/// Tracer-wide settings applied to every captured span.
#[derive(Clone, Debug)]
pub struct TracerSettings {
    /// Default service name for spans that do not set a `service` field.
    pub service: String,

    /// Environment, attached to every span as the `env` tag when set.
    pub env: Option<String>,

    /// Application version, attached to every span as the `version` tag when set.
    pub version: Option<String>,
}

impl TracerSettings {
    /// Creates a new `TracerSettings` for the given service, with no environment or version.
    pub fn new<S: Into<String>>(service: S) -> Self {
        Self {
            service: service.into(),
            env: None,
            version: None,
        }
    }

    /// Sets the environment.
    pub fn with_env(mut self, env: Option<String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the application version.
    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }
}

/// A `tracing-subscriber` layer that captures APM spans.
///
/// Only spans created with the [`APM_TARGET`] target are captured. Other spans are ignored entirely, including for the
/// purpose of parent/child relationships: an APM span nested under a non-APM span is parented to the closest APM
/// ancestor.
pub struct ApmLayer {
    settings: Arc<TracerSettings>,
    sink: Arc<dyn TraceSink>,
}

impl ApmLayer {
    /// Creates a new `ApmLayer` that submits completed traces to `sink`.
    pub fn new<K>(settings: TracerSettings, sink: K) -> Self
    where
        K: TraceSink + 'static,
    {
        Self {
            settings: Arc::new(settings),
            sink: Arc::new(sink),
        }
    }
}

/// In-flight state of a captured span, stored in the span's extensions.
struct SpanData {
    trace_id: u64,
    span_id: u64,
    parent_id: u64,
    service: String,
    name: &'static str,
    resource: Option<String>,
    span_type: String,
    error: bool,
    meta: HashMap<String, String>,
    metrics: HashMap<String, f64>,
    start_unix_nanos: i64,
    started_at: Instant,
}

impl SpanData {
    fn finish(self) -> FinishedSpan {
        let duration = i64::try_from(self.started_at.elapsed().as_nanos()).unwrap_or(i64::MAX);

        FinishedSpan {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_id: self.parent_id,
            service: self.service,
            name: self.name.to_string(),
            resource: self.resource.unwrap_or_else(|| self.name.to_string()),
            span_type: self.span_type,
            start: self.start_unix_nanos,
            duration,
            error: i32::from(self.error),
            meta: self.meta,
            metrics: self.metrics,
        }
    }
}

/// Finished non-root spans, buffered on the root span until the whole trace completes.
#[derive(Default)]
struct PendingSpans(Vec<FinishedSpan>);

struct SpanFieldVisitor<'a> {
    data: &'a mut SpanData,
}

impl Visit for SpanFieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "resource" => self.data.resource = Some(value.to_string()),
            "span.type" => self.data.span_type = value.to_string(),
            "service" => self.data.service = value.to_string(),
            name => {
                self.data.meta.insert(name.to_string(), value.to_string());
            }
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "error" {
            self.data.error = value;
        } else {
            self.data.meta.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.data.metrics.insert(field.name().to_string(), value as f64);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.data.metrics.insert(field.name().to_string(), value as f64);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.data.metrics.insert(field.name().to_string(), value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_str(field, &format!("{:?}", value));
    }
}

fn generate_id() -> u64 {
    // Zero means "no parent" on the wire, so it can never be a valid identifier.
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

fn unix_nanos_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

impl<S> Layer<S> for ApmLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().target() != APM_TARGET {
            return;
        }

        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut parent_ids = None;
        for ancestor in span.scope().skip(1) {
            let extensions = ancestor.extensions();
            if let Some(parent) = extensions.get::<SpanData>() {
                parent_ids = Some((parent.trace_id, parent.span_id));
                break;
            }
        }

        let is_root = parent_ids.is_none();
        let (trace_id, parent_id) = parent_ids.unwrap_or_else(|| (generate_id(), 0));

        let mut data = SpanData {
            trace_id,
            span_id: generate_id(),
            parent_id,
            service: self.settings.service.clone(),
            name: attrs.metadata().name(),
            resource: None,
            span_type: String::new(),
            error: false,
            meta: HashMap::new(),
            metrics: HashMap::new(),
            start_unix_nanos: unix_nanos_now(),
            started_at: Instant::now(),
        };

        if let Some(env) = &self.settings.env {
            data.meta.insert("env".to_string(), env.clone());
        }
        if let Some(version) = &self.settings.version {
            data.meta.insert("version".to_string(), version.clone());
        }
        if is_root {
            // Root spans carry the sampling decision for the whole trace, and we always keep our traces.
            data.metrics.insert(SAMPLING_PRIORITY_KEY.to_string(), 1.0);
        }

        attrs.record(&mut SpanFieldVisitor { data: &mut data });

        let mut extensions = span.extensions_mut();
        extensions.insert(data);
        if is_root {
            extensions.insert(PendingSpans::default());
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut extensions = span.extensions_mut();
        if let Some(data) = extensions.get_mut::<SpanData>() {
            values.record(&mut SpanFieldVisitor { data });
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else {
            return;
        };

        let (finished, pending) = {
            let mut extensions = span.extensions_mut();
            let Some(data) = extensions.remove::<SpanData>() else {
                return;
            };
            (data.finish(), extensions.remove::<PendingSpans>())
        };

        // Root span: the trace is complete.
        if let Some(PendingSpans(mut trace)) = pending {
            trace.push(finished);
            self.sink.submit(trace);
            return;
        }

        for ancestor in span.scope().skip(1) {
            let mut extensions = ancestor.extensions_mut();
            if let Some(PendingSpans(spans)) = extensions.get_mut::<PendingSpans>() {
                spans.push(finished);
                return;
            }
        }

        // The root is gone already, which can only happen if spans were closed out of order. Rather than losing the
        // span, ship it as a trace of its own.
        let orphan: Trace = vec![finished];
        self.sink.submit(orphan);
    }
}
