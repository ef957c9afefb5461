use std::{sync::Arc, time::Duration};

use apm_tracer::APM_TARGET;
use async_trait::async_trait;
use cadence::{Counted as _, StatsdClient};
use tokio::time::sleep;
use tracing::{debug, field, info_span, Instrument as _, Span};

use crate::driver::Workload;

/// Name of the counter incremented once per simulated request.
pub const REQUEST_COUNTER: &str = "hello_apm.requests";

const CACHE_KEY: &str = "user_abc";
const CACHE_LATENCY: Duration = Duration::from_millis(20);

const TEMPLATE_NAME: &str = "hello.tmpl";
const TEMPLATE_LATENCY: Duration = Duration::from_millis(100);

/// A fake web request: a cache lookup followed by a template render, reported as a trace and a request counter.
pub struct WebRequestWorkload {
    statsd: Arc<StatsdClient>,
}

impl WebRequestWorkload {
    /// Creates a new `WebRequestWorkload` that reports requests through the given DogStatsD client.
    pub fn new(statsd: Arc<StatsdClient>) -> Self {
        Self { statsd }
    }
}

#[async_trait]
impl Workload for WebRequestWorkload {
    async fn run(&self) {
        fake_web_request(&self.statsd).await;
    }
}

async fn fake_web_request(statsd: &StatsdClient) {
    let span = info_span!(
        target: APM_TARGET,
        "web.request",
        resource = "/hello",
        "span.type" = "web",
        http.status_code = field::Empty
    );

    async {
        fake_cache_request(CACHE_KEY).await;
        fake_template_render(TEMPLATE_NAME).await;

        Span::current().record("http.status_code", "202");

        if let Err(e) = statsd.count(REQUEST_COUNTER, 1) {
            debug!(error = %e, "Failed to send request counter.");
        }
    }
    .instrument(span)
    .await
}

async fn fake_cache_request(key: &str) {
    let span = info_span!(target: APM_TARGET, "cache.request", resource = key, "span.type" = "redis");
    sleep(CACHE_LATENCY).instrument(span).await
}

async fn fake_template_render(name: &str) {
    let span = info_span!(target: APM_TARGET, "template.render", resource = name);
    sleep(TEMPLATE_LATENCY).instrument(span).await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use apm_tracer::{ApmLayer, Trace, TraceSink, TracerSettings};
    use tokio::{net::UdpSocket, time::Instant};
    use tracing_subscriber::layer::SubscriberExt as _;

    use super::*;
    use crate::metrics::statsd_client;

    #[derive(Clone, Default)]
    struct CollectingSink {
        traces: Arc<Mutex<Vec<Trace>>>,
    }

    impl TraceSink for CollectingSink {
        fn submit(&self, trace: Trace) {
            self.traces.lock().unwrap().push(trace);
        }
    }

    async fn statsd_pair() -> (UdpSocket, Arc<StatsdClient>) {
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("should bind server socket");
        let addr = server.local_addr().expect("should have local address").to_string();
        let client = statsd_client(&addr, &[("service", "hello-apm".to_string())]).expect("should create client");
        (server, Arc::new(client))
    }

    #[tokio::test]
    async fn request_emits_three_spans_and_one_counter() {
        let sink = CollectingSink::default();
        let subscriber =
            tracing_subscriber::registry().with(ApmLayer::new(TracerSettings::new("hello-apm"), sink.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let (server, statsd) = statsd_pair().await;
        let workload = WebRequestWorkload::new(statsd);

        let start = Instant::now();
        workload.run().await;
        assert!(start.elapsed() >= CACHE_LATENCY + TEMPLATE_LATENCY);

        let traces = sink.traces.lock().unwrap().clone();
        assert_eq!(traces.len(), 1);

        let trace = &traces[0];
        let names = trace.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["cache.request", "template.render", "web.request"]);

        let (cache, template, request) = (&trace[0], &trace[1], &trace[2]);
        assert!(request.is_root());
        assert_eq!(request.resource, "/hello");
        assert_eq!(request.span_type, "web");
        assert_eq!(request.get_meta("http.status_code"), Some("202"));

        assert_eq!(cache.parent_id, request.span_id);
        assert_eq!(cache.resource, CACHE_KEY);
        assert_eq!(cache.span_type, "redis");
        assert!(cache.duration >= CACHE_LATENCY.as_nanos() as i64);

        assert_eq!(template.parent_id, request.span_id);
        assert_eq!(template.resource, TEMPLATE_NAME);
        assert!(template.duration >= TEMPLATE_LATENCY.as_nanos() as i64);

        assert!(request.duration >= cache.duration + template.duration);

        let mut buf = [0u8; 256];
        let n = server.recv(&mut buf).await.expect("should receive counter");
        assert_eq!(&buf[..n], b"hello_apm.requests:1|c|#service:hello-apm");
    }

    #[tokio::test]
    async fn concurrent_requests_are_separate_traces() {
        let sink = CollectingSink::default();
        let subscriber =
            tracing_subscriber::registry().with(ApmLayer::new(TracerSettings::new("hello-apm"), sink.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let (_server, statsd) = statsd_pair().await;
        let workload = WebRequestWorkload::new(statsd);

        tokio::join!(workload.run(), workload.run());

        let traces = sink.traces.lock().unwrap().clone();
        assert_eq!(traces.len(), 2);
        assert_ne!(traces[0][0].trace_id, traces[1][0].trace_id);

        for trace in &traces {
            assert_eq!(trace.len(), 3);
            let root = &trace[2];
            assert!(trace[..2].iter().all(|s| s.trace_id == root.trace_id && s.parent_id == root.span_id));
        }
    }
}
