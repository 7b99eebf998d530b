use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics::{Counter, Gauge, Histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

pub struct Metrics {
    pub jobs_completed: Counter,
    pub render_duration: Histogram,
    pub delivery_duration: Histogram,
    pub job_duration: Histogram,
    pub active_jobs: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_completed: counter!("screenshot_jobs_completed_total"),
            render_duration: histogram!("screenshot_render_duration_seconds"),
            delivery_duration: histogram!("screenshot_delivery_duration_seconds"),
            job_duration: histogram!("screenshot_job_duration_seconds"),
            active_jobs: gauge!("screenshot_active_jobs"),
        }
    }

    pub fn record_render(&self, duration: Duration) {
        self.render_duration.record(duration.as_secs_f64());
    }

    pub fn record_delivery(&self, duration: Duration) {
        self.delivery_duration.record(duration.as_secs_f64());
    }

    pub fn record_job(&self, duration: Duration, failure_kind: Option<&'static str>) {
        self.job_duration.record(duration.as_secs_f64());
        match failure_kind {
            None => self.jobs_completed.increment(1),
            Some(kind) => counter!("screenshot_jobs_failed_total", "kind" => kind).increment(1),
        }
    }

    pub fn job_started(&self) {
        self.active_jobs.increment(1.0);
    }

    pub fn job_finished(&self) {
        self.active_jobs.decrement(1.0);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers help text for every metric the service emits.
pub fn describe_metrics() {
    describe_counter!(
        "screenshot_jobs_completed_total",
        "Jobs rendered and delivered successfully"
    );
    describe_counter!(
        "screenshot_jobs_failed_total",
        "Jobs that ended with an error, by error kind"
    );
    describe_counter!(
        "screenshot_engine_restarts_total",
        "Engine process restarts after the first start"
    );
    describe_histogram!(
        "screenshot_render_duration_seconds",
        Unit::Seconds,
        "Time spent rendering and capturing a page"
    );
    describe_histogram!(
        "screenshot_delivery_duration_seconds",
        Unit::Seconds,
        "Time spent uploading and posting the callback"
    );
    describe_histogram!(
        "screenshot_job_duration_seconds",
        Unit::Seconds,
        "Wall-clock time of a whole job"
    );
    describe_gauge!("screenshot_active_jobs", "Jobs currently running");
    describe_gauge!(
        "screenshot_pending_callbacks",
        "Gateway requests waiting for their callback"
    );
}

/// Installs the global recorder with a Prometheus scrape endpoint on `bind`.
pub fn install_prometheus(bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();
    info!("Prometheus metrics available at http://{}/metrics", addr);
    Ok(())
}
