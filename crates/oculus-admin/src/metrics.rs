//! Prometheus指标

use oculus_core::models::CaseStatus;
use oculus_core::{OculusError, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// 系统指标集合，克隆后共享同一注册表
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    http_requests: IntCounterVec,
    case_transitions: IntCounterVec,
    sweeper_jobs: IntCounterVec,
    audit_written: IntCounter,
    audit_dropped: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

fn metrics_error(e: prometheus::Error) -> OculusError {
    OculusError::Internal(format!("指标注册失败: {}", e))
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("oculus".to_string()), None).map_err(metrics_error)?;

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests by status class"),
            &["class"],
        )
        .map_err(metrics_error)?;
        let case_transitions = IntCounterVec::new(
            Opts::new("case_transitions_total", "Case status transitions by target status"),
            &["to"],
        )
        .map_err(metrics_error)?;
        let sweeper_jobs = IntCounterVec::new(
            Opts::new("sweeper_jobs_total", "Sweeper job runs by job and outcome"),
            &["job", "outcome"],
        )
        .map_err(metrics_error)?;
        let audit_written = IntCounter::with_opts(Opts::new(
            "audit_entries_written_total",
            "Audit entries persisted",
        ))
        .map_err(metrics_error)?;
        let audit_dropped = IntCounter::with_opts(Opts::new(
            "audit_entries_dropped_total",
            "Audit entries dropped because the channel was full or closed",
        ))
        .map_err(metrics_error)?;

        registry.register(Box::new(http_requests.clone())).map_err(metrics_error)?;
        registry.register(Box::new(case_transitions.clone())).map_err(metrics_error)?;
        registry.register(Box::new(sweeper_jobs.clone())).map_err(metrics_error)?;
        registry.register(Box::new(audit_written.clone())).map_err(metrics_error)?;
        registry.register(Box::new(audit_dropped.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            http_requests,
            case_transitions,
            sweeper_jobs,
            audit_written,
            audit_dropped,
        })
    }

    pub fn record_http(&self, status: u16) {
        let class = match status {
            100..=199 => "1xx",
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.http_requests.with_label_values(&[class]).inc();
    }

    pub fn record_transition(&self, to: CaseStatus) {
        self.case_transitions.with_label_values(&[to.as_str()]).inc();
    }

    pub fn record_job(&self, job: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.sweeper_jobs.with_label_values(&[job, outcome]).inc();
    }

    pub fn record_audit_written(&self) {
        self.audit_written.inc();
    }

    pub fn record_audit_dropped(&self) {
        self.audit_dropped.inc();
    }

    pub fn audit_dropped(&self) -> u64 {
        self.audit_dropped.get()
    }

    pub fn transitions_to(&self, to: CaseStatus) -> u64 {
        self.case_transitions.with_label_values(&[to.as_str()]).get()
    }

    /// 文本格式导出
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| OculusError::Internal(e.to_string()))
    }
}
