//! Engine metrics
//!
//! A capability handed to the executor and incident writer rather than
//! module-level state; the daemon renders it in Prometheus text format.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Counter registry for job runs and incidents
#[derive(Debug, Default)]
pub struct EngineMetrics {
    job_runs: RwLock<BTreeMap<(String, String), u64>>,
    incidents: RwLock<BTreeMap<String, u64>>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a finished run by (job name, terminal status)
    pub fn record_job_run(&self, job_name: &str, status: &str) {
        let mut counters = self.job_runs.write().expect("metrics lock poisoned");
        *counters
            .entry((job_name.to_string(), status.to_string()))
            .or_insert(0) += 1;
    }

    /// Count an incident transition by state
    pub fn record_incident(&self, state: &str) {
        let mut counters = self.incidents.write().expect("metrics lock poisoned");
        *counters.entry(state.to_string()).or_insert(0) += 1;
    }

    /// Render counters in Prometheus text exposition format
    pub fn render(&self, now: DateTime<Utc>) -> String {
        let mut lines = Vec::new();

        lines.push("# HELP batchops_job_runs_total Total job runs by job and status".to_string());
        lines.push("# TYPE batchops_job_runs_total counter".to_string());
        for ((job, status), value) in self.job_runs.read().expect("metrics lock poisoned").iter() {
            lines.push(format!(
                "batchops_job_runs_total{{job=\"{job}\",status=\"{status}\"}} {value}"
            ));
        }

        lines.push("# HELP batchops_incidents_total Total incidents by state".to_string());
        lines.push("# TYPE batchops_incidents_total counter".to_string());
        for (state, value) in self.incidents.read().expect("metrics lock poisoned").iter() {
            lines.push(format!("batchops_incidents_total{{state=\"{state}\"}} {value}"));
        }

        lines.push("# HELP batchops_build_info Build info".to_string());
        lines.push("# TYPE batchops_build_info gauge".to_string());
        lines.push(format!("batchops_build_info{{ts=\"{}\"}} 1", now.to_rfc3339()));

        lines.join("\n") + "\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn renders_counters_in_prometheus_format() {
        let metrics = EngineMetrics::new();
        metrics.record_job_run("report_pipeline", "success");
        metrics.record_job_run("report_pipeline", "success");
        metrics.record_job_run("report_pipeline", "failed");
        metrics.record_incident("open");

        let now = Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap();
        let body = metrics.render(now);
        assert!(body.contains(
            "batchops_job_runs_total{job=\"report_pipeline\",status=\"success\"} 2"
        ));
        assert!(body.contains(
            "batchops_job_runs_total{job=\"report_pipeline\",status=\"failed\"} 1"
        ));
        assert!(body.contains("batchops_incidents_total{state=\"open\"} 1"));
    }
}
