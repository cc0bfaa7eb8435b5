// quietwatch/src/engine/dispatcher.rs
//
// Writes run output to JSONL files under the output directory.
//
//   detections.jsonl    every detection created, one per line
//   alert_queue.jsonl   one entry per account per run that produced detections
//   job_runs.jsonl      orchestrator and baseline job records
//   quiet_index.jsonl   Quiet Index reports
//   metrics.prom        latest counters, overwritten after each run
//
// Wire these files to your notification service in production.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::metrics::DetectionMetrics;
use super::quiet_index::QuietIndexReport;
use crate::error::StoreResult;
use crate::events::{Detection, JobRun};
use crate::state::{AlertSink, JobLog};

pub struct Dispatcher {
    out: PathBuf,
}

impl Dispatcher {
    pub fn new(output_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let out: PathBuf = output_dir.into();
        std::fs::create_dir_all(&out)?;
        Ok(Self { out })
    }

    pub fn dir(&self) -> &Path {
        &self.out
    }

    pub async fn write_quiet_index(&self, reports: &[QuietIndexReport]) -> StoreResult<()> {
        let mut buf = String::new();
        for r in reports {
            buf.push_str(&serde_json::to_string(r)?);
            buf.push('\n');
        }
        if !buf.is_empty() {
            self.append("quiet_index.jsonl", &buf).await?;
        }
        Ok(())
    }

    pub async fn write_metrics(&self, metrics: &DetectionMetrics) -> StoreResult<()> {
        tokio::fs::write(self.out.join("metrics.prom"), metrics.prometheus_text()).await?;
        Ok(())
    }

    async fn append(&self, file: &str, content: &str) -> StoreResult<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.out.join(file))
            .await?;
        f.write_all(content.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AlertSink for Dispatcher {
    async fn notify(&self, account_id: &str, detections: &[Detection]) -> StoreResult<()> {
        if detections.is_empty() {
            return Ok(());
        }
        let mut lines = String::new();
        for d in detections {
            lines.push_str(&d.to_jsonl());
            lines.push('\n');
        }
        self.append("detections.jsonl", &lines).await?;

        let max_severity = detections.iter().map(|d| d.severity).max();
        let entry = json!({
            "account_id":    account_id,
            "detection_ids": detections.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            "count":         detections.len(),
            "max_severity":  max_severity,
            "queued_at":     Utc::now(),
        });
        self.append("alert_queue.jsonl", &(entry.to_string() + "\n")).await?;
        info!("ALERT account={} detections={} max={:?}", account_id, detections.len(), max_severity);
        Ok(())
    }
}

#[async_trait]
impl JobLog for Dispatcher {
    async fn record(&self, run: JobRun) -> StoreResult<()> {
        self.append("job_runs.jsonl", &(run.to_jsonl() + "\n")).await
    }
}
