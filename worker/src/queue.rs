// ==============================================================================
// queue.rs - Redis Job Queue Management (Worker Side)
// ==============================================================================
// Description: Job payloads and queue operations for consuming variant
//              storage jobs from Redis
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use variant_storage::LoadOptions;

const QUEUE_KEY: &str = "variant-storage:job_queue";

/// Seconds a job result stays readable
const RESULT_TTL_SECS: u64 = 24 * 3600;

/// Operation requested by a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Operation {
    /// Load VCF files or directories
    Load { inputs: Vec<String> },
    /// Remove loaded files by name
    Remove { files: Vec<String> },
    /// Annotate from a JSON file of variant annotations
    Annotate { annotations: String },
    /// Rebuild the sample index (all indexed samples when empty)
    SampleIndex {
        #[serde(default)]
        samples: Vec<String>,
    },
    /// Default cohort statistics
    Stats,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Load { .. } => "load",
            Operation::Remove { .. } => "remove",
            Operation::Annotate { .. } => "annotate",
            Operation::SampleIndex { .. } => "sample-index",
            Operation::Stats => "stats",
        }
    }
}

/// Job payload from the Redis queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: Uuid,
    pub study: String,
    pub operation: Operation,
    /// Load/remove parameters; `study` is taken from the payload
    #[serde(default)]
    pub options: LoadOptions,
}

impl JobPayload {
    pub fn load_options(&self) -> LoadOptions {
        let mut options = self.options.clone();
        options.study = self.study.clone();
        options
    }
}

/// Job queue manager
pub struct JobQueue {
    conn: ConnectionManager,
}

impl JobQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Dequeue a job (blocking pop with timeout)
    pub async fn dequeue(&mut self) -> Result<Option<JobPayload>> {
        let result: Option<(String, String)> = self
            .conn
            .brpop(QUEUE_KEY, 1.0)
            .await
            .context("Failed to pop from queue")?;

        match result {
            Some((_, payload_json)) => {
                let payload: JobPayload = serde_json::from_str(&payload_json)
                    .context("Failed to deserialize job payload")?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    /// Publish progress update to pub/sub channel
    pub async fn publish_progress(&mut self, job_id: Uuid, message: &str) -> Result<()> {
        let channel = format!("variant-storage:progress:{}", job_id);
        self.conn
            .publish::<_, _, ()>(channel, message)
            .await
            .context("Failed to publish progress update")?;
        Ok(())
    }

    /// Store the final report of a job
    pub async fn store_result(&mut self, job_id: Uuid, report: &str) -> Result<()> {
        let key = format!("variant-storage:job_result:{}", job_id);
        self.conn
            .set_ex::<_, _, ()>(key, report, RESULT_TTL_SECS)
            .await
            .context("Failed to store job result")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_defaults() {
        let json = r#"{
            "job_id": "6f1c2e8a-1f0e-4b5c-9a53-3a8f4f1d2c10",
            "study": "cohort1",
            "operation": { "type": "load", "inputs": ["/data/in/chr20.vcf.gz"] },
            "options": { "loadSplitData": "CHROMOSOME", "resume": true }
        }"#;
        let payload: JobPayload = serde_json::from_str(json).unwrap();

        assert_eq!(payload.operation.name(), "load");
        let options = payload.load_options();
        assert_eq!(options.study, "cohort1");
        assert!(options.resume);
        assert_eq!(options.load_split_data, variant_storage::models::SplitData::Chromosome);
        assert!(options.load_archive);
    }

    #[test]
    fn test_operation_without_options() {
        let json = r#"{
            "job_id": "6f1c2e8a-1f0e-4b5c-9a53-3a8f4f1d2c10",
            "study": "cohort1",
            "operation": { "type": "sample-index" }
        }"#;
        let payload: JobPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.operation, Operation::SampleIndex { samples: Vec::new() });
        assert!(!payload.options.force);
    }
}
