//! Sources and jobs file
//!
//! ```toml
//! [[sources]]
//! id = "crm"
//! kind = "jsonl"
//! path = "data/crm.jsonl"
//! timestamp_field = "updated_at"
//!
//! [[jobs]]
//! name = "crm-contacts"
//! source = "crm"
//! cron = "*/5 * * * *"
//! priority = 10
//!
//! [jobs.pull]
//! checkpoint_field = "updated_at"
//! checkpoint_type = "datetime"
//! batch_size = 500
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::sync::cleanse::CleansingRules;
use crate::sync::connector::{ConnectorRegistry, SourceConfig};
use crate::sync::models::{PullConfig, SyncJob};
use crate::sync::orchestrator::RetryPolicy;
use crate::sync::transform::TransformRules;

fn default_true() -> bool {
    true
}

/// One `[[jobs]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub source: String,
    pub cron: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub pull: PullConfig,
    /// Falls back to the `SYNC_*` retry settings
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub transform: TransformRules,
    #[serde(default)]
    pub cleansing: CleansingRules,
}

impl JobDefinition {
    pub fn to_job(&self, settings: &SyncSettings) -> SyncJob {
        let mut job = SyncJob::new(&self.name, &self.source, &self.cron, self.pull.clone())
            .with_priority(self.priority)
            .with_retry_policy(self.retry.unwrap_or_else(|| settings.default_retry_policy()))
            .with_timeout(self.timeout_secs.map(Duration::from_secs).unwrap_or_else(|| settings.job_timeout()))
            .with_transform_rules(self.transform.clone())
            .with_cleansing_rules(self.cleansing.clone());
        job.enabled = self.enabled;
        job
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobsFile {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl JobsFile {
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::config(format!("Cannot read jobs file {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> SyncResult<Self> {
        let file: JobsFile =
            toml::from_str(content).map_err(|e| SyncError::config(format!("Invalid jobs file: {}", e)))?;
        file.validate()?;
        Ok(file)
    }

    /// Unique source ids and job names, and every job points at a declared source
    pub fn validate(&self) -> SyncResult<()> {
        let mut source_ids = HashSet::new();
        for source in &self.sources {
            if !source_ids.insert(source.id.as_str()) {
                return Err(SyncError::config(format!("Duplicate source id '{}'", source.id)));
            }
        }

        let mut names = HashSet::new();
        for job in &self.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(SyncError::config(format!("Duplicate job name '{}'", job.name)));
            }
            if !source_ids.contains(job.source.as_str()) {
                return Err(SyncError::config(format!(
                    "Job '{}' references undeclared source '{}'",
                    job.name, job.source
                )));
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> SyncResult<ConnectorRegistry> {
        ConnectorRegistry::from_sources(&self.sources)
    }

    pub fn to_jobs(&self, settings: &SyncSettings) -> Vec<SyncJob> {
        self.jobs.iter().map(|j| j.to_job(settings)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use syncpipe_common::FieldType;

    const FILE: &str = r#"
        [[sources]]
        id = "crm"
        kind = "jsonl"
        path = "/tmp/crm.jsonl"
        timestamp_field = "updated_at"

        [[jobs]]
        name = "contacts"
        source = "crm"
        cron = "*/5 * * * *"
        priority = 3
        timeout_secs = 120

        [jobs.pull]
        checkpoint_field = "updated_at"
        batch_size = 100

        [jobs.retry]
        base_delay = 10
        max_delay = 300
        max_retries = 2

        [[jobs.transform.normalization]]
        fields = ["email"]
        ops = ["trim", "lowercase"]

        [jobs.cleansing]
        score_threshold = 0.5

        [jobs.cleansing.dedup]
        key_fields = ["email"]

        [[jobs.cleansing.validations]]
        field = "email"
        check = "pattern"
        regex = "^[^@]+@[^@]+$"
    "#;

    #[test]
    fn test_parse_and_build_jobs() {
        let file = JobsFile::parse(FILE).unwrap();
        let jobs = file.to_jobs(&SyncSettings::default());
        assert_eq!(jobs.len(), 1);

        let job = &jobs[0];
        assert_eq!(job.id, SyncJob::id_for_name("contacts"));
        assert_eq!(job.priority, 3);
        assert_eq!(job.timeout, Duration::from_secs(120));
        assert_eq!(job.retry_policy.max_retries, 2);
        assert_eq!(job.pull.checkpoint_type, FieldType::Datetime);
        assert_eq!(job.pull.batch_size, 100);
        assert_eq!(job.transform_rules.normalization.len(), 1);
        assert_eq!(job.cleansing_rules.score_threshold, 0.5);
        assert!(job.enabled);
    }

    #[test]
    fn test_defaults_come_from_settings() {
        let file = JobsFile::parse(&FILE.replace("timeout_secs = 120", "")).unwrap();
        let settings = SyncSettings {
            job_timeout_secs: 42,
            ..SyncSettings::default()
        };
        assert_eq!(file.to_jobs(&settings)[0].timeout, Duration::from_secs(42));
    }

    #[test]
    fn test_undeclared_source_rejected() {
        let err = JobsFile::parse(&FILE.replace("source = \"crm\"", "source = \"erp\"")).unwrap_err();
        assert!(err.to_string().contains("undeclared source 'erp'"));
    }

    #[test]
    fn test_duplicate_job_names_rejected() {
        let file = JobsFile {
            sources: JobsFile::parse(FILE).unwrap().sources,
            jobs: vec![
                JobsFile::parse(FILE).unwrap().jobs[0].clone(),
                JobsFile::parse(FILE).unwrap().jobs[0].clone(),
            ],
        };
        assert!(matches!(file.validate(), Err(SyncError::Config(_))));
    }
}
