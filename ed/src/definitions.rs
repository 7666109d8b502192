//! Task and schedule definition files
//!
//! ```yaml
//! tasks:
//!   - taskType: img
//!     url: http://a.example/favicon.ico
//! schedules:
//!   - priority: 1
//!     max-duration-secs: 3600
//!     max-measurements: 500
//!     matching-parameters:
//!       taskType: img
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use encorestore::{NewSchedule, Parameters};
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::state::StoreManager;

/// One schedule entry of a definitions file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub priority: i64,

    #[serde(rename = "max-duration-secs")]
    pub max_duration_secs: u64,

    #[serde(rename = "max-measurements", default)]
    pub max_measurements: Option<i64>,

    #[serde(rename = "max-rate-per-second", default)]
    pub max_rate_per_second: Option<i64>,

    #[serde(rename = "matching-parameters", default)]
    pub matching_parameters: Parameters,
}

impl From<ScheduleEntry> for NewSchedule {
    fn from(entry: ScheduleEntry) -> Self {
        NewSchedule {
            priority: entry.priority,
            max_duration: Duration::from_secs(entry.max_duration_secs),
            max_measurements: entry.max_measurements,
            max_rate_per_second: entry.max_rate_per_second,
            matching_parameters: entry.matching_parameters,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Definitions {
    pub tasks: Vec<Parameters>,
    pub schedules: Vec<ScheduleEntry>,
}

impl Definitions {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Definitions::load: called");
        let content = fs::read_to_string(path).context("Failed to read definitions file")?;
        let definitions = Self::parse(&content).wrap_err_with(|| format!("Invalid definitions in {}", path.display()))?;
        info!(
            path = %path.display(),
            tasks = definitions.tasks.len(),
            schedules = definitions.schedules.len(),
            "Loaded definitions"
        );
        Ok(definitions)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let definitions: Self = serde_yaml::from_str(content).context("Failed to parse definitions")?;
        definitions.validate()?;
        Ok(definitions)
    }

    /// Every task needs a non-null `taskType`
    pub fn validate(&self) -> Result<()> {
        for (i, task) in self.tasks.iter().enumerate() {
            if !matches!(task.get("taskType"), Some(Some(_))) {
                return Err(eyre!("Task #{} has no taskType", i + 1));
            }
        }
        Ok(())
    }

    /// Write tasks, then schedules, returning the new ids of each
    pub async fn apply(self, store: &StoreManager) -> Result<(Vec<i64>, Vec<i64>)> {
        debug!("Definitions::apply: called");
        let task_ids = store.write_tasks(self.tasks).await.context("Failed to write tasks")?;
        let schedule_ids = store
            .write_schedules(self.schedules.into_iter().map(NewSchedule::from).collect())
            .await
            .context("Failed to write schedules")?;
        Ok((task_ids, schedule_ids))
    }
}

#[cfg(test)]
mod tests {
    use encorestore::Store;

    use super::*;

    const DEFINITIONS: &str = r#"
tasks:
  - taskType: img
    url: http://a.example/favicon.ico
  - taskType: css
    url: http://b.example/style.css
    note: null
schedules:
  - priority: 1
    max-duration-secs: 3600
    max-measurements: 500
    matching-parameters:
      taskType: img
  - priority: 2
    max-duration-secs: 60
"#;

    #[test]
    fn test_parse() {
        let definitions = Definitions::parse(DEFINITIONS).unwrap();
        assert_eq!(definitions.tasks.len(), 2);
        assert_eq!(definitions.tasks[1].get("note"), Some(&None));

        let schedule = NewSchedule::from(definitions.schedules[0].clone());
        assert_eq!(schedule.max_duration, Duration::from_secs(3600));
        assert_eq!(schedule.max_measurements, Some(500));
        assert!(definitions.schedules[1].matching_parameters.is_empty());
    }

    #[test]
    fn test_task_without_type_is_rejected() {
        let err = Definitions::parse("tasks:\n  - url: http://a.example/\n").unwrap_err();
        assert!(err.to_string().contains("taskType"));
    }

    #[tokio::test]
    async fn test_apply() {
        let store = StoreManager::with_store(Store::open_in_memory().unwrap());
        let (tasks, schedules) = Definitions::parse(DEFINITIONS).unwrap().apply(&store).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(schedules.len(), 2);
        assert_eq!(store.list_schedules().await.unwrap()[0].priority, 1);
        store.shutdown().await.unwrap();
    }
}
