//! Plugin response processor
//!
//! Translates a plugin's `PluginOutcome` into a terminal execution status and
//! result string (§4.6), and carries out its declared `cache`/`file`/`db`
//! data operations. Each operation is independent: one failing is recorded
//! in the result string but never blocks the others, and a panicking plugin
//! is caught rather than taking the scheduler down with it.

use crate::client::CoordinatorClient;
use crate::plugins::{DataOperation, DataOperationKind, Plugin};
use shared::{utils, ExecutionStatus};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

const CACHE_TTL_SECONDS: u64 = 3600;

pub struct ResponseProcessor {
    client: CoordinatorClient,
    plugin_outputs_dir: PathBuf,
    hostname: String,
}

impl ResponseProcessor {
    pub fn new(client: CoordinatorClient, plugin_outputs_dir: PathBuf, hostname: String) -> Self {
        Self {
            client,
            plugin_outputs_dir,
            hostname,
        }
    }

    /// Invokes `plugin`, catching a panic the same as any other failure,
    /// performs its requested data operations, and returns the terminal
    /// status plus the full result string to report back to the coordinator.
    pub async fn process(
        &self,
        plugin: &dyn Plugin,
        task_id: &str,
        action: &str,
        args: &[serde_json::Value],
        kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> (ExecutionStatus, String) {
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| plugin.invoke(action, args, kwargs)));

        let outcome = match invoked {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return (ExecutionStatus::Failed, e.to_string()),
            Err(_) => {
                return (
                    ExecutionStatus::Failed,
                    format!("plugin '{}' panicked", plugin.name()),
                )
            }
        };

        let status = if (200..300).contains(&outcome.status_code) {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };

        let lines = self.run_data_operations(task_id, &outcome.data).await;
        let result = if lines.is_empty() {
            outcome.message
        } else {
            format!(
                "{}\nData Operations:\n{}",
                outcome.message,
                lines.join("\n")
            )
        };

        (status, result)
    }

    async fn run_data_operations(&self, task_id: &str, ops: &[DataOperation]) -> Vec<String> {
        let futures = ops.iter().map(|op| self.run_one(task_id, op));
        futures_util::future::join_all(futures).await
    }

    async fn run_one(&self, task_id: &str, op: &DataOperation) -> String {
        let label = format!("  - {:?} {}", op.kind, op.name);
        let outcome = match op.kind {
            DataOperationKind::Cache => self.write_cache(task_id, op).await,
            DataOperationKind::File => self.write_file(task_id, op).await,
            DataOperationKind::Db => self.write_db(task_id, op).await,
        };
        match outcome {
            Ok(()) => format!("{label}: ok"),
            Err(e) => format!("{label}: failed ({e})"),
        }
    }

    async fn write_cache(&self, task_id: &str, op: &DataOperation) -> anyhow::Result<()> {
        let key = format!("plugin_{}_{}", task_id, op.name);
        self.client
            .set_cache(&key, op.value.clone(), Some(CACHE_TTL_SECONDS))
            .await
    }

    async fn write_file(&self, task_id: &str, op: &DataOperation) -> anyhow::Result<()> {
        let basename = utils::sanitize_file_path(&op.name)?;
        let dir = self.plugin_outputs_dir.join(task_id).join(&self.hostname);
        tokio::fs::create_dir_all(&dir).await?;

        let contents = match &op.value {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other)?,
        };
        tokio::fs::write(dir.join(basename), contents).await?;
        Ok(())
    }

    async fn write_db(&self, task_id: &str, op: &DataOperation) -> anyhow::Result<()> {
        let sub_task_id = format!("{}_data_{}", task_id, op.name);
        let execution_id = utils::make_execution_id(&sub_task_id, &self.hostname);
        self.client
            .post_execution_result(
                &execution_id,
                &sub_task_id,
                ExecutionStatus::Success,
                &serde_json::to_string(&op.value)?,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginOutcome;
    use serde_json::Map;

    fn processor() -> ResponseProcessor {
        let client = CoordinatorClient::new(
            "http://127.0.0.1:1".to_string(),
            "worker-01".to_string(),
            1,
            10,
            20,
        )
        .unwrap();
        ResponseProcessor::new(client, PathBuf::from("/tmp/octopus-test-outputs"), "worker-01".to_string())
    }

    struct OkPlugin;
    impl Plugin for OkPlugin {
        fn name(&self) -> &'static str {
            "ok"
        }
        fn actions(&self) -> &[&str] {
            &["run"]
        }
        fn invoke(
            &self,
            _action: &str,
            _args: &[serde_json::Value],
            _kwargs: &Map<String, serde_json::Value>,
        ) -> anyhow::Result<PluginOutcome> {
            Ok(PluginOutcome {
                status_code: 201,
                message: "done".to_string(),
                data: vec![],
            })
        }
    }

    struct FailingPlugin;
    impl Plugin for FailingPlugin {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn actions(&self) -> &[&str] {
            &["run"]
        }
        fn invoke(
            &self,
            _action: &str,
            _args: &[serde_json::Value],
            _kwargs: &Map<String, serde_json::Value>,
        ) -> anyhow::Result<PluginOutcome> {
            Ok(PluginOutcome {
                status_code: 500,
                message: "boom".to_string(),
                data: vec![],
            })
        }
    }

    struct PanickingPlugin;
    impl Plugin for PanickingPlugin {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn actions(&self) -> &[&str] {
            &["run"]
        }
        fn invoke(
            &self,
            _action: &str,
            _args: &[serde_json::Value],
            _kwargs: &Map<String, serde_json::Value>,
        ) -> anyhow::Result<PluginOutcome> {
            panic!("plugin exploded");
        }
    }

    #[tokio::test]
    async fn test_process_maps_2xx_to_success() {
        let processor = processor();
        let (status, result) = processor
            .process(&OkPlugin, "task-1", "run", &[], &Map::new())
            .await;
        assert_eq!(status, ExecutionStatus::Success);
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn test_process_maps_5xx_to_failed() {
        let processor = processor();
        let (status, _) = processor
            .process(&FailingPlugin, "task-1", "run", &[], &Map::new())
            .await;
        assert_eq!(status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_process_catches_panicking_plugin() {
        let processor = processor();
        let (status, result) = processor
            .process(&PanickingPlugin, "task-1", "run", &[], &Map::new())
            .await;
        assert_eq!(status, ExecutionStatus::Failed);
        assert!(result.contains("panicked"));
    }

    #[tokio::test]
    async fn test_write_file_sandboxes_path_traversal() {
        let processor = processor();
        let op = DataOperation {
            kind: DataOperationKind::File,
            name: "../../etc/passwd".to_string(),
            value: serde_json::Value::String("x".to_string()),
        };
        processor.write_file("task-traversal", &op).await.unwrap();

        let expected = processor
            .plugin_outputs_dir
            .join("task-traversal")
            .join("worker-01")
            .join("passwd");
        assert!(expected.exists());
        tokio::fs::remove_dir_all(processor.plugin_outputs_dir.join("task-traversal"))
            .await
            .ok();
    }
}
