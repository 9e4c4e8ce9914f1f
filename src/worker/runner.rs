//! Stage runners: the processing step a worker performs for one item.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::{PipelineConfig, StageConfig};
use crate::error::{Error, Result};
use crate::model::{ItemRef, Stage};

/// The opaque processing step. Any error it returns is treated as a
/// per-item failure by the claim protocol.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, item: &ItemRef, stage: Stage) -> Result<()>;
}

/// Runs the external command configured for each stage.
///
/// The command sees `BATCHTRACK_ITEM`, `BATCHTRACK_GROUP` and
/// `BATCHTRACK_STAGE` in its environment.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    commands: BTreeMap<Stage, StageConfig>,
}

impl CommandRunner {
    pub fn new(commands: BTreeMap<Stage, StageConfig>) -> Self {
        Self { commands }
    }

    pub fn from_pipeline(pipeline: &PipelineConfig) -> Self {
        Self::new(pipeline.stage_commands())
    }

    pub fn has_stage(&self, stage: Stage) -> bool {
        self.commands.contains_key(&stage)
    }
}

/// Relative paths resolve against the process working directory. Bare
/// program names are left for `PATH` lookup.
fn resolve(command: &std::path::Path) -> Result<PathBuf> {
    if command.is_relative() && command.components().count() > 1 {
        Ok(std::env::current_dir()?.join(command))
    } else {
        Ok(command.to_path_buf())
    }
}

#[async_trait]
impl StageRunner for CommandRunner {
    async fn run(&self, item: &ItemRef, stage: Stage) -> Result<()> {
        let config = self.commands.get(&stage).ok_or_else(|| {
            Error::WorkerExecution(format!("no command configured for stage {stage}"))
        })?;
        let command = resolve(&config.command)?;

        debug!(%item, %stage, command = %command.display(), "running stage command");

        let status = Command::new(&command)
            .args(&config.args)
            .env("BATCHTRACK_ITEM", &item.item_key)
            .env("BATCHTRACK_GROUP", item.group_key.to_string())
            .env("BATCHTRACK_STAGE", stage.as_str())
            .status()
            .await
            .map_err(|e| {
                Error::WorkerExecution(format!("failed to start {}: {e}", command.display()))
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::WorkerExecution(format!(
                "{} exited with {status}",
                command.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GroupKey;

    fn shell(script: &str) -> StageConfig {
        StageConfig {
            command: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn runner(stage: Stage, script: &str) -> CommandRunner {
        CommandRunner::new(BTreeMap::from([(stage, shell(script))]))
    }

    #[tokio::test]
    async fn command_sees_item_environment() {
        let script = [
            r#"test "$BATCHTRACK_ITEM" = A_0"#,
            r#"test "$BATCHTRACK_GROUP" = 4"#,
            r#"test "$BATCHTRACK_STAGE" = segmented"#,
        ]
        .join(" && ");
        let runner = runner(Stage::Segmented, &script);
        let item = ItemRef::new(GroupKey(4), "A_0");
        runner.run(&item, Stage::Segmented).await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_worker_error() {
        let runner = runner(Stage::Segmented, "exit 3");
        let item = ItemRef::new(GroupKey(0), "A_0");
        let err = runner.run(&item, Stage::Segmented).await.unwrap_err();
        assert!(matches!(err, Error::WorkerExecution(_)));
    }

    #[tokio::test]
    async fn missing_stage_command_is_worker_error() {
        let runner = runner(Stage::Segmented, "exit 0");
        assert!(!runner.has_stage(Stage::Parcellated));
        let item = ItemRef::new(GroupKey(0), "A_0");
        let err = runner.run(&item, Stage::Parcellated).await.unwrap_err();
        assert!(matches!(err, Error::WorkerExecution(_)));
    }

    #[tokio::test]
    async fn spawn_failure_is_worker_error() {
        let runner = CommandRunner::new(BTreeMap::from([(
            Stage::Segmented,
            StageConfig {
                command: PathBuf::from("/nonexistent/batchtrack-stage"),
                args: Vec::new(),
            },
        )]));
        let item = ItemRef::new(GroupKey(0), "A_0");
        let err = runner.run(&item, Stage::Segmented).await.unwrap_err();
        assert!(matches!(err, Error::WorkerExecution(_)));
    }
}
