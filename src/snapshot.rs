//! Snapshots of compiled scripts, for replaying or inspecting a run later.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compiler::CompiledResult;
use crate::variable::VariableTable;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub format_version: u32,
    pub source_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShireFileSnapshot {
    pub source_file: Option<String>,
    pub seed: u64,
    pub variables: VariableTable,
    /// Full script source.
    pub raw_all_text: String,
    /// Output produced before the run stopped or handed off.
    pub executed_prefix_text: String,
    pub metadata: SnapshotMetadata,
}

impl ShireFileSnapshot {
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        let snapshot: Self = serde_json::from_str(json)?;
        if snapshot.metadata.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.metadata.format_version));
        }
        Ok(snapshot)
    }
}

/// Hands out increasing seeds so snapshots of one process sort by capture order.
#[derive(Debug, Default)]
pub struct SnapshotRecorder {
    next_seed: AtomicU64,
}

impl SnapshotRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_seed(&self) -> u64 {
        self.next_seed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn capture(&self, compiled: &CompiledResult, source_file: Option<&str>) -> ShireFileSnapshot {
        let source_file = source_file.map(str::to_string);
        let executed_prefix_text = compiled
            .agent_invocation
            .as_ref()
            .map(|agent| agent.context.clone())
            .unwrap_or_else(|| compiled.output.clone());
        ShireFileSnapshot {
            source_file: source_file.clone(),
            seed: self.next_seed(),
            variables: compiled.variables.clone(),
            raw_all_text: compiled.input.clone(),
            executed_prefix_text,
            metadata: SnapshotMetadata {
                created_at: Utc::now(),
                format_version: SNAPSHOT_FORMAT_VERSION,
                source_file,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::source::FileSystemContext;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_capture_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let compiled = Compiler::default()
            .compile(
                "---\nvariables:\n  greeting: \"hi\"\n---\n$greeting there @agent rest",
                &FileSystemContext::new(dir.path()),
                HashMap::new(),
            )
            .await;

        let recorder = SnapshotRecorder::new();
        let first = recorder.capture(&compiled, Some("hello.shire"));
        let second = recorder.capture(&compiled, None);
        assert!(second.seed > first.seed);
        assert_eq!(first.executed_prefix_text, "hi there ");
        assert_eq!(first.metadata.format_version, 1);

        let json = first.to_json().unwrap();
        let restored = ShireFileSnapshot::from_json(&json).unwrap();
        assert_eq!(restored, first);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let recorder = SnapshotRecorder::new();
        let mut snapshot = recorder.capture(&crate::compiler::CompiledResult::new("x"), None);
        snapshot.metadata.format_version = 7;
        let json = snapshot.to_json().unwrap();
        assert!(matches!(
            ShireFileSnapshot::from_json(&json),
            Err(SnapshotError::UnsupportedVersion(7))
        ));
    }
}
