//! Output formatting for CLI commands.
//!
//! Every command builds a DTO and hands it to [`OutputWriter::write`]
//! together with a closure producing the human-readable text.

use anyhow::Result;
use loadkeep_core::{Action, ContentHash, GamePath, GroupId, GroupKind};
use serde::Serialize;
use std::io::{self, Write};

/// Exit code for success.
pub const EXIT_OK: u8 = 0;
/// Exit code for any failure other than a conflict.
pub const EXIT_FAILURE: u8 = 1;
/// Exit code when apply stopped because disk changed since the last run.
pub const EXIT_CONFLICT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write `data` as JSON, or the result of `text_fn` in text mode.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr, as a JSON object in JSON mode.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub config: String,
    pub data_dir: String,
    pub written: bool,
}

#[derive(Debug, Serialize)]
pub struct IndexOutput {
    pub success: bool,
    pub result_code: u8,
    pub installation: String,
    pub generation: u64,
    pub files: usize,
    pub bytes: u64,
    pub stored: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackedUpFile {
    pub hash: ContentHash,
    pub size: u64,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct BackupOutput {
    pub success: bool,
    pub result_code: u8,
    pub files: Vec<BackedUpFile>,
    pub stored: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExtractOutput {
    pub success: bool,
    pub result_code: u8,
    pub hash: ContentHash,
    pub destination: String,
}

#[derive(Debug, Serialize)]
pub struct GcOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    pub containers_deleted: usize,
    pub entries_retracted: usize,
    pub bytes_freed: u64,
    pub stale_temp_files: usize,
}

/// Summary line for one loadout.
#[derive(Debug, Clone, Serialize)]
pub struct LoadoutInfo {
    pub id: String,
    pub name: String,
    pub installation: String,
    pub revision: u64,
    pub groups: usize,
    pub files: usize,
}

#[derive(Debug, Serialize)]
pub struct LoadoutCreateOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub loadout: LoadoutInfo,
}

#[derive(Debug, Serialize)]
pub struct LoadoutListOutput {
    pub success: bool,
    pub result_code: u8,
    pub loadouts: Vec<LoadoutInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub id: GroupId,
    pub name: String,
    pub collection: String,
    pub kind: GroupKind,
    pub priority: u32,
    pub enabled: bool,
    pub active: bool,
    pub files: usize,
}

#[derive(Debug, Serialize)]
pub struct LoadoutShowOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub loadout: LoadoutInfo,
    /// Groups in conflict priority order.
    pub group_list: Vec<GroupInfo>,
    /// Paths claimed by more than one active group.
    pub conflicts: Vec<PathConflict>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathConflict {
    pub path: GamePath,
    pub winner: String,
    pub losers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ModImportOutput {
    pub success: bool,
    pub result_code: u8,
    pub loadout: String,
    pub group: GroupId,
    pub name: String,
    pub files: usize,
    pub bytes: u64,
    pub stored: usize,
    pub revision: u64,
}

/// Output for `mod enable|disable|move|remove`.
#[derive(Debug, Serialize)]
pub struct ModChangeOutput {
    pub success: bool,
    pub result_code: u8,
    pub loadout: String,
    pub group: String,
    pub change: String,
    pub revision: u64,
}

#[derive(Debug, Serialize)]
pub struct PlanOutput {
    pub success: bool,
    pub result_code: u8,
    pub loadout: String,
    pub mode: String,
    pub actions: Vec<Action>,
    pub conflicts: Vec<GamePath>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyInfo {
    pub generation: u64,
    pub backed_up: usize,
    pub deleted: usize,
    pub extracted: usize,
    pub adopted: usize,
    pub removed_dirs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestInfo {
    pub generation: u64,
    pub revision: u64,
    pub backed_up: usize,
    pub created: usize,
    pub removed: usize,
}

#[derive(Debug, Serialize)]
pub struct ApplyOutput {
    pub success: bool,
    pub result_code: u8,
    pub loadout: String,
    pub finished_at: String,
    #[serde(flatten)]
    pub applied: ApplyInfo,
}

#[derive(Debug, Serialize)]
pub struct IngestOutput {
    pub success: bool,
    pub result_code: u8,
    pub loadout: String,
    pub finished_at: String,
    #[serde(flatten)]
    pub ingested: IngestInfo,
}

#[derive(Debug, Serialize)]
pub struct SyncOutput {
    pub success: bool,
    pub result_code: u8,
    pub loadout: String,
    pub finished_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingested: Option<IngestInfo>,
    pub applied: ApplyInfo,
}

impl From<&loadkeep_core::ApplyReport> for ApplyInfo {
    fn from(report: &loadkeep_core::ApplyReport) -> Self {
        Self {
            generation: report.generation,
            backed_up: report.backed_up,
            deleted: report.deleted,
            extracted: report.extracted,
            adopted: report.adopted,
            removed_dirs: report.removed_dirs,
        }
    }
}

impl From<&loadkeep_core::IngestReport> for IngestInfo {
    fn from(report: &loadkeep_core::IngestReport) -> Self {
        Self {
            generation: report.generation,
            revision: report.revision,
            backed_up: report.backed_up,
            created: report.created,
            removed: report.removed,
        }
    }
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_error_output_shape() {
        let output = ErrorOutput {
            success: false,
            result_code: EXIT_CONFLICT,
            error: "conflict".into(),
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["result_code"], 2);
    }
}
