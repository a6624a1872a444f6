//! Report persistence and shape export.
//!
//! ```text
//! CalibrationReport ─► ReportSink::persist() ─► link (file path)
//! ShapeStore        ─► export_shapes_jsonl() ─► one canonical packet per line
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::crypto::canonical_json;
use crate::decoder::CalibrationReport;
use crate::storage::ShapeStore;
use crate::Result;

/// Destination for persisted calibration reports.
pub trait ReportSink: Send + Sync {
    /// Persist `report` and return a link to it.
    fn persist(&self, report: &CalibrationReport) -> Result<String>;
}

/// Writes each report as a pretty-printed JSON file in one directory.
#[derive(Debug)]
pub struct JsonDirSink {
    dir: PathBuf,
    seq: AtomicU64,
}

impl JsonDirSink {
    /// Creates `dir` if missing.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, seq: AtomicU64::new(0) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(&self, report: &CalibrationReport) -> String {
        let id: String = report
            .constellation_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!(
            "calibration-{id}-{}-{}.json",
            report.created_at.format("%Y%m%dT%H%M%S%3fZ"),
            self.seq.fetch_add(1, Ordering::Relaxed)
        )
    }
}

impl ReportSink for JsonDirSink {
    fn persist(&self, report: &CalibrationReport) -> Result<String> {
        let path = self.dir.join(self.file_name(report));
        let mut file = std::fs::File::create(&path)?;
        write_calibration_report(report, &mut file)?;
        debug!(path = %path.display(), "persisted calibration report");
        Ok(path.display().to_string())
    }
}

/// Pretty JSON followed by a newline.
pub fn write_calibration_report(report: &CalibrationReport, writer: &mut dyn Write) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, report)?;
    writeln!(writer)?;
    Ok(())
}

/// Export every stored packet as canonical JSON, oldest insert first.
///
/// Returns the number of packets written. Shapes evicted while the export
/// runs are skipped.
pub fn export_shapes_jsonl<S: ShapeStore + ?Sized>(store: &S, writer: &mut dyn Write) -> Result<usize> {
    let mut written = 0;
    for key in store.keys() {
        let Some(packet) = store.get(&key)? else {
            continue;
        };
        writer.write_all(&canonical_json(packet.as_ref())?)?;
        writeln!(writer)?;
        written += 1;
    }
    Ok(written)
}
