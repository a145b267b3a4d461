//! On-disk, append-only tuning database.
//!
//! A database is a directory holding two JSON-lines files: the workload
//! index (one line per distinct task signature) and the trial records. Both
//! files are only ever appended to. The database is bound to the target kind
//! of its first workload.

use crate::record::{TrialRecord, Workload};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use tunebridge_ir::{artifact_file_name, Error, Result, Schedule, TargetKind};

pub const WORKLOAD_FILE: &str = "database_workload.json";
pub const RECORD_FILE: &str = "database_tuning_record.json";

#[derive(Debug)]
pub struct TuningDatabase {
    dir: PathBuf,
    workloads: Vec<Workload>,
    records: Vec<TrialRecord>,
}

/// Per-signature aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkloadStats {
    pub trials: usize,
    pub successes: usize,
    pub failures: usize,
    pub best_latency_ms: Option<f64>,
}

/// Read-only view of a work directory, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseSummary {
    pub path: PathBuf,
    pub exists: bool,
    pub has_workload_file: bool,
    pub has_record_file: bool,
    pub has_artifact: bool,
    /// Regular files in the directory, sorted by name.
    pub files: Vec<String>,
    pub file_count: usize,
    pub workload_count: usize,
    pub record_count: usize,
    pub target_kind: Option<TargetKind>,
}

impl TuningDatabase {
    /// Open the database in `dir`, creating the directory and empty files if needed.
    pub fn open_or_create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;
        for name in [WORKLOAD_FILE, RECORD_FILE] {
            let path = dir.join(name);
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|err| Error::io(&path, err))?;
            seal_tail(&path)?;
        }
        Self::load(dir)
    }

    /// Open a database that must already exist.
    pub fn open_existing(dir: &Path) -> Result<Self> {
        if !Self::exists(dir) {
            return Err(Error::DatabaseNotFound {
                path: dir.to_path_buf(),
            });
        }
        Self::load(dir)
    }

    pub fn exists(dir: &Path) -> bool {
        dir.is_dir() && dir.join(WORKLOAD_FILE).is_file()
    }

    fn load(dir: &Path) -> Result<Self> {
        let workloads = read_lines(&dir.join(WORKLOAD_FILE))?;
        let records = if dir.join(RECORD_FILE).is_file() {
            read_lines(&dir.join(RECORD_FILE))?
        } else {
            Vec::new()
        };
        debug!(
            dir = %dir.display(),
            workloads = workloads.len(),
            records = records.len(),
            "opened tuning database"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            workloads,
            records,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn workloads(&self) -> &[Workload] {
        &self.workloads
    }

    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Target kind the database is bound to, if any workload was committed.
    pub fn target_kind(&self) -> Option<TargetKind> {
        self.workloads.first().map(|workload| workload.target_kind)
    }

    pub fn ensure_target(&self, requested: TargetKind) -> Result<()> {
        match self.target_kind() {
            Some(found) if found != requested => Err(Error::TargetMismatch {
                path: self.dir.clone(),
                found: found.to_string(),
                requested: requested.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn workload(&self, signature: &str) -> Option<&Workload> {
        self.workloads
            .iter()
            .find(|workload| workload.signature == signature)
    }

    /// Id of the workload for `signature`, appending a new index entry if needed.
    pub fn commit_workload(&mut self, signature: &str, kind: TargetKind) -> Result<usize> {
        self.ensure_target(kind)?;
        if let Some(existing) = self.workload(signature) {
            return Ok(existing.id);
        }
        let workload = Workload {
            id: self.workloads.len(),
            signature: signature.to_string(),
            target_kind: kind,
        };
        append_line(&self.dir.join(WORKLOAD_FILE), &workload)?;
        let id = workload.id;
        self.workloads.push(workload);
        Ok(id)
    }

    pub fn commit_record(&mut self, record: TrialRecord) -> Result<()> {
        append_line(&self.dir.join(RECORD_FILE), &record)?;
        self.records.push(record);
        Ok(())
    }

    /// Records for `signature`. The items borrow only the database.
    pub fn records_for<'a, 's>(
        &'a self,
        signature: &'s str,
    ) -> impl Iterator<Item = &'a TrialRecord> + 's
    where
        'a: 's,
    {
        self.records
            .iter()
            .filter(move |record| record.signature == signature)
    }

    /// Lowest-latency successful record for `signature`. Failed builds never qualify.
    pub fn best_for(&self, signature: &str) -> Option<&TrialRecord> {
        self.records_for(signature)
            .filter_map(|record| record.latency_ms().map(|latency| (latency, record)))
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, record)| record)
    }

    pub fn stats_for(&self, signature: &str) -> WorkloadStats {
        let mut stats = WorkloadStats::default();
        for record in self.records_for(signature) {
            stats.trials += 1;
            match record.latency_ms() {
                Some(latency) => {
                    stats.successes += 1;
                    stats.best_latency_ms = Some(
                        stats
                            .best_latency_ms
                            .map_or(latency, |best| best.min(latency)),
                    );
                }
                None => stats.failures += 1,
            }
        }
        stats
    }

    pub fn tried_schedules(&self, signature: &str) -> HashSet<Schedule> {
        self.records_for(signature)
            .map(|record| record.schedule)
            .collect()
    }

    /// Inspect `dir` without creating anything.
    pub fn summarize(dir: &Path) -> Result<DatabaseSummary> {
        let exists = dir.is_dir();
        let mut files = Vec::new();
        if exists {
            for entry in fs::read_dir(dir).map_err(|err| Error::io(dir, err))? {
                let entry = entry.map_err(|err| Error::io(dir, err))?;
                if entry.path().is_file() {
                    files.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            files.sort();
        }
        let (workload_count, record_count, target_kind) = if Self::exists(dir) {
            let db = Self::load(dir)?;
            (db.workloads.len(), db.records.len(), db.target_kind())
        } else {
            (0, 0, None)
        };
        Ok(DatabaseSummary {
            path: dir.to_path_buf(),
            exists,
            has_workload_file: dir.join(WORKLOAD_FILE).is_file(),
            has_record_file: dir.join(RECORD_FILE).is_file(),
            has_artifact: dir.join(artifact_file_name()).is_file(),
            file_count: files.len(),
            files,
            workload_count,
            record_count,
            target_kind,
        })
    }
}

/// Split `bytes` after its last newline. The second half is a line that was
/// never terminated, e.g. by an append cut short.
fn split_tail(bytes: &[u8]) -> (&[u8], &[u8]) {
    match bytes.iter().rposition(|byte| *byte == b'\n') {
        Some(end) => bytes.split_at(end + 1),
        None => bytes.split_at(0),
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let bytes = fs::read(path).map_err(|err| Error::io(path, err))?;
    let (complete, tail) = split_tail(&bytes);
    let mut entries = complete
        .split(|byte| *byte == b'\n')
        .enumerate()
        .filter(|(_, line)| !is_blank(line))
        .map(|(index, line)| {
            serde_json::from_slice(line).map_err(|err| {
                Error::Engine(format!(
                    "corrupt database line {} in {}: {err}",
                    index + 1,
                    path.display()
                ))
            })
        })
        .collect::<Result<Vec<T>>>()?;

    if !is_blank(tail) {
        match serde_json::from_slice(tail) {
            Ok(entry) => entries.push(entry),
            Err(err) => warn!(
                path = %path.display(),
                bytes = tail.len(),
                error = %err,
                "skipping unterminated final database line"
            ),
        }
    }
    Ok(entries)
}

/// Put `path` back on a line boundary before appending to it. A complete
/// entry that lost its newline is kept; a partial one is cut off.
fn seal_tail(path: &Path) -> Result<()> {
    let bytes = fs::read(path).map_err(|err| Error::io(path, err))?;
    let (complete, tail) = split_tail(&bytes);
    if is_blank(tail) {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|err| Error::io(path, err))?;
    if serde_json::from_slice::<serde_json::Value>(tail).is_ok() {
        file.write_all(b"\n").map_err(|err| Error::io(path, err))
    } else {
        warn!(
            path = %path.display(),
            bytes = tail.len(),
            "truncating unterminated final database line"
        );
        file.set_len(complete.len() as u64)
            .map_err(|err| Error::io(path, err))
    }
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value)
        .map_err(|err| Error::Engine(format!("failed to encode database entry: {err}")))?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| Error::io(path, err))?;
    file.write_all(line.as_bytes())
        .map_err(|err| Error::io(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{unix_millis, TrialOutcome};

    fn record(workload_id: usize, signature: &str, tile: usize, latency: Option<f64>) -> TrialRecord {
        let outcome = match latency {
            Some(latency_ms) => TrialOutcome::Built {
                latency_ms,
                samples: vec![latency_ms],
            },
            None => TrialOutcome::BuildFailed {
                reason: "tile too large".into(),
            },
        };
        TrialRecord {
            workload_id,
            signature: signature.into(),
            task: "t".into(),
            schedule: Schedule {
                tile_m: tile,
                ..Schedule::default()
            },
            outcome,
            target: "llvm -keys=cpu -num-cores=2".into(),
            target_kind: TargetKind::Cpu,
            trial: 0,
            timestamp_ms: unix_millis(),
        }
    }

    #[test]
    fn missing_database_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = TuningDatabase::open_existing(&dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind_name(), "DatabaseNotFoundError");
        // An empty directory is not a database either.
        assert!(TuningDatabase::open_existing(dir.path()).is_err());
    }

    #[test]
    fn records_persist_and_best_skips_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = TuningDatabase::open_or_create(dir.path()).expect("create");
        let id = db.commit_workload("sig", TargetKind::Cpu).expect("workload");
        assert_eq!(db.commit_workload("sig", TargetKind::Cpu).expect("again"), id);

        db.commit_record(record(id, "sig", 8, Some(2.0))).expect("commit");
        db.commit_record(record(id, "sig", 16, None)).expect("commit");
        db.commit_record(record(id, "sig", 4, Some(1.5))).expect("commit");

        let reopened = TuningDatabase::open_existing(dir.path()).expect("reopen");
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.workloads().len(), 1);
        let best = reopened.best_for("sig").expect("best");
        assert_eq!(best.schedule.tile_m, 4);
        let stats = reopened.stats_for("sig");
        assert_eq!((stats.trials, stats.successes, stats.failures), (3, 2, 1));
        assert_eq!(stats.best_latency_ms, Some(1.5));
        assert!(reopened.best_for("other").is_none());
    }

    #[test]
    fn only_failed_records_yield_no_best() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = TuningDatabase::open_or_create(dir.path()).expect("create");
        let id = db.commit_workload("sig", TargetKind::Cpu).expect("workload");
        db.commit_record(record(id, "sig", 8, None)).expect("commit");
        assert!(db.best_for("sig").is_none());
    }

    #[test]
    fn database_is_bound_to_its_first_target_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = TuningDatabase::open_or_create(dir.path()).expect("create");
        db.commit_workload("sig", TargetKind::Cpu).expect("workload");
        let err = db.commit_workload("other", TargetKind::Cuda).unwrap_err();
        assert_eq!(err.kind_name(), "TargetMismatchError");
        assert!(db.ensure_target(TargetKind::Cpu).is_ok());
    }

    #[test]
    fn summary_describes_work_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = TuningDatabase::summarize(&dir.path().join("missing")).expect("summary");
        assert!(!missing.exists);
        assert_eq!(missing.file_count, 0);

        let mut db = TuningDatabase::open_or_create(dir.path()).expect("create");
        let id = db.commit_workload("sig", TargetKind::Cpu).expect("workload");
        db.commit_record(record(id, "sig", 8, Some(1.0))).expect("commit");
        let summary = TuningDatabase::summarize(dir.path()).expect("summary");
        assert!(summary.exists && summary.has_workload_file && summary.has_record_file);
        assert!(!summary.has_artifact);
        assert_eq!(summary.file_count, 2);
        assert_eq!(summary.record_count, 1);
        assert_eq!(summary.target_kind, Some(TargetKind::Cpu));
    }

    #[test]
    fn best_record_outlives_the_signature_borrow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = TuningDatabase::open_or_create(dir.path()).expect("create");
        let id = db.commit_workload("sig", TargetKind::Cpu).expect("workload");
        db.commit_record(record(id, "sig", 8, Some(1.0))).expect("commit");

        let best = {
            let signature = String::from("sig");
            db.best_for(&signature)
        };
        assert_eq!(best.map(|record| record.schedule.tile_m), Some(8));
    }

    #[test]
    fn interrupted_append_does_not_lose_the_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = TuningDatabase::open_or_create(dir.path()).expect("create");
        let id = db.commit_workload("sig", TargetKind::Cpu).expect("workload");
        db.commit_record(record(id, "sig", 8, Some(2.0))).expect("commit");

        let records = dir.path().join(RECORD_FILE);
        let mut file = OpenOptions::new().append(true).open(&records).expect("open");
        file.write_all(br#"{"workload_id":0,"signa"#).expect("partial");
        drop(file);

        let reopened = TuningDatabase::open_existing(dir.path()).expect("reopen");
        assert_eq!(reopened.len(), 1);

        let mut db = TuningDatabase::open_or_create(dir.path()).expect("reopen for append");
        db.commit_record(record(id, "sig", 4, Some(1.0))).expect("commit");
        let reopened = TuningDatabase::open_existing(dir.path()).expect("reopen");
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.best_for("sig").map(|best| best.schedule.tile_m), Some(4));
    }

    #[test]
    fn unterminated_complete_entry_is_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = TuningDatabase::open_or_create(dir.path()).expect("create");
        let id = db.commit_workload("sig", TargetKind::Cpu).expect("workload");
        let line = serde_json::to_string(&record(id, "sig", 8, Some(2.0))).expect("encode");
        fs::write(dir.path().join(RECORD_FILE), line).expect("write");

        let mut db = TuningDatabase::open_or_create(dir.path()).expect("reopen");
        assert_eq!(db.len(), 1);
        db.commit_record(record(id, "sig", 4, Some(1.0))).expect("commit");
        assert_eq!(TuningDatabase::open_existing(dir.path()).expect("reopen").len(), 2);
    }

    #[test]
    fn corrupt_lines_are_engine_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(WORKLOAD_FILE), "{broken\n").expect("write");
        let err = TuningDatabase::open_existing(dir.path()).unwrap_err();
        assert_eq!(err.kind_name(), "EngineError");
    }
}
