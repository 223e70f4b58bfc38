//! Run persistence - Store runs, snapshots and audit events to disk
//!
//! Directory structure:
//! ```text
//! .cua-data/
//!   runs/
//!     {run_id}/
//!       run.json       # Run record (status, plan history)
//!       events.jsonl   # Durable event log (newline-delimited JSON)
//!       snapshot.json  # Handback snapshot, replaced as a whole
//!       result.json    # Latest step-loop result
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cua_core::event::RunEvent;
use cua_core::run::{Run, RunResult, RunStatus};
use cua_core::snapshot::HandbackSnapshot;

use crate::bus::EventSink;
use crate::error::{Result, RunnerError};

/// Run store for persisting runs, snapshots and events
#[derive(Debug, Clone)]
pub struct RunStore {
    /// Base directory for run storage
    base_dir: PathBuf,
    /// Serializes read-modify-write cycles on run records
    write_lock: Arc<Mutex<()>>,
}

impl RunStore {
    /// Create a new run store
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: data_dir.as_ref().join("runs"),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Get the directory path for a specific run
    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.base_dir.join(run_id.to_string())
    }

    fn run_metadata_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("events.jsonl")
    }

    fn snapshot_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("snapshot.json")
    }

    fn result_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("result.json")
    }

    /// Ensure the run directory exists
    fn ensure_run_dir(&self, run_id: Uuid) -> Result<PathBuf> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Save a run record
    pub fn save_run(&self, run: &Run) -> Result<()> {
        let _guard = self.lock();
        self.write_run(run)
    }

    fn write_run(&self, run: &Run) -> Result<()> {
        self.ensure_run_dir(run.id)?;
        let path = self.run_metadata_path(run.id);
        write_json_atomic(&path, run)?;
        debug!("Saved run metadata: {}", path.display());
        Ok(())
    }

    /// Load a run record
    pub fn load_run(&self, run_id: Uuid) -> Result<Run> {
        self.find_run(run_id)?
            .ok_or(RunnerError::RunNotFound { run_id })
    }

    /// Find a run by ID.
    ///
    /// Returns `Ok(None)` when the run cannot be found.
    pub fn find_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        read_json_optional(&self.run_metadata_path(run_id))
    }

    /// Apply `update` to a stored run under the store lock and save it
    pub fn update_run<F>(&self, run_id: Uuid, update: F) -> Result<Run>
    where
        F: FnOnce(&mut Run),
    {
        let _guard = self.lock();
        let mut run = self.load_run(run_id)?;
        update(&mut run);
        self.write_run(&run)?;
        Ok(run)
    }

    /// Compare-and-swap the run status.
    ///
    /// Returns the updated run when the stored status was `expected` and has
    /// been moved to `next`, `None` when another caller got there first.
    pub fn transition_status(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        next: RunStatus,
    ) -> Result<Option<Run>> {
        let _guard = self.lock();
        let mut run = self.load_run(run_id)?;
        if run.status != expected {
            debug!(
                "Status transition {} -> {} lost for run {} (now {})",
                expected.as_str(),
                next.as_str(),
                run_id,
                run.status.as_str()
            );
            return Ok(None);
        }

        if next == RunStatus::Running {
            run.mark_started();
        } else {
            run.status = next;
        }
        self.write_run(&run)?;
        Ok(Some(run))
    }

    /// List runs with pagination and optional filters, newest first
    pub fn list_runs(
        &self,
        offset: usize,
        limit: usize,
        status: Option<RunStatus>,
        tenant_id: Option<&str>,
    ) -> Result<(Vec<Run>, bool)> {
        if limit == 0 || !self.base_dir.exists() {
            return Ok((Vec::new(), false));
        }

        let tenant_id = tenant_id.map(str::trim).filter(|value| !value.is_empty());
        let mut runs = Vec::new();

        for entry in fs::read_dir(&self.base_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let run_id = match path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| Uuid::parse_str(name).ok())
            {
                Some(id) => id,
                None => continue,
            };

            let run = match self.find_run(run_id) {
                Ok(Some(run)) => run,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to load run {}: {}", run_id, e);
                    continue;
                }
            };

            if status.is_some_and(|status| run.status != status) {
                continue;
            }
            if tenant_id.is_some() && run.tenant_id.as_deref() != tenant_id {
                continue;
            }

            runs.push(run);
        }

        runs.sort_by(|left, right| right.created_at.cmp(&left.created_at));

        let total = runs.len();
        let paged = runs.into_iter().skip(offset).take(limit).collect::<Vec<_>>();
        let has_more = total > offset + paged.len();
        Ok((paged, has_more))
    }

    /// Write a handback snapshot, fully replacing any previous one.
    ///
    /// The snapshot goes to a temporary file first and is renamed into
    /// place, so readers see either the old snapshot or the new one.
    pub fn save_snapshot(&self, snapshot: &HandbackSnapshot) -> Result<()> {
        self.ensure_run_dir(snapshot.run_id)?;
        let path = self.snapshot_path(snapshot.run_id);
        write_json_atomic(&path, snapshot)?;
        info!(
            "Saved handback snapshot for run {} at step {}",
            snapshot.run_id, snapshot.step_index
        );
        Ok(())
    }

    /// Load the stored snapshot. A snapshot that exists but cannot be
    /// decoded is an error, not `None`.
    pub fn load_snapshot(&self, run_id: Uuid) -> Result<Option<HandbackSnapshot>> {
        read_json_optional(&self.snapshot_path(run_id))
    }

    pub fn has_snapshot(&self, run_id: Uuid) -> bool {
        self.snapshot_path(run_id).exists()
    }

    /// Save the latest step-loop result for a run
    pub fn save_result(&self, run_id: Uuid, result: &RunResult) -> Result<()> {
        self.ensure_run_dir(run_id)?;
        write_json_atomic(&self.result_path(run_id), result)
    }

    pub fn load_result(&self, run_id: Uuid) -> Result<Option<RunResult>> {
        read_json_optional(&self.result_path(run_id))
    }

    /// Append an event to a run's durable log
    pub fn append_event(&self, event: &RunEvent) -> Result<()> {
        self.ensure_run_dir(event.run_id)?;
        let path = self.events_path(event.run_id);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut writer = BufWriter::new(file);
        let json = serde_json::to_string(event)?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;

        Ok(())
    }

    /// Load all durable events for a run
    pub fn load_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>> {
        let (events, _) = self.load_events_paginated(run_id, 0, usize::MAX)?;
        Ok(events)
    }

    /// Load durable events with pagination
    pub fn load_events_paginated(
        &self,
        run_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<RunEvent>, bool)> {
        let path = self.events_path(run_id);

        if !path.exists() {
            return Ok((Vec::new(), false));
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut events = Vec::new();
        let mut total_count = 0;

        for (line_num, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("Failed to read line {} in events file: {}", line_num, e);
                    continue;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            // Skip until offset
            if total_count < offset {
                total_count += 1;
                continue;
            }

            // Keep counting past the page for has_more
            if events.len() >= limit {
                total_count += 1;
                continue;
            }

            match serde_json::from_str::<RunEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    "Failed to parse event at line {} in {}: {}",
                    line_num,
                    path.display(),
                    e
                ),
            }
            total_count += 1;
        }

        let has_more = total_count > offset + events.len();
        Ok((events, has_more))
    }

    /// Delete a run and everything stored for it
    pub fn delete_run(&self, run_id: Uuid) -> Result<()> {
        let _guard = self.lock();
        let dir = self.run_dir(run_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            info!("Deleted run directory: {}", dir.display());
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink for RunStore {
    async fn persist(&self, event: &RunEvent) -> Result<()> {
        self.append_event(event)
    }
}

/// Serialize to a sibling temp file, then rename over `path`
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(serde_json::from_reader(BufReader::new(file))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::Utc;
    use cua_core::event::{RUN_STARTED, STEP_COMPLETED};
    use cua_core::run::{CompletionReason, ResultStatus, RunConfig, StepRecord};
    use cua_core::snapshot::RunnerState;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (RunStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RunStore::new(temp_dir.path());
        (store, temp_dir)
    }

    fn snapshot(run_id: Uuid, request: &str, screenshot: &str) -> HandbackSnapshot {
        let state = RunnerState {
            work_item_id: None,
            next_step_index: 2,
            steps: vec![StepRecord::new(1, "", format!("HANDBACK_TO_USER: {}", request))],
            messages: Vec::new(),
            trajectory: String::new(),
            request: request.to_string(),
            screenshot_b64: screenshot.to_string(),
            paused_at: Utc::now(),
        };
        HandbackSnapshot::new(run_id, 1, &state, BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_save_and_load_run() {
        let (store, _temp) = create_test_store();
        let run = Run::new(RunConfig::new("Open the settings page"), Some("tenant-a".to_string()));

        store.save_run(&run).unwrap();
        let loaded = store.load_run(run.id).unwrap();

        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.config.task, "Open the settings page");
        assert_eq!(loaded.tenant_id.as_deref(), Some("tenant-a"));
    }

    #[test]
    fn test_load_missing_run_is_not_found() {
        let (store, _temp) = create_test_store();
        let run_id = Uuid::new_v4();

        assert!(store.find_run(run_id).unwrap().is_none());
        assert!(matches!(
            store.load_run(run_id),
            Err(RunnerError::RunNotFound { run_id: id }) if id == run_id
        ));
    }

    #[test]
    fn test_load_run_with_missing_config_fields() {
        let (store, temp_dir) = create_test_store();
        let run = Run::new(RunConfig::new("Legacy"), None);

        let mut run_json = serde_json::to_value(&run).unwrap();
        let config = run_json["config"].as_object_mut().unwrap();
        config.remove("click_settle_delay_ms");
        config.remove("enable_code_execution");

        let run_dir = temp_dir.path().join("runs").join(run.id.to_string());
        fs::create_dir_all(&run_dir).unwrap();
        fs::write(run_dir.join("run.json"), serde_json::to_vec_pretty(&run_json).unwrap()).unwrap();

        let loaded = store.load_run(run.id).unwrap();
        assert_eq!(loaded.config.click_settle_delay_ms, 0);
        assert!(!loaded.config.enable_code_execution);
    }

    #[test]
    fn test_transition_status_only_one_winner() {
        let (store, _temp) = create_test_store();
        let mut run = Run::new(RunConfig::new("t"), None);
        run.mark_attention("please sign in".to_string());
        store.save_run(&run).unwrap();

        let first = store
            .transition_status(run.id, RunStatus::Attention, RunStatus::Running)
            .unwrap();
        let second = store
            .transition_status(run.id, RunStatus::Attention, RunStatus::Running)
            .unwrap();

        assert!(first.is_some());
        assert!(first.unwrap().started_at.is_some());
        assert!(second.is_none());
        assert_eq!(store.load_run(run.id).unwrap().status, RunStatus::Running);
    }

    #[test]
    fn test_concurrent_transitions_have_single_winner() {
        let (store, _temp) = create_test_store();
        let run = Run::new(RunConfig::new("t"), None);
        store.save_run(&run).unwrap();

        let handles = (0..8)
            .map(|_| {
                let store = store.clone();
                let run_id = run.id;
                std::thread::spawn(move || {
                    store
                        .transition_status(run_id, RunStatus::Queued, RunStatus::Running)
                        .unwrap()
                        .is_some()
                })
            })
            .collect::<Vec<_>>();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_list_runs_filtered_paginated() {
        let (store, _temp) = create_test_store();

        let mut failed = Run::new(RunConfig::new("one"), Some("tenant-a".to_string()));
        failed.mark_ended(RunStatus::Failed, None);
        let running = {
            let mut run = Run::new(RunConfig::new("two"), Some("tenant-b".to_string()));
            run.mark_started();
            run
        };
        store.save_run(&failed).unwrap();
        store.save_run(&running).unwrap();

        let (all, has_more) = store.list_runs(0, 10, None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert!(!has_more);

        let (only_failed, _) = store.list_runs(0, 10, Some(RunStatus::Failed), None).unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].id, failed.id);

        let (tenant_b, _) = store.list_runs(0, 10, None, Some("tenant-b")).unwrap();
        assert_eq!(tenant_b.len(), 1);
        assert_eq!(tenant_b[0].id, running.id);

        let (page, has_more) = store.list_runs(0, 1, None, None).unwrap();
        assert_eq!(page.len(), 1);
        assert!(has_more);
    }

    #[test]
    fn test_snapshot_is_fully_replaced() {
        let (store, _temp) = create_test_store();
        let run_id = Uuid::new_v4();

        let mut first = snapshot(run_id, "please sign in", "Zmlyc3Q=");
        first.components.insert("planner".to_string(), json!({ "stale": true }));
        store.save_snapshot(&first).unwrap();

        store.save_snapshot(&snapshot(run_id, "confirm the payment", "c2Vjb25k")).unwrap();

        let loaded = store.load_snapshot(run_id).unwrap().unwrap();
        assert_eq!(loaded.request, "confirm the payment");
        assert!(!loaded.components.contains_key("planner"));
    }

    #[test]
    fn test_snapshot_round_trip_is_byte_exact() {
        let (store, _temp) = create_test_store();
        let run_id = Uuid::new_v4();
        let screenshot = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg==";

        store.save_snapshot(&snapshot(run_id, "please sign in", screenshot)).unwrap();

        let state = store.load_snapshot(run_id).unwrap().unwrap().runner_state().unwrap();
        assert_eq!(state.request, "please sign in");
        assert_eq!(state.screenshot_b64, screenshot);
        assert_eq!(state.next_step_index, 2);
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let (store, temp_dir) = create_test_store();
        let run_id = Uuid::new_v4();
        let run_dir = temp_dir.path().join("runs").join(run_id.to_string());
        fs::create_dir_all(&run_dir).unwrap();
        fs::write(run_dir.join("snapshot.json"), b"{ not json").unwrap();

        assert!(store.has_snapshot(run_id));
        assert!(matches!(store.load_snapshot(run_id), Err(RunnerError::Serialization(_))));
    }

    #[test]
    fn test_save_and_load_result() {
        let (store, _temp) = create_test_store();
        let run_id = Uuid::new_v4();
        let result = RunResult::new(
            "t",
            ResultStatus::Success,
            CompletionReason::Done,
            vec![StepRecord::new(1, "", "DONE")],
        );

        assert!(store.load_result(run_id).unwrap().is_none());
        store.save_result(run_id, &result).unwrap();

        let loaded = store.load_result(run_id).unwrap().unwrap();
        assert_eq!(loaded.status, ResultStatus::Success);
        assert_eq!(loaded.steps.len(), 1);
    }

    #[test]
    fn test_load_events_paginated() {
        let (store, _temp) = create_test_store();
        let run_id = Uuid::new_v4();

        for i in 0..10 {
            store
                .append_event(&RunEvent::new(run_id, STEP_COMPLETED, json!({ "step": i })))
                .unwrap();
        }

        let (events, has_more) = store.load_events_paginated(run_id, 0, 5).unwrap();
        assert_eq!(events.len(), 5);
        assert!(has_more);

        let (events, has_more) = store.load_events_paginated(run_id, 5, 5).unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].payload["step"], 5);
        assert!(!has_more);
    }

    #[test]
    fn test_malformed_event_lines_are_skipped() {
        let (store, temp_dir) = create_test_store();
        let run_id = Uuid::new_v4();
        store.append_event(&RunEvent::new(run_id, RUN_STARTED, json!({}))).unwrap();

        let path = temp_dir
            .path()
            .join("runs")
            .join(run_id.to_string())
            .join("events.jsonl");
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        writeln!(file, "garbage").unwrap();

        store.append_event(&RunEvent::new(run_id, STEP_COMPLETED, json!({}))).unwrap();

        let events = store.load_events(run_id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].name, STEP_COMPLETED);
    }

    #[tokio::test]
    async fn test_store_is_an_event_sink() {
        let (store, _temp) = create_test_store();
        let run_id = Uuid::new_v4();

        store
            .persist(&RunEvent::new(run_id, RUN_STARTED, json!({ "task": "t" })))
            .await
            .unwrap();

        assert_eq!(store.load_events(run_id).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_run() {
        let (store, _temp) = create_test_store();
        let run = Run::new(RunConfig::new("Test"), None);
        store.save_run(&run).unwrap();
        store.save_snapshot(&snapshot(run.id, "x", "eA==")).unwrap();

        store.delete_run(run.id).unwrap();

        assert!(store.find_run(run.id).unwrap().is_none());
        assert!(!store.has_snapshot(run.id));
    }
}
