//! Persisted stage artifacts
//!
//! Every pipeline stage writes its per-session results into one JSON object
//! file under `<temp_path>/<dataset>/`, keyed by test session identifier. The
//! files let an interrupted run resume without repeating model calls and let
//! `bundlelab evaluate` recompute metrics offline.
//!
//! Concurrent sessions finish in any order, so every read-modify-write of a
//! stage file happens under an exclusive `fs2` lock and lands with an atomic
//! rename.

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_FILE: &str = ".lock";
const CACHE_LOCK_TIMEOUT_SECS: u64 = 5;
const CACHE_LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Artifact {
    /// Initial reply plus the self-correction rounds
    SelfCorrection,
    /// Parse outcome of the self-correction bundle reply
    Parsed,
    /// Feedback-loop transcript and error reports
    Feedback,
    /// Intent regeneration transcript and parsed intents
    Intents,
    /// Related bundles and the rating prompt shown to raters
    RatingInputs,
    /// Accumulated rater scores and intent-correction notes
    RatingScores,
    /// Rules summary, test detection and test intent transcript
    TestTranscripts,
    /// Final held-out bundles, the evaluation input
    Bundles,
    /// Sessions stopped by a hallucinated item reference
    Hallucinated,
    /// Sessions dropped by a parse failure
    Excluded,
    /// Evaluation metrics document
    Metrics,
    /// Run manifest document
    Run,
}

impl Artifact {
    pub fn file_name(&self) -> &'static str {
        match self {
            Artifact::SelfCorrection => "self_correction.json",
            Artifact::Parsed => "parsed.json",
            Artifact::Feedback => "feedback.json",
            Artifact::Intents => "intents.json",
            Artifact::RatingInputs => "rating_inputs.json",
            Artifact::RatingScores => "rating_scores.json",
            Artifact::TestTranscripts => "test_transcripts.json",
            Artifact::Bundles => "bundles.json",
            Artifact::Hallucinated => "hallucinated.json",
            Artifact::Excluded => "excluded.json",
            Artifact::Metrics => "metrics.json",
            Artifact::Run => "run.json",
        }
    }

    /// All artifacts in pipeline order
    pub fn all() -> Vec<Artifact> {
        vec![
            Artifact::SelfCorrection,
            Artifact::Parsed,
            Artifact::Feedback,
            Artifact::Intents,
            Artifact::RatingInputs,
            Artifact::RatingScores,
            Artifact::TestTranscripts,
            Artifact::Bundles,
            Artifact::Hallucinated,
            Artifact::Excluded,
            Artifact::Metrics,
            Artifact::Run,
        ]
    }

    /// Artifacts whose presence marks a session as finished.
    pub fn terminal() -> [Artifact; 3] {
        [Artifact::Bundles, Artifact::Hallucinated, Artifact::Excluded]
    }

    /// True for stage files keyed by session; false for whole-run documents.
    pub fn is_per_session(&self) -> bool {
        !matches!(self, Artifact::Metrics | Artifact::Run)
    }
}

/// Stage files for one dataset.
pub struct ArtifactStore {
    dir: PathBuf,
}

struct StoreLock {
    file: std::fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, artifact: Artifact) -> PathBuf {
        self.dir.join(artifact.file_name())
    }

    fn ensure_dir(&self) -> anyhow::Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }
        Ok(())
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<StoreLock> {
        if exclusive {
            self.ensure_dir()?;
        } else if !self.dir.exists() {
            return Err(anyhow::anyhow!("Artifact directory missing"));
        }

        let lock_path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(CACHE_LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for artifact lock ({}s)",
                            CACHE_LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(CACHE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }

    fn read_map_unlocked(&self, artifact: Artifact) -> anyhow::Result<Map<String, Value>> {
        let path = self.path(artifact);
        if !path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow::anyhow!(
                "{} is not a JSON object",
                path.display()
            )),
        }
    }

    /// Store one session's entries across several stage files.
    pub fn record_many(&self, session_id: &str, entries: &[(Artifact, Value)]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _lock = self.lock(true)?;
        for (artifact, value) in entries {
            debug_assert!(artifact.is_per_session());
            let mut map = self.read_map_unlocked(*artifact)?;
            map.insert(session_id.to_string(), value.clone());
            write_atomic(&self.path(*artifact), &serde_json::to_string(&map)?)?;
        }
        Ok(())
    }

    /// Raw contents of a stage file; empty when it does not exist yet.
    pub fn load_map(&self, artifact: Artifact) -> anyhow::Result<Map<String, Value>> {
        if !self.path(artifact).exists() {
            return Ok(Map::new());
        }
        let _lock = self.lock(false)?;
        self.read_map_unlocked(artifact)
    }

    /// Stage file decoded entry by entry. Entries that no longer match `T`
    /// are skipped with a warning.
    pub fn load_typed<T: DeserializeOwned>(
        &self,
        artifact: Artifact,
    ) -> anyhow::Result<BTreeMap<String, T>> {
        let mut typed = BTreeMap::new();
        for (id, value) in self.load_map(artifact)? {
            match serde_json::from_value(value) {
                Ok(entry) => {
                    typed.insert(id, entry);
                }
                Err(err) => tracing::warn!(
                    artifact = artifact.file_name(),
                    session = %id,
                    error = %err,
                    "skipping unreadable artifact entry"
                ),
            }
        }
        Ok(typed)
    }

    /// Replace a whole-run document such as `metrics.json`.
    pub fn write_document<T: Serialize>(&self, artifact: Artifact, document: &T) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let content = serde_json::to_string_pretty(document)?;
        write_atomic(&self.path(artifact), &content)?;
        Ok(())
    }

    /// Sessions a previous run already carried to a terminal outcome.
    pub fn resumable_ids(&self) -> anyhow::Result<BTreeSet<String>> {
        let mut done = BTreeSet::new();
        for artifact in Artifact::terminal() {
            done.extend(self.load_map(artifact)?.into_iter().map(|(id, _)| id));
        }
        Ok(done)
    }

    /// Delete selected stage files, returning the names actually removed.
    pub fn clear_selective(&self, artifacts: &[Artifact]) -> anyhow::Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let _lock = self.lock(true)?;
        let mut cleared = Vec::new();
        for artifact in artifacts {
            let path = self.path(*artifact);
            if path.exists() {
                fs::remove_file(&path)?;
                cleared.push(artifact.file_name().to_string());
            }
        }
        Ok(cleared)
    }
}

/// Write via a temp file and rename so readers never see a partial file.
fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(&tmp_path, perms);
    }

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("bak");
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err.into());
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn artifacts_have_unique_file_names() {
        let names: BTreeSet<_> = Artifact::all().iter().map(|a| a.file_name()).collect();
        assert_eq!(names.len(), Artifact::all().len());
        assert!(!Artifact::Metrics.is_per_session());
        assert!(Artifact::Bundles.is_per_session());
    }

    #[test]
    fn record_many_merges_sessions_into_stage_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("electronic"));

        store
            .record_many(
                "t1",
                &[
                    (Artifact::Parsed, json!({"status": "ok"})),
                    (Artifact::Bundles, json!({"bundle1": ["product1", "product2"]})),
                ],
            )
            .unwrap();
        store
            .record_many("t2", &[(Artifact::Hallucinated, json!({"5": "bundle1"}))])
            .unwrap();
        store
            .record_many("t1", &[(Artifact::Parsed, json!({"status": "parse_failed"}))])
            .unwrap();

        let parsed = store.load_map(Artifact::Parsed).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["t1"], json!({"status": "parse_failed"}));

        let bundles: BTreeMap<String, BTreeMap<String, Vec<String>>> =
            store.load_typed(Artifact::Bundles).unwrap();
        assert_eq!(bundles["t1"]["bundle1"], vec!["product1", "product2"]);

        let done = store.resumable_ids().unwrap();
        assert_eq!(done, BTreeSet::from(["t1".to_string(), "t2".to_string()]));
    }

    #[test]
    fn missing_store_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("absent"));
        assert!(store.load_map(Artifact::Feedback).unwrap().is_empty());
        assert!(store.resumable_ids().unwrap().is_empty());
        assert!(store.clear_selective(&Artifact::all()).unwrap().is_empty());
    }

    #[test]
    fn load_typed_skips_entries_of_the_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store
            .record_many("good", &[(Artifact::Excluded, json!(["parse", "no brace"]))])
            .unwrap();
        store
            .record_many("bad", &[(Artifact::Excluded, json!(42))])
            .unwrap();
        let typed: BTreeMap<String, Vec<String>> = store.load_typed(Artifact::Excluded).unwrap();
        assert_eq!(typed.len(), 1);
        assert!(typed.contains_key("good"));
    }

    #[test]
    fn clear_selective_removes_only_requested_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store
            .record_many(
                "t1",
                &[
                    (Artifact::SelfCorrection, json!([])),
                    (Artifact::Bundles, json!({})),
                ],
            )
            .unwrap();
        store
            .write_document(Artifact::Metrics, &json!({"precision": 1.0}))
            .unwrap();

        let cleared = store
            .clear_selective(&[Artifact::Bundles, Artifact::Metrics, Artifact::Intents])
            .unwrap();
        assert_eq!(cleared, vec!["bundles.json", "metrics.json"]);
        assert!(store.path(Artifact::SelfCorrection).exists());
        assert!(!store.path(Artifact::Bundles).exists());
    }

    #[test]
    fn write_document_is_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store
            .write_document(Artifact::Run, &json!({"run_id": "abc"}))
            .unwrap();
        let content = fs::read_to_string(store.path(Artifact::Run)).unwrap();
        assert!(content.contains('\n'));
        assert!(!dir.path().join("run.tmp").exists());
    }
}
