//! Pipeline orchestrator - drives discovery, provisioning and the per-file
//! fetch, extract, load, archive and clean stages for one snapshot

use crate::ingestion::archive::{SizeGatedArchiver, Uploader};
use crate::ingestion::catalog::{list_files, list_snapshot_dates, RemoteSource};
use crate::ingestion::error::{
    ArchiveError, ExtractError, FetchError, LoadError, PipelineError, StageError,
};
use crate::ingestion::extract::extract_single_file;
use crate::ingestion::schema::TableName;
use crate::ingestion::types::{
    DataKind, FileDescriptor, FileFailure, FileFilter, FileId, RunSummary, SnapshotDate, Stage,
};
use crate::ingestion::utils::remove_if_exists;
use crate::ingestion::write::TableStore;
use bytes::Bytes;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exponential backoff for retryable per-file failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Spaces out calls to the remote source
#[derive(Debug)]
pub struct Pacer {
    delay: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(delay: Duration) -> Self {
        Pacer { delay, last: None }
    }

    /// Wait until at least `delay` has passed since the previous call
    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            let ready = last + self.delay;
            let now = Instant::now();
            if ready > now {
                debug!("Pacing remote call for {:?}", ready - now);
                sleep_until(ready).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub category: String,
    pub subcategory: String,
    pub filter: FileFilter,
    /// Scratch directory for extracted CSVs and temporary archives
    pub exports_dir: PathBuf,
    /// Minimum gap between calls to the remote catalog
    pub pacing: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            category: "State".to_string(),
            subcategory: "Fixed Broadband".to_string(),
            filter: FileFilter::default(),
            exports_dir: PathBuf::from("./exports"),
            pacing: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

struct StageFailure {
    stage: Stage,
    error: StageError,
    working_file: Option<PathBuf>,
}

impl StageFailure {
    fn new(stage: Stage, error: impl Into<StageError>) -> Self {
        StageFailure {
            stage,
            error: error.into(),
            working_file: None,
        }
    }

    fn keeping(mut self, working_file: &Path) -> Self {
        self.working_file = Some(working_file.to_path_buf());
        self
    }
}

/// Stage a file's processing starts at, with the file left by an earlier attempt
#[derive(Debug, Clone)]
struct Resume {
    stage: Stage,
    working_file: Option<PathBuf>,
}

impl Resume {
    fn from_scratch() -> Self {
        Resume {
            stage: Stage::Fetching,
            working_file: None,
        }
    }

    /// Committed rows are never loaded twice. A rejected load is retried from
    /// the retained file when it is still there, otherwise from a fresh download.
    fn after(failure: &FileFailure) -> Self {
        if failure.rows_committed() {
            return Resume {
                stage: failure.stage,
                working_file: failure.working_file.clone(),
            };
        }
        match &failure.working_file {
            Some(path) if failure.stage == Stage::Loading && path.exists() => Resume {
                stage: Stage::Loading,
                working_file: Some(path.clone()),
            },
            _ => Resume::from_scratch(),
        }
    }
}

pub struct Pipeline<S, T, U> {
    source: S,
    store: T,
    archiver: Option<SizeGatedArchiver<U>>,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl<S, T, U> Pipeline<S, T, U>
where
    S: RemoteSource,
    T: TableStore,
    U: Uploader,
{
    pub fn new(source: S, store: T, config: PipelineConfig) -> Self {
        Pipeline {
            source,
            store,
            archiver: None,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Forward loaded files to external storage before cleanup
    pub fn with_archiver(mut self, archiver: SizeGatedArchiver<U>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run before the next file starts
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &T {
        &self.store
    }

    /// Run the newest published snapshot of `kind`
    pub async fn run_latest(&self, kind: &DataKind) -> Result<RunSummary, PipelineError> {
        let mut pacer = Pacer::new(self.config.pacing);
        pacer.wait().await;
        let dates = list_snapshot_dates(&self.source, kind).await?;
        let latest = dates
            .first()
            .copied()
            .ok_or_else(|| PipelineError::NoSnapshots(kind.to_string()))?;

        info!("Latest {} snapshot is {}", kind, latest);
        self.run_with_pacer(&latest, &mut pacer).await
    }

    /// Discover, provision, then process every matching file of `snapshot`
    pub async fn run(&self, snapshot: &SnapshotDate) -> Result<RunSummary, PipelineError> {
        let mut pacer = Pacer::new(self.config.pacing);
        self.run_with_pacer(snapshot, &mut pacer).await
    }

    /// Reprocess the failures of an earlier run, each from the stage it failed at.
    ///
    /// Files whose rows were already committed are only archived and cleaned.
    /// If their working file is gone they fail again rather than being reloaded.
    pub async fn retry(
        &self,
        snapshot: &SnapshotDate,
        failures: &[FileFailure],
    ) -> Result<RunSummary, PipelineError> {
        let mut pacer = Pacer::new(self.config.pacing);
        let table = snapshot.table_name();
        info!("=== Retrying {} files of snapshot {} ===", failures.len(), snapshot);

        self.provision(&table).await?;
        let work: Vec<(&FileDescriptor, Resume)> = failures
            .iter()
            .map(|f| (&f.descriptor, Resume::after(f)))
            .collect();
        Ok(self.process_all(snapshot, &table, &work, &mut pacer).await)
    }

    async fn run_with_pacer(
        &self,
        snapshot: &SnapshotDate,
        pacer: &mut Pacer,
    ) -> Result<RunSummary, PipelineError> {
        let table = snapshot.table_name();
        info!("=== Snapshot {} -> {} ===", snapshot, table);

        info!("Discovering files...");
        pacer.wait().await;
        let files = list_files(
            &self.source,
            snapshot,
            &self.config.category,
            &self.config.subcategory,
            &self.config.filter,
        )
        .await?;
        if files.is_empty() {
            warn!("No files to download for snapshot {}", snapshot);
        }

        self.provision(&table).await?;
        let work: Vec<(&FileDescriptor, Resume)> =
            files.iter().map(|d| (d, Resume::from_scratch())).collect();
        Ok(self.process_all(snapshot, &table, &work, pacer).await)
    }

    async fn provision(&self, table: &TableName) -> Result<(), PipelineError> {
        info!("Provisioning table {}...", table);
        let outcome = self.store.ensure_table(table).await?;
        debug!("Provisioning {}: {:?}", table, outcome);

        tokio::fs::create_dir_all(&self.config.exports_dir).await?;
        Ok(())
    }

    async fn process_all(
        &self,
        snapshot: &SnapshotDate,
        table: &TableName,
        work: &[(&FileDescriptor, Resume)],
        pacer: &mut Pacer,
    ) -> RunSummary {
        let mut summary = RunSummary::new(*snapshot, table);
        let mut seen: HashSet<&FileId> = HashSet::new();
        let mut aborted = false;

        for (idx, (descriptor, resume)) in work.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(
                    "Run cancelled, stopping before file {} of {}",
                    idx + 1,
                    work.len()
                );
                aborted = true;
                break;
            }

            if !seen.insert(&descriptor.file_id) {
                warn!("Skipping duplicate descriptor {}", descriptor.file_id);
                summary.skipped_duplicates += 1;
                continue;
            }

            info!(
                "[{}/{}] {} (file {}, from {})",
                idx + 1,
                work.len(),
                descriptor.file_name,
                descriptor.file_id,
                resume.stage
            );
            summary.attempted += 1;

            match self.process_file(descriptor, table, pacer, resume.clone()).await {
                Ok(rows) => {
                    summary.succeeded += 1;
                    summary.rows_loaded += rows;
                    info!("✓ {} loaded {} rows", descriptor.file_name, rows);
                }
                Err(failure) => {
                    error!(
                        "✗ {} failed while {}: {} ({})",
                        descriptor.file_name,
                        failure.stage,
                        failure.error,
                        failure.error.kind()
                    );
                    summary.failed.push(FileFailure {
                        descriptor: (*descriptor).clone(),
                        stage: failure.stage,
                        kind: failure.error.kind(),
                        message: failure.error.to_string(),
                        working_file: failure.working_file,
                    });
                }
            }
        }

        summary.finish(aborted);
        match self.store.row_count(table).await {
            Ok(count) => info!("{} now holds {} rows", table, count),
            Err(e) => warn!("Could not count rows in {}: {}", table, e),
        }
        info!("Run finished: {}", summary);
        summary
    }

    /// Fetch -> Extract -> Load -> Archive -> Clean for one descriptor, starting
    /// at `resume.stage`. Returns the rows loaded by this call.
    /// The working file survives any failure after extraction.
    async fn process_file(
        &self,
        descriptor: &FileDescriptor,
        table: &TableName,
        pacer: &mut Pacer,
        resume: Resume,
    ) -> Result<u64, StageFailure> {
        let start = resume.stage;
        let working_file = match (start, resume.working_file) {
            (Stage::Fetching | Stage::Extracting, _) => {
                let bytes = self
                    .fetch_with_retry(&descriptor.file_id, pacer)
                    .await
                    .map_err(|e| StageFailure::new(Stage::Fetching, e))?;
                self.extract(bytes, &descriptor.file_id)
                    .await
                    .map_err(|e| StageFailure::new(Stage::Extracting, e))?
            }
            (_, Some(path)) if path.exists() => {
                info!("Resuming {} from {:?}", descriptor.file_name, path);
                path
            }
            (Stage::Cleaning, _) => {
                debug!("Working file of {} already removed", descriptor.file_name);
                return Ok(0);
            }
            (stage, path) => {
                let gone = io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("working file {:?} is gone; rows are not reloaded", path),
                );
                return Err(match stage {
                    Stage::Loading => StageFailure::new(stage, LoadError::Io(gone)),
                    _ => StageFailure::new(stage, ArchiveError::Io(gone)),
                });
            }
        };
        debug!("Working file {:?}", working_file);

        let rows = match start {
            Stage::Archiving | Stage::Cleaning => 0,
            _ => self
                .store
                .load_csv(table, &working_file)
                .await
                .map_err(|e| StageFailure::new(Stage::Loading, e).keeping(&working_file))?,
        };

        if start != Stage::Cleaning {
            if let Some(archiver) = &self.archiver {
                self.archive_with_retry(archiver, &working_file, table, descriptor)
                    .await
                    .map_err(|e| StageFailure::new(Stage::Archiving, e).keeping(&working_file))?;
            }
        }

        remove_if_exists(&working_file).map_err(|e| {
            StageFailure::new(Stage::Cleaning, StageError::Cleanup(e)).keeping(&working_file)
        })?;
        Ok(rows)
    }

    async fn fetch_with_retry(&self, file_id: &FileId, pacer: &mut Pacer) -> Result<Bytes, FetchError> {
        let retry = self.config.retry;
        let mut attempt = 1;
        loop {
            pacer.wait().await;
            match self.source.fetch(file_id).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        "Download of file {} failed (attempt {}/{}): {}; retrying in {:?}",
                        file_id, attempt, retry.max_attempts, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn extract(&self, bytes: Bytes, file_id: &FileId) -> Result<PathBuf, ExtractError> {
        let dir = self.config.exports_dir.clone();
        let file_id = file_id.clone();
        tokio::task::spawn_blocking(move || extract_single_file(&bytes, &dir, &file_id))
            .await
            .map_err(|e| ExtractError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    /// Once a compressed upload has timed out, later attempts skip the as-is upload
    async fn archive_with_retry(
        &self,
        archiver: &SizeGatedArchiver<U>,
        path: &Path,
        table: &TableName,
        descriptor: &FileDescriptor,
    ) -> Result<(), StageError> {
        let retry = self.config.retry;
        let mut attempt = 1;
        let mut compressed_only = false;
        loop {
            let result = if compressed_only {
                archiver.archive_compressed(path, table.as_str()).await
            } else {
                archiver.archive(path, table.as_str()).await
            };
            match result {
                Ok(outcome) => {
                    info!(
                        "Archived {} ({} bytes, compressed: {})",
                        descriptor.file_name, outcome.bytes, outcome.compressed
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    // `archive` only reports a timeout after it has escalated to compression
                    if matches!(e, ArchiveError::Timeout(_)) {
                        compressed_only = true;
                    }
                    let delay = retry.backoff(attempt);
                    warn!(
                        "Archiving {} failed (attempt {}/{}): {}; retrying in {:?}",
                        descriptor.file_name, attempt, retry.max_attempts, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::error::{ArchiveError, CatalogError, ErrorKind, LoadError, ProvisionError};
    use crate::ingestion::parse::{read_rows, AvailabilityRow};
    use crate::ingestion::types::{DateEntry, ProvisionOutcome, RunStatus};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::fs;
    use std::io::{Cursor, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    const HEADER: &str = "frn,provider_id,brand_name,location_id,technology,max_advertised_download_speed,\
max_advertised_upload_speed,low_latency,business_residential_code,state_usps,block_geoid,h3_res8_id";

    #[derive(Clone)]
    enum Reply {
        Body(Vec<u8>),
        Transient,
        Permanent,
    }

    /// Catalog with scripted downloads. The last reply for a file repeats.
    #[derive(Default)]
    struct FakeSource {
        dates: Vec<DateEntry>,
        files: Vec<FileDescriptor>,
        listing_down: bool,
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        fetch_calls: Mutex<HashMap<String, usize>>,
        listed: Mutex<Vec<SnapshotDate>>,
    }

    impl FakeSource {
        fn with_files(files: Vec<FileDescriptor>) -> Self {
            FakeSource {
                files,
                ..Default::default()
            }
        }

        fn reply(self, id: &str, replies: Vec<Reply>) -> Self {
            self.replies
                .lock()
                .unwrap()
                .insert(id.to_string(), replies.into_iter().collect());
            self
        }

        fn calls(&self, id: &str) -> usize {
            self.fetch_calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl RemoteSource for FakeSource {
        async fn list_dates(&self) -> Result<Vec<DateEntry>, CatalogError> {
            Ok(self.dates.clone())
        }

        async fn list_descriptors(
            &self,
            snapshot: &SnapshotDate,
            _category: &str,
            _subcategory: &str,
        ) -> Result<Vec<FileDescriptor>, CatalogError> {
            if self.listing_down {
                return Err(CatalogError::Status {
                    url: "listAvailabilityData".to_string(),
                    status: 503,
                });
            }
            self.listed.lock().unwrap().push(*snapshot);
            Ok(self.files.clone())
        }

        async fn fetch(&self, file_id: &FileId) -> Result<Bytes, FetchError> {
            *self
                .fetch_calls
                .lock()
                .unwrap()
                .entry(file_id.to_string())
                .or_default() += 1;

            let reply = {
                let mut replies = self.replies.lock().unwrap();
                let queue = replies.get_mut(file_id.as_str()).expect("unscripted file");
                if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap()
                }
            };

            match reply {
                Reply::Body(bytes) => Ok(Bytes::from(bytes)),
                Reply::Transient => Err(FetchError::Transient {
                    file_id: file_id.to_string(),
                    reason: "connection reset".to_string(),
                }),
                Reply::Permanent => Err(FetchError::Permanent {
                    file_id: file_id.to_string(),
                    status: 404,
                }),
            }
        }
    }

    /// Table store that loads whole files or nothing
    #[derive(Default)]
    struct MemoryStore {
        tables: Mutex<HashMap<String, Vec<AvailabilityRow>>>,
        ensure_calls: AtomicUsize,
        events: Mutex<Vec<String>>,
    }

    impl MemoryStore {
        fn rows(&self, table: &str) -> Vec<AvailabilityRow> {
            self.tables.lock().unwrap().get(table).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl TableStore for MemoryStore {
        async fn ensure_table(&self, table: &TableName) -> Result<ProvisionOutcome, ProvisionError> {
            self.ensure_calls.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push("ensure".to_string());
            let mut tables = self.tables.lock().unwrap();
            if tables.contains_key(table.as_str()) {
                return Ok(ProvisionOutcome::AlreadyExisted);
            }
            tables.insert(table.to_string(), Vec::new());
            Ok(ProvisionOutcome::Created)
        }

        async fn load_csv(&self, table: &TableName, path: &Path) -> Result<u64, LoadError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("load {}", path.file_name().unwrap().to_string_lossy()));
            let rows = read_rows(path)?;
            let mut tables = self.tables.lock().unwrap();
            let target = tables
                .get_mut(table.as_str())
                .ok_or_else(|| LoadError::Rejected(format!("no table {}", table)))?;
            let count = rows.len() as u64;
            target.extend(rows);
            Ok(count)
        }

        async fn row_count(&self, table: &TableName) -> Result<u64, LoadError> {
            Ok(self.rows(table.as_str()).len() as u64)
        }
    }

    /// Rejects or times out the first few uploads, then accepts
    #[derive(Default)]
    struct RecordingUploader {
        rejections: AtomicUsize,
        timeouts: AtomicUsize,
        attempts: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(String, String)>>,
    }

    impl RecordingUploader {
        fn rejecting(times: usize) -> Self {
            RecordingUploader {
                rejections: AtomicUsize::new(times),
                ..Default::default()
            }
        }

        fn timing_out(times: usize) -> Self {
            RecordingUploader {
                timeouts: AtomicUsize::new(times),
                ..Default::default()
            }
        }
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(&self, path: &Path, file_name: &str, table_name: &str) -> Result<(), ArchiveError> {
            assert!(path.exists());
            self.attempts.lock().unwrap().push(file_name.to_string());
            if take_one(&self.rejections) {
                return Err(ArchiveError::RejectedByDestination {
                    status: 413,
                    body: "too large".to_string(),
                });
            }
            if take_one(&self.timeouts) {
                return Err(ArchiveError::Timeout("no response".to_string()));
            }
            self.uploads
                .lock()
                .unwrap()
                .push((file_name.to_string(), table_name.to_string()));
            Ok(())
        }
    }

    fn descriptor(id: &str) -> FileDescriptor {
        serde_json::from_value(json!({
            "file_id": id,
            "file_name": format!("bdc_50_Cable_fixed_broadband_{}", id),
            "technology_type": "Fixed Broadband",
            "file_type": "csv",
            "technology_code_desc": "Cable",
            "state_fips": "50"
        }))
        .unwrap()
    }

    fn csv_with(rows: &[&str]) -> String {
        let mut csv = format!("{}\n", HEADER);
        for row in rows {
            csv.push_str(row);
            csv.push('\n');
        }
        csv
    }

    fn row(location_id: u64) -> String {
        format!(
            "1234,130000,Acme Broadband,{},40,1000,35,1,R,VT,500070001001000,8828308281fffff",
            location_id
        )
    }

    fn zipped(name: &str, content: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            writer
                .start_file(name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    fn good_file(id: &str, locations: &[u64]) -> Reply {
        let rows: Vec<String> = locations.iter().map(|l| row(*l)).collect();
        let rows: Vec<&str> = rows.iter().map(|r| r.as_str()).collect();
        Reply::Body(zipped(&format!("bdc_{}.csv", id), &csv_with(&rows)))
    }

    fn config(dir: &TempDir) -> PipelineConfig {
        PipelineConfig {
            exports_dir: dir.path().join("exports"),
            pacing: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            ..PipelineConfig::default()
        }
    }

    fn snapshot() -> SnapshotDate {
        "2024-06-30".parse().unwrap()
    }

    fn leftovers(dir: &TempDir) -> Vec<String> {
        let exports = dir.path().join("exports");
        let mut names: Vec<String> = fs::read_dir(exports)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn pipeline(
        source: FakeSource,
        store: MemoryStore,
        dir: &TempDir,
    ) -> Pipeline<FakeSource, MemoryStore, RecordingUploader> {
        Pipeline::new(source, store, config(dir))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_pacer_spaces_calls() {
        let mut pacer = Pacer::new(Duration::from_millis(50));
        let start = Instant::now();
        pacer.wait().await;
        assert!(start.elapsed() < Duration::from_millis(50));

        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_corrupt_file_does_not_stop_the_run() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1"), descriptor("2"), descriptor("3")])
            .reply("1", vec![good_file("1", &[11, 12])])
            .reply("2", vec![Reply::Body(b"not a zip archive".to_vec())])
            .reply("3", vec![good_file("3", &[31])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(summary.status, RunStatus::CompletedWithFailures);
        assert_eq!(summary.table, "bdc_2024_06_30");
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.rows_loaded, 3);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].descriptor.file_id.as_str(), "2");
        assert_eq!(summary.failed[0].stage, Stage::Extracting);
        assert_eq!(summary.failed[0].kind, ErrorKind::CorruptArchive);

        let locations: Vec<i64> = pipeline
            .store()
            .rows("bdc_2024_06_30")
            .iter()
            .filter_map(|r| r.location_id)
            .collect();
        assert_eq!(locations, vec![11, 12, 31]);
        assert!(leftovers(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_successful_files_are_archived_and_removed() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1"), descriptor("2")])
            .reply("1", vec![good_file("1", &[1])])
            .reply("2", vec![good_file("2", &[2])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir)
            .with_archiver(SizeGatedArchiver::new(RecordingUploader::default(), u64::MAX));

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert!(leftovers(&dir).is_empty());
        let archiver = pipeline.archiver.as_ref().unwrap();
        let uploads = archiver.uploader().uploads.lock().unwrap().clone();
        assert_eq!(
            uploads,
            vec![
                ("1_bdc_1.csv".to_string(), "bdc_2024_06_30".to_string()),
                ("2_bdc_2.csv".to_string(), "bdc_2024_06_30".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_loads_leave_one_file_each() {
        let dir = tempdir().unwrap();
        let bad_row = "not-a-number,130000,Acme,1,40,1000,35,1,R,VT,500070001001000,8828308281fffff";
        let source = FakeSource::with_files(vec![descriptor("1"), descriptor("2"), descriptor("3")])
            .reply("1", vec![Reply::Body(zipped("bdc_1.csv", &csv_with(&[row(1).as_str(), bad_row])))])
            .reply("2", vec![good_file("2", &[2])])
            .reply("3", vec![Reply::Body(zipped("bdc_3.csv", "wrong,header\n1,2\n"))]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed.len(), 2);
        assert!(summary
            .failed
            .iter()
            .all(|f| f.stage == Stage::Loading && f.kind == ErrorKind::LoadRejected));
        // The valid row of file 1 must not land on its own
        assert_eq!(pipeline.store().rows("bdc_2024_06_30").len(), 1);
        assert_eq!(leftovers(&dir), vec!["1_bdc_1.csv", "3_bdc_3.csv"]);
    }

    #[tokio::test]
    async fn test_transient_fetch_is_retried() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1")])
            .reply("1", vec![Reply::Transient, good_file("1", &[1])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(pipeline.source().calls("1"), 2);
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1")]).reply("1", vec![Reply::Transient]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(pipeline.source().calls("1"), 3);
        assert_eq!(summary.failed[0].kind, ErrorKind::TransientFetchError);
        assert_eq!(summary.failed[0].stage, Stage::Fetching);
    }

    #[tokio::test]
    async fn test_permanent_fetch_is_not_retried() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1"), descriptor("2")])
            .reply("1", vec![Reply::Permanent])
            .reply("2", vec![good_file("2", &[2])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(pipeline.source().calls("1"), 1);
        assert_eq!(summary.failed[0].kind, ErrorKind::PermanentFetchError);
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn test_table_is_provisioned_once_before_loading() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1"), descriptor("2")])
            .reply("1", vec![good_file("1", &[1])])
            .reply("2", vec![good_file("2", &[2])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(pipeline.store().ensure_calls.load(Ordering::SeqCst), 1);
        let events = pipeline.store().events.lock().unwrap().clone();
        assert_eq!(events, vec!["ensure", "load 1_bdc_1.csv", "load 2_bdc_2.csv"]);
    }

    #[tokio::test]
    async fn test_duplicate_descriptors_are_skipped() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1"), descriptor("1"), descriptor("2")])
            .reply("1", vec![good_file("1", &[1])])
            .reply("2", vec![good_file("2", &[2])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(summary.skipped_duplicates, 1);
        assert_eq!(summary.attempted, 2);
        assert_eq!(pipeline.source().calls("1"), 1);
        assert_eq!(pipeline.store().rows("bdc_2024_06_30").len(), 2);
    }

    #[tokio::test]
    async fn test_catalog_failure_aborts_before_provisioning() {
        let dir = tempdir().unwrap();
        let source = FakeSource {
            listing_down: true,
            ..Default::default()
        };
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let err = pipeline.run(&snapshot()).await.unwrap_err();

        assert!(matches!(err, PipelineError::Discovery(_)));
        assert_eq!(err.kind(), ErrorKind::CatalogUnavailable);
        assert_eq!(pipeline.store().ensure_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_listing_completes() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(FakeSource::default(), MemoryStore::default(), &dir);

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.attempted, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_aborted() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1")]).reply("1", vec![good_file("1", &[1])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        pipeline.cancellation_token().cancel();
        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(summary.status, RunStatus::Aborted);
        assert_eq!(summary.attempted, 0);
        assert_eq!(pipeline.source().calls("1"), 0);
    }

    #[tokio::test]
    async fn test_retry_pass_loads_previous_failures() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1"), descriptor("2")])
            .reply("1", vec![good_file("1", &[1])])
            .reply("2", vec![Reply::Permanent, good_file("2", &[2])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let first = pipeline.run(&snapshot()).await.unwrap();
        assert_eq!(first.status, RunStatus::CompletedWithFailures);

        let second = pipeline
            .retry(&snapshot(), &first.failed)
            .await
            .unwrap();

        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.attempted, 1);
        assert_eq!(pipeline.source().calls("1"), 1);
        assert_eq!(pipeline.store().rows("bdc_2024_06_30").len(), 2);
    }

    #[tokio::test]
    async fn test_archive_rejection_keeps_loaded_file() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1")]).reply("1", vec![good_file("1", &[1])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir)
            .with_archiver(SizeGatedArchiver::new(RecordingUploader::rejecting(1), u64::MAX));

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(summary.failed[0].stage, Stage::Archiving);
        assert_eq!(summary.failed[0].kind, ErrorKind::RejectedByDestination);
        assert!(summary.failed[0].rows_committed());
        assert_eq!(leftovers(&dir), vec!["1_bdc_1.csv"]);
        assert_eq!(
            summary.failed[0].working_file.as_deref(),
            Some(dir.path().join("exports").join("1_bdc_1.csv").as_path())
        );
    }

    #[tokio::test]
    async fn test_retry_after_archive_failure_does_not_reload() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1")]).reply("1", vec![good_file("1", &[1, 2])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir)
            .with_archiver(SizeGatedArchiver::new(RecordingUploader::rejecting(1), u64::MAX));

        let first = pipeline.run(&snapshot()).await.unwrap();
        assert_eq!(first.status, RunStatus::CompletedWithFailures);
        assert_eq!(pipeline.store().rows("bdc_2024_06_30").len(), 2);

        let second = pipeline.retry(&snapshot(), &first.failed).await.unwrap();

        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.rows_loaded, 0);
        assert_eq!(pipeline.store().rows("bdc_2024_06_30").len(), 2);
        assert_eq!(pipeline.source().calls("1"), 1);
        assert!(leftovers(&dir).is_empty());
        let archiver = pipeline.archiver.as_ref().unwrap();
        assert_eq!(archiver.uploader().uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_without_working_file_fails_instead_of_reloading() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1")]).reply("1", vec![good_file("1", &[1, 2])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir)
            .with_archiver(SizeGatedArchiver::new(RecordingUploader::rejecting(1), u64::MAX));

        let first = pipeline.run(&snapshot()).await.unwrap();
        fs::remove_file(first.failed[0].working_file.as_ref().unwrap()).unwrap();

        let second = pipeline.retry(&snapshot(), &first.failed).await.unwrap();

        assert_eq!(second.status, RunStatus::CompletedWithFailures);
        assert_eq!(second.failed[0].stage, Stage::Archiving);
        assert_eq!(second.failed[0].kind, ErrorKind::LocalIo);
        assert_eq!(pipeline.store().rows("bdc_2024_06_30").len(), 2);
        assert_eq!(pipeline.source().calls("1"), 1);
    }

    #[tokio::test]
    async fn test_retry_of_rejected_load_uses_retained_file() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1")])
            .reply("1", vec![Reply::Body(zipped("bdc_1.csv", "wrong,header\n1,2\n"))]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let first = pipeline.run(&snapshot()).await.unwrap();
        let second = pipeline.retry(&snapshot(), &first.failed).await.unwrap();

        assert_eq!(second.failed[0].stage, Stage::Loading);
        assert_eq!(pipeline.source().calls("1"), 1);
        assert_eq!(leftovers(&dir), vec!["1_bdc_1.csv"]);
    }

    #[tokio::test]
    async fn test_same_entry_name_keeps_each_failed_file() {
        let dir = tempdir().unwrap();
        let bad_row = "not-a-number,130000,Acme,1,40,1000,35,1,R,VT,500070001001000,8828308281fffff";
        let source = FakeSource::with_files(vec![descriptor("1"), descriptor("2")])
            .reply("1", vec![Reply::Body(zipped("data.csv", &csv_with(&[bad_row])))])
            .reply("2", vec![Reply::Body(zipped("data.csv", &csv_with(&[row(2).as_str()])))]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(summary.failed.len(), 1);
        assert_eq!(leftovers(&dir), vec!["1_data.csv"]);
        assert_eq!(pipeline.store().rows("bdc_2024_06_30").len(), 1);
    }

    #[tokio::test]
    async fn test_archive_timeout_sticks_to_compressed_uploads() {
        let dir = tempdir().unwrap();
        let source = FakeSource::with_files(vec![descriptor("1")]).reply("1", vec![good_file("1", &[1])]);
        let pipeline = pipeline(source, MemoryStore::default(), &dir)
            .with_archiver(SizeGatedArchiver::new(RecordingUploader::timing_out(2), u64::MAX));

        let summary = pipeline.run(&snapshot()).await.unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        let archiver = pipeline.archiver.as_ref().unwrap();
        let attempts = archiver.uploader().attempts.lock().unwrap().clone();
        assert_eq!(attempts, vec!["1_bdc_1.csv", "1_bdc_1.csv.zip", "1_bdc_1.csv.zip"]);
        assert!(leftovers(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_run_latest_picks_newest_snapshot() {
        let dir = tempdir().unwrap();
        let entry = |kind: &str, date: &str| DateEntry {
            data_type: kind.to_string(),
            as_of_date: date.parse().unwrap(),
        };
        let source = FakeSource {
            dates: vec![
                entry("availability", "2023-12-31"),
                entry("challenge", "2025-01-15"),
                entry("availability", "2024-06-30"),
            ],
            ..Default::default()
        };
        let pipeline = pipeline(source, MemoryStore::default(), &dir);

        let summary = pipeline.run_latest(&DataKind::Availability).await.unwrap();

        assert_eq!(summary.snapshot, snapshot());
        assert_eq!(summary.table, "bdc_2024_06_30");
        assert_eq!(*pipeline.source().listed.lock().unwrap(), vec![snapshot()]);
    }

    #[tokio::test]
    async fn test_run_latest_without_snapshots() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(FakeSource::default(), MemoryStore::default(), &dir);

        let err = pipeline.run_latest(&DataKind::Availability).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoSnapshots(_)));
    }
}
