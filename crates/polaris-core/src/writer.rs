//! Writer stage (spec §4.4): serializes records to NDJSON, rotates,
//! atomically finalizes, and recovers stray active files on startup.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::CoreError;
use crate::model::Record;

const RETRY_DELAY: Duration = Duration::from_millis(100);
const WRITE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Stdout,
    File,
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub mode: OutputMode,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub instance_id: String,
    pub rotate_interval: Duration,
    pub rotate_max_size_bytes: u64,
    pub flush_every_n_events: u64,
    pub flush_interval: Duration,
}

/// The file currently being appended to, tracked against the two rotation
/// triggers in spec §4.4.
struct ActiveFile {
    path: PathBuf,
    file: File,
    created_at: Instant,
    bytes_written: u64,
    event_count: u64,
    events_since_last_flush: u64,
    last_flush: Instant,
}

pub struct Writer {
    config: WriterConfig,
    active: Option<ActiveFile>,
    stdout_opened: bool,
}

impl Writer {
    /// Constructs the writer and, in file mode, runs the startup recovery
    /// scan over `output_dir` before accepting any writes.
    pub fn new(config: WriterConfig) -> Result<Self, CoreError> {
        if config.mode == OutputMode::File {
            fs::create_dir_all(&config.output_dir).map_err(|e| fatal_or_io(&config.output_dir, e))?;
            recover_active_files(&config.output_dir)?;
        }
        Ok(Self { config, active: None, stdout_opened: false })
    }

    /// Appends one record, triggering flush/rotation per policy. Returns
    /// `Ok(())` even when the record could not be durably written after
    /// retrying once, per spec §4.4 failure policy (the record is counted
    /// as lost, not queued unboundedly in memory).
    pub fn write_record(&mut self, record: &Record) -> Result<(), CoreError> {
        let mut line = record.to_ndjson_line().map_err(|e| CoreError::Io(e.into()))?;
        line.push('\n');

        match self.config.mode {
            OutputMode::Stdout => self.write_stdout(&line),
            OutputMode::File => self.write_file(&line),
        }
    }

    fn write_stdout(&mut self, line: &str) -> Result<(), CoreError> {
        self.stdout_opened = true;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(line.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }

    fn write_file(&mut self, line: &str) -> Result<(), CoreError> {
        if self.active.is_none() {
            self.open_new()?;
        }

        let bytes = line.as_bytes();
        if let Err(first_err) = self.active.as_mut().unwrap().file.write_all(bytes) {
            std::thread::sleep(RETRY_DELAY);
            if let Err(second_err) = self.active.as_mut().unwrap().file.write_all(bytes) {
                tracing::error!(
                    error = %second_err,
                    first_error = %first_err,
                    "write_error: finalizing current file and reopening after backoff"
                );
                self.finalize_current()?;
                std::thread::sleep(WRITE_ERROR_BACKOFF);
                self.open_new()?;
                return Ok(());
            }
        }

        let active = self.active.as_mut().unwrap();
        active.bytes_written += bytes.len() as u64;
        active.event_count += 1;
        active.events_since_last_flush += 1;

        self.maybe_flush()?;
        self.maybe_rotate()?;
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<(), CoreError> {
        let Some(active) = self.active.as_mut() else { return Ok(()) };
        let should_flush = active.events_since_last_flush >= self.config.flush_every_n_events
            || active.last_flush.elapsed() >= self.config.flush_interval;
        if should_flush {
            active.file.flush()?;
            active.events_since_last_flush = 0;
            active.last_flush = Instant::now();
        }
        Ok(())
    }

    fn maybe_rotate(&mut self) -> Result<(), CoreError> {
        let should_rotate = self.active.as_ref().is_some_and(|active| {
            active.created_at.elapsed() >= self.config.rotate_interval
                || active.bytes_written >= self.config.rotate_max_size_bytes
        });
        if should_rotate {
            self.finalize_current()?;
            self.open_new()?;
        }
        Ok(())
    }

    /// Forces a flush without waiting for policy thresholds -- used by the
    /// timer task and by shutdown drain.
    pub fn flush_now(&mut self) -> Result<(), CoreError> {
        if let Some(active) = self.active.as_mut() {
            active.file.flush()?;
            active.events_since_last_flush = 0;
            active.last_flush = Instant::now();
        } else if self.stdout_opened {
            std::io::stdout().flush()?;
        }
        Ok(())
    }

    /// Finalizes the active file if one is open: flush, fsync, close,
    /// atomic rename, fsync containing directory (spec §4.4 rotation
    /// procedure, steps 1-5).
    pub fn finalize_current(&mut self) -> Result<(), CoreError> {
        let Some(active) = self.active.take() else { return Ok(()) };
        finalize_file(active.file, &active.path)?;
        Ok(())
    }

    fn open_new(&mut self) -> Result<(), CoreError> {
        let now = Utc::now();
        let path = active_file_path(&self.config.output_dir, &self.config.file_prefix, &self.config.instance_id, now);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| fatal_or_io(&path, e))?;
        self.active = Some(ActiveFile {
            path,
            file,
            created_at: Instant::now(),
            bytes_written: 0,
            event_count: 0,
            events_since_last_flush: 0,
            last_flush: Instant::now(),
        });
        Ok(())
    }
}

/// Sanitizes `instance_id` per spec §4.4: any character outside
/// `[A-Za-z0-9_]` becomes `-`.
#[must_use]
pub fn sanitize_instance_id(instance_id: &str) -> String {
    instance_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect()
}

fn active_file_path(
    output_dir: &Path,
    file_prefix: &str,
    instance_id: &str,
    created_at: chrono::DateTime<Utc>,
) -> PathBuf {
    let stamp = created_at.format("%Y%m%dT%H%M%SZ");
    let sanitized = sanitize_instance_id(instance_id);
    output_dir.join(format!("{file_prefix}-{sanitized}-{stamp}.ndjson.active"))
}

fn finalize_file(mut file: File, active_path: &Path) -> Result<(), CoreError> {
    file.flush()?;
    file.sync_all()?;
    drop(file);

    let final_path = active_path.with_extension("").with_extension("ndjson");
    fs::rename(active_path, &final_path)?;
    fsync_dir(&final_path)?;
    Ok(())
}

#[cfg(unix)]
fn fsync_dir(file_path: &Path) -> Result<(), CoreError> {
    let Some(dir) = file_path.parent() else { return Ok(()) };
    let dir_file = File::open(dir)?;
    dir_file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_file_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

/// Startup recovery scan (spec §4.4): any `.ndjson.active` file whose last
/// line is complete gets renamed to `.ndjson`; one whose tail is a partial
/// line is truncated to the last complete line first.
fn recover_active_files(output_dir: &Path) -> Result<(), CoreError> {
    let entries = match fs::read_dir(output_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("active") {
            continue;
        }
        if path.to_string_lossy().ends_with(".ndjson.active") {
            recover_one(&path)?;
        }
    }
    Ok(())
}

fn recover_one(active_path: &Path) -> Result<(), CoreError> {
    let mut file = OpenOptions::new().read(true).write(true).open(active_path)?;
    let len = file.metadata()?.len();

    if len > 0 {
        let mut last_byte = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last_byte)?;
        if last_byte[0] != b'\n' {
            truncate_to_last_newline(&mut file)?;
        }
    }

    file.sync_all()?;
    drop(file);

    let final_path = active_path.with_extension("").with_extension("ndjson");
    fs::rename(active_path, &final_path)?;
    fsync_dir(&final_path)?;
    tracing::info!(path = %final_path.display(), "recovered stray active file on startup");
    Ok(())
}

fn truncate_to_last_newline(file: &mut File) -> Result<(), CoreError> {
    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let cut = contents.iter().rposition(|&b| b == b'\n').map_or(0, |idx| idx + 1);
    file.set_len(cut as u64)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(())
}

fn fatal_or_io(path: &Path, err: std::io::Error) -> CoreError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound => {
            CoreError::WriteFatal(format!("{}: {err}", path.display()))
        }
        _ => CoreError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceState, Source, StateChangeRecord};
    use tempfile::tempdir;

    fn sample_record(device_id: &str) -> Record {
        Record::StateChange(StateChangeRecord {
            timestamp: Utc::now(),
            received_at: Utc::now(),
            device_id: device_id.to_string(),
            device_label: None,
            previous_state: None,
            current_state: DeviceState::Connected,
            latitude: None,
            longitude: None,
            altitude_m: None,
            rtk_enabled: None,
            tags: vec![],
            source: Source { instance_id: "writer-01".into(), subscription_id: "sub-1".into() },
        })
    }

    fn base_config(dir: &Path) -> WriterConfig {
        WriterConfig {
            mode: OutputMode::File,
            output_dir: dir.to_path_buf(),
            file_prefix: "polaris".into(),
            instance_id: "writer-01".into(),
            rotate_interval: Duration::from_secs(3600),
            rotate_max_size_bytes: 500,
            flush_every_n_events: 1,
            flush_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn sanitize_replaces_non_word_characters() {
        assert_eq!(sanitize_instance_id("writer 01/east"), "writer-01-east");
        assert_eq!(sanitize_instance_id("writer_01"), "writer_01");
    }

    #[test]
    fn happy_path_writes_one_line_to_active_file() {
        let dir = tempdir().unwrap();
        let mut writer = Writer::new(base_config(dir.path())).unwrap();
        writer.write_record(&sample_record("d1")).unwrap();
        writer.finalize_current().unwrap();

        let mut entries: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        entries.sort();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].to_string_lossy().ends_with(".ndjson"));
        let contents = fs::read_to_string(&entries[0]).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn rotation_by_size_leaves_one_finalized_and_one_active() {
        let dir = tempdir().unwrap();
        let mut writer = Writer::new(base_config(dir.path())).unwrap();
        for i in 0..40 {
            writer.write_record(&sample_record(&format!("d{i}"))).unwrap();
        }
        let mut entries: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        entries.sort();
        assert!(entries.len() >= 2);
        let finalized = entries.iter().filter(|p| p.to_string_lossy().ends_with(".ndjson")).count();
        let active = entries.iter().filter(|p| p.to_string_lossy().ends_with(".ndjson.active")).count();
        assert!(finalized >= 1);
        assert_eq!(active, 1);
    }

    #[test]
    fn startup_recovery_finalizes_complete_active_file() {
        let dir = tempdir().unwrap();
        let stray = dir.path().join("polaris-writer-01-20250101T000000Z.ndjson.active");
        fs::write(&stray, b"{\"event_type\":\"state_change\"}\n").unwrap();

        let _writer = Writer::new(base_config(dir.path())).unwrap();
        assert!(!stray.exists());
        let finalized = dir.path().join("polaris-writer-01-20250101T000000Z.ndjson");
        assert!(finalized.exists());
    }

    #[test]
    fn startup_recovery_truncates_partial_last_line() {
        let dir = tempdir().unwrap();
        let stray = dir.path().join("polaris-writer-01-20250101T000000Z.ndjson.active");
        fs::write(&stray, b"{\"a\":1}\n{\"partial").unwrap();

        let _writer = Writer::new(base_config(dir.path())).unwrap();
        let finalized = dir.path().join("polaris-writer-01-20250101T000000Z.ndjson");
        let contents = fs::read_to_string(&finalized).unwrap();
        assert_eq!(contents, "{\"a\":1}\n");
    }

    #[test]
    fn stdout_mode_never_rotates() {
        let mut config = base_config(Path::new("/nonexistent"));
        config.mode = OutputMode::Stdout;
        let mut writer = Writer::new(config).unwrap();
        for i in 0..5 {
            writer.write_record(&sample_record(&format!("d{i}"))).unwrap();
        }
        assert!(writer.active.is_none());
    }
}
