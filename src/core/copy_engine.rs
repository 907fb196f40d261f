use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tracing::{debug, error, warn};

use crate::error::SyncError;
use crate::logging::LogThrottle;

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// Minimum gap between per-file debug lines
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_millis(500);

/// How a file that already exists at the destination is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// Copy every file, replacing whatever is there.
    AlwaysCopy,
    /// Leave a destination file alone when it has the same size and is at
    /// least as new as the source.
    CopyIfStale,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    pub policy: OverwritePolicy,
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

impl CopyOptions {
    pub fn always(sync_files: bool) -> Self {
        Self {
            policy: OverwritePolicy::AlwaysCopy,
            sync_files,
        }
    }

    pub fn if_stale(sync_files: bool) -> Self {
        Self {
            policy: OverwritePolicy::CopyIfStale,
            sync_files,
        }
    }
}

/// Result of scanning a directory
#[derive(Debug, Default)]
pub struct ScanResult {
    /// All regular files found, in walk order
    pub files: Vec<FileInfo>,
    /// All directories found, parents before children
    pub directories: Vec<PathBuf>,
    /// Total size of all files in bytes
    pub total_bytes: u64,
    /// Entries below the root that could not be read and were left out
    pub unreadable: Vec<PathBuf>,
}

impl ScanResult {
    pub fn file_count(&self) -> u64 {
        self.files.len() as u64
    }
}

/// Information about a file to copy
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Absolute path to the file
    pub path: PathBuf,
    /// Path relative to the scanned root
    pub relative: PathBuf,
    /// File size in bytes
    pub size: u64,
}

/// What happened to one file during a tree copy.
#[derive(Debug, Clone)]
pub enum FileOutcome {
    Copied { bytes: u64 },
    UpToDate,
    Failed(SyncError),
}

/// Totals for one tree copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub copied: u64,
    pub up_to_date: u64,
    pub failed: u64,
    pub bytes_copied: u64,
    /// Relative paths now present at the destination, in walk order
    pub files: Vec<PathBuf>,
}

impl CopyStats {
    /// Files not copied this time, whether current already or failed.
    pub fn skipped(&self) -> u64 {
        self.up_to_date + self.failed
    }

    pub fn processed(&self) -> u64 {
        self.copied + self.skipped()
    }
}

/// Check that an operation's source is reachable and enumerate it.
pub async fn scan_source(source: &Path) -> Result<ScanResult, SyncError> {
    if !source.exists() {
        return Err(SyncError::source_inaccessible(source));
    }

    scan_directory(source)
        .await
        .map_err(|e| SyncError::ScanFailure {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Where a source tree is mirrored on a target: `<target>/<source name>`.
pub fn mirror_dir(target_root: &Path, source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "root".into());
    target_root.join(name)
}

/// Scan a directory recursively, collecting files and directories.
pub async fn scan_directory(source: &Path) -> Result<ScanResult> {
    let source = source.to_path_buf();
    tokio::task::spawn_blocking(move || scan_directory_sync(&source)).await?
}

pub fn scan_directory_sync(source: &Path) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    scan_directory_recursive(source, source, &mut result)?;
    Ok(result)
}

fn scan_directory_recursive(base: &Path, current: &Path, result: &mut ScanResult) -> Result<()> {
    let entries = match fs::read_dir(current) {
        Ok(entries) => entries,
        Err(e) if is_device_removed_error(&e) && !base.exists() => {
            bail!("Device appears to have been removed: {}", e)
        }
        Err(e) if current != base => {
            warn!(path = %current.display(), error = %e, "Skipping unreadable directory");
            result.unreadable.push(current.to_path_buf());
            return Ok(());
        }
        Err(e) => bail!("Failed to read directory {}: {}", current.display(), e),
    };

    let mut entries = entries
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| anyhow!("Failed to read directory entry: {}", e))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();

        // Use symlink_metadata to avoid following symlinks
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                if is_device_removed_error(&e) && !base.exists() {
                    bail!("Device appears to have been removed: {}", e);
                }
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                result.unreadable.push(path);
                continue;
            }
        };

        if metadata.is_dir() {
            result.directories.push(path.clone());
            scan_directory_recursive(base, &path, result)?;
        } else if metadata.is_file() {
            let relative = path
                .strip_prefix(base)
                .map_err(|_| anyhow!("{} escaped {}", path.display(), base.display()))?
                .to_path_buf();
            result.total_bytes += metadata.len();
            result.files.push(FileInfo {
                path,
                relative,
                size: metadata.len(),
            });
        }
        // Skip symlinks and other special files
    }

    Ok(())
}

/// Mirror the scanned tree under `destination` on a blocking worker.
///
/// `on_file` runs once per scanned file, in scan order, right after that file
/// has been handled. Per-file failures are reported there and counted; the
/// walk only stops when the source or destination volume disappears.
pub async fn copy_tree<F>(
    source: &Path,
    destination: &Path,
    scan: Arc<ScanResult>,
    options: CopyOptions,
    on_file: F,
) -> Result<CopyStats, SyncError>
where
    F: FnMut(&FileInfo, &FileOutcome) + Send + 'static,
{
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();

    tokio::task::spawn_blocking(move || {
        copy_tree_sync(&source, &destination, &scan, options, on_file)
    })
    .await
    .map_err(|e| SyncError::Interrupted(format!("copy worker failed: {}", e)))?
}

pub fn copy_tree_sync<F>(
    source: &Path,
    destination: &Path,
    scan: &ScanResult,
    options: CopyOptions,
    mut on_file: F,
) -> Result<CopyStats, SyncError>
where
    F: FnMut(&FileInfo, &FileOutcome),
{
    fs::create_dir_all(destination).map_err(|e| {
        debug!(destination = %destination.display(), error = %e, "Cannot create destination");
        SyncError::target_inaccessible(destination)
    })?;

    create_directory_structure(source, destination, &scan.directories);

    let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
    let mut stats = CopyStats::default();

    for file_info in &scan.files {
        let dest_path = destination.join(&file_info.relative);

        let outcome = if options.policy == OverwritePolicy::CopyIfStale
            && is_up_to_date(&file_info.path, &dest_path)
        {
            FileOutcome::UpToDate
        } else {
            match copy_single_file(&file_info.path, &dest_path, options.sync_files) {
                Ok(bytes) => FileOutcome::Copied { bytes },
                Err(e) => {
                    if e.is_device_removed {
                        if !source.exists() {
                            return Err(SyncError::source_inaccessible(source));
                        }
                        if !destination.exists() {
                            return Err(SyncError::target_inaccessible(destination));
                        }
                    }

                    error!(
                        file = %file_info.relative.display(),
                        error = %e.message,
                        "Failed to copy file"
                    );
                    FileOutcome::Failed(SyncError::PerFileCopyFailure {
                        path: file_info.path.clone(),
                        reason: e.message,
                    })
                }
            }
        };

        match &outcome {
            FileOutcome::Copied { bytes } => {
                stats.copied += 1;
                stats.bytes_copied += bytes;
                stats.files.push(file_info.relative.clone());
            }
            FileOutcome::UpToDate => {
                stats.up_to_date += 1;
                stats.files.push(file_info.relative.clone());
            }
            FileOutcome::Failed(_) => stats.failed += 1,
        }

        if throttle.should_log() {
            debug!(
                file = %file_info.relative.display(),
                processed = stats.processed(),
                total = scan.files.len(),
                "Copy progress"
            );
        }

        on_file(file_info, &outcome);
    }

    Ok(stats)
}

/// Create the mirrored directory skeleton. Failures are logged; files under a
/// missing directory fail individually later.
fn create_directory_structure(source: &Path, destination: &Path, directories: &[PathBuf]) {
    for dir_path in directories {
        let Ok(relative) = dir_path.strip_prefix(source) else {
            continue;
        };
        let dest_dir = destination.join(relative);

        if let Err(e) = fs::create_dir_all(&dest_dir) {
            warn!(path = %dest_dir.display(), error = %e, "Failed to create directory");
            continue;
        }

        if let Ok(metadata) = fs::metadata(dir_path) {
            if let Err(e) = fs::set_permissions(&dest_dir, metadata.permissions()) {
                debug!(path = %dest_dir.display(), error = %e, "Failed to set directory permissions");
            }
        }
    }
}

/// True when `dest` exists with the same size and a modification time no
/// older than `source`.
pub fn is_up_to_date(source: &Path, dest: &Path) -> bool {
    let (Ok(src_meta), Ok(dst_meta)) = (fs::metadata(source), fs::metadata(dest)) else {
        return false;
    };

    if !dst_meta.is_file() || src_meta.len() != dst_meta.len() {
        return false;
    }

    let src_mtime = filetime::FileTime::from_last_modification_time(&src_meta);
    let dst_mtime = filetime::FileTime::from_last_modification_time(&dst_meta);
    dst_mtime >= src_mtime
}

/// Error information from a file copy operation
struct FileCopyError {
    message: String,
    is_device_removed: bool,
}

impl FileCopyError {
    fn new(context: &str, e: &io::Error) -> Self {
        Self {
            message: format!("{}: {}", context, e),
            is_device_removed: is_device_removed_error(e),
        }
    }
}

/// Copy a single file with metadata preservation
fn copy_single_file(source: &Path, dest: &Path, sync_file: bool) -> Result<u64, FileCopyError> {
    let source_metadata = fs::metadata(source)
        .map_err(|e| FileCopyError::new("Failed to read source metadata", &e))?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| FileCopyError::new("Failed to create parent directory", &e))?;
    }

    let source_file =
        File::open(source).map_err(|e| FileCopyError::new("Failed to open source file", &e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    let dest_file = File::create(dest)
        .map_err(|e| FileCopyError::new("Failed to create destination file", &e))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| FileCopyError::new("Failed to read from source", &e))?;

        if bytes_read == 0 {
            break;
        }

        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| FileCopyError::new("Failed to write to destination", &e))?;

        bytes_written += bytes_read as u64;
    }

    writer
        .flush()
        .map_err(|e| FileCopyError::new("Failed to flush destination file", &e))?;

    if sync_file {
        let inner = writer
            .into_inner()
            .map_err(|e| FileCopyError::new("Failed to get inner file handle", e.error()))?;

        inner
            .sync_all()
            .map_err(|e| FileCopyError::new("Failed to sync file", &e))?;
    }

    // Permission errors are expected on FAT-family media
    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    if let Err(e) = preserve_timestamps(&source_metadata, dest) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }

    Ok(bytes_written)
}

/// Preserve access and modification timestamps from source to destination
fn preserve_timestamps(source_metadata: &fs::Metadata, dest: &Path) -> io::Result<()> {
    let atime = filetime::FileTime::from_last_access_time(source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(source_metadata);
    filetime::set_file_times(dest, atime, mtime)
}

/// Check if an I/O error indicates the device has been removed
pub fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotFound => true,
        ErrorKind::PermissionDenied => false,
        ErrorKind::BrokenPipe => true,
        ErrorKind::ConnectionReset => true,
        ErrorKind::ConnectionAborted => true,
        ErrorKind::NotConnected => true,
        _ => {
            if let Some(os_error) = error.raw_os_error() {
                matches!(
                    os_error,
                    libc::EIO
                    | libc::ENODEV
                    | libc::ENXIO
                    | libc::ENOMEDIUM
                    | libc::EMEDIUMTYPE
                )
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn write(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_is_device_removed_error_eio() {
        let error = io::Error::from_raw_os_error(libc::EIO);
        assert!(is_device_removed_error(&error));
    }

    #[test]
    fn test_is_device_removed_error_permission_denied() {
        let error = io::Error::new(ErrorKind::PermissionDenied, "permission denied");
        assert!(!is_device_removed_error(&error));
    }

    #[test]
    fn test_mirror_dir_uses_source_name() {
        assert_eq!(
            mirror_dir(Path::new("/media/DST"), Path::new("/media/SRC/")),
            PathBuf::from("/media/DST/SRC")
        );
        assert_eq!(
            mirror_dir(Path::new("/media/DST"), Path::new("/")),
            PathBuf::from("/media/DST/root")
        );
    }

    #[tokio::test]
    async fn test_scan_source_classifies_failures() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("gone");
        assert!(matches!(
            scan_source(&missing).await,
            Err(SyncError::InaccessibleVolume { .. })
        ));

        let file = temp.path().join("plain.txt");
        write(&file, b"x");
        assert!(matches!(
            scan_source(&file).await,
            Err(SyncError::ScanFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_scan_empty_directory() {
        let temp = tempdir().unwrap();
        let result = scan_directory(temp.path()).await.unwrap();

        assert!(result.files.is_empty());
        assert!(result.directories.is_empty());
        assert_eq!(result.total_bytes, 0);
    }

    #[tokio::test]
    async fn test_scan_missing_directory_fails() {
        let temp = tempdir().unwrap();
        assert!(scan_directory(&temp.path().join("gone")).await.is_err());
    }

    #[test]
    fn test_unreadable_subdirectory_is_skipped() {
        let temp = tempdir().unwrap();
        write(&temp.path().join("photo.jpg"), b"jpeg");

        let mut result = ScanResult::default();
        scan_directory_recursive(temp.path(), &temp.path().join("lost+found"), &mut result)
            .unwrap();

        assert!(result.files.is_empty());
        assert_eq!(result.unreadable, vec![temp.path().join("lost+found")]);
    }

    #[tokio::test]
    async fn test_locked_subdirectory_does_not_block_scan() {
        if nix::unistd::Uid::effective().is_root() {
            eprintln!("Skipping: permissions are not enforced for root");
            return;
        }

        let temp = tempdir().unwrap();
        let source = temp.path().join("SRC");
        write(&source.join("photo.jpg"), b"jpeg");
        fs::create_dir_all(source.join("lost+found")).unwrap();
        fs::set_permissions(source.join("lost+found"), fs::Permissions::from_mode(0o000))
            .unwrap();

        let result = scan_source(&source).await;
        fs::set_permissions(source.join("lost+found"), fs::Permissions::from_mode(0o700))
            .unwrap();

        let result = result.unwrap();
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].relative, PathBuf::from("photo.jpg"));
        assert_eq!(result.unreadable, vec![source.join("lost+found")]);
    }

    #[tokio::test]
    async fn test_scan_with_files() {
        let temp = tempdir().unwrap();
        write(&temp.path().join("file1.txt"), b"hello");
        write(&temp.path().join("file2.txt"), b"world!!!");
        write(&temp.path().join("subdir/nested.txt"), b"nested");

        let result = scan_directory(temp.path()).await.unwrap();

        assert_eq!(result.files.len(), 3);
        assert_eq!(result.directories.len(), 1);
        assert_eq!(result.total_bytes, 5 + 8 + 6);
        assert_eq!(result.files[2].relative, PathBuf::from("subdir/nested.txt"));
    }

    #[test]
    fn test_copy_tree_mirrors_structure_and_metadata() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        let dest = temp.path().join("dest");

        write(&source.join("file1.txt"), b"hello world");
        write(&source.join("subdir/file2.txt"), b"nested content");
        fs::set_permissions(source.join("file1.txt"), fs::Permissions::from_mode(0o640)).unwrap();
        let old = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(source.join("file1.txt"), old).unwrap();

        let scan = scan_directory_sync(&source).unwrap();
        let stats =
            copy_tree_sync(&source, &dest, &scan, CopyOptions::always(false), |_, _| {}).unwrap();

        assert_eq!(stats.copied, 2);
        assert_eq!(stats.skipped(), 0);
        assert_eq!(stats.bytes_copied, 11 + 14);
        assert_eq!(
            fs::read_to_string(dest.join("subdir/file2.txt")).unwrap(),
            "nested content"
        );

        let meta = fs::metadata(dest.join("file1.txt")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        assert_eq!(FileTime::from_last_modification_time(&meta), old);
    }

    #[test]
    fn test_copy_visits_every_scanned_file_once() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        for i in 0..5 {
            write(&source.join(format!("d{}/f{}.bin", i % 2, i)), &[i as u8; 16]);
        }

        let scan = scan_directory_sync(&source).unwrap();
        let visited = Arc::new(Mutex::new(Vec::new()));
        let seen = visited.clone();

        copy_tree_sync(
            &source,
            &temp.path().join("dest"),
            &scan,
            CopyOptions::always(false),
            move |info, _| seen.lock().unwrap().push(info.relative.clone()),
        )
        .unwrap();

        let visited = visited.lock().unwrap();
        let scanned: Vec<PathBuf> = scan.files.iter().map(|f| f.relative.clone()).collect();
        assert_eq!(*visited, scanned);
    }

    #[test]
    fn test_copy_if_stale_skips_current_files() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        let dest = temp.path().join("dest");
        write(&source.join("a.txt"), b"aaaa");
        write(&source.join("b.txt"), b"bbbb");

        let scan = scan_directory_sync(&source).unwrap();
        let first =
            copy_tree_sync(&source, &dest, &scan, CopyOptions::if_stale(false), |_, _| {}).unwrap();
        assert_eq!(first.copied, 2);

        let second =
            copy_tree_sync(&source, &dest, &scan, CopyOptions::if_stale(false), |_, _| {}).unwrap();
        assert_eq!(second.copied, 0);
        assert_eq!(second.up_to_date, 2);
        assert_eq!(second.files.len(), 2);
    }

    #[test]
    fn test_newer_source_with_same_size_is_stale() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        write(&src, b"1234");
        write(&dst, b"abcd");

        filetime::set_file_mtime(&dst, FileTime::from_unix_time(1_000, 0)).unwrap();
        filetime::set_file_mtime(&src, FileTime::from_unix_time(2_000, 0)).unwrap();
        assert!(!is_up_to_date(&src, &dst));

        filetime::set_file_mtime(&dst, FileTime::from_unix_time(2_000, 0)).unwrap();
        assert!(is_up_to_date(&src, &dst));

        write(&dst, b"abcde");
        filetime::set_file_mtime(&dst, FileTime::from_unix_time(3_000, 0)).unwrap();
        assert!(!is_up_to_date(&src, &dst));
    }

    #[test]
    fn test_unreadable_file_is_counted_not_fatal() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        write(&source.join("ok.txt"), b"fine");
        write(&source.join("vanished.txt"), b"soon gone");

        let scan = scan_directory_sync(&source).unwrap();
        fs::remove_file(source.join("vanished.txt")).unwrap();

        let stats = copy_tree_sync(
            &source,
            &temp.path().join("dest"),
            &scan,
            CopyOptions::always(false),
            |_, _| {},
        )
        .unwrap();

        assert_eq!(stats.copied, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.files, vec![PathBuf::from("ok.txt")]);
    }

    #[tokio::test]
    async fn test_async_copy_tree_reports_through_callback() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        write(&source.join("one.txt"), b"1");
        write(&source.join("two.txt"), b"22");

        let scan = Arc::new(scan_directory(&source).await.unwrap());
        let counter = Arc::new(Mutex::new(0u64));
        let seen = counter.clone();

        let stats = copy_tree(
            &source,
            &temp.path().join("dest"),
            scan,
            CopyOptions::always(true),
            move |_, outcome| {
                if matches!(outcome, FileOutcome::Copied { .. }) {
                    *seen.lock().unwrap() += 1;
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.copied, 2);
        assert_eq!(*counter.lock().unwrap(), 2);
    }
}
