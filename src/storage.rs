//! Storage backends for the inbox and the archive.
//!
//! The pipeline needs three things from a storage target: where a job's file
//! lives ([`Storage::locate`]), a writer for a new file and a reader for an
//! existing one. [`FileStorage`] implements them on a POSIX directory tree.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{ARCHIVE_ID_WIDTH, ARCHIVE_SEGMENT_WIDTH};
use crate::types::JobId;

/// Relative archive path of a job: the id zero-padded to 20 digits, split
/// into directories of 3 characters.
#[must_use]
pub fn archive_name(job_id: JobId) -> PathBuf {
    let padded = format!("{job_id:0ARCHIVE_ID_WIDTH$}");
    padded.as_bytes().chunks(ARCHIVE_SEGMENT_WIDTH).map(|segment| String::from_utf8_lossy(segment).into_owned()).collect()
}

/// A place files can be written to and read back from.
pub trait Storage: Send + Sync {
    type Reader: Read + Send;
    type Writer: Write + Send;

    /// Absolute path of a job's file.
    fn locate(&self, job_id: JobId) -> PathBuf;

    /// Creates (or truncates) a file, creating parent directories.
    fn create(&self, path: &Path) -> Result<Self::Writer>;

    fn open(&self, path: &Path) -> Result<Self::Reader>;

    /// Removes a file. Removing a missing file is not an error.
    fn remove(&self, path: &Path) -> Result<()>;

    fn size(&self, path: &Path) -> Result<u64>;

    /// Copies `source` to `target` and returns the number of bytes written.
    fn copy(&self, source: &Path, target: &Path) -> Result<u64> {
        let mut reader = self.open(source)?;
        let mut writer = self.create(target)?;
        let written = io::copy(&mut reader, &mut writer).with_context(|| format!("failed to copy {} to {}", source.display(), target.display()))?;
        writer.flush().with_context(|| format!("failed to flush {}", target.display()))?;
        Ok(written)
    }
}

/// A directory tree on a local or mounted filesystem.
#[derive(Clone, Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an uploaded file in a user's inbox.
    ///
    /// # Errors
    ///
    /// Refuses user names and file paths that would leave the inbox.
    pub fn inbox_path(&self, user: &str, filepath: &str) -> Result<PathBuf> {
        let user = Path::new(user);
        let file = Path::new(filepath.trim_start_matches('/'));

        if user.components().count() != 1 || !matches!(user.components().next(), Some(Component::Normal(_))) {
            bail!("invalid inbox user: {}", user.display());
        }
        if file.as_os_str().is_empty() || !file.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
            bail!("invalid inbox path: {filepath}");
        }

        Ok(self.root.join(user).join(file))
    }
}

impl Storage for FileStorage {
    type Reader = BufReader<File>;
    type Writer = BufWriter<File>;

    fn locate(&self, job_id: JobId) -> PathBuf {
        self.root.join(archive_name(job_id))
    }

    fn create(&self, path: &Path) -> Result<Self::Writer> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to create file: {}", path.display()))?;

        Ok(BufWriter::new(file))
    }

    fn open(&self, path: &Path) -> Result<Self::Reader> {
        let file = File::open(path).with_context(|| format!("failed to open file: {}", path.display()))?;
        Ok(BufReader::new(file))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("cannot remove: {}", path.display())),
        }
    }

    fn size(&self, path: &Path) -> Result<u64> {
        let meta = fs::metadata(path).with_context(|| format!("stat failed: {}", path.display()))?;
        Ok(meta.len())
    }
}
