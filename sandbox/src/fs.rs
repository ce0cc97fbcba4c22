use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::errors::{Result, SandboxError};
use crate::path::{self, PathResolver, ResolvedPath, SymlinkPolicy};
use crate::seed::SeedManifest;

pub const BASE_DIR_ENV: &str = "SANDBOX_BASE_DIR";
pub const MAX_FILE_SIZE_ENV: &str = "SANDBOX_MAX_FILE_SIZE";
pub const SYMLINKS_ENV: &str = "SANDBOX_SYMLINKS";
pub const IO_TIMEOUT_ENV: &str = "SANDBOX_IO_TIMEOUT_MS";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    base_dir: PathBuf,
    max_file_size: u64,
    symlinks: SymlinkPolicy,
    io_timeout: Option<Duration>,
}

impl SandboxConfig {
    /// Creates the base directory if it is missing; a concurrent creator is not an error.
    pub fn new(base_dir: impl AsRef<Path>, max_file_size: u64) -> Result<Self> {
        let base = path::ensure_absolute_base(base_dir.as_ref())?;
        fs::create_dir_all(&base)?;
        let base = fs::canonicalize(base)?;
        Ok(Self {
            base_dir: base,
            max_file_size,
            symlinks: SymlinkPolicy::default(),
            io_timeout: None,
        })
    }

    pub fn from_env() -> Result<Self> {
        let base_dir = std::env::var(BASE_DIR_ENV).map_err(|_| {
            SandboxError::InvalidConfig(format!("{BASE_DIR_ENV} environment variable is required"))
        })?;
        let max_file_size = env_setting(MAX_FILE_SIZE_ENV)?.unwrap_or(DEFAULT_MAX_FILE_SIZE);
        let symlinks: SymlinkPolicy = env_setting(SYMLINKS_ENV)?.unwrap_or_default();
        let io_timeout = env_setting::<u64>(IO_TIMEOUT_ENV)?.map(Duration::from_millis);

        let mut config = Self::new(base_dir, max_file_size)?.with_symlinks(symlinks);
        config.io_timeout = io_timeout;
        Ok(config)
    }

    pub fn with_symlinks(mut self, symlinks: SymlinkPolicy) -> Self {
        self.symlinks = symlinks;
        self
    }

    pub fn with_io_timeout(mut self, limit: Duration) -> Self {
        self.io_timeout = Some(limit);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn symlinks(&self) -> SymlinkPolicy {
        self.symlinks
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }
}

fn env_setting<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_setting(key, &raw).map(Some),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(SandboxError::InvalidConfig(format!("{key}: {err}"))),
    }
}

fn parse_setting<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| SandboxError::InvalidConfig(format!("{key}={raw:?} is invalid: {err}")))
}

/// Successful read: the canonical path plus the file text.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FileContent {
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct SeedReport {
    pub written: Vec<PathBuf>,
    pub skipped: Vec<String>,
}

/// File access for untrusted names, confined to one base directory.
#[derive(Clone, Debug)]
pub struct SandboxGateway {
    config: SandboxConfig,
    resolver: PathResolver,
}

impl SandboxGateway {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let resolver = PathResolver::new(config.base_dir(), config.symlinks())?;
        Ok(Self { config, resolver })
    }

    pub fn base_dir(&self) -> &Path {
        self.resolver.base()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn resolve(&self, raw: &str) -> Result<ResolvedPath> {
        self.resolver.resolve(raw)
    }

    #[instrument(skip(self))]
    pub fn read_file(&self, raw: &str) -> Result<Vec<u8>> {
        let outcome = self.read_confined(raw);
        match &outcome {
            Ok((path, bytes)) => debug!(path = %path, size = bytes.len(), "read file"),
            Err(err) => warn!(kind = err.kind().as_str(), "read rejected"),
        }
        outcome.map(|(_, bytes)| bytes)
    }

    #[instrument(skip(self))]
    pub fn read(&self, raw: &str) -> Result<FileContent> {
        let outcome = self.read_confined(raw);
        if let Err(err) = &outcome {
            warn!(kind = err.kind().as_str(), "read rejected");
        }
        let (path, bytes) = outcome?;
        Ok(FileContent {
            path: path.into_path_buf(),
            content: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    /// Best-effort bootstrap: names that fail resolution, content over the size
    /// limit, and entries whose write fails are skipped without stopping the
    /// rest. Each accepted entry is written atomically.
    #[instrument(skip(self, entries))]
    pub fn seed_files<I, K, V>(&self, entries: I) -> Result<SeedReport>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let mut report = SeedReport::default();
        for (name, content) in entries {
            let name = name.as_ref();
            let content = content.as_ref();
            let resolved = match self.resolver.resolve(name) {
                Ok(resolved) => resolved,
                Err(err) => {
                    warn!(entry = name, kind = err.kind().as_str(), "skipping seed entry");
                    report.skipped.push(name.to_string());
                    continue;
                }
            };
            if content.len() as u64 > self.config.max_file_size {
                warn!(entry = name, size = content.len(), "skipping oversized seed entry");
                report.skipped.push(name.to_string());
                continue;
            }
            match self.write_confined(name, &resolved, content) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(entry = name, "seed target moved outside the sandbox, skipping");
                    report.skipped.push(name.to_string());
                    continue;
                }
                Err(err) => {
                    warn!(entry = name, kind = err.kind().as_str(), error = %err, "seed write failed");
                    report.skipped.push(name.to_string());
                    continue;
                }
            }
            debug!(path = %resolved, size = content.len(), "seeded file");
            report.written.push(resolved.relative().to_path_buf());
        }
        Ok(report)
    }

    pub async fn read_file_async(&self, raw: impl Into<String>) -> Result<Vec<u8>> {
        let gateway = self.clone();
        let raw = raw.into();
        self.run_blocking(move || gateway.read_file(&raw)).await
    }

    pub async fn read_async(&self, raw: impl Into<String>) -> Result<FileContent> {
        let gateway = self.clone();
        let raw = raw.into();
        self.run_blocking(move || gateway.read(&raw)).await
    }

    pub async fn seed_files_async(&self, manifest: SeedManifest) -> Result<SeedReport> {
        let gateway = self.clone();
        self.run_blocking(move || gateway.seed_files(manifest.iter())).await
    }

    // The blocking task is not cancelled on timeout; it runs to completion detached.
    async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::task::spawn_blocking(op);
        let joined = match self.config.io_timeout {
            Some(limit) => timeout(limit, task).await.map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "sandbox operation timed out")
            })?,
            None => task.await,
        };
        match joined {
            Ok(result) => result,
            Err(err) => Err(io::Error::other(err.to_string()).into()),
        }
    }

    // Resolution and open are not atomic. After opening, the name is resolved
    // again and the handle must refer to the same file as the fresh result.
    fn read_confined(&self, raw: &str) -> Result<(ResolvedPath, Vec<u8>)> {
        let resolved = self.resolver.resolve(raw)?;
        let mut file = fs::File::open(resolved.as_path()).map_err(missing_as_not_found)?;
        let opened = file.metadata()?;
        if opened.is_dir() {
            return Err(SandboxError::NotFound);
        }

        let current = self.resolver.resolve(raw)?;
        if current != resolved {
            return Err(SandboxError::Traversal);
        }
        ensure_same_file(&opened, current.as_path())?;

        if opened.len() > self.config.max_file_size {
            return Err(SandboxError::FileTooLarge(opened.len()));
        }
        let mut buffer = Vec::with_capacity(opened.len() as usize);
        file.read_to_end(&mut buffer)?;
        Ok((resolved, buffer))
    }

    // Returns false when the parent chain changed under us between
    // resolution and the write.
    fn write_confined(&self, name: &str, resolved: &ResolvedPath, content: &[u8]) -> Result<bool> {
        let parent = resolved.as_path().parent().ok_or(SandboxError::Traversal)?;
        if !self.create_parents(resolved.relative())? {
            return Ok(false);
        }
        match self.resolver.resolve(name) {
            Ok(current) if current == *resolved => {}
            _ => return Ok(false),
        }

        let mut staged = NamedTempFile::new_in(parent)?;
        staged.write_all(content)?;
        staged.as_file().sync_all()?;
        staged
            .persist(resolved.as_path())
            .map_err(|err| SandboxError::Io(err.error))?;
        Ok(true)
    }

    // Creates the parents of `relative` one level at a time from the base.
    // The resolved form holds no links, so meeting one means a swap happened;
    // nothing deeper is created once that is seen.
    fn create_parents(&self, relative: &Path) -> Result<bool> {
        let mut current = self.resolver.base().to_path_buf();
        let Some(parents) = relative.parent() else {
            return Ok(true);
        };
        for segment in parents.components() {
            current.push(segment);
            match fs::create_dir(&current) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
            if fs::symlink_metadata(&current)?.file_type().is_symlink() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// The open handle and the freshly resolved path must name the same file.
fn ensure_same_file(opened: &fs::Metadata, path: &Path) -> Result<()> {
    let on_disk = fs::metadata(path).map_err(missing_as_not_found)?;
    if same_file(opened, &on_disk) {
        Ok(())
    } else {
        Err(SandboxError::Traversal)
    }
}

fn missing_as_not_found(err: io::Error) -> SandboxError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => SandboxError::NotFound,
        _ => SandboxError::Io(err),
    }
}

#[cfg(unix)]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}
