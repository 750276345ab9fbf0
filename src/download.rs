use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::config::DownloadSettings;
use crate::domain::{AnalysisId, FileRecord};
use crate::error::IngestError;

pub trait BulkDownloader: Send + Sync {
    fn download(&self, analysis_id: &AnalysisId, staging_root: &Utf8Path)
    -> Result<(), IngestError>;
    fn locate(&self) -> Result<PathBuf, IngestError>;
}

#[derive(Clone)]
pub struct GtDownloadClient {
    command: String,
    program: Option<PathBuf>,
    credentials: Utf8PathBuf,
    max_children: usize,
}

impl GtDownloadClient {
    pub fn new(settings: &DownloadSettings) -> Self {
        Self {
            command: settings.command.clone(),
            program: find_in_path(&settings.command),
            credentials: settings.credentials.clone(),
            max_children: settings.max_children,
        }
    }

    fn require_program(&self) -> Result<&PathBuf, IngestError> {
        self.program
            .as_ref()
            .ok_or_else(|| IngestError::MissingTool(self.command.clone()))
    }

    pub fn arguments(&self, analysis_id: &AnalysisId, staging_root: &Utf8Path) -> Vec<String> {
        let log_path = staging_root
            .join(".logs")
            .join(format!("{analysis_id}.log"));
        vec![
            "-c".to_string(),
            self.credentials.to_string(),
            "-v".to_string(),
            "-d".to_string(),
            analysis_id.to_string(),
            "-l".to_string(),
            log_path.to_string(),
            "--max-children".to_string(),
            self.max_children.to_string(),
            "-p".to_string(),
            staging_root.to_string(),
        ]
    }
}

impl BulkDownloader for GtDownloadClient {
    fn download(
        &self,
        analysis_id: &AnalysisId,
        staging_root: &Utf8Path,
    ) -> Result<(), IngestError> {
        let program = self.require_program()?;
        fs::create_dir_all(staging_root.join(".logs").as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let args = self.arguments(analysis_id, staging_root);
        debug!(program = %program.display(), ?args, "starting bulk download");
        let output = Command::new(program)
            .args(&args)
            .output()
            .map_err(|err| IngestError::Download(err.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("{} exited with {}", program.display(), output.status)
        } else {
            stderr
        };
        Err(IngestError::Download(message))
    }

    fn locate(&self) -> Result<PathBuf, IngestError> {
        self.require_program().cloned()
    }
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

#[derive(Debug, Clone)]
pub struct Staging {
    root: Utf8PathBuf,
}

impl Staging {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn analysis_dir(&self, analysis_id: &AnalysisId) -> Utf8PathBuf {
        self.root.join(analysis_id.as_str())
    }

    pub fn partial_dir(&self, analysis_id: &AnalysisId) -> Utf8PathBuf {
        self.root.join(format!("{analysis_id}.partial"))
    }

    pub fn file_path(&self, record: &FileRecord) -> Utf8PathBuf {
        self.analysis_dir(&record.analysis_id)
            .join(&record.file_name)
    }

    pub fn check_root(&self) -> Result<(), IngestError> {
        if !self.root.as_std_path().is_dir() {
            return Err(IngestError::StagingRoot(self.root.clone().into_std_path_buf()));
        }
        Ok(())
    }

    pub fn available_bytes(&self) -> Result<u64, IngestError> {
        let stat = nix::sys::statvfs::statvfs(self.root.as_std_path())
            .map_err(|err| IngestError::Filesystem(format!("statvfs {}: {err}", self.root)))?;
        // `fsblkcnt_t` is a `u32` on macOS but a `u64` on Linux.
        #[allow(clippy::useless_conversion)]
        let blocks = u64::from(stat.blocks_available());
        Ok(blocks * stat.fragment_size())
    }

    pub fn preflight(&self, files: &[FileRecord]) -> Result<(), IngestError> {
        let needed = files.iter().map(|file| file.file_size).sum::<u64>();
        let available = self.available_bytes()?;
        if available < needed {
            return Err(IngestError::InsufficientSpace {
                path: self.root.clone().into_std_path_buf(),
                needed,
                available,
            });
        }
        debug!(needed, available, "staging space available");
        Ok(())
    }

    pub fn verify(
        &self,
        analysis_id: &AnalysisId,
        files: &[FileRecord],
    ) -> Result<Vec<Utf8PathBuf>, IngestError> {
        let dir = self.analysis_dir(analysis_id);
        let expected = files
            .iter()
            .map(|file| file.file_name.clone())
            .collect::<BTreeSet<_>>();
        let mismatch = |found: &BTreeSet<String>| IngestError::DownloadCountMismatch {
            analysis_id: analysis_id.clone(),
            expected: expected.len(),
            found: found.len(),
            missing: expected.difference(found).cloned().collect(),
            unexpected: found.difference(&expected).cloned().collect(),
        };

        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(mismatch(&BTreeSet::new())),
            Err(err) => return Err(IngestError::Filesystem(format!("read {dir}: {err}"))),
        };
        let mut found = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
            if entry.path().is_file() {
                found.insert(entry.file_name().to_string_lossy().to_string());
            }
        }
        if found != expected {
            return Err(mismatch(&found));
        }
        Ok(files.iter().map(|file| self.file_path(file)).collect())
    }

    pub fn download<D: BulkDownloader + ?Sized>(
        &self,
        downloader: &D,
        analysis_id: &AnalysisId,
        files: &[FileRecord],
    ) -> Result<Vec<Utf8PathBuf>, IngestError> {
        self.preflight(files)?;
        self.cleanup(analysis_id);
        info!(%analysis_id, files = files.len(), "downloading analysis");
        downloader.download(analysis_id, &self.root)?;
        self.verify(analysis_id, files)
    }

    pub fn cleanup(&self, analysis_id: &AnalysisId) {
        for dir in [self.analysis_dir(analysis_id), self.partial_dir(analysis_id)] {
            match fs::remove_dir_all(dir.as_std_path()) {
                Ok(()) => debug!(%dir, "removed staging directory"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(%dir, error = %err, "failed to remove staging directory"),
            }
        }
    }
}
