//! Engine configuration and the filesystem containment policy.

use crate::error::PolicyError;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Sizing limits for descriptor construction.
#[derive(Clone, Debug)]
pub struct DescriptorLimits {
    /// Longest string prefix inlined into a summary, in bytes.
    pub string_prefix: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Cap on array sample values included for sparklines.
    pub array_sample: usize,
}

impl Default for DescriptorLimits {
    fn default() -> Self {
        Self {
            string_prefix: 256,
            default_page_size: 32,
            max_page_size: 256,
            array_sample: 32,
        }
    }
}

/// Process-wide engine configuration, explicit at construction.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub runtime_version: String,
    /// Bounded worker pool width.
    pub workers: usize,
    /// Root under which operators may read and goals may write.
    pub data_root: PathBuf,
    /// Additional read-only roots.
    pub extra_read_roots: Vec<PathBuf>,
    /// Scratch space handed to operators through their context.
    pub scratch_dir: PathBuf,
    /// Bounded tail of engine events retained per job.
    pub event_capacity: usize,
    /// Terminal jobs retained in memory before FIFO eviction.
    pub job_retention: usize,
    pub log_tail_capacity: usize,
    /// Store leases older than this are treated as abandoned by a crashed
    /// process and may be reclaimed.
    pub lease_ttl: Duration,
    pub descriptor: DescriptorLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_root = std::env::temp_dir().join("voxlogica-data");
        Self {
            runtime_version: crate::reducer::canonical::RUNTIME_VERSION.to_string(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            scratch_dir: data_root.join("scratch"),
            data_root,
            extra_read_roots: Vec::new(),
            event_capacity: 1024,
            job_retention: 128,
            log_tail_capacity: 200,
            lease_ttl: Duration::from_secs(300),
            descriptor: DescriptorLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Read overrides from the environment (`VOX_DATA_ROOT`,
    /// `VOX_READ_ROOTS`, `VOX_WORKERS`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(root) = std::env::var("VOX_DATA_ROOT") {
            config.data_root = PathBuf::from(&root);
            config.scratch_dir = config.data_root.join("scratch");
        }
        if let Ok(roots) = std::env::var("VOX_READ_ROOTS") {
            config.extra_read_roots = std::env::split_paths(&roots).collect();
        }
        if let Ok(workers) = std::env::var("VOX_WORKERS") {
            if let Ok(n) = workers.parse::<usize>() {
                if n > 0 {
                    config.workers = n;
                }
            }
        }
        config
    }

    /// Check that `path` is contained in the data root or one of the extra
    /// read roots; returns the normalized absolute path. This check is the
    /// core's responsibility, not the operators'.
    pub fn ensure_readable(&self, path: &Path) -> Result<PathBuf, PolicyError> {
        let normalized = self.normalize(path)?;
        let allowed = std::iter::once(&self.data_root).chain(self.extra_read_roots.iter());
        for root in allowed {
            if normalized.starts_with(root) {
                return Ok(normalized);
            }
        }
        Err(PolicyError::PathOutsideRoots(path.to_path_buf()))
    }

    /// Writes (save goals) are confined to the data root alone.
    pub fn ensure_writable(&self, path: &Path) -> Result<PathBuf, PolicyError> {
        let normalized = self.normalize(path)?;
        if normalized.starts_with(&self.data_root) {
            Ok(normalized)
        } else {
            Err(PolicyError::PathOutsideRoots(path.to_path_buf()))
        }
    }

    /// Lexical normalization: make absolute against the data root and
    /// resolve `.`/`..` without touching the filesystem, so containment
    /// cannot be escaped with parent segments on paths that do not exist
    /// yet.
    fn normalize(&self, path: &Path) -> Result<PathBuf, PolicyError> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_root.join(path)
        };
        let mut out = PathBuf::new();
        for component in absolute.components() {
            match component {
                Component::ParentDir => {
                    if !out.pop() {
                        return Err(PolicyError::PathOutsideRoots(path.to_path_buf()));
                    }
                }
                Component::CurDir => {}
                other => out.push(other.as_os_str()),
            }
        }
        Ok(out)
    }
}
