//! Quota accounting.
//!
//! Used space is derived on demand by walking the storage root, so it always
//! reflects what is actually stored. The check is point-in-time with no
//! reservation: concurrent uploads can jointly exceed the ceiling.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

/// Quota value meaning "no limit"
pub const UNLIMITED_QUOTA: i64 = -1;

/// Authorizes additional bytes against a configured ceiling.
#[derive(Debug, Clone)]
pub struct QuotaGuard {
    root: PathBuf,
    max_bytes: i64,
}

impl QuotaGuard {
    /// Create a guard for `root` with a ceiling of `max_bytes` (`-1` = unlimited)
    pub fn new(root: impl AsRef<Path>, max_bytes: i64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_bytes,
        }
    }

    /// Configured ceiling in bytes (`-1` = unlimited)
    pub fn max_bytes(&self) -> i64 {
        self.max_bytes
    }

    /// Whether the guard enforces any ceiling
    pub fn is_unlimited(&self) -> bool {
        self.max_bytes < 0
    }

    /// Sum of regular file sizes under the root. A missing root is empty.
    pub fn used_bytes(&self) -> u64 {
        if !self.root.exists() {
            return 0;
        }
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum()
    }

    /// Whether `byte_count` more bytes fit under the ceiling.
    pub fn can_add(&self, byte_count: u64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let used = self.used_bytes();
        let allowed = used.saturating_add(byte_count) <= self.max_bytes as u64;
        debug!(
            "Quota check for {}: used={} adding={} max={} allowed={}",
            self.root.display(),
            used,
            byte_count,
            self.max_bytes,
            allowed
        );
        allowed
    }
}

/// Collaborator giving the quota policy to the file manager.
///
/// Implement this to inject an external policy (per-user quotas, a quota
/// stored elsewhere, ...). [`DefaultQuotaResolver`] wraps a [`QuotaGuard`].
pub trait QuotaResolver: Send + Sync {
    /// Maximum allowed bytes (`-1` = unlimited)
    fn max_quota(&self) -> i64;

    /// Bytes currently in use
    fn used_space(&self) -> u64;

    /// Whether a file of `file_size` bytes may be added
    fn can_add_file(&self, file_size: u64) -> bool {
        let max = self.max_quota();
        if max < 0 {
            return true;
        }
        self.used_space().saturating_add(file_size) <= max as u64
    }
}

/// Quota resolver backed by a walk of the local upload directory.
#[derive(Debug, Clone)]
pub struct DefaultQuotaResolver {
    guard: QuotaGuard,
}

impl DefaultQuotaResolver {
    /// Create a resolver for `upload_path` with the configured `quota_max`
    pub fn new(upload_path: impl AsRef<Path>, quota_max: i64) -> Self {
        Self {
            guard: QuotaGuard::new(upload_path, quota_max),
        }
    }
}

impl QuotaResolver for DefaultQuotaResolver {
    fn max_quota(&self) -> i64 {
        self.guard.max_bytes()
    }

    fn used_space(&self) -> u64 {
        self.guard.used_bytes()
    }

    fn can_add_file(&self, file_size: u64) -> bool {
        self.guard.can_add(file_size)
    }
}

/// Format a byte count for humans, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    let rounded = (size * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[unit])
    } else {
        format!("{} {}", rounded, UNITS[unit])
    }
}
