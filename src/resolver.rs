//! Upload path resolution.

use std::path::{Path, PathBuf};

/// Collaborator giving the absolute base path for uploads.
pub trait UploadPathResolver: Send + Sync {
    /// Absolute base directory of all uploads
    fn upload_path(&self) -> &Path;

    /// Absolute path of `relative_path` under the upload directory
    fn full_path(&self, relative_path: &str) -> PathBuf {
        let relative = relative_path.trim_start_matches('/');
        if relative.is_empty() {
            self.upload_path().to_path_buf()
        } else {
            self.upload_path().join(relative)
        }
    }

    /// Relative form of `full_path`, or `None` when it is outside the upload directory
    fn relative_path(&self, full_path: &Path) -> Option<String> {
        full_path
            .strip_prefix(self.upload_path())
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }
}

/// Composes the configured base directory with the configured upload folder.
#[derive(Debug, Clone)]
pub struct DefaultUploadPathResolver {
    upload_path: PathBuf,
}

impl DefaultUploadPathResolver {
    /// Create a resolver for `base_path/upload_folder`
    pub fn new(base_path: impl AsRef<Path>, upload_folder: &str) -> Self {
        let folder = upload_folder.trim_matches('/');
        let upload_path = if folder.is_empty() {
            base_path.as_ref().to_path_buf()
        } else {
            base_path.as_ref().join(folder)
        };
        Self { upload_path }
    }
}

impl UploadPathResolver for DefaultUploadPathResolver {
    fn upload_path(&self) -> &Path {
        &self.upload_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_folder_composition() {
        let resolver = DefaultUploadPathResolver::new("/srv/public/cdn", "/tenant-a/");
        assert_eq!(resolver.upload_path(), Path::new("/srv/public/cdn/tenant-a"));

        let resolver = DefaultUploadPathResolver::new("/srv/public/cdn", "");
        assert_eq!(resolver.upload_path(), Path::new("/srv/public/cdn"));
    }

    #[test]
    fn test_full_and_relative_paths() {
        let resolver = DefaultUploadPathResolver::new("/srv/cdn", "");
        let full = resolver.full_path("/docs/a.pdf");
        assert_eq!(full, PathBuf::from("/srv/cdn/docs/a.pdf"));
        assert_eq!(resolver.relative_path(&full).as_deref(), Some("docs/a.pdf"));
        assert_eq!(resolver.relative_path(Path::new("/etc/passwd")), None);
    }
}
