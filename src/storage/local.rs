//! Local filesystem storage backend
//!
//! Implements StorageBackend on a directory of the local filesystem.
//!
//! ## Security
//!
//! Every relative path goes through a [`PathValidator`] bound to the base
//! directory, so traversal sequences and symlinks pointing outside of it are
//! rejected before any file is touched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{
    DirectoryTreeNode, FileEntry, StorageBackend, StorageError, UploadedFile, join_relative,
    run_blocking, sort_directories_first, split_parent,
};
use crate::imaging::{ImageDerivativePipeline, ImageOptions};
use crate::naming::{UniqueNameResolver, sanitize_file_name};
use crate::validation::{PathValidator, StorageRoot};

/// Attempts at reserving a unique name when concurrent uploads race for it
const RESERVE_ATTEMPTS: usize = 3;

/// Local filesystem storage backend
pub struct LocalStorageBackend {
    base_path: PathBuf,
    public_prefix: String,
    validator: PathValidator,
    names: UniqueNameResolver,
    pipeline: ImageDerivativePipeline,
}

impl LocalStorageBackend {
    /// Create a backend rooted at `base_path`, served under `public_prefix`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use file_manager_sdk::storage::LocalStorageBackend;
    ///
    /// let backend = LocalStorageBackend::new("/srv/public/cdn", "/cdn");
    /// ```
    pub fn new(base_path: impl AsRef<Path>, public_prefix: impl Into<String>) -> Self {
        let base_path = base_path.as_ref().to_path_buf();
        Self {
            validator: PathValidator::new(StorageRoot::Local(base_path.clone())),
            base_path,
            public_prefix: public_prefix.into(),
            names: UniqueNameResolver::default(),
            pipeline: ImageDerivativePipeline::default(),
        }
    }

    /// Use `pipeline` for image uploads
    pub fn with_pipeline(mut self, pipeline: ImageDerivativePipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Use `names` for collision-free naming
    pub fn with_name_resolver(mut self, names: UniqueNameResolver) -> Self {
        self.names = names;
        self
    }

    /// Base directory of this backend
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Public URL path of `relative_path`
    pub fn public_path(&self, relative_path: &str) -> String {
        let prefix = self.public_prefix.trim_end_matches('/');
        if relative_path.is_empty() {
            prefix.to_string()
        } else {
            format!("{}/{}", prefix, relative_path)
        }
    }

    /// Validate `path` and return its normalized relative form and full path.
    fn resolve_path(&self, path: &str) -> Result<(String, PathBuf), StorageError> {
        let relative = self.validator.validate(path)?;
        let full = if relative.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(&relative)
        };
        Ok((relative, full))
    }

    /// Pick a free name in `folder` and create it exclusively.
    async fn reserve_name(
        &self,
        folder: &Path,
        desired: &str,
    ) -> Result<(String, fs::File), StorageError> {
        let mut last_error = None;
        for _ in 0..RESERVE_ATTEMPTS {
            let name = self.names.resolve(folder, desired)?;
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(folder.join(&name))
                .await
            {
                Ok(file) => return Ok((name, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => last_error = Some(e),
                Err(e) => {
                    return Err(StorageError::IoError(format!(
                        "Failed to create file {}: {}",
                        name, e
                    )));
                }
            }
        }
        Err(StorageError::AlreadyExists(format!(
            "{}: {}",
            desired,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

fn modified_time(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// In-progress encoder output (`.<name>.tmp`)
fn is_temporary(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

fn build_tree(dir: &Path, relative: &str) -> std::io::Result<Vec<DirectoryTreeNode>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        // file_type does not follow symlinks, which keeps link cycles out of the tree
        if entry.file_type()?.is_dir()
            && let Some(name) = entry.file_name().to_str()
        {
            names.push(name.to_string());
        }
    }
    names.sort();

    names
        .into_iter()
        .map(|name| {
            let path = join_relative(relative, &name);
            let children = build_tree(&dir.join(&name), &path)?;
            Ok(DirectoryTreeNode::new(name, path, children))
        })
        .collect()
}

#[async_trait(?Send)]
impl StorageBackend for LocalStorageBackend {
    async fn create_folder(&self, relative_path: &str) -> Result<Option<String>, StorageError> {
        let (relative, full) = self.resolve_path(relative_path)?;

        if fs::symlink_metadata(&full).await.is_ok() {
            debug!("Folder {} already exists", relative);
            return Ok(None);
        }

        fs::create_dir_all(&full).await.map_err(|e| {
            StorageError::IoError(format!("Failed to create directory {}: {}", relative, e))
        })?;

        info!("Created folder {}", relative);
        Ok(Some(relative))
    }

    async fn upload(
        &self,
        file: &UploadedFile,
        sub_folder: &str,
        image_options: &ImageOptions,
    ) -> Result<String, StorageError> {
        let (folder_relative, folder) = self.resolve_path(sub_folder)?;

        fs::create_dir_all(&folder).await.map_err(|e| {
            StorageError::IoError(format!(
                "Failed to create directory {}: {}",
                folder_relative, e
            ))
        })?;

        let (name, mut handle) = self.reserve_name(&folder, &file.original_name).await?;
        let relative = join_relative(&folder_relative, &name);
        let target = folder.join(&name);

        let written = async {
            use tokio::io::AsyncWriteExt;
            handle.write_all(&file.content).await?;
            handle.flush().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&target).await;
            return Err(StorageError::IoError(format!(
                "Failed to write file {}: {}",
                relative, e
            )));
        }
        drop(handle);

        if file.is_image() && image_options.compression_enabled {
            let pipeline = self.pipeline.clone();
            let options = *image_options;
            let path = target.clone();
            let processed = run_blocking(move || pipeline.process(&path, &path, &options)).await;
            match processed {
                Ok(Ok(set)) => debug!("Stored {} with {} derivative file(s)", relative, set.len()),
                // The verbatim upload is kept when processing fails
                Ok(Err(e)) => warn!("Image processing failed for {}: {}", relative, e),
                Err(e) => warn!("Image processing failed for {}: {}", relative, e),
            }
        }

        info!("Uploaded {} ({} bytes)", relative, file.size());
        Ok(relative)
    }

    async fn rename(&self, relative_path: &str, new_name: &str) -> Result<String, StorageError> {
        let (relative, full) = self.resolve_path(relative_path)?;
        if relative.is_empty() {
            return Err(StorageError::InvalidOperation(
                "Cannot rename the storage root".to_string(),
            ));
        }
        if fs::symlink_metadata(&full).await.is_err() {
            return Err(StorageError::FileNotFound(relative));
        }

        let (parent_relative, current_name) = split_parent(&relative);
        let sanitized = sanitize_file_name(new_name)?;
        if sanitized == current_name {
            return Ok(relative);
        }

        let parent = full.parent().unwrap_or(&self.base_path);
        let unique = self.names.resolve(parent, &sanitized)?;
        let renamed = join_relative(parent_relative, &unique);

        fs::rename(&full, parent.join(&unique)).await.map_err(|e| {
            StorageError::IoError(format!("Failed to rename {} to {}: {}", relative, renamed, e))
        })?;

        info!("Renamed {} to {}", relative, renamed);
        Ok(renamed)
    }

    async fn move_to(&self, relative_path: &str, destination: &str) -> Result<String, StorageError> {
        let (relative, full) = self.resolve_path(relative_path)?;
        let (destination_relative, destination_dir) = self.resolve_path(destination)?;
        if relative.is_empty() {
            return Err(StorageError::InvalidOperation(
                "Cannot move the storage root".to_string(),
            ));
        }
        if destination_relative == relative
            || destination_relative.starts_with(&format!("{}/", relative))
        {
            return Err(StorageError::InvalidOperation(format!(
                "Cannot move {} into itself",
                relative
            )));
        }
        if fs::symlink_metadata(&full).await.is_err() {
            return Err(StorageError::FileNotFound(relative));
        }

        fs::create_dir_all(&destination_dir).await.map_err(|e| {
            StorageError::IoError(format!(
                "Failed to create directory {}: {}",
                destination_relative, e
            ))
        })?;

        let (_, name) = split_parent(&relative);
        let moved = join_relative(&destination_relative, name);
        let target = destination_dir.join(name);
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(StorageError::AlreadyExists(moved));
        }

        fs::rename(&full, &target).await.map_err(|e| {
            StorageError::IoError(format!("Failed to move {} to {}: {}", relative, moved, e))
        })?;

        info!("Moved {} to {}", relative, moved);
        Ok(moved)
    }

    async fn delete(&self, relative_path: &str) -> Result<bool, StorageError> {
        let (relative, full) = self.resolve_path(relative_path)?;
        if relative.is_empty() {
            return Err(StorageError::InvalidOperation(
                "Cannot delete the storage root".to_string(),
            ));
        }

        let metadata = fs::symlink_metadata(&full)
            .await
            .map_err(|_| StorageError::FileNotFound(relative.clone()))?;

        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_file(&full).await
        };
        removed.map_err(|e| {
            StorageError::IoError(format!("Failed to delete {}: {}", relative, e))
        })?;

        info!("Deleted {}", relative);
        Ok(true)
    }

    async fn download(&self, relative_path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let (relative, full) = self.resolve_path(relative_path)?;

        match fs::metadata(&full).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::IoError(format!(
                    "Failed to read metadata of {}: {}",
                    relative, e
                )));
            }
        }

        fs::read(&full)
            .await
            .map(Some)
            .map_err(|e| StorageError::IoError(format!("Failed to read file {}: {}", relative, e)))
    }

    async fn list_files(&self, sub_folder: &str) -> Result<Vec<FileEntry>, StorageError> {
        let (folder_relative, folder) = self.resolve_path(sub_folder)?;

        match fs::metadata(&folder).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => return Ok(Vec::new()),
        }

        let mut read_dir = fs::read_dir(&folder).await.map_err(|e| {
            StorageError::IoError(format!(
                "Failed to read directory {}: {}",
                folder_relative, e
            ))
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StorageError::IoError(format!("Failed to read directory entry: {}", e)))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_temporary(&name) {
                continue;
            }
            // Follows symlinks; dangling links are skipped
            let Ok(metadata) = fs::metadata(entry.path()).await else {
                continue;
            };

            let relative = join_relative(&folder_relative, &name);
            let public_path = self.public_path(&relative);
            let modified = modified_time(&metadata);
            entries.push(if metadata.is_dir() {
                FileEntry::directory(&name, relative, public_path, modified)
            } else {
                FileEntry::file(&name, metadata.len(), relative, public_path, modified)
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        sort_directories_first(&mut entries);
        Ok(entries)
    }

    async fn list_directory_tree(&self, sub_folder: &str) -> Result<Vec<DirectoryTreeNode>, StorageError> {
        let (folder_relative, folder) = self.resolve_path(sub_folder)?;

        match fs::metadata(&folder).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => return Ok(Vec::new()),
        }

        let relative = folder_relative.clone();
        run_blocking(move || build_tree(&folder, &relative)).await?.map_err(|e| {
            StorageError::IoError(format!(
                "Failed to read directory tree {}: {}",
                folder_relative, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_public_path() {
        let backend = LocalStorageBackend::new("/srv/cdn", "/cdn/");
        assert_eq!(backend.public_path("a/b.png"), "/cdn/a/b.png");
        assert_eq!(backend.public_path(""), "/cdn");
    }

    #[test]
    fn test_path_traversal_blocked() {
        let temp = TempDir::new().unwrap();
        let backend = LocalStorageBackend::new(temp.path(), "/cdn");

        let result = backend.resolve_path("../etc/passwd");
        assert!(matches!(result, Err(StorageError::InvalidPath(_))));

        let result = backend.resolve_path("/foo/../../../etc/passwd");
        assert!(matches!(result, Err(StorageError::InvalidPath(_))));

        let (relative, full) = backend.resolve_path("/valid/path/file.txt/").unwrap();
        assert_eq!(relative, "valid/path/file.txt");
        assert_eq!(full, temp.path().join("valid/path/file.txt"));
    }

    #[test]
    fn test_temporary_names() {
        assert!(is_temporary(".photo.jpg.tmp"));
        assert!(!is_temporary("photo.tmp"));
        assert!(!is_temporary(".htaccess"));
    }
}
