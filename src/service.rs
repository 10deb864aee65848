//! File manager service
//!
//! Orchestrates every caller-facing operation: path validation, write
//! permission checks, upload limits and quota, then delegation to the active
//! [`StorageBackend`]. Backend failures are translated into [`FileManagerError`].

use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::FileManagerConfig;
use crate::error::{FileManagerError, redact_secrets};
use crate::imaging::{ImageDerivativePipeline, ImageOptions, codec::detect_format};
use crate::naming::with_suffix;
use crate::quota::{DefaultQuotaResolver, QuotaResolver, UNLIMITED_QUOTA, format_bytes};
use crate::storage::{
    DirectoryTreeNode, FileEntry, StorageBackend, StorageError, UploadedFile, build_backend,
    run_blocking, split_parent,
};
use crate::validation::{PathValidator, StorageRoot};

/// Translate a backend failure into the kind of the operation that failed.
///
/// Path rejections, missing targets and permission problems keep their own kind.
fn backend_failure(error: StorageError, kind: fn(String) -> FileManagerError) -> FileManagerError {
    match error {
        StorageError::InvalidPath(e) => FileManagerError::InvalidPath(e.to_string()),
        StorageError::FileNotFound(path) | StorageError::DirectoryNotFound(path) => {
            FileManagerError::FileNotFound(path)
        }
        StorageError::PermissionDenied(path) => FileManagerError::PermissionDenied(path),
        other => kind(redact_secrets(&other.to_string())),
    }
}

fn display_folder(folder: &str) -> &str {
    if folder.is_empty() { "/" } else { folder }
}

/// Entry point for file management operations
pub struct FileManagerService {
    config: FileManagerConfig,
    backend: Box<dyn StorageBackend>,
    validator: PathValidator,
    quota: Box<dyn QuotaResolver>,
    pipeline: ImageDerivativePipeline,
}

impl FileManagerService {
    /// Create a service over an already built backend.
    ///
    /// `root` must be the root `backend` operates on.
    pub fn new(
        config: FileManagerConfig,
        backend: Box<dyn StorageBackend>,
        root: StorageRoot,
        quota: Box<dyn QuotaResolver>,
    ) -> Self {
        let pipeline = ImageDerivativePipeline::new(&config.image_processing);
        Self {
            config,
            backend,
            validator: PathValidator::new(root),
            quota,
            pipeline,
        }
    }

    /// Validate `config`, build its backend and a quota resolver on the storage root.
    ///
    /// Usage of object-store roots is not measured, so their quota is unlimited
    /// unless a resolver is injected through [`new`](Self::new).
    pub async fn from_config(config: FileManagerConfig) -> Result<Self, FileManagerError> {
        config
            .validate()
            .map_err(|e| FileManagerError::InvalidOperation(e.to_string()))?;

        let (backend, root) = build_backend(&config)
            .await
            .map_err(|e| FileManagerError::InvalidOperation(redact_secrets(&e.to_string())))?;

        let quota: Box<dyn QuotaResolver> = match root.local_path() {
            Some(path) => Box::new(DefaultQuotaResolver::new(path, config.quota_max)),
            None => {
                if config.quota_max != UNLIMITED_QUOTA {
                    warn!("quota_max is not enforced on {}", root.display());
                }
                Box::new(DefaultQuotaResolver::new(
                    &config.storage.local.path,
                    UNLIMITED_QUOTA,
                ))
            }
        };

        info!("File manager ready on {}", root.display());
        Ok(Self::new(config, backend, root, quota))
    }

    /// Active configuration
    pub fn config(&self) -> &FileManagerConfig {
        &self.config
    }

    /// Root every path is validated against
    pub fn root(&self) -> &StorageRoot {
        self.validator.root()
    }

    /// Quota collaborator
    pub fn quota(&self) -> &dyn QuotaResolver {
        self.quota.as_ref()
    }

    fn validate(&self, path: &str) -> Result<String, FileManagerError> {
        self.validator
            .validate(path)
            .map_err(|e| FileManagerError::InvalidPath(e.to_string()))
    }

    /// Confirm `folder` is writable, creating it when missing.
    ///
    /// Object-store roots have no local permissions to check.
    async fn ensure_writable(&self, folder: &str) -> Result<(), FileManagerError> {
        let Some(base) = self.validator.root().local_path() else {
            return Ok(());
        };
        let dir = if folder.is_empty() {
            base.to_path_buf()
        } else {
            base.join(folder)
        };

        match tokio::fs::metadata(&dir).await {
            Ok(metadata) if !metadata.is_dir() => Err(FileManagerError::PermissionDenied(format!(
                "{} is not a folder",
                display_folder(folder)
            ))),
            Ok(metadata) if metadata.permissions().readonly() => Err(
                FileManagerError::PermissionDenied(display_folder(folder).to_string()),
            ),
            Ok(_) => Ok(()),
            Err(_) => {
                debug!("Creating missing folder {}", display_folder(folder));
                tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                    FileManagerError::PermissionDenied(format!("{}: {}", display_folder(folder), e))
                })
            }
        }
    }

    /// Size ceiling first, then the MIME allow-list
    fn validate_file(&self, file: &UploadedFile) -> Result<(), FileManagerError> {
        if file.size() > self.config.max_file_size {
            info!(
                "Rejected {} ({}): over the size limit",
                file.original_name,
                format_bytes(file.size())
            );
            return Err(FileManagerError::FileTooLarge(format_bytes(
                self.config.max_file_size,
            )));
        }
        if !self.config.is_allowed_mime_type(&file.mime_type) {
            info!("Rejected {}: MIME type {} not allowed", file.original_name, file.mime_type);
            return Err(FileManagerError::InvalidMimeType(
                self.config.allowed_mime_types.join(", "),
            ));
        }
        Ok(())
    }

    fn check_quota(&self, byte_count: u64) -> Result<(), FileManagerError> {
        if self.quota.can_add_file(byte_count) {
            return Ok(());
        }
        let max = format_bytes(self.quota.max_quota().max(0) as u64);
        warn!("Quota of {} exceeded by a {} write", max, format_bytes(byte_count));
        Err(FileManagerError::QuotaExceeded(max))
    }

    /// Create a folder. Returns `None` when it already exists.
    pub async fn create_folder(&self, relative_path: &str) -> Result<Option<String>, FileManagerError> {
        let relative = self.validate(relative_path)?;
        if relative.is_empty() {
            return Ok(None);
        }

        let (parent, _) = split_parent(&relative);
        self.ensure_writable(parent).await?;

        self.backend
            .create_folder(&relative)
            .await
            .map_err(|e| backend_failure(e, FileManagerError::InvalidOperation))
    }

    /// Upload `file` into `sub_folder`, returning the stored relative path.
    ///
    /// `image_options` overrides the configured image processing for this call.
    pub async fn upload_file(
        &self,
        file: &UploadedFile,
        sub_folder: &str,
        image_options: Option<ImageOptions>,
    ) -> Result<String, FileManagerError> {
        let folder = self.validate(sub_folder)?;
        self.validate_file(file)?;
        self.check_quota(file.size())?;
        self.ensure_writable(&folder).await?;

        let options = image_options.unwrap_or_else(|| self.config.image_processing.options());
        self.backend
            .upload(file, &folder, &options)
            .await
            .map_err(|e| backend_failure(e, FileManagerError::UploadFailed))
    }

    /// Rename within the same folder, returning the new relative path.
    pub async fn rename_file(&self, relative_path: &str, new_name: &str) -> Result<String, FileManagerError> {
        let relative = self.validate(relative_path)?;
        if relative.is_empty() {
            return Err(FileManagerError::InvalidOperation(
                "Cannot rename the storage root".to_string(),
            ));
        }
        if new_name.contains('/') {
            return Err(FileManagerError::InvalidPath(format!(
                "New name must not contain '/': {}",
                new_name
            )));
        }
        self.validate(new_name)?;

        let (parent, _) = split_parent(&relative);
        self.ensure_writable(parent).await?;

        self.backend
            .rename(&relative, new_name)
            .await
            .map_err(|e| backend_failure(e, FileManagerError::RenameFailed))
    }

    /// Move into `destination`, returning the new relative path.
    pub async fn move_file(&self, relative_path: &str, destination: &str) -> Result<String, FileManagerError> {
        let relative = self.validate(relative_path)?;
        let destination = self.validate(destination)?;
        if relative.is_empty() {
            return Err(FileManagerError::InvalidOperation(
                "Cannot move the storage root".to_string(),
            ));
        }

        let (parent, _) = split_parent(&relative);
        self.ensure_writable(parent).await?;
        self.ensure_writable(&destination).await?;

        self.backend
            .move_to(&relative, &destination)
            .await
            .map_err(|e| backend_failure(e, FileManagerError::MoveFailed))
    }

    /// Delete a regular file.
    pub async fn delete_file(&self, relative_path: &str) -> Result<bool, FileManagerError> {
        let relative = self.validate(relative_path)?;
        if relative.is_empty() {
            return Err(FileManagerError::InvalidOperation(
                "Cannot delete the storage root".to_string(),
            ));
        }

        match self.validator.root().local_path() {
            Some(base) => self.check_local_deletable(base, &relative).await?,
            None => self.check_object_deletable(&relative).await?,
        }

        self.backend
            .delete(&relative)
            .await
            .map_err(|e| backend_failure(e, FileManagerError::DeleteFailed))
    }

    async fn check_local_deletable(&self, base: &Path, relative: &str) -> Result<(), FileManagerError> {
        let full = base.join(relative);
        let metadata = tokio::fs::symlink_metadata(&full)
            .await
            .map_err(|_| FileManagerError::FileNotFound(relative.to_string()))?;
        if !metadata.file_type().is_file() {
            return Err(FileManagerError::InvalidOperation(format!(
                "{} is not a regular file",
                relative
            )));
        }

        let parent = full.parent().unwrap_or(base);
        let parent_readonly = tokio::fs::metadata(parent)
            .await
            .map(|m| m.permissions().readonly())
            .unwrap_or(true);
        if metadata.permissions().readonly() || parent_readonly {
            return Err(FileManagerError::PermissionDenied(relative.to_string()));
        }
        Ok(())
    }

    async fn check_object_deletable(&self, relative: &str) -> Result<(), FileManagerError> {
        let (parent, name) = split_parent(relative);
        let entries = self
            .backend
            .list_files(parent)
            .await
            .map_err(|e| backend_failure(e, FileManagerError::DeleteFailed))?;

        match entries.iter().find(|entry| entry.name == name) {
            Some(entry) if entry.is_directory => Err(FileManagerError::InvalidOperation(format!(
                "{} is not a regular file",
                relative
            ))),
            Some(_) => Ok(()),
            None => Err(FileManagerError::FileNotFound(relative.to_string())),
        }
    }

    /// List one folder level, directories first.
    pub async fn list_files(&self, sub_folder: &str) -> Result<Vec<FileEntry>, FileManagerError> {
        let folder = self.validate(sub_folder)?;
        self.backend
            .list_files(&folder)
            .await
            .map_err(|e| backend_failure(e, FileManagerError::InvalidOperation))
    }

    /// Recursive folder tree below `sub_folder`.
    pub async fn list_directory_tree(&self, sub_folder: &str) -> Result<Vec<DirectoryTreeNode>, FileManagerError> {
        let folder = self.validate(sub_folder)?;
        self.backend
            .list_directory_tree(&folder)
            .await
            .map_err(|e| backend_failure(e, FileManagerError::InvalidOperation))
    }

    /// Read a file. Returns `None` when it does not exist.
    pub async fn download(&self, relative_path: &str) -> Result<Option<Vec<u8>>, FileManagerError> {
        let relative = self.validate(relative_path)?;
        self.backend
            .download(&relative)
            .await
            .map_err(|e| backend_failure(e, FileManagerError::InvalidOperation))
    }

    /// Crop an image into a new `<stem>_cropped.<ext>` file next to it.
    ///
    /// The source is left untouched. Returns the relative path of the cropped file.
    pub async fn crop_image(
        &self,
        relative_path: &str,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<String, FileManagerError> {
        let relative = self.validate(relative_path)?;
        let (folder, name) = split_parent(&relative);
        if name.is_empty() {
            return Err(FileManagerError::InvalidOperation(
                "Cannot crop the storage root".to_string(),
            ));
        }

        let bytes = self
            .backend
            .download(&relative)
            .await
            .map_err(|e| backend_failure(e, FileManagerError::InvalidOperation))?
            .ok_or_else(|| FileManagerError::FileNotFound(relative.clone()))?;

        let cropped_name = with_suffix(name, "cropped");
        let content = {
            let pipeline = self.pipeline.clone();
            let source_name = name.to_string();
            let output_name = cropped_name.clone();
            let label = relative.clone();
            run_blocking(move || -> Result<Vec<u8>, FileManagerError> {
                let scratch = tempfile::TempDir::new().map_err(|e| {
                    FileManagerError::InvalidOperation(format!(
                        "Failed to create scratch directory: {}",
                        e
                    ))
                })?;
                let source = scratch.path().join(&source_name);
                let output = scratch.path().join(&output_name);

                std::fs::write(&source, &bytes).map_err(|e| {
                    FileManagerError::InvalidOperation(format!("Failed to stage {}: {}", label, e))
                })?;
                pipeline
                    .try_crop(&source, x, y, width, height, &output)
                    .map_err(|e| {
                        FileManagerError::InvalidOperation(format!("Cannot crop {}: {}", label, e))
                    })?;
                std::fs::read(&output).map_err(|e| {
                    FileManagerError::InvalidOperation(format!("Failed to read cropped image: {}", e))
                })
            })
            .await
            .map_err(|e| backend_failure(e, FileManagerError::InvalidOperation))??
        };

        self.check_quota(content.len() as u64)?;
        self.ensure_writable(folder).await?;

        let mime_type = detect_format(&content)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream");
        let file = UploadedFile::new(cropped_name, mime_type, content);

        let stored = self
            .backend
            .upload(&file, folder, &ImageOptions::passthrough())
            .await
            .map_err(|e| backend_failure(e, FileManagerError::UploadFailed))?;

        info!("Cropped {} into {}", relative, stored);
        Ok(stored)
    }
}
