//! Storage backend abstraction
//!
//! Defines the StorageBackend trait and its implementations:
//! - LocalStorageBackend: a directory on the local filesystem
//! - ObjectStorageBackend: an object store (S3, or the in-memory store used in tests)
//!
//! Both implementations honor the same contract. Folders in object stores are
//! simulated with zero-byte marker objects whose key ends with `/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{FileManagerConfig, StorageType};
use crate::imaging::{ImageDerivativePipeline, ImageOptions, ImageProcessingError};
use crate::naming::{NamingError, split_name};
use crate::resolver::{DefaultUploadPathResolver, UploadPathResolver};
use crate::validation::{PathError, StorageRoot};

pub mod local;
pub mod object;
#[cfg(feature = "s3")]
pub mod s3;

pub use local::LocalStorageBackend;
pub use object::{MemoryObjectStore, ObjectListing, ObjectStorageBackend, ObjectStore, ObjectSummary};

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Naming error: {0}")]
    Naming(#[from] NamingError),
    #[error("Image processing error: {0}")]
    Image(#[from] ImageProcessingError),
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// A file handed over by the caller for storage
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Name as supplied by the client (sanitized before storage)
    pub original_name: String,
    /// MIME type as reported by the client
    pub mime_type: String,
    /// File content
    pub content: Vec<u8>,
}

impl UploadedFile {
    /// Create an uploaded file
    pub fn new(
        original_name: impl Into<String>,
        mime_type: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            original_name: original_name.into(),
            mime_type: mime_type.into(),
            content: content.into(),
        }
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    /// Whether the client declared an image MIME type
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Simplified type tag shown in listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Video,
    Audio,
    Pdf,
    File,
}

impl FileKind {
    /// Classify a MIME type
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            FileKind::Image
        } else if mime_type.starts_with("video/") {
            FileKind::Video
        } else if mime_type.starts_with("audio/") {
            FileKind::Audio
        } else if mime_type.starts_with("application/pdf") {
            FileKind::Pdf
        } else {
            FileKind::File
        }
    }

    /// Classify a file by its extension
    pub fn from_file_name(name: &str) -> Self {
        let extension = match split_name(name) {
            (_, Some(ext)) => ext.to_ascii_lowercase(),
            (_, None) => return FileKind::File,
        };
        match extension.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "svg" | "bmp" | "ico" | "tif" | "tiff"
            | "avif" => FileKind::Image,
            "mp4" | "webm" | "mov" | "avi" | "mkv" | "ogv" | "m4v" => FileKind::Video,
            "mp3" | "wav" | "ogg" | "oga" | "flac" | "m4a" | "aac" => FileKind::Audio,
            "pdf" => FileKind::Pdf,
            _ => FileKind::File,
        }
    }
}

/// A listing record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Name without its extension (files only)
    pub name_without_ext: Option<String>,
    pub is_directory: bool,
    /// Size in bytes (files only)
    pub size: Option<u64>,
    /// Simplified type tag (files only)
    #[serde(rename = "type")]
    pub kind: Option<FileKind>,
    /// Extension (files only)
    pub extension: Option<String>,
    pub last_modified: DateTime<Utc>,
    /// Path relative to the storage root
    pub relative_path: String,
    /// Backend-specific public access path
    pub public_path: String,
}

impl FileEntry {
    /// Entry for a directory
    pub fn directory(
        name: &str,
        relative_path: String,
        public_path: String,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.to_string(),
            name_without_ext: None,
            is_directory: true,
            size: None,
            kind: None,
            extension: None,
            last_modified,
            relative_path,
            public_path,
        }
    }

    /// Entry for a regular file
    pub fn file(
        name: &str,
        size: u64,
        relative_path: String,
        public_path: String,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let (stem, extension) = split_name(name);
        Self {
            name: name.to_string(),
            name_without_ext: Some(stem.to_string()),
            is_directory: false,
            size: Some(size),
            kind: Some(FileKind::from_file_name(name)),
            extension: extension.map(str::to_string),
            last_modified,
            relative_path,
            public_path,
        }
    }

    /// Whether the entry is an image file
    pub fn is_image(&self) -> bool {
        self.kind == Some(FileKind::Image)
    }
}

/// Directories before files, keeping the relative order within each group.
pub fn sort_directories_first(entries: &mut [FileEntry]) {
    entries.sort_by_key(|entry| !entry.is_directory);
}

/// Node type in a directory tree (only folders appear)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Dir,
}

/// A folder and its sub-folders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryTreeNode {
    pub name: String,
    /// Path relative to the storage root
    pub path: String,
    #[serde(rename = "type", default)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DirectoryTreeNode>,
}

impl DirectoryTreeNode {
    /// Create a folder node
    pub fn new(name: impl Into<String>, path: impl Into<String>, children: Vec<DirectoryTreeNode>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: NodeKind::Dir,
            children,
        }
    }
}

/// Join a parent relative path and a child name
pub fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Split a relative path into parent and last segment
pub fn split_parent(relative_path: &str) -> (&str, &str) {
    match relative_path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", relative_path),
    }
}

/// Run blocking filesystem or codec work on tokio's blocking pool
pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T, StorageError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| StorageError::IoError(format!("Blocking task failed: {}", e)))
}

/// Trait for storage backends
///
/// All paths are relative to the backend's storage root and have been
/// normalized (no leading or trailing slash; the empty string is the root).
#[async_trait(?Send)]
pub trait StorageBackend: Send + Sync {
    /// Create a folder and its missing ancestors.
    ///
    /// Returns `None` when the folder already exists.
    async fn create_folder(&self, relative_path: &str) -> Result<Option<String>, StorageError>;

    /// Store `file` under `sub_folder` with a collision-free name.
    ///
    /// Image files are run through the derivative pipeline when
    /// `image_options.compression_enabled` is set. Returns the stored relative path.
    async fn upload(
        &self,
        file: &UploadedFile,
        sub_folder: &str,
        image_options: &ImageOptions,
    ) -> Result<String, StorageError>;

    /// Rename within the same folder, never overwriting. Returns the new relative path.
    async fn rename(&self, relative_path: &str, new_name: &str) -> Result<String, StorageError>;

    /// Move into `destination` (created if absent). Fails if the name is taken there.
    async fn move_to(&self, relative_path: &str, destination: &str) -> Result<String, StorageError>;

    /// Delete a file, or a folder recursively.
    async fn delete(&self, relative_path: &str) -> Result<bool, StorageError>;

    /// Read a file. Returns `None` when it does not exist.
    async fn download(&self, relative_path: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// List one folder level, directories first. A missing folder lists as empty.
    async fn list_files(&self, sub_folder: &str) -> Result<Vec<FileEntry>, StorageError>;

    /// Recursive folder tree below `sub_folder`.
    async fn list_directory_tree(&self, sub_folder: &str) -> Result<Vec<DirectoryTreeNode>, StorageError>;
}

/// Build the backend selected by `config`, together with the root it is bound to.
///
/// A local root is created when it does not exist yet.
pub async fn build_backend(
    config: &FileManagerConfig,
) -> Result<(Box<dyn StorageBackend>, StorageRoot), StorageError> {
    let pipeline = ImageDerivativePipeline::new(&config.image_processing);

    match config.storage.storage_type {
        StorageType::Local => {
            let resolver = DefaultUploadPathResolver::new(&config.storage.local.path, &config.upload_folder);
            let root = resolver.upload_path().to_path_buf();
            tokio::fs::create_dir_all(&root).await.map_err(|e| {
                StorageError::IoError(format!(
                    "Failed to create storage root {}: {}",
                    root.display(),
                    e
                ))
            })?;

            let folder = config.upload_folder.trim_matches('/');
            let public_prefix = if folder.is_empty() {
                config.storage.local.public_prefix.clone()
            } else {
                format!("{}/{}", config.storage.local.public_prefix.trim_end_matches('/'), folder)
            };

            let backend = LocalStorageBackend::new(&root, public_prefix).with_pipeline(pipeline);
            Ok((Box::new(backend), StorageRoot::Local(root)))
        }
        #[cfg(feature = "s3")]
        StorageType::S3 => {
            let store = s3::S3ObjectStore::new(&config.storage.s3).await?;
            let backend = ObjectStorageBackend::new(store, &config.storage.s3.path).with_pipeline(pipeline);
            let root = backend.storage_root();
            Ok((Box::new(backend), root))
        }
        #[cfg(not(feature = "s3"))]
        StorageType::S3 => Err(StorageError::InvalidOperation(
            "S3 storage requires the `s3` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_classification() {
        assert_eq!(FileKind::from_mime("image/png"), FileKind::Image);
        assert_eq!(FileKind::from_mime("application/pdf"), FileKind::Pdf);
        assert_eq!(FileKind::from_mime("text/plain"), FileKind::File);
        assert_eq!(FileKind::from_file_name("Movie.MP4"), FileKind::Video);
        assert_eq!(FileKind::from_file_name("song.flac"), FileKind::Audio);
        assert_eq!(FileKind::from_file_name("Makefile"), FileKind::File);
    }

    #[test]
    fn test_directories_sort_first_stably() {
        let now = Utc::now();
        let mut entries = vec![
            FileEntry::file("b.txt", 1, "b.txt".into(), "/b.txt".into(), now),
            FileEntry::directory("z", "z".into(), "/z".into(), now),
            FileEntry::file("a.txt", 1, "a.txt".into(), "/a.txt".into(), now),
            FileEntry::directory("m", "m".into(), "/m".into(), now),
        ];
        sort_directories_first(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["z", "m", "b.txt", "a.txt"]);
    }

    #[test]
    fn test_tree_node_omits_empty_children() {
        let leaf = DirectoryTreeNode::new("b", "a/b", vec![]);
        let json = serde_json::to_value(&leaf).unwrap();
        assert_eq!(json, serde_json::json!({"name": "b", "path": "a/b", "type": "dir"}));

        let parent = DirectoryTreeNode::new("a", "a", vec![leaf]);
        let json = serde_json::to_value(&parent).unwrap();
        assert_eq!(json["children"][0]["path"], "a/b");
    }

    #[test]
    fn test_file_entry_serializes_camel_case() {
        let entry = FileEntry::file("cat.jpg", 42, "pets/cat.jpg".into(), "/cdn/pets/cat.jpg".into(), Utc::now());
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["nameWithoutExt"], "cat");
        assert_eq!(json["isDirectory"], false);
        assert_eq!(json["type"], "image");
        assert_eq!(json["relativePath"], "pets/cat.jpg");
    }

    #[test]
    fn test_build_local_backend_creates_root() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = FileManagerConfig::local(temp.path());
        config.upload_folder = "tenant".to_string();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (_backend, root) = rt.block_on(build_backend(&config)).unwrap();

        assert_eq!(root, StorageRoot::Local(temp.path().join("tenant")));
        assert!(temp.path().join("tenant").is_dir());
    }

    #[test]
    fn test_relative_helpers() {
        assert_eq!(join_relative("", "a"), "a");
        assert_eq!(join_relative("a/b", "c"), "a/b/c");
        assert_eq!(split_parent("a/b/c.png"), ("a/b", "c.png"));
        assert_eq!(split_parent("c.png"), ("", "c.png"));
    }
}
