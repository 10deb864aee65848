//! Object store storage backend
//!
//! Maps the folder-oriented [`StorageBackend`] contract onto a flat key space:
//! - every relative path becomes `<prefix>/<relative path>`
//! - folders are zero-byte marker objects whose key ends with `/`
//! - listings use `/` as delimiter, so sub-folders show up as common prefixes
//! - rename and move are copy-then-delete
//!
//! The store itself sits behind the [`ObjectStore`] trait. [`MemoryObjectStore`]
//! keeps everything in memory; the S3 adapter lives in the `s3` module.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{
    DirectoryTreeNode, FileEntry, StorageBackend, StorageError, UploadedFile, join_relative,
    run_blocking, sort_directories_first, split_parent,
};
use crate::imaging::{DerivativeRole, ImageDerivativePipeline, ImageOptions};
use crate::naming::{UniqueNameResolver, sanitize_file_name};
use crate::validation::{PathValidator, StorageRoot};

/// Content type of folder marker objects
pub const FOLDER_CONTENT_TYPE: &str = "application/x-directory";

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Result of a prefix listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectListing {
    /// Objects directly matched by the listing
    pub objects: Vec<ObjectSummary>,
    /// Key prefixes rolled up at the delimiter (ending with the delimiter)
    pub common_prefixes: Vec<String>,
}

impl ObjectListing {
    /// True when nothing matched
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.common_prefixes.is_empty()
    }
}

/// Minimal key/value object store operations
#[async_trait(?Send)]
pub trait ObjectStore: Send + Sync {
    /// Bucket name
    fn bucket(&self) -> &str;

    /// Publicly reachable URL of `key`
    fn public_url(&self, key: &str) -> String;

    /// Store `body` under `key`, replacing any previous object
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// Object content, or `None` when the key does not exist
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Object metadata, or `None` when the key does not exist
    async fn head_object(&self, key: &str) -> Result<Option<ObjectSummary>, StorageError>;

    /// Delete `key`. Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    /// Server-side copy of `from` to `to`
    async fn copy_object(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// All objects under `prefix`, rolled up at `delimiter` when given.
    /// Results are ordered by key.
    async fn list_objects(&self, prefix: &str, delimiter: Option<char>) -> Result<ObjectListing, StorageError>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
    last_modified: DateTime<Utc>,
}

/// In-memory [`ObjectStore`]
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    /// Create an empty store for `bucket`
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>>, StorageError> {
        self.objects
            .lock()
            .map_err(|_| StorageError::BackendError("object map lock poisoned".to_string()))
    }

    /// All keys currently stored
    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Content type recorded for `key`
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.lock()
            .ok()
            .and_then(|objects| objects.get(key).map(|o| o.content_type.clone()))
    }
}

#[async_trait(?Send)]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{}/{}", self.bucket, key)
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        self.lock()?.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock()?.get(key).map(|o| o.body.clone()))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectSummary>, StorageError> {
        Ok(self.lock()?.get(key).map(|o| ObjectSummary {
            key: key.to_string(),
            size: o.body.len() as u64,
            last_modified: o.last_modified,
        }))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut objects = self.lock()?;
        let object = objects
            .get(from)
            .cloned()
            .ok_or_else(|| StorageError::FileNotFound(from.to_string()))?;
        objects.insert(
            to.to_string(),
            StoredObject {
                last_modified: Utc::now(),
                ..object
            },
        );
        Ok(())
    }

    async fn list_objects(&self, prefix: &str, delimiter: Option<char>) -> Result<ObjectListing, StorageError> {
        let objects = self.lock()?;
        let mut listing = ObjectListing::default();

        for (key, object) in objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            let rest = &key[prefix.len()..];
            if let Some(delimiter) = delimiter
                && let Some(index) = rest.find(delimiter)
            {
                let common = format!("{}{}", prefix, &rest[..=index]);
                if listing.common_prefixes.last() != Some(&common) {
                    listing.common_prefixes.push(common);
                }
                continue;
            }
            listing.objects.push(ObjectSummary {
                key: key.clone(),
                size: object.body.len() as u64,
                last_modified: object.last_modified,
            });
        }

        Ok(listing)
    }
}

/// Storage backend on top of an [`ObjectStore`]
pub struct ObjectStorageBackend<S: ObjectStore> {
    store: S,
    prefix: String,
    validator: PathValidator,
    names: UniqueNameResolver,
    pipeline: ImageDerivativePipeline,
}

impl<S: ObjectStore> ObjectStorageBackend<S> {
    /// Create a backend storing everything below `prefix` in `store`
    pub fn new(store: S, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/').to_string();
        let validator = PathValidator::new(StorageRoot::Object {
            bucket: store.bucket().to_string(),
            prefix: prefix.clone(),
        });
        Self {
            store,
            prefix,
            validator,
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

    /// The underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Root this backend is bound to
    pub fn storage_root(&self) -> StorageRoot {
        self.validator.root().clone()
    }

    /// Object key of `relative_path`
    pub fn key_for(&self, relative_path: &str) -> String {
        match (self.prefix.is_empty(), relative_path.is_empty()) {
            (true, _) => relative_path.to_string(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, relative_path),
        }
    }

    /// Listing prefix of a folder (its marker key)
    pub fn folder_prefix(&self, relative_path: &str) -> String {
        let key = self.key_for(relative_path);
        if key.is_empty() { key } else { format!("{}/", key) }
    }

    fn relative_of<'k>(&self, key: &'k str, folder_prefix: &str) -> Option<&'k str> {
        key.strip_prefix(folder_prefix)
            .map(|rest| rest.trim_end_matches('/'))
            .filter(|rest| !rest.is_empty())
    }

    async fn file_exists(&self, relative_path: &str) -> Result<bool, StorageError> {
        if relative_path.is_empty() {
            return Ok(false);
        }
        Ok(self.store.head_object(&self.key_for(relative_path)).await?.is_some())
    }

    async fn folder_exists(&self, relative_path: &str) -> Result<bool, StorageError> {
        if relative_path.is_empty() {
            return Ok(true);
        }
        let listing = self
            .store
            .list_objects(&self.folder_prefix(relative_path), Some('/'))
            .await?;
        Ok(!listing.is_empty())
    }

    /// Names of files and folders directly inside a folder
    async fn names_in(&self, folder_relative: &str) -> Result<HashSet<String>, StorageError> {
        let prefix = self.folder_prefix(folder_relative);
        let listing = self.store.list_objects(&prefix, Some('/')).await?;

        let keys = listing
            .objects
            .iter()
            .map(|o| o.key.as_str())
            .chain(listing.common_prefixes.iter().map(String::as_str));
        Ok(keys
            .filter_map(|key| self.relative_of(key, &prefix))
            .map(str::to_string)
            .collect())
    }

    /// Copy every object below `from` to `to`, then delete the originals.
    async fn move_folder(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from_prefix = self.folder_prefix(from);
        let to_prefix = self.folder_prefix(to);
        let listing = self.store.list_objects(&from_prefix, None).await?;

        for object in &listing.objects {
            let suffix = &object.key[from_prefix.len()..];
            self.store
                .copy_object(&object.key, &format!("{}{}", to_prefix, suffix))
                .await?;
        }
        for object in &listing.objects {
            self.store.delete_object(&object.key).await?;
        }

        debug!("Moved {} object(s) from {} to {}", listing.objects.len(), from_prefix, to_prefix);
        Ok(())
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from_key = self.key_for(from);
        self.store.copy_object(&from_key, &self.key_for(to)).await?;
        self.store.delete_object(&from_key).await
    }

    /// Store `file` verbatim, or as its derivative set when processing applies.
    ///
    /// Derivative siblings whose names are in `taken` are skipped so existing
    /// objects are never overwritten.
    async fn put_upload(
        &self,
        file: &UploadedFile,
        folder_relative: &str,
        name: &str,
        taken: &HashSet<String>,
        image_options: &ImageOptions,
    ) -> Result<(), StorageError> {
        if file.is_image() && image_options.compression_enabled {
            match self.process_image(file, name, image_options).await {
                Ok(derivatives) => {
                    for (role, derivative_name, content_type, body) in derivatives {
                        if role != DerivativeRole::Main && taken.contains(&derivative_name) {
                            warn!(
                                "Skipping {:?} derivative, {} already exists",
                                role,
                                join_relative(folder_relative, &derivative_name)
                            );
                            continue;
                        }
                        let key = self.key_for(&join_relative(folder_relative, &derivative_name));
                        self.store.put_object(&key, body, &content_type).await?;
                    }
                    return Ok(());
                }
                Err(e) => warn!("Image processing failed for {}: {}", name, e),
            }
        }

        let key = self.key_for(&join_relative(folder_relative, name));
        self.store
            .put_object(&key, file.content.clone(), &file.mime_type)
            .await
    }

    /// Run the pipeline in a scratch directory and collect the produced files.
    async fn process_image(
        &self,
        file: &UploadedFile,
        name: &str,
        image_options: &ImageOptions,
    ) -> Result<Vec<(DerivativeRole, String, String, Vec<u8>)>, StorageError> {
        let pipeline = self.pipeline.clone();
        let content = file.content.clone();
        let mime_type = file.mime_type.clone();
        let name = name.to_string();
        let options = *image_options;

        run_blocking(move || -> Result<Vec<_>, StorageError> {
            let scratch = tempfile::TempDir::new().map_err(|e| {
                StorageError::IoError(format!("Failed to create scratch directory: {}", e))
            })?;
            let path = scratch.path().join(&name);
            std::fs::write(&path, &content)
                .map_err(|e| StorageError::IoError(format!("Failed to write {}: {}", name, e)))?;

            let set = pipeline.process(&path, &path, &options)?;

            let mut derivatives = Vec::with_capacity(set.len());
            for (role, produced) in set.iter() {
                let Some(produced_name) = produced.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let content_type = match role {
                    DerivativeRole::Webp => "image/webp".to_string(),
                    DerivativeRole::Main | DerivativeRole::Original => mime_type.clone(),
                };
                let body = std::fs::read(produced).map_err(|e| {
                    StorageError::IoError(format!("Failed to read {}: {}", produced_name, e))
                })?;
                derivatives.push((role, produced_name.to_string(), content_type, body));
            }
            Ok(derivatives)
        })
        .await?
    }
}

/// Build folder nodes whose parent is `parent` from a set of folder paths.
fn tree_from_folders(folders: &BTreeSet<String>, parent: &str, base: &str) -> Vec<DirectoryTreeNode> {
    folders
        .iter()
        .filter(|folder| split_parent(folder).0 == parent)
        .map(|folder| {
            let (_, name) = split_parent(folder);
            DirectoryTreeNode::new(
                name,
                join_relative(base, folder),
                tree_from_folders(folders, folder, base),
            )
        })
        .collect()
}

#[async_trait(?Send)]
impl<S: ObjectStore> StorageBackend for ObjectStorageBackend<S> {
    async fn create_folder(&self, relative_path: &str) -> Result<Option<String>, StorageError> {
        let relative = self.validator.validate(relative_path)?;

        if self.folder_exists(&relative).await? {
            debug!("Folder {} already exists", relative);
            return Ok(None);
        }
        if self.file_exists(&relative).await? {
            return Err(StorageError::AlreadyExists(relative));
        }

        self.store
            .put_object(&self.folder_prefix(&relative), Vec::new(), FOLDER_CONTENT_TYPE)
            .await?;

        info!("Created folder {}", relative);
        Ok(Some(relative))
    }

    async fn upload(
        &self,
        file: &UploadedFile,
        sub_folder: &str,
        image_options: &ImageOptions,
    ) -> Result<String, StorageError> {
        let folder_relative = self.validator.validate(sub_folder)?;

        let taken = self.names_in(&folder_relative).await?;
        let name = self
            .names
            .resolve_with(&file.original_name, |candidate| taken.contains(candidate))?;

        self.put_upload(file, &folder_relative, &name, &taken, image_options)
            .await?;

        let relative = join_relative(&folder_relative, &name);
        info!("Uploaded {} ({} bytes)", relative, file.size());
        Ok(relative)
    }

    async fn rename(&self, relative_path: &str, new_name: &str) -> Result<String, StorageError> {
        let relative = self.validator.validate(relative_path)?;
        if relative.is_empty() {
            return Err(StorageError::InvalidOperation(
                "Cannot rename the storage root".to_string(),
            ));
        }

        let is_file = self.file_exists(&relative).await?;
        if !is_file && !self.folder_exists(&relative).await? {
            return Err(StorageError::FileNotFound(relative));
        }

        let (parent, current_name) = split_parent(&relative);
        let sanitized = sanitize_file_name(new_name)?;
        if sanitized == current_name {
            return Ok(relative);
        }

        let taken = self.names_in(parent).await?;
        let unique = self
            .names
            .resolve_with(&sanitized, |candidate| taken.contains(candidate))?;
        let renamed = join_relative(parent, &unique);

        if is_file {
            self.move_file(&relative, &renamed).await?;
        } else {
            self.move_folder(&relative, &renamed).await?;
        }

        info!("Renamed {} to {}", relative, renamed);
        Ok(renamed)
    }

    async fn move_to(&self, relative_path: &str, destination: &str) -> Result<String, StorageError> {
        let relative = self.validator.validate(relative_path)?;
        let destination_relative = self.validator.validate(destination)?;
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

        let is_file = self.file_exists(&relative).await?;
        if !is_file && !self.folder_exists(&relative).await? {
            return Err(StorageError::FileNotFound(relative));
        }

        let (_, name) = split_parent(&relative);
        let moved = join_relative(&destination_relative, name);
        if self.file_exists(&moved).await? || self.folder_exists(&moved).await? {
            return Err(StorageError::AlreadyExists(moved));
        }

        if !self.folder_exists(&destination_relative).await? {
            self.store
                .put_object(
                    &self.folder_prefix(&destination_relative),
                    Vec::new(),
                    FOLDER_CONTENT_TYPE,
                )
                .await?;
        }

        if is_file {
            self.move_file(&relative, &moved).await?;
        } else {
            self.move_folder(&relative, &moved).await?;
        }

        info!("Moved {} to {}", relative, moved);
        Ok(moved)
    }

    async fn delete(&self, relative_path: &str) -> Result<bool, StorageError> {
        let relative = self.validator.validate(relative_path)?;
        if relative.is_empty() {
            return Err(StorageError::InvalidOperation(
                "Cannot delete the storage root".to_string(),
            ));
        }

        if self.file_exists(&relative).await? {
            self.store.delete_object(&self.key_for(&relative)).await?;
        } else if self.folder_exists(&relative).await? {
            let listing = self
                .store
                .list_objects(&self.folder_prefix(&relative), None)
                .await?;
            for object in &listing.objects {
                self.store.delete_object(&object.key).await?;
            }
        } else {
            return Err(StorageError::FileNotFound(relative));
        }

        info!("Deleted {}", relative);
        Ok(true)
    }

    async fn download(&self, relative_path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let relative = self.validator.validate(relative_path)?;
        if relative.is_empty() {
            return Ok(None);
        }
        self.store.get_object(&self.key_for(&relative)).await
    }

    async fn list_files(&self, sub_folder: &str) -> Result<Vec<FileEntry>, StorageError> {
        let folder_relative = self.validator.validate(sub_folder)?;
        let prefix = self.folder_prefix(&folder_relative);
        let listing = self.store.list_objects(&prefix, Some('/')).await?;

        let mut entries = Vec::new();
        for common in &listing.common_prefixes {
            let Some(name) = self.relative_of(common, &prefix) else {
                continue;
            };
            let last_modified = self
                .store
                .head_object(common)
                .await?
                .map(|marker| marker.last_modified)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            entries.push(FileEntry::directory(
                name,
                join_relative(&folder_relative, name),
                self.store.public_url(common),
                last_modified,
            ));
        }

        for object in &listing.objects {
            // The folder's own marker
            if object.key.ends_with('/') {
                continue;
            }
            let Some(name) = self.relative_of(&object.key, &prefix) else {
                continue;
            };
            entries.push(FileEntry::file(
                name,
                object.size,
                join_relative(&folder_relative, name),
                self.store.public_url(&object.key),
                object.last_modified,
            ));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        sort_directories_first(&mut entries);
        Ok(entries)
    }

    async fn list_directory_tree(&self, sub_folder: &str) -> Result<Vec<DirectoryTreeNode>, StorageError> {
        let folder_relative = self.validator.validate(sub_folder)?;
        let prefix = self.folder_prefix(&folder_relative);
        let listing = self.store.list_objects(&prefix, None).await?;

        // Every key contributes all of its ancestor folders
        let mut folders = BTreeSet::new();
        for object in &listing.objects {
            let rest = &object.key[prefix.len()..];
            let mut segments: Vec<&str> = rest.split('/').collect();
            segments.pop();
            for depth in 1..=segments.len() {
                let folder = segments[..depth].join("/");
                if !folder.is_empty() {
                    folders.insert(folder);
                }
            }
        }

        Ok(tree_from_folders(&folders, "", &folder_relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_key_mapping() {
        let backend = ObjectStorageBackend::new(MemoryObjectStore::new("bucket"), "/uploads/");
        assert_eq!(backend.key_for(""), "uploads");
        assert_eq!(backend.key_for("a/b.png"), "uploads/a/b.png");
        assert_eq!(backend.folder_prefix(""), "uploads/");
        assert_eq!(backend.folder_prefix("a"), "uploads/a/");

        let bare = ObjectStorageBackend::new(MemoryObjectStore::new("bucket"), "");
        assert_eq!(bare.key_for("a/b.png"), "a/b.png");
        assert_eq!(bare.folder_prefix(""), "");
    }

    #[test]
    fn test_memory_listing_rolls_up_at_delimiter() {
        let rt = runtime();
        let store = MemoryObjectStore::new("bucket");
        rt.block_on(async {
            store.put_object("p/a.txt", b"1".to_vec(), "text/plain").await.unwrap();
            store.put_object("p/docs/", Vec::new(), FOLDER_CONTENT_TYPE).await.unwrap();
            store.put_object("p/docs/b.txt", b"22".to_vec(), "text/plain").await.unwrap();
            store.put_object("q/c.txt", b"3".to_vec(), "text/plain").await.unwrap();

            let listing = store.list_objects("p/", Some('/')).await.unwrap();
            assert_eq!(listing.common_prefixes, vec!["p/docs/".to_string()]);
            assert_eq!(listing.objects.len(), 1);
            assert_eq!(listing.objects[0].key, "p/a.txt");

            let all = store.list_objects("p/", None).await.unwrap();
            assert_eq!(all.objects.len(), 3);
            assert!(all.common_prefixes.is_empty());
        });
    }

    #[test]
    fn test_tree_from_folders() {
        let folders: BTreeSet<String> = ["a", "a/b", "a/b/c", "d"]
            .into_iter()
            .map(String::from)
            .collect();
        let tree = tree_from_folders(&folders, "", "root");
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].path, "root/a");
        assert_eq!(tree[0].children[0].children[0].path, "root/a/b/c");
        assert!(tree[1].children.is_empty());
    }
}
