// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Object storage backends.

Repositories are stored as objects addressed by repository relative paths
like `dists/stable/Release`. The [ObjectStore] trait defines the four
primitives a backend must provide and derives the higher level operations
used by the rest of the crate from them. Most importantly,
[ObjectStore::store()] refuses to silently replace an existing object with
different content when asked to.
*/

use {
    crate::{
        error::{DebS3Error, Result},
        io::MultiContentDigest,
    },
    async_trait::async_trait,
    log::{error, warn},
    std::{collections::BTreeMap, sync::Mutex},
};

pub mod filesystem;
#[cfg(feature = "s3")]
pub mod s3;

pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream; charset=binary";
pub const CONTENT_TYPE_DEB: &str = "application/x-debian-package";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
pub const CONTENT_TYPE_GZIP: &str = "application/x-gzip";
pub const CONTENT_TYPE_SIGNATURE: &str = "application/pgp-signature; charset=us-ascii";

/// Metadata about a stored object.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ObjectMetadata {
    pub size: Option<u64>,

    /// The entity tag, without surrounding quotes.
    pub etag: Option<String>,

    /// Hex MD5 of the content recorded when the object was stored.
    pub md5: Option<String>,

    pub content_type: Option<String>,

    pub cache_control: Option<String>,
}

impl ObjectMetadata {
    /// Whether the object is known to hold content with the given hex MD5.
    pub fn matches_md5(&self, md5: &str) -> bool {
        self.md5.as_deref() == Some(md5)
            || self
                .etag
                .as_deref()
                .map(|etag| etag.trim_matches('"') == md5)
                .unwrap_or(false)
    }
}

/// Headers to apply when putting an object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PutOptions<'a> {
    pub content_type: &'a str,
    pub cache_control: Option<&'a str>,
    /// Hex MD5 of the content, recorded as object metadata.
    pub md5: &'a str,
}

/// Options for [ObjectStore::store()].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreOptions<'a> {
    pub content_type: &'a str,
    pub cache_control: Option<&'a str>,
    /// Fail instead of replacing an existing object with different content.
    pub fail_if_exists: bool,
}

impl<'a> StoreOptions<'a> {
    pub fn new(content_type: &'a str) -> Self {
        Self {
            content_type,
            cache_control: None,
            fail_if_exists: false,
        }
    }

    pub fn cache_control(mut self, value: Option<&'a str>) -> Self {
        self.cache_control = value;
        self
    }

    pub fn fail_if_exists(mut self, value: bool) -> Self {
        self.fail_if_exists = value;
        self
    }
}

/// What [ObjectStore::store()] did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreOutcome {
    /// No object existed and one was written.
    Created,
    /// An object with identical content existed. Nothing was written.
    Unchanged,
    /// An object with different content was replaced.
    Replaced,
}

/// A key-value object store holding a repository.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Obtain metadata of an object, or [None] if it doesn't exist.
    async fn head_object(&self, path: &str) -> Result<Option<ObjectMetadata>>;

    /// Obtain the content of an object, or [None] if it doesn't exist.
    async fn get_object(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditionally write an object.
    async fn put_object(&self, path: &str, content: &[u8], options: &PutOptions<'_>) -> Result<()>;

    /// Delete an object.
    async fn delete_object(&self, path: &str) -> Result<()>;

    /// Obtain metadata of an object if it exists.
    async fn exists(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        self.head_object(path).await
    }

    /// Read the content of an object if it exists.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.get_object(path).await
    }

    /// Write an object unless it already holds the same content.
    ///
    /// An existing object with different content fails with
    /// [DebS3Error::AlreadyExists] if `fail_if_exists` is set and is replaced
    /// otherwise.
    async fn store(
        &self,
        path: &str,
        content: &[u8],
        options: &StoreOptions<'_>,
    ) -> Result<StoreOutcome> {
        let md5 = MultiContentDigest::from_slice(content).md5.digest_hex();

        let outcome = if let Some(existing) = self.exists(path).await? {
            if existing.matches_md5(&md5) {
                return Ok(StoreOutcome::Unchanged);
            }

            error!("file {} already exists with different contents", path);
            if options.fail_if_exists {
                return Err(DebS3Error::AlreadyExists(format!(
                    "file {} already exists with different contents",
                    path
                )));
            }

            StoreOutcome::Replaced
        } else {
            StoreOutcome::Created
        };

        self.put_object(
            path,
            content,
            &PutOptions {
                content_type: options.content_type,
                cache_control: options.cache_control,
                md5: &md5,
            },
        )
        .await?;

        Ok(outcome)
    }

    /// Delete an object if it exists.
    ///
    /// Returns whether an object was deleted.
    async fn remove(&self, path: &str) -> Result<bool> {
        if self.exists(path).await?.is_some() {
            self.delete_object(path).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// An object held by [MemoryObjectStore].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryObject {
    pub data: Vec<u8>,
    pub content_type: String,
    pub cache_control: Option<String>,
    pub md5: String,
}

/// An [ObjectStore] keeping objects in memory.
///
/// Every mutation is recorded, which makes this useful for testing.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, MemoryObject>>,
    operations: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    /// Obtain a copy of a stored object.
    pub fn object(&self, path: &str) -> Option<MemoryObject> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(path).cloned())
    }

    /// Paths of all stored objects, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Mutations performed so far, as `put <path>` and `delete <path>` entries.
    pub fn operations(&self) -> Vec<String> {
        self.operations
            .lock()
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }

    /// Store an object without recording the operation.
    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        let data = data.into();
        let md5 = MultiContentDigest::from_slice(&data).md5.digest_hex();

        self.objects_guard()?.insert(
            path.to_string(),
            MemoryObject {
                data,
                content_type: CONTENT_TYPE_BINARY.to_string(),
                cache_control: None,
                md5,
            },
        );

        Ok(())
    }

    fn objects_guard(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, MemoryObject>>> {
        self.objects
            .lock()
            .map_err(|_| DebS3Error::Other("memory store lock poisoned".to_string()))
    }

    fn record(&self, op: String) {
        match self.operations.lock() {
            Ok(mut ops) => ops.push(op),
            Err(_) => warn!("memory store operation log poisoned"),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head_object(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self.objects_guard()?.get(path).map(|o| ObjectMetadata {
            size: Some(o.data.len() as u64),
            etag: Some(o.md5.clone()),
            md5: Some(o.md5.clone()),
            content_type: Some(o.content_type.clone()),
            cache_control: o.cache_control.clone(),
        }))
    }

    async fn get_object(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects_guard()?.get(path).map(|o| o.data.clone()))
    }

    async fn put_object(&self, path: &str, content: &[u8], options: &PutOptions<'_>) -> Result<()> {
        self.objects_guard()?.insert(
            path.to_string(),
            MemoryObject {
                data: content.to_vec(),
                content_type: options.content_type.to_string(),
                cache_control: options.cache_control.map(|x| x.to_string()),
                md5: options.md5.to_string(),
            },
        );
        self.record(format!("put {}", path));

        Ok(())
    }

    async fn delete_object(&self, path: &str) -> Result<()> {
        self.objects_guard()?.remove(path);
        self.record(format!("delete {}", path));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_creates_and_skips_identical() -> Result<()> {
        let store = MemoryObjectStore::default();
        let options = StoreOptions::new(CONTENT_TYPE_TEXT).cache_control(Some("max-age=60"));

        assert_eq!(
            store.store("a/b", b"hello", &options).await?,
            StoreOutcome::Created
        );
        assert_eq!(
            store.store("a/b", b"hello", &options.clone().fail_if_exists(true)).await?,
            StoreOutcome::Unchanged
        );
        assert_eq!(store.operations(), vec!["put a/b"]);

        let object = store.object("a/b").unwrap();
        assert_eq!(object.content_type, CONTENT_TYPE_TEXT);
        assert_eq!(object.cache_control.as_deref(), Some("max-age=60"));
        assert_eq!(object.md5, "5d41402abc4b2a76b9719d911017c592");

        Ok(())
    }

    #[tokio::test]
    async fn store_conflicting_content() -> Result<()> {
        let store = MemoryObjectStore::default();
        store.insert("pool/f/fo/foo.deb", b"original".to_vec())?;

        let res = store
            .store(
                "pool/f/fo/foo.deb",
                b"different",
                &StoreOptions::new(CONTENT_TYPE_DEB).fail_if_exists(true),
            )
            .await;
        assert!(matches!(res, Err(DebS3Error::AlreadyExists(_))));
        assert_eq!(store.object("pool/f/fo/foo.deb").unwrap().data, b"original");

        assert_eq!(
            store
                .store("pool/f/fo/foo.deb", b"different", &StoreOptions::new(CONTENT_TYPE_DEB))
                .await?,
            StoreOutcome::Replaced
        );
        assert_eq!(store.object("pool/f/fo/foo.deb").unwrap().data, b"different");

        Ok(())
    }

    #[tokio::test]
    async fn remove_only_existing() -> Result<()> {
        let store = MemoryObjectStore::default();
        store.insert("x", b"1".to_vec())?;

        assert!(store.remove("x").await?);
        assert!(!store.remove("x").await?);
        assert_eq!(store.operations(), vec!["delete x"]);
        assert!(store.read("x").await?.is_none());

        Ok(())
    }

    #[test]
    fn etag_matching() {
        let metadata = ObjectMetadata {
            etag: Some("\"abc\"".into()),
            ..Default::default()
        };
        assert!(metadata.matches_md5("abc"));
        assert!(!metadata.matches_md5("abd"));
    }
}
