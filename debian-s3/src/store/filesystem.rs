// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Filesystem backed object store. */

use {
    crate::{
        error::{DebS3Error, Result},
        io::MultiContentDigest,
        store::{ObjectMetadata, ObjectStore, PutOptions},
    },
    async_trait::async_trait,
    std::path::{Path, PathBuf},
};

/// An [ObjectStore] rooted at a local directory.
///
/// Objects are plain files. Content type and cache headers are not persisted
/// and the MD5 is computed from file content on demand.
#[derive(Clone, Debug)]
pub struct FilesystemObjectStore {
    root_dir: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root_dir: path.as_ref().to_path_buf(),
        }
    }

    /// The filesystem path an object is stored at.
    pub fn object_path(&self, path: &str) -> PathBuf {
        self.root_dir.join(path.trim_matches('/'))
    }
}

fn not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn head_object(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        match tokio::fs::read(self.object_path(path)).await {
            Ok(data) => {
                let md5 = MultiContentDigest::from_slice(&data).md5.digest_hex();

                Ok(Some(ObjectMetadata {
                    size: Some(data.len() as u64),
                    etag: None,
                    md5: Some(md5),
                    content_type: None,
                    cache_control: None,
                }))
            }
            Err(e) if not_found(&e) => Ok(None),
            Err(e) => Err(DebS3Error::RepositoryIoPath(path.to_string(), e)),
        }
    }

    async fn get_object(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.object_path(path)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if not_found(&e) => Ok(None),
            Err(e) => Err(DebS3Error::RepositoryIoPath(path.to_string(), e)),
        }
    }

    async fn put_object(&self, path: &str, content: &[u8], _options: &PutOptions<'_>) -> Result<()> {
        let dest_path = self.object_path(path);

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DebS3Error::RepositoryIoPath(format!("{}", parent.display()), e))?;
        }

        // Write to a sibling and rename into place.
        let temp_path = dest_path.with_file_name(format!(
            ".{}.tmp",
            dest_path
                .file_name()
                .map(|x| x.to_string_lossy().to_string())
                .unwrap_or_default()
        ));
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| DebS3Error::RepositoryIoPath(path.to_string(), e))?;
        tokio::fs::rename(&temp_path, &dest_path)
            .await
            .map_err(|e| DebS3Error::RepositoryIoPath(path.to_string(), e))?;

        Ok(())
    }

    async fn delete_object(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(DebS3Error::RepositoryIoPath(path.to_string(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store::{StoreOptions, StoreOutcome, CONTENT_TYPE_TEXT},
    };

    #[tokio::test]
    async fn round_trip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemObjectStore::new(td.path());

        assert!(store.exists("dists/stable/Release").await?.is_none());
        assert_eq!(
            store
                .store(
                    "dists/stable/Release",
                    b"Codename: stable\n",
                    &StoreOptions::new(CONTENT_TYPE_TEXT)
                )
                .await?,
            StoreOutcome::Created
        );
        assert!(td.path().join("dists/stable/Release").is_file());
        assert_eq!(
            store.read("dists/stable/Release").await?.as_deref(),
            Some(&b"Codename: stable\n"[..])
        );
        assert_eq!(
            store
                .store(
                    "dists/stable/Release",
                    b"Codename: stable\n",
                    &StoreOptions::new(CONTENT_TYPE_TEXT).fail_if_exists(true)
                )
                .await?,
            StoreOutcome::Unchanged
        );

        assert!(store.remove("dists/stable/Release").await?);
        assert!(store.read("dists/stable/Release").await?.is_none());
        store.delete_object("dists/stable/Release").await?;

        Ok(())
    }

    #[tokio::test]
    async fn md5_follows_file_content() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemObjectStore::new(td.path());

        store
            .store("a/b", b"hello", &StoreOptions::new(CONTENT_TYPE_TEXT))
            .await?;
        assert_eq!(
            store.exists("a/b").await?.and_then(|m| m.md5).as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
        assert_eq!(std::fs::read_dir(td.path().join("a"))?.count(), 1);

        std::fs::write(td.path().join("a/b"), b"world")?;
        assert_eq!(
            store.exists("a/b").await?.and_then(|m| m.md5).as_deref(),
            Some("7d793037a0760186574b0282f2f435e7")
        );

        Ok(())
    }
}
