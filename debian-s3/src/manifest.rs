// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Per-architecture package indices.

A [Manifest] is the `Packages` index of a single
`(codename, component, architecture)` triple. It is retrieved from the store at
the start of an operation, mutated in memory, then published once.
*/

use {
    crate::{
        control::ControlParagraphReader,
        error::{DebS3Error, Result},
        io::{by_hash_path, gzip_compress, ChecksumType, FileChecksums, MultiContentDigest},
        package::Package,
        publish::PublishEvent,
        store::{
            ObjectStore, StoreOptions, StoreOutcome, CONTENT_TYPE_DEB, CONTENT_TYPE_GZIP,
            CONTENT_TYPE_TEXT,
        },
    },
    log::{debug, warn},
    std::collections::BTreeMap,
};

#[derive(Clone, Debug)]
struct ManifestEntry {
    package: Package,
    needs_upload: bool,
}

/// The package index of a single architecture of a component.
#[derive(Clone, Debug)]
pub struct Manifest {
    pub codename: String,
    pub component: String,
    pub architecture: String,
    pub cache_control: Option<String>,
    pub fail_if_exists: bool,
    pub skip_package_upload: bool,

    /// Published artifacts, keyed by path relative to `dists/{codename}`.
    pub files: BTreeMap<String, FileChecksums>,

    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Construct an empty manifest.
    pub fn new(
        codename: impl ToString,
        component: impl ToString,
        architecture: impl ToString,
    ) -> Self {
        Self {
            codename: codename.to_string(),
            component: component.to_string(),
            architecture: architecture.to_string(),
            cache_control: None,
            fail_if_exists: false,
            skip_package_upload: false,
            files: BTreeMap::new(),
            entries: vec![],
        }
    }

    /// Read the published index for an architecture.
    ///
    /// A missing index yields an empty manifest.
    pub async fn retrieve(
        store: &dyn ObjectStore,
        codename: &str,
        component: &str,
        architecture: &str,
        cache_control: Option<&str>,
        fail_if_exists: bool,
        skip_package_upload: bool,
    ) -> Result<Self> {
        let mut manifest = Self::new(codename, component, architecture);

        if let Some(data) = store.read(&manifest.index_path("Packages")).await? {
            manifest.parse_packages(&String::from_utf8_lossy(&data));
        }

        manifest.cache_control = cache_control.map(|x| x.to_string());
        manifest.fail_if_exists = fail_if_exists;
        manifest.skip_package_upload = skip_package_upload;

        Ok(manifest)
    }

    /// Append the stanzas of `Packages` index text.
    ///
    /// Stanzas that fail to parse are logged and skipped.
    ///
    /// Stanzas end at any blank line, including whitespace-only lines and lines
    /// ending in `\r\n`.
    pub fn parse_packages(&mut self, s: &str) {
        let reader = ControlParagraphReader::new(std::io::Cursor::new(s.as_bytes()));

        for paragraph in reader {
            match paragraph.and_then(Package::from_paragraph) {
                Ok(package) => self.entries.push(ManifestEntry {
                    package,
                    needs_upload: false,
                }),
                Err(e) => warn!(
                    "skipping unparseable stanza in {}: {}",
                    self.index_path("Packages"),
                    e
                ),
            }
        }
    }

    /// Path of the directory holding this manifest's index files.
    pub fn base_path(&self) -> String {
        format!(
            "dists/{}/{}/binary-{}",
            self.codename, self.component, self.architecture
        )
    }

    /// Repository path of an index file of this manifest.
    pub fn index_path(&self, filename: &str) -> String {
        format!("{}/{}", self.base_path(), filename)
    }

    /// Path of an index file relative to the `Release` file.
    pub fn release_path(&self, filename: &str) -> String {
        format!("{}/binary-{}/{}", self.component, self.architecture, filename)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Packages in publish order.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.entries.iter().map(|e| &e.package)
    }

    /// Packages whose file has yet to be uploaded to the pool.
    pub fn pending_packages(&self) -> impl Iterator<Item = &Package> {
        self.entries
            .iter()
            .filter(|e| e.needs_upload)
            .map(|e| &e.package)
    }

    /// Add a package, replacing existing entries for it.
    ///
    /// With `preserve_versions`, only an entry with the same name and version is
    /// replaced. Otherwise every version of the package is replaced.
    pub fn add(
        &mut self,
        mut package: Package,
        preserve_versions: bool,
        needs_uploading: bool,
    ) -> Result<&Package> {
        let codename = self.codename.clone();
        let codename = Some(codename.as_str());
        let full_version = package.full_version();

        if self.fail_if_exists {
            let filename = package.url_filename(codename);

            if let Some(existing) = self.packages().find(|p| {
                p.name == package.name
                    && p.full_version() == full_version
                    && basename(&p.url_filename(codename)) != basename(&filename)
            }) {
                return Err(DebS3Error::AlreadyExists(format!(
                    "package {}_{} already exists with different filename ({})",
                    package.name,
                    full_version.unwrap_or_default(),
                    existing.url_filename(codename)
                )));
            }
        }

        self.entries.retain(|e| {
            if preserve_versions {
                !(e.package.name == package.name && e.package.full_version() == full_version)
            } else {
                e.package.name != package.name
            }
        });

        package.pin_url_filename(codename);
        self.entries.push(ManifestEntry {
            package,
            needs_upload: needs_uploading,
        });

        Ok(&self.entries[self.entries.len() - 1].package)
    }

    /// Remove versions of a named package.
    ///
    /// Without `versions`, every version is removed. Otherwise packages are removed
    /// if any of the given strings matches their version per
    /// [Package::matches_version()]. Returns the removed packages.
    pub fn delete_package(&mut self, name: &str, versions: Option<&[String]>) -> Vec<Package> {
        self.remove_packages(|p| {
            p.name == name
                && match versions {
                    Some(versions) => versions.iter().any(|v| p.matches_version(v)),
                    None => true,
                }
        })
    }

    /// Remove every package matching a predicate, returning the removed packages.
    pub fn remove_packages(&mut self, mut predicate: impl FnMut(&Package) -> bool) -> Vec<Package> {
        let (removed, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition::<Vec<_>, _>(|e| predicate(&e.package));

        self.entries = kept;

        removed.into_iter().map(|e| e.package).collect()
    }

    /// Render the `Packages` index text.
    pub fn generate(&self) -> String {
        self.packages()
            .map(|p| p.generate(Some(&self.codename)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Upload pending package files and publish the index files.
    ///
    /// Checksums of published index files are recorded in [Self::files].
    pub async fn write_to_store<F>(
        &mut self,
        store: &dyn ObjectStore,
        by_hash: bool,
        progress_cb: &Option<F>,
    ) -> Result<()>
    where
        F: Fn(PublishEvent),
    {
        if !self.skip_package_upload {
            for package in self.pending_packages() {
                let path = package.url_filename(Some(&self.codename));

                let local_path = package
                    .local_path
                    .as_ref()
                    .ok_or_else(|| DebS3Error::PackageFileMissing(package.safe_name()))?;
                let data = tokio::fs::read(local_path).await.map_err(|e| {
                    DebS3Error::RepositoryIoPath(format!("{}", local_path.display()), e)
                })?;

                if let Some(cb) = progress_cb {
                    cb(PublishEvent::PoolArtifactUploading(path.clone()));
                }

                let outcome = store
                    .store(
                        &path,
                        &data,
                        &StoreOptions::new(CONTENT_TYPE_DEB)
                            .cache_control(self.cache_control.as_deref())
                            .fail_if_exists(self.fail_if_exists),
                    )
                    .await?;

                if let Some(cb) = progress_cb {
                    cb(match outcome {
                        StoreOutcome::Unchanged => PublishEvent::PoolArtifactCurrent(path),
                        StoreOutcome::Created | StoreOutcome::Replaced => {
                            PublishEvent::PoolArtifactCreated(path, data.len())
                        }
                    });
                }
            }
        }

        for entry in self.entries.iter_mut() {
            entry.needs_upload = false;
        }

        let text = self.generate();
        let compressed = gzip_compress(text.as_bytes())?;

        self.publish_index(store, "Packages", text.as_bytes(), CONTENT_TYPE_TEXT, by_hash, progress_cb)
            .await?;
        self.publish_index(store, "Packages.gz", &compressed, CONTENT_TYPE_GZIP, by_hash, progress_cb)
            .await?;

        Ok(())
    }

    async fn publish_index<F>(
        &mut self,
        store: &dyn ObjectStore,
        filename: &str,
        data: &[u8],
        content_type: &str,
        by_hash: bool,
        progress_cb: &Option<F>,
    ) -> Result<()>
    where
        F: Fn(PublishEvent),
    {
        let path = self.index_path(filename);
        let checksums = MultiContentDigest::from_slice(data).file_checksums();
        let options = StoreOptions::new(content_type).cache_control(self.cache_control.as_deref());

        if let Some(cb) = progress_cb {
            cb(PublishEvent::IndexFileToWrite(path.clone()));
        }

        store.store(&path, data, &options).await?;

        if by_hash {
            for checksum in ChecksumType::release_order() {
                if let Some(digest) = checksums.digest_hex(checksum) {
                    let hashed = by_hash_path(&path, checksum, digest);
                    debug!("publishing {} as {}", path, hashed);
                    store.store(&hashed, data, &options).await?;
                }
            }
        }

        if let Some(cb) = progress_cb {
            cb(PublishEvent::IndexFileWritten(path, checksums.size));
        }

        self.files.insert(self.release_path(filename), checksums);

        Ok(())
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
