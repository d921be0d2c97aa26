// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repository publishing operations.

[Publisher] implements the operations that mutate a repository. Each one takes
the repository lock (when configured), retrieves the `Release` file and the
manifests it needs, mutates them in memory, publishes manifests before the
`Release` file referencing them, and finally releases the lock. The lock is
released on every exit path.
*/

use {
    crate::{
        config::RepositoryConfig,
        error::{DebS3Error, Result},
        lock::{Lock, LockTarget, ObjectStoreLock, RepositoryLock},
        manifest::Manifest,
        mirror::PackageSource,
        package::Package,
        release::Release,
        signing::ReleaseSigner,
        store::ObjectStore,
    },
    log::{error, info, warn},
    std::collections::{btree_map::Entry, BTreeMap},
};

/// Describes an event during publishing.
#[derive(Clone, Debug)]
pub enum PublishEvent {
    /// A package file is about to be uploaded to the given pool path.
    PoolArtifactUploading(String),

    /// A pool artifact with the given path already had the desired content.
    PoolArtifactCurrent(String),

    /// A pool artifact with the given path and size was written.
    PoolArtifactCreated(String, usize),

    /// The path to an index file to write.
    IndexFileToWrite(String),

    /// An index file that was written.
    IndexFileWritten(String, u64),
}

impl std::fmt::Display for PublishEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoolArtifactUploading(path) => {
                write!(f, "uploading {}", path)
            }
            Self::PoolArtifactCurrent(path) => {
                write!(f, "pool path {} is current", path)
            }
            Self::PoolArtifactCreated(path, size) => {
                write!(f, "wrote {} bytes to {}", size, path)
            }
            Self::IndexFileToWrite(path) => {
                write!(f, "index file {} will be written", path)
            }
            Self::IndexFileWritten(path, size) => {
                write!(f, "wrote {} bytes to {}", size, path)
            }
        }
    }
}

/// A package along with the architecture whose index holds it.
pub type ArchitecturePackage = (String, Package);

/// Performs publishing operations against a repository.
pub struct Publisher<'a> {
    store: &'a dyn ObjectStore,
    config: &'a RepositoryConfig,
    signer: Option<&'a dyn ReleaseSigner>,
}

impl<'a> Publisher<'a> {
    pub fn new(store: &'a dyn ObjectStore, config: &'a RepositoryConfig) -> Self {
        Self {
            store,
            config,
            signer: None,
        }
    }

    /// Sign `Release` files with the given signer.
    pub fn signer(mut self, signer: Option<&'a dyn ReleaseSigner>) -> Self {
        self.signer = signer;
        self
    }

    /// The lock protecting the configured component.
    pub fn lock_target(&self, architecture: Option<&str>) -> LockTarget {
        LockTarget::new(&self.config.codename)
            .component(Some(self.config.component.as_str()))
            .architecture(architecture)
            .cache_control(self.config.cache_control.as_deref())
    }

    async fn begin(&self, target: &LockTarget) -> Result<bool> {
        if !self.config.lock {
            return Ok(false);
        }

        let lock = ObjectStoreLock::new(self.store);

        info!("checking for existing lock file");
        if lock.locked(target).await? {
            if let Ok(current) = lock.current(target).await {
                info!(
                    "repository is locked by another user: {} at host {}",
                    current.user, current.host
                );
            }
        }

        info!("locking repository for updates");
        lock.acquire(target, &self.config.lock_wait).await?;

        Ok(true)
    }

    async fn finish<T>(&self, target: &LockTarget, locked: bool, res: Result<T>) -> Result<T> {
        if locked {
            match ObjectStoreLock::new(self.store).unlock(target).await {
                Ok(()) => info!("lock released"),
                Err(e) if res.is_ok() => return Err(e),
                Err(e) => error!("error releasing lock {}: {}", target.path(), e),
            }
        }

        res
    }

    async fn retrieve_release(&self) -> Result<Release> {
        let mut release = Release::retrieve(
            self.store,
            &self.config.codename,
            self.config.origin.as_deref(),
            self.config.suite.as_deref(),
            self.config.cache_control.as_deref(),
        )
        .await?;
        release.by_hash = self.config.by_hash;

        Ok(release)
    }

    async fn retrieve_manifest(&self, architecture: &str, fail_if_exists: bool) -> Result<Manifest> {
        Manifest::retrieve(
            self.store,
            &self.config.codename,
            &self.config.component,
            architecture,
            self.config.cache_control.as_deref(),
            fail_if_exists,
            self.config.skip_package_upload,
        )
        .await
    }

    async fn retrieve_manifests(&self, release: &Release) -> Result<BTreeMap<String, Manifest>> {
        let mut manifests = BTreeMap::new();

        for arch in &release.architectures {
            manifests.insert(
                arch.clone(),
                self.retrieve_manifest(arch, self.config.fail_if_exists)
                    .await?,
            );
        }

        Ok(manifests)
    }

    /// Add packages to their architecture's manifest, then fan `all` packages out.
    async fn add_to_manifests(
        &self,
        manifests: &mut BTreeMap<String, Manifest>,
        entries: Vec<ArchitecturePackage>,
    ) -> Result<Vec<ArchitecturePackage>> {
        let preserve_versions = self.config.preserve_versions;
        let mut added = vec![];
        let mut all_packages = vec![];

        for (arch, package) in entries {
            if arch == "all" && manifests.is_empty() {
                if self.config.placeholder_architectures.is_empty() {
                    return Err(DebS3Error::ArchitectureAllWithoutManifests);
                }

                for placeholder in &self.config.placeholder_architectures {
                    manifests.insert(
                        placeholder.clone(),
                        self.retrieve_manifest(placeholder, self.config.fail_if_exists)
                            .await?,
                    );
                }
            }

            let manifest = match manifests.entry(arch.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(
                    self.retrieve_manifest(&arch, self.config.fail_if_exists)
                        .await?,
                ),
            };

            let package = manifest.add(package, preserve_versions, true)?.clone();
            info!(
                "adding {} version {} to arch {}",
                package.name,
                package.full_version().unwrap_or_default(),
                arch
            );

            if arch == "all" {
                all_packages.push(package.clone());
            }
            added.push((arch, package));
        }

        for (arch, manifest) in manifests.iter_mut() {
            if arch == "all" {
                continue;
            }

            for package in &all_packages {
                manifest.add(package.clone(), preserve_versions, false)?;
            }
        }

        Ok(added)
    }

    async fn publish_release<F>(&self, release: &mut Release, progress_cb: &Option<F>) -> Result<()>
    where
        F: Fn(PublishEvent),
    {
        release
            .ensure_placeholder_manifests(self.store, &[], progress_cb)
            .await?;
        release
            .write_to_store(self.store, self.signer, progress_cb)
            .await
    }

    async fn publish<F>(
        &self,
        release: &mut Release,
        manifests: &mut BTreeMap<String, Manifest>,
        progress_cb: &Option<F>,
    ) -> Result<()>
    where
        F: Fn(PublishEvent),
    {
        info!("uploading packages and new manifests");
        for manifest in manifests.values_mut() {
            manifest
                .write_to_store(self.store, self.config.by_hash, progress_cb)
                .await?;
            release.update_manifest(manifest);
        }

        self.publish_release(release, progress_cb).await
    }

    /// Add packages to the repository.
    ///
    /// Packages are indexed under `architecture` if given and under their own
    /// architecture otherwise. Returns the added packages.
    pub async fn upload<F>(
        &self,
        packages: Vec<Package>,
        architecture: Option<&str>,
        progress_cb: &Option<F>,
    ) -> Result<Vec<ArchitecturePackage>>
    where
        F: Fn(PublishEvent),
    {
        let target = self.lock_target(architecture);
        let locked = self.begin(&target).await?;
        let res = self.upload_locked(packages, architecture, progress_cb).await;

        self.finish(&target, locked, res).await
    }

    async fn upload_locked<F>(
        &self,
        packages: Vec<Package>,
        architecture: Option<&str>,
        progress_cb: &Option<F>,
    ) -> Result<Vec<ArchitecturePackage>>
    where
        F: Fn(PublishEvent),
    {
        info!("retrieving existing manifests");
        let mut release = self.retrieve_release().await?;
        let mut manifests = self.retrieve_manifests(&release).await?;

        let mut entries = vec![];
        for package in packages {
            let arch = match (architecture, package.architecture.as_deref()) {
                (Some(arch), package_arch) => {
                    if package_arch != Some(arch) {
                        warn!(
                            "architecture {} was requested but package {} has architecture {}",
                            arch,
                            package.name,
                            package_arch.unwrap_or_default()
                        );
                    }
                    arch.to_string()
                }
                (None, Some(arch)) => arch.to_string(),
                (None, None) => {
                    return Err(DebS3Error::Other(format!(
                        "unable to determine architecture of package {}; specify one explicitly",
                        package.name
                    )))
                }
            };

            entries.push((arch, package));
        }

        let added = self.add_to_manifests(&mut manifests, entries).await?;
        self.publish(&mut release, &mut manifests, progress_cb)
            .await?;

        Ok(added)
    }

    /// Remove versions of a package from an architecture's index.
    ///
    /// `all` removes from every known architecture. Nothing is published when no
    /// package matched. Returns the removed packages.
    pub async fn delete<F>(
        &self,
        name: &str,
        versions: Option<&[String]>,
        architecture: &str,
        progress_cb: &Option<F>,
    ) -> Result<Vec<ArchitecturePackage>>
    where
        F: Fn(PublishEvent),
    {
        let target = self.lock_target(Some(architecture));
        let locked = self.begin(&target).await?;
        let res = self
            .delete_locked(name, versions, architecture, progress_cb)
            .await;

        self.finish(&target, locked, res).await
    }

    async fn delete_locked<F>(
        &self,
        name: &str,
        versions: Option<&[String]>,
        architecture: &str,
        progress_cb: &Option<F>,
    ) -> Result<Vec<ArchitecturePackage>>
    where
        F: Fn(PublishEvent),
    {
        let mut release = self.retrieve_release().await?;

        let architectures = if architecture == "all" {
            release.architectures.clone()
        } else {
            vec![architecture.to_string()]
        };

        let mut removed = vec![];

        for arch in architectures {
            let mut manifest = self.retrieve_manifest(&arch, false).await?;

            let deleted = manifest.delete_package(name, versions);
            if deleted.is_empty() {
                info!("{} not found in arch {}", name, arch);
                continue;
            }

            for package in &deleted {
                info!(
                    "deleting {} version {} from arch {}",
                    package.name,
                    package.full_version().unwrap_or_default(),
                    arch
                );
            }

            manifest
                .write_to_store(self.store, self.config.by_hash, progress_cb)
                .await?;
            release.update_manifest(&manifest);

            removed.extend(deleted.into_iter().map(|p| (arch.clone(), p)));
        }

        if removed.is_empty() {
            match versions {
                Some(versions) => warn!(
                    "no packages were deleted; {} versions {} could not be found",
                    name,
                    versions.join(", ")
                ),
                None => warn!("no packages were deleted; {} not found", name),
            }
        } else {
            self.publish_release(&mut release, progress_cb).await?;
        }

        Ok(removed)
    }

    /// Find indexed packages whose pool file is missing.
    ///
    /// With `fix`, missing packages are removed from their index.
    pub async fn verify<F>(&self, fix: bool, progress_cb: &Option<F>) -> Result<Vec<ArchitecturePackage>>
    where
        F: Fn(PublishEvent),
    {
        let target = self.lock_target(None);
        let locked = if fix { self.begin(&target).await? } else { false };
        let res = self.verify_locked(fix, progress_cb).await;

        self.finish(&target, locked, res).await
    }

    async fn verify_locked<F>(&self, fix: bool, progress_cb: &Option<F>) -> Result<Vec<ArchitecturePackage>>
    where
        F: Fn(PublishEvent),
    {
        let mut release = self.retrieve_release().await?;
        let mut changed = false;
        let mut all_missing = vec![];

        for arch in release.architectures.clone() {
            info!(
                "checking for missing packages in {}/{} {}",
                self.config.codename, self.config.component, arch
            );

            let mut manifest = self.retrieve_manifest(&arch, false).await?;

            let mut missing = vec![];
            for package in manifest.packages() {
                let path = package.url_filename(Some(&self.config.codename));

                if self.store.exists(&path).await?.is_none() {
                    warn!("{} is missing {}", package.name, path);
                    missing.push(package.clone());
                }
            }

            if fix && !missing.is_empty() {
                info!("removing {} package(s) from the manifest", missing.len());
                manifest.remove_packages(|p| missing.contains(p));
                manifest
                    .write_to_store(self.store, self.config.by_hash, progress_cb)
                    .await?;
                release.update_manifest(&manifest);
                changed = true;
            }

            all_missing.extend(missing.into_iter().map(|p| (arch.clone(), p)));
        }

        if changed {
            self.publish_release(&mut release, progress_cb).await?;
        }

        Ok(all_missing)
    }

    /// List indexed packages, optionally limited to one architecture.
    pub async fn list(&self, architecture: Option<&str>) -> Result<Vec<ArchitecturePackage>> {
        let release = self.retrieve_release().await?;
        let mut rows = vec![];

        for arch in &release.architectures {
            if let Some(wanted) = architecture {
                if wanted != "all" && wanted != arch {
                    continue;
                }
            }

            let manifest = self.retrieve_manifest(arch, false).await?;
            rows.extend(manifest.packages().map(|p| (arch.clone(), p.clone())));
        }

        Ok(rows)
    }

    /// Add every package of an upstream repository's codename.
    ///
    /// Packages of all upstream components land in the configured component.
    pub async fn mirror<S, F>(
        &self,
        source: &S,
        progress_cb: &Option<F>,
    ) -> Result<Vec<ArchitecturePackage>>
    where
        S: PackageSource + ?Sized,
        F: Fn(PublishEvent),
    {
        let target = self.lock_target(None);
        let locked = self.begin(&target).await?;
        let res = self.mirror_locked(source, progress_cb).await;

        self.finish(&target, locked, res).await
    }

    async fn mirror_locked<S, F>(
        &self,
        source: &S,
        progress_cb: &Option<F>,
    ) -> Result<Vec<ArchitecturePackage>>
    where
        S: PackageSource + ?Sized,
        F: Fn(PublishEvent),
    {
        info!("retrieving existing manifests");
        let mut release = self.retrieve_release().await?;
        let mut manifests = self.retrieve_manifests(&release).await?;

        info!("crawling upstream repository");
        let entries = source
            .discover(&self.config.codename)
            .await?
            .into_iter()
            .flat_map(|group| {
                let arch = group.architecture;
                group
                    .packages
                    .into_iter()
                    .map(move |p| (arch.clone(), p))
            })
            .collect::<Vec<_>>();

        if entries.is_empty() {
            warn!("no packages found upstream for {}", self.config.codename);
        }

        let added = self.add_to_manifests(&mut manifests, entries).await?;
        self.publish(&mut release, &mut manifests, progress_cb)
            .await?;

        Ok(added)
    }

    /// Forcibly remove the lock of the configured component.
    ///
    /// Returns the holder of the removed lock, if any.
    pub async fn unlock(&self, architecture: Option<&str>) -> Result<Option<Lock>> {
        let target = self.lock_target(architecture);
        let lock = ObjectStoreLock::new(self.store);

        let current = match lock.current(&target).await {
            Ok(current) => Some(current),
            Err(DebS3Error::LockNotHeld) => None,
            Err(e) => return Err(e),
        };

        lock.unlock(&target).await?;

        Ok(current)
    }
}
