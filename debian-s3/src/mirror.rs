// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Sources of packages to mirror into a repository.

A [PackageSource] discovers the packages of an upstream distribution, grouped
by component and architecture, with each package file available locally.
[HttpMirror] is the implementation for repositories served over HTTP.
*/

use {
    crate::{error::Result, package::Package},
    async_trait::async_trait,
};

#[cfg(feature = "http")]
use {
    crate::{
        config::RetryPolicy,
        error::DebS3Error,
        manifest::Manifest,
        package::DigestPolicy,
        release::Release,
    },
    log::{debug, info, warn},
    reqwest::{Client, IntoUrl, StatusCode, Url},
    std::path::{Component, Path, PathBuf},
};

/// Packages of one component and architecture of an upstream distribution.
#[derive(Clone, Debug)]
pub struct DiscoveredPackages {
    pub component: String,
    pub architecture: String,
    /// Packages with `local_path` pointing at a local copy of their file.
    pub packages: Vec<Package>,
}

/// Provides packages to mirror.
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// Discover all packages of a distribution.
    async fn discover(&self, codename: &str) -> Result<Vec<DiscoveredPackages>>;
}

/// A [PackageSource] reading an upstream repository over HTTP.
///
/// Package files are downloaded into a cache directory, at their upstream
/// `Filename` relative to it. Files already present in the cache are reused if
/// their checksums agree with the upstream index.
#[cfg(feature = "http")]
#[derive(Debug)]
pub struct HttpMirror {
    client: Client,
    root_url: Url,
    cache_dir: PathBuf,
    retry: RetryPolicy,
}

#[cfg(feature = "http")]
impl HttpMirror {
    /// Construct an instance bound to a repository URL and cache directory.
    ///
    /// The URL is the one that follows `deb` in apt sources files.
    pub fn new(url: impl IntoUrl, cache_dir: impl AsRef<Path>) -> Result<Self> {
        Self::new_client(Client::default(), url, cache_dir)
    }

    /// Construct an instance using the given [Client].
    pub fn new_client(client: Client, url: impl IntoUrl, cache_dir: impl AsRef<Path>) -> Result<Self> {
        let mut root_url = url.into_url()?;

        // Url::join() drops the last path segment without a trailing slash.
        if !root_url.path().ends_with('/') {
            root_url.set_path(&format!("{}/", root_url.path()));
        }

        Ok(Self {
            client,
            root_url,
            cache_dir: cache_dir.as_ref().to_path_buf(),
            retry: RetryPolicy::default(),
        })
    }

    /// Set the retry behavior of HTTP requests.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// The base URL of the upstream repository.
    pub fn url(&self) -> &Url {
        &self.root_url
    }

    async fn fetch_once(&self, url: Url) -> std::result::Result<Vec<u8>, (bool, String)> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| (true, format!("error sending HTTP request: {:?}", e)))?;

        let status = res.status();
        if !status.is_success() {
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err((retryable, format!("bad HTTP status code: {}", status)));
        }

        res.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| (true, format!("error reading HTTP response: {:?}", e)))
    }

    /// Fetch a path relative to the repository root.
    pub async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.root_url.join(path.trim_start_matches('/'))?;
        let mut attempt = 1;

        loop {
            debug!("fetching {}", url);

            match self.fetch_once(url.clone()).await {
                Ok(data) => return Ok(data),
                Err((retryable, message)) => {
                    if !retryable || !self.retry.should_retry(attempt) {
                        return Err(DebS3Error::RepositoryIoPath(
                            path.to_string(),
                            std::io::Error::new(std::io::ErrorKind::Other, message),
                        ));
                    }

                    warn!("fetching {} failed ({}); retrying", url, message);
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Fetch and parse the `Release` file of a distribution.
    pub async fn fetch_release(&self, codename: &str) -> Result<Release> {
        let data = self
            .fetch(&format!("dists/{}/Release", codename))
            .await?;

        Release::parse_release(&String::from_utf8_lossy(&data))
    }

    /// Fetch and parse a `Packages` index.
    pub async fn fetch_packages(
        &self,
        codename: &str,
        component: &str,
        architecture: &str,
    ) -> Result<Vec<Package>> {
        let mut manifest = Manifest::new(codename, component, architecture);
        let data = self.fetch(&manifest.index_path("Packages")).await?;
        manifest.parse_packages(&String::from_utf8_lossy(&data));

        debug!(
            "located {} packages in {}/{} {}",
            manifest.len(),
            codename,
            component,
            architecture
        );

        Ok(manifest.packages().cloned().collect())
    }

    /// Local path a repository file is cached at.
    pub fn cache_path(&self, filename: &str) -> Result<PathBuf> {
        let relative = Path::new(filename.trim_start_matches('/'));

        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(DebS3Error::Other(format!(
                "refusing to cache package at unsafe path {}",
                filename
            )));
        }

        Ok(self.cache_dir.join(relative))
    }

    /// Ensure a package file is cached and matches the upstream checksums.
    ///
    /// On a checksum mismatch the cached copy is discarded and downloaded again
    /// once, trusting whatever the second download contains. On success the
    /// package points at the cached file and forgets its upstream `Filename`.
    pub async fn cache_package(&self, package: &mut Package) -> Result<()> {
        let filename = package.url_filename(None);
        let path = self.cache_path(&filename)?;
        let mut retried = false;

        loop {
            if tokio::fs::metadata(&path).await.is_err() {
                info!("downloading {}", filename);
                let data = self.fetch(&filename).await?;

                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, &data)
                    .await
                    .map_err(|e| DebS3Error::RepositoryIoPath(format!("{}", path.display()), e))?;
            }

            package.local_path = Some(path.clone());

            match package.check_digest(DigestPolicy::Strict) {
                Ok(_) => break,
                Err(DebS3Error::DigestMismatch { field, .. }) if !retried => {
                    warn!(
                        "{} of {} does not match upstream; downloading again",
                        field, filename
                    );
                    tokio::fs::remove_file(&path).await?;
                    package.clear_digests();
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }

        package.reset_url_filename();

        Ok(())
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl PackageSource for HttpMirror {
    async fn discover(&self, codename: &str) -> Result<Vec<DiscoveredPackages>> {
        let release = self.fetch_release(codename).await?;
        info!(
            "upstream {} has components {} and architectures {}",
            codename,
            release.components.join(" "),
            release.architectures.join(" ")
        );

        // Upstreams commonly publish binary-all without listing it.
        let mut architectures = release.architectures.clone();
        let implicit_all = !architectures.iter().any(|a| a == "all");
        if implicit_all {
            architectures.push("all".to_string());
        }

        let mut groups = vec![];

        for component in &release.components {
            for arch in &architectures {
                let packages = match self.fetch_packages(codename, component, arch).await {
                    Ok(packages) => packages,
                    Err(e) if implicit_all && arch == "all" => {
                        debug!("no {} index for all: {}", component, e);
                        continue;
                    }
                    Err(e) => {
                        warn!("skipping {} {}: {}", component, arch, e);
                        continue;
                    }
                };

                let mut cached = Vec::with_capacity(packages.len());
                for mut package in packages {
                    self.cache_package(&mut package).await?;
                    cached.push(package);
                }

                groups.push(DiscoveredPackages {
                    component: component.clone(),
                    architecture: arch.clone(),
                    packages: cached,
                });
            }
        }

        Ok(groups)
    }
}
