// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Release` files.

A [Release] describes a distribution: the components and architectures it
holds and the checksums of every index file published under
`dists/{codename}`. Apt clients verify downloaded indices against these
checksums, so the `Release` file must be published after every index it
references.
*/

use {
    crate::{
        control::ControlParagraph,
        error::{DebS3Error, Result},
        io::{ChecksumType, FileChecksums},
        manifest::Manifest,
        publish::PublishEvent,
        signing::ReleaseSigner,
        store::{ObjectStore, StoreOptions, CONTENT_TYPE_SIGNATURE, CONTENT_TYPE_TEXT},
    },
    chrono::{DateTime, Utc},
    log::{debug, info},
    std::collections::BTreeMap,
};

/// Formatter string for dates in release files.
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// A distribution's `Release` file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Release {
    pub codename: String,
    pub origin: Option<String>,
    pub suite: Option<String>,
    pub date: Option<DateTime<Utc>>,
    /// Known architectures, in first-seen order.
    pub architectures: Vec<String>,
    /// Known components, in first-seen order.
    pub components: Vec<String>,
    /// Checksums of index files, keyed by path relative to `dists/{codename}`.
    pub files: BTreeMap<String, FileChecksums>,
    pub cache_control: Option<String>,
    /// Whether `by-hash` copies of indices are published.
    pub by_hash: bool,
}

impl Release {
    /// Construct an empty release for a codename.
    pub fn new(codename: impl ToString) -> Self {
        Self {
            codename: codename.to_string(),
            origin: None,
            suite: None,
            date: None,
            architectures: vec![],
            components: vec![],
            files: BTreeMap::new(),
            cache_control: None,
            by_hash: false,
        }
    }

    /// Repository path of the `Release` file.
    pub fn path(&self) -> String {
        format!("dists/{}/Release", self.codename)
    }

    /// Read the published release of a codename, or start a fresh one.
    ///
    /// `origin` and `suite` override parsed values when given.
    pub async fn retrieve(
        store: &dyn ObjectStore,
        codename: &str,
        origin: Option<&str>,
        suite: Option<&str>,
        cache_control: Option<&str>,
    ) -> Result<Self> {
        let mut release = match store.read(&format!("dists/{}/Release", codename)).await? {
            Some(data) => Self::parse_release(&String::from_utf8_lossy(&data))?,
            None => {
                info!("no release found for {}; starting a new one", codename);
                Self::new(codename)
            }
        };

        release.codename = codename.to_string();
        if let Some(origin) = origin {
            release.origin = Some(origin.to_string());
        }
        if let Some(suite) = suite {
            release.suite = Some(suite.to_string());
        }
        release.cache_control = cache_control.map(|x| x.to_string());

        Ok(release)
    }

    /// Parse `Release` file content.
    pub fn parse_release(s: &str) -> Result<Self> {
        let paragraph = ControlParagraph::parse_str(s)?;
        let words = |name: &str| -> Vec<String> {
            paragraph
                .field_iter_value_words(name)
                .map(|words| words.map(|x| x.to_string()).collect())
                .unwrap_or_default()
        };

        let mut release = Self::new(paragraph.field_str("Codename").unwrap_or_default());
        release.origin = paragraph.field_str("Origin").map(|x| x.to_string());
        release.suite = paragraph.field_str("Suite").map(|x| x.to_string());
        release.architectures = words("Architectures");
        release.components = words("Components");
        release.by_hash = paragraph
            .field_str("Acquire-By-Hash")
            .map(|x| x.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        release.date = paragraph.field_str("Date").and_then(|date| {
            match DateTime::parse_from_str(date, DATE_FORMAT)
                .or_else(|_| DateTime::parse_from_rfc2822(date))
            {
                Ok(date) => Some(date.with_timezone(&Utc)),
                Err(e) => {
                    debug!("ignoring unparseable release date {}: {}", date, e);
                    None
                }
            }
        });

        for checksum in ChecksumType::release_order() {
            let lines = match paragraph.field_iter_value_lines(checksum.field_name()) {
                Some(lines) => lines,
                None => continue,
            };

            for line in lines {
                let parts = line.split_ascii_whitespace().collect::<Vec<_>>();

                let (digest, size, path) = match parts.as_slice() {
                    [digest, size, path] => (*digest, *size, *path),
                    _ => {
                        return Err(DebS3Error::ControlParse(format!(
                            "malformed {} entry: {}",
                            checksum.field_name(),
                            line
                        )))
                    }
                };

                let entry = release.files.entry(path.to_string()).or_default();
                entry.size = size.parse::<u64>()?;
                entry.set_digest_hex(checksum, digest.to_string());
            }
        }

        Ok(release)
    }

    fn add_architecture(&mut self, architecture: &str) {
        if !self.architectures.iter().any(|a| a == architecture) {
            self.architectures.push(architecture.to_string());
        }
    }

    fn add_component(&mut self, component: &str) {
        if !self.components.iter().any(|c| c == component) {
            self.components.push(component.to_string());
        }
    }

    /// Merge the architecture, component, and published files of a manifest.
    pub fn update_manifest(&mut self, manifest: &Manifest) {
        self.add_component(&manifest.component);
        self.add_architecture(&manifest.architecture);

        for (path, checksums) in &manifest.files {
            self.files.insert(path.clone(), checksums.clone());
        }
    }

    /// Publish empty indices for component and architecture pairs lacking one.
    ///
    /// Every known architecture plus those in `architectures` is considered.
    pub async fn ensure_placeholder_manifests<F>(
        &mut self,
        store: &dyn ObjectStore,
        architectures: &[String],
        progress_cb: &Option<F>,
    ) -> Result<()>
    where
        F: Fn(PublishEvent),
    {
        let mut wanted = self.architectures.clone();
        for arch in architectures {
            if !wanted.contains(arch) {
                wanted.push(arch.clone());
            }
        }

        for component in self.components.clone() {
            for arch in &wanted {
                let path = format!("{}/binary-{}/Packages", component, arch);
                if self.files.contains_key(&path) {
                    continue;
                }

                info!("creating empty index for {} {} {}", self.codename, component, arch);
                let mut manifest = Manifest::new(&self.codename, &component, arch);
                manifest.cache_control = self.cache_control.clone();
                manifest
                    .write_to_store(store, self.by_hash, progress_cb)
                    .await?;
                self.update_manifest(&manifest);
            }
        }

        Ok(())
    }

    /// Ensure every component and architecture pair has a `Packages` entry.
    pub fn validate(&self) -> Result<()> {
        for component in &self.components {
            for arch in &self.architectures {
                let path = format!("{}/binary-{}/Packages", component, arch);

                if !self.files.contains_key(&path) {
                    return Err(DebS3Error::ReleaseIncomplete {
                        codename: self.codename.clone(),
                        path,
                    });
                }
            }
        }

        Ok(())
    }

    /// Render the `Release` file content.
    pub fn generate(&self) -> String {
        let date = self.date.unwrap_or_else(Utc::now);
        let mut lines = vec![];

        if let Some(origin) = &self.origin {
            lines.push(format!("Origin: {}", origin));
            lines.push(format!("Label: {}", origin));
        }
        if let Some(suite) = &self.suite {
            lines.push(format!("Suite: {}", suite));
        }
        lines.push(format!("Codename: {}", self.codename));
        lines.push(format!("Date: {}", date.format(DATE_FORMAT)));
        lines.push(format!("Architectures: {}", self.architectures.join(" ")));
        lines.push(format!("Components: {}", self.components.join(" ")));
        if self.by_hash {
            lines.push("Acquire-By-Hash: yes".to_string());
        }

        for checksum in ChecksumType::release_order() {
            lines.push(format!("{}:", checksum.field_name()));

            for (path, entry) in &self.files {
                lines.push(format!(
                    " {} {:>16} {}",
                    entry.digest_hex(checksum).unwrap_or_default(),
                    entry.size,
                    path
                ));
            }
        }

        let mut s = lines.join("\n");
        s.push('\n');
        s
    }

    /// Validate, then publish the `Release` file and its signatures.
    ///
    /// Without a signer, stale `Release.gpg` and `InRelease` files are removed.
    pub async fn write_to_store<F>(
        &mut self,
        store: &dyn ObjectStore,
        signer: Option<&dyn ReleaseSigner>,
        progress_cb: &Option<F>,
    ) -> Result<()>
    where
        F: Fn(PublishEvent),
    {
        self.validate()?;

        self.date = Some(Utc::now());
        let content = self.generate();
        let base = format!("dists/{}", self.codename);

        let text_options =
            StoreOptions::new(CONTENT_TYPE_TEXT).cache_control(self.cache_control.as_deref());
        let signature_options =
            StoreOptions::new(CONTENT_TYPE_SIGNATURE).cache_control(self.cache_control.as_deref());

        let release_path = self.path();
        if let Some(cb) = progress_cb {
            cb(PublishEvent::IndexFileToWrite(release_path.clone()));
        }
        store
            .store(&release_path, content.as_bytes(), &text_options)
            .await?;
        if let Some(cb) = progress_cb {
            cb(PublishEvent::IndexFileWritten(release_path, content.len() as u64));
        }

        let (detached, clearsigned) = match signer {
            Some(signer) => (
                signer.sign_detached(content.as_bytes())?,
                signer.clearsign(content.as_bytes())?,
            ),
            None => (None, None),
        };

        for (filename, data, options) in [
            ("Release.gpg", detached, &signature_options),
            ("InRelease", clearsigned, &text_options),
        ] {
            let path = format!("{}/{}", base, filename);

            match data {
                Some(data) => {
                    if let Some(cb) = progress_cb {
                        cb(PublishEvent::IndexFileToWrite(path.clone()));
                    }
                    store.store(&path, &data, options).await?;
                    if let Some(cb) = progress_cb {
                        cb(PublishEvent::IndexFileWritten(path, data.len() as u64));
                    }
                }
                None => {
                    if store.remove(&path).await? {
                        info!("removed stale {}", path);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{package::Package, store::MemoryObjectStore},
        indoc::indoc,
    };

    const RELEASE: &str = indoc! {"
        Origin: Example
        Label: Example
        Suite: stable
        Codename: stable
        Date: Sat, 05 Apr 2014 19:38:23 +0000
        Architectures: amd64 i386
        Components: main
        Acquire-By-Hash: yes
        MD5Sum:
         1b2f4d2d7c5e3a6a6f6e0e1f4f3c2b1a              856 main/binary-amd64/Packages
         d41d8cd98f00b204e9800998ecf8427e                0 main/binary-i386/Packages
        SHA1:
         1111111111111111111111111111111111111111              856 main/binary-amd64/Packages
         da39a3ee5e6b4b0d3255bfef95601890afd80709                0 main/binary-i386/Packages
        SHA256:
         2222222222222222222222222222222222222222222222222222222222222222              856 main/binary-amd64/Packages
         e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855                0 main/binary-i386/Packages
    "};

    struct StaticSigner;

    impl ReleaseSigner for StaticSigner {
        fn sign_detached(&self, _data: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(Some(b"detached".to_vec()))
        }

        fn clearsign(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
            let mut signed = b"-----BEGIN PGP SIGNED MESSAGE-----\n\n".to_vec();
            signed.extend_from_slice(data);
            Ok(Some(signed))
        }
    }

    fn no_progress() -> Option<fn(PublishEvent)> {
        None
    }

    #[test]
    fn parse() -> Result<()> {
        let release = Release::parse_release(RELEASE)?;

        assert_eq!(release.codename, "stable");
        assert_eq!(release.origin.as_deref(), Some("Example"));
        assert_eq!(release.suite.as_deref(), Some("stable"));
        assert_eq!(release.architectures, vec!["amd64", "i386"]);
        assert_eq!(release.components, vec!["main"]);
        assert!(release.by_hash);
        assert_eq!(
            release.date.map(|d| d.timestamp()),
            Some(1396726703)
        );

        let entry = &release.files["main/binary-amd64/Packages"];
        assert_eq!(entry.size, 856);
        assert_eq!(entry.md5, "1b2f4d2d7c5e3a6a6f6e0e1f4f3c2b1a");
        assert_eq!(entry.sha1, "1111111111111111111111111111111111111111");
        assert_eq!(entry.sha256.len(), 64);
        assert_eq!(release.files.len(), 2);

        Ok(())
    }

    #[test]
    fn generate_round_trip() -> Result<()> {
        let release = Release::parse_release(RELEASE)?;
        let generated = release.generate();

        assert!(generated.contains(
            "\nMD5Sum:\n 1b2f4d2d7c5e3a6a6f6e0e1f4f3c2b1a              856 main/binary-amd64/Packages\n"
        ));
        assert!(generated.contains("Date: Sat, 05 Apr 2014 19:38:23 +0000\n"));
        assert!(generated.ends_with("0 main/binary-i386/Packages\n"));

        assert_eq!(Release::parse_release(&generated)?, release);

        Ok(())
    }

    #[test]
    fn malformed_checksum_rows() {
        assert!(Release::parse_release("Codename: x\nMD5Sum:\n abc main/Packages\n").is_err());
        assert!(Release::parse_release("Codename: x\nMD5Sum:\n abc big main/Packages\n").is_err());
    }

    #[test]
    fn update_manifest_overwrites() -> Result<()> {
        let mut release = Release::parse_release(RELEASE)?;

        let mut manifest = Manifest::new("stable", "contrib", "arm64");
        manifest.files.insert(
            "main/binary-amd64/Packages".to_string(),
            FileChecksums {
                size: 10,
                md5: "aa".into(),
                sha1: "bb".into(),
                sha256: "cc".into(),
            },
        );
        release.update_manifest(&manifest);
        release.update_manifest(&manifest);

        assert_eq!(release.files["main/binary-amd64/Packages"].size, 10);
        assert_eq!(release.files["main/binary-amd64/Packages"].md5, "aa");
        assert_eq!(release.architectures, vec!["amd64", "i386", "arm64"]);
        assert_eq!(release.components, vec!["main", "contrib"]);

        Ok(())
    }

    #[test]
    fn validate_requires_every_index() -> Result<()> {
        let mut release = Release::parse_release(RELEASE)?;
        release.validate()?;

        release.files.remove("main/binary-i386/Packages");
        match release.validate() {
            Err(DebS3Error::ReleaseIncomplete { codename, path }) => {
                assert_eq!(codename, "stable");
                assert_eq!(path, "main/binary-i386/Packages");
            }
            res => panic!("unexpected result: {:?}", res),
        }

        Ok(())
    }

    #[tokio::test]
    async fn retrieve_missing_and_overrides() -> Result<()> {
        let store = MemoryObjectStore::default();

        let release = Release::retrieve(&store, "jessie", Some("Me"), None, None).await?;
        assert_eq!(release, {
            let mut r = Release::new("jessie");
            r.origin = Some("Me".into());
            r
        });

        store.insert("dists/stable/Release", RELEASE)?;
        let release =
            Release::retrieve(&store, "stable", None, Some("testing"), Some("no-cache")).await?;
        assert_eq!(release.origin.as_deref(), Some("Example"));
        assert_eq!(release.suite.as_deref(), Some("testing"));
        assert_eq!(release.cache_control.as_deref(), Some("no-cache"));
        assert_eq!(release.files.len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn placeholders_and_publish() -> Result<()> {
        let store = MemoryObjectStore::default();
        store.insert("dists/stable/Release.gpg", b"stale".to_vec())?;
        store.insert("dists/stable/InRelease", b"stale".to_vec())?;

        let mut release = Release::new("stable");
        release.origin = Some("Example".into());

        let mut manifest = Manifest::new("stable", "main", "amd64");
        manifest.skip_package_upload = true;
        manifest.add(Package::new("foo", "1.0")?, true, false)?;
        manifest.write_to_store(&store, false, &no_progress()).await?;
        release.update_manifest(&manifest);

        release
            .ensure_placeholder_manifests(&store, &["amd64".into(), "armhf".into()], &no_progress())
            .await?;
        assert_eq!(release.architectures, vec!["amd64", "armhf"]);
        assert!(store
            .object("dists/stable/main/binary-armhf/Packages")
            .unwrap()
            .data
            .is_empty());

        release.write_to_store(&store, None, &no_progress()).await?;
        let published = store.object("dists/stable/Release").unwrap();
        let reparsed = Release::parse_release(&String::from_utf8_lossy(&published.data))?;
        assert_eq!(reparsed.files, release.files);
        assert_eq!(reparsed.files.len(), 4);
        assert!(store.object("dists/stable/Release.gpg").is_none());
        assert!(store.object("dists/stable/InRelease").is_none());

        release
            .write_to_store(&store, Some(&StaticSigner), &no_progress())
            .await?;
        assert_eq!(
            store.object("dists/stable/Release.gpg").unwrap().data,
            b"detached"
        );
        assert_eq!(
            store.object("dists/stable/Release.gpg").unwrap().content_type,
            CONTENT_TYPE_SIGNATURE
        );
        assert!(String::from_utf8_lossy(&store.object("dists/stable/InRelease").unwrap().data)
            .contains("Codename: stable\n"));

        Ok(())
    }

    #[tokio::test]
    async fn unpublishable_without_indices() {
        let store = MemoryObjectStore::default();

        let mut release = Release::new("stable");
        release.components.push("main".into());
        release.architectures.push("amd64".into());

        assert!(matches!(
            release.write_to_store(&store, None, &no_progress()).await,
            Err(DebS3Error::ReleaseIncomplete { .. })
        ));
        assert!(store.paths().is_empty());
    }
}
