// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Binary package metadata.

A [Package] is the metadata of a single `.deb`: its identity, its control
fields, its checksums, and where it lives in the repository pool. Instances
are obtained by parsing the control stanza of a `.deb` file or of an entry in
a `Packages` index.
*/

use {
    crate::{
        control::ControlParagraph,
        error::{DebS3Error, Result},
        io::{ChecksumType, MultiContentDigest},
    },
    log::{debug, error},
    once_cell::sync::Lazy,
    regex::Regex,
    std::{
        borrow::Cow,
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// Splits `[epoch:]version[-iteration]`.
pub static RE_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:([0-9]+):)?(.+?)(?:-(.*))?$").unwrap());

/// A dependency in its canonical `name [(op version)]` form.
static RE_DEPENDENCY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^ ]+)(?: \(([>=<]+) ([^)]+)\))?$").unwrap());

static RE_DEPENDENCY_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r", *").unwrap());

static RE_EXTENSION_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^X[BCS]{0,3}-").unwrap());

static RE_UNSAFE_FILENAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_.\-]").unwrap());

/// Package relationship fields other than `Depends`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Relation {
    Conflicts,
    Breaks,
    PreDepends,
    Provides,
    Replaces,
    Recommends,
    Suggests,
    Enhances,
}

impl Relation {
    /// All variants, in the order they are rendered.
    pub fn all() -> impl Iterator<Item = Relation> {
        [
            Self::Conflicts,
            Self::Breaks,
            Self::PreDepends,
            Self::Provides,
            Self::Replaces,
            Self::Recommends,
            Self::Suggests,
            Self::Enhances,
        ]
        .into_iter()
    }

    /// The control field name of this relationship.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Conflicts => "Conflicts",
            Self::Breaks => "Breaks",
            Self::PreDepends => "Pre-Depends",
            Self::Provides => "Provides",
            Self::Replaces => "Replaces",
            Self::Recommends => "Recommends",
            Self::Suggests => "Suggests",
            Self::Enhances => "Enhances",
        }
    }
}

/// How [Package::check_digest()] treats recorded checksums that disagree with the file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestPolicy {
    /// Fail on the first disagreeing field without modifying the package.
    Strict,
    /// Log disagreements and adopt the computed values.
    Repair,
}

/// A recorded package checksum that disagrees with the file content.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DigestMismatch {
    pub field: &'static str,
    pub recorded: String,
    pub computed: String,
}

/// Result of normalizing a single dependency expression.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NormalizedDependency {
    /// Expressions to place in `Depends`.
    Depends(Vec<String>),
    /// An expression to move into `Conflicts`.
    Conflicts(String),
}

/// Convert an operator to its Debian spelling.
pub fn debianize_op(op: &str) -> &str {
    match op {
        "<" => "<<",
        ">" => ">>",
        _ => op,
    }
}

/// Normalize a dependency expression into Debian's `name (op version)` form.
///
/// Loose `name op version` expressions gain parentheses, upper case package names
/// are lowered, underscores become dashes, `~>` constraints expand into a version
/// range, and `!=` constraints become conflicts.
pub fn normalize_dependency(dep: &str) -> NormalizedDependency {
    let mut dep = dep.to_string();

    if !dep.contains(|c| matches!(c, '(' | ',' | '|')) {
        let parts = dep.split(' ').filter(|x| !x.is_empty()).collect::<Vec<_>>();

        if let [name, op, version, ..] = parts.as_slice() {
            dep = format!("{} ({} {})", name, debianize_op(op), version);
        }
    }

    let name_end = dep.find(|c| c == ' ' || c == '(').unwrap_or(dep.len());
    let (name, rest) = dep.split_at(name_end);
    let mut dep = format!("{}{}", name.to_lowercase(), rest).replace('_', "-");

    if dep.contains("(~>") {
        let cleaned = dep.replace(|c| matches!(c, '(' | ')' | '~' | '>'), "");
        let mut words = cleaned.split(' ').filter(|x| !x.is_empty());

        if let (Some(name), Some(version)) = (words.next(), words.next()) {
            let mut next = version
                .split('.')
                .map(|x| x.parse::<u64>().unwrap_or(0))
                .collect::<Vec<_>>();
            let len = next.len();
            if len >= 2 {
                next[len - 2] += 1;
                next[len - 1] = 0;
            } else {
                next[0] += 1;
            }
            let next = next
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(".");

            return NormalizedDependency::Depends(vec![
                format!("{} (>= {})", name, version),
                format!("{} (<< {})", name, next),
            ]);
        }
    } else if dep.contains("(!= ") {
        return NormalizedDependency::Conflicts(dep.replace("!=", "="));
    }

    dep.truncate(dep.trim_end().len());
    NormalizedDependency::Depends(vec![dep])
}

fn default_maintainer() -> String {
    match (std::env::var("DEBFULLNAME"), std::env::var("DEBEMAIL")) {
        (Ok(name), Ok(email)) => format!("{} <{}>", name, email),
        _ => {
            let (user, host) = crate::lock::local_identity();
            format!("<{}@{}>", user, host)
        }
    }
}

/// Metadata of a binary package.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Package {
    pub name: String,
    /// Kept as written so leading zeros survive a rewrite of the index.
    pub epoch: Option<String>,
    pub version: Option<String>,
    pub iteration: Option<String>,
    pub architecture: Option<String>,
    pub maintainer: Option<String>,
    pub vendor: String,
    /// Upstream homepage.
    pub url: Option<String>,
    /// The `Section` field.
    pub category: Option<String>,
    pub license: String,
    pub description: Option<String>,
    pub dependencies: Vec<String>,
    pub priority: Option<String>,
    pub origin: Option<String>,
    pub installed_size: Option<String>,
    pub relations: BTreeMap<Relation, String>,
    /// Unrecognized control fields with `X[BCS]-` prefixes removed.
    pub attributes: ControlParagraph<'static>,
    pub size: Option<u64>,
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub sha512: Option<String>,
    /// Path of the `.deb` file backing this package, if any.
    pub local_path: Option<PathBuf>,
    url_filename: Option<String>,
}

impl Default for Package {
    fn default() -> Self {
        Self {
            name: String::new(),
            epoch: None,
            version: None,
            iteration: None,
            architecture: Some("native".to_string()),
            maintainer: None,
            vendor: "none".to_string(),
            url: None,
            category: Some("default".to_string()),
            license: "unknown".to_string(),
            description: Some("no description given".to_string()),
            dependencies: vec![],
            priority: None,
            origin: None,
            installed_size: None,
            relations: BTreeMap::new(),
            attributes: ControlParagraph::default(),
            size: None,
            md5: None,
            sha1: None,
            sha256: None,
            sha512: None,
            local_path: None,
            url_filename: None,
        }
    }
}

impl Package {
    /// Construct a package with a name and version string.
    ///
    /// The maintainer defaults to the local user, see [Package::fill_default_maintainer].
    pub fn new(name: impl ToString, full_version: &str) -> Result<Self> {
        let mut package = Self {
            name: name.to_string(),
            ..Default::default()
        };
        package.set_full_version(full_version)?;
        package.fill_default_maintainer();

        Ok(package)
    }

    /// Parse a package from control stanza text.
    pub fn parse_string(s: &str) -> Result<Self> {
        Self::from_paragraph(ControlParagraph::parse_str(s)?)
    }

    /// Parse a `.deb` file on the filesystem.
    ///
    /// The control stanza is read from the archive and checksums of the file are
    /// reconciled in [DigestPolicy::Repair] mode.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let paragraph = crate::deb::read_control_paragraph_from_path(path)?;

        let mut package = Self::from_paragraph(paragraph)?;
        package.local_path = Some(path.to_path_buf());
        package.fill_default_maintainer();
        package.check_digest(DigestPolicy::Repair)?;

        Ok(package)
    }

    /// Construct an instance from a parsed control stanza.
    pub fn from_paragraph(mut p: ControlParagraph<'static>) -> Result<Self> {
        let mut take = |name: &str| p.remove_field(name).map(|f| f.value_str().to_string());

        let full_version = take("Version").ok_or(DebS3Error::ControlRequiredFieldMissing("Version"))?;
        let name = take("Package").ok_or(DebS3Error::ControlRequiredFieldMissing("Package"))?;

        let mut package = Self {
            name,
            ..Default::default()
        };
        package.set_full_version(&full_version)?;

        package.architecture = take("Architecture");
        package.category = take("Section");
        if let Some(license) = take("License") {
            package.license = license;
        }
        package.maintainer = take("Maintainer");
        package.url = take("Homepage");
        if let Some(vendor) = take("Vendor") {
            package.vendor = vendor;
        }
        package.priority = take("Priority");
        package.origin = take("Origin");
        package.installed_size = take("Installed-Size");

        package.url_filename = take("Filename").map(|f| {
            urlencoding::decode(&f)
                .map(|decoded| decoded.into_owned())
                .unwrap_or(f)
        });
        package.sha1 = take(ChecksumType::Sha1.package_field_name());
        package.sha256 = take(ChecksumType::Sha256.package_field_name());
        package.sha512 = take(ChecksumType::Sha512.package_field_name());
        package.md5 = take(ChecksumType::Md5.package_field_name());
        package.size = take("Size").map(|s| s.parse::<u64>()).transpose()?;
        package.description = take("Description");

        if let Some(depends) = take("Depends") {
            package.dependencies.extend(Self::parse_depends(&depends));
        }

        for relation in Relation::all() {
            if let Some(value) = take(relation.field_name()) {
                package.relations.insert(relation, value);
            }
        }

        for field in p.iter_fields() {
            let name = RE_EXTENSION_PREFIX.replace(field.name(), "").to_string();
            package
                .attributes
                .set_field_from_string(Cow::Owned(name), Cow::Owned(field.value_str().to_string()));
        }

        Ok(package)
    }

    /// Set `maintainer` to the local user if the package names none.
    ///
    /// `$DEBFULLNAME <$DEBEMAIL>` is used when both are set, otherwise
    /// `<user@host>` from [crate::lock::local_identity].
    pub fn fill_default_maintainer(&mut self) {
        if self.maintainer.is_none() {
            self.maintainer = Some(default_maintainer());
        }
    }

    /// Set `epoch`, `version`, and `iteration` from a `[epoch:]version[-iteration]` string.
    pub fn set_full_version(&mut self, s: &str) -> Result<()> {
        let captures = RE_VERSION
            .captures(s)
            .ok_or_else(|| DebS3Error::VersionParse(s.to_string()))?;

        self.epoch = captures.get(1).map(|m| m.as_str().to_string());
        self.version = captures.get(2).map(|m| m.as_str().to_string());
        self.iteration = captures.get(3).map(|m| m.as_str().to_string());

        Ok(())
    }

    /// The `[epoch:]version[-iteration]` string.
    ///
    /// [None] only if epoch, version, and iteration are all unset.
    pub fn full_version(&self) -> Option<String> {
        if self.epoch.is_none() && self.version.is_none() && self.iteration.is_none() {
            return None;
        }

        let head = self
            .epoch
            .clone()
            .into_iter()
            .chain(self.version.clone())
            .collect::<Vec<_>>()
            .join(":");

        Some(match &self.iteration {
            Some(iteration) => format!("{}-{}", head, iteration),
            None => head,
        })
    }

    /// Whether a user supplied version string designates this package.
    ///
    /// Matches the bare version, `version-iteration`, or the full version.
    pub fn matches_version(&self, s: &str) -> bool {
        let version = self.version.as_deref().unwrap_or_default();
        let with_iteration = format!(
            "{}-{}",
            version,
            self.iteration.as_deref().unwrap_or_default()
        );

        self.version.as_deref() == Some(s)
            || with_iteration == s
            || self.full_version().as_deref() == Some(s)
    }

    /// Filename of this package in the pool.
    ///
    /// Characters outside `[a-zA-Z0-9_.-]` are replaced by `-`.
    pub fn safe_name(&self) -> String {
        let name = format!(
            "{}_{}-{}_{}.deb",
            self.name,
            self.version.as_deref().unwrap_or_default(),
            self.iteration.as_deref().unwrap_or_default(),
            self.architecture.as_deref().unwrap_or_default()
        );

        RE_UNSAFE_FILENAME.replace_all(&name, "-").to_string()
    }

    /// The pool path this package would be stored at.
    pub fn safe_url_path(&self, codename: Option<&str>) -> String {
        let first = self.name.chars().take(1).collect::<String>();
        let first_two = self.name.chars().take(2).collect::<String>();

        match codename {
            Some(codename) => format!(
                "pool/{}/{}/{}/{}",
                codename,
                first,
                first_two,
                self.safe_name()
            ),
            None => format!("pool/{}/{}/{}", first, first_two, self.safe_name()),
        }
    }

    /// The repository path of this package's `.deb`.
    ///
    /// This is the path recorded in the package's `Filename` field if one is known
    /// and the pool path otherwise.
    pub fn url_filename(&self, codename: Option<&str>) -> String {
        self.url_filename
            .clone()
            .unwrap_or_else(|| self.safe_url_path(codename))
    }

    /// Record the pool path as this package's `Filename` unless one is already known.
    pub fn pin_url_filename(&mut self, codename: Option<&str>) {
        if self.url_filename.is_none() {
            self.url_filename = Some(self.safe_url_path(codename));
        }
    }

    /// Explicitly set the `Filename` of this package.
    pub fn set_url_filename(&mut self, filename: Option<String>) {
        self.url_filename = filename;
    }

    /// Forget the recorded `Filename` so the package is relocated to the pool layout.
    pub fn reset_url_filename(&mut self) {
        self.url_filename = None;
    }

    /// Forget all recorded checksums.
    pub fn clear_digests(&mut self) {
        self.size = None;
        self.md5 = None;
        self.sha1 = None;
        self.sha256 = None;
        self.sha512 = None;
    }

    /// Parse a `Depends` value into a list of dependency expressions.
    pub fn parse_depends(data: &str) -> Vec<String> {
        if data.is_empty() {
            return vec![];
        }

        RE_DEPENDENCY_SPLIT
            .split(data)
            .map(|dep| match RE_DEPENDENCY.captures(dep) {
                Some(captures) => {
                    let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();

                    match (captures.get(2), captures.get(3)) {
                        (Some(op), Some(version)) => {
                            format!("{} ({} {})", name, op.as_str(), version.as_str())
                                .trim()
                                .to_string()
                        }
                        _ => name.trim().to_string(),
                    }
                }
                None => dep.to_string(),
            })
            .collect()
    }

    /// Reconcile recorded checksums with those of the backing file.
    ///
    /// Unset checksums adopt the computed value. Disagreeing checksums are handled
    /// according to `policy`. Returns the disagreeing fields.
    pub fn check_digest(&mut self, policy: DigestPolicy) -> Result<Vec<DigestMismatch>> {
        let path = self
            .local_path
            .clone()
            .ok_or_else(|| DebS3Error::PackageFileMissing(self.safe_name()))?;
        let digests = MultiContentDigest::from_path(&path)?;

        debug!(
            "{}: calculated digests: SHA1 {} SHA256 {} SHA512 {} MD5 {}",
            self.safe_name(),
            digests.sha1.digest_hex(),
            digests.sha256.digest_hex(),
            digests.sha512.digest_hex(),
            digests.md5.digest_hex()
        );

        let mut mismatches = vec![];

        if let Some(size) = self.size {
            if size != digests.size {
                mismatches.push(DigestMismatch {
                    field: "Size",
                    recorded: size.to_string(),
                    computed: digests.size.to_string(),
                });
            }
        }

        for checksum in [
            ChecksumType::Md5,
            ChecksumType::Sha1,
            ChecksumType::Sha256,
            ChecksumType::Sha512,
        ] {
            let computed = digests.digest_from_checksum(checksum).digest_hex();

            if let Some(recorded) = self.digest_hex(checksum) {
                if !recorded.eq_ignore_ascii_case(&computed) {
                    mismatches.push(DigestMismatch {
                        field: checksum.package_field_name(),
                        recorded: recorded.to_string(),
                        computed,
                    });
                }
            }
        }

        if policy == DigestPolicy::Strict {
            if let Some(mismatch) = mismatches.first() {
                return Err(DebS3Error::DigestMismatch {
                    path: format!("{}", path.display()),
                    field: mismatch.field,
                    expected: mismatch.recorded.clone(),
                    actual: mismatch.computed.clone(),
                });
            }
        }

        for mismatch in &mismatches {
            error!(
                "{}: calculated {} does not match; calculated {}, provided {}",
                self.safe_name(),
                mismatch.field,
                mismatch.computed,
                mismatch.recorded
            );
        }

        self.size = Some(digests.size);
        self.md5 = Some(digests.md5.digest_hex());
        self.sha1 = Some(digests.sha1.digest_hex());
        self.sha256 = Some(digests.sha256.digest_hex());
        self.sha512 = Some(digests.sha512.digest_hex());

        Ok(mismatches)
    }

    /// The recorded hex digest of a checksum flavor.
    pub fn digest_hex(&self, checksum: ChecksumType) -> Option<&str> {
        match checksum {
            ChecksumType::Md5 => self.md5.as_deref(),
            ChecksumType::Sha1 => self.sha1.as_deref(),
            ChecksumType::Sha256 => self.sha256.as_deref(),
            ChecksumType::Sha512 => self.sha512.as_deref(),
        }
    }

    /// Render this package as a `Packages` index stanza.
    pub fn to_paragraph(&self, codename: Option<&str>) -> ControlParagraph<'static> {
        let mut p = ControlParagraph::default();
        let mut set = |name: &'static str, value: Option<String>| {
            if let Some(value) = value {
                p.set_field_from_string(Cow::Borrowed(name), Cow::Owned(value));
            }
        };

        let mut depends = vec![];
        let mut conflicts = self
            .relations
            .get(&Relation::Conflicts)
            .map(|x| vec![x.clone()])
            .unwrap_or_default();

        for dep in &self.dependencies {
            match normalize_dependency(dep) {
                NormalizedDependency::Depends(deps) => depends.extend(deps),
                NormalizedDependency::Conflicts(dep) => conflicts.push(dep),
            }
        }

        set("Package", Some(self.name.clone()));
        set("Version", self.full_version());
        set("License", Some(self.license.clone()));
        set("Vendor", Some(self.vendor.clone()));
        set("Architecture", self.architecture.clone());
        set("Maintainer", self.maintainer.clone());
        set("Installed-Size", self.installed_size.clone());
        if !depends.is_empty() {
            set("Depends", Some(depends.join(", ")));
        }
        for relation in Relation::all() {
            let value = if relation == Relation::Conflicts {
                if conflicts.is_empty() {
                    None
                } else {
                    Some(conflicts.join(", "))
                }
            } else {
                self.relations.get(&relation).cloned()
            };
            set(relation.field_name(), value);
        }
        set("Section", self.category.clone());
        set("Origin", self.origin.clone());
        set("Priority", self.priority.clone());
        set("Homepage", self.url.clone());
        set("Filename", Some(self.url_filename(codename)));
        set("Size", self.size.map(|x| x.to_string()));
        for checksum in [
            ChecksumType::Md5,
            ChecksumType::Sha1,
            ChecksumType::Sha256,
            ChecksumType::Sha512,
        ] {
            set(
                checksum.package_field_name(),
                self.digest_hex(checksum).map(|x| x.to_string()),
            );
        }
        set("Description", self.description.clone());

        for field in self.attributes.iter_fields() {
            if !p.has_field(field.name()) {
                p.set_field(field.clone());
            }
        }

        p
    }

    /// Render this package as `Packages` index stanza text.
    pub fn generate(&self, codename: Option<&str>) -> String {
        self.to_paragraph(codename).to_string()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::io::Write};

    const EXPECTED_DESCRIPTION: &str = "A platform for community discussion. Free, open, simple.\nThe description can have a continuation line.\n\nAnd blank lines.\n\nIf it wants to.";

    fn package(name: &str) -> Package {
        Package {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn parse_packages_fixture() -> Result<()> {
        let p = Package::parse_string(include_str!("testdata/Packages"))?;

        assert_eq!(p.name, "discourse");
        assert_eq!(p.version.as_deref(), Some("0.9.8.3"));
        assert_eq!(p.epoch, None);
        assert_eq!(p.iteration.as_deref(), Some("1396474125.12e4179.wheezy"));
        assert_eq!(
            p.full_version().as_deref(),
            Some("0.9.8.3-1396474125.12e4179.wheezy")
        );
        assert_eq!(p.description.as_deref(), Some(EXPECTED_DESCRIPTION));
        assert_eq!(p.dependencies, vec!["libc6 (>= 2.13)", "nodejs", "ruby"]);
        assert_eq!(p.size, Some(43889282));
        assert_eq!(p.md5.as_deref(), Some("1b2f4d2d7c5e3a6a6f6e0e1f4f3c2b1a"));
        assert_eq!(p.sha512, None);
        assert_eq!(p.priority.as_deref(), Some("extra"));
        assert_eq!(p.installed_size.as_deref(), Some("173016"));
        assert_eq!(p.url.as_deref(), Some("https://www.discourse.org"));
        assert_eq!(p.attributes.field_str("Build-Ref"), Some("12e4179"));
        assert_eq!(
            p.url_filename(Some("stable")),
            "pool/d/di/discourse_0.9.8.3-1396474125.12e4179.wheezy_amd64.deb"
        );

        Ok(())
    }

    #[test]
    fn sha512_does_not_clobber_sha256() -> Result<()> {
        let p = Package::parse_string("Package: foo\nVersion: 1.0\nSHA256: aa\nSHA512: bb\n")?;

        assert_eq!(p.sha256.as_deref(), Some("aa"));
        assert_eq!(p.sha512.as_deref(), Some("bb"));

        Ok(())
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Package::parse_string("Package: foo\n"),
            Err(DebS3Error::ControlRequiredFieldMissing("Version"))
        ));
        assert!(matches!(
            Package::parse_string("Version: 1.0\n"),
            Err(DebS3Error::ControlRequiredFieldMissing("Package"))
        ));
        assert!(Package::parse_string("Package: foo\nVersion: 1.0\nSize: big\n").is_err());
    }

    #[test]
    fn full_version() -> Result<()> {
        let mut p = package("foo");
        assert_eq!(p.version, None);
        assert_eq!(p.full_version(), None);

        p.version = Some("0.9.8".into());
        assert_eq!(p.full_version().as_deref(), Some("0.9.8"));

        p.epoch = Some("1396474125".into());
        assert_eq!(p.full_version().as_deref(), Some("1396474125:0.9.8"));

        p.epoch = None;
        p.iteration = Some("2".into());
        assert_eq!(p.full_version().as_deref(), Some("0.9.8-2"));

        p.epoch = Some("1396474125".into());
        assert_eq!(p.full_version().as_deref(), Some("1396474125:0.9.8-2"));

        let p = Package::new("foo", "3:1.2-3-4")?;
        assert_eq!(p.epoch.as_deref(), Some("3"));
        assert_eq!(p.version.as_deref(), Some("1.2"));
        assert_eq!(p.iteration.as_deref(), Some("3-4"));

        assert!(matches!(
            Package::new("foo", ""),
            Err(DebS3Error::VersionParse(_))
        ));

        Ok(())
    }

    #[test]
    fn epoch_written_as_read() -> Result<()> {
        let p = Package::parse_string("Package: foo\nVersion: 00:1.0-1\n")?;
        assert_eq!(p.epoch.as_deref(), Some("00"));
        assert_eq!(p.full_version().as_deref(), Some("00:1.0-1"));
        assert!(p.generate(None).contains("Version: 00:1.0-1\n"));
        assert!(p.matches_version("00:1.0-1"));

        Ok(())
    }

    #[test]
    fn maintainer_defaults_only_when_constructed() -> Result<()> {
        assert_eq!(Package::default().maintainer, None);

        let p = Package::parse_string("Package: foo\nVersion: 1.0\nMaintainer: A <a@example.com>\n")?;
        assert_eq!(p.maintainer.as_deref(), Some("A <a@example.com>"));

        let p = Package::parse_string("Package: foo\nVersion: 1.0\n")?;
        assert_eq!(p.maintainer, None);
        assert!(!p.generate(None).contains("Maintainer:"));

        let p = Package::new("foo", "1.0")?;
        assert!(p.maintainer.is_some());

        let mut p = Package::parse_string("Package: foo\nVersion: 1.0\nMaintainer: B\n")?;
        p.fill_default_maintainer();
        assert_eq!(p.maintainer.as_deref(), Some("B"));

        Ok(())
    }

    #[test]
    fn version_matching() -> Result<()> {
        let p = Package::new("foo", "7:0.9.8.3-1")?;

        assert!(p.matches_version("0.9.8.3"));
        assert!(p.matches_version("0.9.8.3-1"));
        assert!(p.matches_version("7:0.9.8.3-1"));
        assert!(!p.matches_version("0.9.8.3-2"));
        assert!(!p.matches_version("7:0.9.8.3"));

        Ok(())
    }

    #[test]
    fn pool_paths() -> Result<()> {
        let mut p = Package::new("libfoo+bar", "1.0~rc1-1")?;
        p.architecture = Some("amd64".into());

        assert_eq!(p.safe_name(), "libfoo-bar_1.0-rc1-1_amd64.deb");
        assert_eq!(
            p.safe_url_path(None),
            "pool/l/li/libfoo-bar_1.0-rc1-1_amd64.deb"
        );
        assert_eq!(
            p.url_filename(Some("stable")),
            "pool/stable/l/li/libfoo-bar_1.0-rc1-1_amd64.deb"
        );

        p.pin_url_filename(Some("stable"));
        assert_eq!(
            p.url_filename(Some("other")),
            "pool/stable/l/li/libfoo-bar_1.0-rc1-1_amd64.deb"
        );

        p.reset_url_filename();
        assert_eq!(
            p.url_filename(Some("other")),
            "pool/other/l/li/libfoo-bar_1.0-rc1-1_amd64.deb"
        );

        Ok(())
    }

    #[test]
    fn filename_is_percent_decoded() -> Result<()> {
        let p = Package::parse_string(
            "Package: foo\nVersion: 1:1.0\nFilename: pool/f/fo/foo_1.0%2Bdfsg_all.deb\n",
        )?;

        assert_eq!(p.url_filename(None), "pool/f/fo/foo_1.0+dfsg_all.deb");

        Ok(())
    }

    #[test]
    fn depends_parsing() {
        assert_eq!(
            Package::parse_depends("a, b (>= 1.0),c (<< 2), weird [x]"),
            vec!["a", "b (>= 1.0)", "c (<< 2)", "weird [x]"]
        );
        assert!(Package::parse_depends("").is_empty());
    }

    #[test]
    fn dependency_normalization() {
        assert_eq!(
            normalize_dependency("foo >= 1.0"),
            NormalizedDependency::Depends(vec!["foo (>= 1.0)".into()])
        );
        assert_eq!(
            normalize_dependency("foo > 1.0"),
            NormalizedDependency::Depends(vec!["foo (>> 1.0)".into()])
        );
        assert_eq!(
            normalize_dependency("Foo_Bar"),
            NormalizedDependency::Depends(vec!["foo-bar".into()])
        );
        assert_eq!(
            normalize_dependency("rails (~> 3.2.1)"),
            NormalizedDependency::Depends(vec![
                "rails (>= 3.2.1)".into(),
                "rails (<< 3.3.0)".into()
            ])
        );
        assert_eq!(
            normalize_dependency("foo (!= 1.0)"),
            NormalizedDependency::Conflicts("foo (= 1.0)".into())
        );
        assert_eq!(
            normalize_dependency("a | b"),
            NormalizedDependency::Depends(vec!["a | b".into()])
        );
    }

    #[test]
    fn generate_round_trip() -> Result<()> {
        let original = Package::parse_string(include_str!("testdata/Packages"))?;
        let text = original.generate(Some("stable"));

        assert!(text.starts_with("Package: discourse\nVersion: 0.9.8.3-1396474125.12e4179.wheezy\n"));
        assert!(text.contains("\n .\n And blank lines.\n"));
        assert!(text.contains("Build-Ref: 12e4179\n"));

        let reparsed = Package::parse_string(&text)?;
        assert_eq!(reparsed, original);

        Ok(())
    }

    #[test]
    fn generate_omits_unset_fields() -> Result<()> {
        let mut p = Package::new("foo", "1.0")?;
        p.architecture = Some("all".into());
        p.maintainer = None;
        p.dependencies = vec!["bar < 2".into(), "baz (!= 3)".into()];

        let text = p.generate(None);
        assert!(!text.contains("Maintainer:"));
        assert!(!text.contains("Homepage:"));
        assert!(!text.contains("Size:"));
        assert!(text.contains("Depends: bar (<< 2)\n"));
        assert!(text.contains("Conflicts: baz (= 3)\n"));
        assert!(text.contains("Filename: pool/f/fo/foo_1.0-_all.deb\n"));

        Ok(())
    }

    fn write_temp_file(data: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn check_digest_repair() -> Result<()> {
        let f = write_temp_file(b"foobar");

        let mut p = Package::new("foo", "1.0")?;
        p.local_path = Some(f.path().to_path_buf());
        p.md5 = Some("00000000000000000000000000000000".into());

        let mismatches = p.check_digest(DigestPolicy::Repair)?;
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].field, "MD5sum");
        assert_eq!(p.md5.as_deref(), Some("3858f62230ac3c915f300c664312c63f"));
        assert_eq!(p.size, Some(6));
        assert!(p.sha1.is_some());
        assert!(p.sha256.is_some());
        assert!(p.sha512.is_some());

        Ok(())
    }

    #[test]
    fn check_digest_strict() -> Result<()> {
        let f = write_temp_file(b"foobar");

        let mut p = Package::new("foo", "1.0")?;
        p.local_path = Some(f.path().to_path_buf());
        p.sha1 = Some("00".into());

        assert!(matches!(
            p.check_digest(DigestPolicy::Strict),
            Err(DebS3Error::DigestMismatch { field: "SHA1", .. })
        ));
        assert_eq!(p.sha1.as_deref(), Some("00"));
        assert_eq!(p.md5, None);

        p.sha1 = None;
        assert!(p.check_digest(DigestPolicy::Strict)?.is_empty());
        assert_eq!(p.md5.as_deref(), Some("3858f62230ac3c915f300c664312c63f"));

        Ok(())
    }

    #[test]
    fn check_digest_requires_file() {
        let mut p = package("foo");
        assert!(matches!(
            p.check_digest(DigestPolicy::Repair),
            Err(DebS3Error::PackageFileMissing(_))
        ));
    }

    #[test]
    fn parse_deb_file() -> Result<()> {
        let mut control = ControlParagraph::default();
        control.set_field_from_string("Package".into(), "hello".into());
        control.set_field_from_string("Version".into(), "2.10-2".into());
        control.set_field_from_string("Architecture".into(), "amd64".into());
        control.set_field_from_string("Depends".into(), "libc6 (>= 2.14)".into());

        let mut data = vec![];
        crate::deb::write_deb(
            &mut data,
            &control,
            &[("usr/bin/hello", &b"hi"[..])],
            crate::deb::DebCompression::Gzip,
        )?;
        let f = write_temp_file(&data);

        let p = Package::parse_file(f.path())?;
        assert_eq!(p.name, "hello");
        assert!(p.maintainer.is_some());
        assert_eq!(p.full_version().as_deref(), Some("2.10-2"));
        assert_eq!(p.size, Some(data.len() as u64));
        assert_eq!(p.local_path.as_deref(), Some(f.path()));
        assert_eq!(
            p.url_filename(Some("stable")),
            "pool/stable/h/he/hello_2.10-2_amd64.deb"
        );

        Ok(())
    }
}
