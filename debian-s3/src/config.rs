// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repository configuration.

Everything an operation needs to know about the target repository is carried
in a [RepositoryConfig] value that is passed explicitly. Instances can be
deserialized from YAML or JSON and then overridden field by field.
*/

use {
    crate::error::{DebS3Error, Result},
    serde::{Deserialize, Serialize},
    std::{str::FromStr, time::Duration},
};

/// Access policy applied to stored objects.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    Authenticated,
    BucketOwner,
}

impl Default for Visibility {
    fn default() -> Self {
        Self::Public
    }
}

impl Visibility {
    /// The S3 canned ACL corresponding to this policy.
    pub fn canned_acl(&self) -> &'static str {
        match self {
            Self::Public => "public-read",
            Self::Private => "private",
            Self::Authenticated => "authenticated-read",
            Self::BucketOwner => "bucket-owner-full-control",
        }
    }
}

impl FromStr for Visibility {
    type Err = DebS3Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            "authenticated" => Ok(Self::Authenticated),
            "bucket_owner" => Ok(Self::BucketOwner),
            _ => Err(DebS3Error::Other(format!(
                "invalid visibility {}; can be public, private, authenticated, or bucket_owner",
                s
            ))),
        }
    }
}

/// Retry behavior for transient object store failures.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow the given 1-based attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after the given 1-based attempt failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        exponential(self.initial_backoff_ms, self.max_backoff_ms, attempt)
    }
}

/// How long to wait for another publisher's lock to disappear.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct LockWaitPolicy {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Give up after this many polls. Waits forever if unset.
    pub max_attempts: Option<u32>,
}

impl Default for LockWaitPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 100,
            max_interval_ms: 10_000,
            max_attempts: Some(60),
        }
    }
}

impl LockWaitPolicy {
    /// Whether another poll may follow the given 1-based attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map(|max| attempt < max).unwrap_or(true)
    }

    /// Delay before the poll following the given 1-based attempt.
    pub fn interval(&self, attempt: u32) -> Duration {
        exponential(self.initial_interval_ms, self.max_interval_ms, attempt)
    }
}

fn exponential(initial_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);

    Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
}

/// Describes the repository being published to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RepositoryConfig {
    /// Name of the S3 bucket.
    pub bucket: Option<String>,

    /// Key prefix under which the repository is rooted.
    pub prefix: Option<String>,

    /// AWS region name.
    pub region: Option<String>,

    /// Custom S3 API endpoint URL.
    pub endpoint: Option<String>,

    pub visibility: Visibility,

    /// Request server side encryption of stored objects.
    pub encryption: bool,

    /// `Cache-Control` header value for stored objects.
    pub cache_control: Option<String>,

    /// GPG key to sign `Release` files with.
    ///
    /// An empty string signs with GPG's default key.
    pub sign: Option<String>,

    /// Extra arguments for the `gpg` invocation.
    pub gpg_options: Option<String>,

    /// `Origin` field of the `Release` file.
    pub origin: Option<String>,

    /// `Suite` field of the `Release` file.
    pub suite: Option<String>,

    pub codename: String,

    pub component: String,

    /// Keep other versions of a package when adding one.
    pub preserve_versions: bool,

    /// Take the repository lock while publishing.
    pub lock: bool,

    /// Refuse to replace packages or pool files with different content.
    pub fail_if_exists: bool,

    /// Don't upload `.deb` files to the pool.
    ///
    /// Useful when packages are hosted elsewhere.
    pub skip_package_upload: bool,

    /// Publish `by-hash` copies of index files.
    pub by_hash: bool,

    /// Architectures seeded when an `all` package is added to a repository without indices.
    pub placeholder_architectures: Vec<String>,

    pub retry: RetryPolicy,

    pub lock_wait: LockWaitPolicy,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            prefix: None,
            region: None,
            endpoint: None,
            visibility: Visibility::default(),
            encryption: false,
            cache_control: None,
            sign: None,
            gpg_options: None,
            origin: None,
            suite: None,
            codename: "stable".to_string(),
            component: "main".to_string(),
            preserve_versions: true,
            lock: false,
            fail_if_exists: false,
            skip_package_upload: false,
            by_hash: true,
            placeholder_architectures: ["amd64", "i386", "armhf"]
                .into_iter()
                .map(|x| x.to_string())
                .collect(),
            retry: RetryPolicy::default(),
            lock_wait: LockWaitPolicy::default(),
        }
    }
}

impl RepositoryConfig {
    /// Obtain the arguments to pass to `gpg` in addition to signing arguments.
    pub fn gpg_arguments(&self) -> Vec<String> {
        self.gpg_options
            .as_deref()
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(|x| x.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RepositoryConfig::default();

        assert_eq!(config.codename, "stable");
        assert_eq!(config.component, "main");
        assert!(config.preserve_versions);
        assert!(!config.lock);
        assert_eq!(config.visibility.canned_acl(), "public-read");
        assert_eq!(config.placeholder_architectures, vec!["amd64", "i386", "armhf"]);
    }

    #[test]
    fn visibility_parsing() {
        assert_eq!(
            "bucket_owner".parse::<Visibility>().unwrap().canned_acl(),
            "bucket-owner-full-control"
        );
        assert_eq!(
            "authenticated".parse::<Visibility>().unwrap(),
            Visibility::Authenticated
        );
        assert!("world".parse::<Visibility>().is_err());
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(200), Duration::from_millis(350));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let wait = LockWaitPolicy {
            max_attempts: None,
            ..Default::default()
        };
        assert!(wait.should_retry(u32::MAX - 1));
    }

    #[test]
    fn gpg_arguments() {
        let config = RepositoryConfig {
            gpg_options: Some("--homedir /tmp/gpg  --pinentry-mode loopback".into()),
            ..Default::default()
        };

        assert_eq!(
            config.gpg_arguments(),
            vec!["--homedir", "/tmp/gpg", "--pinentry-mode", "loopback"]
        );
    }
}
