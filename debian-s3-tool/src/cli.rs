// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    debian_s3::{
        config::{RepositoryConfig, Visibility},
        error::DebS3Error,
        mirror::HttpMirror,
        package::Package,
        publish::{PublishEvent, Publisher},
        signing::{GpgSigner, ReleaseSigner},
        store::{
            filesystem::FilesystemObjectStore,
            s3::{S3Credentials, S3ObjectStore},
            ObjectStore,
        },
    },
    log::{info, warn, LevelFilter},
    std::path::PathBuf,
    thiserror::Error,
};

const CONFIG_ABOUT: &str = "\
Repository Configuration

Every command operates on one codename and component of a repository. The
repository is described by a YAML document passed via `--config` and/or by
command line flags. Flags take precedence over values in the YAML document.

The YAML document can have the following keys:

bucket (string)
   Name of the S3 bucket holding the repository.

prefix (string)
   Key prefix under which the repository is rooted in the bucket.

region (string)
   AWS region name. Defaults to us-east-1.

endpoint (string)
   URL of a custom S3 API endpoint.

visibility (string)
   Access policy of written objects. One of public, private, authenticated,
   or bucket_owner. Defaults to public.

encryption (bool)
   Request server side encryption of written objects.

cache_control (string)
   Value of the Cache-Control header of written objects.

sign (string)
   GPG key to sign Release files with. An empty string uses GPG's default key.
   Release files are not signed if unset.

gpg_options (string)
   Extra arguments for gpg, separated by whitespace.

origin (string)
suite (string)
   Origin and Suite fields of the Release file.

codename (string)
   Codename of the distribution. Defaults to stable.

component (string)
   Component of the distribution. Defaults to main.

preserve_versions (bool)
   Keep other versions of a package when uploading one. Defaults to true.

lock (bool)
   Take the repository lock while publishing. Defaults to false.

fail_if_exists (bool)
   Refuse to replace packages or pool files with different content.

skip_package_upload (bool)
   Don't upload .deb files. Useful when they are hosted elsewhere.

by_hash (bool)
   Publish by-hash copies of index files. Defaults to true.

placeholder_architectures (list[string])
   Architectures given empty indices when an `all` package is uploaded to
   a distribution without any. Defaults to amd64, i386, and armhf.

retry (mapping)
   Retry behavior for S3 requests. Keys: max_attempts, initial_backoff_ms,
   max_backoff_ms.

lock_wait (mapping)
   How long to wait for another publisher's lock. Keys: initial_interval_ms,
   max_interval_ms, max_attempts (null waits forever).

AWS credentials are resolved from the environment and AWS configuration files
unless given via --access-key-id and --secret-access-key.
";

const UPLOAD_ABOUT: &str = "\
Upload packages to a repository.

Each .deb file is stored in the pool of the codename and added to the Packages
index of its architecture. Packages of architecture `all` are added to the
index of every architecture of the component.

The Release file of the codename is rewritten afterwards, and signed if a GPG
key is configured.
";

const DELETE_ABOUT: &str = "\
Remove a package from a repository.

Without --versions, every version of the package is removed from the index.
Package files are left in the pool.

Use `--arch all` to remove the package from every architecture.
";

const VERIFY_ABOUT: &str = "\
Verify that every indexed package exists in the pool.

With --fix-manifests, packages whose file is missing are removed from the
index.
";

const MIRROR_ABOUT: &str = "\
Mirror an upstream repository.

Every package of the configured codename of the upstream repository at URL is
downloaded and uploaded to the configured component. Downloads are cached in
--cache-dir and verified against the checksums of the upstream index.
";

const UNLOCK_ABOUT: &str = "\
Forcibly remove the repository lock.

Only do this if the process holding the lock is known to be gone.
";

#[derive(Debug, Error)]
pub enum DebS3ToolError {
    #[error("argument parsing error: {0:?}")]
    Clap(#[from] clap::Error),

    #[error("{0:?}")]
    DebS3(#[from] DebS3Error),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0:?}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("no packages were deleted; {0} not found")]
    NothingDeleted(String),
}

pub type Result<T> = std::result::Result<T, DebS3ToolError>;

fn repository_args(app: Command<'static>) -> Command<'static> {
    app.arg(
        Arg::new("config")
            .long("--config")
            .takes_value(true)
            .global(true)
            .allow_invalid_utf8(true)
            .help("Path to a YAML file defining the repository configuration"),
    )
    .arg(
        Arg::new("bucket")
            .long("--bucket")
            .short('b')
            .takes_value(true)
            .global(true)
            .help("Name of the S3 bucket holding the repository"),
    )
    .arg(
        Arg::new("prefix")
            .long("--prefix")
            .takes_value(true)
            .global(true)
            .help("Key prefix of the repository in the bucket"),
    )
    .arg(
        Arg::new("filesystem")
            .long("--filesystem")
            .takes_value(true)
            .global(true)
            .allow_invalid_utf8(true)
            .conflicts_with("bucket")
            .help("Publish to a local directory instead of S3"),
    )
    .arg(
        Arg::new("region")
            .long("--s3-region")
            .takes_value(true)
            .global(true)
            .help("AWS region of the bucket"),
    )
    .arg(
        Arg::new("endpoint")
            .long("--endpoint")
            .takes_value(true)
            .global(true)
            .help("URL of a custom S3 API endpoint"),
    )
    .arg(
        Arg::new("access-key-id")
            .long("--access-key-id")
            .takes_value(true)
            .global(true)
            .requires("secret-access-key")
            .help("AWS access key"),
    )
    .arg(
        Arg::new("secret-access-key")
            .long("--secret-access-key")
            .takes_value(true)
            .global(true)
            .requires("access-key-id")
            .help("AWS secret key"),
    )
    .arg(
        Arg::new("session-token")
            .long("--session-token")
            .takes_value(true)
            .global(true)
            .help("AWS session token"),
    )
    .arg(
        Arg::new("visibility")
            .long("--visibility")
            .takes_value(true)
            .global(true)
            .possible_values(["public", "private", "authenticated", "bucket_owner"])
            .help("Access policy of written objects"),
    )
    .arg(
        Arg::new("encryption")
            .long("--encryption")
            .short('e')
            .global(true)
            .help("Use S3 server side encryption"),
    )
    .arg(
        Arg::new("cache-control")
            .long("--cache-control")
            .short('C')
            .takes_value(true)
            .global(true)
            .help("Cache-Control header of written objects"),
    )
    .arg(
        Arg::new("sign")
            .long("--sign")
            .takes_value(true)
            .min_values(0)
            .max_values(1)
            .global(true)
            .help("Sign the Release file with GPG, optionally with the given key ID"),
    )
    .arg(
        Arg::new("gpg-options")
            .long("--gpg-options")
            .takes_value(true)
            .allow_hyphen_values(true)
            .global(true)
            .help("Additional arguments to pass to gpg"),
    )
    .arg(
        Arg::new("origin")
            .long("--origin")
            .short('o')
            .takes_value(true)
            .global(true)
            .help("Origin field of the Release file"),
    )
    .arg(
        Arg::new("suite")
            .long("--suite")
            .takes_value(true)
            .global(true)
            .help("Suite field of the Release file"),
    )
    .arg(
        Arg::new("codename")
            .long("--codename")
            .short('c')
            .takes_value(true)
            .global(true)
            .help("Codename of the distribution"),
    )
    .arg(
        Arg::new("component")
            .long("--component")
            .short('m')
            .takes_value(true)
            .global(true)
            .help("Component of the distribution"),
    )
    .arg(
        Arg::new("lock")
            .long("--lock")
            .short('l')
            .global(true)
            .help("Take the repository lock to prevent simultaneous updates"),
    )
    .arg(
        Arg::new("fail-if-exists")
            .long("--fail-if-exists")
            .global(true)
            .help("Refuse to replace packages with different content"),
    )
    .arg(
        Arg::new("skip-package-upload")
            .long("--skip-package-upload")
            .global(true)
            .help("Don't upload package files"),
    )
    .arg(
        Arg::new("no-preserve-versions")
            .long("--no-preserve-versions")
            .global(true)
            .help("Remove other versions of a package when adding one"),
    )
    .arg(
        Arg::new("no-by-hash")
            .long("--no-by-hash")
            .global(true)
            .help("Don't publish by-hash copies of index files"),
    )
}

fn app() -> Command<'static> {
    let app = Command::new("deb-s3")
        .version("0.1")
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Publish Debian packages to repositories on S3")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("--verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        )
        .arg(
            Arg::new("quiet")
                .long("--quiet")
                .short('q')
                .global(true)
                .conflicts_with("verbose")
                .help("Only log errors"),
        );

    let app = repository_args(app);

    let app = app.subcommand(
        Command::new("upload")
            .about("Upload packages to a repository")
            .long_about(UPLOAD_ABOUT)
            .arg(
                Arg::new("arch")
                    .long("--arch")
                    .short('a')
                    .takes_value(true)
                    .help("Index packages under this architecture instead of their own"),
            )
            .arg(
                Arg::new("files")
                    .required(true)
                    .multiple_values(true)
                    .allow_invalid_utf8(true)
                    .help("Paths of .deb files to upload"),
            ),
    );

    let app = app.subcommand(
        Command::new("list")
            .about("List packages in a repository")
            .arg(
                Arg::new("arch")
                    .long("--arch")
                    .short('a')
                    .takes_value(true)
                    .help("Only list packages of this architecture"),
            )
            .arg(
                Arg::new("long")
                    .long("--long")
                    .help("Print the full index stanza of each package"),
            ),
    );

    let app = app.subcommand(
        Command::new("delete")
            .about("Remove a package from a repository")
            .long_about(DELETE_ABOUT)
            .arg(
                Arg::new("arch")
                    .long("--arch")
                    .short('a')
                    .takes_value(true)
                    .required(true)
                    .help("Architecture to remove the package from"),
            )
            .arg(
                Arg::new("versions")
                    .long("--versions")
                    .takes_value(true)
                    .multiple_values(true)
                    .help("Versions of the package to remove"),
            )
            .arg(
                Arg::new("package")
                    .required(true)
                    .help("Name of the package to remove"),
            ),
    );

    let app = app.subcommand(
        Command::new("verify")
            .about("Verify that indexed packages exist")
            .long_about(VERIFY_ABOUT)
            .arg(
                Arg::new("fix-manifests")
                    .long("--fix-manifests")
                    .help("Remove packages with missing files from the index"),
            ),
    );

    let app = app.subcommand(
        Command::new("mirror")
            .about("Mirror an upstream repository")
            .long_about(MIRROR_ABOUT)
            .arg(
                Arg::new("cache-dir")
                    .long("--cache-dir")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .help("Directory to download upstream packages into"),
            )
            .arg(
                Arg::new("url")
                    .required(true)
                    .help("Base URL of the upstream repository"),
            ),
    );

    let app = app.subcommand(
        Command::new("unlock")
            .about("Forcibly remove the repository lock")
            .long_about(UNLOCK_ABOUT)
            .arg(
                Arg::new("arch")
                    .long("--arch")
                    .short('a')
                    .takes_value(true)
                    .help("Remove the lock of an architecture specific upload"),
            ),
    );

    app.subcommand(Command::new("config").about("Print documentation about repository configuration"))
}

pub async fn run_cli() -> Result<()> {
    let mut app = app();
    let matches = app.clone().get_matches();

    let log_level = if matches.is_present("quiet") {
        LevelFilter::Error
    } else {
        match matches.occurrences_of("verbose") {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    // This spews unwanted output at default level. Nerf it by default.
    if log_level == LevelFilter::Info {
        builder.filter_module("rustls", LevelFilter::Error);
    }

    builder.init();

    match matches.subcommand() {
        Some(("upload", args)) => command_upload(args).await,
        Some(("list", args)) => command_list(args).await,
        Some(("delete", args)) => command_delete(args).await,
        Some(("verify", args)) => command_verify(args).await,
        Some(("mirror", args)) => command_mirror(args).await,
        Some(("unlock", args)) => command_unlock(args).await,
        Some(("config", _)) => {
            println!("{}", CONFIG_ABOUT);
            Ok(())
        }
        Some((command, _)) => Err(DebS3ToolError::InvalidSubCommand(command.to_string())),
        None => {
            app.print_help()?;
            Ok(())
        }
    }
}

/// Resolve repository configuration from `--config` and flag overrides.
fn repository_config(args: &ArgMatches) -> Result<RepositoryConfig> {
    let mut config = if let Some(path) = args.value_of_os("config") {
        let f = std::fs::File::open(path)?;
        serde_yaml::from_reader(f)?
    } else {
        RepositoryConfig::default()
    };

    let string = |name: &str| args.value_of(name).map(|x| x.to_string());

    if let Some(v) = string("bucket") {
        config.bucket = Some(v);
    }
    if let Some(v) = string("prefix") {
        config.prefix = Some(v);
    }
    if let Some(v) = string("region") {
        config.region = Some(v);
    }
    if let Some(v) = string("endpoint") {
        config.endpoint = Some(v);
    }
    if let Some(v) = args.value_of("visibility") {
        config.visibility = v.parse::<Visibility>()?;
    }
    if args.is_present("encryption") {
        config.encryption = true;
    }
    if let Some(v) = string("cache-control") {
        config.cache_control = Some(v);
    }
    if args.is_present("sign") {
        config.sign = Some(string("sign").unwrap_or_default());
    }
    if let Some(v) = string("gpg-options") {
        config.gpg_options = Some(v);
    }
    if let Some(v) = string("origin") {
        config.origin = Some(v);
    }
    if let Some(v) = string("suite") {
        config.suite = Some(v);
    }
    if let Some(v) = string("codename") {
        config.codename = v;
    }
    if let Some(v) = string("component") {
        config.component = v;
    }
    if args.is_present("lock") {
        config.lock = true;
    }
    if args.is_present("fail-if-exists") {
        config.fail_if_exists = true;
    }
    if args.is_present("skip-package-upload") {
        config.skip_package_upload = true;
    }
    if args.is_present("no-preserve-versions") {
        config.preserve_versions = false;
    }
    if args.is_present("no-by-hash") {
        config.by_hash = false;
    }

    if config.codename.is_empty() || config.component.is_empty() {
        return Err(DebS3ToolError::InvalidArguments(
            "codename and component must not be empty".to_string(),
        ));
    }

    Ok(config)
}

fn object_store(args: &ArgMatches, config: &RepositoryConfig) -> Result<Box<dyn ObjectStore>> {
    if let Some(path) = args.value_of_os("filesystem") {
        return Ok(Box::new(FilesystemObjectStore::new(path)));
    }

    if config.bucket.is_none() {
        return Err(DebS3ToolError::InvalidArguments(
            "a bucket must be specified via --bucket or the config file".to_string(),
        ));
    }

    let credentials = match (
        args.value_of("access-key-id"),
        args.value_of("secret-access-key"),
    ) {
        (Some(access_key_id), Some(secret_access_key)) => Some(S3Credentials {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token: args.value_of("session-token").map(|x| x.to_string()),
        }),
        _ => None,
    };

    Ok(Box::new(S3ObjectStore::from_config(config, credentials)?))
}

fn release_signer(config: &RepositoryConfig) -> Option<GpgSigner> {
    config
        .sign
        .as_deref()
        .map(|key| GpgSigner::new(Some(key), config.gpg_arguments()))
}

fn progress_cb() -> Option<impl Fn(PublishEvent)> {
    Some(|event: PublishEvent| info!("   -- {}", event))
}

fn print_package_rows(rows: &[(String, Package)]) {
    for (arch, package) in rows {
        println!(
            "{:<30} {:<20} {}",
            package.name,
            package.full_version().unwrap_or_default(),
            arch
        );
    }
}

async fn command_upload(args: &ArgMatches) -> Result<()> {
    let config = repository_config(args)?;
    let store = object_store(args, &config)?;
    let signer = release_signer(&config);

    let files = args
        .values_of_os("files")
        .expect("files argument is required");

    let mut packages = vec![];
    for path in files {
        info!("examining package file {}", PathBuf::from(path).display());
        packages.push(Package::parse_file(path)?);
    }

    let publisher = Publisher::new(store.as_ref(), &config)
        .signer(signer.as_ref().map(|s| s as &dyn ReleaseSigner));

    let added = publisher
        .upload(packages, args.value_of("arch"), &progress_cb())
        .await?;

    info!("uploaded {} package(s)", added.len());

    Ok(())
}

async fn command_list(args: &ArgMatches) -> Result<()> {
    let config = repository_config(args)?;
    let store = object_store(args, &config)?;
    let publisher = Publisher::new(store.as_ref(), &config);

    let rows = publisher.list(args.value_of("arch")).await?;

    if args.is_present("long") {
        for (_, package) in &rows {
            println!("{}", package.generate(Some(&config.codename)));
        }
    } else {
        print_package_rows(&rows);
    }

    Ok(())
}

async fn command_delete(args: &ArgMatches) -> Result<()> {
    let config = repository_config(args)?;
    let store = object_store(args, &config)?;
    let signer = release_signer(&config);

    let name = args
        .value_of("package")
        .expect("package argument is required");
    let arch = args.value_of("arch").expect("arch argument is required");
    let versions = args
        .values_of("versions")
        .map(|values| values.map(|x| x.to_string()).collect::<Vec<_>>());

    let publisher = Publisher::new(store.as_ref(), &config)
        .signer(signer.as_ref().map(|s| s as &dyn ReleaseSigner));

    let removed = publisher
        .delete(name, versions.as_deref(), arch, &progress_cb())
        .await?;

    if removed.is_empty() {
        return Err(DebS3ToolError::NothingDeleted(match versions {
            Some(versions) => format!("{} versions {}", name, versions.join(", ")),
            None => name.to_string(),
        }));
    }

    print_package_rows(&removed);

    Ok(())
}

async fn command_verify(args: &ArgMatches) -> Result<()> {
    let config = repository_config(args)?;
    let store = object_store(args, &config)?;
    let signer = release_signer(&config);
    let fix = args.is_present("fix-manifests");

    let publisher = Publisher::new(store.as_ref(), &config)
        .signer(signer.as_ref().map(|s| s as &dyn ReleaseSigner));

    let missing = publisher.verify(fix, &progress_cb()).await?;

    if missing.is_empty() {
        info!("all indexed packages are present");
    } else {
        print_package_rows(&missing);

        if fix {
            info!("removed {} missing package(s) from the index", missing.len());
        } else {
            warn!(
                "{} package(s) are missing; run with --fix-manifests to remove them",
                missing.len()
            );
        }
    }

    Ok(())
}

async fn command_mirror(args: &ArgMatches) -> Result<()> {
    let config = repository_config(args)?;
    let store = object_store(args, &config)?;
    let signer = release_signer(&config);

    let url = args.value_of("url").expect("url argument is required");
    let cache_dir = args
        .value_of_os("cache-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("deb-s3-mirror"));

    info!("caching upstream packages in {}", cache_dir.display());
    let source = HttpMirror::new(url, &cache_dir)?.retry_policy(config.retry.clone());

    let publisher = Publisher::new(store.as_ref(), &config)
        .signer(signer.as_ref().map(|s| s as &dyn ReleaseSigner));

    let added = publisher.mirror(&source, &progress_cb()).await?;
    info!("mirrored {} package(s)", added.len());

    Ok(())
}

async fn command_unlock(args: &ArgMatches) -> Result<()> {
    let config = repository_config(args)?;
    let store = object_store(args, &config)?;
    let publisher = Publisher::new(store.as_ref(), &config);

    match publisher.unlock(args.value_of("arch")).await? {
        Some(lock) => info!("removed lock held by {}", lock.holder()),
        None => info!("repository was not locked"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subcommand_args(argv: &[&str]) -> ArgMatches {
        let matches = app().try_get_matches_from(argv).unwrap();
        matches.subcommand().unwrap().1.clone()
    }

    #[test]
    fn flag_overrides() -> Result<()> {
        let args = subcommand_args(&[
            "deb-s3",
            "list",
            "--bucket",
            "packages",
            "-c",
            "jammy",
            "--lock",
            "--sign",
            "--visibility",
            "private",
            "--no-by-hash",
        ]);

        let config = repository_config(&args)?;
        assert_eq!(config.bucket.as_deref(), Some("packages"));
        assert_eq!(config.codename, "jammy");
        assert_eq!(config.component, "main");
        assert!(config.lock);
        assert_eq!(config.sign.as_deref(), Some(""));
        assert_eq!(config.visibility, Visibility::Private);
        assert!(!config.by_hash);
        assert!(config.preserve_versions);

        Ok(())
    }

    #[test]
    fn yaml_config() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("repo.yaml");
        std::fs::write(
            &path,
            "bucket: from-yaml\ncomponent: contrib\nlock_wait:\n  max_attempts: null\n",
        )?;

        let path = path.display().to_string();
        let args = subcommand_args(&["deb-s3", "--config", &path, "verify", "-m", "non-free"]);
        let config = repository_config(&args)?;
        assert_eq!(config.bucket.as_deref(), Some("from-yaml"));
        assert_eq!(config.component, "non-free");
        assert_eq!(config.lock_wait.max_attempts, None);
        assert_eq!(config.lock_wait.initial_interval_ms, 100);

        Ok(())
    }

    #[test]
    fn unknown_config_key_rejected() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("repo.yaml");
        std::fs::write(&path, "buckets: typo\n")?;

        let path = path.display().to_string();
        let args = subcommand_args(&["deb-s3", "--config", &path, "list"]);
        assert!(matches!(
            repository_config(&args),
            Err(DebS3ToolError::SerdeYaml(_))
        ));

        Ok(())
    }

    #[test]
    fn filesystem_store() -> Result<()> {
        let args = subcommand_args(&["deb-s3", "unlock", "--filesystem", "/tmp/repo"]);
        let config = repository_config(&args)?;
        assert!(object_store(&args, &config).is_ok());

        let args = subcommand_args(&["deb-s3", "unlock"]);
        let config = repository_config(&args)?;
        assert!(matches!(
            object_store(&args, &config),
            Err(DebS3ToolError::InvalidArguments(_))
        ));

        Ok(())
    }
}
