// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Cross-process publish lock.

Publishers coordinate through a sentinel object in the store. Holding the
lock means having written the sentinel. Object stores lack an atomic
create-if-absent, so [ObjectStoreLock] is advisory: two publishers racing
between the existence check and the write can both believe they won, and the
read-back after writing only narrows that window. The [RepositoryLock] trait
allows substituting a stronger implementation.
*/

use {
    crate::{
        config::LockWaitPolicy,
        error::{DebS3Error, Result},
        store::{ObjectStore, StoreOptions, CONTENT_TYPE_TEXT},
    },
    async_trait::async_trait,
    log::{info, warn},
};

/// Resolve the `(user, host)` identity of this process.
///
/// The user comes from `$USER`, then `$USERNAME`, then `unknown`. The host is
/// the first non-empty value of `$HOSTNAME`, `gethostname(2)` on Unix,
/// `/etc/hostname`, and finally `localhost`.
pub fn local_identity() -> (String, String) {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let host = std::env::var("HOSTNAME")
        .ok()
        .and_then(non_empty)
        .or_else(system_hostname)
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .and_then(non_empty)
        })
        .unwrap_or_else(|| "localhost".to_string());

    (user, host)
}

fn non_empty(s: String) -> Option<String> {
    let s = s.trim();

    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];

    // gethostname() may not NUL terminate a truncated name.
    let res = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() - 1) };
    if res != 0 {
        return None;
    }

    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());

    std::str::from_utf8(&buf[..len])
        .ok()
        .map(|x| x.to_string())
        .and_then(non_empty)
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    None
}

/// The holder of a lock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lock {
    pub user: String,
    pub host: String,
    /// Token distinguishing lock acquisitions by the same holder.
    pub nonce: Option<String>,
}

impl Lock {
    /// Construct a lock for this process with a fresh nonce.
    pub fn generate() -> Self {
        let (user, host) = local_identity();

        Self {
            user,
            host,
            nonce: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Parse sentinel content.
    ///
    /// The first line is `user@host`. The optional second line is the nonce.
    pub fn parse(content: &str) -> Self {
        let mut lines = content.lines();
        let identity = lines.next().unwrap_or_default().trim();

        let (user, host) = match identity.split_once('@') {
            Some((user, host)) => (user.to_string(), host.to_string()),
            None => (identity.to_string(), String::new()),
        };

        Self {
            user,
            host,
            nonce: lines
                .next()
                .map(|x| x.trim().to_string())
                .filter(|x| !x.is_empty()),
        }
    }

    /// `user@host`.
    pub fn holder(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Sentinel content representing this lock.
    pub fn content(&self) -> String {
        match &self.nonce {
            Some(nonce) => format!("{}\n{}", self.holder(), nonce),
            None => self.holder(),
        }
    }
}

/// What a lock protects.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LockTarget {
    pub codename: String,
    pub component: Option<String>,
    pub architecture: Option<String>,
    /// `Cache-Control` applied to the sentinel.
    pub cache_control: Option<String>,
}

impl LockTarget {
    pub fn new(codename: impl ToString) -> Self {
        Self {
            codename: codename.to_string(),
            ..Default::default()
        }
    }

    pub fn component(mut self, component: Option<&str>) -> Self {
        self.component = component.map(|x| x.to_string());
        self
    }

    pub fn architecture(mut self, architecture: Option<&str>) -> Self {
        self.architecture = architecture.map(|x| x.to_string());
        self
    }

    pub fn cache_control(mut self, cache_control: Option<&str>) -> Self {
        self.cache_control = cache_control.map(|x| x.to_string());
        self
    }

    /// Repository path of the sentinel object.
    pub fn path(&self) -> String {
        let mut path = format!("dists/{}", self.codename);
        if let Some(component) = &self.component {
            path.push('/');
            path.push_str(component);
        }
        if let Some(arch) = &self.architecture {
            path.push_str("/binary-");
            path.push_str(arch);
        }
        path.push_str("/lockfile");

        path
    }
}

/// Mutual exclusion between repository publishers.
#[async_trait]
pub trait RepositoryLock: Send + Sync {
    /// Whether the target is currently locked.
    async fn locked(&self, target: &LockTarget) -> Result<bool>;

    /// Obtain the current holder of the lock.
    async fn current(&self, target: &LockTarget) -> Result<Lock>;

    /// Take the lock.
    ///
    /// Fails with [DebS3Error::LockHeld] if another holder has it.
    async fn lock(&self, target: &LockTarget) -> Result<Lock>;

    /// Release the lock, regardless of who holds it.
    async fn unlock(&self, target: &LockTarget) -> Result<()>;

    /// Wait until the target is no longer locked.
    ///
    /// This does not take the lock.
    async fn wait_for_lock(&self, target: &LockTarget, policy: &LockWaitPolicy) -> Result<()>;

    /// Wait for the lock to be free, then take it.
    async fn acquire(&self, target: &LockTarget, policy: &LockWaitPolicy) -> Result<Lock> {
        let mut attempt = 1;

        loop {
            self.wait_for_lock(target, policy).await?;

            match self.lock(target).await {
                Ok(lock) => return Ok(lock),
                Err(DebS3Error::LockHeld(holder)) => {
                    if !policy.should_retry(attempt) {
                        return Err(DebS3Error::LockTimeout(holder));
                    }
                    info!("lock was taken by {} first; waiting again", holder);
                    tokio::time::sleep(policy.interval(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A [RepositoryLock] implemented as a sentinel object in an [ObjectStore].
pub struct ObjectStoreLock<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> ObjectStoreLock<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    async fn holder(&self, path: &str) -> String {
        match self.store.read(path).await {
            Ok(Some(data)) => Lock::parse(&String::from_utf8_lossy(&data)).holder(),
            _ => "unknown".to_string(),
        }
    }
}

#[async_trait]
impl<'a> RepositoryLock for ObjectStoreLock<'a> {
    async fn locked(&self, target: &LockTarget) -> Result<bool> {
        Ok(self.store.exists(&target.path()).await?.is_some())
    }

    async fn current(&self, target: &LockTarget) -> Result<Lock> {
        let data = self
            .store
            .read(&target.path())
            .await?
            .ok_or(DebS3Error::LockNotHeld)?;

        Ok(Lock::parse(&String::from_utf8_lossy(&data)))
    }

    async fn lock(&self, target: &LockTarget) -> Result<Lock> {
        let path = target.path();

        if self.store.exists(&path).await?.is_some() {
            return Err(DebS3Error::LockHeld(self.holder(&path).await));
        }

        let lock = Lock::generate();
        let content = lock.content();

        self.store
            .store(
                &path,
                content.as_bytes(),
                &StoreOptions::new(CONTENT_TYPE_TEXT)
                    .cache_control(target.cache_control.as_deref())
                    .fail_if_exists(true),
            )
            .await
            .map_err(|e| match e {
                DebS3Error::AlreadyExists(_) => DebS3Error::LockHeld("unknown".to_string()),
                e => e,
            })?;

        match self.store.read(&path).await? {
            Some(data) if data == content.as_bytes() => Ok(lock),
            Some(data) => Err(DebS3Error::LockHeld(
                Lock::parse(&String::from_utf8_lossy(&data)).holder(),
            )),
            None => Err(DebS3Error::LockNotHeld),
        }
    }

    async fn unlock(&self, target: &LockTarget) -> Result<()> {
        self.store.remove(&target.path()).await?;

        Ok(())
    }

    async fn wait_for_lock(&self, target: &LockTarget, policy: &LockWaitPolicy) -> Result<()> {
        let path = target.path();
        let mut attempt = 1;

        loop {
            match self.locked(target).await {
                Ok(false) => return Ok(()),
                Ok(true) => {
                    if attempt % 10 == 1 {
                        info!(
                            "repository is locked by {}; waiting",
                            self.holder(&path).await
                        );
                    }
                }
                Err(e) => warn!("error checking lock {}: {}", path, e),
            }

            if !policy.should_retry(attempt) {
                return Err(DebS3Error::LockTimeout(self.holder(&path).await));
            }

            tokio::time::sleep(policy.interval(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store::{MemoryObjectStore, ObjectMetadata, PutOptions},
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    /// Fails the first `head_failures` existence checks.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryObjectStore,
        head_failures: AtomicUsize,
    }

    impl FlakyStore {
        fn fail_heads(&self, count: usize) {
            self.head_failures.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn head_object(&self, path: &str) -> Result<Option<ObjectMetadata>> {
            let remaining = self.head_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.head_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DebS3Error::Other(format!("connection reset reading {}", path)));
            }

            self.inner.head_object(path).await
        }

        async fn get_object(&self, path: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get_object(path).await
        }

        async fn put_object(&self, path: &str, content: &[u8], options: &PutOptions<'_>) -> Result<()> {
            self.inner.put_object(path, content, options).await
        }

        async fn delete_object(&self, path: &str) -> Result<()> {
            self.inner.delete_object(path).await
        }
    }

    /// Another publisher overwrites every put before it can be read back.
    #[derive(Default)]
    struct RacingStore {
        inner: MemoryObjectStore,
    }

    #[async_trait]
    impl ObjectStore for RacingStore {
        async fn head_object(&self, path: &str) -> Result<Option<ObjectMetadata>> {
            self.inner.head_object(path).await
        }

        async fn get_object(&self, path: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get_object(path).await
        }

        async fn put_object(&self, path: &str, _content: &[u8], options: &PutOptions<'_>) -> Result<()> {
            self.inner
                .put_object(path, b"other@elsewhere\nfeedface", options)
                .await
        }

        async fn delete_object(&self, path: &str) -> Result<()> {
            self.inner.delete_object(path).await
        }
    }

    fn target() -> LockTarget {
        LockTarget::new("stable")
    }

    fn quick_policy(max_attempts: u32) -> LockWaitPolicy {
        LockWaitPolicy {
            initial_interval_ms: 1,
            max_interval_ms: 2,
            max_attempts: Some(max_attempts),
        }
    }

    #[test]
    fn target_paths() {
        assert_eq!(target().path(), "dists/stable/lockfile");
        assert_eq!(
            target()
                .component(Some("main"))
                .architecture(Some("amd64"))
                .path(),
            "dists/stable/main/binary-amd64/lockfile"
        );
        assert_eq!(
            target().architecture(Some("i386")).path(),
            "dists/stable/binary-i386/lockfile"
        );
    }

    #[test]
    fn parse_content() {
        let lock = Lock::parse("alex@localhost");
        assert_eq!(lock.user, "alex");
        assert_eq!(lock.host, "localhost");
        assert_eq!(lock.nonce, None);

        let lock = Lock::parse("foo@bar\nabcde\n");
        assert_eq!(lock.holder(), "foo@bar");
        assert_eq!(lock.nonce.as_deref(), Some("abcde"));
        assert_eq!(lock.content(), "foo@bar\nabcde");
    }

    #[tokio::test]
    async fn locked_reflects_sentinel() -> Result<()> {
        let store = MemoryObjectStore::default();
        let lock = ObjectStoreLock::new(&store);

        assert!(!lock.locked(&target()).await?);
        store.insert("dists/stable/lockfile", "foo@bar".as_bytes())?;
        assert!(lock.locked(&target()).await?);

        Ok(())
    }

    #[tokio::test]
    async fn current_holder() -> Result<()> {
        let store = MemoryObjectStore::default();
        let lock = ObjectStoreLock::new(&store);

        assert!(matches!(
            lock.current(&target()).await,
            Err(DebS3Error::LockNotHeld)
        ));

        store.insert("dists/stable/lockfile", "alex@localhost".as_bytes())?;
        let current = lock.current(&target()).await?;
        assert_eq!(current.user, "alex");
        assert_eq!(current.host, "localhost");

        Ok(())
    }

    #[tokio::test]
    async fn lock_stores_sentinel_once() -> Result<()> {
        let store = MemoryObjectStore::default();
        let lock = ObjectStoreLock::new(&store);
        let target = target().cache_control(Some("no-cache"));

        let held = lock.lock(&target).await?;
        assert_eq!(store.operations(), vec!["put dists/stable/lockfile"]);

        let object = store.object("dists/stable/lockfile").unwrap();
        assert_eq!(object.data, held.content().into_bytes());
        assert_eq!(object.cache_control.as_deref(), Some("no-cache"));
        assert!(held.nonce.is_some());
        assert_eq!(lock.current(&target).await?, held);

        Ok(())
    }

    #[tokio::test]
    async fn lock_refuses_existing_sentinel() -> Result<()> {
        let store = MemoryObjectStore::default();
        store.insert("dists/stable/lockfile", "foo@bar\nabcde".as_bytes())?;
        let lock = ObjectStoreLock::new(&store);

        match lock.lock(&target()).await {
            Err(DebS3Error::LockHeld(holder)) => assert_eq!(holder, "foo@bar"),
            res => panic!("unexpected result: {:?}", res),
        }
        assert!(store.operations().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn unlock_removes_sentinel() -> Result<()> {
        let store = MemoryObjectStore::default();
        let lock = ObjectStoreLock::new(&store);

        lock.lock(&target()).await?;
        lock.unlock(&target()).await?;
        assert!(!lock.locked(&target()).await?);
        assert_eq!(
            store.operations(),
            vec!["put dists/stable/lockfile", "delete dists/stable/lockfile"]
        );

        // Unlocking an unlocked target is fine.
        lock.unlock(&target()).await?;

        Ok(())
    }

    #[tokio::test]
    async fn wait_for_lock() -> Result<()> {
        let store = MemoryObjectStore::default();
        let lock = ObjectStoreLock::new(&store);

        lock.wait_for_lock(&target(), &quick_policy(1)).await?;

        store.insert("dists/stable/lockfile", "foo@bar".as_bytes())?;
        match lock.wait_for_lock(&target(), &quick_policy(3)).await {
            Err(DebS3Error::LockTimeout(holder)) => assert_eq!(holder, "foo@bar"),
            res => panic!("unexpected result: {:?}", res),
        }

        match lock.acquire(&target(), &quick_policy(2)).await {
            Err(DebS3Error::LockTimeout(_)) => {}
            res => panic!("unexpected result: {:?}", res),
        }

        lock.unlock(&target()).await?;
        let held = lock.acquire(&target(), &quick_policy(2)).await?;
        assert_eq!(lock.current(&target()).await?, held);

        Ok(())
    }

    #[tokio::test]
    async fn wait_for_lock_retries_store_errors() -> Result<()> {
        let store = FlakyStore::default();
        let lock = ObjectStoreLock::new(&store);

        store.fail_heads(3);
        lock.wait_for_lock(&target(), &quick_policy(10)).await?;
        assert_eq!(store.head_failures.load(Ordering::SeqCst), 0);

        // Errors count against the attempt budget.
        store.fail_heads(5);
        match lock.wait_for_lock(&target(), &quick_policy(2)).await {
            Err(DebS3Error::LockTimeout(holder)) => assert_eq!(holder, "unknown"),
            res => panic!("unexpected result: {:?}", res),
        }

        store.fail_heads(2);
        let held = lock.acquire(&target(), &quick_policy(10)).await?;
        assert_eq!(lock.current(&target()).await?, held);
        assert_eq!(store.inner.operations(), vec!["put dists/stable/lockfile"]);

        Ok(())
    }

    #[tokio::test]
    async fn lock_detects_foreign_write() -> Result<()> {
        let store = RacingStore::default();
        let lock = ObjectStoreLock::new(&store);

        match lock.lock(&target()).await {
            Err(DebS3Error::LockHeld(holder)) => assert_eq!(holder, "other@elsewhere"),
            res => panic!("unexpected result: {:?}", res),
        }
        assert_eq!(lock.current(&target()).await?.nonce.as_deref(), Some("feedface"));

        Ok(())
    }

    #[test]
    fn local_identity_host() {
        let (user, host) = local_identity();
        assert!(!user.is_empty());
        assert!(!host.is_empty());
        assert_eq!(host, host.trim());

        assert_eq!(non_empty(" build01\n".to_string()).as_deref(), Some("build01"));
        assert_eq!(non_empty(" \n".to_string()), None);
    }
}
