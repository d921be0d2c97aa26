// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! S3 backed object store. */

use {
    crate::{
        config::{RepositoryConfig, RetryPolicy, Visibility},
        error::{DebS3Error, Result},
        store::{ObjectMetadata, ObjectStore, PutOptions},
    },
    async_trait::async_trait,
    log::warn,
    rusoto_core::{
        credential::{ChainProvider, StaticProvider},
        request::HttpClient,
        ByteStream, Client, Region, RusotoError,
    },
    rusoto_s3::{
        DeleteObjectRequest, GetObjectError, GetObjectRequest, HeadObjectError,
        HeadObjectRequest, PutObjectRequest, S3Client, S3,
    },
    std::{collections::HashMap, future::Future},
    tokio::io::AsyncReadExt,
};

/// Explicit AWS credentials.
#[derive(Clone, Debug)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// An [ObjectStore] backed by an S3 bucket.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    key_prefix: Option<String>,
    visibility: Visibility,
    encryption: bool,
    retry: RetryPolicy,
}

impl S3ObjectStore {
    /// Create a new store bound to a named bucket with optional key prefix.
    ///
    /// This will construct a default AWS [Client].
    pub fn new(region: Region, bucket: impl ToString, key_prefix: Option<&str>) -> Self {
        Self::new_with_client(Client::shared(), region, bucket, key_prefix)
    }

    /// Create a new store with an explicit AWS [Client].
    pub fn new_with_client(
        client: Client,
        region: Region,
        bucket: impl ToString,
        key_prefix: Option<&str>,
    ) -> Self {
        Self {
            client: S3Client::new_with_client(client, region),
            bucket: bucket.to_string(),
            key_prefix: key_prefix
                .map(|x| x.trim_matches('/').to_string())
                .filter(|x| !x.is_empty()),
            visibility: Visibility::default(),
            encryption: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Create a store from repository configuration.
    ///
    /// Credentials are resolved from the environment and AWS configuration files
    /// unless given explicitly.
    pub fn from_config(
        config: &RepositoryConfig,
        credentials: Option<S3Credentials>,
    ) -> Result<Self> {
        let bucket = config
            .bucket
            .as_deref()
            .ok_or_else(|| DebS3Error::Other("no S3 bucket configured".to_string()))?;

        let region_name = config.region.clone().unwrap_or_else(|| "us-east-1".to_string());
        let region = if let Some(endpoint) = &config.endpoint {
            Region::Custom {
                name: region_name,
                endpoint: endpoint.clone(),
            }
        } else {
            region_name
                .parse::<Region>()
                .map_err(|e| DebS3Error::Other(format!("invalid AWS region: {}", e)))?
        };

        let dispatcher = HttpClient::new()
            .map_err(|e| DebS3Error::Other(format!("error creating HTTP client: {}", e)))?;

        let client = if let Some(credentials) = credentials {
            Client::new_with(
                StaticProvider::new(
                    credentials.access_key_id,
                    credentials.secret_access_key,
                    credentials.session_token,
                    None,
                ),
                dispatcher,
            )
        } else {
            Client::new_with(ChainProvider::new(), dispatcher)
        };

        Ok(
            Self::new_with_client(client, region, bucket, config.prefix.as_deref())
                .visibility(config.visibility)
                .encryption(config.encryption)
                .retry_policy(config.retry.clone()),
        )
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn encryption(mut self, encryption: bool) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Compute the S3 key name given a repository relative path.
    pub fn path_to_key(&self, path: &str) -> String {
        if let Some(prefix) = &self.key_prefix {
            format!("{}/{}", prefix, path.trim_matches('/'))
        } else {
            path.trim_matches('/').to_string()
        }
    }

    /// Run a request, retrying transient failures.
    async fn with_retries<T, E, F, Fut>(
        &self,
        path: &str,
        mut request: F,
    ) -> std::result::Result<T, RusotoError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, RusotoError<E>>> + Send,
        T: Send,
        E: Send,
    {
        let mut attempt = 1;

        loop {
            match request().await {
                Err(e) if is_transient(&e) && self.retry.should_retry(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "transient S3 error on {} (attempt {}); retrying in {:?}",
                        path, attempt, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                res => return res,
            }
        }
    }
}

fn is_transient<E>(e: &RusotoError<E>) -> bool {
    match e {
        RusotoError::HttpDispatch(_) => true,
        RusotoError::Unknown(response) => {
            response.status.is_server_error() || response.status.as_u16() == 429
        }
        _ => false,
    }
}

fn is_not_found<E>(e: &RusotoError<E>) -> bool {
    matches!(e, RusotoError::Unknown(response) if response.status.as_u16() == 404)
}

fn s3_error<E: std::fmt::Debug>(path: &str, e: RusotoError<E>) -> DebS3Error {
    DebS3Error::RepositoryIoPath(
        path.to_string(),
        std::io::Error::new(std::io::ErrorKind::Other, format!("S3 error: {:?}", e)),
    )
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head_object(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        let key = self.path_to_key(path);

        let res = self
            .with_retries(path, || {
                self.client.head_object(HeadObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.clone(),
                    ..Default::default()
                })
            })
            .await;

        match res {
            Ok(output) => Ok(Some(ObjectMetadata {
                size: output.content_length.map(|x| x as u64),
                etag: output.e_tag.map(|x| x.trim_matches('"').to_string()),
                md5: output.metadata.and_then(|mut m| m.remove("md5")),
                content_type: output.content_type,
                cache_control: output.cache_control,
            })),
            Err(RusotoError::Service(HeadObjectError::NoSuchKey(_))) => Ok(None),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(s3_error(path, e)),
        }
    }

    async fn get_object(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let key = self.path_to_key(path);

        let res = self
            .with_retries(path, || {
                self.client.get_object(GetObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.clone(),
                    ..Default::default()
                })
            })
            .await;

        match res {
            Ok(output) => {
                let mut data = vec![];

                if let Some(body) = output.body {
                    body.into_async_read()
                        .read_to_end(&mut data)
                        .await
                        .map_err(|e| DebS3Error::RepositoryIoPath(path.to_string(), e))?;
                }

                Ok(Some(data))
            }
            Err(RusotoError::Service(GetObjectError::NoSuchKey(_))) => Ok(None),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(s3_error(path, e)),
        }
    }

    async fn put_object(&self, path: &str, content: &[u8], options: &PutOptions<'_>) -> Result<()> {
        let key = self.path_to_key(path);

        let res = self
            .with_retries(path, || {
                self.client.put_object(PutObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.clone(),
                    body: Some(ByteStream::from(content.to_vec())),
                    acl: Some(self.visibility.canned_acl().to_string()),
                    content_type: Some(options.content_type.to_string()),
                    cache_control: options.cache_control.map(|x| x.to_string()),
                    metadata: Some(HashMap::from([(
                        "md5".to_string(),
                        options.md5.to_string(),
                    )])),
                    server_side_encryption: if self.encryption {
                        Some("AES256".to_string())
                    } else {
                        None
                    },
                    ..Default::default()
                })
            })
            .await;

        res.map(|_| ()).map_err(|e| s3_error(path, e))
    }

    async fn delete_object(&self, path: &str) -> Result<()> {
        let key = self.path_to_key(path);

        let res = self
            .with_retries(path, || {
                self.client.delete_object(DeleteObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.clone(),
                    ..Default::default()
                })
            })
            .await;

        res.map(|_| ()).map_err(|e| s3_error(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefixes() {
        let store = S3ObjectStore::new(Region::UsEast1, "bucket", Some("/debian/"));
        assert_eq!(
            store.path_to_key("dists/stable/Release"),
            "debian/dists/stable/Release"
        );

        let store = S3ObjectStore::new(Region::UsEast1, "bucket", Some(""));
        assert_eq!(store.path_to_key("/pool/a.deb"), "pool/a.deb");
    }

    #[test]
    fn from_config_requires_bucket() {
        assert!(S3ObjectStore::from_config(&RepositoryConfig::default(), None).is_err());
    }
}
