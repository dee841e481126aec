//! HTTP object storage: objects are addressed as
//! `{endpoint}/{bucket}/{prefix}{key}` and written with PUT. A listing is
//! `GET {endpoint}/{bucket}?prefix=...` returning a JSON array of keys.

use super::{ArtifactPair, Destination, RemoteRef};
use crate::config::{DestinationConfig, DestinationKind};
use crate::manifest::Manifest;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub struct HttpObjectDestination {
    id: String,
    client: Client,
    endpoint: String,
    bucket: String,
    prefix: String,
    token: Option<String>,
}

impl HttpObjectDestination {
    pub fn from_config(dest: &DestinationConfig, timeout_secs: u64) -> Result<Self> {
        let endpoint = dest.require(&dest.endpoint, "endpoint")?;
        let bucket = dest.require(&dest.bucket, "bucket")?;
        let token = dest.credential.as_ref().map(|c| c.resolve()).transpose()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            id: dest.id.clone(),
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.clone(),
            prefix: dest.prefix.clone().unwrap_or_default(),
            token,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}{}", self.endpoint, self.bucket, self.prefix, key)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();
        let request = self
            .client
            .put(self.object_url(key))
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(Body::wrap_stream(ReaderStream::new(file)));
        check(self.authorized(request).send().await?, key)?;
        Ok(())
    }

    async fn download(&self, key: &str, local: &Path) -> Result<()> {
        let request = self.client.get(self.object_url(key));
        let mut response = check(self.authorized(request).send().await?, key)?;
        let mut out = tokio::fs::File::create(local).await?;
        while let Some(chunk) = response.chunk().await? {
            out.write_all(&chunk).await?;
        }
        out.sync_all().await?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let request = self.client.get(self.object_url(key));
        let response = check(self.authorized(request).send().await?, key)?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let request = self.client.delete(self.object_url(key));
        let response = self.authorized(request).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response, key)?;
        Ok(())
    }
}

/// Server errors and throttling are retried; other failures are final.
fn classify(status: StatusCode, key: &str) -> Option<EngineError> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(EngineError::Network(format!("{}: HTTP {}", key, status)))
    } else {
        Some(EngineError::Storage(format!("{}: HTTP {}", key, status)))
    }
}

fn check(response: Response, key: &str) -> Result<Response> {
    match classify(response.status(), key) {
        Some(err) => Err(err),
        None => Ok(response),
    }
}

#[async_trait]
impl Destination for HttpObjectDestination {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::HttpObject
    }

    async fn put(&self, pair: &ArtifactPair) -> Result<RemoteRef> {
        let remote = RemoteRef::new(&self.id, &pair.manifest);
        self.upload(&pair.archive_path, &remote.archive_key()).await?;
        if let Err(e) = self.upload(&pair.manifest_path, &remote.manifest_key()).await {
            let _ = self.remove(&remote.archive_key()).await;
            return Err(e);
        }
        debug!(destination = %self.id, manifest_id = %remote.manifest_id, "Pair uploaded to object storage");
        Ok(remote)
    }

    async fn list(&self) -> Result<Vec<RemoteRef>> {
        let url = format!("{}/{}", self.endpoint, self.bucket);
        let request = self.client.get(url).query(&[("prefix", self.prefix.as_str())]);
        let keys: Vec<String> = check(self.authorized(request).send().await?, &self.bucket)?
            .json()
            .await?;

        let mut refs: Vec<RemoteRef> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(self.prefix.as_str()))
            .filter_map(|key| RemoteRef::from_manifest_key(&self.id, key))
            .collect();
        refs.sort_by(|a, b| a.manifest_id.cmp(&b.manifest_id));
        Ok(refs)
    }

    async fn get(&self, remote: &RemoteRef, local_dir: &Path) -> Result<ArtifactPair> {
        tokio::fs::create_dir_all(local_dir).await?;
        let archive_path = local_dir.join(Manifest::archive_file_name(&remote.manifest_id));
        let manifest_path = local_dir.join(Manifest::manifest_file_name(&remote.manifest_id));

        self.download(&remote.manifest_key(), &manifest_path).await?;
        self.download(&remote.archive_key(), &archive_path).await?;
        let manifest = Manifest::from_slice(&tokio::fs::read(&manifest_path).await?)?;

        Ok(ArtifactPair {
            manifest,
            archive_path,
            manifest_path,
        })
    }

    async fn get_manifest(&self, remote: &RemoteRef) -> Result<Manifest> {
        Manifest::from_slice(&self.read(&remote.manifest_key()).await?)
    }

    async fn delete(&self, remote: &RemoteRef) -> Result<()> {
        self.remove(&remote.manifest_key()).await?;
        self.remove(&remote.archive_key()).await
    }
}
