use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use openssh::{KnownHosts, SessionBuilder};
use saas_core::crd::{S3Options, SshOptions};
use tempfile::NamedTempFile;

use crate::redis::Connector;

/// The default SSH port.
const DEFAULT_SSH_PORT: u16 = 22;

/// Remote command execution on the hosts of the Redis servers.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Execute the given command on the given host, returning its stdout.
    ///
    /// A command exiting with a non-zero status is an error.
    async fn exec(&self, host: &str, command: &str) -> Result<Vec<u8>>;
}

/// Storage of backup artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the given object under the given key, returning its location.
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String>;
}

/// The backends used to run a backup.
#[derive(Clone)]
pub struct BackupBackends {
    pub redis: Arc<dyn Connector>,
    pub shell: Arc<dyn RemoteShell>,
    pub store: Arc<dyn ObjectStore>,
}

/// A shell executing commands over SSH with public key authentication.
pub struct SshShell {
    user: String,
    port: u16,
    /// The private key, kept on disk for the lifetime of the shell.
    key_file: NamedTempFile,
    connect_timeout: Duration,
}

impl SshShell {
    /// Create a new instance, writing the given private key to a temp file only readable by its owner.
    pub fn new(options: &SshOptions, private_key: &[u8], connect_timeout: Duration) -> Result<Self> {
        let mut key_file = NamedTempFile::new().context("error creating private key file")?;
        key_file.write_all(private_key).context("error writing private key file")?;
        key_file.flush().context("error writing private key file")?;
        Ok(Self {
            user: options.user.clone(),
            port: options.port.unwrap_or(DEFAULT_SSH_PORT),
            key_file,
            connect_timeout,
        })
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn exec(&self, host: &str, command: &str) -> Result<Vec<u8>> {
        let session = SessionBuilder::default()
            .user(self.user.clone())
            .port(self.port)
            .keyfile(self.key_file.path())
            .known_hosts_check(KnownHosts::Accept)
            .connect_timeout(self.connect_timeout)
            .connect(host)
            .await
            .with_context(|| format!("error opening ssh session to {}", host))?;
        let output = session.raw_command(command).output().await;
        if let Err(err) = session.close().await {
            tracing::warn!(error = ?err, host, "error closing ssh session");
        }
        let output = output.with_context(|| format!("error executing remote command on {}", host))?;
        if !output.status.success() {
            bail!(
                "remote command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

/// An S3 compatible object store.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    /// Create a new instance with static credentials.
    ///
    /// When a custom endpoint is set, path style addressing is used.
    pub fn new(options: &S3Options, access_key_id: &str, secret_access_key: &str) -> Self {
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, saas_core::OPERATOR_NAME);
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(options.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = options.service_endpoint.as_ref() {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: options.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[tracing::instrument(level = "debug", skip(self, body), fields(bucket = %self.bucket, size = body.len()))]
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("error uploading s3://{}/{}", self.bucket, key))?;
        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}
