use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use object_store::ObjectStore;
use object_store::gcp::{GoogleCloudStorage, GoogleCloudStorageBuilder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{Attribute, Attributes, PutOptions, PutPayload};
use tracing::debug;

use comfyctl_process::Command;

use crate::SinkError;

/// The object-storage capability the sink needs.
///
/// One real implementation ([`GcsStore`]) and an in-memory double for tests;
/// nothing above this trait knows which is in play.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// The bucket this store writes into.
    fn bucket(&self) -> &str;

    /// Cheap existence/permission probe, run before the first upload.
    async fn verify_access(&self) -> Result<(), SinkError>;

    async fn put(&self, object: &str, bytes: Vec<u8>, content_type: &str)
    -> Result<(), SinkError>;

    /// Best-effort `allUsers:READER` grant.
    async fn grant_public_read(&self, object: &str) -> Result<(), SinkError>;

    async fn signed_url(&self, object: &str, ttl: Duration) -> Result<String, SinkError>;
}

/// Google Cloud Storage implementation.
pub struct GcsStore {
    bucket: String,
    store: GoogleCloudStorage,
}

impl GcsStore {
    /// Connect using `GOOGLE_APPLICATION_CREDENTIALS`, which must point at a
    /// readable service-account file.
    pub fn connect(bucket: &str) -> Result<Self, SinkError> {
        let credentials =
            std::env::var("GOOGLE_APPLICATION_CREDENTIALS").map_err(|_| SinkError::Auth)?;
        if fs_err::metadata(&credentials).is_err() {
            return Err(SinkError::Auth);
        }
        let store = GoogleCloudStorageBuilder::new()
            .with_bucket_name(bucket)
            .with_service_account_path(&credentials)
            .build()?;
        Ok(Self {
            bucket: bucket.to_string(),
            store,
        })
    }
}

#[async_trait]
impl ArtifactStore for GcsStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn verify_access(&self) -> Result<(), SinkError> {
        // A bounded list doubles as the bucket-exists and read-permission
        // probe; object storage has no cheaper call through this client.
        self.store
            .list_with_delimiter(None)
            .await
            .map_err(|err| SinkError::Validate(err.to_string()))?;
        debug!("bucket {} is reachable", self.bucket);
        Ok(())
    }

    async fn put(
        &self,
        object: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), SinkError> {
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let mut options = PutOptions::default();
        options.attributes = attributes;
        self.store
            .put_opts(&ObjectPath::from(object), PutPayload::from(bytes), options)
            .await?;
        Ok(())
    }

    async fn grant_public_read(&self, object: &str) -> Result<(), SinkError> {
        // The storage client exposes no ACL surface; `gsutil` does, and it is
        // already the tool of record for `gs://` sources.
        let Ok(gsutil) = which::which("gsutil") else {
            return Err(SinkError::Acl("gsutil not found on PATH".to_string()));
        };
        let target = format!("gs://{}/{object}", self.bucket);
        let output = Command::new(gsutil)
            .args(["-q", "acl", "ch", "-u", "AllUsers:R"])
            .arg(&target)
            .output()
            .await;
        if !output.success() {
            return Err(SinkError::Acl(output.stderr));
        }
        Ok(())
    }

    async fn signed_url(&self, object: &str, ttl: Duration) -> Result<String, SinkError> {
        let url = self
            .store
            .signed_url(http::Method::GET, &ObjectPath::from(object), ttl)
            .await?;
        Ok(url.to_string())
    }
}

/// In-memory double used by tests and the handler's dry paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bucket: String,
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    public: Mutex<Vec<String>>,
    /// Number of leading `put` calls to fail, for retry tests.
    failures: Mutex<u32>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Fail the first `count` uploads with a transient error.
    #[must_use]
    pub fn failing(self, count: u32) -> Self {
        *self.failures.lock().unwrap() = count;
        self
    }

    pub fn object(&self, name: &str) -> Option<(Vec<u8>, String)> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn public_objects(&self) -> Vec<String> {
        self.public.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn verify_access(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn put(
        &self,
        object: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), SinkError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SinkError::Validate("injected transient failure".to_string()));
            }
        }
        self.objects
            .lock()
            .unwrap()
            .insert(object.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn grant_public_read(&self, object: &str) -> Result<(), SinkError> {
        self.public.lock().unwrap().push(object.to_string());
        Ok(())
    }

    async fn signed_url(&self, object: &str, ttl: Duration) -> Result<String, SinkError> {
        Ok(format!(
            "https://signed.example/{}/{object}?ttl={}",
            self.bucket,
            ttl.as_secs()
        ))
    }
}
