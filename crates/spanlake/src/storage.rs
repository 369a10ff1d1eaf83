//! Object store factory.
//!
//! The span store itself is written against `Arc<dyn ObjectStore>`; this
//! factory builds the production S3 client from configuration. Tests use
//! `object_store::memory::InMemory` directly.

use std::sync::Arc;

use object_store::ObjectStore;

use crate::config::S3Config;
use crate::SpanlakeError;

/// Create the object store targeting the configured bucket.
///
/// # Errors
///
/// Returns an error if the bucket name is missing, the client cannot be
/// built, or the crate was compiled without the `s3` feature.
#[cfg(feature = "s3")]
pub fn create_object_store(config: &S3Config) -> Result<Arc<dyn ObjectStore>, SpanlakeError> {
    use object_store::aws::AmazonS3Builder;

    if config.bucket_name.is_empty() {
        return Err(SpanlakeError::Config("s3.bucketName must be set".to_owned()));
    }

    let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket_name);
    if let Some(ref region) = config.region {
        builder = builder.with_region(region);
    }
    if let Some(ref endpoint) = config.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if config.allow_http {
        builder = builder.with_allow_http(true);
    }

    let store = builder.build()?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "s3"))]
pub fn create_object_store(_config: &S3Config) -> Result<Arc<dyn ObjectStore>, SpanlakeError> {
    Err(SpanlakeError::Config(
        "S3 storage requires the 's3' feature to be enabled".to_owned(),
    ))
}
