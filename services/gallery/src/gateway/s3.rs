use super::StorageError;
use crate::config::S3Config;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument};

/// S3-compatible object store for gallery images
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    public_base: String,
}

impl S3ObjectStore {
    /// Create a new object store client
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());
        let public_base = public_base_url(config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_base = %public_base,
            "S3 object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            public_base,
        }
    }

    /// Store an object, refusing to overwrite an existing key
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StorageError> {
        if !is_safe_key(key) {
            return Err(StorageError::ObjectStore(format!("unsafe object key {key:?}")));
        }

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .if_none_match("*")
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(key = %key, "Object stored");
                Ok(())
            }
            Err(err) => {
                let code = err.as_service_error().and_then(|e| e.code()).map(str::to_string);
                if code.as_deref() == Some("PreconditionFailed") {
                    Err(StorageError::Conflict(key.to_string()))
                } else {
                    Err(StorageError::ObjectStore(
                        code.unwrap_or_else(|| err.to_string()),
                    ))
                }
            }
        }
    }

    /// Public URL objects are served from
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }
}

/// Base URL public object URLs are built on.
///
/// An explicit `public_base_url` wins, then `{endpoint}/{bucket}`, then the
/// virtual-hosted AWS form.
pub fn public_base_url(config: &S3Config) -> String {
    if let Some(base) = &config.public_base_url {
        return base.trim_end_matches('/').to_string();
    }
    match &config.endpoint_url {
        Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
        None => format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region),
    }
}

/// Keys are a single path component of `[A-Za-z0-9._-]`, never dot-only
fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && key.chars().any(|c| c != '.')
        && key
            .chars()
            .all(|c| matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_config() -> S3Config {
        S3Config {
            bucket: "wedding-gallery".to_string(),
            region: "eu-west-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: None,
        }
    }

    #[test]
    fn test_public_base_defaults_to_aws_host() {
        assert_eq!(
            public_base_url(&s3_config()),
            "https://wedding-gallery.s3.eu-west-1.amazonaws.com"
        );
    }

    #[test]
    fn test_public_base_uses_endpoint_path_style() {
        let config = S3Config {
            endpoint_url: Some("http://localhost:9000/".to_string()),
            force_path_style: true,
            ..s3_config()
        };
        assert_eq!(public_base_url(&config), "http://localhost:9000/wedding-gallery");
    }

    #[test]
    fn test_explicit_public_base_wins() {
        let config = S3Config {
            endpoint_url: Some("http://minio:9000".to_string()),
            public_base_url: Some("https://photos.example.com/".to_string()),
            ..s3_config()
        };
        assert_eq!(public_base_url(&config), "https://photos.example.com");
    }

    #[test]
    fn test_safe_keys() {
        assert!(is_safe_key("1717276503000-3f2a9c.jpg"));
        assert!(!is_safe_key("../etc/passwd"));
        assert!(!is_safe_key("a/b.jpg"));
        assert!(!is_safe_key(".."));
        assert!(!is_safe_key(""));
    }
}
