use crate::error::ConnectorError;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use std::path::PathBuf;
use tracing::debug;

/// Where staged files land before the destination COPY picks them up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingLocation {
    S3 { bucket: String, prefix: String },
    Local(PathBuf),
}

impl StagingLocation {
    pub fn parse(path: &str) -> Result<Self, ConnectorError> {
        if let Some(rest) = path.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(ConnectorError::ObjectStore(format!(
                    "staging path {path} has no bucket"
                )));
            }
            return Ok(StagingLocation::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.trim_end_matches('/').to_string(),
            });
        }
        if path.starts_with("gs://") {
            return Err(ConnectorError::ObjectStore(
                "gs:// staging is not supported by this build".into(),
            ));
        }
        Ok(StagingLocation::Local(PathBuf::from(path)))
    }

    /// Uploads one staged object and returns the URI (or path) the
    /// destination COPY should read.
    pub async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, ConnectorError> {
        match self {
            StagingLocation::S3 { bucket, prefix } => {
                let full_key = if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{prefix}/{key}")
                };
                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Ok(endpoint) = std::env::var("AWS_ENDPOINT") {
                    loader = loader.endpoint_url(endpoint);
                }
                let config = loader.load().await;
                let client = aws_sdk_s3::Client::new(&config);
                client
                    .put_object()
                    .bucket(bucket)
                    .key(&full_key)
                    .body(ByteStream::from(bytes))
                    .send()
                    .await
                    .map_err(|e| ConnectorError::ObjectStore(e.to_string()))?;
                debug!(bucket, key = %full_key, "staged object uploaded");
                Ok(format!("s3://{bucket}/{full_key}"))
            }
            StagingLocation::Local(dir) => {
                let path = dir.join(key);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, bytes).await?;
                debug!(path = %path.display(), "staged object written");
                Ok(path.display().to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s3_bucket_and_prefix() {
        let loc = StagingLocation::parse("s3://my-bucket/some/prefix/").unwrap();
        assert_eq!(
            loc,
            StagingLocation::S3 {
                bucket: "my-bucket".into(),
                prefix: "some/prefix".into(),
            }
        );
    }

    #[test]
    fn bare_paths_are_local() {
        let loc = StagingLocation::parse("/tmp/stage").unwrap();
        assert_eq!(loc, StagingLocation::Local(PathBuf::from("/tmp/stage")));
    }

    #[test]
    fn gcs_is_rejected() {
        assert!(StagingLocation::parse("gs://bucket/x").is_err());
    }

    #[tokio::test]
    async fn local_put_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let loc = StagingLocation::Local(dir.path().to_path_buf());
        let path = loc.put("run/part.avro", vec![1, 2, 3]).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![1, 2, 3]);
    }
}
