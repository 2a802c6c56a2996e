use async_trait::async_trait;
use aws_sdk_s3::{error::DisplayErrorContext, primitives::ByteStream, Client};
use catalina_common::S3Location;
use tracing::{debug, instrument};

use super::{ListPage, ListRequest, ObjectStore};
use crate::error::{IngestError, Result};

/// [`ObjectStore`] backed by Amazon S3
#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

/// Copy sources are `bucket/key` with the key URL-encoded per segment.
fn copy_source(location: &S3Location) -> String {
    let key = location
        .path()
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", location.bucket(), key)
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip_all, fields(bucket = %request.bucket, prefix = %request.prefix))]
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&request.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .set_continuation_token(request.continuation.clone())
            .send()
            .await
            .map_err(|e| {
                IngestError::storage(
                    format!("s3://{}/{}", request.bucket, request.prefix),
                    DisplayErrorContext(e),
                )
            })?;

        let page = ListPage {
            keys: response
                .contents()
                .iter()
                .filter_map(|obj| obj.key().map(|k| k.to_string()))
                .collect(),
            common_prefixes: response
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(|k| k.to_string()))
                .collect(),
            next_token: if response.is_truncated().unwrap_or(false) {
                response.next_continuation_token().map(|t| t.to_string())
            } else {
                None
            },
        };

        debug!(
            keys = page.keys.len(),
            prefixes = page.common_prefixes.len(),
            more = page.next_token.is_some(),
            "Listed page"
        );

        Ok(page)
    }

    #[instrument(skip_all, fields(location = %location))]
    async fn get(&self, location: &S3Location) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(location.bucket())
            .key(location.path())
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    IngestError::NotFound(location.to_string())
                } else {
                    IngestError::storage(location, DisplayErrorContext(e))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| IngestError::storage(location, e))?
            .into_bytes()
            .to_vec();

        debug!(bytes = data.len(), "Downloaded object");

        Ok(data)
    }

    #[instrument(skip_all, fields(location = %location, bytes = body.len()))]
    async fn put(
        &self,
        location: &S3Location,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(location.bucket())
            .key(location.path())
            .body(ByteStream::from(body))
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(|e| IngestError::storage(location, DisplayErrorContext(e)))?;

        debug!("Uploaded object");

        Ok(())
    }

    #[instrument(skip_all, fields(source = %source, destination = %destination))]
    async fn copy(&self, source: &S3Location, destination: &S3Location) -> Result<()> {
        self.client
            .copy_object()
            .copy_source(copy_source(source))
            .bucket(destination.bucket())
            .key(destination.path())
            .send()
            .await
            .map_err(|e| IngestError::storage(destination, DisplayErrorContext(e)))?;

        debug!("Copied object");

        Ok(())
    }

    #[instrument(skip_all, fields(location = %location))]
    async fn delete(&self, location: &S3Location) -> Result<()> {
        self.client
            .delete_object()
            .bucket(location.bucket())
            .key(location.path())
            .send()
            .await
            .map_err(|e| IngestError::storage(location, DisplayErrorContext(e)))?;

        debug!("Deleted object");

        Ok(())
    }

    #[instrument(skip_all, fields(location = %location))]
    async fn exists(&self, location: &S3Location) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(location.bucket())
            .key(location.path())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(IngestError::storage(location, DisplayErrorContext(e))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_source_encodes_segments() {
        let location =
            S3Location::parse("s3://tv-type-intermediary/TCL-data/20220512/TV Final/TCL.csv")
                .unwrap();
        assert_eq!(
            copy_source(&location),
            "tv-type-intermediary/TCL-data/20220512/TV%20Final/TCL.csv"
        );
    }

    #[test]
    fn test_copy_source_encodes_partition_segments() {
        let location = S3Location::parse("s3://out/TCL-data/day=20220512/a.csv").unwrap();
        assert_eq!(copy_source(&location), "out/TCL-data/day%3D20220512/a.csv");
    }
}
