//! Object storage access
//!
//! The pipeline talks to storage through the [`ObjectStore`] trait. [`S3Store`]
//! is the production implementation, [`memory::MemoryStore`] backs tests.
//!
//! Listing is exposed as a lazy stream over pages: each page is fetched only
//! when the previous one has been consumed, and calling [`list_keys`] again
//! starts a fresh listing from the first page.

use async_trait::async_trait;
use catalina_common::S3Location;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::error::{IngestError, Result};

pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

/// One request for a page of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: String,
    /// Group keys sharing a prefix up to this delimiter into `common_prefixes`
    pub delimiter: Option<String>,
    pub continuation: Option<String>,
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
    /// Present when more pages follow
    pub next_token: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a single page of a listing.
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage>;

    async fn get(&self, location: &S3Location) -> Result<Vec<u8>>;

    async fn put(
        &self,
        location: &S3Location,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()>;

    /// Server-side copy, overwriting `destination` when it exists.
    async fn copy(&self, source: &S3Location, destination: &S3Location) -> Result<()>;

    async fn delete(&self, location: &S3Location) -> Result<()>;

    async fn exists(&self, location: &S3Location) -> Result<bool>;
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Stream every page of a listing, following continuation tokens.
pub fn list_pages<'a>(
    store: &'a dyn ObjectStore,
    root: &S3Location,
    delimiter: Option<&str>,
) -> BoxStream<'a, Result<ListPage>> {
    let base = ListRequest {
        bucket: root.bucket().to_string(),
        prefix: root.dir_key(),
        delimiter: delimiter.map(str::to_string),
        continuation: None,
    };

    stream::try_unfold(Cursor::Start, move |cursor| {
        let base = base.clone();
        async move {
            let continuation = match cursor {
                Cursor::Start => None,
                Cursor::Next(token) => Some(token),
                Cursor::Done => return Ok(None),
            };

            let request = ListRequest {
                continuation,
                ..base
            };
            let page = store.list_page(&request).await?;

            let next = match &page.next_token {
                Some(token) => Cursor::Next(token.clone()),
                None => Cursor::Done,
            };
            Ok::<_, IngestError>(Some((page, next)))
        }
    })
    .boxed()
}

/// Stream every object key under `root`, across all pages.
pub fn list_keys<'a>(
    store: &'a dyn ObjectStore,
    root: &S3Location,
) -> BoxStream<'a, Result<String>> {
    list_pages(store, root, None)
        .map_ok(|page| stream::iter(page.keys.into_iter().map(Ok::<_, IngestError>)))
        .try_flatten()
        .boxed()
}

/// Stream the immediate "sub-directories" of `root` as full key prefixes
/// ending in `/`.
pub fn list_prefixes<'a>(
    store: &'a dyn ObjectStore,
    root: &S3Location,
) -> BoxStream<'a, Result<String>> {
    list_pages(store, root, Some("/"))
        .map_ok(|page| {
            stream::iter(page.common_prefixes.into_iter().map(Ok::<_, IngestError>))
        })
        .try_flatten()
        .boxed()
}
