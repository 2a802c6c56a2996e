//! In-process object store
//!
//! Keeps objects in a sorted map and paginates listings the way S3 does, so
//! the pipeline can be exercised end to end without a network. Failures can
//! be injected per operation and location prefix.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use catalina_common::S3Location;

use super::{ListPage, ListRequest, ObjectStore};
use crate::error::{IngestError, Result};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// Operations failures can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    List,
    Get,
    Put,
    Copy,
    Delete,
    Exists,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    op: StoreOp,
    /// Canonical location prefix the failure applies to
    prefix: String,
    message: String,
}

#[derive(Debug)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    failures: RwLock<Vec<InjectedFailure>>,
    page_size: usize,
    list_calls: AtomicUsize,
    copy_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            failures: RwLock::new(Vec::new()),
            page_size: DEFAULT_PAGE_SIZE,
            list_calls: AtomicUsize::new(0),
            copy_calls: AtomicUsize::new(0),
        }
    }

    /// Limit the number of entries per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Store an object without going through the async API.
    pub fn insert(&self, location: &S3Location, body: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry_key(location), body.into());
    }

    /// Current content of an object, if present.
    pub fn object(&self, location: &S3Location) -> Option<Vec<u8>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entry_key(location))
            .cloned()
    }

    /// All keys in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Make `op` fail for every location starting with `prefix`.
    pub fn fail_on(&self, op: StoreOp, prefix: &S3Location, message: impl Into<String>) {
        self.failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(InjectedFailure {
                op,
                prefix: prefix.to_string(),
                message: message.into(),
            });
    }

    /// Make every listing fail.
    pub fn fail_listing(&self, message: impl Into<String>) {
        self.failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(InjectedFailure {
                op: StoreOp::List,
                prefix: "s3://".to_string(),
                message: message.into(),
            });
    }

    pub fn clear_failures(&self) {
        self.failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of listing pages served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::Relaxed)
    }

    /// Number of copies performed so far.
    pub fn copy_calls(&self) -> usize {
        self.copy_calls.load(Ordering::Relaxed)
    }

    fn check(&self, op: StoreOp, location: &str) -> Result<()> {
        let failures = self.failures.read().unwrap_or_else(PoisonError::into_inner);
        match failures
            .iter()
            .find(|f| f.op == op && location.starts_with(&f.prefix))
        {
            Some(failure) => Err(IngestError::storage(location, &failure.message)),
            None => Ok(()),
        }
    }
}

fn entry_key(location: &S3Location) -> (String, String) {
    (location.bucket().to_string(), location.path().to_string())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        self.check(
            StoreOp::List,
            &format!("s3://{}/{}", request.bucket, request.prefix),
        )?;

        // Keys and rolled-up prefixes share one sorted sequence, like S3.
        let mut entries: BTreeSet<(String, bool)> = BTreeSet::new();
        {
            let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
            for (bucket, key) in objects.keys() {
                if bucket != &request.bucket {
                    continue;
                }
                let Some(rest) = key.strip_prefix(request.prefix.as_str()) else {
                    continue;
                };
                match request.delimiter.as_deref().and_then(|d| {
                    rest.find(d).map(|idx| idx + d.len())
                }) {
                    Some(end) => {
                        entries.insert((format!("{}{}", request.prefix, &rest[..end]), true));
                    }
                    None => {
                        entries.insert((key.clone(), false));
                    }
                }
            }
        }

        let start = match &request.continuation {
            Some(token) => token.parse::<usize>().map_err(|_| {
                IngestError::storage(&request.bucket, format!("invalid continuation token '{token}'"))
            })?,
            None => 0,
        };

        let mut page = ListPage::default();
        for (name, is_prefix) in entries.iter().skip(start).take(self.page_size) {
            if *is_prefix {
                page.common_prefixes.push(name.clone());
            } else {
                page.keys.push(name.clone());
            }
        }

        let served = start + self.page_size;
        if served < entries.len() {
            page.next_token = Some(served.to_string());
        }

        Ok(page)
    }

    async fn get(&self, location: &S3Location) -> Result<Vec<u8>> {
        self.check(StoreOp::Get, &location.to_string())?;
        self.object(location)
            .ok_or_else(|| IngestError::NotFound(location.to_string()))
    }

    async fn put(
        &self,
        location: &S3Location,
        body: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<()> {
        self.check(StoreOp::Put, &location.to_string())?;
        self.insert(location, body);
        Ok(())
    }

    async fn copy(&self, source: &S3Location, destination: &S3Location) -> Result<()> {
        self.check(StoreOp::Copy, &source.to_string())?;
        self.check(StoreOp::Copy, &destination.to_string())?;

        let body = self
            .object(source)
            .ok_or_else(|| IngestError::NotFound(source.to_string()))?;
        self.insert(destination, body);
        self.copy_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, location: &S3Location) -> Result<()> {
        self.check(StoreOp::Delete, &location.to_string())?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entry_key(location));
        Ok(())
    }

    async fn exists(&self, location: &S3Location) -> Result<bool> {
        self.check(StoreOp::Exists, &location.to_string())?;
        Ok(self.object(location).is_some())
    }
}
