use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use time::OffsetDateTime;

use crate::GatewayError;

/// Conditional predicates for an object-store get.
#[derive(Debug, Clone, Default)]
pub struct Conditional {
    pub etag_does_not_match: Option<String>,
    pub uploaded_after: Option<OffsetDateTime>,
}

/// Byte range for a partial get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub only_if: Option<Conditional>,
    pub range: Option<ByteRange>,
}

/// Object metadata returned with every non-missing get. `size` is always
/// the full object size, also for range reads.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub uploaded: OffsetDateTime,
    pub content_type: Option<String>,
    pub http_metadata: BTreeMap<String, String>,
}

/// Outcome of an object-store get
#[derive(Debug, Clone)]
pub enum StoreGet {
    /// No object under the key.
    Missing,
    /// A conditional predicate failed; metadata only, no body.
    Unmodified(ObjectMeta),
    /// Object (or requested range of it) with body.
    Body(ObjectMeta, Bytes),
}

/// The platform object-store binding the resolver talks to.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str, opts: &GetOptions) -> Result<StoreGet, GatewayError>;
}

/// In-process reference store. Backs local development and the test
/// suite; production deployments inject the platform binding instead.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (ObjectMeta, Bytes)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, body: impl Into<Bytes>, content_type: &str) {
        let body = body.into();
        let etag = format!("\"{}\"", hex::encode(&Sha256::digest(&body)[..16]));
        let meta = ObjectMeta {
            key: key.to_string(),
            size: body.len() as u64,
            etag,
            uploaded: OffsetDateTime::now_utc(),
            content_type: Some(content_type.to_string()),
            http_metadata: BTreeMap::new(),
        };
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (meta, body));
    }

    pub fn etag_of(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(meta, _)| meta.etag.clone())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str, opts: &GetOptions) -> Result<StoreGet, GatewayError> {
        let objects = self.objects.lock().unwrap();
        let Some((meta, body)) = objects.get(key) else {
            return Ok(StoreGet::Missing);
        };

        if let Some(cond) = &opts.only_if {
            if let Some(etag) = &cond.etag_does_not_match {
                if etag == &meta.etag {
                    return Ok(StoreGet::Unmodified(meta.clone()));
                }
            }
            if let Some(after) = cond.uploaded_after {
                if meta.uploaded <= after {
                    return Ok(StoreGet::Unmodified(meta.clone()));
                }
            }
        }

        let body = match opts.range {
            Some(range) => {
                let start = range.offset.min(meta.size) as usize;
                let end = match range.length {
                    Some(len) => (range.offset.saturating_add(len)).min(meta.size) as usize,
                    None => meta.size as usize,
                };
                body.slice(start..end)
            }
            None => body.clone(),
        };

        Ok(StoreGet::Body(meta.clone(), body))
    }
}
