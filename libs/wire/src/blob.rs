//! Status blob uploads.
//!
//! The status URL handed out in the goal state points at a storage blob
//! that is either a block blob (one PUT replaces it) or a page blob (resize,
//! then write 512-byte aligned pages). The type is discovered with a HEAD
//! before anything is written.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::BlobError;
use crate::transport::TransportClient;

pub const STORAGE_VERSION: &str = "2014-02-14";
pub const PAGE_SIZE: usize = 512;
/// Largest single page write.
pub const MAX_PAGE_WRITE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobType {
    Block,
    Page,
}

impl BlobType {
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "BlockBlob" => Some(BlobType::Block),
            "PageBlob" => Some(BlobType::Page),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlobType::Block => "BlockBlob",
            BlobType::Page => "PageBlob",
        }
    }
}

/// One page write: `[start, end)` of the payload, sent padded up to
/// `padded_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
    pub padded_end: usize,
}

impl PageRange {
    pub fn padded_len(&self) -> usize {
        self.padded_end - self.start
    }

    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.padded_end - 1)
    }
}

pub fn aligned_size(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Split a payload of `len` bytes into page writes.
pub fn page_ranges(len: usize) -> Vec<PageRange> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < len {
        let end = len.min(start + MAX_PAGE_WRITE);
        ranges.push(PageRange {
            start,
            end,
            padded_end: aligned_size(end),
        });
        start = end;
    }
    ranges
}

fn page_url(url: &str) -> String {
    if url.contains('?') {
        format!("{url}&comp=page")
    } else {
        format!("{url}?comp=page")
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub struct BlobClient {
    transport: Arc<TransportClient>,
}

impl BlobClient {
    pub fn new(transport: Arc<TransportClient>) -> Self {
        Self { transport }
    }

    /// Upload `payload` to `url`, choosing the write protocol from the
    /// blob's reported type.
    pub async fn upload(&self, url: &str, payload: &[u8]) -> Result<(), BlobError> {
        let blob_type = self.blob_type(url).await?;
        info!(blob_type = blob_type.as_str(), len = payload.len(), "Uploading status blob");
        match blob_type {
            BlobType::Block => self.put_block_blob(url, payload).await,
            BlobType::Page => self.put_page_blob(url, payload).await,
        }
    }

    pub async fn blob_type(&self, url: &str) -> Result<BlobType, BlobError> {
        let headers = [
            ("x-ms-date", timestamp()),
            ("x-ms-version", STORAGE_VERSION.to_string()),
        ];
        let resp = self
            .transport
            .head(url, &headers, true)
            .await
            .map_err(BlobError::BlobTypeUnavailable)?;

        let reported = resp.header("x-ms-blob-type");
        debug!(blob_type = ?reported, "Read blob type");
        reported
            .and_then(BlobType::from_header)
            .ok_or_else(|| BlobError::UnknownBlobType(reported.map(str::to_string)))
    }

    pub async fn put_block_blob(&self, url: &str, payload: &[u8]) -> Result<(), BlobError> {
        let headers = [
            ("x-ms-date", timestamp()),
            ("x-ms-blob-type", BlobType::Block.as_str().to_string()),
            ("x-ms-version", STORAGE_VERSION.to_string()),
        ];
        self.transport
            .put(url, payload, &headers, true)
            .await
            .map_err(|source| BlobError::Transport {
                stage: "block blob upload",
                source,
            })?;
        Ok(())
    }

    pub async fn put_page_blob(&self, url: &str, payload: &[u8]) -> Result<(), BlobError> {
        // Resizing to the aligned length clears whatever was there before.
        let headers = [
            ("x-ms-date", timestamp()),
            ("x-ms-blob-type", BlobType::Page.as_str().to_string()),
            ("x-ms-blob-content-length", aligned_size(payload.len()).to_string()),
            ("x-ms-version", STORAGE_VERSION.to_string()),
        ];
        self.transport
            .put(url, &[], &headers, true)
            .await
            .map_err(|source| BlobError::Transport {
                stage: "page blob resize",
                source,
            })?;

        let url = page_url(url);
        for range in page_ranges(payload.len()) {
            let mut page = vec![0u8; range.padded_len()];
            page[..range.end - range.start].copy_from_slice(&payload[range.start..range.end]);

            let headers = [
                ("x-ms-date", timestamp()),
                ("x-ms-range", range.range_header()),
                ("x-ms-page-write", "update".to_string()),
                ("x-ms-version", STORAGE_VERSION.to_string()),
            ];
            self.transport
                .put(&url, &page, &headers, true)
                .await
                .map_err(|source| BlobError::Transport {
                    stage: "page write",
                    source,
                })?;
        }
        Ok(())
    }
}
