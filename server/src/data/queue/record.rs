//! On-disk record formats for the queue logs

use bytes::Bytes;

/// Index operation: retry metadata advanced
pub const OP_RETRY: u32 = 1;
/// Index operation: entry acknowledged, dead-lettered or evicted
pub const OP_REMOVE: u32 = 2;

/// One enqueued entry (`entries.log`)
#[derive(Clone, PartialEq, prost::Message)]
pub struct PutRecord {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub batch_seq: u64,
    #[prost(uint32, tag = "3")]
    pub kind: u32,
    #[prost(uint64, tag = "4")]
    pub enqueued_at_ms: u64,
    #[prost(uint32, tag = "5")]
    pub retry_count: u32,
    #[prost(uint64, tag = "6")]
    pub next_retry_at_ms: u64,
    #[prost(bytes = "bytes", tag = "7")]
    pub payload: Bytes,
}

/// Retry or removal of an entry (`index.log`)
#[derive(Clone, PartialEq, prost::Message)]
pub struct IndexRecord {
    #[prost(uint32, tag = "1")]
    pub op: u32,
    #[prost(uint64, tag = "2")]
    pub id: u64,
    #[prost(uint32, tag = "3")]
    pub retry_count: u32,
    #[prost(uint64, tag = "4")]
    pub next_retry_at_ms: u64,
}

impl IndexRecord {
    pub fn retry(id: u64, retry_count: u32, next_retry_at_ms: u64) -> Self {
        Self {
            op: OP_RETRY,
            id,
            retry_count,
            next_retry_at_ms,
        }
    }

    pub fn remove(id: u64) -> Self {
        Self {
            op: OP_REMOVE,
            id,
            retry_count: 0,
            next_retry_at_ms: 0,
        }
    }
}
