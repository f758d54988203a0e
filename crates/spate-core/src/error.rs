//! Error types for the Spate transaction sync protocol.
use thiserror::Error;

/// Errors produced while encoding or decoding a transaction block message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("malformed message: {0}")] Malformed(String),
    #[error("unsupported message version: {0}")] UnsupportedVersion(u8),
    #[error("message too large: {size} > {max}")] MessageTooLarge { size: usize, max: usize },
}

/// Errors produced while decoding an incoming Bloom filter record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("unknown bloom filter type: {0}")] InvalidEncoding(u8),
    #[error("malformed bloom filter payload: {0}")] MalformedPayload(String),
}

/// Errors produced by the per-peer message ordering heap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderingError {
    #[error("message ordering heap is empty")] Empty,
    #[error("message ordering heap reached capacity")] Capacity,
}

/// Umbrella error returned to the transport by the incoming message handler.
///
/// Any of these is a hard error: the transport is expected to disconnect the
/// offending peer on a non-`Ok` result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)] Exchange(#[from] ExchangeError),
    #[error(transparent)] Ordering(#[from] OrderingError),
}
