//! DEFS Core Library
//!
//! Core building blocks of a DEFS storage node:
//! - Tag-prefixed value codec and the segmented object container
//! - Reed-Solomon erasure coding (batch and streaming)
//! - Cryptographic primitives (SHA-256, RIPEMD-160, AES-128-CTR, ECDSA P-256)
//! - P2PKH owner scripts
//! - Shard objects and the shard pipeline
//! - Typed event bus
//! - Common error handling

pub mod codec;
pub mod crypto;
pub mod erasure;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod script;
pub mod segment;
pub mod shard;

pub use codec::Value;
pub use crypto::{PrivateKey, PublicKey};
pub use erasure::{ErasureCoder, ErasureConfig, ShardData, StreamingEncoder};
pub use error::{DefsError, Result};
pub use event::{Event, EventBus, SubscriptionId};
pub use pipeline::{
    FailedShard, FileMeta, PauseRegistry, PipelineConfig, ShardPipeline, ShardSink, ShardSource,
    SliceUploaded, UploadedFile,
};
pub use segment::{SegmentReader, SegmentWriter, XrefEntry, XrefTable};
pub use shard::{Shard, ShardHeader, SliceEntry, SliceTable};

/// Upper bound on `k + m` for one erasure batch (GF(2^8))
pub const MAX_SHARDS: usize = 256;

/// Shard size constants
pub const DEFAULT_SHARD_SIZE: usize = 512 * 1024; // 512 KB
pub const MIN_SLICE_SIZE: usize = 1024; // 1 KB
pub const MAX_SLICE_SIZE: usize = 32 * 1024 * 1024; // 32 MB

/// Parity shards per data shard when `(k, m)` is derived
pub const DEFAULT_PARITY_RATIO: f64 = 0.30;

/// Dispatcher retry schedule for shard uploads
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 50;

/// Below this many connected peers the node keeps dialing bootstrap peers
pub const ROUTING_LOW_WATER: usize = 2;
