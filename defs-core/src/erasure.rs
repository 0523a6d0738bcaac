//! Reed-Solomon Erasure Coding
//!
//! Systematic `(k, m)` coding over GF(2^8):
//! - k data shards (the first k outputs equal the padded input)
//! - m parity shards, `0 <= m`, `k + m <= 256`
//! - any k of the k + m shards reconstruct the rest
//!
//! [`StreamingEncoder`] applies the same coder to ordered batches of a reader
//! so very large inputs never sit in memory at once.

use crate::error::{DefsError, Result};
use crate::MAX_SHARDS;
use bytes::Bytes;
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Erasure coding configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards (k)
    pub data_shards: usize,
    /// Number of parity shards (m)
    pub parity_shards: usize,
}

impl ErasureConfig {
    /// Create a new erasure config, enforcing `1 <= k` and `k + m <= 256`
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 || data_shards + parity_shards > MAX_SHARDS {
            return Err(DefsError::ShardCountOutOfRange {
                data: data_shards,
                parity: parity_shards,
            });
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Total number of shards
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Storage overhead ratio (parity/data)
    pub fn overhead_ratio(&self) -> f64 {
        self.parity_shards as f64 / self.data_shards as f64
    }

    /// Maximum number of lost shards that can be tolerated
    pub fn max_failures(&self) -> usize {
        self.parity_shards
    }

    /// Equal shard length for an input of `size` bytes; never zero
    pub fn shard_len(&self, size: usize) -> usize {
        size.div_ceil(self.data_shards).max(1)
    }
}

/// A single shard of erasure-coded data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardData {
    /// Shard index (0 to total_shards-1)
    pub index: u32,
    /// Shard data
    pub data: Bytes,
    /// Whether this is a parity shard
    pub is_parity: bool,
}

impl ShardData {
    pub fn new(index: u32, data: Bytes, is_parity: bool) -> Self {
        Self {
            index,
            data,
            is_parity,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Reed-Solomon coder
///
/// With `m = 0` there is no parity to compute; encode yields nothing and
/// reconstruction requires every data shard.
pub struct ErasureCoder {
    config: ErasureConfig,
    rs: Option<ReedSolomon>,
}

impl ErasureCoder {
    /// Create a coder for `k` data and `m` parity shards
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        Self::with_config(ErasureConfig::new(data_shards, parity_shards)?)
    }

    pub fn with_config(config: ErasureConfig) -> Result<Self> {
        let rs = if config.parity_shards == 0 {
            None
        } else {
            Some(ReedSolomon::new(config.data_shards, config.parity_shards)?)
        };
        Ok(Self { config, rs })
    }

    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Split input into k equal data shards, zero-padding the last one
    pub fn split(&self, input: &[u8]) -> Vec<Vec<u8>> {
        let shard_len = self.config.shard_len(input.len());
        let mut shards: Vec<Vec<u8>> = input.chunks(shard_len).map(|c| c.to_vec()).collect();
        shards.resize_with(self.config.data_shards, Vec::new);
        for shard in &mut shards {
            shard.resize(shard_len, 0);
        }
        shards
    }

    /// Split using parallel copies; identical output to [`Self::split`]
    ///
    /// More efficient for large inputs (> 1MB)
    pub fn split_parallel(&self, input: &[u8]) -> Vec<Vec<u8>> {
        let shard_len = self.config.shard_len(input.len());
        (0..self.config.data_shards)
            .into_par_iter()
            .map(|i| {
                let start = (i * shard_len).min(input.len());
                let end = ((i + 1) * shard_len).min(input.len());
                let mut shard = input[start..end].to_vec();
                shard.resize(shard_len, 0);
                shard
            })
            .collect()
    }

    /// Compute the m parity shards for k data shards
    pub fn encode(&self, data_shards: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        let shard_len = self.check_shape(data_shards, self.config.data_shards)?;
        let Some(rs) = &self.rs else {
            return Ok(Vec::new());
        };

        let mut parity = vec![vec![0u8; shard_len]; self.config.parity_shards];
        rs.encode_sep(data_shards, &mut parity)?;
        Ok(parity)
    }

    /// Split and encode in one step, returning all k + m shards
    pub fn encode_data(&self, input: &[u8]) -> Result<Vec<ShardData>> {
        let data = if input.len() > 1024 * 1024 {
            self.split_parallel(input)
        } else {
            self.split(input)
        };
        let parity = self.encode(&data)?;

        let k = self.config.data_shards;
        Ok(data
            .into_iter()
            .chain(parity)
            .enumerate()
            .map(|(i, shard)| ShardData::new(i as u32, Bytes::from(shard), i >= k))
            .collect())
    }

    /// Check that parity matches the current data for a full set of shards
    pub fn verify<T: AsRef<[u8]>>(&self, shards: &[T]) -> Result<bool> {
        if shards.len() != self.config.total_shards() {
            return Ok(false);
        }
        let expected = shards.first().map(|s| s.as_ref().len()).unwrap_or(0);
        if !shards.iter().all(|s| s.as_ref().len() == expected) {
            return Ok(false);
        }
        match &self.rs {
            Some(rs) => Ok(rs.verify(shards)?),
            None => Ok(true),
        }
    }

    /// Recover missing shards in place when at least k are present
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let total = self.config.total_shards();
        if shards.len() != total {
            return Err(DefsError::ShardSizeMismatch {
                expected: total,
                actual: shards.len(),
            });
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.config.data_shards {
            return Err(DefsError::ReconstructInsufficient {
                available,
                required: self.config.data_shards,
            });
        }

        let shard_len = shards
            .iter()
            .flatten()
            .map(Vec::len)
            .next()
            .unwrap_or_default();
        if let Some(bad) = shards.iter().flatten().find(|s| s.len() != shard_len) {
            return Err(DefsError::ShardSizeMismatch {
                expected: shard_len,
                actual: bad.len(),
            });
        }

        // With m = 0 and available >= k nothing is missing
        if let Some(rs) = &self.rs {
            rs.reconstruct(shards)?;
        }
        Ok(())
    }

    /// Concatenate the k data shards into `out`, truncated to `size` bytes
    pub fn join<W: Write, T: AsRef<[u8]>>(
        &self,
        data_shards: &[T],
        out: &mut W,
        size: usize,
    ) -> Result<()> {
        if data_shards.len() < self.config.data_shards {
            return Err(DefsError::ReconstructInsufficient {
                available: data_shards.len(),
                required: self.config.data_shards,
            });
        }

        let mut remaining = size;
        for shard in data_shards.iter().take(self.config.data_shards) {
            if remaining == 0 {
                break;
            }
            let shard = shard.as_ref();
            let take = shard.len().min(remaining);
            out.write_all(&shard[..take])?;
            remaining -= take;
        }

        if remaining > 0 {
            return Err(DefsError::ShardSizeMismatch {
                expected: size,
                actual: size - remaining,
            });
        }
        Ok(())
    }

    /// Decode shards back into original data
    ///
    /// Missing shards are represented as `None`.
    pub fn decode(&self, shards: &[Option<ShardData>], original_size: usize) -> Result<Bytes> {
        let mut shard_vecs: Vec<Option<Vec<u8>>> = shards
            .iter()
            .map(|opt| opt.as_ref().map(|s| s.data.to_vec()))
            .collect();
        self.reconstruct(&mut shard_vecs)?;

        let data: Vec<Vec<u8>> = shard_vecs
            .into_iter()
            .take(self.config.data_shards)
            .map(|s| s.ok_or_else(|| DefsError::Internal("Reconstruction failed".to_string())))
            .collect::<Result<_>>()?;

        let mut result = Vec::with_capacity(original_size);
        self.join(&data, &mut result, original_size)?;
        Ok(Bytes::from(result))
    }

    fn check_shape(&self, shards: &[Vec<u8>], expected_count: usize) -> Result<usize> {
        if shards.len() != expected_count {
            return Err(DefsError::ShardSizeMismatch {
                expected: expected_count,
                actual: shards.len(),
            });
        }
        let shard_len = shards.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = shards.iter().find(|s| s.len() != shard_len) {
            return Err(DefsError::ShardSizeMismatch {
                expected: shard_len,
                actual: bad.len(),
            });
        }
        Ok(shard_len)
    }
}

/// One encoded batch of a streamed input
#[derive(Debug, Clone)]
pub struct Batch {
    /// Position of this batch in the stream, starting at 0
    pub index: u64,
    /// Number of input bytes this batch covers
    pub len: usize,
    /// All k + m shards of the batch
    pub shards: Vec<ShardData>,
}

/// Streams a reader through the coder in batches of `k * shard_size` bytes
pub struct StreamingEncoder {
    coder: ErasureCoder,
    shard_size: usize,
}

impl StreamingEncoder {
    pub fn new(config: ErasureConfig, shard_size: usize) -> Result<Self> {
        if shard_size == 0 {
            return Err(DefsError::Configuration(
                "shard_size must be > 0".to_string(),
            ));
        }
        Ok(Self {
            coder: ErasureCoder::with_config(config)?,
            shard_size,
        })
    }

    pub fn coder(&self) -> &ErasureCoder {
        &self.coder
    }

    /// Bytes of input consumed per batch
    pub fn batch_size(&self) -> usize {
        self.shard_size * self.coder.config.data_shards
    }

    /// Encode every batch of `reader`, handing each to `sink` in order.
    /// Returns the total number of input bytes.
    pub fn encode_reader<R, F>(&self, mut reader: R, mut sink: F) -> Result<u64>
    where
        R: Read,
        F: FnMut(Batch) -> Result<()>,
    {
        let mut buf = vec![0u8; self.batch_size()];
        let mut total = 0u64;
        let mut index = 0u64;

        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 && index > 0 {
                break;
            }
            let shards = self.coder.encode_data(&buf[..n])?;
            sink(Batch {
                index,
                len: n,
                shards,
            })?;
            total += n as u64;
            index += 1;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Reconstruct one batch and append its `len` bytes to `out`
    pub fn decode_batch<W: Write>(
        &self,
        shards: &mut [Option<Vec<u8>>],
        len: usize,
        out: &mut W,
    ) -> Result<()> {
        self.coder.reconstruct(shards)?;
        let data: Vec<&[u8]> = shards
            .iter()
            .take(self.coder.config.data_shards)
            .map(|s| s.as_deref().unwrap_or_default())
            .collect();
        self.coder.join(&data, out, len)
    }
}

/// Fill `buf` from `reader` until full or EOF; returns bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn all_shards(coder: &ErasureCoder, input: &[u8]) -> Vec<Vec<u8>> {
        let data = coder.split(input);
        let parity = coder.encode(&data).unwrap();
        data.into_iter().chain(parity).collect()
    }

    #[test]
    fn test_erasure_config() {
        let config = ErasureConfig::new(4, 2).unwrap();
        assert_eq!(config.total_shards(), 6);
        assert_eq!(config.max_failures(), 2);
        assert!((config.overhead_ratio() - 0.5).abs() < 0.001);
        assert_eq!(config.shard_len(1536 * 1024), 384 * 1024);
        assert_eq!(config.shard_len(0), 1);
    }

    #[test]
    fn test_config_bounds() {
        assert!(matches!(
            ErasureConfig::new(0, 2),
            Err(DefsError::ShardCountOutOfRange { data: 0, parity: 2 })
        ));
        assert!(ErasureConfig::new(200, 57).is_err());
        assert!(ErasureConfig::new(200, 56).is_ok());
        assert!(ErasureConfig::new(1, 0).is_ok());
    }

    #[test]
    fn test_split_pads_last_shard() {
        let coder = ErasureCoder::new(3, 1).unwrap();
        let shards = coder.split(b"abcdefg");
        assert_eq!(shards, vec![b"abc".to_vec(), b"def".to_vec(), b"g\0\0".to_vec()]);
        assert_eq!(coder.split_parallel(b"abcdefg"), shards);
    }

    #[test]
    fn test_systematic_encode_decode() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let original = b"Hello, DEFS storage node!";
        let shards = coder.encode_data(original).unwrap();
        assert_eq!(shards.len(), 6);
        for (i, shard) in shards.iter().enumerate() {
            assert_eq!(shard.index as usize, i);
            assert_eq!(shard.is_parity, i >= 4);
        }

        let shard_opts: Vec<Option<ShardData>> = shards.into_iter().map(Some).collect();
        let decoded = coder.decode(&shard_opts, original.len()).unwrap();
        assert_eq!(decoded.as_ref(), original);
    }

    #[test]
    fn test_repair_one_data_one_parity() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let original: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 251) as u8).collect();

        let mut shards: Vec<Option<Vec<u8>>> =
            all_shards(&coder, &original).into_iter().map(Some).collect();
        shards[1] = None;
        shards[5] = None;

        coder.reconstruct(&mut shards).unwrap();
        let full: Vec<Vec<u8>> = shards.into_iter().flatten().collect();
        assert_eq!(full.len(), 6);
        assert!(coder.verify(&full).unwrap());

        let mut out = Vec::new();
        coder.join(&full[..4], &mut out, original.len()).unwrap();
        assert_eq!(out, original);
    }

    #[test]
    fn test_too_many_missing_shards() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> =
            all_shards(&coder, b"test data").into_iter().map(Some).collect();
        for shard in shards.iter_mut().take(3) {
            *shard = None;
        }

        assert!(matches!(
            coder.reconstruct(&mut shards),
            Err(DefsError::ReconstructInsufficient {
                available: 3,
                required: 4
            })
        ));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let coder = ErasureCoder::new(3, 2).unwrap();
        let mut shards = all_shards(&coder, b"verify test");
        assert!(coder.verify(&shards).unwrap());
        shards[0][0] ^= 0xFF;
        assert!(!coder.verify(&shards).unwrap());
    }

    #[test]
    fn test_zero_parity() {
        let coder = ErasureCoder::new(3, 0).unwrap();
        let shards = all_shards(&coder, b"no parity here");
        assert_eq!(shards.len(), 3);
        assert!(coder.verify(&shards).unwrap());

        let mut opts: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        coder.reconstruct(&mut opts).unwrap();
        opts[2] = None;
        assert!(matches!(
            coder.reconstruct(&mut opts),
            Err(DefsError::ReconstructInsufficient { .. })
        ));
    }

    #[test]
    fn test_join_rejects_short_input() {
        let coder = ErasureCoder::new(2, 1).unwrap();
        let mut out = Vec::new();
        let err = coder.join(&vec![vec![1u8; 2], vec![2u8; 2]], &mut out, 10);
        assert!(matches!(err, Err(DefsError::ShardSizeMismatch { .. })));
    }

    #[test]
    fn test_streaming_batches() {
        let config = ErasureConfig::new(3, 2).unwrap();
        let streamer = StreamingEncoder::new(config, 100).unwrap();
        let input: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

        let mut batches = Vec::new();
        let total = streamer
            .encode_reader(input.as_slice(), |batch| {
                batches.push(batch);
                Ok(())
            })
            .unwrap();
        assert_eq!(total, 1000);
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().enumerate().all(|(i, b)| b.index == i as u64));
        assert_eq!(batches[3].len, 100);

        let mut out = Vec::new();
        for batch in &batches {
            let mut shards: Vec<Option<Vec<u8>>> =
                batch.shards.iter().map(|s| Some(s.data.to_vec())).collect();
            shards[0] = None;
            shards[4] = None;
            streamer.decode_batch(&mut shards, batch.len, &mut out).unwrap();
        }
        assert_eq!(out, input);
    }

    #[test]
    fn test_streaming_empty_input() {
        let streamer = StreamingEncoder::new(ErasureConfig::new(2, 1).unwrap(), 16).unwrap();
        let mut count = 0;
        let total = streamer
            .encode_reader(std::io::empty(), |batch| {
                assert_eq!(batch.len, 0);
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(total, 0);
        assert_eq!(count, 1);
    }

    fn params() -> impl Strategy<Value = (usize, usize)> {
        (1usize..=12).prop_flat_map(|k| (Just(k), 0usize..=6))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_split_encode_join(
            (k, m) in params(),
            input in proptest::collection::vec(any::<u8>(), 0..4096),
        ) {
            let coder = ErasureCoder::new(k, m).unwrap();
            let shards = all_shards(&coder, &input);
            prop_assert_eq!(shards.len(), k + m);
            prop_assert!(coder.verify(&shards).unwrap());

            let mut out = Vec::new();
            coder.join(&shards[..k], &mut out, input.len()).unwrap();
            prop_assert_eq!(out, input);
        }

        #[test]
        fn prop_reconstruct_any_m_missing(
            (k, m) in params(),
            input in proptest::collection::vec(any::<u8>(), 1..2048),
            seed in any::<u64>(),
        ) {
            let coder = ErasureCoder::new(k, m).unwrap();
            let shards = all_shards(&coder, &input);

            let mut order: Vec<usize> = (0..k + m).collect();
            let mut state = seed;
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                order.swap(i, (state >> 33) as usize % (i + 1));
            }

            let mut partial: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
            for &i in order.iter().take(m) {
                partial[i] = None;
            }
            coder.reconstruct(&mut partial).unwrap();
            let full: Vec<Vec<u8>> = partial.into_iter().flatten().collect();
            prop_assert_eq!(&full, &shards);
            prop_assert!(coder.verify(&full).unwrap());

            let mut out = Vec::new();
            coder.join(&full[..k], &mut out, input.len()).unwrap();
            prop_assert_eq!(out, input);
        }
    }
}
