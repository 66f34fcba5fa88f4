use num_enum::TryFromPrimitive;

use crate::error::{Error, Result};

// source for these two: https://www.kernel.org/doc/html/latest/filesystems/fsverity.html#fs-verity-descriptor
pub const MAX_DIGEST_SIZE: usize = 64;
pub const MAX_SALT_SIZE: usize = 32;

// linux has a hardcoded limit, see FS_VERITY_MAX_LEVELS in /fs/verity/fsverity_private.h
pub const MAX_LEVELS: usize = 8;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const MIN_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Enum of the supported inner hash algorithms.
///
/// The [`Default`] value is `Sha256`, corresponding to the default hash algorithm in the `fsverity` tools.
///
/// This enum supports conversion to string using [`std::fmt::Display`] and from a string using [`parse_display::FromStr`].
///
/// It also supports conversion to integer using `as u8` and from integer using [`TryFromPrimitive`]). These integers values
/// match the hash algorithm numbering used in the fsverity kernel API.
#[derive(Copy, Clone, PartialEq, Eq, Hash, parse_display::FromStr, parse_display::Display, Debug, TryFromPrimitive)]
#[display(style = "lowercase")]
#[repr(u8)]
pub enum InnerHashAlgorithm {
    /// As string: `sha256`. As number: `FS_VERITY_HASH_ALG_SHA256` from the kernel API.
    Sha256 = 1,

    /// As string: `sha512`. As number: `FS_VERITY_HASH_ALG_SHA512` from the kernel API.
    Sha512 = 2,
}

impl Default for InnerHashAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl InnerHashAlgorithm {
    /// Size in bytes of the digests this algorithm produces.
    pub fn digest_size(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Input block size of the hash function itself (not the Merkle tree block size).
    /// The salt is zero-padded to a multiple of this.
    pub fn hash_block_size(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        Self::try_from(value).map_err(|_| Error::UnsupportedParams(format!("unknown hash algorithm number {}", value)))
    }
}

/// Parameters of one Merkle tree computation.
///
/// `file_size` is fixed up front: the hasher refuses a source whose readable length differs from it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MerkleTreeParams {
    pub hash_algorithm: InnerHashAlgorithm,
    pub block_size: usize,
    pub salt: Box<[u8]>,
    pub file_size: u64,
}

impl Default for MerkleTreeParams {
    fn default() -> Self {
        Self {
            hash_algorithm: Default::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            salt: Default::default(),
            file_size: 0,
        }
    }
}

impl MerkleTreeParams {
    pub fn new(file_size: u64) -> Self {
        Self { file_size, ..Default::default() }
    }

    pub fn with_hash_algorithm(mut self, hash_algorithm: InnerHashAlgorithm) -> Self {
        self.hash_algorithm = hash_algorithm;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_salt(mut self, salt: impl Into<Box<[u8]>>) -> Self {
        self.salt = salt.into();
        self
    }

    /// Checks the algorithm / block size / salt combination.
    ///
    /// The block size must be a power of two in `MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE`, and it must
    /// hold at least two digests so that every tree level shrinks.
    pub fn validate(&self) -> Result<()> {
        let digest_size = self.hash_algorithm.digest_size();
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(Error::UnsupportedParams(format!(
                "block size {} is not a power of two between {} and {}",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.block_size < digest_size * 2 {
            return Err(Error::UnsupportedParams(format!(
                "block size {} too small for {}",
                self.block_size, self.hash_algorithm
            )));
        }
        if self.salt.len() > MAX_SALT_SIZE {
            return Err(Error::InvalidArgument(format!(
                "salt is {} bytes, at most {} allowed",
                self.salt.len(),
                MAX_SALT_SIZE
            )));
        }
        self.level_block_counts().map(|_| ())
    }

    pub fn log_blocksize(&self) -> u8 {
        self.block_size.trailing_zeros() as u8
    }

    /// Number of digests that fit in one tree block: the fan-out of the tree.
    pub fn hashes_per_block(&self) -> u64 {
        (self.block_size / self.hash_algorithm.digest_size()) as u64
    }

    pub fn data_blocks(&self) -> u64 {
        div_ceil(self.file_size, self.block_size as u64)
    }

    /// Block count of each level of the hash tree, lowest level (hashes of data blocks) first.
    ///
    /// Files of at most one block have no tree levels at all: the root hash is the hash of
    /// the single data block.
    pub fn level_block_counts(&self) -> Result<Vec<u64>> {
        let mut counts = vec![];
        let mut blocks = self.data_blocks();
        while blocks > 1 {
            blocks = div_ceil(blocks, self.hashes_per_block());
            counts.push(blocks);
            if counts.len() > MAX_LEVELS {
                return Err(Error::UnsupportedParams(format!(
                    "file of {} bytes needs more than {} tree levels",
                    self.file_size, MAX_LEVELS
                )));
            }
        }
        Ok(counts)
    }

    /// Size in bytes of the serialized Merkle tree.
    pub fn tree_size(&self) -> Result<u64> {
        Ok(self.level_block_counts()?.iter().sum::<u64>() * self.block_size as u64)
    }
}

fn div_ceil(a: u64, b: u64) -> u64 {
    if a == 0 { 0 } else { (a - 1) / b + 1 }
}
