use sha2::{Digest as _, Sha256, Sha512};
use std::io::Read;

use crate::config::*;
use crate::digest::{compute_digest, Digest};
use crate::error::{Error, Result};

/// Size of the serialized fs-verity descriptor.
pub const DESCRIPTOR_SIZE: usize = 256;

// https://www.kernel.org/doc/html/latest/filesystems/fsverity.html#fs-verity-descriptor
// $LINUX/include/uapi/linux/fsverity.h, struct fsverity_descriptor
const OFF_VERSION: usize = 0;
const OFF_HASH_ALGORITHM: usize = 1;
const OFF_LOG_BLOCKSIZE: usize = 2;
const OFF_SALT_SIZE: usize = 3;
const OFF_SIG_SIZE: usize = 4;
const OFF_DATA_SIZE: usize = 8;
const OFF_ROOT_HASH: usize = 16;
const OFF_SALT: usize = OFF_ROOT_HASH + MAX_DIGEST_SIZE;
const OFF_RESERVED: usize = OFF_SALT + MAX_SALT_SIZE;

const FORMATTED_DIGEST_MAGIC: &[u8; 8] = b"FSVerity";

/// The canonical fixed-layout structure that summarizes a file's verity parameters and root hash.
///
/// Its serialized form is what the kernel hashes to obtain the file digest (the "measurement"),
/// and it is what gets handed to a [`crate::sign::Signer`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FsVerityDescriptor {
    pub version: u8,
    pub log_blocksize: u8,
    /// Non-zero only in descriptors read back from disk; always zeroed before hashing.
    pub sig_size: u32,
    pub data_size: u64,
    root_hash: Digest,
    salt: Box<[u8]>,
}

impl FsVerityDescriptor {
    /// Packs a computed root hash and the tree parameters into a descriptor. No hashing happens here.
    pub fn new(root_hash: &Digest, data_size: u64, params: &MerkleTreeParams) -> Result<Self> {
        params.validate()?;
        if root_hash.algorithm() != params.hash_algorithm {
            return Err(Error::InvalidArgument(format!(
                "root hash is {}, params say {}",
                root_hash.algorithm(),
                params.hash_algorithm
            )));
        }
        Ok(Self {
            version: 1,
            log_blocksize: params.log_blocksize(),
            sig_size: 0,
            data_size,
            root_hash: root_hash.clone(),
            salt: params.salt.clone(),
        })
    }

    pub fn hash_algorithm(&self) -> InnerHashAlgorithm {
        self.root_hash.algorithm()
    }

    pub fn block_size(&self) -> usize {
        1 << self.log_blocksize
    }

    pub fn root_hash(&self) -> &Digest {
        &self.root_hash
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// The tree parameters this descriptor was built from.
    pub fn params(&self) -> MerkleTreeParams {
        MerkleTreeParams::new(self.data_size)
            .with_hash_algorithm(self.hash_algorithm())
            .with_block_size(self.block_size())
            .with_salt(self.salt.clone())
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf[OFF_VERSION] = self.version;
        buf[OFF_HASH_ALGORITHM] = self.hash_algorithm() as u8;
        buf[OFF_LOG_BLOCKSIZE] = self.log_blocksize;
        buf[OFF_SALT_SIZE] = self.salt.len() as u8;
        buf[OFF_SIG_SIZE..OFF_DATA_SIZE].copy_from_slice(&self.sig_size.to_le_bytes());
        buf[OFF_DATA_SIZE..OFF_ROOT_HASH].copy_from_slice(&self.data_size.to_le_bytes());
        let root = self.root_hash.as_bytes();
        buf[OFF_ROOT_HASH..OFF_ROOT_HASH + root.len()].copy_from_slice(root);
        buf[OFF_SALT..OFF_SALT + self.salt.len()].copy_from_slice(&self.salt);
        buf
    }

    /// Parses a serialized descriptor, e.g. one read back with `dump_metadata descriptor`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != DESCRIPTOR_SIZE {
            return Err(Error::Internal(format!("descriptor is {} bytes, expected {}", buf.len(), DESCRIPTOR_SIZE)));
        }
        if buf[OFF_VERSION] != 1 {
            return Err(Error::Internal(format!("unsupported descriptor version {}", buf[OFF_VERSION])));
        }
        let algorithm = InnerHashAlgorithm::from_u8(buf[OFF_HASH_ALGORITHM])?;
        let log_blocksize = buf[OFF_LOG_BLOCKSIZE];
        if (log_blocksize as u32) < MIN_BLOCK_SIZE.trailing_zeros() || (log_blocksize as u32) > MAX_BLOCK_SIZE.trailing_zeros() {
            return Err(Error::Internal(format!("descriptor log_blocksize {} out of range", log_blocksize)));
        }
        let salt_size = buf[OFF_SALT_SIZE] as usize;
        if salt_size > MAX_SALT_SIZE {
            return Err(Error::Internal(format!("descriptor salt_size {} out of range", salt_size)));
        }

        let digest_size = algorithm.digest_size();
        let root_hash = &buf[OFF_ROOT_HASH..OFF_SALT];
        let salt = &buf[OFF_SALT..OFF_RESERVED];
        let nonzero = |bytes: &[u8]| bytes.iter().any(|&b| b != 0);
        if nonzero(&root_hash[digest_size..]) || nonzero(&salt[salt_size..]) || nonzero(&buf[OFF_RESERVED..]) {
            return Err(Error::Internal("descriptor padding or reserved bytes are not zero".into()));
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[OFF_SIG_SIZE..OFF_DATA_SIZE]);
        let mut dword = [0u8; 8];
        dword.copy_from_slice(&buf[OFF_DATA_SIZE..OFF_ROOT_HASH]);

        Ok(Self {
            version: 1,
            log_blocksize,
            sig_size: u32::from_le_bytes(word),
            data_size: u64::from_le_bytes(dword),
            root_hash: Digest::new(algorithm, &root_hash[..digest_size])?,
            salt: salt[..salt_size].into(),
        })
    }

    /// Serialized form with `sig_size` zeroed: the bytes that are hashed and signed.
    pub fn canonical_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut bytes = self.to_bytes();
        bytes[OFF_SIG_SIZE..OFF_DATA_SIZE].fill(0);
        bytes
    }

    /// The fs-verity file digest: the hash of [`FsVerityDescriptor::canonical_bytes`].
    ///
    /// Unlike the tree blocks, this hash is not salted. It is the value `FS_IOC_MEASURE_VERITY` returns.
    pub fn measurement(&self) -> Digest {
        let bytes = self.canonical_bytes();
        let out: Box<[u8]> = match self.hash_algorithm() {
            InnerHashAlgorithm::Sha256 => Sha256::digest(bytes).as_slice().into(),
            InnerHashAlgorithm::Sha512 => Sha512::digest(bytes).as_slice().into(),
        };
        // lengths always agree, the algorithm picks both
        Digest::new(self.hash_algorithm(), out).unwrap_or_else(|_| Digest::zero(self.hash_algorithm()))
    }

    /// `struct fsverity_formatted_digest`: the message the kernel's builtin signature support expects
    /// to be signed. `"FSVerity"`, le16 algorithm, le16 digest size, then the measurement.
    pub fn formatted_digest(&self) -> Vec<u8> {
        let digest = self.measurement();
        let mut out = Vec::with_capacity(12 + digest.as_bytes().len());
        out.extend_from_slice(FORMATTED_DIGEST_MAGIC);
        out.extend_from_slice(&(digest.algorithm() as u16).to_le_bytes());
        out.extend_from_slice(&(digest.as_bytes().len() as u16).to_le_bytes());
        out.extend_from_slice(digest.as_bytes());
        out
    }
}

/// Hashes `source` and returns its descriptor together with the file digest.
pub fn file_measurement<R: Read>(source: R, params: &MerkleTreeParams) -> Result<(FsVerityDescriptor, Digest)> {
    let root = compute_digest(source, params)?;
    let descriptor = FsVerityDescriptor::new(&root, params.file_size, params)?;
    let measurement = descriptor.measurement();
    Ok((descriptor, measurement))
}
