//! fs-verity measurements in pure Rust, descriptor signing, access to the Linux kernel's
//! verity metadata, and a crash-recoverable append-only record log.
//!
//! - [`digest`]: streaming Merkle tree over fixed-size blocks, producing the root hash and
//!   optionally the serialized tree.
//! - [`descriptor`]: the 256-byte fs-verity descriptor and the file digest computed from it.
//! - [`sign`]: signing backends behind the [`Signer`] trait.
//! - [`linux`]: `FS_IOC_ENABLE_VERITY`, `FS_IOC_MEASURE_VERITY` and `FS_IOC_READ_VERITY_METADATA`.
//! - [`protolog`]: the record log, with a header whose rewind offset marks the committed entries.
//!
//! ```
//! use verity_store::{file_measurement, MerkleTreeParams};
//!
//! let (_, digest) = file_measurement(std::io::empty(), &MerkleTreeParams::new(0)).unwrap();
//! assert_eq!(digest.to_string(), "sha256:3d248ca542a24fc62d1c43b916eae5016878e2533c88238480b26128a1f1af95");
//! ```

pub mod config;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod linux;
pub mod protolog;
pub mod sign;

pub use config::{InnerHashAlgorithm, MerkleTreeParams};
pub use descriptor::{file_measurement, FsVerityDescriptor, DESCRIPTOR_SIZE};
pub use digest::{compute_digest, compute_digest_with_tree, new_hasher, Digest, DynMerkleHasher, InnerHash, MerkleHasher, MerkleOutput};
pub use error::{Error, Result};
pub use linux::{MetadataSource, MetadataType, VerityFile};
pub use protolog::{ProtoLog, Options as ProtoLogOptions};
pub use sign::{DigestSigner, KeyFileSigner, Pkcs11Signer, Signer, SigningParams};

/// Alias for `MerkleHasher<Sha256>`
pub type MerkleSha256 = MerkleHasher<sha2::Sha256>;

/// Alias for `MerkleHasher<Sha512>`
pub type MerkleSha512 = MerkleHasher<sha2::Sha512>;
