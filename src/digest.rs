use sha2::digest::Output;
use sha2::{Sha256, Sha512};
use std::fmt;
use std::io::{self, Read, Write};

use crate::config::*;
use crate::error::{Error, Result};

static ZEROES: [u8; 128] = [0u8; 128];

/// Trait for the inner hash algorithms we support (currently implemented for [`Sha256`] and [`Sha512`]).
///
/// It adds some information we need, some useful functions, and declares all the trait bounds we need
/// so we have them in one place.
pub trait InnerHash: sha2::Digest + Clone {
    /// The value of [`InnerHashAlgorithm`] that corresponds to this hash algorithm.
    const VERITY_HASH_ALGORITHM: InnerHashAlgorithm;

    /// Update the hash state with given data, padded with zero bytes to the given size.
    fn update_padded(&mut self, data: &[u8], padded_size: usize) {
        debug_assert!(data.len() <= padded_size);
        sha2::Digest::update(self, data);
        self.update_zeroes(padded_size.saturating_sub(data.len()));
    }

    /// Update the hash state with the given amount of zero bytes
    fn update_zeroes(&mut self, amount: usize) {
        let (quotient, remainder) = (amount / ZEROES.len(), amount % ZEROES.len());
        if remainder != 0 { sha2::Digest::update(self, &ZEROES[..remainder]); }
        for _ in 0..quotient { sha2::Digest::update(self, &ZEROES[..]); }
    }

    /// The size in bytes of the digests produced by this hash function
    fn digest_output_size() -> usize {
        <Self as sha2::Digest>::output_size()
    }

    /// The native input block size of this hash function (in bytes)
    fn digest_block_size() -> usize {
        Self::VERITY_HASH_ALGORITHM.hash_block_size()
    }
}

impl InnerHash for Sha256 {
    const VERITY_HASH_ALGORITHM: InnerHashAlgorithm = InnerHashAlgorithm::Sha256;
}

impl InnerHash for Sha512 {
    const VERITY_HASH_ALGORITHM: InnerHashAlgorithm = InnerHashAlgorithm::Sha512;
}

/// A hash value tagged with the algorithm that produced it.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Digest {
    algorithm: InnerHashAlgorithm,
    bytes: Box<[u8]>,
}

impl Digest {
    /// Fails if `bytes` is not exactly the algorithm's digest size.
    pub fn new(algorithm: InnerHashAlgorithm, bytes: impl Into<Box<[u8]>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() != algorithm.digest_size() {
            return Err(Error::InvalidArgument(format!(
                "{} digest must be {} bytes, got {}",
                algorithm,
                algorithm.digest_size(),
                bytes.len()
            )));
        }
        Ok(Self { algorithm, bytes })
    }

    pub fn from_hex(algorithm: InnerHashAlgorithm, hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| Error::InvalidArgument(format!("bad hex digest: {}", e)))?;
        Self::new(algorithm, bytes)
    }

    /// All-zero digest; the kernel defines this as the root hash of an empty file.
    pub fn zero(algorithm: InnerHashAlgorithm) -> Self {
        Self { algorithm, bytes: vec![0u8; algorithm.digest_size()].into() }
    }

    pub fn algorithm(&self) -> InnerHashAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

/// Logically this represents a fixed-size block of data to be hashed (padded with zeroes if needed.)
/// It actually remembers only the hash state and how many more bytes are needed, not the data itself.
/// But that's an implementation detail.
#[derive(Clone)]
struct FixedSizeBlock<D> where D: InnerHash {
    inner: D,
    remaining: usize,
}

impl<D> FixedSizeBlock<D> where D: InnerHash {
    fn new(inner: D, block_size: usize) -> Self {
        Self { inner, remaining: block_size }
    }

    /// Appends data to the block. Callers never hand in more than `remaining` bytes.
    fn append(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.remaining);
        sha2::Digest::update(&mut self.inner, data);
        self.remaining -= data.len();
    }

    /// Appends as much as possible to the block, returning the data that wouldn't fit.
    fn overflowing_append<'a>(&mut self, data: &'a [u8]) -> &'a [u8] {
        let (a, b) = data.split_at(self.remaining.min(data.len()));
        self.append(a);
        b
    }

    /// Fills the rest of the block with zero bytes and returns its hash.
    fn finalize(mut self) -> Output<D> {
        self.inner.update_zeroes(self.remaining);
        self.inner.finalize()
    }
}

/// Returns an instance of the hash algorithm which has been fed the given salt,
/// zero-padded to a multiple of the hash algorithm's input block size.
fn salted_digest<D: InnerHash>(salt: &[u8]) -> D {
    let mut tmp = D::new();
    // in practice this will run either 0 or 1 iterations, due to low MAX_SALT_SIZE
    for chunk in salt.chunks(D::digest_block_size()) {
        tmp.update_padded(chunk, D::digest_block_size());
    }
    tmp
}

/// Result of hashing a whole file.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MerkleOutput {
    pub root_hash: Digest,
    pub data_size: u64,
    /// Serialized tree in on-disk order: top level first, zero-padded blocks. Only present
    /// when recording was requested. Empty for files of at most one block.
    pub tree: Option<Vec<u8>>,
}

/// Streaming fs-verity Merkle tree hasher.
///
/// Data is fed in with [`MerkleHasher::update`] (or through [`std::io::Write`]) and only one
/// partially filled block per tree level is kept in memory. [`MerkleHasher::finish`] flushes
/// all levels and produces the root hash.
#[derive(Clone)]
pub struct MerkleHasher<D> where D: InnerHash {
    block_size: usize,
    expected_size: u64,
    total_size: u64,
    /// Cloned whenever we need a new empty block.
    empty_block: FixedSizeBlock<D>,
    /// The currently relevant hierarchy of blocks in the Merkle tree.
    levels: Vec<FixedSizeBlock<D>>,
    /// Contents of every tree level written so far, lowest level first.
    tree: Option<Vec<Vec<u8>>>,
}

impl<D> MerkleHasher<D> where D: InnerHash {

    /// Creates a hasher for `params`. The algorithm in `params` must match `D`.
    pub fn new(params: &MerkleTreeParams) -> Result<Self> {
        params.validate()?;
        if params.hash_algorithm != D::VERITY_HASH_ALGORITHM {
            return Err(Error::InvalidArgument(format!(
                "params ask for {}, hasher is {}",
                params.hash_algorithm,
                D::VERITY_HASH_ALGORITHM
            )));
        }
        log::debug!(
            "merkle tree: {} bytes, {} block size {}, levels {:?}",
            params.file_size,
            params.hash_algorithm,
            params.block_size,
            params.level_block_counts()?
        );

        Ok(Self {
            block_size: params.block_size,
            expected_size: params.file_size,
            total_size: 0,
            empty_block: FixedSizeBlock::new(salted_digest(&params.salt), params.block_size),
            levels: vec![],
            tree: None,
        })
    }

    /// Keep the hash blocks of every level so [`MerkleHasher::finish`] can return the serialized tree.
    pub fn record_tree(mut self) -> Self {
        self.tree = Some(vec![]);
        self
    }

    pub fn inner_hash_algorithm(&self) -> InnerHashAlgorithm {
        D::VERITY_HASH_ALGORITHM
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.total_size
    }

    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        if self.total_size + data.len() as u64 > self.expected_size {
            return Err(Error::DataLoss(format!(
                "source is longer than the declared file size of {} bytes",
                self.expected_size
            )));
        }

        // self.levels represents the hierarchy of currently-relevant Merkle tree blocks.
        // level 0 is filled with input data. when the block at level n fills up, the hash of its
        // contents is appended to the block at level n + 1, and it is reset to an empty state.
        // this process can repeat if that causes the next level to fill up and so on.
        //
        // invariants:
        // - level 0 is (once it's created) never empty. it *may* be completely full.
        // - levels 1..n are never full, they always have room for one more hash. they *may* be empty.
        // - overflow is never larger than self.block_size
        //
        // the asymmetry between level 0 and the others guarantees that each level produces exactly
        // one more digest for the next level during the final flush.
        for chunk in data.chunks(self.block_size) {
            self.total_size += chunk.len() as u64;

            let mut last_digest: Output<D>;
            let mut overflow = chunk;  // input data is treated as overflow into level[0]
            let mut height = 0;
            for level in self.levels.iter_mut() {
                if height > 0 {
                    record(&mut self.tree, height, overflow);
                }

                // valid block sizes and digest sizes are powers of two and digest levels always keep
                // room for one more digest, so a digest is never split across two blocks.
                overflow = level.overflowing_append(overflow);
                if height > 0 {
                    if level.remaining >= D::digest_output_size() {
                        break;
                    }
                } else if overflow.is_empty() {
                    // done if there was no overflow, even if the block is now totally full
                    break;
                }

                let full = std::mem::replace(level, self.empty_block.clone());
                let digest = full.finalize();
                level.append(overflow);
                last_digest = digest;
                overflow = &last_digest;
                height += 1;
            }

            // if there is still overflow, add a new top level to the Merkle tree
            if !overflow.is_empty() {
                // level 0 holds data, so the tree itself may have MAX_LEVELS levels above it
                if self.levels.len() > MAX_LEVELS {
                    return Err(Error::Internal(format!("merkle tree exceeds {} levels", MAX_LEVELS)));
                }
                if height > 0 {
                    record(&mut self.tree, height, overflow);
                }
                let mut level = self.empty_block.clone();
                level.append(overflow);
                self.levels.push(level);
            }
        }
        Ok(())
    }

    /// Flushes all levels and returns the root hash (and the tree, if recording).
    pub fn finish(mut self) -> Result<MerkleOutput> {
        if self.total_size != self.expected_size {
            return Err(Error::DataLoss(format!(
                "read {} bytes, expected {}",
                self.total_size, self.expected_size
            )));
        }

        // flush all levels, and calculate the hash of the top level. zero length files are
        // defined to have a root hash of all zeroes, so last_digest starts out zeroed.
        let mut last_digest: Output<D> = Default::default();
        let mut overflow: &[u8] = &[];
        let levels = std::mem::take(&mut self.levels);
        for (height, mut level) in levels.into_iter().enumerate() {
            if height > 0 {
                record(&mut self.tree, height, overflow);
            }
            level.append(overflow);
            last_digest = level.finalize();
            overflow = &last_digest;
        }

        let tree = self.tree.take().map(|mut levels| {
            let mut out = Vec::with_capacity(levels.iter().map(|l| l.len() + self.block_size).sum());
            for level in levels.iter_mut().rev() {
                let padded = (level.len() + self.block_size - 1) / self.block_size * self.block_size;
                level.resize(padded, 0);
                out.extend_from_slice(level);
            }
            out
        });

        Ok(MerkleOutput {
            root_hash: Digest::new(D::VERITY_HASH_ALGORITHM, last_digest.as_slice())?,
            data_size: self.total_size,
            tree,
        })
    }
}

fn record(tree: &mut Option<Vec<Vec<u8>>>, height: usize, digest: &[u8]) {
    if let Some(levels) = tree {
        if levels.len() < height {
            levels.resize_with(height, Vec::new);
        }
        levels[height - 1].extend_from_slice(digest);
    }
}

impl<D> Write for MerkleHasher<D> where D: InnerHash {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// For trait objects of [`MerkleHasher`], when the inner hash is only known at runtime.
pub trait DynMerkleHasher: Write {
    fn feed(&mut self, data: &[u8]) -> Result<()>;
    fn finish_boxed(self: Box<Self>) -> Result<MerkleOutput>;
}

impl<D: InnerHash + 'static> DynMerkleHasher for MerkleHasher<D> {
    fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.update(data)
    }

    fn finish_boxed(self: Box<Self>) -> Result<MerkleOutput> {
        (*self).finish()
    }
}

/// Creates a hasher for the algorithm selected in `params`.
pub fn new_hasher(params: &MerkleTreeParams, record_tree: bool) -> Result<Box<dyn DynMerkleHasher>> {
    fn boxed<D: InnerHash + 'static>(params: &MerkleTreeParams, record_tree: bool) -> Result<Box<dyn DynMerkleHasher>> {
        let hasher = MerkleHasher::<D>::new(params)?;
        Ok(Box::new(if record_tree { hasher.record_tree() } else { hasher }))
    }
    match params.hash_algorithm {
        InnerHashAlgorithm::Sha256 => boxed::<Sha256>(params, record_tree),
        InnerHashAlgorithm::Sha512 => boxed::<Sha512>(params, record_tree),
    }
}

fn hash_stream<R: Read>(mut source: R, params: &MerkleTreeParams, record_tree: bool) -> Result<MerkleOutput> {
    let mut hasher = new_hasher(params, record_tree)?;
    let mut buf = vec![0u8; params.block_size];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.feed(&buf[..n])?;
    }
    hasher.finish_boxed()
}

/// Computes the Merkle tree root hash of `source`, which must yield exactly `params.file_size` bytes.
pub fn compute_digest<R: Read>(source: R, params: &MerkleTreeParams) -> Result<Digest> {
    Ok(hash_stream(source, params, false)?.root_hash)
}

/// Like [`compute_digest`], but also writes the serialized Merkle tree to `sink`.
///
/// Nothing is written unless hashing succeeds; a failed write fails the whole call.
pub fn compute_digest_with_tree<R: Read, W: Write>(source: R, params: &MerkleTreeParams, mut sink: W) -> Result<MerkleOutput> {
    let out = hash_stream(source, params, true)?;
    if let Some(tree) = &out.tree {
        sink.write_all(tree)?;
    }
    sink.flush()?;
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use sha2::Digest as _;

    pub(crate) fn known_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Straightforward level-by-level construction to check the streaming hasher against.
    fn naive_root(data: &[u8], params: &MerkleTreeParams) -> Vec<u8> {
        fn naive<D: InnerHash>(data: &[u8], bs: usize, salt: &[u8]) -> Vec<u8> {
            let hash = |block: &[u8]| {
                let mut d = salted_digest::<D>(salt);
                d.update_padded(block, bs);
                d.finalize().to_vec()
            };
            if data.is_empty() {
                return vec![0u8; D::digest_output_size()];
            }
            let mut hashes: Vec<Vec<u8>> = data.chunks(bs).map(hash).collect();
            while hashes.len() > 1 {
                let level = hashes.concat();
                hashes = level.chunks(bs).map(hash).collect();
            }
            hashes.remove(0)
        }
        match params.hash_algorithm {
            InnerHashAlgorithm::Sha256 => naive::<Sha256>(data, params.block_size, &params.salt),
            InnerHashAlgorithm::Sha512 => naive::<Sha512>(data, params.block_size, &params.salt),
        }
    }

    #[test]
    fn ten_thousand_bytes_pinned() {
        let data = known_content(10000);
        let params = MerkleTreeParams::new(10000);
        let root = compute_digest(&data[..], &params).unwrap();
        assert_eq!(root.algorithm(), InnerHashAlgorithm::Sha256);
        assert_eq!(root.to_hex(), "8a2bffc6fb598748c269ebe6d8ab21f3fb97f578f330d7c36818e08ef74b8112");
    }

    #[test]
    fn empty_file_has_zero_root() {
        let root = compute_digest(io::empty(), &MerkleTreeParams::new(0)).unwrap();
        assert_eq!(root, Digest::zero(InnerHashAlgorithm::Sha256));

        let params = MerkleTreeParams::new(0).with_hash_algorithm(InnerHashAlgorithm::Sha512);
        let out = compute_digest_with_tree(io::empty(), &params, io::sink()).unwrap();
        assert_eq!(out.root_hash.as_bytes(), &[0u8; 64][..]);
        assert_eq!(out.tree, Some(vec![]));
    }

    #[test]
    fn single_block_root_is_block_hash() {
        let data = known_content(100);
        let root = compute_digest(&data[..], &MerkleTreeParams::new(100)).unwrap();
        let mut padded = data.clone();
        padded.resize(4096, 0);
        assert_eq!(root.as_bytes(), Sha256::digest(&padded).as_slice());
    }

    #[test]
    fn partial_block_equals_zero_padded_file() {
        let data = known_content(10000);
        let mut padded = data.clone();
        padded.resize(12288, 0);
        let a = compute_digest(&data[..], &MerkleTreeParams::new(10000)).unwrap();
        let b = compute_digest(&padded[..], &MerkleTreeParams::new(12288)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn every_input_changes_digest() {
        let data = known_content(10000);
        let base = MerkleTreeParams::new(10000);
        let reference = compute_digest(&data[..], &base).unwrap();
        assert_eq!(reference, compute_digest(&data[..], &base).unwrap());

        let mut flipped = data.clone();
        flipped[9999] ^= 1;
        assert_ne!(reference, compute_digest(&flipped[..], &base).unwrap());

        for params in [
            base.clone().with_salt(vec![1u8]),
            base.clone().with_block_size(1024),
            base.clone().with_hash_algorithm(InnerHashAlgorithm::Sha512),
        ] {
            assert_ne!(reference.as_bytes(), compute_digest(&data[..], &params).unwrap().as_bytes());
        }
    }

    #[test]
    fn tree_output_layout() {
        // 129 blocks: two blocks in the lowest level, one on top
        let data = known_content(129 * 4096);
        let params = MerkleTreeParams::new(data.len() as u64);
        let mut sink = vec![];
        let out = compute_digest_with_tree(&data[..], &params, &mut sink).unwrap();
        assert_eq!(sink.len() as u64, params.tree_size().unwrap());
        assert_eq!(Some(sink.clone()), out.tree);
        assert_eq!(sink.len(), 3 * 4096);

        // top level first, and the root is the hash of its only block
        assert_eq!(out.root_hash.as_bytes(), Sha256::digest(&sink[..4096]).as_slice());
        assert_eq!(&sink[..32], Sha256::digest(&sink[4096..8192]).as_slice());
        assert_eq!(&sink[32..64], Sha256::digest(&sink[8192..12288]).as_slice());
        assert_eq!(&sink[64..4096], &[0u8; 4032][..]);

        // the lowest level holds the data block hashes
        assert_eq!(&sink[4096..4128], Sha256::digest(&data[..4096]).as_slice());
        assert_eq!(&sink[8192..8224], Sha256::digest(&data[128 * 4096..]).as_slice());
        assert_eq!(&sink[8224..], &[0u8; 4064][..]);
    }

    #[test]
    fn size_mismatch_is_data_loss() {
        let data = known_content(5000);
        let short = compute_digest(&data[..], &MerkleTreeParams::new(6000));
        assert!(matches!(short, Err(Error::DataLoss(_))));
        let long = compute_digest(&data[..], &MerkleTreeParams::new(4000));
        assert!(matches!(long, Err(Error::DataLoss(_))));
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EIO))
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WriteZero))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn io_failures_propagate() {
        match compute_digest(FailingReader, &MerkleTreeParams::new(10)) {
            Err(Error::Io(e)) => assert_eq!(e.raw_os_error(), Some(libc::EIO)),
            other => panic!("unexpected {:?}", other),
        }
        let data = known_content(10000);
        let res = compute_digest_with_tree(&data[..], &MerkleTreeParams::new(10000), FailingWriter);
        assert!(matches!(res, Err(Error::Io(_))));
    }

    #[test]
    fn hasher_rejects_wrong_algorithm() {
        let params = MerkleTreeParams::new(0).with_hash_algorithm(InnerHashAlgorithm::Sha512);
        assert!(matches!(MerkleHasher::<Sha256>::new(&params), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn io_copy_into_hasher() {
        let data = known_content(10000);
        let mut hasher = MerkleHasher::<Sha256>::new(&MerkleTreeParams::new(10000)).unwrap();
        io::copy(&mut &data[..], &mut hasher).unwrap();
        assert_eq!(hasher.bytes_hashed(), 10000);
        let out = hasher.finish().unwrap();
        assert_eq!(out.root_hash.to_hex(), "8a2bffc6fb598748c269ebe6d8ab21f3fb97f578f330d7c36818e08ef74b8112");
        assert_eq!(out.tree, None);
    }

    fn arb_params() -> impl Strategy<Value = (InnerHashAlgorithm, usize, Vec<u8>)> {
        (
            prop_oneof![Just(InnerHashAlgorithm::Sha256), Just(InnerHashAlgorithm::Sha512)],
            prop_oneof![Just(512usize), Just(1024usize)],
            proptest::collection::vec(any::<u8>(), 0..=MAX_SALT_SIZE),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn streaming_matches_naive(
            len in 0usize..40_000,
            (alg, bs, salt) in arb_params(),
            split in 1usize..5000,
        ) {
            let data = known_content(len);
            let params = MerkleTreeParams::new(len as u64)
                .with_hash_algorithm(alg)
                .with_block_size(bs)
                .with_salt(salt);

            let mut hasher = new_hasher(&params, true).unwrap();
            for piece in data.chunks(split) {
                hasher.feed(piece).unwrap();
            }
            let out = hasher.finish_boxed().unwrap();
            prop_assert_eq!(out.root_hash.as_bytes(), &naive_root(&data, &params)[..]);
            prop_assert_eq!(out.tree.unwrap().len() as u64, params.tree_size().unwrap());
        }
    }
}
