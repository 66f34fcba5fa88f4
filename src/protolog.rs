//! Append-only log of variable-length records backed by a single file.
//!
//! On-disk layout: a fixed [`Header`] followed by entries of the form `{length: u32 LE}{payload}`.
//! The payload is the record itself, or its zlib stream when the log was created with compression.
//! The header's `rewind_offset` marks the end of the last entry that was fully written and synced;
//! anything after it is left over from an interrupted append and is never surfaced.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const MAGIC: u32 = 0xF4C6F67A;
const VERSION: u32 = 1;

pub const HEADER_SIZE: u64 = Header::SIZE as u64;
pub const DEFAULT_MAX_PROTO_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 3;

const LENGTH_PREFIX_SIZE: u64 = 4;

// checksum and entry scans read in pieces of this size
const READ_CHUNK: usize = 64 * 1024;

fn crc64(bytes: &[u8]) -> u64 {
    let mut digest = crc64fast::Digest::new();
    digest.write(bytes);
    digest.sum64()
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Options {
    /// Fixed when the file is created; reopening with a different value fails.
    pub compress: bool,
    /// Largest record accepted by [`ProtoLog::append`], measured before compression.
    pub max_proto_size: u64,
    /// zlib level 0-9. Only affects new appends, so it is not persisted.
    pub compression_level: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            compress: true,
            max_proto_size: DEFAULT_MAX_PROTO_SIZE,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl Options {
    pub fn new(compress: bool, max_proto_size: u64) -> Self {
        Self { compress, max_proto_size, ..Default::default() }
    }

    fn validate(&self) -> Result<()> {
        if self.max_proto_size == 0 {
            return Err(Error::InvalidArgument("max_proto_size must be greater than 0".into()));
        }
        if self.max_proto_size > u32::MAX as u64 {
            return Err(Error::InvalidArgument(format!(
                "max_proto_size {} does not fit the header",
                self.max_proto_size
            )));
        }
        if self.compression_level > 9 {
            return Err(Error::InvalidArgument(format!(
                "compression level {} is not in 0..=9",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// The persisted first bytes of a log file.
///
/// ```text
/// offset size field
/// 0      4    magic
/// 4      4    version
/// 8      1    compress flag
/// 9      3    reserved
/// 12     4    max_proto_size
/// 16     8    rewind_offset (i64)
/// 24     8    reserved
/// 32     8    crc64 of bytes 0..32
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Header {
    pub compress: bool,
    pub max_proto_size: u32,
    pub rewind_offset: i64,
}

impl Header {
    pub const SIZE: usize = 40;
    const CHECKSUMMED: usize = 32;

    fn new(options: &Options) -> Self {
        Self {
            compress: options.compress,
            max_proto_size: options.max_proto_size as u32,
            rewind_offset: HEADER_SIZE as i64,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8] = self.compress as u8;
        buf[12..16].copy_from_slice(&self.max_proto_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.rewind_offset.to_le_bytes());
        let checksum = crc64(&buf[..Self::CHECKSUMMED]);
        buf[32..40].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Anything that does not parse, or that would put the rewind offset inside the header, is `Internal`.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Result<Self> {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(word)
        };

        let magic = u32_at(0);
        if magic != MAGIC {
            return Err(Error::Internal(format!("bad proto log magic {:#010x}", magic)));
        }
        let checksum = u64_at(32);
        if checksum != crc64(&buf[..Self::CHECKSUMMED]) {
            return Err(Error::Internal("proto log header checksum mismatch".into()));
        }
        let version = u32_at(4);
        if version != VERSION {
            return Err(Error::Internal(format!("unsupported proto log version {}", version)));
        }
        let compress = match buf[8] {
            0 => false,
            1 => true,
            other => return Err(Error::Internal(format!("bad compress flag {}", other))),
        };
        if buf[9..12].iter().chain(&buf[24..32]).any(|&b| b != 0) {
            return Err(Error::Internal("proto log header reserved bytes are not zero".into()));
        }
        let max_proto_size = u32_at(12);
        if max_proto_size == 0 {
            return Err(Error::Internal("proto log header has max_proto_size 0".into()));
        }
        let rewind_offset = u64_at(16) as i64;
        if rewind_offset < HEADER_SIZE as i64 {
            return Err(Error::Internal(format!("proto log rewind offset {} is invalid", rewind_offset)));
        }
        Ok(Self { compress, max_proto_size, rewind_offset })
    }
}

/// What [`ProtoLog::create`] found on disk.
pub struct CreateResult {
    pub log: ProtoLog,
    /// The file did not exist (or was empty) and a fresh header was written.
    pub new_file: bool,
    /// Bytes past the rewind offset left by an interrupted append. They are ignored, and
    /// overwritten by the next append.
    pub recovered_bytes: u64,
}

/// Handle to one log file.
///
/// Appends take `&mut self`, so there is a single writer per handle; reads take `&self` and
/// use positional I/O, so they may run concurrently with each other.
pub struct ProtoLog {
    file: File,
    path: PathBuf,
    header: Header,
    options: Options,
    file_len: u64,
}

impl ProtoLog {
    /// Opens the log at `path`, creating it if needed.
    ///
    /// An existing log must have been created with the same `compress` setting, and
    /// `options.max_proto_size` may grow but not shrink. A corrupt header is reported as
    /// `Internal`; the file is never deleted or rewritten in that case.
    pub fn create(path: impl AsRef<Path>, options: Options) -> Result<CreateResult> {
        options.validate()?;
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let file_len = file.metadata()?.len();

        if file_len == 0 {
            let header = Header::new(&options);
            file.write_all_at(&header.to_bytes(), 0)?;
            file.sync_all()?;
            log::info!(
                "created proto log {} (compress={}, max_proto_size={})",
                path.display(),
                options.compress,
                options.max_proto_size
            );
            let log = Self { file, path: path.to_owned(), header, options, file_len: HEADER_SIZE };
            return Ok(CreateResult { log, new_file: true, recovered_bytes: 0 });
        }

        if file_len < HEADER_SIZE {
            return Err(Error::Internal(format!(
                "{} is {} bytes, too short for a proto log header",
                path.display(),
                file_len
            )));
        }
        let mut buf = [0u8; Header::SIZE];
        file.read_exact_at(&mut buf, 0)?;
        let mut header = Header::from_bytes(&buf)?;

        if header.compress != options.compress {
            return Err(Error::InvalidArgument(format!(
                "{} was created with compress={}, cannot open with compress={}",
                path.display(),
                header.compress,
                options.compress
            )));
        }
        if options.max_proto_size < header.max_proto_size as u64 {
            return Err(Error::InvalidArgument(format!(
                "max_proto_size {} is smaller than the {} this log was written with",
                options.max_proto_size, header.max_proto_size
            )));
        }
        let rewind_offset = header.rewind_offset as u64;
        if rewind_offset > file_len {
            return Err(Error::DataLoss(format!(
                "{} is {} bytes but its header commits {}",
                path.display(),
                file_len,
                rewind_offset
            )));
        }

        if options.max_proto_size > header.max_proto_size as u64 {
            header.max_proto_size = options.max_proto_size as u32;
            file.write_all_at(&header.to_bytes(), 0)?;
            file.sync_data()?;
        }

        let recovered_bytes = file_len - rewind_offset;
        if recovered_bytes > 0 {
            log::warn!(
                "{}: ignoring {} uncommitted bytes after offset {}",
                path.display(),
                recovered_bytes,
                rewind_offset
            );
        }

        let log = Self { file, path: path.to_owned(), header, options, file_len };
        Ok(CreateResult { log, new_file: false, recovered_bytes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// End of the last committed entry.
    pub fn rewind_offset(&self) -> u64 {
        self.header.rewind_offset as u64
    }

    /// Appends one record and returns the offset of its entry, for use with [`ProtoLog::read_at`].
    ///
    /// The entry is written and synced before the header's rewind offset moves past it, so a
    /// crash at any point leaves the header describing only complete entries.
    pub fn append(&mut self, record: &[u8]) -> Result<u64> {
        if record.len() as u64 > self.options.max_proto_size {
            return Err(Error::InvalidArgument(format!(
                "record of {} bytes exceeds max_proto_size {}",
                record.len(),
                self.options.max_proto_size
            )));
        }

        let payload: Cow<[u8]> = if self.header.compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.options.compression_level));
            encoder.write_all(record)?;
            Cow::Owned(encoder.finish()?)
        } else {
            Cow::Borrowed(record)
        };
        let length = u32::try_from(payload.len())
            .map_err(|_| Error::InvalidArgument(format!("entry of {} bytes is too large", payload.len())))?;

        let offset = self.rewind_offset();
        if self.file_len > offset {
            // uncommitted bytes from an interrupted append
            self.file.set_len(offset)?;
            self.file_len = offset;
        }

        let mut entry = Vec::with_capacity(LENGTH_PREFIX_SIZE as usize + payload.len());
        entry.extend_from_slice(&length.to_le_bytes());
        entry.extend_from_slice(&payload);
        self.file.write_all_at(&entry, offset)?;
        self.file.sync_data()?;
        let end = offset + entry.len() as u64;
        self.file_len = end;

        let mut header = self.header;
        header.rewind_offset = end as i64;
        self.file.write_all_at(&header.to_bytes(), 0)?;
        self.file.sync_data()?;
        self.header = header;

        log::debug!(
            "{}: appended {} byte record ({} on disk) at {}",
            self.path.display(),
            record.len(),
            payload.len(),
            offset
        );
        Ok(offset)
    }

    /// Reads the record whose entry starts at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<Vec<u8>> {
        self.read_entry(offset).map(|(record, _)| record)
    }

    /// Returns the record at `offset` and the offset of the entry after it.
    fn read_entry(&self, offset: u64) -> Result<(Vec<u8>, u64)> {
        let end = self.rewind_offset();
        if offset < HEADER_SIZE || offset >= end {
            return Err(Error::InvalidArgument(format!(
                "offset {} is outside the committed entries [{}, {})",
                offset, HEADER_SIZE, end
            )));
        }
        if end - offset < LENGTH_PREFIX_SIZE {
            return Err(Error::DataLoss(format!("entry at {} is cut off in its length prefix", offset)));
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE as usize];
        self.file.read_exact_at(&mut prefix, offset)?;
        let length = u32::from_le_bytes(prefix) as u64;
        let payload_offset = offset + LENGTH_PREFIX_SIZE;
        if length > end - payload_offset {
            return Err(Error::DataLoss(format!(
                "entry at {} claims {} bytes but only {} remain",
                offset,
                length,
                end - payload_offset
            )));
        }

        let mut payload = vec![0u8; length as usize];
        self.file.read_exact_at(&mut payload, payload_offset)?;
        let max = self.options.max_proto_size;
        let record = if self.header.compress {
            let mut record = Vec::new();
            ZlibDecoder::new(&payload[..])
                .take(max + 1)
                .read_to_end(&mut record)
                .map_err(|e| Error::DataLoss(format!("entry at {} does not decompress: {}", offset, e)))?;
            record
        } else {
            payload
        };
        if record.len() as u64 > max {
            return Err(Error::DataLoss(format!(
                "entry at {} holds more than max_proto_size {} bytes",
                offset, max
            )));
        }
        Ok((record, payload_offset + length))
    }

    /// Iterates over `(offset, record)` for every committed entry, in append order.
    ///
    /// Each call starts again from the first entry. Iteration stops after the first error.
    pub fn iter(&self) -> Iter<'_> {
        Iter { log: self, offset: HEADER_SIZE, done: false }
    }

    /// Drops uncommitted bytes past the rewind offset from the file. Returns how many were dropped.
    pub fn truncate_to_rewind_offset(&mut self) -> Result<u64> {
        let offset = self.rewind_offset();
        let dropped = self.file_len.saturating_sub(offset);
        if dropped > 0 {
            self.file.set_len(offset)?;
            self.file.sync_all()?;
            self.file_len = offset;
            log::info!("{}: truncated {} uncommitted bytes", self.path.display(), dropped);
        }
        Ok(dropped)
    }

    pub fn persist_to_disk(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Size of the file on disk, including any uncommitted tail.
    pub fn disk_usage(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Bytes taken by committed entries.
    pub fn elements_size(&self) -> u64 {
        self.rewind_offset() - HEADER_SIZE
    }

    /// crc64 over the committed entries, a fingerprint of the log's contents.
    pub fn compute_checksum(&self) -> Result<u64> {
        let mut digest = crc64fast::Digest::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut offset = HEADER_SIZE;
        let end = self.rewind_offset();
        while offset < end {
            let n = READ_CHUNK.min((end - offset) as usize);
            self.file.read_exact_at(&mut buf[..n], offset)?;
            digest.write(&buf[..n]);
            offset += n as u64;
        }
        Ok(digest.sum64())
    }
}

pub struct Iter<'a> {
    log: &'a ProtoLog,
    offset: u64,
    done: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.log.rewind_offset() {
            return None;
        }
        let offset = self.offset;
        match self.log.read_entry(offset) {
            Ok((record, next)) => {
                self.offset = next;
                Some(Ok((offset, record)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn records(log: &ProtoLog) -> Vec<Vec<u8>> {
        log.iter().map(|r| r.unwrap().1).collect()
    }

    #[test]
    fn new_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let created = ProtoLog::create(&path, Options::new(false, 100)).unwrap();
        assert!(created.new_file);
        assert_eq!(created.recovered_bytes, 0);
        assert_eq!(created.log.rewind_offset(), HEADER_SIZE);
        assert_eq!(created.log.elements_size(), 0);
        assert_eq!(created.log.iter().count(), 0);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, HEADER_SIZE);
        assert_eq!(&bytes[0..4], &MAGIC.to_le_bytes());
        assert_eq!(bytes[8], 0);
        assert_eq!(&bytes[12..16], &100u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &40i64.to_le_bytes());
    }

    #[test]
    fn uncompressed_entry_framing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut log = ProtoLog::create(&path, Options::new(false, 100)).unwrap().log;
        assert_eq!(log.append(b"abc").unwrap(), HEADER_SIZE);
        assert_eq!(log.append(b"").unwrap(), HEADER_SIZE + 7);
        assert_eq!(log.rewind_offset(), HEADER_SIZE + 11);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[40..47], &[3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(&bytes[47..51], &[0, 0, 0, 0]);
        assert_eq!(records(&log), vec![b"abc".to_vec(), vec![]]);
    }

    #[test]
    fn compressed_payload_is_zlib() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut log = ProtoLog::create(&path, Options::default()).unwrap().log;
        let record = vec![b'x'; 10_000];
        let offset = log.append(&record).unwrap();
        assert!(log.elements_size() < 200);
        assert_eq!(log.read_at(offset).unwrap(), record);

        let bytes = fs::read(&path).unwrap();
        let mut decoded = vec![];
        ZlibDecoder::new(&bytes[44..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn max_proto_size_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let zero = ProtoLog::create(&path, Options::new(true, 0));
        assert!(matches!(zero.map(|_| ()), Err(Error::InvalidArgument(_))));

        for compress in [false, true] {
            let path = dir.path().join(format!("log-{}", compress));
            let mut log = ProtoLog::create(&path, Options::new(compress, 16)).unwrap().log;
            let offset = log.append(&[1u8; 16]).unwrap();
            assert_eq!(log.read_at(offset).unwrap(), vec![1u8; 16]);
            assert!(matches!(log.append(&[1u8; 17]), Err(Error::InvalidArgument(_))));
            assert_eq!(records(&log).len(), 1);
        }
    }

    #[test]
    fn compress_mismatch_rejected_without_damage() {
        let dir = tempfile::tempdir().unwrap();
        for compress in [true, false] {
            let path = dir.path().join(format!("log-{}", compress));
            {
                let mut log = ProtoLog::create(&path, Options::new(compress, 100)).unwrap().log;
                log.append(b"one").unwrap();
            }
            let before = fs::read(&path).unwrap();
            let res = ProtoLog::create(&path, Options::new(!compress, 100));
            assert!(matches!(res.map(|_| ()), Err(Error::InvalidArgument(_))));
            assert_eq!(fs::read(&path).unwrap(), before);

            let log = ProtoLog::create(&path, Options::new(compress, 100)).unwrap().log;
            assert_eq!(records(&log), vec![b"one".to_vec()]);
        }
    }

    #[test]
    fn max_proto_size_can_only_grow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        ProtoLog::create(&path, Options::new(false, 100)).unwrap();
        assert!(matches!(
            ProtoLog::create(&path, Options::new(false, 99)).map(|_| ()),
            Err(Error::InvalidArgument(_))
        ));
        let log = ProtoLog::create(&path, Options::new(false, 200)).unwrap().log;
        assert_eq!(log.header().max_proto_size, 200);
        drop(log);
        // the larger size was persisted
        assert!(ProtoLog::create(&path, Options::new(false, 100)).is_err());
    }

    #[test]
    fn trailing_garbage_is_ignored_then_overwritten() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let committed;
        {
            let mut log = ProtoLog::create(&path, Options::default()).unwrap().log;
            for i in 0..5u8 {
                log.append(&vec![i; 100 + i as usize]).unwrap();
            }
            committed = log.rewind_offset();
        }
        let garbage = [0xEEu8; 4000];
        OpenOptions::new().append(true).open(&path).unwrap().write_all(&garbage).unwrap();

        let created = ProtoLog::create(&path, Options::default()).unwrap();
        assert!(!created.new_file);
        assert_eq!(created.recovered_bytes, garbage.len() as u64);
        let mut log = created.log;
        let expected: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 100 + i as usize]).collect();
        assert_eq!(records(&log), expected);

        assert_eq!(log.append(b"six").unwrap(), committed);
        let mut expected = expected;
        expected.push(b"six".to_vec());
        assert_eq!(records(&log), expected);
        assert_eq!(fs::metadata(&path).unwrap().len(), log.rewind_offset());
    }

    #[test]
    fn half_written_entry_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let (committed, header) = {
            let mut log = ProtoLog::create(&path, Options::new(false, 1000)).unwrap().log;
            log.append(b"first").unwrap();
            let header = fs::read(&path).unwrap()[..Header::SIZE].to_vec();
            log.append(&[7u8; 500]).unwrap();
            (log.rewind_offset(), header)
        };
        // roll the header back and cut the second entry short, as if we crashed mid-append
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&header, 0).unwrap();
        file.set_len(committed - 200).unwrap();

        let created = ProtoLog::create(&path, Options::new(false, 1000)).unwrap();
        let recovered = committed - 200 - (HEADER_SIZE + 9);
        assert_eq!(created.recovered_bytes, recovered);
        let mut log = created.log;
        assert_eq!(records(&log), vec![b"first".to_vec()]);
        assert_eq!(log.truncate_to_rewind_offset().unwrap(), recovered);
        assert_eq!(log.truncate_to_rewind_offset().unwrap(), 0);
        log.append(b"second").unwrap();
        assert_eq!(records(&log), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn truncate_drops_uncommitted_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        ProtoLog::create(&path, Options::new(false, 10)).unwrap().log.append(b"a").unwrap();
        OpenOptions::new().append(true).open(&path).unwrap().write_all(&[1, 2, 3]).unwrap();

        let mut log = ProtoLog::create(&path, Options::new(false, 10)).unwrap().log;
        assert_eq!(log.disk_usage().unwrap(), HEADER_SIZE + 8);
        assert_eq!(log.truncate_to_rewind_offset().unwrap(), 3);
        assert_eq!(log.disk_usage().unwrap(), HEADER_SIZE + 5);
    }

    #[test]
    fn corrupt_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        ProtoLog::create(&path, Options::new(false, 10)).unwrap();
        let good = fs::read(&path).unwrap();

        let check = |bytes: &[u8]| {
            fs::write(&path, bytes).unwrap();
            let res = ProtoLog::create(&path, Options::new(false, 10)).map(|_| ());
            // the file is left for the caller to deal with
            assert_eq!(fs::read(&path).unwrap(), bytes);
            res
        };

        let mut bad_magic = good.clone();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(check(&bad_magic), Err(Error::Internal(_))));

        let mut bad_checksum = good.clone();
        bad_checksum[20] ^= 1;
        assert!(matches!(check(&bad_checksum), Err(Error::Internal(_))));

        assert!(matches!(check(&good[..20]), Err(Error::Internal(_))));

        let negative = Header { compress: false, max_proto_size: 10, rewind_offset: -1 };
        assert!(matches!(check(&negative.to_bytes()), Err(Error::Internal(_))));

        let beyond = Header { compress: false, max_proto_size: 10, rewind_offset: 1000 };
        assert!(matches!(check(&beyond.to_bytes()), Err(Error::DataLoss(_))));
    }

    #[test]
    fn garbage_inside_committed_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let (first, second) = {
            let mut log = ProtoLog::create(&path, Options::default()).unwrap().log;
            (log.append(b"hello").unwrap(), log.append(b"world").unwrap())
        };
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        // the second entry now claims far more bytes than the file holds
        file.write_all_at(&u32::MAX.to_le_bytes(), second).unwrap();

        let log = ProtoLog::create(&path, Options::default()).unwrap().log;
        assert_eq!(log.read_at(first).unwrap(), b"hello");
        assert!(matches!(log.read_at(second), Err(Error::DataLoss(_))));
        let all: Vec<_> = log.iter().collect();
        assert_eq!(all.len(), 2);
        assert!(matches!(all[1], Err(Error::DataLoss(_))));

        // a payload that is not a zlib stream
        file.write_all_at(&[2, 0, 0, 0, 0xFF, 0xFF], first).unwrap();
        assert!(matches!(log.read_at(first), Err(Error::DataLoss(_))));
        assert!(matches!(log.read_at(1), Err(Error::InvalidArgument(_))));
        assert!(matches!(log.read_at(log.rewind_offset()), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn checksum_tracks_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut log = ProtoLog::create(&path, Options::new(false, 1 << 20)).unwrap().log;
        let empty = log.compute_checksum().unwrap();
        log.append(&vec![3u8; 200_000]).unwrap();
        let one = log.compute_checksum().unwrap();
        assert_ne!(empty, one);
        log.persist_to_disk().unwrap();
        drop(log);
        let log = ProtoLog::create(&path, Options::new(false, 1 << 20)).unwrap().log;
        assert_eq!(log.compute_checksum().unwrap(), one);
    }

    #[test]
    fn concurrent_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut log = ProtoLog::create(&path, Options::default()).unwrap().log;
        let offsets: Vec<u64> = (0..50u32).map(|i| log.append(&i.to_le_bytes()).unwrap()).collect();

        let log = &log;
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for (i, &offset) in offsets.iter().enumerate() {
                        assert_eq!(log.read_at(offset).unwrap(), (i as u32).to_le_bytes());
                    }
                    assert_eq!(log.iter().count(), 50);
                });
            }
        });
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn append_then_iterate(
            compress in any::<bool>(),
            recs in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 0..20),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("log");
            let mut offsets = vec![];
            {
                let mut log = ProtoLog::create(&path, Options::new(compress, 300)).unwrap().log;
                for rec in &recs {
                    offsets.push(log.append(rec).unwrap());
                }
            }
            let log = ProtoLog::create(&path, Options::new(compress, 300)).unwrap().log;
            let got: Vec<(u64, Vec<u8>)> = log.iter().map(|r| r.unwrap()).collect();
            let want: Vec<(u64, Vec<u8>)> = offsets.into_iter().zip(recs).collect();
            prop_assert_eq!(got, want);
        }
    }
}
