#![allow(non_camel_case_types)]

use num_enum::TryFromPrimitive;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd};

use crate::config::{InnerHashAlgorithm, MerkleTreeParams, MAX_DIGEST_SIZE};
use crate::digest::Digest;
use crate::error::{Error, Result};

// _IOW('f', 133, struct fsverity_enable_arg) and friends from $LINUX/include/uapi/linux/fsverity.h.
// the encoding (direction << 30 | size << 16 | type << 8 | nr) is the generic one used by
// x86, arm and riscv.
const FS_IOC_ENABLE_VERITY: u64 = 0x4080_6685;
const FS_IOC_MEASURE_VERITY: u64 = 0xC004_6686;
const FS_IOC_READ_VERITY_METADATA: u64 = 0xC028_6687;

// fsverity-utils reads metadata in pieces of this size
const METADATA_CHUNK_SIZE: usize = 32768;

/// Largest `length` a single metadata read may ask for; the kernel caps one read at `INT_MAX`.
pub const MAX_METADATA_READ: usize = i32::MAX as usize;

/// Which piece of on-disk verity metadata to read. Numbers are `FS_VERITY_METADATA_TYPE_*`.
#[derive(Copy, Clone, PartialEq, Eq, parse_display::FromStr, parse_display::Display, Debug, TryFromPrimitive)]
#[display(style = "snake_case")]
#[repr(u8)]
pub enum MetadataType {
    MerkleTree = 1,
    Descriptor = 2,
    Signature = 3,
}

/// Anything that can answer a "read verity metadata" request.
///
/// Returns the number of bytes placed in `buf`; zero means there is nothing more at `offset`.
pub trait MetadataSource {
    fn read_metadata(&mut self, metadata_type: MetadataType, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// A file the kernel has already verity-enabled.
pub struct VerityFile<F: AsFd> {
    file: F,
}

impl<F: AsFd> VerityFile<F> {
    pub fn new(file: F) -> Self {
        Self { file }
    }

    pub fn into_inner(self) -> F {
        self.file
    }
}

impl<F: AsFd> MetadataSource for VerityFile<F> {
    // https://www.kernel.org/doc/html/latest/filesystems/fsverity.html#fs-ioc-read-verity-metadata
    fn read_metadata(&mut self, metadata_type: MetadataType, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        #[repr(C)]
        struct fsverity_read_metadata_arg {
            metadata_type: u64,
            offset: u64,
            length: u64,
            buf_ptr: u64,
            __reserved: u64,
        }

        let mut arg = fsverity_read_metadata_arg {
            metadata_type: metadata_type as u64,
            offset,
            length: buf.len() as u64,
            buf_ptr: buf.as_mut_ptr() as u64,
            __reserved: 0,
        };

        let ret = unsafe { libc::ioctl(self.file.as_fd().as_raw_fd(), FS_IOC_READ_VERITY_METADATA as _, &mut arg as *mut _) };

        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

/// Performs exactly one read of at most `length` bytes at `offset` and writes the result to `sink`.
pub fn read_metadata<S: MetadataSource, W: Write>(
    source: &mut S,
    metadata_type: MetadataType,
    offset: u64,
    length: usize,
    mut sink: W,
) -> Result<u64> {
    if length > MAX_METADATA_READ {
        return Err(Error::InvalidArgument(format!(
            "metadata read of {} bytes exceeds the limit of {}",
            length, MAX_METADATA_READ
        )));
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(length)
        .map_err(|e| Error::InvalidArgument(format!("can't allocate {} bytes for metadata: {}", length, e)))?;
    buf.resize(length, 0);
    let n = source.read_metadata(metadata_type, offset, &mut buf)?;
    sink.write_all(&buf[..n])?;
    sink.flush()?;
    Ok(n as u64)
}

/// Reads the whole metadata stream of the given type, advancing the offset until a read returns nothing.
pub fn stream_metadata<S: MetadataSource, W: Write>(source: &mut S, metadata_type: MetadataType, mut sink: W) -> Result<u64> {
    let mut buf = vec![0u8; METADATA_CHUNK_SIZE];
    let mut offset = 0u64;
    loop {
        let n = source.read_metadata(metadata_type, offset, &mut buf)?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])?;
        offset += n as u64;
    }
    sink.flush()?;
    log::debug!("read {} bytes of {} metadata", offset, metadata_type);
    Ok(offset)
}

// https://www.kernel.org/doc/html/latest/filesystems/fsverity.html#fs-ioc-enable-verity
pub fn fsverity_enable(fd: impl AsFd, params: &MerkleTreeParams, signature: Option<&[u8]>) -> Result<()> {
    params.validate()?;
    let fd = fd.as_fd().as_raw_fd();
    #[repr(C)]
    struct fsverity_enable_arg {
        version: u32,
        hash_algorithm: u32,
        block_size: u32,
        salt_size: u32,
        salt_ptr: u64,
        sig_size: u32,
        __reserved1: u32,
        sig_ptr: u64,
        __reserved2: [u64; 11],
    }

    let signature = signature.unwrap_or(&[]);
    let args = fsverity_enable_arg {
        version: 1,
        hash_algorithm: params.hash_algorithm as u32,
        block_size: params.block_size as u32,
        salt_size: params.salt.len() as u32,
        salt_ptr: params.salt.as_ptr() as u64,
        sig_size: signature.len() as u32,
        __reserved1: 0,
        sig_ptr: if signature.is_empty() { 0 } else { signature.as_ptr() as u64 },
        __reserved2: [0; 11],
    };

    let ret = unsafe { libc::ioctl(fd, FS_IOC_ENABLE_VERITY as _, &args as *const _) };

    if ret != 0 {
        Err(io::Error::last_os_error().into())
    }
    else {
        Ok(())
    }
}

// https://www.kernel.org/doc/html/latest/filesystems/fsverity.html#fs-ioc-measure-verity
pub fn fsverity_measure(fd: impl AsFd) -> Result<Digest> {
    let fd = fd.as_fd().as_raw_fd();
    #[repr(C)]
    struct fsverity_digest {
        digest_algorithm: u16,
        digest_size: u16,
        digest: [u8; MAX_DIGEST_SIZE],
    }

    let mut digest = fsverity_digest {
        digest_algorithm: 0,  // unset
        digest_size: MAX_DIGEST_SIZE as u16,
        digest: [0; MAX_DIGEST_SIZE],
    };

    let ret = unsafe { libc::ioctl(fd, FS_IOC_MEASURE_VERITY as _, &mut digest as *mut _) };

    if ret != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let algorithm = InnerHashAlgorithm::from_u8(digest.digest_algorithm as u8)?;
    let size = (digest.digest_size as usize).min(MAX_DIGEST_SIZE);
    Digest::new(algorithm, &digest.digest[..size])
}
