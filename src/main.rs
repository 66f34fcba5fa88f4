use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;

use verity_store::config::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MAX_SALT_SIZE, MIN_BLOCK_SIZE};
use verity_store::linux::{fsverity_enable, fsverity_measure, read_metadata, stream_metadata, MAX_METADATA_READ};
use verity_store::{
    compute_digest_with_tree, file_measurement, DigestSigner, FsVerityDescriptor, InnerHashAlgorithm,
    MerkleTreeParams, MetadataType, SigningParams, VerityFile,
};

/// Compute, sign and inspect fs-verity file digests.
#[derive(Parser, Debug)]
#[command(name = "fsverity")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign a file for fs-verity by computing its digest and signing the descriptor.
    Sign {
        file: PathBuf,
        sigfile: PathBuf,

        #[command(flatten)]
        tree: TreeArgs,

        /// Private key file.
        #[arg(long, conflicts_with_all = ["pkcs11_engine", "pkcs11_module", "pkcs11_keyid"],
              required_unless_present_any = ["pkcs11_engine", "pkcs11_module"])]
        key: Option<PathBuf>,

        /// Certificate (public key) file, checked against the key.
        #[arg(long)]
        cert: Option<PathBuf>,

        #[arg(long, requires = "pkcs11_module")]
        pkcs11_engine: Option<String>,

        #[arg(long, requires = "pkcs11_engine")]
        pkcs11_module: Option<String>,

        #[arg(long, requires = "pkcs11_engine")]
        pkcs11_keyid: Option<String>,

        /// Also write the Merkle tree to this file.
        #[arg(long)]
        out_merkle_tree: Option<PathBuf>,

        /// Also write the fs-verity descriptor to this file.
        #[arg(long)]
        out_descriptor: Option<PathBuf>,
    },

    /// Compute the fs-verity digest of files.
    Digest {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        tree: TreeArgs,
    },

    /// Read metadata (merkle_tree, descriptor or signature) from a verity file.
    #[command(name = "dump_metadata")]
    DumpMetadata {
        metadata_type: MetadataType,
        file: PathBuf,

        #[arg(long, requires = "length")]
        offset: Option<u64>,

        #[arg(long, requires = "offset",
              value_parser = clap::value_parser!(u64).range(..=MAX_METADATA_READ as u64))]
        length: Option<u64>,
    },

    /// Enable fs-verity on a file.
    Enable {
        file: PathBuf,

        #[command(flatten)]
        tree: TreeArgs,

        /// Built-in signature to hand to the kernel.
        #[arg(long)]
        signature: Option<PathBuf>,
    },

    /// Print the kernel's fs-verity digest of verity files.
    Measure {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct TreeArgs {
    #[arg(long = "hash-alg", default_value_t)]
    hash_alg: InnerHashAlgorithm,

    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE, value_parser = parse_block_size)]
    block_size: usize,

    /// Salt, as hex.
    #[arg(long)]
    salt: Option<Salt>,
}

#[derive(Clone, Debug)]
struct Salt(Vec<u8>);

impl FromStr for Salt {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let salt = hex::decode(s).map_err(|e| e.to_string())?;
        if salt.len() > MAX_SALT_SIZE {
            return Err(format!("salt is {} bytes, at most {} allowed", salt.len(), MAX_SALT_SIZE));
        }
        Ok(Salt(salt))
    }
}

fn parse_block_size(s: &str) -> std::result::Result<usize, String> {
    let size: usize = s.parse().map_err(|e| format!("{}", e))?;
    if !size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
        return Err(format!(
            "must be a power of two between {} and {}",
            MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        ));
    }
    Ok(size)
}

impl TreeArgs {
    fn params(&self, file_size: u64) -> MerkleTreeParams {
        let salt = self.salt.as_ref().map(|s| s.0.clone()).unwrap_or_default();
        MerkleTreeParams::new(file_size)
            .with_hash_algorithm(self.hash_alg)
            .with_block_size(self.block_size)
            .with_salt(salt)
    }

    fn params_for(&self, file: &File) -> Result<MerkleTreeParams> {
        Ok(self.params(file.metadata()?.len()))
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("can't open '{}'", path.display()))
}

fn sign(file: &Path, sigfile: &Path, tree: &TreeArgs, signing: SigningParams, out_merkle_tree: Option<&Path>, out_descriptor: Option<&Path>) -> Result<()> {
    let signer = DigestSigner::new(signing.into_signer()?);

    let f = open(file)?;
    let params = tree.params_for(&f)?;
    let mut tree_bytes = vec![];
    let out = compute_digest_with_tree(BufReader::new(f), &params, &mut tree_bytes)
        .with_context(|| format!("failed to hash '{}'", file.display()))?;
    let descriptor = FsVerityDescriptor::new(&out.root_hash, out.data_size, &params)?;
    let signature = signer.sign(&descriptor).context("signing failed")?;

    let descriptor_bytes = descriptor.to_bytes();
    let mut outputs: Vec<(&Path, &[u8])> = vec![];
    if let Some(path) = out_merkle_tree {
        outputs.push((path, tree_bytes.as_slice()));
    }
    if let Some(path) = out_descriptor {
        outputs.push((path, &descriptor_bytes[..]));
    }
    outputs.push((sigfile, signature.as_slice()));
    write_outputs(&outputs)?;

    println!("Signed file '{}' ({})", file.display(), descriptor.measurement());
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".fsverity-tmp");
    path.with_file_name(name)
}

/// Writes every output to a temporary sibling, then renames them into place in order.
/// Nothing is left behind if any write fails.
fn write_outputs(outputs: &[(&Path, &[u8])]) -> Result<()> {
    let mut staged = vec![];
    for (path, contents) in outputs {
        let tmp = staging_path(path);
        if let Err(e) = fs::write(&tmp, contents) {
            let _ = fs::remove_file(&tmp);
            for tmp in &staged {
                let _ = fs::remove_file(tmp);
            }
            return Err(e).with_context(|| format!("can't write '{}'", path.display()));
        }
        staged.push(tmp);
    }
    for ((path, _), tmp) in outputs.iter().zip(&staged) {
        fs::rename(tmp, path).with_context(|| format!("can't write '{}'", path.display()))?;
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Sign {
            file,
            sigfile,
            tree,
            key,
            cert,
            pkcs11_engine,
            pkcs11_module,
            pkcs11_keyid,
            out_merkle_tree,
            out_descriptor,
        } => {
            let signing = SigningParams { key, cert, pkcs11_engine, pkcs11_module, pkcs11_keyid };
            sign(&file, &sigfile, &tree, signing, out_merkle_tree.as_deref(), out_descriptor.as_deref())
        }

        Commands::Digest { files, tree } => {
            for path in files {
                let f = open(&path)?;
                let params = tree.params_for(&f)?;
                let (_, digest) = file_measurement(BufReader::new(f), &params)
                    .with_context(|| format!("failed to hash '{}'", path.display()))?;
                println!("{} {}", digest, path.display());
            }
            Ok(())
        }

        Commands::DumpMetadata { metadata_type, file, offset, length } => {
            let mut source = VerityFile::new(open(&file)?);
            let stdout = io::stdout();
            let res = match (offset, length) {
                (Some(offset), Some(length)) => read_metadata(&mut source, metadata_type, offset, length as usize, stdout.lock()),
                _ => stream_metadata(&mut source, metadata_type, stdout.lock()),
            };
            res.with_context(|| format!("can't read {} of '{}'", metadata_type, file.display()))?;
            Ok(())
        }

        Commands::Enable { file, tree, signature } => {
            let f = open(&file)?;
            let params = tree.params_for(&f)?;
            let signature = match signature {
                Some(path) => Some(fs::read(&path).with_context(|| format!("can't read '{}'", path.display()))?),
                None => None,
            };
            fsverity_enable(&f, &params, signature.as_deref())
                .with_context(|| format!("can't enable verity on '{}'", file.display()))?;
            Ok(())
        }

        Commands::Measure { files } => {
            for path in files {
                let digest = fsverity_measure(open(&path)?)
                    .with_context(|| format!("can't measure '{}'", path.display()))?;
                println!("{} {}", digest, path.display());
            }
            Ok(())
        }
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("fsverity: {:#}", e);
        process::exit(1);
    }
}
