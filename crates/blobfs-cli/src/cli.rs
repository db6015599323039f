use crate::config::CliConfig;
use anyhow::{Context, Result};
use blobfs_core::{root_of, BlobStore, Digest, InodeRecord};
use blobfs_storage::{Allocator, ExtentAllocator, JournalWriteback, MemBlockDevice};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type MemStore = BlobStore<ExtentAllocator, JournalWriteback<MemBlockDevice>>;

const WRITE_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "blobfs")]
#[command(about = "Content-addressed blob store tool", long_about = None)]
pub struct Cli {
    /// Store configuration file (toml or json)
    #[arg(short, long, env = "BLOBFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the Merkle root digest of a file
    Digest { file: PathBuf },
    /// Store files in an in-memory store, evict them, read them back and verify
    Check { files: Vec<PathBuf> },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub path: PathBuf,
    pub digest: Digest,
    pub record: InodeRecord,
    pub extents: usize,
    pub nodes: usize,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Digest { ref file } => self.digest(file),
            Command::Check { ref files } => self.check(&config, files).await,
            Command::Config => {
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }

    fn load_config(&self) -> Result<CliConfig> {
        match &self.config {
            Some(path) => CliConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display())),
            None => Ok(CliConfig::default()),
        }
    }

    fn digest(&self, file: &Path) -> Result<()> {
        let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        let digest = root_of(&data);
        if self.json {
            println!("{}", serde_json::json!({ "path": file, "digest": digest }));
        } else {
            println!("{}  {}", digest, file.display());
        }
        Ok(())
    }

    async fn check(&self, config: &CliConfig, files: &[PathBuf]) -> Result<()> {
        let mut store = build_store(config)?;
        for file in files {
            let data =
                std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            let report = check_one(&mut store, file, &data).await?;
            if self.json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!(
                    "{}  {}  size={} blocks={} flags={:?} extents={} nodes={}",
                    report.digest,
                    file.display(),
                    report.record.content_size,
                    report.record.block_count,
                    report.record.flags,
                    report.extents,
                    report.nodes,
                );
            }
        }

        let stats = store.stats();
        if self.json {
            println!("{}", serde_json::to_string(&stats)?);
        } else {
            println!(
                "blobs={} created={} evictions={} allocated_blocks={}",
                stats.blobs,
                stats.created,
                stats.evictions,
                store.allocator().stats().allocated_blocks,
            );
        }
        Ok(())
    }
}

pub fn build_store(config: &CliConfig) -> Result<MemStore> {
    let allocator = Arc::new(ExtentAllocator::new(config.allocator.clone()));
    let device = Arc::new(MemBlockDevice::new(config.device()));
    let writeback = Arc::new(JournalWriteback::new(config.journal.clone(), device));
    Ok(BlobStore::new(config.store.clone(), allocator, writeback)?)
}

/// Writes `data` under its digest, drops the cached mapping, then reads it back
/// from the device and checks it byte for byte.
pub async fn check_one(store: &mut MemStore, path: &Path, data: &[u8]) -> Result<CheckReport> {
    let digest = root_of(data);
    if store.state(&digest).is_none() {
        let writer = store.create(digest, data.len() as u64).await?;
        for chunk in data.chunks(WRITE_CHUNK) {
            store.write(writer, chunk).await?;
        }
        store.close(writer).await?;
    } else {
        tracing::info!(%digest, path = %path.display(), "blob already stored");
    }
    store.evict_idle().await?;

    let reader = store.open(&digest)?;
    let mut readback = vec![0u8; data.len()];
    let read = store.read(reader, &mut readback, 0).await?;
    if read != data.len() || readback != data {
        anyhow::bail!("read back of {} does not match its contents", path.display());
    }
    store.verify(&digest).await?;
    store.close(reader).await?;

    let record = store
        .record(&digest)
        .with_context(|| format!("no record for {}", digest))?;
    let (extents, nodes) = store
        .blob(&digest)
        .map(|blob| (blob.extents().len(), blob.nodes().len()))
        .unwrap_or_default();
    Ok(CheckReport {
        path: path.to_path_buf(),
        digest,
        record,
        extents,
        nodes,
    })
}
