use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tsfs_store::{FileStore, FsId, ReadResult, Shape, StoreBackend, StoreConfig};

fn parse_shape(s: &str) -> Result<Shape, String> {
    Shape::from_tree_name(s).ok_or_else(|| format!("unknown shape {:?}, expected stream, random or mjd", s))
}

#[derive(Parser, Debug)]
#[command(name = "tsfs")]
#[command(about = "tsfs store administration", long_about = None)]
pub struct Cli {
    /// Store root directory; overrides the config file.
    #[arg(short, long, env = "TSFS_ROOT")]
    pub root: Option<PathBuf>,

    /// Store configuration (.toml or .json).
    #[arg(short, long, env = "TSFS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print store statistics as JSON.
    Stats,
    /// List committed ids under a path.
    Ls {
        #[arg(short, long, default_value = "stream", value_parser = parse_shape)]
        shape: Shape,
        #[arg(default_value = "/")]
        prefix: String,
    },
    /// Verify the structure of every index tree.
    Check,
    /// Write a committed blob to stdout.
    CatBlob {
        id: String,
    },
    /// Print node cache counters.
    Caches,
    /// Remove every committed id and all data files.
    Clean {
        /// Confirm the wipe.
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    pub fn store_config(&self) -> Result<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => StoreConfig::default(),
        };
        if let Some(root) = &self.root {
            config.root_dir = root.clone();
        }
        Ok(config)
    }

    pub fn run(self) -> Result<()> {
        let config = self.store_config()?;
        let store = FileStore::open(config)?;
        match self.command {
            Command::Stats => stats(&store),
            Command::Ls { shape, ref prefix } => ls(&store, shape, prefix),
            Command::Check => check(&store),
            Command::CatBlob { ref id } => cat_blob(&store, id),
            Command::Caches => caches(&store),
            Command::Clean { yes } => clean(&store, yes),
        }
    }
}

fn stats(store: &FileStore) -> Result<()> {
    let stats = store.stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn ls(store: &FileStore, shape: Shape, prefix: &str) -> Result<()> {
    for id in store.list_ids(shape, prefix)? {
        println!("{}", id);
    }
    Ok(())
}

fn check(store: &FileStore) -> Result<()> {
    for (shape, report) in store.check_trees()? {
        println!(
            "{:<8} nodes={} keys={} depth={}",
            shape.tree_name(),
            report.nodes,
            report.keys,
            report.depth
        );
    }
    Ok(())
}

fn cat_blob(store: &FileStore, id: &str) -> Result<()> {
    let id = FsId::parse(id)?;
    match store.read_blob(None, &id)? {
        ReadResult::Found(blob) => {
            tracing::debug!(id = %id, origin = blob.origin, bytes = blob.data.len(), "read blob");
            std::io::stdout().write_all(&blob.data)?;
            Ok(())
        }
        ReadResult::NotFound => bail!("blob {} not found", id),
    }
}

fn caches(store: &FileStore) -> Result<()> {
    println!("{:<8} {:>12} {:>12}", "tree", "hits", "misses");
    for row in store.monitor().cache_performance() {
        println!("{:<8} {:>12} {:>12}", row.tree_id, row.hits, row.misses);
    }
    Ok(())
}

fn clean(store: &FileStore, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to clean {} without --yes", store.root().display());
    }
    store.clean()?;
    println!("cleaned {}", store.root().display());
    Ok(())
}
