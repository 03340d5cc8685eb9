use std::{
    io::{self, Write},
    path::PathBuf,
};

use anyhow::Result;
use clap::{Parser, Subcommand};

use layerstore::{ChainId, CreateRwLayerOpts, LayerStore, StoreConfig};

/// lsctl
#[derive(Debug, Parser)]
#[clap(name = "lsctl", version)]
pub struct App {
    /// Store root directory
    #[clap(long, default_value = "/var/lib/layerstore", conflicts_with = "config")]
    root: PathBuf,
    /// Graph driver
    #[clap(long, default_value = "vfs", conflicts_with = "config")]
    driver: String,
    /// Read settings from a TOML configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Registers a layer from an uncompressed tar read from stdin
    Register {
        #[clap(long)]
        parent: Option<String>,
    },
    /// Lists read-only layers and read-write layers
    Ls,
    /// Writes the diff of a layer to stdout as a tar stream
    Export { chain_id: String },
    /// Drops a reference to a layer, deleting it when unused
    Rm { chain_id: String },
    /// Creates a read-write layer
    CreateRw {
        name: String,
        #[clap(long)]
        parent: Option<String>,
    },
    /// Removes a read-write layer
    RmRw { name: String },
    /// Prints the driver ID of a read-write layer
    MountId { name: String },
    /// Removes leftovers of interrupted deletions and unreferenced stores
    Cleanup,
    /// Shows the graph driver status
    Status,
}

fn chain_opt(opt: &Option<String>) -> Result<Option<ChainId>> {
    Ok(match opt {
        Some(value) => Some(value.parse()?),
        None => None,
    })
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let config = match &args.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig {
            driver: args.driver.clone(),
            ..StoreConfig::new(&args.root)
        },
    };
    let store = LayerStore::from_config(&config)?;

    match args.cmd {
        Command::Register { ref parent } => {
            let parent = chain_opt(parent)?;
            let layer = store.register(io::stdin().lock(), parent.as_ref())?;
            println!("{}", layer.chain_id());
        }
        Command::Ls => {
            let counts = store.reference_counts();
            for (chain_id, info) in store.map() {
                let parent = info
                    .parent()
                    .map(|p| p.chain_id().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{chain_id} diff={} size={} refs={} parent={parent}",
                    info.diff_id(),
                    info.size(),
                    counts.get(&chain_id).copied().unwrap_or(0),
                );
            }
            for name in store.mount_names() {
                println!("rw {name} mount-id={}", store.get_mount_id(&name)?);
            }
        }
        Command::Export { ref chain_id } => {
            // counts are rebuilt per process; a get and release pair here
            // could delete the layer
            let mut stream = store.tar_stream(&chain_id.parse()?)?;
            let mut stdout = io::stdout().lock();
            io::copy(&mut stream, &mut stdout)?;
            stdout.flush()?;
        }
        Command::Rm { ref chain_id } => {
            let layer = store.get(&chain_id.parse()?)?;
            for removed in store.release(layer)? {
                println!("deleted {} ({} bytes)", removed.chain_id, removed.diff_size);
            }
        }
        Command::CreateRw { name, ref parent } => {
            let parent = chain_opt(parent)?;
            let layer = store.create_rw_layer(&name, parent.as_ref(), CreateRwLayerOpts::default())?;
            println!("{}", layer.mount_id()?);
        }
        Command::RmRw { ref name } => {
            // the handle from creation died with its process
            let layer = store.get_rw_layer(name)?;
            // keep the image layer; only `rm` deletes read-only layers
            let _parent = layer.parent()?.map(|id| store.get(&id)).transpose()?;
            for removed in store.release_rw_layer(&layer)? {
                println!("deleted {} ({} bytes)", removed.chain_id, removed.diff_size);
            }
        }
        Command::MountId { ref name } => {
            println!("{}", store.get_mount_id(name)?);
        }
        Command::Cleanup => {
            store.cleanup()?;
        }
        Command::Status => {
            println!("Driver: {}", store.driver_name());
            for (key, value) in store.driver_status() {
                println!(" {key}: {value}");
            }
        }
    }
    Ok(())
}
