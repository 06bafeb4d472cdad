use std::{
    num::ParseIntError,
    path::PathBuf,
    sync::{atomic::AtomicU64, Arc},
    time::Duration,
};

use clap::Parser;
use miette::{Context, IntoDiagnostic};
use objspace_object_store::{ObjectStore, StoreConfig};
use objspace_rt::{ObjectHandle, Runtime, RuntimeConfig, SyncStatus};
use objspace_rt_abi::{
    create::{CreateTieFlags, CreateTieSpec, LifetimeType, ObjectCreate},
    object::{MapFlags, ObjID},
    service::ObjectCmd,
    sync::{SyncFlags, SyncInfo},
};
use serde::Deserialize;
use tracing::Level;

fn parse_num(s: &str) -> Result<u64, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(clap::Subcommand, Clone, Debug)]
enum Command {
    #[clap(about = "Create an object and print its ID.")]
    Create {
        #[arg(long, help("Keep the object across store restarts"))]
        persistent: bool,
        #[arg(long, value_parser = parse_num, help("Initial data length in bytes"))]
        len: Option<u64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "tie", help("Objects (ID or name) the new object keeps alive"))]
        ties: Vec<String>,
    },
    #[clap(about = "Add a reference from one object to another and print its FOT index.")]
    Link { source: String, target: String },
    #[clap(about = "Resolve a FOT index of an object to the referenced object.")]
    Resolve {
        object: String,
        #[arg(value_parser = parse_num)]
        index: u64,
    },
    #[clap(about = "Write a string into an object's data region.")]
    Write {
        object: String,
        #[arg(value_parser = parse_num)]
        offset: u64,
        data: String,
        #[arg(long, help("Write the object back before returning"))]
        sync: bool,
    },
    #[clap(about = "Dump bytes of an object's data region.")]
    Read {
        object: String,
        #[arg(value_parser = parse_num)]
        offset: u64,
        #[arg(value_parser = parse_num)]
        len: u64,
    },
    #[clap(about = "Publish a new version through a release word in a persistent object.")]
    Publish {
        object: String,
        #[arg(long, value_parser = parse_num, default_value = "0x1000")]
        release_offset: u64,
        #[arg(long, value_parser = parse_num)]
        compare: u64,
        #[arg(long, value_parser = parse_num)]
        set: u64,
        #[arg(long, value_parser = parse_num, help("Offset of the durable word"))]
        durable_offset: Option<u64>,
        #[arg(long, help("Wait for the write-back"))]
        durable: bool,
        #[arg(long = "async", help("Write back in the background and wait on the durable word"))]
        async_durable: bool,
    },
    #[clap(about = "Print what the store knows about an object, and its FOT.")]
    Stat { object: String },
    #[clap(about = "Delete an object.")]
    Delete { object: String },
}

#[derive(clap::Parser, Clone, Debug)]
struct Cli {
    #[clap(subcommand)]
    cmd: Command,
    #[arg(long, help("Store directory (overrides the config file)"))]
    store: Option<PathBuf>,
    #[arg(long, help("JSON file with `store` and `runtime` sections"))]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    store: Option<StoreConfig>,
    runtime: RuntimeConfig,
}

fn load_config(cli: &Cli) -> miette::Result<(StoreConfig, RuntimeConfig)> {
    let file = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .into_diagnostic()
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<FileConfig>(&text)
                .into_diagnostic()
                .wrap_err_with(|| format!("parsing {}", path.display()))?
        }
        None => FileConfig::default(),
    };
    let mut store = file.store.unwrap_or_default();
    if let Some(root) = &cli.store {
        store.root = root.clone();
    }
    Ok((store, file.runtime))
}

struct Ctx {
    rt: Runtime,
    store: Arc<ObjectStore>,
}

impl Ctx {
    /// An object named on the command line, by ID or by name.
    fn lookup(&self, arg: &str) -> miette::Result<ObjID> {
        if let Ok(id) = arg.parse::<ObjID>() {
            if self.store.info(id).is_ok() {
                return Ok(id);
            }
            tracing::debug!("{} is not a live object ID, trying it as a name", arg);
        }
        self.store
            .lookup_name(arg)
            .ok_or_else(|| miette::miette!("no object {}", arg))
    }

    /// Map an object, with PERSIST if it is persistent.
    fn map(&self, id: ObjID, write: bool) -> miette::Result<ObjectHandle> {
        let mut flags = MapFlags::READ;
        if write {
            flags |= MapFlags::WRITE;
        }
        if self.store.info(id).into_diagnostic()?.lifetime == LifetimeType::Persistent {
            flags |= MapFlags::PERSIST;
        }
        self.rt
            .map_object(id, flags)
            .into_diagnostic()
            .wrap_err_with(|| format!("mapping {}", id))
    }
}

fn to_usize(v: u64) -> miette::Result<usize> {
    usize::try_from(v).into_diagnostic()
}

/// A word at `off` bytes into the data region. Bounds and alignment are checked by publish.
fn word_ptr(handle: &ObjectHandle, off: u64) -> miette::Result<*const AtomicU64> {
    Ok(handle
        .start()
        .wrapping_add(to_usize(off)?)
        .cast::<AtomicU64>()
        .cast_const())
}

fn run(ctx: &Ctx, cmd: Command) -> miette::Result<()> {
    match cmd {
        Command::Create {
            persistent,
            len,
            name,
            ties,
        } => {
            let mut spec = if persistent {
                ObjectCreate::persistent()
            } else {
                ObjectCreate::default()
            };
            if let Some(len) = len {
                spec = spec.with_len(to_usize(len)?);
            }
            let ties = ties
                .iter()
                .map(|t| Ok(CreateTieSpec::new(ctx.lookup(t)?, CreateTieFlags::empty())))
                .collect::<miette::Result<Vec<_>>>()?;
            let id = ctx
                .rt
                .create_object(&spec, &[], &ties, name.as_deref())
                .into_diagnostic()?;
            println!("{}", id);
        }
        Command::Link { source, target } => {
            let handle = ctx.map(ctx.lookup(&source)?, true)?;
            let idx = ctx
                .rt
                .insert_fot(&handle, ctx.lookup(&target)?)
                .into_diagnostic()?;
            println!("{}", idx);
        }
        Command::Resolve { object, index } => {
            let handle = ctx.map(ctx.lookup(&object)?, false)?;
            let target = ctx.rt.resolve_fot(&handle, index, 0).into_diagnostic()?;
            println!("{} {:?}", target.id(), target.map_flags());
        }
        Command::Write {
            object,
            offset,
            data,
            sync,
        } => {
            let handle = ctx.map(ctx.lookup(&object)?, true)?;
            let offset = to_usize(offset)?;
            let end = offset.saturating_add(data.len());
            if end > handle.valid_len() {
                ctx.rt.grow_object(&handle, end).into_diagnostic()?;
            }
            handle.write_at(offset, data.as_bytes()).into_diagnostic()?;
            if sync {
                ctx.rt
                    .object_cmd(&handle, ObjectCmd::Sync)
                    .into_diagnostic()?;
            }
        }
        Command::Read {
            object,
            offset,
            len,
        } => {
            let handle = ctx.map(ctx.lookup(&object)?, false)?;
            let mut buf = vec![0u8; to_usize(len)?];
            handle
                .read_at(to_usize(offset)?, &mut buf)
                .into_diagnostic()?;
            println!("{}", String::from_utf8_lossy(&buf));
        }
        Command::Publish {
            object,
            release_offset,
            compare,
            set,
            durable_offset,
            durable,
            async_durable,
        } => {
            let handle = ctx.map(ctx.lookup(&object)?, true)?;
            let mut flags = SyncFlags::empty();
            flags.set(SyncFlags::DURABLE, durable);
            flags.set(SyncFlags::ASYNC_DURABLE, async_durable);
            let durable_word = match durable_offset {
                Some(off) => word_ptr(&handle, off)?,
                None => core::ptr::null(),
            };
            let sync = SyncInfo {
                release: word_ptr(&handle, release_offset)?,
                release_compare: compare,
                release_set: set,
                durable: durable_word,
                flags,
            };
            let status = ctx.rt.publish(&handle, &sync).into_diagnostic()?;
            if status == SyncStatus::Pending {
                // Safety: publish checked that the word lies inside the handle's data region.
                if let Some(word) = unsafe { sync.durable.as_ref() } {
                    ctx.rt
                        .wait_durable(word, Some(Duration::from_secs(30)))
                        .into_diagnostic()
                        .wrap_err("waiting for write-back")?;
                }
            }
            println!("{:?}", status);
        }
        Command::Stat { object } => {
            let id = ctx.lookup(&object)?;
            let info = ctx.store.info(id).into_diagnostic()?;
            let handle = ctx.map(id, false)?;
            let fot = ctx.rt.fot_entries(&handle).into_diagnostic()?;
            let out = serde_json::json!({
                "id": id.to_string(),
                "name": info.name,
                "lifetime": format!("{:?}", info.lifetime),
                "prot": format!("{:?}", info.prot),
                "kuid": info.kuid.to_string(),
                "data_len": info.data_len,
                "maps": info.maps,
                "ties": info.ties.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "fot": fot
                    .iter()
                    .map(|(idx, target)| serde_json::json!({
                        "index": idx,
                        "target": target.id.to_string(),
                        "flags": format!("{:?}", target.flags),
                    }))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&out).into_diagnostic()?);
        }
        Command::Delete { object } => {
            let handle = ctx.map(ctx.lookup(&object)?, false)?;
            ctx.rt
                .object_cmd(&handle, ObjectCmd::Delete)
                .into_diagnostic()?;
        }
    }
    Ok(())
}

fn main() -> miette::Result<()> {
    let cli = Cli::try_parse().into_diagnostic()?;

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .without_time()
            .with_max_level(level)
            .finish(),
    )
    .into_diagnostic()?;

    let (store_config, rt_config) = load_config(&cli)?;
    let store = Arc::new(
        ObjectStore::open(store_config)
            .into_diagnostic()
            .wrap_err("opening store")?,
    );
    let ctx = Ctx {
        rt: Runtime::new(store.clone(), rt_config),
        store,
    };
    run(&ctx, cli.cmd)?;
    tracing::debug!("cache: {:?}", ctx.rt.cache_stats());
    Ok(())
}
