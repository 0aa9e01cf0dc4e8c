use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mdctl_core::model::level_from_name;
use mdctl_core::{BlockDevice, MdError};
use mdctl_manage::create::{create, examine, CreateOpts};
use mdctl_manage::{grow_reshape, grow_size, incremental, GrowParams, IncrementalOpts};
use mdctl_sysfs::SysArray;

#[derive(Parser)]
#[command(name = "mdctl")]
#[command(about = "Manage Linux md (software RAID) arrays", long_about = None)]
struct Cli {
    /// More output; repeat for debug
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Suppress non-fatal messages
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the superblock found on each device
    Examine {
        devices: Vec<PathBuf>,
        /// One config-file style line per array
        #[arg(short, long)]
        brief: bool,
        /// KEY=VALUE lines for scripts
        #[arg(long)]
        export: bool,
        /// JSON document per device
        #[arg(long)]
        json: bool,
    },
    /// Create a new array
    Create {
        /// md device name, e.g. /dev/md0 or a name for /dev/md/<name>
        array: String,
        #[arg(short = 'l', long)]
        level: String,
        #[arg(short = 'n', long)]
        raid_devices: i32,
        /// Metadata style: 0.90, 1.0, 1.1, 1.2, ddf, imsm
        #[arg(short = 'e', long, default_value = "default")]
        metadata: String,
        /// Chunk size, KiB
        #[arg(short = 'c', long, default_value_t = 512)]
        chunk: i32,
        /// Component size, KiB (default: smallest device)
        #[arg(short = 'z', long, default_value_t = 0)]
        size: u64,
        #[arg(long)]
        bitmap: bool,
        #[arg(short = 'R', long)]
        run: bool,
        devices: Vec<PathBuf>,
    },
    /// Change size, level, layout, chunk or disk count
    Grow {
        array: PathBuf,
        #[arg(short = 'n', long)]
        raid_devices: Option<i32>,
        #[arg(short = 'l', long)]
        level: Option<String>,
        /// KiB
        #[arg(short = 'c', long)]
        chunk: Option<i32>,
        #[arg(long)]
        layout: Option<i32>,
        /// Component size, KiB; "max" uses all available space
        #[arg(short = 'z', long)]
        size: Option<String>,
        #[arg(long)]
        backup_file: Option<PathBuf>,
    },
    /// Add a newly appeared device to whatever array owns it
    Incremental {
        device: PathBuf,
        /// Start the array as soon as a quorum is present
        #[arg(short = 'R', long)]
        run: bool,
        #[arg(long)]
        homehost: Option<String>,
    },
    /// Stop an active array
    Stop { array: PathBuf },
    /// Check that the monitor for a container answers
    Ping { container: String },
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Examine { devices, brief, export, json } => {
            for dev in devices {
                if json {
                    let mut bd = BlockDevice::open(&dev)?;
                    let st = mdctl_metadata::guess_metadata(&mut bd)?;
                    let info = st.getinfo()?;
                    let doc = serde_json::json!({
                        "device": dev.display().to_string(),
                        "metadata": st.name(),
                        "uuid": info.uuid_hex(),
                        "name": info.name,
                        "level": mdctl_core::model::level_name(info.array.level),
                        "raid_devices": info.array.raid_disks,
                        "chunk_size": info.array.chunk_size,
                        "events": info.events,
                        "array": info.array,
                    });
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                } else {
                    print!("{}", examine(&dev, brief, export)?);
                }
            }
        }
        Commands::Create {
            array,
            level,
            raid_devices,
            metadata,
            chunk,
            size,
            bitmap,
            run,
            devices,
        } => {
            let level = level_from_name(&level)
                .ok_or_else(|| MdError::IncompatibleMetadata(format!("unknown level {}", level)))?;
            let name = array
                .trim_start_matches("/dev/md/")
                .trim_start_matches("/dev/")
                .to_string();
            let opts = CreateOpts {
                metadata,
                level,
                raid_disks: raid_devices,
                chunk_size: chunk * 1024,
                layout: None,
                size: size * 2,
                name,
                homehost: hostname(),
                internal_bitmap: bitmap,
                run,
            };
            let path = create(&devices, &opts)?;
            println!("array {} started", path.display());
        }
        Commands::Grow {
            array,
            raid_devices,
            level,
            chunk,
            layout,
            size,
            backup_file,
        } => {
            let sys_name = sys_name_of(&array)?;
            let sra = SysArray::new(&sys_name);
            if let Some(size) = size {
                let sectors = if size == "max" { 0 } else { size.parse::<u64>()? * 2 };
                grow_size(&sra, sectors)?;
                return Ok(());
            }
            let level = match level {
                Some(l) => Some(level_from_name(&l).ok_or_else(|| {
                    MdError::IncompatibleMetadata(format!("unknown level {}", l))
                })?),
                None => None,
            };
            let params = GrowParams {
                raid_disks: raid_devices,
                level,
                chunk_size: chunk.map(|c| c * 1024),
                layout,
                size: None,
                backup_file,
            };
            // any member superblock identifies the array for the backup
            let info = sra.read_info(mdctl_sysfs::attrs::get::DEVS)?;
            let first = info
                .devs
                .first()
                .ok_or_else(|| MdError::NoDevice("array has no members".into()))?;
            let member = PathBuf::from(format!(
                "/dev/block/{}:{}",
                first.disk.major, first.disk.minor
            ));
            let mut bd = BlockDevice::open(&member)?;
            let mut st = mdctl_metadata::guess_metadata(&mut bd)?;
            grow_reshape(&array, &sra, &mut *st, &params)?;
        }
        Commands::Incremental { device, run, homehost } => {
            let opts = IncrementalOpts {
                run,
                homehost: homehost.or_else(hostname),
                require_homehost: false,
            };
            incremental(&device, &opts)?;
        }
        Commands::Stop { array } => {
            let f = std::fs::OpenOptions::new().read(true).open(&array)?;
            mdctl_sysfs::stop_array(&f)?;
            println!("stopped {}", array.display());
        }
        Commands::Ping { container } => {
            mdctl_monitor::client::ping_monitor(&container)?;
            println!("monitor for {} is alive", container);
        }
    }
    Ok(())
}

fn sys_name_of(path: &PathBuf) -> anyhow::Result<String> {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| MdError::NoDevice(path.display().to_string()))?;
    if mdctl_core::util::devnum_from_name(&name).is_some() {
        return Ok(name);
    }
    // /dev/md/<name> symlinks resolve to /dev/mdN
    let target = std::fs::canonicalize(path)?;
    target
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| MdError::NoDevice(path.display().to_string()).into())
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        }
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
    if let Err(e) = run(cli) {
        eprintln!("mdctl: {}", e);
        let code = e
            .downcast_ref::<MdError>()
            .map(MdError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
