mod engine;
mod error;
mod orchestrator;
mod package;
mod router;
mod transport;
// TODO: more efficient linux-only transport based on `bluer`
mod transport_btleplug;
mod uuids;
mod wire;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;

use package::{Package, Role};
use router::ControlPointRouter;
use transport::DfuTransportManager;
use transport_btleplug::BtleplugManager;

/// Update firmware on nRF BLE Secure DFU targets
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Packet receipt notification interval; 0 disables host checkpoints
    /// other than the final one
    #[arg(long, global = true, default_value_t = 0)]
    prn: u16,

    /// Control-point response timeout, in milliseconds
    #[arg(long, global = true, default_value_t = 6000)]
    timeout_ms: u64,

    /// GATT connect/scan timeout, in seconds
    #[arg(long, global = true, default_value_t = 10)]
    connect_timeout_s: u64,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start DFU mode using the Buttonless DFU Service
    Trigger {
        /// BLE DFU target name or address
        name: String,
    },
    /// Update the application image only
    App {
        /// BLE DFU target name or address
        name: String,
        /// DFU package path
        pkg: String,
    },
    /// Update the combined SoftDevice and Bootloader image
    Sdbl {
        /// BLE DFU target name or address
        name: String,
        /// DFU package path
        pkg: String,
    },
    /// Update every role present in the package's manifest
    Full {
        /// BLE DFU target name or address
        name: String,
        /// DFU package path
        pkg: String,
    },
    /// List nearby peripherals advertising the Nordic DFU service
    Scan {},
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match &args.command {
        Commands::Trigger { name } => {
            transport_btleplug::trigger_buttonless(name, Duration::from_secs(args.connect_timeout_s)).await?;
            println!("{name} is rebooting into DFU mode");
        }
        Commands::App { name, pkg } => run_role(name, pkg, Role::Application, &args).await?,
        Commands::Sdbl { name, pkg } => run_role(name, pkg, Role::SoftdeviceBootloader, &args).await?,
        Commands::Full { name, pkg } => run_full(name, pkg, &args).await?,
        Commands::Scan {} => run_scan(&args).await?,
    }
    Ok(())
}

async fn run_role(name: &str, pkg: &str, role: Role, args: &Args) -> anyhow::Result<()> {
    let package = Package::open(pkg)?;
    let image = package
        .image(role)
        .ok_or_else(|| anyhow::anyhow!("package has no {role:?} image"))?;
    let single = Package {
        images: vec![image.clone()],
    };
    run_package(name, &single, args).await
}

async fn run_full(name: &str, pkg: &str, args: &Args) -> anyhow::Result<()> {
    let package = Package::open(pkg)?;
    anyhow::ensure!(!package.images.is_empty(), "package manifest names no images");
    run_package(name, &package, args).await
}

async fn run_package(name: &str, package: &Package, args: &Args) -> anyhow::Result<()> {
    let mut manager = BtleplugManager::new();
    manager.connect(name, Duration::from_secs(args.connect_timeout_s)).await?;
    let transport = manager.transport();
    let router = ControlPointRouter::new(transport, Duration::from_millis(args.timeout_ms)).await?;

    let bar = ProgressBar::new(1);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .unwrap(),
    );
    let bar_for_callback = bar.clone();
    let on_progress: orchestrator::ProgressCallback = Arc::new(move |role, offset, total| {
        bar_for_callback.set_message(format!("{role:?}"));
        bar_for_callback.set_length(total as u64);
        bar_for_callback.set_position(offset as u64);
    });

    let result = orchestrator::upgrade(router, package, args.prn, Some(on_progress)).await;
    bar.finish_and_clear();
    manager.disconnect().await.ok();

    let reports = result?;
    for report in reports {
        println!("{:?} sent in {:.2}s", report.role, report.elapsed.as_secs_f32());
    }
    println!("DFU complete");
    Ok(())
}

async fn run_scan(args: &Args) -> anyhow::Result<()> {
    let devices = transport_btleplug::scan(Duration::from_secs(args.connect_timeout_s)).await?;
    if devices.is_empty() {
        println!("no DFU devices found");
    }
    for device in devices {
        println!(
            "{}  rssi:{}  name:{}  ({})",
            device.address,
            device.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".into()),
            device.name.as_deref().unwrap_or("<unknown>"),
            device.reason
        );
    }
    Ok(())
}
