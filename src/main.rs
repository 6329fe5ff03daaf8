use std::path::PathBuf;

use clap::{Parser, Subcommand};

use instrument_agent_lib::{commands, AgentConfig, DeviceManager};

#[derive(Parser)]
#[command(name = "instrument-agent")]
#[command(author, version, about = "Host agent for UART-attached instruments", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Agent config file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices that can be claimed
    List,
    /// Claim a device and send it one frame
    Send {
        /// Port name, e.g. COM7 or /dev/ttyUSB0
        port: String,
        /// Frame to send; a line ending is appended when missing
        frame: String,
        /// Reply deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Claim a device and flash a firmware image onto it
    Update {
        port: String,
        image: PathBuf,
        /// Ask the device to enter its bootloader first
        #[arg(long)]
        enter_bootloader: bool,
        /// Expected SHA-256 of the image
        #[arg(long)]
        sha256: Option<String>,
    },
    /// Print the agent version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };

    let default_filter = match cli.verbose {
        0 => config.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    if let Commands::Version = cli.command {
        println!("{}", commands::get_version());
        return Ok(());
    }

    let device_manager = DeviceManager::new(config);
    log::info!("Agent {} started", commands::get_version());

    match cli.command {
        Commands::List => {
            for name in commands::enumerate_devices(&device_manager).await.map_err(anyhow::Error::msg)? {
                println!("{}", name);
            }
        }
        Commands::Send { port, frame, timeout_ms } => {
            commands::set_active_device(&device_manager, port)
                .await
                .map_err(anyhow::Error::msg)?;
            let reply = commands::write_read(&device_manager, frame, timeout_ms)
                .await
                .map_err(anyhow::Error::msg)?;
            println!("{}", reply.trim_end());
        }
        Commands::Update {
            port,
            image,
            enter_bootloader,
            sha256,
        } => {
            let image_path = image.to_string_lossy().into_owned();
            commands::verify_firmware_image(image_path.clone(), sha256)
                .await
                .map_err(anyhow::Error::msg)?;
            commands::set_active_device(&device_manager, port)
                .await
                .map_err(anyhow::Error::msg)?;
            commands::update_firmware(&device_manager, image_path, enter_bootloader)
                .await
                .map_err(anyhow::Error::msg)?;
            println!("Firmware updated");
        }
        Commands::Version => {}
    }

    device_manager.release().await;
    Ok(())
}
