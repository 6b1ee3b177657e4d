use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use openbl_nvm::device::{parse_number, DeviceDB};
use openbl_nvm::protection::{RdpLevel, WpState};
use openbl_nvm::sim::SimController;
use openbl_nvm::{Deferred, MemoryKind, Nvm};

#[derive(Parser)]
#[command(
    name = "openbl-nvm",
    about = "Drive the STM32WL open bootloader NVM operations against a simulated part",
    author = "Andelf <andelf@gmail.com>"
)]
struct Cli {
    /// Device name from the bundled device files
    #[arg(long, short, default_value = "STM32WL55")]
    device: String,
    /// Directory holding the simulated flash, OTP and option bytes
    #[arg(long, short, default_value = "nvm-state")]
    state: PathBuf,
    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List bundled devices
    Devices {},
    #[command(flatten)]
    Nvm(NvmCommand),
}

/// Commands run against the simulated part.
#[derive(Subcommand)]
enum NvmCommand {
    /// Show the memory map and protection state
    Info {},
    /// Dump memory
    Read {
        address: String,
        #[arg(default_value = "256")]
        length: String,
    },
    /// Program flash, OTP or the option byte image
    Write {
        address: String,
        /// Hex encoded payload
        #[arg(required_unless_present = "file")]
        data: Option<String>,
        /// Raw binary payload
        #[arg(long, short)]
        file: Option<PathBuf>,
    },
    /// Erase flash pages, or the whole flash
    Erase {
        #[arg(long, conflicts_with = "pages")]
        mass: bool,
        pages: Vec<u16>,
    },
    /// Enable or disable write protection of up to two page ranges
    WriteProtect {
        #[arg(long)]
        disable: bool,
        /// start/end pairs, area A then area B
        pages: Vec<u8>,
    },
    /// Show or set the readout protection level (0, 1 or 2)
    Rdp { level: Option<u8> },
    /// Decode the stack pointer and entry point of an application
    Jump {
        #[arg(default_value = "0x08000000")]
        address: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = simplelog::TermLogger::init(
        if cli.verbose {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let command = match cli.command {
        Command::Devices {} => {
            for name in DeviceDB::names()? {
                println!("{}", name);
            }
            return Ok(());
        }
        Command::Nvm(command) => command,
    };

    let device = DeviceDB::find_device(&cli.device)?;
    let controller = SimController::load(&device, &cli.state)?;
    let mut nvm = Nvm::new(controller, device)?;
    let mut deferred = Deferred::new();

    // the reload and the saved state follow the command even when it failed
    let result = run(&mut nvm, &mut deferred, command);
    if nvm.post_process(&mut deferred) {
        log::info!("Option bytes reloaded");
    }
    nvm.into_controller().save(&cli.state)?;

    result
}

fn run(nvm: &mut Nvm<SimController>, deferred: &mut Deferred, command: NvmCommand) -> Result<()> {
    match command {
        NvmCommand::Info {} => {
            nvm.dump_info();
        }
        NvmCommand::Read { address, length } => {
            let address = parse_number(&address)?;
            let length = parse_number(&length)? as usize;
            let data = nvm.read_memory(address, length)?;
            let mut out = Vec::new();
            hxdmp::hexdump(&data, &mut out)?;
            println!("{}", String::from_utf8_lossy(&out));
        }
        NvmCommand::Write { address, data, file } => {
            let address = parse_number(&address)?;
            let payload = match (data, file) {
                (_, Some(path)) => std::fs::read(path)?,
                (Some(data), None) => hex::decode(data.replace(' ', ""))?,
                (None, None) => anyhow::bail!("nothing to write"),
            };
            log::info!("Writing {} bytes at 0x{:08x}", payload.len(), address);
            let result = nvm.write(address, &payload);
            deferred.record_result(&result);
            let _ = result?;
        }
        NvmCommand::Erase { mass, pages } => {
            let request = if mass {
                openbl_nvm::constants::erase::MASS.to_le_bytes().to_vec()
            } else {
                anyhow::ensure!(!pages.is_empty(), "no pages given, use --mass for a full erase");
                let count = pages.len() as u16;
                std::iter::once(count)
                    .chain(pages.iter().copied())
                    .flat_map(u16::to_le_bytes)
                    .collect()
            };
            let result = nvm.erase(MemoryKind::Flash, &request);
            deferred.record_result(&result);
            let _ = result?;
            log::info!("Erase done");
        }
        NvmCommand::WriteProtect { disable, pages } => {
            let state = if disable {
                WpState::Disable
            } else {
                WpState::Enable
            };
            let result = nvm.set_write_protection(state, &pages);
            deferred.record_result(&result);
            let _ = result?;
        }
        NvmCommand::Rdp { level: None } => {
            println!("{}", nvm.read_protection());
        }
        NvmCommand::Rdp { level: Some(level) } => {
            let level = match level {
                0 => RdpLevel::Level0,
                1 => RdpLevel::Level1,
                2 => RdpLevel::Level2,
                _ => anyhow::bail!("RDP level must be 0, 1 or 2"),
            };
            let result = nvm.set_read_protection(level);
            deferred.record_result(&result);
            let _ = result?;
        }
        NvmCommand::Jump { address } => {
            let target = nvm.jump_target(parse_number(&address)?)?;
            println!("SP = 0x{:08x}", target.stack_pointer);
            println!("PC = 0x{:08x}", target.entry);
        }
    }
    Ok(())
}
