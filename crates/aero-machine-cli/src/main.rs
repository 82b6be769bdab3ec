//! `aero-machine`: boots a flat disk image under the `aero-machine` core and runs it
//! for a bounded number of instructions (§6 "CLI surface"). Exists for driving test
//! fixtures and manual smoke-checks; it is not an interactive monitor.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use aero_machine::{BootMode, Machine, MachineConfig, RunExit};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    #[value(name = "real16")]
    Real16,
    #[value(name = "pm32")]
    Pm32,
    #[value(name = "long64")]
    Long64,
}

impl From<ModeArg> for BootMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Real16 => BootMode::Real16,
            ModeArg::Pm32 => BootMode::Protected32,
            ModeArg::Long64 => BootMode::Long64,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SerialOut {
    #[value(name = "stdout")]
    Stdout,
    #[value(name = "none")]
    None,
}

/// Boot a disk image under the `aero-machine` core for up to `--max-insts` steps.
#[derive(Debug, Parser)]
#[command(name = "aero-machine", version)]
struct Args {
    /// Path to the disk image; its first 512 bytes are loaded as the boot sector.
    #[arg(long)]
    disk: PathBuf,

    /// Guest RAM size in MiB.
    #[arg(long, default_value_t = 64)]
    ram: u64,

    /// Instruction budget for this run; the run stops once it's exhausted even if the
    /// guest is still executing.
    #[arg(long, default_value_t = 1_000_000)]
    max_insts: u64,

    /// Starting CPU mode, for fixtures that want to skip the real-mode transition.
    #[arg(long, value_enum, default_value = "real16")]
    mode: ModeArg,

    /// A20 gate state at reset.
    #[arg(long, default_value = "off")]
    a20: String,

    /// Where to send bytes the guest writes to the COM1 serial port.
    #[arg(long, value_enum, default_value = "none")]
    serial_out: SerialOut,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let a20_enabled = match args.a20.as_str() {
        "on" => true,
        "off" => false,
        other => anyhow::bail!("--a20 must be \"on\" or \"off\", got {other:?}"),
    };

    let disk_bytes = fs::read(&args.disk)
        .with_context(|| format!("reading disk image at {}", args.disk.display()))?;

    let config = MachineConfig {
        ram_size_bytes: args.ram * 1024 * 1024,
        a20_enabled,
        boot_mode: args.mode.into(),
    };

    let mut machine = Machine::new(config).context("constructing machine")?;
    machine.set_disk_image(disk_bytes).context("attaching disk image")?;
    machine.reset().context("resetting machine")?;

    let exit = machine.run_slice(args.max_insts).context("running instruction slice")?;

    if matches!(args.serial_out, SerialOut::Stdout) {
        let serial = machine.take_serial_output();
        std::io::stdout().write_all(&serial)?;
        std::io::stdout().flush()?;
    }

    match exit {
        RunExit::InstructionLimit { executed } => {
            tracing::info!(executed, "instruction budget exhausted");
            Ok(())
        }
        RunExit::Halted { executed } => {
            tracing::info!(executed, "halted with nothing left to wake it");
            Ok(())
        }
        RunExit::Faulted { exception, executed } => {
            anyhow::bail!("run faulted after {executed} instructions: {exception}")
        }
    }
}
