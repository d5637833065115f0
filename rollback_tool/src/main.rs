// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use log::{info, warn};
use packed_struct::prelude::*;
use rand_core::OsRng;
use rollback_areas::{BankIndex, BoardConfig, RollbackRecord, ROLLBACK_SECRET_SIZE};
use rollback_store::host_cmd::{AddEntropyAction, EcResponseRollbackInfo};
use rollback_store::{EcCommand, EcStatus, FileFlash, HostResponse, Rollback};
use serde::Serialize;
use std::path::{Path, PathBuf};

type Subsystem = Rollback<FileFlash, OsRng>;

/// How many times `add-entropy` asks for the result before giving up
const GET_RESULT_TRIES: usize = 100;

#[derive(Debug, Parser)]
enum Command {
    /// Create a blank flash image and write the factory record
    Init {
        /// Overwrite an existing image
        #[clap(short, long)]
        force: bool,
    },
    /// Show both banks and which one is active
    Info {
        #[clap(long)]
        json: bool,
    },
    /// Raise the minimum rollback version
    Update {
        #[arg(value_parser = parse_int::parse::<u32>)]
        version: u32,
    },
    /// Add entropy to the rollback secret, like `ectool addentropy`
    AddEntropy {
        /// Chain these bytes in directly instead of asking the TRNG
        #[clap(long, conflicts_with = "reset")]
        data: Option<String>,
        /// Throw away the current secret and start from fresh TRNG output
        #[clap(long)]
        reset: bool,
    },
    /// Check an image's rollback version against the minimum
    Check {
        #[arg(value_parser = parse_int::parse::<u32>)]
        version: u32,
        /// Also raise the minimum to `version` if it is newer
        #[clap(long)]
        sync: bool,
    },
    /// Print the raw record bytes of one bank
    Dump {
        #[clap(value_enum)]
        bank: BankIndex,
    },
    /// EC_CMD_ROLLBACK_INFO, printed the way ectool does
    RollbackInfo,
    /// Send a raw host command
    Host {
        #[arg(value_parser = parse_int::parse::<u16>)]
        command: u16,
        /// Parameters, as hex
        #[clap(default_value = "")]
        params: String,
        #[clap(long, default_value_t = 0)]
        version: u8,
    },
    /// Run an EC console command (rollbackinfo, rollbackupdate, rollbackaddent)
    Console {
        #[clap(required = true)]
        argv: Vec<String>,
    },
}

#[derive(Debug, Parser)]
#[clap(name = "rollback", max_term_width = 80)]
struct Opts {
    /// Flash image holding the rollback banks
    #[clap(short, long)]
    image: PathBuf,

    /// Board description (TOML). Defaults to two 4 KiB banks at 0x0 and 0x1000
    #[clap(short, long)]
    board: Option<PathBuf>,

    /// Behave like a production part, whatever the board file says
    #[clap(long)]
    locked: bool,

    #[clap(short, long)]
    verbose: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct BankJson {
    bank: BankIndex,
    valid: bool,
    id: u32,
    min_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct InfoJson {
    active_bank: Option<BankIndex>,
    min_version: u32,
    rw_rollback_version: u32,
    locked: bool,
    banks: Vec<BankJson>,
}

fn load_board(path: Option<&Path>) -> Result<BoardConfig> {
    let Some(path) = path else {
        return Ok(BoardConfig::default());
    };
    let text =
        std::fs::read_to_string(path).with_context(|| format!("could not read {path:?}"))?;
    let cfg: BoardConfig =
        toml::from_str(&text).with_context(|| format!("could not parse board file {path:?}"))?;
    Ok(cfg)
}

fn open(image: &Path, cfg: BoardConfig) -> Result<Subsystem> {
    let flash = FileFlash::open(image, cfg.erased_value)
        .with_context(|| format!("could not open flash image {image:?}"))?;
    if flash.size() < cfg.flash_size() {
        bail!(
            "flash image {image:?} is {:#x} bytes, the board needs {:#x}",
            flash.size(),
            cfg.flash_size()
        );
    }
    Ok(Rollback::new(flash, cfg, OsRng)?)
}

fn secret_hint(record: &RollbackRecord) -> String {
    format!(
        "{:02x}..{:02x}",
        record.secret[0],
        record.secret[ROLLBACK_SECRET_SIZE - 1]
    )
}

fn show_info(rb: &mut Subsystem, json: bool) -> Result<()> {
    let resolved = rb.resolve()?;
    let locked = rb.is_locked();

    let mut banks = Vec::new();
    for bank in BankIndex::ALL {
        let record = rb.store_mut().read_record(bank)?;
        banks.push(BankJson {
            bank,
            valid: record.is_valid(),
            id: record.id,
            min_version: record.min_version,
            secret: (!locked).then(|| secret_hint(&record)),
        });
    }
    let info = InfoJson {
        active_bank: resolved.active_bank(),
        min_version: resolved.min_version(),
        rw_rollback_version: rb.store().config().rw_rollback_version,
        locked,
        banks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    match info.active_bank {
        Some(bank) => println!("active bank:          {bank}"),
        None => println!("active bank:          {}", "unprovisioned".yellow()),
    }
    println!("minimum version:      {}", info.min_version);
    println!("RW rollback version:  {}", info.rw_rollback_version);
    for bank in &info.banks {
        let state = if bank.valid { "valid".green() } else { "invalid".red() };
        print!(
            "bank {}: {state:7} id {:#010x} min version {:#010x}",
            bank.bank, bank.id, bank.min_version
        );
        if let Some(secret) = &bank.secret {
            print!(" secret [{secret}]");
        }
        println!();
    }
    Ok(())
}

fn add_entropy_async(rb: &mut Subsystem, reset: bool) -> Result<()> {
    let action = if reset {
        AddEntropyAction::ResetAsync
    } else {
        AddEntropyAction::Async
    };
    let status = rb
        .host_command(EcCommand::AddEntropy as u16, 0, &[action as u8])
        .status;
    if status != EcStatus::Success {
        bail!("failed to add entropy: {status:?}");
    }

    for _ in 0..GET_RESULT_TRIES {
        rb.run_deferred();
        let status = rb
            .host_command(
                EcCommand::AddEntropy as u16,
                0,
                &[AddEntropyAction::GetResult as u8],
            )
            .status;
        match status {
            EcStatus::Success => {
                println!("Entropy added successfully");
                return Ok(());
            }
            EcStatus::Busy => continue,
            other => bail!("failed to add entropy: {other:?}"),
        }
    }
    bail!("failed to add entropy: {:?}", EcStatus::Timeout)
}

fn rollback_info(rb: &mut Subsystem) -> Result<()> {
    let HostResponse { status, data } =
        rb.host_command(EcCommand::RollbackInfo as u16, 0, &[]);
    if status != EcStatus::Success {
        bail!("EC_CMD_ROLLBACK_INFO failed: {status:?}");
    }
    let r = EcResponseRollbackInfo::unpack_from_slice(&data)
        .context("malformed ROLLBACK_INFO response")?;

    println!("Rollback block id:    {}", r.id);
    println!("Rollback min version: {}", r.rollback_min_version);
    println!("RW rollback version:  {}", r.rw_rollback_version);
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let level = if opts.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut cfg = load_board(opts.board.as_deref())?;
    cfg.locked |= opts.locked;
    cfg.validate()?;

    match opts.cmd {
        Command::Init { force } => {
            if opts.image.exists() {
                if !force {
                    bail!("{:?} already exists, pass --force to overwrite", opts.image);
                }
                println!(
                    "{}: discarding the rollback state in {:?}",
                    "WARNING".red(),
                    opts.image
                );
            }
            let flash = FileFlash::create(&opts.image, cfg.flash_size(), cfg.erased_value)
                .with_context(|| format!("could not create {:?}", opts.image))?;
            let mut rb = Rollback::new(flash, cfg, OsRng)?;
            rb.provision()?;
            info!("flash image written to {:?}", opts.image);
        }
        Command::Info { json } => show_info(&mut open(&opts.image, cfg)?, json)?,
        Command::Update { version } => {
            let mut rb = open(&opts.image, cfg)?;
            rb.update_version(version)
                .with_context(|| format!("could not raise minimum version to {version}"))?;
        }
        Command::AddEntropy { data, reset } => {
            let mut rb = open(&opts.image, cfg)?;
            match data {
                Some(data) => rb.add_entropy(data.as_bytes())?,
                None => add_entropy_async(&mut rb, reset)?,
            }
        }
        Command::Check { version, sync } => {
            let mut rb = open(&opts.image, cfg)?;
            if sync {
                if rb.sync_firmware_version(version)? {
                    info!("minimum version raised to {version}");
                }
            } else {
                rb.check_firmware_version(version)?;
            }
            println!("rollback version {version} is allowed");
        }
        Command::Dump { bank } => {
            let mut rb = open(&opts.image, cfg)?;
            if rb.is_locked() {
                bail!("refusing to dump rollback bank {bank} of a locked part");
            }
            let bytes = rb.store_mut().read(bank)?;
            println!("{}", hex::encode(bytes));
        }
        Command::RollbackInfo => rollback_info(&mut open(&opts.image, cfg)?)?,
        Command::Host {
            command,
            params,
            version,
        } => {
            let params = hex::decode(&params).context("params must be hex")?;
            let mut rb = open(&opts.image, cfg)?;
            let response = rb.host_command(command, version, &params);
            // Jobs do not outlive this process, so let queued work run now
            rb.run_deferred();
            println!("status: {:?}", response.status);
            if !response.data.is_empty() {
                println!("data:   {}", hex::encode(&response.data));
            }
        }
        Command::Console { argv } => {
            let mut rb = open(&opts.image, cfg)?;
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            match rb.console_argv(&argv) {
                Ok(out) => print!("{out}"),
                Err(e) => {
                    warn!("{e}");
                    bail!("{}", e.kind());
                }
            }
        }
    }

    Ok(())
}
