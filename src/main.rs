use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use cfs_spool::catalog::{self, SpoolNames};
use cfs_spool::transport::SimImage;
use cfs_spool::{
    CardTransport, Config, KeyType, ReadOptions, SectorKey, SimulatedCard, SpoolRecord,
    TagClass, TagProvisioner, TagUid, WritePlan,
};

/// UID of the card the simulator starts with when no image exists yet.
const SIM_UID: &str = "C56A083E";

#[derive(Parser)]
#[command(name = "cfs-spool", version, about = "Read and write filament-spool RFID tags")]
struct Cli {
    /// JSON config file (key substitution, extra key candidates)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Raise log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG wins
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Use an in-memory tag instead of a reader, optionally persisted to IMAGE
    #[arg(long, value_name = "IMAGE", num_args = 0..=1, global = true)]
    simulate: Option<Option<PathBuf>>,
    /// PC/SC reader name (default: the first reader listed)
    #[arg(long, value_name = "NAME", global = true, conflicts_with = "simulate")]
    reader: Option<String>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read and decode the spool record from the tag on the reader
    Read {
        /// Sector key to use instead of searching (12 hex digits)
        #[arg(long)]
        key: Option<SectorKey>,
        #[arg(long, requires = "key")]
        key_type: Option<KeyType>,
    },
    /// Encode a record and write it to the tag on the reader
    Write {
        #[command(flatten)]
        record: RecordArgs,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// Do not read the blocks back after writing
        #[arg(long)]
        no_verify: bool,
        /// Leave a blank tag's transport keys in place instead of locking it
        #[arg(long)]
        keep_transport_keys: bool,
        /// Sector key to write with instead of classifying the tag
        #[arg(long, requires = "key_type")]
        key: Option<SectorKey>,
        #[arg(long, requires = "key")]
        key_type: Option<KeyType>,
    },
    /// Print the sector key derived from a UID
    DeriveKey {
        uid: TagUid,
    },
    /// Decrypt and decode the 96 hex characters of blocks 4–6
    Decode {
        cipher: String,
    },
    /// Encode and encrypt a record without touching a tag
    Encode {
        #[command(flatten)]
        record: RecordArgs,
    },
    /// Print the supplier, material and length tables as JSON
    Options,
}

#[derive(Args)]
struct RecordArgs {
    /// YYYY-MM-DD or a 5-character date code (default: today)
    #[arg(long)]
    date: Option<String>,
    #[arg(long, default_value = "0276")]
    supplier: String,
    /// Material code or catalog name, e.g. 04001 or CR-PLA
    #[arg(long)]
    material: String,
    /// Five hex digits, optionally prefixed with '#'
    #[arg(long)]
    color: String,
    /// Length code or nominal weight in grams
    #[arg(long, default_value = "0330")]
    length: String,
    #[arg(long, default_value = "000001")]
    serial: String,
}

impl RecordArgs {
    fn to_record(&self) -> Result<SpoolRecord, Box<dyn std::error::Error>> {
        let date = match &self.date {
            None => catalog::date_code(chrono::Local::now().date_naive()),
            Some(d) if d.len() == 5 => d.to_ascii_uppercase(),
            Some(d) => catalog::date_code(NaiveDate::parse_from_str(d, "%Y-%m-%d")?),
        };
        let material = match catalog::material_code(&self.material) {
            Some(code) => code.to_owned(),
            None => {
                warn!(material = %self.material, "material not in catalog, writing as given");
                self.material.clone()
            }
        };
        let length = catalog::length_code(&self.length)
            .map(str::to_owned)
            .unwrap_or_else(|| self.length.clone());
        if !catalog::is_known_supplier(&self.supplier) {
            warn!(supplier = %self.supplier, "supplier not in catalog, writing as given");
        }
        let record = SpoolRecord::new(date, &self.supplier, material, "", length, &self.serial)
            .with_color_hex(&self.color)?;
        Ok(record)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None       => Config::default(),
    };

    match &cli.command {
        // ── Offline commands ─────────────────────────────────────────────────
        Commands::DeriveKey { uid } => {
            let key = config.codec_keys()?.deriver().derive(uid);
            if cli.json {
                println!("{}", serde_json::json!({ "uid": uid, "key": key }));
            } else {
                println!("{key}");
            }
        }

        Commands::Decode { cipher } => {
            let plain  = config.codec_keys()?.payload_codec().decrypt(cipher)?;
            let record = SpoolRecord::decode_lenient(&plain)?;
            print_record(&record, cli.json)?;
        }

        Commands::Encode { record } => {
            let record = record.to_record()?;
            let ascii  = record.encode()?;
            let cipher = config.codec_keys()?.payload_codec().encrypt_hex(ascii.as_bytes())?;
            if cli.json {
                println!("{}", serde_json::json!({ "record": ascii, "cipher": cipher }));
            } else {
                println!("{ascii}");
                println!("{cipher}");
            }
        }

        Commands::Options => {
            println!("{}", serde_json::to_string_pretty(&catalog::options())?);
        }

        // ── Card commands ────────────────────────────────────────────────────
        Commands::Read { .. } | Commands::Write { .. } => match &cli.simulate {
            Some(image) => {
                let image = image.as_deref();
                let card = load_sim(image)?;
                let mut prov = TagProvisioner::with_config(card, &config)?;
                let result = run_card_command(&mut prov, &cli);
                if let Some(path) = image {
                    save_sim(prov.transport(), path)?;
                }
                result?;
            }
            None => run_reader(&cli, &config)?,
        },
    }

    Ok(())
}

// ── Card commands ────────────────────────────────────────────────────────────

#[cfg(feature = "pcsc")]
fn run_reader(cli: &Cli, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    use cfs_spool::transport::PcscTransport;

    let transport = match &cli.reader {
        Some(name) => PcscTransport::with_reader(name.as_str()),
        None       => PcscTransport::new(),
    };
    let mut prov = TagProvisioner::with_config(transport, config)?;
    run_card_command(&mut prov, cli)
}

#[cfg(not(feature = "pcsc"))]
fn run_reader(_cli: &Cli, _config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    Err("built without PC/SC support; rebuild with --features pcsc or pass --simulate".into())
}

fn run_card_command<T: CardTransport>(
    prov: &mut TagProvisioner<T>,
    cli:  &Cli,
) -> Result<(), Box<dyn std::error::Error>> {
    match &cli.command {
        Commands::Read { key, key_type } => {
            let reading = prov.read_spool_with(&ReadOptions { key: *key, key_type: *key_type })?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reading)?);
            } else {
                println!("UID        {}", reading.uid);
                println!("Key        {} (type {}, {:?})", reading.key, reading.key_type, reading.procedure);
                print_record(&reading.record, false)?;
            }
        }

        Commands::Write { record, yes, no_verify, keep_transport_keys, key, key_type } => {
            let record = record.to_record()?;
            let mut options = prov.write_options();
            if *no_verify {
                options.verify = false;
            }
            if *keep_transport_keys {
                options.rewrite_trailer = false;
            }
            if let (Some(k), Some(t)) = (key, key_type) {
                options.explicit_key = Some((*k, *t));
            }
            let outcome = prov.write_spool(&record, &options, |plan| *yes || confirm(plan))?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("Wrote blocks {:?} to {}", outcome.blocks_written, outcome.uid);
                if outcome.trailer_rewritten {
                    println!("Sector 1 locked with the derived key");
                }
                for m in &outcome.mismatches {
                    match (&m.actual, &m.error) {
                        (_, Some(err)) => println!("  block {}: {err}", m.block),
                        (Some(actual), None) => println!(
                            "  block {}: expected {} read {}",
                            m.block,
                            hex::encode_upper(m.expected),
                            hex::encode_upper(actual),
                        ),
                        (None, None) => println!("  block {}: mismatch", m.block),
                    }
                }
            }
            if !outcome.is_success() {
                return Err(format!("verification failed for {} block(s)", outcome.mismatches.len()).into());
            }
            info!(uid = %outcome.uid, "write complete");
        }

        _ => return Err("not a card command".into()),
    }
    Ok(())
}

fn confirm(plan: &WritePlan) -> bool {
    let state = match plan.class {
        TagClass::Blank       => "blank, will be locked with its derived key",
        TagClass::Provisioned => "already provisioned",
    };
    eprintln!("Tag {} ({state})", plan.uid);
    eprint!("Overwrite blocks 4-6? [y/N] ");
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn print_record(record: &SpoolRecord, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let names = SpoolNames::resolve(record);
    if json {
        let out = serde_json::json!({ "record": record, "names": names });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    println!("Date       {}  ({})", record.date, names.date);
    println!("Supplier   {}  ({})", record.supplier, names.supplier);
    println!("Material   {}  ({})", record.material, names.material);
    println!("Color      {}  ({})", record.color, names.color);
    println!("Length     {}  ({})", record.length, names.length);
    println!("Serial     {}", record.serial);
    Ok(())
}

fn load_sim(image: Option<&Path>) -> Result<SimulatedCard, Box<dyn std::error::Error>> {
    match image {
        Some(path) if path.exists() => {
            let image: SimImage = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            Ok(SimulatedCard::from_image(&image)?)
        }
        _ => Ok(SimulatedCard::blank(SIM_UID.parse()?)),
    }
}

fn save_sim(card: &SimulatedCard, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::write(path, serde_json::to_string_pretty(&card.to_image())?)?;
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
