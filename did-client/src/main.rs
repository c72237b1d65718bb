//! # DID Client CLI
//!
//! Command-line front end for the local DID record store:
//! - Generate or import identities and register them on a ledger
//! - Rotate keys, remove unpublished records
//! - Inspect, export and list records
//! - Manage per-identifier notes
//!
//! ## Usage
//!
//! ```bash
//! # Generate and publish in one go
//! did-client --ledger http://localhost:8080 generate --name alice --register
//!
//! # Show a record, locally or on the ledger
//! did-client info did:example:0a1b2c... --location both
//!
//! # Import an exported record from stdin
//! did-client export did:example:0a1b2c... --private | did-client --home /tmp/other import -
//!
//! # Rotate a key
//! did-client rotate 'did:example:0a1b2c...#0a1b2c3d4e5f6a7b'
//!
//! # Tag every identifier
//! did-client notes --all --add project=demo
//! ```

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

use did_store::{
    DidStore, Ed25519Generator, GenerateOptions, HttpRegistrar, InfoLocation, LedgerRegistrar,
    ListFilter, MemoryLedger, NotesRequest, NotesScope,
};
use shared::{
    config::StoreConfig,
    types::{Did, KeyMaterial, KeyType, RecordStatus},
};

#[derive(Parser)]
#[command(name = "did-client")]
#[command(about = "Local DID record store", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store root (default: ~/.dids)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// DID method
    #[arg(long, global = true)]
    method: Option<String>,

    /// Ledger mode (test, main, ...)
    #[arg(long, global = true)]
    mode: Option<String>,

    /// Ledger registrar URL, or "memory" for an in-process ledger
    #[arg(long, global = true)]
    ledger: Option<String>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = Format::Human)]
    format: Format,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Human,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Registered,
}

impl From<StatusArg> for RecordStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Pending => RecordStatus::Pending,
            StatusArg::Registered => RecordStatus::Registered,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LocationArg {
    Local,
    Ledger,
    Any,
    Both,
}

impl From<LocationArg> for InfoLocation {
    fn from(location: LocationArg) -> Self {
        match location {
            LocationArg::Local => InfoLocation::Local,
            LocationArg::Ledger => InfoLocation::Ledger,
            LocationArg::Any => InfoLocation::Any,
            LocationArg::Both => InfoLocation::Both,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity
    Generate {
        /// Key type
        #[arg(long, short = 't', default_value = "ed25519")]
        key_type: String,

        /// Hex-encoded 32 byte seed
        #[arg(long)]
        seed: Option<String>,

        /// Passphrase protecting exported private keys
        #[arg(long)]
        passphrase: Option<String>,

        /// Name note
        #[arg(long)]
        name: Option<String>,

        /// Description note
        #[arg(long)]
        description: Option<String>,

        /// Register on the ledger right away
        #[arg(long)]
        register: bool,
    },

    /// Store an existing document and its keys as a pending identity
    ///
    /// Reads a JSON object with `document` and `keys` members, such as the
    /// output of `export --private`.
    Import {
        /// File to read, or "-" for stdin
        #[arg(default_value = "-")]
        file: String,

        /// Register on the ledger right away
        #[arg(long)]
        register: bool,
    },

    /// Publish a pending identity
    Register {
        did: String,
    },

    /// Replace a key with a freshly generated one
    Rotate {
        /// Key id (`<did>#<fragment>`)
        key_id: String,

        #[arg(long, short = 't', default_value = "ed25519")]
        key_type: String,
    },

    /// Remove an unpublished identity
    Remove {
        did: String,
    },

    /// Show a record
    Info {
        did: String,

        #[arg(long, short = 'l', value_enum, default_value = "any")]
        location: LocationArg,
    },

    /// Export document, keys and metadata
    Export {
        did: String,

        /// Include private keys
        #[arg(long)]
        private: bool,
    },

    /// List stored identities
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Only the configured method and mode
        #[arg(long)]
        current: bool,

        /// Load every document and report broken ones
        #[arg(long)]
        verify: bool,

        /// List identifiers with notes instead
        #[arg(long)]
        notes: bool,
    },

    /// Show or edit notes
    Notes(NotesArgs),
}

#[derive(Args)]
struct NotesArgs {
    /// Identifier (omit to show all notes read-only)
    did: Option<String>,

    /// Apply to every identifier with notes
    #[arg(long, conflicts_with = "did")]
    all: bool,

    /// Remove all notes
    #[arg(long)]
    clear: bool,

    /// Add a value: property=value
    #[arg(long, value_parser = parse_pair)]
    add: Option<(String, String)>,

    /// Remove a value: property=value
    #[arg(long, value_parser = parse_pair)]
    remove: Option<(String, String)>,

    /// Print the values of a property
    #[arg(long)]
    get: Option<String>,

    /// Replace all values: property=value
    #[arg(long, value_parser = parse_pair)]
    set: Option<(String, String)>,

    /// Delete a property
    #[arg(long)]
    delete: Option<String>,

    /// Test for a value: property=value
    #[arg(long, value_parser = parse_pair)]
    find: Option<(String, String)>,

    /// Print the properties recorded automatically by lifecycle operations
    #[arg(
        long,
        conflicts_with_all = ["did", "all", "clear", "add", "remove", "get", "set", "delete", "find"]
    )]
    auto: bool,
}

/// Record read by the `import` command
#[derive(Debug, Deserialize)]
struct ImportRecord {
    document: Value,
    keys: KeyMaterial,
}

async fn read_import(file: &str) -> Result<ImportRecord> {
    let data = if file == "-" {
        debug!("Importing from stdin");
        let mut data = Vec::new();
        tokio::io::stdin().read_to_end(&mut data).await?;
        data
    } else {
        debug!(file = %file, "Importing from file");
        tokio::fs::read(file).await?
    };
    parse_import(&data)
}

fn parse_import(data: &[u8]) -> Result<ImportRecord> {
    serde_json::from_slice(data)
        .map_err(|e| anyhow::anyhow!("expected a JSON object with \"document\" and \"keys\": {}", e))
}

fn parse_pair(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((property, value)) if !property.is_empty() => {
            Ok((property.to_string(), value.to_string()))
        }
        _ => Err(format!("expected property=value, got '{}'", input)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = build_config(&cli)?;
    debug!(root = ?config.root_dir, method = %config.method, mode = %config.mode, "Opening store");

    let ledger = build_ledger(&cli, &config)?;
    let generator = Arc::new(Ed25519Generator::new(config.method.clone()));
    let store = DidStore::open(config, generator, ledger)?;

    let format = cli.format;
    match cli.command {
        Commands::Generate {
            key_type,
            seed,
            passphrase,
            name,
            description,
            register,
        } => {
            let options = GenerateOptions {
                key_type: key_type.parse()?,
                passphrase,
                seed,
                name,
                description,
                auto_register: register,
            };
            let outcome = store.lifecycle.generate(options).await?;
            print(format, &outcome, || {
                println!("Generated {}", outcome.did);
                println!("  Status: {}", outcome.status);
                println!("  Seed:   {}", outcome.seed);
                if let Some(registration) = &outcome.registration {
                    println!("  Published: {}", registration.published);
                }
            })?;
        }
        Commands::Import { file, register } => {
            let record = read_import(&file).await?;
            let outcome = store
                .lifecycle
                .import(record.document, record.keys, register)
                .await?;
            print(format, &outcome, || {
                println!("Imported {}", outcome.did);
                println!("  Status: {}", outcome.status);
                if let Some(registration) = &outcome.registration {
                    println!("  Published: {}", registration.published);
                }
            })?;
        }
        Commands::Register { did } => {
            let outcome = store.lifecycle.register(&Did::parse(&did)?).await?;
            print(format, &outcome, || {
                println!("Registered {}", outcome.did);
                println!("  Published: {}", outcome.published);
                if let Some(host) = &outcome.published_host {
                    println!("  Host: {}", host);
                }
            })?;
        }
        Commands::Rotate { key_id, key_type } => {
            let key_type: KeyType = key_type.parse()?;
            let outcome = store.lifecycle.rotate_key(&key_id, key_type).await?;
            print(format, &outcome, || {
                println!("Rotated key of {} ({})", outcome.did, outcome.status);
                println!("  Old: {}", outcome.old_key_id);
                println!("  New: {}", outcome.new_key_id);
            })?;
        }
        Commands::Remove { did } => {
            let outcome = store.lifecycle.remove(&Did::parse(&did)?).await?;
            print(format, &outcome, || println!("Removed {}", outcome.did))?;
        }
        Commands::Info { did, location } => {
            let did = Did::parse(&did)?;
            let results = store.lifecycle.info(&did, location.into()).await;
            print(format, &results, || {
                for result in &results {
                    let location = match result.location {
                        InfoLocation::Ledger => "ledger",
                        _ => "local",
                    };
                    match (&result.document, &result.error) {
                        (Some(document), _) => {
                            let status = result.status.map(|s| s.to_string()).unwrap_or_default();
                            println!("[{}] {} ({}, {} ms)", location, result.did, status, result.elapsed_ms);
                            if let Some(metadata) = &result.metadata {
                                for (property, values) in metadata.iter() {
                                    println!("  {}: {}", property, values);
                                }
                            }
                            println!("{}", pretty(document));
                        }
                        (None, Some(error)) => println!("[{}] {}: {}", location, result.did, error),
                        (None, None) => println!("[{}] {}: not found", location, result.did),
                    }
                }
            })?;
            if !results.iter().any(|r| r.found) {
                bail!("'{}' not found", did);
            }
        }
        Commands::Export { did, private } => {
            let mut record = store.lifecycle.export(&Did::parse(&did)?).await?;
            if !private {
                for key in record.keys.keys.values_mut() {
                    *key = key.public_only();
                }
            }
            // Export is always machine readable
            println!("{}", pretty(&record));
        }
        Commands::List {
            status,
            current,
            verify,
            notes,
        } => {
            if notes {
                let ids = store.lister.notes_ids().await?;
                print(format, &ids, || ids.iter().for_each(|id| println!("{}", id)))?;
                return Ok(());
            }

            let filter = ListFilter {
                method: current.then(|| store.config.method.clone()),
                mode: current.then(|| store.config.mode.clone()),
                status: status.map(Into::into),
                verify,
            };
            let listing = store.lister.list(&filter).await?;
            print(format, &listing, || {
                for group in &listing.groups {
                    println!("{}-{} {}:", group.method, group.mode, group.status);
                    for id in &group.identifiers {
                        println!("  {}", id);
                    }
                }
                for skipped in &listing.skipped {
                    eprintln!("skipped {}: {}", skipped.path.display(), skipped.reason);
                }
            })?;
        }
        Commands::Notes(args) if args.auto => {
            let properties = store.notes().auto_notes().await?;
            print(format, &properties, || {
                properties.iter().for_each(|property| println!("{}", property))
            })?;
        }
        Commands::Notes(args) => {
            let request = notes_request(args)?;
            let reports = store.notes().apply(&request).await?;
            print(format, &reports, || {
                for report in &reports {
                    if let Some(found) = report.found {
                        println!("{} {}", report.id, if found { "found" } else { "not found" });
                        continue;
                    }
                    if request.get.is_some() {
                        if let Some(values) = &report.get {
                            println!("{} {}", report.id, values);
                        }
                        continue;
                    }
                    println!("{}", report.id);
                    for (property, values) in report.notes.iter() {
                        println!("  {}: {}", property, values);
                    }
                }
            })?;
        }
    }

    Ok(())
}

fn build_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = StoreConfig::from_env()?;
    if let Some(home) = &cli.home {
        config.root_dir = home.clone();
    }
    if let Some(method) = &cli.method {
        config.method = method.clone();
    }
    if let Some(mode) = &cli.mode {
        config.mode = mode.clone();
    }
    if let Some(ledger) = cli.ledger.as_deref().filter(|l| *l != "memory") {
        config.ledger.endpoint = Some(ledger.to_string());
    }
    config.validate()?;
    Ok(config)
}

fn build_ledger(cli: &Cli, config: &StoreConfig) -> Result<Option<Arc<dyn LedgerRegistrar>>> {
    if cli.ledger.as_deref() == Some("memory") {
        return Ok(Some(Arc::new(MemoryLedger::new())));
    }
    Ok(HttpRegistrar::from_config(&config.ledger)?
        .map(|registrar| Arc::new(registrar) as Arc<dyn LedgerRegistrar>))
}

fn notes_request(args: NotesArgs) -> Result<NotesRequest> {
    let scope = match (args.did, args.all) {
        (Some(did), _) => NotesScope::Identifier(Did::parse(&did)?),
        (None, true) => NotesScope::All,
        (None, false) => NotesScope::Unscoped,
    };

    Ok(NotesRequest {
        scope,
        clear: args.clear,
        add: args.add,
        remove: args.remove,
        get: args.get,
        set: args.set,
        delete: args.delete,
        find: args.find,
    })
}

fn pretty<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unprintable: {}>", e))
}

/// Print `value` as JSON, or run `human` for the human format
fn print<T: Serialize + ?Sized>(format: Format, value: &T, human: impl FnOnce()) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Format::Human => human(),
    }
    Ok(())
}
