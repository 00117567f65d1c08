use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fairlog_api::ApiServer;
use fairlog_api::types::PredictResponse;
use fairlog_core::config::FairlogConfig;
use fairlog_core::digest::decode_hex_array;
use fairlog_core::error::{FairlogError, Result};
use fairlog_detect::{ReceiptBook, ReceiptStatus, receipt_key};
use fairlog_itmac::client::{Client, VerifyOptions};
use fairlog_itmac::codec::input_hash;
use fairlog_ledger::MemoryLedger;
use fairlog_verify::keys::KeyStore;
use fairlog_verify::merkle::MerkleTree;

#[derive(Parser)]
#[command(name = "fairlog")]
#[command(about = "Auditable inference logging with Merkle batches and fraud disputes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the provider keys, or show them if they exist
    Keygen {
        /// Key directory
        #[arg(long, default_value = ".fairlog/keys")]
        dir: PathBuf,
    },

    /// Start the provider server with an in-process ledger
    Serve {
        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address (overrides the config)
        #[arg(long)]
        bind: Option<String>,

        /// JSON threshold model (overrides the config)
        #[arg(long)]
        model: Option<PathBuf>,
    },

    /// Check a saved /predict response offline
    VerifyBundle {
        /// Response JSON file
        response: PathBuf,

        /// Pinned provider public key (hex). Defaults to the key in the response
        #[arg(long)]
        provider_key: Option<String>,

        /// Shared MAC key (hex), to recompute the MAC too
        #[arg(long)]
        mac_key: Option<String>,
    },

    /// List held receipts and their statuses
    Receipts {
        /// Receipt book file
        #[arg(long, default_value = ".fairlog/receipts.json")]
        book: PathBuf,

        /// Add the receipt from a saved /predict response first
        #[arg(long)]
        import: Option<PathBuf>,

        /// Check every receipt signature against this provider key (hex)
        #[arg(long)]
        verify_signatures: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let result = match cli.command {
        Commands::Keygen { dir } => cmd_keygen(dir),
        Commands::Serve {
            config,
            bind,
            model,
        } => cmd_serve(config.as_deref(), bind, model),
        Commands::VerifyBundle {
            response,
            provider_key,
            mac_key,
        } => match cmd_verify_bundle(&response, provider_key.as_deref(), mac_key.as_deref()) {
            Ok(true) => Ok(()),
            Ok(false) => std::process::exit(1),
            Err(e) => Err(e),
        },
        Commands::Receipts {
            book,
            import,
            verify_signatures,
        } => cmd_receipts(book, import.as_deref(), verify_signatures.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn cmd_keygen(dir: PathBuf) -> Result<()> {
    let store = KeyStore::open_at(dir)?;
    let keys = store.provider_keys()?;
    println!("key directory: {}", store.dir().display());
    println!("public key:    {}", keys.public_key_hex());
    Ok(())
}

fn cmd_serve(config: Option<&Path>, bind: Option<String>, model: Option<PathBuf>) -> Result<()> {
    let mut config = match config {
        Some(path) => FairlogConfig::from_file(path)?,
        None => FairlogConfig::default(),
    };
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if model.is_some() {
        config.server.model_path = model;
    }
    config.validate()?;

    // same key store the server opens, so the ledger can check receipt signatures
    let keys = KeyStore::open_at(config.server.data_dir.join("keys"))?.provider_keys()?;
    let ledger = Arc::new(
        MemoryLedger::new(config.batch.ledger_grace_period_ms)
            .with_provider_key(keys.verifying_key().to_bytes())
            .with_merkle(MerkleTree::from_config(&config.merkle)?),
    );
    eprintln!("ledger: in-process (commitments are not persisted)");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(ApiServer::new(config, ledger).run())
}

fn load_response(path: &Path) -> Result<PredictResponse> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| FairlogError::Malformed(format!("{}: {e}", path.display())))
}

/// `Ok(false)` when any check fails.
fn cmd_verify_bundle(path: &Path, provider_key: Option<&str>, mac_key: Option<&str>) -> Result<bool> {
    let resp = load_response(path)?;
    let pinned = match provider_key {
        Some(k) => k,
        None => {
            eprintln!("warning: no --provider-key, trusting the key inside the response");
            resp.itmac.provider_public_key.as_str()
        }
    };
    let mut client = Client::from_public_key_hex(pinned)?;
    if let Some(k) = mac_key {
        client = client.with_mac_key(decode_hex_array(k, "mac key")?);
    }

    let t = &resp.itmac.transcript;
    let r = &resp.receipt;
    let outcome = client.verify_bundle(
        t,
        &resp.itmac.bundle,
        VerifyOptions {
            verify_mac: mac_key.is_some(),
        },
    );

    let checks = [
        ("bundle signature", outcome.valid),
        ("receipt signature", r.verify(client.provider_public_key())),
        ("receipt seq", r.seq_num() == resp.seq_num),
        (
            "receipt matches transcript",
            r.query_id == t.query_id
                && r.model_id() == t.model_id
                && r.record.prediction == t.prediction
                && r.record.timestamp == t.timestamp
                && input_hash(&r.record.features) == t.input_hash,
        ),
    ];

    println!("query:      {}", t.query_id);
    println!("model:      {}", t.model_id);
    println!("seq:        {}", resp.seq_num);
    println!("prediction: {}", t.prediction);
    println!();
    for (name, ok) in &checks {
        println!("  {name:<28} {}", if *ok { "ok" } else { "FAILED" });
    }
    if let Some(reason) = &outcome.reason {
        println!("  reason: {reason}");
    }
    println!();

    let valid = checks.iter().all(|(_, ok)| *ok);
    println!("result: {}", if valid { "VALID" } else { "INVALID" });
    Ok(valid)
}

fn cmd_receipts(book_path: PathBuf, import: Option<&Path>, verify_key: Option<&str>) -> Result<()> {
    let mut book = ReceiptBook::open(book_path)?;

    if let Some(path) = import {
        let resp = load_response(path)?;
        let key = receipt_key(resp.receipt.model_id(), resp.receipt.seq_num());
        if book.insert(resp.receipt) {
            book.save()?;
            println!("imported receipt {key}");
        } else {
            println!("receipt {key} already held");
        }
    }

    let public_key: Option<[u8; 32]> = verify_key
        .map(|k| decode_hex_array(k, "provider public key"))
        .transpose()?;

    if book.is_empty() {
        println!("no receipts held");
        return Ok(());
    }

    let mut bad_signatures = 0;
    for held in book.iter() {
        let r = &held.receipt;
        let fraud = held
            .fraud
            .map(|f| format!(" {f:?}"))
            .unwrap_or_default();
        println!("  {:<12} {:?}{fraud}", held.key(), held.status);
        println!("    query:      {}", r.query_id);
        println!("    timestamp:  {}", r.record.timestamp);
        println!("    prediction: {}", r.record.prediction);
        if let Some(id) = held.ledger_batch_id {
            println!("    batch:      {id}");
        }
        if let Some(tx) = &held.dispute_tx {
            println!("    dispute tx: {tx}");
        }
        if let Some(pk) = &public_key {
            let ok = r.verify(pk);
            if !ok {
                bad_signatures += 1;
            }
            println!("    signature:  {}", if ok { "ok" } else { "INVALID" });
        }
        println!();
    }

    let open = book.iter().filter(|h| h.status.is_open()).count();
    let flagged = book
        .iter()
        .filter(|h| h.status == ReceiptStatus::FraudDetected)
        .count();
    println!("{} receipts, {open} open, {flagged} fraud detected", book.len());

    if bad_signatures > 0 {
        return Err(FairlogError::Malformed(format!(
            "{bad_signatures} receipt signature(s) did not verify"
        )));
    }
    Ok(())
}
