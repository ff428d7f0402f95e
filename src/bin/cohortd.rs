//! `cohortd`: survey aggregation client daemon.
//!
//! Runs the signup/aggregation cycle against a coordinator and offers a few
//! helper commands for managing the local data the cycle reads.

use cohort_relay::net::{run_status_server, HttpNetwork, StatusConfig};
use cohort_relay::{
    AggregationKeyPair, CommissionerPolicy, DaemonConfig, Daemon, FileStore, Storage,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn print_help() {
    println!("Usage: cohortd [--config <file>] [--coordinator <url>] [--data-dir <dir>] <command>");
    println!("  run [--once] [--status-listen <addr>] [--allowlist <file>]");
    println!("  data add <key> <value>");
    println!("  data list <key>");
    println!("  signups");
    println!("  keygen");
}

#[derive(Debug, Default)]
struct CommonOptions {
    config: Option<PathBuf>,
    coordinator: Option<String>,
    data_dir: Option<PathBuf>,
}

fn split_common(args: Vec<String>) -> (CommonOptions, Vec<String>) {
    let mut opts = CommonOptions::default();
    let mut rest = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                opts.config = Some(PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--config expects a value")),
                ));
            }
            "--coordinator" => {
                opts.coordinator = Some(
                    iter.next()
                        .unwrap_or_else(|| fatal("--coordinator expects a value")),
                );
            }
            "--data-dir" => {
                opts.data_dir = Some(PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--data-dir expects a value")),
                ));
            }
            _ => rest.push(arg),
        }
    }
    (opts, rest)
}

fn load_config(opts: &CommonOptions) -> DaemonConfig {
    let mut cfg = DaemonConfig::load(opts.config.as_deref())
        .unwrap_or_else(|err| fatal(&format!("failed to load config: {err}")));
    if let Some(url) = &opts.coordinator {
        cfg.coordinator_url = url.clone();
    }
    if let Some(dir) = &opts.data_dir {
        cfg.data_dir = dir.clone();
    }
    cfg.validate()
        .unwrap_or_else(|err| fatal(&format!("invalid config: {err}")));
    cfg
}

fn open_store(cfg: &DaemonConfig) -> FileStore {
    FileStore::open(cfg.store_path()).unwrap_or_else(|err| {
        fatal(&format!(
            "failed to open store {}: {err}",
            cfg.store_path().display()
        ))
    })
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_logging();
    let (opts, args) = split_common(env::args().skip(1).collect());
    let mut args = args.into_iter();
    match args.next().as_deref() {
        Some("run") => cmd_run(&opts, args.collect()),
        Some("data") => cmd_data(&opts, args.collect()),
        Some("signups") => cmd_signups(&opts),
        Some("keygen") => cmd_keygen(&opts),
        Some("-h") | Some("--help") | None => print_help(),
        Some(other) => {
            print_help();
            fatal(&format!("unknown command: {other}"));
        }
    }
}

fn cmd_run(opts: &CommonOptions, args: Vec<String>) {
    let mut cfg = load_config(opts);
    let mut once = false;
    let mut allowlist: Option<PathBuf> = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--once" => once = true,
            "--status-listen" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--status-listen expects a value"));
                cfg.status_listen = Some(
                    value
                        .parse()
                        .unwrap_or_else(|_| fatal("invalid --status-listen address")),
                );
            }
            "--allowlist" => {
                allowlist = Some(PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--allowlist expects a value")),
                ));
            }
            other => fatal(&format!("unknown run flag: {other}")),
        }
    }

    let policy = match allowlist {
        Some(path) => CommissionerPolicy::from_allowlist_path(&path)
            .unwrap_or_else(|err| fatal(&format!("failed to load allowlist: {err}"))),
        None => cfg.policy(),
    };
    let encryption = cfg
        .encryption()
        .unwrap_or_else(|err| fatal(&format!("failed to prepare encryption: {err}")));
    let network = HttpNetwork::new(&cfg.coordinator_url, cfg.request_timeout())
        .unwrap_or_else(|err| fatal(&format!("failed to build HTTP client: {err}")));
    let store = open_store(&cfg);

    let mut daemon = Daemon::new(Box::new(store), Arc::new(network), encryption, policy)
        .with_exchange_timeout(cfg.request_timeout());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")));

    runtime.block_on(async {
        if let Some(listen) = cfg.status_listen {
            let status_cfg = StatusConfig::new(listen, cfg.store_path());
            tokio::spawn(async move {
                if let Err(err) = run_status_server(status_cfg).await {
                    tracing::error!(%err, "status service stopped");
                }
            });
        }
        tracing::info!(
            coordinator = %cfg.coordinator_url,
            data_dir = %cfg.data_dir.display(),
            encryption = ?cfg.encryption,
            "cohortd starting"
        );
        if once {
            let report = daemon.run_cycle().await;
            match serde_json::to_string_pretty(&report) {
                Ok(text) => println!("{text}"),
                Err(err) => fatal(&format!("failed to encode report: {err}")),
            }
        } else {
            let cycles = daemon.run_forever(cfg.cycle_interval()).await;
            tracing::info!(cycles, "cohortd stopped");
        }
    });
}

fn cmd_data(opts: &CommonOptions, args: Vec<String>) {
    let cfg = load_config(opts);
    let mut iter = args.into_iter();
    match iter.next().as_deref() {
        Some("add") => {
            let key = iter
                .next()
                .unwrap_or_else(|| fatal("Usage: cohortd data add <key> <value>"));
            let value = iter
                .next()
                .unwrap_or_else(|| fatal("Usage: cohortd data add <key> <value>"));
            let mut store = open_store(&cfg);
            store
                .add_data_point(&key, &value)
                .unwrap_or_else(|err| fatal(&format!("failed to store data point: {err}")));
            println!("stored {key}={value}");
        }
        Some("list") => {
            let key = iter
                .next()
                .unwrap_or_else(|| fatal("Usage: cohortd data list <key>"));
            let store = open_store(&cfg);
            let values = store
                .list_data_points(&key)
                .unwrap_or_else(|err| fatal(&format!("failed to read data points: {err}")));
            for value in values {
                println!("{value}");
            }
        }
        _ => fatal("Usage: cohortd data <add|list> ..."),
    }
}

fn cmd_signups(opts: &CommonOptions) {
    let cfg = load_config(opts);
    let store = open_store(&cfg);
    let records = store
        .list_signup_records()
        .unwrap_or_else(|err| fatal(&format!("failed to read signups: {err}")));
    if records.is_empty() {
        println!("no signups");
        return;
    }
    for record in records {
        let role = if record.is_delegate() {
            "delegate"
        } else {
            "member"
        };
        println!(
            "{}\t{}\t{}\t{}\tgroup={}",
            record.survey_id(),
            record.survey.name,
            record.state,
            role,
            record
                .group_size
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

fn cmd_keygen(opts: &CommonOptions) {
    let cfg = load_config(opts);
    let path = cfg.key_path();
    let pair = AggregationKeyPair::load_or_generate(&path)
        .unwrap_or_else(|err| fatal(&format!("failed to load key {}: {err}", path.display())));
    println!("key file: {}", path.display());
    println!("public key: {}", pair.public_key_material());
}
