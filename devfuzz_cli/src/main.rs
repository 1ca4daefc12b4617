use devfuzz_core::config::Config;
use devfuzz_core::snapshot::load_snapshot;
use devfuzz_core::tlv;
use devfuzz_core::types::AttributePath;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a hex-encoded TLV element and print it as a tree.
    Decode { hex: String },
    /// Summarize a state dump, or print one attribute from it.
    Snapshot {
        file: PathBuf,
        /// Attribute as node/endpoint/cluster/attribute, e.g. 1/1/0x0006/0x0000.
        #[clap(short, long, value_parser = parse_attribute_path)]
        attribute: Option<AttributePath>,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn parse_id<T: TryFrom<u64>>(text: &str) -> Result<T, String> {
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => text.parse::<u64>(),
    }
    .map_err(|e| format!("invalid id '{text}': {e}"))?;
    T::try_from(value).map_err(|_| format!("id '{text}' is out of range"))
}

fn parse_attribute_path(text: &str) -> Result<AttributePath, String> {
    let parts: Vec<&str> = text.split('/').collect();
    let [node, endpoint, cluster, attribute] = parts.as_slice() else {
        return Err(format!(
            "expected node/endpoint/cluster/attribute, got '{text}'"
        ));
    };
    Ok(AttributePath::new(
        parse_id(node)?,
        parse_id(endpoint)?,
        parse_id(cluster)?,
        parse_id(attribute)?,
    ))
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(config_file: Option<PathBuf>) -> Result<Config, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!(path = ?config_path, "loading configuration");
            Config::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("devfuzz.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "loading default configuration");
                Config::load_from_file(&default_config_path)
            } else {
                debug!("no configuration file found, using built-in defaults");
                Ok(Config::default())
            }
        }
    }
}

fn print_snapshot(file: PathBuf, attribute: Option<AttributePath>) -> Result<(), anyhow::Error> {
    let snapshot = load_snapshot(&file)?;

    if let Some(path) = attribute {
        let entry = snapshot
            .attribute(path)
            .ok_or_else(|| anyhow::anyhow!("No attribute {path} in {file:?}"))?;
        match entry.element() {
            Some(element) => println!("{path}\n{element}"),
            None => println!("{path} = unreadable"),
        }
        return Ok(());
    }

    println!("Captured: {}", snapshot.timestamp);
    if let Some(fabric) = snapshot.fabric_id {
        println!("Fabric: {fabric:#x}");
    }
    if let Some(vendor) = snapshot.vendor_id {
        println!("Vendor: {vendor:#06x}");
    }
    for (node_id, node) in &snapshot.nodes {
        println!("Node {node_id}");
        for (endpoint_id, endpoint) in &node.endpoints {
            let device_types: Vec<String> = endpoint
                .device_types
                .iter()
                .map(|d| format!("{:#06x}/r{}", d.id, d.revision))
                .collect();
            println!("  Endpoint {endpoint_id} [{}]", device_types.join(", "));
            for (cluster_id, cluster) in &endpoint.clusters {
                println!(
                    "    Cluster {cluster_id:#06x} rev {}: {} attributes",
                    cluster.revision,
                    cluster.attributes.len()
                );
            }
        }
    }
    println!(
        "Attributes: {}, commands in history: {}",
        snapshot.attribute_count(),
        snapshot.history.len()
    );
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Decode { hex } => {
            let bytes = hex::decode(hex.trim())
                .map_err(|e| anyhow::anyhow!("Input is not valid hex: {e}"))?;
            let element = tlv::decode(&bytes)?;
            println!("{element}");
        }
        Command::Snapshot { file, attribute } => print_snapshot(file, attribute)?,
        Command::Config => {
            let config = load_config(cli.config_file)?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
