//! CLI for cluster operations

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use minisvc::common::encode_query_value;
use minisvc::services::{Manifest, ServiceSource, ServiceUpload};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "minisvc")]
#[command(about = "minisvc service mount CLI")]
#[command(version)]
struct Cli {
    /// Any node of the cluster; writes are relayed to the leader
    #[arg(long, default_value = "http://localhost:8529")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed services
    List,

    /// Describe one mount
    Describe { mount: String },

    /// Install a service at a mount
    Install {
        mount: String,

        /// Manifest (JSON)
        #[arg(long)]
        manifest: PathBuf,

        /// Bundle archive
        #[arg(long)]
        bundle: PathBuf,

        /// Configuration values as a JSON object
        #[arg(long)]
        configuration: Option<String>,

        /// Skip the setup script
        #[arg(long)]
        no_setup: bool,

        /// Install in development mode
        #[arg(long)]
        development: bool,
    },

    /// Upgrade (or with --replace, replace) the service at a mount
    Upgrade {
        mount: String,

        #[arg(long)]
        manifest: PathBuf,

        #[arg(long)]
        bundle: PathBuf,

        /// Run teardown first and drop previous options
        #[arg(long)]
        replace: bool,
    },

    /// Uninstall a mount
    Uninstall {
        mount: String,

        /// Skip the teardown script
        #[arg(long)]
        no_teardown: bool,
    },

    /// Merge configuration values (JSON object); --replace overwrites them
    Configure {
        mount: String,
        values: String,

        #[arg(long)]
        replace: bool,
    },

    /// Start a heal sweep on the leader
    Heal,

    /// Checksums of mounts on the target node
    Checksums { mounts: Vec<String> },

    /// Node role and readiness
    Status,
}

fn mount_query(mount: &str) -> String {
    format!("mount={}", encode_query_value(mount))
}

fn read_upload(manifest: &PathBuf, bundle: &PathBuf) -> anyhow::Result<ServiceUpload> {
    let manifest: Manifest = serde_json::from_slice(
        &std::fs::read(manifest).with_context(|| format!("reading {}", manifest.display()))?,
    )
    .context("manifest is not valid JSON")?;
    let bundle = std::fs::read(bundle).with_context(|| format!("reading {}", bundle.display()))?;
    Ok(ServiceUpload::new(ServiceSource::new(manifest, bundle)))
}

fn parse_values(raw: &str) -> anyhow::Result<BTreeMap<String, Value>> {
    Ok(minisvc::services::options::parse_option_map(&Value::String(
        raw.to_string(),
    ))?)
}

/// Print a JSON answer, or fail with the node's error message
async fn report(response: reqwest::Response) -> anyhow::Result<()> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        bail!("{}: {}", status, text);
    }
    if text.is_empty() {
        println!("{}", status);
    } else {
        match serde_json::from_str::<Value>(&text) {
            Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
            Err(_) => println!("{}", text),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.node.trim_end_matches('/');

    let response = match cli.command {
        Commands::List => client.get(format!("{}/services", base)).send().await?,

        Commands::Describe { mount } => {
            client
                .get(format!("{}/services/service?{}", base, mount_query(&mount)))
                .send()
                .await?
        }

        Commands::Install {
            mount,
            manifest,
            bundle,
            configuration,
            no_setup,
            development,
        } => {
            let mut upload = read_upload(&manifest, &bundle)?;
            if let Some(raw) = configuration {
                upload = upload.with_configuration(parse_values(&raw)?);
            }
            client
                .post(format!(
                    "{}/services?{}&setup={}&development={}",
                    base,
                    mount_query(&mount),
                    !no_setup,
                    development
                ))
                .json(&upload.to_body())
                .send()
                .await?
        }

        Commands::Upgrade {
            mount,
            manifest,
            bundle,
            replace,
        } => {
            let upload = read_upload(&manifest, &bundle)?;
            let url = format!("{}/services/service?{}", base, mount_query(&mount));
            let request = if replace {
                client.put(url)
            } else {
                client.patch(url)
            };
            request.json(&upload.to_body()).send().await?
        }

        Commands::Uninstall { mount, no_teardown } => {
            client
                .delete(format!(
                    "{}/services/service?{}&teardown={}",
                    base,
                    mount_query(&mount),
                    !no_teardown
                ))
                .send()
                .await?
        }

        Commands::Configure {
            mount,
            values,
            replace,
        } => {
            let values = parse_values(&values)?;
            let url = format!("{}/services/configuration?{}", base, mount_query(&mount));
            let request = if replace {
                client.put(url)
            } else {
                client.patch(url)
            };
            request.json(&values).send().await?
        }

        Commands::Heal => client.post(format!("{}/_local/heal", base)).send().await?,

        Commands::Checksums { mounts } => {
            let query: Vec<String> = mounts.iter().map(|m| mount_query(m)).collect();
            client
                .get(format!("{}/_local/checksums?{}", base, query.join("&")))
                .send()
                .await?
        }

        Commands::Status => client.get(format!("{}/_admin/status", base)).send().await?,
    };

    report(response).await
}
