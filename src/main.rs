use std::path::Path;

use anyhow::{Context, Result};
use kube::Client;
use tracing::info;

mod apply;
mod config;
mod edge;
mod loader;
mod namespace;
mod plan;
mod secrets;
mod workload;

const CONFIG_ROOT: &str = "config";
const DEFAULT_CLUSTER_DOMAIN: &str = "svc.cluster.local";

fn get_search_domain_from_resolv_conf() -> Result<Option<String>> {
    let contents = std::fs::read_to_string("/etc/resolv.conf")?;
    let cfg = resolv_conf::Config::parse(&contents)?;

    if let Some(domains) = cfg.get_search() {
        for domain in domains {
            if domain.starts_with("svc.") {
                return Ok(Some(domain.clone()));
            }
        }
    }

    Ok(None)
}

/// Domain suffix for in-cluster service names. Overridable for clusters
/// whose resolv.conf is not visible from where this runs.
fn cluster_domain() -> Result<String> {
    match std::env::var("FLOTILLA_SERVICE_DOMAIN") {
        Ok(domain) => Ok(domain),
        Err(_) => match get_search_domain_from_resolv_conf() {
            Ok(Some(domain)) => Ok(domain),
            Ok(None) => Ok(DEFAULT_CLUSTER_DOMAIN.to_string()),
            Err(e) => Err(e),
        },
    }
}

fn usage() -> ! {
    eprintln!("usage: flotilla <environment> [--render]");
    eprintln!("       flotilla schema");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        usage();
    };

    if command == "schema" {
        let schema = schemars::schema_for!(config::WorkloadConfig);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let environment = command;
    let render_only = args.iter().skip(1).any(|arg| arg == "--render");

    let cluster_domain = cluster_domain()?;
    let plan = plan::plan_environment(Path::new(CONFIG_ROOT), environment, &cluster_domain)
        .with_context(|| format!("failed to plan environment {environment}"))?;

    if render_only {
        print!("{}", plan::render_yaml(&plan)?);
        return Ok(());
    }

    let client = Client::try_default().await?;
    apply::apply_environment(client, &plan)
        .await
        .with_context(|| format!("failed to apply environment {environment}"))?;

    info!("done");
    Ok(())
}
