use clap::Parser;
use tracing_subscriber::EnvFilter;

use benchtree::config::{BenchConfig, Cli};
use benchtree::driver;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("benchtree=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        tracing::error!(error = %e, "benchmark failed");
        std::process::exit(1);
    }
}

#[cfg(not(feature = "mpi"))]
fn run(cli: Cli) -> benchtree::Result<()> {
    let config = BenchConfig::try_from(cli)?;
    let summaries = driver::run_local(&config)?;
    let requests: u64 = summaries.iter().map(|s| s.total_requests).sum();
    tracing::info!(nodes = summaries.len(), requests, "[END]");
    Ok(())
}

#[cfg(feature = "mpi")]
fn run(cli: Cli) -> benchtree::Result<()> {
    use benchtree::mpi_util::MpiCluster;
    use benchtree::sim::SimTree;
    use benchtree::transport::Cluster;

    let cluster = MpiCluster::init()?;
    let config = BenchConfig::try_from(cli)?;
    let tree = SimTree::new(config.sim);
    let summary = driver::run(&config, &cluster, &tree)?;
    tracing::info!(node_id = cluster.node_id(), requests = summary.total_requests, "[END]");
    Ok(())
}
