use anyhow::Result;
use clap::Parser;

use argus::sensor::{run, SensorArgs};

#[derive(Parser)]
#[command(name = "argusd", version, about = "Container-aware kernel telemetry sensor")]
struct Opts {
    /// Monitor only these cgroups in the perf_event hierarchy. Repeatable;
    /// overrides ARGUS_SENSOR_CGROUP_NAME.
    #[arg(long = "cgroup")]
    cgroups: Vec<String>,

    /// Data pages per kernel ring buffer (power of two).
    #[arg(long)]
    ring_pages: Option<usize>,

    /// Disable container metadata enrichment via the docker socket.
    #[arg(long)]
    no_docker: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    argus::init_logger(opts.verbose);
    run(SensorArgs {
        cgroups: opts.cgroups,
        ring_pages: opts.ring_pages,
        no_docker: opts.no_docker,
    })
    .await
}
