//! The `load_demo` application: an in-process cluster loading a cache of synthetic records from a shared store.

use anyhow::anyhow;
use anyhow::Result;
use clap::error::ErrorKind;
use clap::CommandFactory;
use clap::Parser;
use comfy_table::CellAlignment;
use fieldx::fxstruct;
use garde::Validate;
use serde_json::json;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregator::LoadOutcome;
use crate::cluster::InProcessCluster;
use crate::config::CacheConfig;
use crate::config::LoaderConfig;
use crate::partition::KeyAffinity;
use crate::store::MemoryStore;
use crate::task::LoadCacheRequest;

pub const DEMO_CACHE: &str = "numbers";

#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "load_demo")]
pub struct Cli {
    /// Number of cluster nodes.
    #[clap(long, short, env = "GRIDLOAD_NODES", default_value_t = 3)]
    #[garde(range(min = 1))]
    nodes: usize,

    /// Number of records in the backing store.
    #[clap(long, short, env = "GRIDLOAD_ENTRIES", default_value_t = 100_000)]
    #[garde(skip)]
    entries: u64,

    /// Backup copies kept of every partition.
    #[clap(long, short, env = "GRIDLOAD_BACKUPS", default_value_t = 1)]
    #[garde(custom(Self::less_than("nodes", &self.nodes)))]
    backups: usize,

    #[clap(long, env = "GRIDLOAD_PARTITIONS", default_value_t = 1024)]
    #[garde(range(min = 1))]
    partitions: u32,

    /// Seconds to wait for the load to complete.
    #[clap(long, short, env = "GRIDLOAD_TIMEOUT", default_value_t = 60)]
    #[garde(range(min = 1))]
    timeout: u64,

    /// Records buffered between a store scan and its loader.
    #[clap(long, env = "GRIDLOAD_BATCH_SIZE", default_value_t = 512)]
    #[garde(range(min = 1))]
    batch_size: usize,

    /// Don't print the per-node breakdown.
    #[clap(long, short, env = "GRIDLOAD_QUIET", default_value_t = false)]
    #[garde(skip)]
    quiet: bool,
}

impl Cli {
    fn less_than<'a, T: PartialOrd + Display>(
        max_name: &'static str,
        max: &'a T,
    ) -> impl FnOnce(&'a T, &()) -> garde::Result {
        move |value, _| {
            if value < max {
                Ok(())
            }
            else {
                Err(garde::Error::new(format!("{value} must be less than {max_name} ({max})")))
            }
        }
    }
}

pub struct LoadDemo {
    cli: Cli,
}

impl LoadDemo {
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Parses the command line and runs the demo. Fails if the load didn't succeed on every node.
    pub async fn run() -> Result<()> {
        let cli = Cli::parse();
        if let Err(err) = cli.validate() {
            let mut cmd = Cli::command();
            cmd.error(ErrorKind::InvalidValue, err).exit();
        }

        #[cfg(feature = "tracing")]
        Self::setup_tracing()?;

        let outcome = Self::new(cli).execute().await?;
        if outcome.is_success() {
            Ok(())
        }
        else {
            Err(anyhow!(
                "load finished with {}, failed nodes: {:?}",
                outcome.status,
                outcome.failed_nodes()
            ))
        }
    }

    #[cfg(feature = "tracing")]
    fn setup_tracing() -> Result<()> {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let filter = tracing_subscriber::EnvFilter::from_default_env();
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;

        info!("Tracing initialized");
        Ok(())
    }

    pub async fn execute(&self) -> Result<LoadOutcome> {
        let cli = &self.cli;

        let store = Arc::new(MemoryStore::from_records(
            (0..cli.entries()).map(|i| (format!("key-{i}"), json!(i))),
        ));
        let cluster = InProcessCluster::new(LoaderConfig::builder().batch_size(cli.batch_size()).build()?);
        for i in 1..=cli.nodes() {
            cluster.add_node(format!("node-{i}"), store.clone());
        }
        cluster.define_cache(
            CacheConfig::builder()
                .name(DEMO_CACHE)
                .affinity(KeyAffinity::Hash {
                    partitions: cli.partitions(),
                })
                .backups(cli.backups())
                .build()?,
        )?;

        info!(
            "Loading {} records into '{DEMO_CACHE}' on {} node(s) with {} backup(s)",
            cli.entries(),
            cli.nodes(),
            cli.backups()
        );

        let cancel = CancellationToken::new();
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            }
        });

        let outcome = cluster
            .coordinator()?
            .load_cache_with_cancel(
                LoadCacheRequest::new(DEMO_CACHE, Duration::from_secs(cli.timeout())),
                cancel,
            )
            .await;
        interrupt.abort();
        let outcome = outcome?;

        if !cli.quiet() {
            println!("{}", Self::report(&cluster, &outcome));
        }
        println!(
            ">>> Loaded {} keys with backups in {} ms.",
            outcome.loaded_count,
            outcome.elapsed.as_millis()
        );

        Ok(outcome)
    }

    fn report(cluster: &InProcessCluster, outcome: &LoadOutcome) -> String {
        let mut table = comfy_table::Table::new();
        table
            .load_preset(comfy_table::presets::ASCII_FULL_CONDENSED)
            .set_header(["Node", "Status", "Loaded", "Held", "Degraded", "Time (ms)", "Error"]);

        for (node, result) in &outcome.per_node {
            let held = cluster.node(node).map_or(0, |n| n.local_len(&outcome.cache));
            table.add_row([
                node.to_string(),
                result.status.to_string(),
                result.loaded.to_string(),
                held.to_string(),
                result.degraded_replication.to_string(),
                result.elapsed.as_millis().to_string(),
                result.error.clone().unwrap_or_default(),
            ]);
        }

        for col in 2..=5 {
            if let Some(column) = table.column_mut(col) {
                column.set_cell_alignment(CellAlignment::Right);
            }
        }

        format!(
            "Load {} of '{}' (topology v{}): {}\n{table}",
            outcome.load_id, outcome.cache, outcome.topology_version, outcome.status
        )
    }
}
