//! CLI command definitions for resque-cluster.
//!
//! Every command resolves a [`BackendConfig`] (YAML file, or a single server
//! address), builds the store through [`Backend`] and runs one queue
//! operation. `--json` switches output to machine-readable JSON.

use std::collections::BTreeMap;

use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::backend::Backend;
use crate::cluster::Sentinel;
use crate::config::{BackendConfig, SentinelOptions, ShardConfig};
use crate::scheduler::{Enqueued, FailureRecord, Hooks, JobQueue, MatchSpec};

/// Default server address when neither a config file nor a server is given.
const DEFAULT_SERVER: &str = "localhost:6379";

/// Redis-backed job queue operator tool.
#[derive(Parser, Debug)]
#[command(name = "resque-cluster")]
#[command(about = "Inspect and operate Resque-compatible job queues")]
#[command(version)]
#[command(
    long_about = "resque-cluster operates Resque-compatible queues stored in Redis, on a single server, an explicit shard cluster or a sentinel-managed deployment.\n\nExample usage:\n  resque-cluster --server localhost:6379 enqueue emails SendWelcome --args '{\"to\":\"a@b.com\"}'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML backend configuration. Takes precedence over --server.
    #[arg(short, long, env = "RESQUE_CONFIG", global = true)]
    pub config: Option<String>,

    /// Server address (host:port) used without a config file.
    #[arg(short, long, env = "RESQUE_SERVER", default_value = DEFAULT_SERVER, global = true)]
    pub server: String,

    /// Key prefix. Overrides the prefix from the config file.
    #[arg(short, long, env = "RESQUE_PREFIX", global = true)]
    pub prefix: Option<String>,

    /// Output JSON to stdout.
    #[arg(short = 'j', long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Enqueue a job.
    Enqueue(EnqueueArgs),

    /// Print the number of jobs waiting in a queue.
    Size {
        /// Queue name.
        queue: String,
    },

    /// List known queues.
    Queues,

    /// Remove jobs from a queue, all of them or those matching --match.
    Dequeue(DequeueArgs),

    /// Delete a queue and drop it from the registry.
    #[command(name = "remove-queue")]
    RemoveQueue {
        /// Queue name.
        queue: String,
    },

    /// Print the status of a tracked job.
    Status {
        /// Job id.
        id: String,
    },

    /// Print delayed and failed counts plus every queue size.
    Stats,

    /// Print the cluster discovered through a sentinel.
    Topology(TopologyArgs),

    /// Print the oldest failure records.
    #[command(name = "peek-failures")]
    PeekFailures {
        /// Number of records to print.
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
}

/// Arguments for `resque-cluster enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Queue name.
    pub queue: String,

    /// Job class.
    pub class: String,

    /// Job arguments as a JSON object.
    #[arg(short, long)]
    pub args: Option<String>,

    /// Track the job status.
    #[arg(short, long)]
    pub track: bool,
}

/// Arguments for `resque-cluster dequeue`.
#[derive(Parser, Debug)]
pub struct DequeueArgs {
    /// Queue name.
    pub queue: String,

    /// Match spec as JSON: "Class", {"Class": "id"} or {"Class": {"key": value}}.
    /// Repeatable.
    #[arg(short, long = "match")]
    pub matches: Vec<String>,
}

/// Arguments for `resque-cluster topology`.
#[derive(Parser, Debug)]
pub struct TopologyArgs {
    /// Service (master group) name.
    pub service: String,

    /// Sentinel address (host:port).
    #[arg(long, env = "RESQUE_SENTINEL", default_value = "localhost:26379")]
    pub sentinel: String,

    /// Put every working replica on the ring instead of one random replica.
    #[arg(long)]
    pub all_slaves: bool,

    /// Keep the master out of the read path.
    #[arg(long)]
    pub write_only: bool,

    /// Virtual points per shard on the hash ring.
    #[arg(long, default_value_t = crate::config::DEFAULT_REPLICAS)]
    pub replicas: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct StatsOutput {
    delayed: u64,
    failed: u64,
    queues: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct ShardOutput {
    address: String,
    alias: Option<String>,
    master: bool,
    write_only: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = backend_config(&cli)?;
    let json = cli.json;

    if let Commands::Topology(args) = &cli.command {
        return run_topology_command(args, &config.prefix, json).await;
    }

    let backend = Backend::new(config);
    let queue = backend.queue(Hooks::new()).await?;
    info!(endpoint = %queue.store().endpoint(), "Connected");

    match cli.command {
        Commands::Enqueue(args) => run_enqueue_command(&queue, args, json).await,
        Commands::Size { queue: name } => {
            let size = queue.size(&name).await?;
            print_value(json, &serde_json::json!({ "queue": name, "size": size }), || {
                size.to_string()
            })
        }
        Commands::Queues => {
            let queues = queue.queues().await?;
            print_value(json, &queues, || queues.join("\n"))
        }
        Commands::Dequeue(args) => run_dequeue_command(&queue, args, json).await,
        Commands::RemoveQueue { queue: name } => {
            let removed = queue.remove_queue(&name).await?;
            print_value(
                json,
                &serde_json::json!({ "queue": name, "removed": removed }),
                || format!("Removed queue {name} ({removed} jobs)"),
            )
        }
        Commands::Status { id } => {
            let status = queue.status(&id).await?;
            let label = status.map(|s| s.to_string());
            print_value(
                json,
                &serde_json::json!({ "id": id, "status": label }),
                || label.clone().unwrap_or_else(|| "untracked".to_string()),
            )
        }
        Commands::Stats => {
            let stats = collect_stats(&queue).await?;
            print_value(json, &stats, || format_stats(&stats))
        }
        Commands::PeekFailures { limit } => {
            let failures = queue.failures(limit).await?;
            print_value(json, &failures, || format_failures(&failures))
        }
        Commands::Topology(_) => Ok(()),
    }
}

/// Resolves the backend configuration from the global arguments.
fn backend_config(cli: &Cli) -> anyhow::Result<BackendConfig> {
    let mut config = match &cli.config {
        Some(path) => BackendConfig::from_yaml_file(path)?,
        None => BackendConfig::single(ShardConfig::parse(&cli.server)?),
    };
    if let Some(prefix) = &cli.prefix {
        config.prefix = prefix.clone();
    }
    Ok(config)
}

fn print_value<T, F>(json: bool, value: &T, text: F) -> anyhow::Result<()>
where
    T: Serialize + ?Sized,
    F: FnOnce() -> String,
{
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_enqueue_command(queue: &JobQueue, args: EnqueueArgs, json: bool) -> anyhow::Result<()> {
    let job_args = parse_job_args(args.args.as_deref())?;
    let outcome = queue
        .enqueue(&args.queue, &args.class, job_args, args.track)
        .await?;

    match outcome {
        Enqueued::Created(id) => print_value(
            json,
            &serde_json::json!({ "status": "created", "id": id, "queue": args.queue }),
            || format!("✓ Enqueued {} on {} ({})", args.class, args.queue, id),
        ),
        Enqueued::Vetoed => print_value(
            json,
            &serde_json::json!({ "status": "vetoed", "queue": args.queue }),
            || format!("Enqueue of {} was vetoed", args.class),
        ),
    }
}

async fn run_dequeue_command(queue: &JobQueue, args: DequeueArgs, json: bool) -> anyhow::Result<()> {
    let specs = parse_match_specs(&args.matches)?;
    let removed = queue.dequeue(&args.queue, &specs).await?;
    print_value(
        json,
        &serde_json::json!({ "queue": args.queue, "removed": removed }),
        || format!("Removed {removed} jobs from {}", args.queue),
    )
}

async fn run_topology_command(args: &TopologyArgs, prefix: &str, json: bool) -> anyhow::Result<()> {
    let sentinel = Sentinel::connect(&ShardConfig::parse(&args.sentinel)?, prefix)?;
    let options = SentinelOptions::default()
        .with_replicas(args.replicas)
        .with_random_slave(!args.all_slaves)
        .with_write_only(args.write_only);
    let router = sentinel.create_cluster(&args.service, &options).await?;

    let shards: Vec<ShardOutput> = router
        .shards()
        .map(|shard| ShardOutput {
            address: shard.config.address(),
            alias: shard.config.alias.clone(),
            master: shard.config.master,
            write_only: shard.config.write_only,
        })
        .collect();

    print_value(json, &shards, || format_shards(&args.service, &shards))
}

fn parse_job_args(raw: Option<&str>) -> anyhow::Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("--args is not valid JSON: {e}")),
        None => Ok(Value::Null),
    }
}

fn parse_match_specs(raw: &[String]) -> anyhow::Result<Vec<MatchSpec>> {
    let mut specs = Vec::new();
    for item in raw {
        // A bare class name need not be quoted.
        let value = serde_json::from_str(item).unwrap_or_else(|_| Value::String(item.clone()));
        specs.extend(MatchSpec::from_value(&value)?);
    }
    Ok(specs)
}

async fn collect_stats(queue: &JobQueue) -> anyhow::Result<StatsOutput> {
    let mut sizes = BTreeMap::new();
    for name in queue.queues().await? {
        let size = queue.size(&name).await?;
        sizes.insert(name, size);
    }
    Ok(StatsOutput {
        delayed: queue.delayed_jobs_count().await?,
        failed: queue.failed_count().await?,
        queues: sizes,
    })
}

fn format_stats(stats: &StatsOutput) -> String {
    let mut lines = vec![
        format!("Delayed jobs:   {}", stats.delayed),
        format!("Failed jobs:    {}", stats.failed),
        format!("Queues:         {}", stats.queues.len()),
    ];
    for (name, size) in &stats.queues {
        lines.push(format!("  {name}: {size}"));
    }
    lines.join("\n")
}

fn format_failures(failures: &[FailureRecord]) -> String {
    if failures.is_empty() {
        return "No failures.".to_string();
    }
    failures
        .iter()
        .map(|f| {
            format!(
                "[{}] {} on {} by {}: {}: {}",
                f.failed_at, f.payload.class, f.queue, f.worker, f.exception, f.error
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_shards(service: &str, shards: &[ShardOutput]) -> String {
    let mut lines = vec![format!("Service {service}: {} shards", shards.len())];
    for shard in shards {
        let mut role = if shard.master { "master" } else { "replica" }.to_string();
        if shard.write_only {
            role.push_str(", write-only");
        }
        match &shard.alias {
            Some(alias) => lines.push(format!("  {} ({role}, alias {alias})", shard.address)),
            None => lines.push(format!("  {} ({role})", shard.address)),
        }
    }
    lines.join("\n")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PREFIX;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;

    fn memory_queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryStore::new(DEFAULT_PREFIX)))
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "resque-cluster",
            "enqueue",
            "emails",
            "SendWelcome",
            "--args",
            r#"{"to":"a@b.com"}"#,
            "--track",
        ])
        .unwrap();

        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.queue, "emails");
                assert_eq!(args.class, "SendWelcome");
                assert!(args.track);
                assert_eq!(
                    parse_job_args(args.args.as_deref()).unwrap(),
                    json!({"to": "a@b.com"})
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_dequeue_with_repeated_match() {
        let cli = Cli::try_parse_from([
            "resque-cluster",
            "dequeue",
            "emails",
            "--match",
            "SendWelcome",
            "-m",
            r#"{"SendDigest": "abc"}"#,
        ])
        .unwrap();

        let Commands::Dequeue(args) = cli.command else {
            panic!("expected dequeue");
        };
        let specs = parse_match_specs(&args.matches).unwrap();
        assert_eq!(
            specs,
            vec![MatchSpec::class("SendWelcome"), MatchSpec::id("SendDigest", "abc")]
        );
    }

    #[test]
    fn test_invalid_match_spec() {
        assert!(parse_match_specs(&["42".to_string()]).is_err());
    }

    #[test]
    fn test_invalid_job_args() {
        assert!(parse_job_args(Some("{not json")).is_err());
        assert_eq!(parse_job_args(None).unwrap(), Value::Null);
    }

    #[test]
    fn test_backend_config_from_server_and_prefix() {
        let cli = Cli::try_parse_from([
            "resque-cluster",
            "--server",
            "redis.local:6380",
            "--prefix",
            "app:",
            "queues",
        ])
        .unwrap();

        let config = backend_config(&cli).unwrap();
        assert_eq!(config.prefix, "app:");
        assert_eq!(
            config.topology,
            crate::config::Topology::Single(ShardConfig::new("redis.local", 6380))
        );
    }

    #[test]
    fn test_backend_config_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "prefix: \"jobs:\"\ntopology:\n  cluster:\n    shards:\n      - host: 10.0.0.1\n      - host: 10.0.0.2\n        master: true\n    replicas: 64"
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let cli = Cli::try_parse_from(["resque-cluster", "--config", &path, "stats"]).unwrap();
        let config = backend_config(&cli).unwrap();
        assert_eq!(config.prefix, "jobs:");
        match config.topology {
            crate::config::Topology::Cluster { shards, replicas } => {
                assert_eq!(shards.len(), 2);
                assert!(shards[1].master);
                assert_eq!(replicas, 64);
            }
            other => panic!("unexpected topology: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_collect_stats() {
        let queue = memory_queue();
        queue.enqueue("emails", "SendWelcome", json!({}), false).await.unwrap();
        queue.enqueue("emails", "SendWelcome", json!({}), false).await.unwrap();
        queue.enqueue("reports", "BuildReport", Value::Null, false).await.unwrap();

        let stats = collect_stats(&queue).await.unwrap();
        assert_eq!(stats.delayed, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.queues.get("emails"), Some(&2));
        assert_eq!(stats.queues.get("reports"), Some(&1));

        let text = format_stats(&stats);
        assert!(text.contains("Queues:         2"));
        assert!(text.contains("  emails: 2"));
    }

    #[tokio::test]
    async fn test_enqueue_and_dequeue_commands() {
        let queue = memory_queue();
        let args = EnqueueArgs {
            queue: "emails".to_string(),
            class: "SendWelcome".to_string(),
            args: Some(r#"{"to":"a@b.com"}"#.to_string()),
            track: true,
        };
        run_enqueue_command(&queue, args, true).await.unwrap();
        assert_eq!(queue.size("emails").await.unwrap(), 1);

        let args = DequeueArgs {
            queue: "emails".to_string(),
            matches: vec!["SendWelcome".to_string()],
        };
        run_dequeue_command(&queue, args, false).await.unwrap();
        assert_eq!(queue.size("emails").await.unwrap(), 0);
    }

    #[test]
    fn test_format_shards() {
        let shards = vec![
            ShardOutput {
                address: "10.0.0.2:6379".to_string(),
                alias: None,
                master: false,
                write_only: false,
            },
            ShardOutput {
                address: "10.0.0.1:6379".to_string(),
                alias: Some("master".to_string()),
                master: true,
                write_only: true,
            },
        ];

        let text = format_shards("mymaster", &shards);
        assert!(text.starts_with("Service mymaster: 2 shards"));
        assert!(text.contains("10.0.0.2:6379 (replica)"));
        assert!(text.contains("10.0.0.1:6379 (master, write-only, alias master)"));
    }

    #[test]
    fn test_format_failures_empty() {
        assert_eq!(format_failures(&[]), "No failures.");
    }
}
