use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use screengraph::{
    ingest, Action, Graph, GraphConfig, Oracles, ReplayConfig, ReplayMatcher, StepOutcome, VlmClient, VlmConfig,
};

#[derive(Parser)]
#[command(name = "screengraph")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build screen-state graphs from recorded phone trajectories and replay actions against them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fold every trajectory folder under INPUT into a graph
    Build {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "results/graph.json")]
        output: PathBuf,
        /// App the trajectories were recorded in
        #[arg(long)]
        app: String,
        /// Merge threshold for node similarity
        #[arg(long, default_value_t = 0.8)]
        threshold: f32,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Copy every merged screenshot under this folder, per node
        #[arg(long)]
        nodes_dir: Option<PathBuf>,
        /// Extend the graph already saved at OUTPUT
        #[arg(long)]
        resume: bool,
        /// Seconds before a single oracle call is abandoned
        #[arg(long, default_value_t = 60)]
        oracle_timeout: u64,
    },
    /// Replay a list of proposed actions against a saved graph
    Replay {
        #[arg(long)]
        graph: PathBuf,
        /// JSON array of actions, or an object with `task` and `actions`
        #[arg(long)]
        actions: PathBuf,
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Folder for the replay trajectory record
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print node and edge counts of a saved graph
    Stats {
        #[arg(long)]
        graph: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Commands::Build { input, output, app, threshold, seed, nodes_dir, resume, oracle_timeout } => {
            let mut config = GraphConfig { threshold, ..GraphConfig::default() };
            if nodes_dir.is_some() {
                config.nodes_dir = nodes_dir;
            }
            let client = VlmClient::new(VlmConfig::default())?;
            let oracles = Oracles::shared(Arc::new(client)).with_timeout(Duration::from_secs(oracle_timeout));
            let mut rng = StdRng::seed_from_u64(seed);

            let mut graph = if resume && output.exists() {
                let mut g = Graph::load(&output, config).with_context(|| format!("loading {}", output.display()))?;
                g.restore_embeddings(&oracles).await?;
                g
            } else {
                Graph::new(app, config)
            };

            let report = ingest::build_from_dir(&mut graph, &oracles, &input, &output, &mut rng).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            println!("{}", serde_json::to_string_pretty(&graph.stats())?);
        }
        Commands::Replay { graph, actions, query, seed, out } => {
            let graph = Graph::load(&graph, GraphConfig::default())
                .with_context(|| format!("loading {}", graph.display()))?;
            let (task, proposed) = read_actions(&actions)?;
            let query = query.or(task).unwrap_or_else(|| "replay".to_string());

            let matcher = ReplayMatcher::new(&graph, ReplayConfig::default());
            let mut state = matcher.start_task(query);
            let mut rng = StdRng::seed_from_u64(seed);
            for action in &proposed {
                match matcher.step(&mut state, action, &mut rng) {
                    Ok(StepOutcome::Completed { answer }) => {
                        info!(answer = ?answer, "replay finished");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "replay stopped");
                        break;
                    }
                }
            }
            println!("{}", serde_json::to_string_pretty(state.records())?);
            if let Some(dir) = out {
                let path = state.save_trajectory(&dir)?;
                info!(path = %path.display(), status = ?state.status(), "trajectory written");
            }
        }
        Commands::Stats { graph } => {
            let graph = Graph::load(&graph, GraphConfig::default())
                .with_context(|| format!("loading {}", graph.display()))?;
            println!("{}", serde_json::to_string_pretty(&graph.stats())?);
        }
    }
    Ok(())
}

fn read_actions(path: &Path) -> Result<(Option<String>, Vec<Action>)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let doc: Value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let (task, list) = match &doc {
        Value::Array(items) => (None, items.clone()),
        Value::Object(obj) => match obj.get("actions").and_then(|a| a.as_array()) {
            Some(items) => (obj.get("task").and_then(|t| t.as_str()).map(str::to_string), items.clone()),
            None => bail!("{} has no `actions` array", path.display()),
        },
        _ => bail!("{} must hold a JSON array or object", path.display()),
    };
    Ok((task, list.iter().map(Action::from_raw).collect()))
}
