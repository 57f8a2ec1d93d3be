//! rails-runner CLI - query a Rails application through the runner worker
//!
//! Usage:
//!   rails-runner [--dir <path>] model <Name>
//!   rails-runner [--dir <path>] route <controller> <action>
//!   rails-runner [--dir <path>] call <method> [--params <json>]
//!
//! Results are printed as JSON on stdout (`null` when the worker has no
//! answer). Diagnostics go to stderr; set `RUST_LOG=rails_runner=debug` to
//! see the worker's own stderr output.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rails_runner::runner::{create_with_config, JsonObject, RunnerService};
use rails_runner::RunnerConfig;

#[derive(Parser)]
#[command(name = "rails-runner")]
#[command(about = "Query a Rails application through a long-lived runner worker")]
#[command(version)]
struct Cli {
    /// Rails project root (defaults to the current directory)
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    /// Worker command line, overriding RAILS_RUNNER_COMMAND
    #[arg(long, global = true)]
    command: Option<String>,

    #[command(subcommand)]
    query: Query,
}

#[derive(Subcommand)]
enum Query {
    /// Show schema information for a model
    Model {
        /// Model class name, e.g. User
        name: String,
    },

    /// Locate the target class of a model association
    Association {
        /// Model class name
        model: String,
        /// Association name, e.g. posts
        association: String,
    },

    /// Locate the definition of a named route
    RouteLocation {
        /// Route helper name, e.g. users_path
        name: String,
    },

    /// Show the route for a controller action
    Route {
        controller: String,
        action: String,
    },

    /// Ask the worker to reload application code
    Reload,

    /// Send an arbitrary request
    Call {
        method: String,

        /// JSON object passed as params
        #[arg(short, long)]
        params: Option<String>,
    },
}

fn main() -> Result<()> {
    // Diagnostics on stderr only; stdout carries results
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rails_runner=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let work_dir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };

    let mut config = RunnerConfig::from_env();
    if let Some(command) = cli.command {
        config = config.with_command(command.split_whitespace());
    }
    config.validate().context("Invalid runner configuration")?;

    let params = match &cli.query {
        Query::Call { params: Some(raw), .. } => Some(parse_params(raw)?),
        _ => None,
    };

    let mut client = create_with_config(&work_dir, config);

    let result = match cli.query {
        Query::Model { name } => client.model(&name),
        Query::Association { model, association } => {
            client.association_target_location(&model, &association)
        }
        Query::RouteLocation { name } => client.route_location(&name),
        Query::Route { controller, action } => client.route(&controller, &action),
        Query::Reload => {
            client.trigger_reload();
            None
        }
        Query::Call { method, .. } => client.request(&method, params),
    };

    client.shutdown();

    let output = result.map(Value::Object).unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

fn parse_params(raw: &str) -> Result<JsonObject> {
    let value: Value = serde_json::from_str(raw)
        .with_context(|| format!("--params is not valid JSON: {}", raw))?;

    match value {
        Value::Object(map) => Ok(map),
        other => bail!("--params must be a JSON object, got {}", other),
    }
}
