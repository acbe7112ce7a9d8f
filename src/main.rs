use clap::{Parser, ValueEnum};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use jobconductor::config::{
    BoardConfig, BoardKind, ConductorConfig, NodeConfig, SandboxConfig, WaitTimeout,
    DEFAULT_BOARD_PATH, DEFAULT_QUEUE_KEY,
};
use jobconductor::dashboard::{
    ConductorStatusResponse, JobResponse, PostJobRequest, PostJobResponse, SaveFlowRequest,
    SaveFlowResponse,
};
use jobconductor::node::Node;
use jobconductor::persistence::FlowStep;
use jobconductor::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "jobconductor")]
#[command(version)]
#[command(about = "Claims jobs from a coordination-backed job board and runs them")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a board, a conductor and the dashboard in one process
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Flow management commands
    Flow {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: FlowCommands,
    },

    /// Conductor commands
    Conductor {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ConductorCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Board name
    #[arg(long, default_value = "board")]
    board_name: String,

    /// Root path of the board in the coordination namespace
    #[arg(long, default_value = DEFAULT_BOARD_PATH)]
    board_path: String,

    /// Board layout
    #[arg(long, value_enum, default_value = "per-queue")]
    board_kind: BoardKind,

    /// Detail key naming a job's queue
    #[arg(long, default_value = DEFAULT_QUEUE_KEY)]
    queue_key: String,

    /// Owner name recorded on claims
    #[arg(long, default_value = "conductor")]
    name: String,

    /// Maximum concurrently running executions
    #[arg(long, default_value = "100")]
    workers: usize,

    /// Pause between passes ("0.5", "2s", "250ms")
    #[arg(long, default_value = "0.5")]
    wait_timeout: String,

    /// Port for the dashboard API
    #[arg(long, default_value = "8080")]
    dashboard_port: u16,

    /// Run flow steps inside Docker containers
    #[arg(long)]
    sandbox: bool,

    /// Docker image used for sandboxed steps
    #[arg(long, default_value = "alpine:latest")]
    image: String,
}

// =============================================================================
// Client Arguments (shared by job, flow and conductor commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Dashboard address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Post a new job to the board
    Post {
        /// Job name
        name: String,

        /// Queue the job belongs to
        #[arg(long, short)]
        queue: Option<String>,

        /// Stored flow the job runs
        #[arg(long)]
        flow: Option<Uuid>,

        /// Store entries as key=value; values that parse as JSON are kept typed
        #[arg(long = "store", value_parser = parse_key_value)]
        store: Vec<(String, String)>,
    },
    /// List jobs on the board
    List {
        /// Only the dispatchable head of each queue
        #[arg(long)]
        unclaimed: bool,

        /// Re-list the namespace instead of trusting the cache
        #[arg(long)]
        fresh: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum FlowCommands {
    /// Save a flow made of ordered shell steps
    Save {
        /// Flow name
        name: String,

        /// Step as name=command; repeat for each step in order
        #[arg(long = "step", value_parser = parse_key_value, required = true)]
        steps: Vec<(String, String)>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConductorCommands {
    /// Show the conductor's dispatch status
    Status,
    /// Stop claiming new jobs
    Stop,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

fn store_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn endpoint(client: &ClientArgs, path: &str) -> String {
    format!("{}{}", client.addr.trim_end_matches('/'), path)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dashboard_addr = SocketAddr::from(([0, 0, 0, 0], args.dashboard_port));
    let config = NodeConfig {
        board: BoardConfig::new(&args.board_name, &args.board_path)
            .with_queue_key(&args.queue_key)
            .with_kind(args.board_kind),
        conductor: ConductorConfig::new(&args.name)
            .with_wait_timeout(WaitTimeout::Literal(args.wait_timeout))
            .with_max_workers(args.workers),
        sandbox: SandboxConfig {
            enabled: args.sandbox,
            image: args.image,
            ..SandboxConfig::default()
        },
        dashboard_addr: Some(dashboard_addr),
    };

    tracing::info!(
        board = %config.board.name,
        root = %config.board.path,
        kind = ?config.board.kind,
        conductor = %config.conductor.name,
        workers = config.conductor.max_workers,
        dashboard_addr = %dashboard_addr,
        sandbox = config.sandbox.enabled,
        "Starting jobconductor node"
    );

    let node = Node::new(config)?;
    node.run(install_shutdown_handler()).await
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_post(
    client: &ClientArgs,
    name: String,
    queue: Option<String>,
    flow: Option<Uuid>,
    store: Vec<(String, String)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = if store.is_empty() {
        None
    } else {
        Some(
            store
                .iter()
                .map(|(key, value)| (key.clone(), store_value(value)))
                .collect::<Map<String, Value>>(),
        )
    };
    let request = PostJobRequest {
        name,
        queue,
        flow_uuid: flow,
        store,
        details: Map::new(),
    };

    let response: PostJobResponse = reqwest::Client::new()
        .post(endpoint(client, "/api/jobs"))
        .json(&request)
        .send()
        .await?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            if !response.success {
                eprintln!(
                    "Error: Job posting failed: {}",
                    response.error.unwrap_or_default()
                );
                std::process::exit(1);
            }
            println!("Job posted successfully!");
            if let Some(path) = response.path {
                println!("Path: {}", path);
            }
            if let Some(uuid) = response.uuid {
                println!("UUID: {}", uuid);
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &ClientArgs,
    unclaimed: bool,
    fresh: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs: Vec<JobResponse> = reqwest::Client::new()
        .get(endpoint(
            client,
            &format!("/api/jobs?only_unclaimed={}&ensure_fresh={}", unclaimed, fresh),
        ))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<12} {:<12} {:<10} {:<14} NAME",
                "SEQUENCE", "QUEUE", "STATE", "OWNER"
            );
            println!("{}", "-".repeat(70));
            for job in &jobs {
                let queue = if job.queue.is_empty() { "-" } else { &job.queue };
                println!(
                    "{:<12} {:<12} {:<10} {:<14} {}",
                    job.sequence,
                    queue,
                    job.state,
                    job.owner.as_deref().unwrap_or("-"),
                    job.name
                );
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

async fn handle_flow_save(
    client: &ClientArgs,
    name: String,
    steps: Vec<(String, String)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = SaveFlowRequest {
        name,
        steps: steps
            .into_iter()
            .map(|(name, command)| FlowStep { name, command })
            .collect(),
    };

    let response: SaveFlowResponse = reqwest::Client::new()
        .post(endpoint(client, "/api/flows"))
        .json(&request)
        .send()
        .await?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => match response.flow_uuid {
            Some(uuid) if response.success => {
                println!("Flow saved successfully!");
                println!("Flow UUID: {}", uuid);
            }
            _ => {
                eprintln!(
                    "Error: Flow save failed: {}",
                    response.error.unwrap_or_default()
                );
                std::process::exit(1);
            }
        },
    }
    Ok(())
}

async fn handle_conductor_status(client: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let status: ConductorStatusResponse = reqwest::Client::new()
        .get(endpoint(client, "/api/conductor"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            println!("Conductor Status");
            println!("{}", "=".repeat(40));
            println!("Name:         {}", status.name);
            println!("Board:        {}", status.board);
            println!(
                "Dispatching:  {}",
                if status.dispatching { "yes" } else { "no" }
            );
            println!("In flight:    {}/{}", status.in_flight, status.max_workers);
            println!("Wait timeout: {}ms", status.wait_timeout_ms);
            println!("Known jobs:   {}", status.known_jobs);
        }
    }
    Ok(())
}

async fn handle_conductor_stop(client: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    reqwest::Client::new()
        .post(endpoint(client, "/api/conductor/stop"))
        .send()
        .await?
        .error_for_status()?;
    println!("Conductor stopping; in-flight jobs will still be resolved.");
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => match command {
            JobCommands::Post {
                name,
                queue,
                flow,
                store,
            } => handle_job_post(&client, name, queue, flow, store).await?,
            JobCommands::List { unclaimed, fresh } => {
                handle_job_list(&client, unclaimed, fresh).await?
            }
        },
        Commands::Flow { client, command } => match command {
            FlowCommands::Save { name, steps } => handle_flow_save(&client, name, steps).await?,
        },
        Commands::Conductor { client, command } => match command {
            ConductorCommands::Status => handle_conductor_status(&client).await?,
            ConductorCommands::Stop => handle_conductor_stop(&client).await?,
        },
    }

    Ok(())
}
