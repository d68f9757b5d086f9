use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

use render_farm::config::{
    Decomposition, FarmConfig, SchedulerConfig, DEFAULT_HEARTBEAT_TIMEOUT_MS,
    DEFAULT_LEASE_DURATION_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_JOBS, DEFAULT_MAX_TASKS_PER_JOB,
    DEFAULT_SWEEP_INTERVAL_MS,
};
use render_farm::coordinator::Coordinator;
use render_farm::gateway::{
    CountResponse, JobResponse, NodesResponse, PendingResponse, PropResponse, PropsResponse,
    SubmitResponse,
};
use render_farm::scheduler::{JobSpec, Task};
use render_farm::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "render-farm")]
#[command(version)]
#[command(about = "Render farm coordinator: nodes, frame tasks and prop metadata")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordinator
    Server(ServerArgs),

    /// Render node commands
    Node {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Task queue commands
    Task {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Prop registry commands
    Prop {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: PropCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP gateway to
    #[arg(long, env = "FARM_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Port for the HTTP gateway
    #[arg(long, env = "FARM_PORT", default_value = "8080")]
    port: u16,

    /// Milliseconds without a heartbeat before a node is marked offline
    #[arg(long, env = "FARM_HEARTBEAT_TIMEOUT_MS", default_value_t = DEFAULT_HEARTBEAT_TIMEOUT_MS)]
    heartbeat_timeout_ms: u64,

    /// Milliseconds a node may hold a task without reporting
    #[arg(long, env = "FARM_LEASE_DURATION_MS", default_value_t = DEFAULT_LEASE_DURATION_MS)]
    lease_duration_ms: u64,

    /// Failed attempts tolerated before a task fails permanently
    #[arg(long, env = "FARM_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Interval of the background node/lease sweep
    #[arg(long, env = "FARM_SWEEP_INTERVAL_MS", default_value_t = DEFAULT_SWEEP_INTERVAL_MS)]
    sweep_interval_ms: u64,

    /// Maximum number of jobs held at once
    #[arg(long, env = "FARM_MAX_JOBS", default_value_t = DEFAULT_MAX_JOBS)]
    max_jobs: usize,

    /// Maximum number of tasks a single job may decompose into
    #[arg(long, env = "FARM_MAX_TASKS_PER_JOB", default_value_t = DEFAULT_MAX_TASKS_PER_JOB)]
    max_tasks_per_job: u64,

    /// Frames per task when a job does not say (1 = one task per frame)
    #[arg(long, env = "FARM_FRAMES_PER_TASK", default_value = "1")]
    frames_per_task: u32,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordinator address
    #[arg(long, short = 'a', env = "FARM_ADDR", default_value = "http://127.0.0.1:8080")]
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
enum NodeCommands {
    /// List known nodes and their status
    List,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a frame-range job
    Submit {
        /// Job name, e.g. "myshot_001"
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "1")]
        start: i64,

        #[arg(long)]
        end: Option<i64>,

        /// Engine kind passed through to nodes
        #[arg(long = "type", default_value = "render")]
        kind: String,

        /// Required node capabilities (comma-separated)
        #[arg(long, value_delimiter = ',')]
        requires: Vec<String>,

        /// Group frames into tasks of this size
        #[arg(long)]
        frames_per_task: Option<u32>,
    },
    /// Show status and task counts of a job
    Status { job_id: String },
    /// Cancel a job
    Cancel { job_id: String },
}

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// List pending tasks in queue order
    Pending {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum PropCommands {
    /// List registered props
    List,
    /// Show one prop
    Get { name: String },
}

// =============================================================================
// Client Helpers
// =============================================================================

struct FarmClient {
    http: reqwest::Client,
    base: String,
}

impl FarmClient {
    fn new(addr: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: addr.trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Box<dyn std::error::Error>> {
        let response = self.http.get(format!("{}{}", self.base, path)).send().await?;
        Self::decode(response).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let detail = serde_json::from_str::<render_farm::gateway::ErrorBody>(&body)
                .map(|e| format!("{} ({})", e.error, e.code))
                .unwrap_or(body);
            return Err(format!("{}: {}", status, detail).into());
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}

async fn handle_node_list(
    client: &FarmClient,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response: NodesResponse = client.get("/farm/nodes").await?;
    match output {
        OutputFormat::Json => print_json(&response.nodes)?,
        OutputFormat::Table => {
            if response.nodes.is_empty() {
                println!("No nodes registered.");
                return Ok(());
            }
            println!(
                "{:<20} {:<22} {:<8} {:<6} CAPABILITIES",
                "NODE", "ADDRESS", "STATUS", "LOAD"
            );
            println!("{}", "-".repeat(78));
            for node in response.nodes {
                let caps: Vec<&str> = node.capabilities.iter().map(String::as_str).collect();
                println!(
                    "{:<20} {:<22} {:<8} {:<6.2} {}",
                    truncate(&node.id, 20),
                    truncate(&node.address, 22),
                    node.status.to_string(),
                    node.load,
                    caps.join(",")
                );
            }
        }
    }
    Ok(())
}

async fn handle_job_command(
    client: &FarmClient,
    command: JobCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            name,
            start,
            end,
            kind,
            requires,
            frames_per_task,
        } => {
            let mut spec = JobSpec::new(name, start, end.unwrap_or(start)).with_requires(requires);
            spec.kind = kind;
            spec.frames_per_task = frames_per_task;

            let response: SubmitResponse = client.post("/farm/submit", &spec).await?;
            match output {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", response.job_id);
                    println!("Tasks:  {}", response.task_count);
                }
            }
        }
        JobCommands::Status { job_id } => {
            let response: JobResponse = client.get(&format!("/farm/status/{}", job_id)).await?;
            let view = response.job;
            match output {
                OutputFormat::Json => print_json(&view)?,
                OutputFormat::Table => {
                    let (start, end) = view.job.spec.frame_range();
                    println!("Job ID:   {}", view.job.id);
                    println!("Name:     {}", view.job.spec.job_name);
                    println!("Status:   {}", view.status);
                    println!("Frames:   {}-{}", start, end);
                    println!(
                        "Tasks:    {} total, {} pending, {} assigned, {} running, {} done, {} failed, {} cancelled",
                        view.stats.total,
                        view.stats.pending,
                        view.stats.assigned,
                        view.stats.running,
                        view.stats.done,
                        view.stats.failed,
                        view.stats.cancelled
                    );
                }
            }
        }
        JobCommands::Cancel { job_id } => {
            let response: CountResponse = client
                .post(&format!("/farm/jobs/{}/cancel", job_id), &serde_json::json!({}))
                .await?;
            match output {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("Cancelled {} task(s)", response.count),
            }
        }
    }
    Ok(())
}

async fn handle_task_pending(
    client: &FarmClient,
    limit: Option<usize>,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = match limit {
        Some(limit) => format!("/farm/list_pending?limit={}", limit),
        None => "/farm/list_pending".to_string(),
    };
    let response: PendingResponse = client.get(&path).await?;
    let tasks: Vec<Task> = response
        .tasks
        .iter()
        .map(|record| serde_json::from_str(record))
        .collect::<Result<_, _>>()?;

    match output {
        OutputFormat::Json => print_json(&tasks)?,
        OutputFormat::Table => {
            if tasks.is_empty() {
                println!("No pending tasks.");
                return Ok(());
            }
            println!(
                "{:<38} {:<38} {:<12} ATTEMPTS",
                "TASK ID", "JOB ID", "FRAMES"
            );
            println!("{}", "-".repeat(100));
            for task in &tasks {
                let frames = if task.payload.frame == task.payload.last_frame {
                    task.payload.frame.to_string()
                } else {
                    format!("{}-{}", task.payload.frame, task.payload.last_frame)
                };
                println!(
                    "{:<38} {:<38} {:<12} {}/{}",
                    task.task_id, task.job_id, frames, task.attempt_count, task.max_attempts
                );
            }
            println!();
            println!("{} pending task(s)", response.pending_count);
        }
    }
    Ok(())
}

async fn handle_prop_command(
    client: &FarmClient,
    command: PropCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        PropCommands::List => {
            let response: PropsResponse = client.get("/props/list").await?;
            match output {
                OutputFormat::Json => print_json(&response.props)?,
                OutputFormat::Table => {
                    if response.props.is_empty() {
                        println!("No props registered.");
                        return Ok(());
                    }
                    println!("{:<24} {:<4} {:<28} BBOX", "NAME", "REV", "MODEL");
                    println!("{}", "-".repeat(78));
                    for prop in response.props {
                        let [x, y, z] = prop.record.bbox;
                        println!(
                            "{:<24} {:<4} {:<28} {:.3} x {:.3} x {:.3}",
                            truncate(&prop.record.name, 24),
                            prop.revision,
                            truncate(&prop.record.model_path, 28),
                            x,
                            y,
                            z
                        );
                    }
                }
            }
        }
        PropCommands::Get { name } => {
            let response: PropResponse = client.get(&format!("/props/get/{}", name)).await?;
            let prop = response.prop;
            match output {
                OutputFormat::Json => print_json(&prop)?,
                OutputFormat::Table => {
                    let grip = &prop.record.hand_grip;
                    println!("Name:      {}", prop.record.name);
                    println!("Revision:  {}", prop.revision);
                    println!("Model:     {}", prop.record.model_path);
                    if let Some(preview) = &prop.record.preview {
                        println!("Preview:   {}", preview);
                    }
                    println!("BBox:      {:?}", prop.record.bbox);
                    println!("Scale:     {}", prop.record.scale);
                    println!("Grip:      offset {:?} rotation {:?}", grip.offset, grip.rotation);
                    if let Some(bone) = &grip.bone {
                        println!("Grip bone: {}", bone);
                    }
                }
            }
        }
    }
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

    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let config = FarmConfig {
        listen_addr,
        sweep_interval_ms: args.sweep_interval_ms,
        scheduler: SchedulerConfig {
            heartbeat_timeout_ms: args.heartbeat_timeout_ms,
            lease_duration_ms: args.lease_duration_ms,
            max_attempts: args.max_attempts,
            max_jobs: args.max_jobs,
            max_tasks_per_job: args.max_tasks_per_job,
            decomposition: Decomposition::from_frames_per_task(args.frames_per_task),
        },
    };

    tracing::info!(
        addr = %config.listen_addr,
        heartbeat_timeout_ms = config.scheduler.heartbeat_timeout_ms,
        lease_duration_ms = config.scheduler.lease_duration_ms,
        max_attempts = config.scheduler.max_attempts,
        "Starting render farm coordinator"
    );

    let shutdown = install_shutdown_handler();
    Coordinator::new(config).run(shutdown).await?;
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
        Commands::Node { client, command } => {
            let farm = FarmClient::new(&client.addr);
            match command {
                NodeCommands::List => handle_node_list(&farm, &client.output).await?,
            }
        }
        Commands::Job { client, command } => {
            let farm = FarmClient::new(&client.addr);
            handle_job_command(&farm, command, &client.output).await?;
        }
        Commands::Task { client, command } => {
            let farm = FarmClient::new(&client.addr);
            match command {
                TaskCommands::Pending { limit } => {
                    handle_task_pending(&farm, limit, &client.output).await?
                }
            }
        }
        Commands::Prop { client, command } => {
            let farm = FarmClient::new(&client.addr);
            handle_prop_command(&farm, command, &client.output).await?;
        }
    }

    Ok(())
}
