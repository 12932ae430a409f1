use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use render_controller::config::ControllerConfig;
use render_controller::node::ControllerNode;
use render_controller::protocol::{send_request, Reply};
use render_controller::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "render-controller")]
#[command(version)]
#[command(about = "Render farm controller: splits jobs into frames and dispatches them to nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Server(ServerArgs),

    /// Render job commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Send any allow-listed command with JSON keyword arguments
    Request {
        #[command(flatten)]
        client: ClientArgs,

        /// Command name, e.g. get_config_vars
        command: String,

        /// Keyword arguments as a JSON object
        #[arg(default_value = "{}")]
        kwargs: String,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Controller config file; created from defaults if missing
    #[arg(long, default_value = "controller.json")]
    config: PathBuf,

    /// Port for the command protocol (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Snapshot file (overrides the config file)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Directory for per-job render logs (overrides the config file)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Controller address
    #[arg(long, short = 'a', default_value = "127.0.0.1:2020")]
    addr: SocketAddr,

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
    /// Queue a render job
    Enqueue {
        /// Project file as seen by the render nodes
        path: String,
        start_frame: i64,
        end_frame: i64,
        /// Render nodes for this job (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,
        /// Frames outside the range to render first (comma-separated)
        #[arg(long, value_delimiter = ',')]
        extra_frames: Vec<i64>,
        /// blender or terragen
        #[arg(long, default_value = "blender")]
        engine: String,
        /// Normal or High
        #[arg(long, default_value = "Normal")]
        priority: String,
        /// Job id; generated if omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Start a waiting job
    Start { id: String },
    /// Stop a rendering job
    Stop {
        id: String,
        /// Kill frames in progress instead of letting them finish
        #[arg(long)]
        now: bool,
    },
    /// Return a stopped or paused job to the queue
    Resume {
        id: String,
        #[arg(long)]
        start: bool,
    },
    /// Remove a job that is not rendering
    Delete { id: String },
    /// Change a job's priority
    Priority { id: String, priority: String },
    /// Show one job, or all of them
    Status { id: Option<String> },
}

// =============================================================================
// Output
// =============================================================================

#[derive(Serialize)]
struct JobRow {
    id: String,
    status: String,
    priority: String,
    progress: f64,
    frames: String,
    path: String,
}

fn job_row(id: &str, attrs: &Value) -> JobRow {
    let text = |key: &str| attrs.get(key).and_then(Value::as_str).unwrap_or("-").to_string();
    let slots = attrs.get("frame_slots").and_then(Value::as_array);
    let done = slots.map(|s| s.iter().filter(|v| !v.is_null()).count()).unwrap_or(0);
    let total = slots.map(Vec::len).unwrap_or(0);
    JobRow {
        id: id.to_string(),
        status: text("status"),
        priority: text("priority"),
        progress: attrs.get("progress").and_then(Value::as_f64).unwrap_or(0.0),
        frames: format!("{}/{}", done, total),
        path: text("path"),
    }
}

fn print_rows(rows: &[JobRow]) {
    if rows.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!(
        "{:<38} {:<10} {:<8} {:>7} {:>11}  PATH",
        "JOB ID", "STATUS", "PRIORITY", "PROG", "FRAMES"
    );
    println!("{}", "-".repeat(90));
    for row in rows {
        println!(
            "{:<38} {:<10} {:<8} {:>6.1}% {:>11}  {}",
            row.id, row.status, row.priority, row.progress, row.frames, row.path
        );
    }
}

fn print_reply(reply: Reply, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match reply.into_result() {
        Ok(value) => {
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
                OutputFormat::Table => match &value {
                    Value::String(s) => println!("{}", s),
                    Value::Object(map) => {
                        for (key, v) in map {
                            println!("{:<16} {}", key, v);
                        }
                    }
                    other => println!("{}", other),
                },
            }
            Ok(())
        }
        Err(e) => Err(e.to_string().into()),
    }
}

async fn handle_status(
    client: &ClientArgs,
    id: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let kwargs = match &id {
        Some(id) => json!({ "index": id }),
        None => json!({}),
    };
    let value = send_request(client.addr, "get_attrs", kwargs)
        .await?
        .into_result()
        .map_err(|e| e.to_string())?;

    let rows: Vec<JobRow> = match (&id, &value) {
        (Some(id), attrs) => vec![job_row(id, attrs)],
        (None, Value::Object(jobs)) => jobs.iter().map(|(id, attrs)| job_row(id, attrs)).collect(),
        (None, _) => Vec::new(),
    };

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
        OutputFormat::Table => print_rows(&rows),
    }
    Ok(())
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = ControllerConfig::load_or_init(&args.config)?;
    if let Some(port) = args.port {
        config.listen_addr.set_port(port);
    }
    if let Some(state_file) = args.state_file {
        config.state_file = state_file;
    }
    if let Some(log_dir) = args.log_dir {
        config.log_dir = log_dir;
    }
    if config.nodes.is_empty() {
        tracing::warn!(config = %args.config.display(), "No render nodes configured");
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        nodes = ?config.node_names(),
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Starting render controller"
    );

    let shutdown = install_shutdown_handler()?;
    ControllerNode::new(config).run(shutdown).await?;
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
        Commands::Request {
            client,
            command,
            kwargs,
        } => {
            let kwargs: Value = serde_json::from_str(&kwargs)?;
            let reply = send_request(client.addr, &command, kwargs).await?;
            print_reply(reply, &client.output)?;
        }
        Commands::Job { client, command } => {
            let (name, kwargs) = match command {
                JobCommands::Status { id } => {
                    return handle_status(&client, id).await;
                }
                JobCommands::Enqueue {
                    path,
                    start_frame,
                    end_frame,
                    nodes,
                    extra_frames,
                    engine,
                    priority,
                    id,
                } => (
                    "enqueue",
                    json!({
                        "index": id,
                        "path": path,
                        "startframe": start_frame,
                        "endframe": end_frame,
                        "extraframes": extra_frames,
                        "engine": engine,
                        "nodes": nodes,
                        "priority": priority,
                    }),
                ),
                JobCommands::Start { id } => ("start_render", json!({ "index": id })),
                JobCommands::Stop { id, now } => {
                    ("kill_render", json!({ "index": id, "kill_now": now }))
                }
                JobCommands::Resume { id, start } => {
                    ("resume_render", json!({ "index": id, "start_now": start }))
                }
                JobCommands::Delete { id } => ("clear_job", json!({ "index": id })),
                JobCommands::Priority { id, priority } => (
                    "set_job_priority",
                    json!({ "index": id, "priority": priority }),
                ),
            };
            let reply = send_request(client.addr, name, kwargs).await?;
            print_reply(reply, &client.output)?;
        }
    }

    Ok(())
}
