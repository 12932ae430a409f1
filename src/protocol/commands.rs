use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Map, Value};

use crate::error::{ControllerError, Result};
use crate::scheduler::{EnqueueParams, Engine, Priority, Scheduler};

/// Commands a client may invoke. Anything else is refused before its
/// arguments are looked at.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "get_attrs",
    "job_exists",
    "enqueue",
    "start_render",
    "toggle_comp",
    "kill_single_thread",
    "kill_render",
    "resume_render",
    "clear_job",
    "get_status",
    "get_config_vars",
    "toggle_verbose",
    "toggle_autostart",
    "check_path_exists",
    "set_job_priority",
    "killall",
];

/// A request as read off the wire. Arguments stay unparsed until the command
/// has passed the allow-list.
#[derive(Debug, Deserialize)]
pub struct RawRequest {
    pub command: String,
    #[serde(default)]
    pub args: Option<Box<RawValue>>,
    #[serde(default)]
    pub kwargs: Option<Box<RawValue>>,
}

/// Parameter names in positional order.
fn parameter_names(command: &str) -> &'static [&'static str] {
    match command {
        "get_attrs" | "job_exists" | "start_render" | "clear_job" | "get_status" => &["index"],
        "enqueue" => &[
            "index",
            "path",
            "startframe",
            "endframe",
            "extraframes",
            "engine",
            "nodes",
            "priority",
        ],
        "toggle_comp" | "kill_single_thread" => &["index", "node"],
        "kill_render" => &["index", "kill_now"],
        "resume_render" => &["index", "start_now"],
        "check_path_exists" => &["path"],
        "set_job_priority" => &["index", "priority"],
        "killall" => &["nodes", "process_name"],
        _ => &[],
    }
}

/// Merge positional `args` and `kwargs` into one keyword map.
pub fn bind_arguments(
    command: &str,
    args: Option<&RawValue>,
    kwargs: Option<&RawValue>,
) -> Result<Map<String, Value>> {
    let invalid = |message: String| ControllerError::InvalidArguments {
        command: command.to_string(),
        message,
    };

    let mut bound: Map<String, Value> = match kwargs {
        Some(raw) => match serde_json::from_str::<Option<Map<String, Value>>>(raw.get()) {
            Ok(map) => map.unwrap_or_default(),
            Err(e) => return Err(invalid(format!("kwargs must be an object: {}", e))),
        },
        None => Map::new(),
    };

    let positional: Vec<Value> = match args {
        Some(raw) => match serde_json::from_str::<Option<Vec<Value>>>(raw.get()) {
            Ok(values) => values.unwrap_or_default(),
            Err(e) => return Err(invalid(format!("args must be an array: {}", e))),
        },
        None => Vec::new(),
    };

    let names = parameter_names(command);
    if positional.len() > names.len() {
        return Err(invalid(format!(
            "takes at most {} positional arguments, got {}",
            names.len(),
            positional.len()
        )));
    }
    for (name, value) in names.iter().zip(positional) {
        if bound.contains_key(*name) {
            return Err(invalid(format!("argument {} given twice", name)));
        }
        bound.insert(name.to_string(), value);
    }
    Ok(bound)
}

fn decode<T: DeserializeOwned>(command: &str, params: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(params)).map_err(|e| ControllerError::InvalidArguments {
        command: command.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexArgs {
    index: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionalIndexArgs {
    #[serde(default)]
    index: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnqueueArgs {
    #[serde(default)]
    index: Option<String>,
    path: String,
    startframe: i64,
    endframe: i64,
    #[serde(default)]
    extraframes: Vec<i64>,
    #[serde(default)]
    engine: Engine,
    nodes: Vec<String>,
    #[serde(default)]
    priority: Priority,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeArgs {
    index: String,
    node: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KillRenderArgs {
    index: String,
    #[serde(default)]
    kill_now: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResumeArgs {
    index: String,
    #[serde(default)]
    start_now: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathArgs {
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PriorityArgs {
    index: String,
    priority: Priority,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KillallArgs {
    #[serde(default)]
    nodes: Vec<String>,
    process_name: String,
}

async fn job_summary(scheduler: &Scheduler, id: &str) -> Result<Value> {
    let status = scheduler.status(id).await?;
    Ok(json!({ "index": id, "status": status }))
}

/// Run one request against the scheduler.
pub async fn execute(scheduler: &Scheduler, request: RawRequest) -> Result<Value> {
    let command = request.command.as_str();
    if !ALLOWED_COMMANDS.contains(&command) {
        return Err(ControllerError::UnknownCommand(request.command));
    }
    let params = bind_arguments(command, request.args.as_deref(), request.kwargs.as_deref())?;
    tracing::debug!(command, "Executing client command");

    match command {
        "get_attrs" => {
            let args: OptionalIndexArgs = decode(command, params)?;
            match args.index {
                Some(id) => scheduler.attrs(&id).await,
                None => scheduler.all_attrs().await,
            }
        }
        "job_exists" => {
            let args: IndexArgs = decode(command, params)?;
            Ok(Value::Bool(scheduler.exists(&args.index).await))
        }
        "enqueue" => {
            let args: EnqueueArgs = decode(command, params)?;
            let params = EnqueueParams {
                path: args.path,
                start_frame: args.startframe,
                end_frame: args.endframe,
                extra_frames: args.extraframes,
                engine: args.engine,
                nodes: args.nodes,
                priority: args.priority,
            };
            let id = scheduler.enqueue(args.index, params).await?;
            job_summary(scheduler, &id).await
        }
        "start_render" => {
            let args: IndexArgs = decode(command, params)?;
            scheduler.start(&args.index).await?;
            job_summary(scheduler, &args.index).await
        }
        "toggle_comp" => {
            let args: NodeArgs = decode(command, params)?;
            let in_pool = scheduler.toggle_node(&args.index, &args.node).await?;
            Ok(json!({ "index": args.index, "node": args.node, "in_pool": in_pool }))
        }
        "kill_single_thread" => {
            let args: NodeArgs = decode(command, params)?;
            let pid = scheduler.kill_node(&args.index, &args.node).await?;
            Ok(json!({ "index": args.index, "node": args.node, "pid": pid }))
        }
        "kill_render" => {
            let args: KillRenderArgs = decode(command, params)?;
            scheduler.stop(&args.index, args.kill_now).await?;
            job_summary(scheduler, &args.index).await
        }
        "resume_render" => {
            let args: ResumeArgs = decode(command, params)?;
            scheduler.resume(&args.index, args.start_now).await?;
            job_summary(scheduler, &args.index).await
        }
        "clear_job" => {
            let args: IndexArgs = decode(command, params)?;
            scheduler.delete(&args.index).await?;
            Ok(json!({ "index": args.index, "deleted": true }))
        }
        "get_status" => {
            let args: IndexArgs = decode(command, params)?;
            let status = scheduler.status(&args.index).await?;
            Ok(json!(status))
        }
        "get_config_vars" => {
            let _: NoArgs = decode(command, params)?;
            let mut config = serde_json::to_value(scheduler.config())?;
            if let Value::Object(map) = &mut config {
                map.insert("autostart".to_string(), json!(scheduler.autostart_enabled()));
                map.insert("verbose".to_string(), json!(scheduler.verbose_enabled()));
            }
            Ok(config)
        }
        "toggle_verbose" => {
            let _: NoArgs = decode(command, params)?;
            Ok(Value::Bool(scheduler.toggle_verbose()))
        }
        "toggle_autostart" => {
            let _: NoArgs = decode(command, params)?;
            Ok(Value::Bool(scheduler.toggle_autostart()))
        }
        "check_path_exists" => {
            let args: PathArgs = decode(command, params)?;
            Ok(Value::Bool(Path::new(&args.path).exists()))
        }
        "set_job_priority" => {
            let args: PriorityArgs = decode(command, params)?;
            scheduler.set_priority(&args.index, args.priority).await?;
            Ok(json!({ "index": args.index, "priority": args.priority }))
        }
        "killall" => {
            let args: KillallArgs = decode(command, params)?;
            let nodes = scheduler.killall(&args.nodes, &args.process_name)?;
            Ok(json!({ "nodes": nodes, "process_name": args.process_name }))
        }
        _ => Err(ControllerError::UnknownCommand(request.command.clone())),
    }
}
