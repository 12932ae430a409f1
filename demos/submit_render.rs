use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};

use render_controller::protocol::send_request;

#[derive(Parser, Debug)]
#[command(name = "submit-render")]
#[command(about = "Queue a render on a running controller and follow it to completion")]
struct Args {
    /// Controller address
    #[arg(long, default_value = "127.0.0.1:2020")]
    addr: SocketAddr,

    /// Project file as seen by the render nodes
    #[arg(long)]
    path: String,

    #[arg(long, default_value_t = 1)]
    start: i64,

    #[arg(long, default_value_t = 10)]
    end: i64,

    /// Render nodes (comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    nodes: Vec<String>,

    /// Seconds between status polls
    #[arg(long, default_value_t = 5)]
    poll: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let reply = send_request(
        args.addr,
        "enqueue",
        json!({
            "path": args.path,
            "startframe": args.start,
            "endframe": args.end,
            "nodes": args.nodes,
        }),
    )
    .await?
    .into_result()
    .map_err(|e| e.to_string())?;

    let id = reply
        .get("index")
        .and_then(Value::as_str)
        .ok_or("enqueue reply carries no job id")?
        .to_string();
    println!("Job queued: {}", id);

    let reply = send_request(args.addr, "start_render", json!({ "index": id })).await?;
    match reply.into_result() {
        Ok(value) => println!("Start requested: {}", value),
        // Autostart may already have picked it up.
        Err(e) => println!("Start refused: {}", e),
    }

    loop {
        let attrs = send_request(args.addr, "get_attrs", json!({ "index": id }))
            .await?
            .into_result()
            .map_err(|e| e.to_string())?;
        let status = attrs.get("status").and_then(Value::as_str).unwrap_or("?");
        let progress = attrs.get("progress").and_then(Value::as_f64).unwrap_or(0.0);
        println!("{:<10} {:>6.1}%", status, progress);

        if status != "Rendering" && status != "Waiting" {
            break;
        }
        tokio::time::sleep(Duration::from_secs(args.poll)).await;
    }

    Ok(())
}
