use std::net::SocketAddr;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::Result;
use crate::protocol::frame::{read_message, write_message};
use crate::protocol::Reply;

/// Send one command with keyword arguments and wait for the reply.
pub async fn send_request(addr: SocketAddr, command: &str, kwargs: Value) -> Result<Reply> {
    let request = json!({ "command": command, "kwargs": kwargs });
    send_raw(addr, &serde_json::to_vec(&request)?).await
}

/// Send an already encoded request payload.
pub async fn send_raw(addr: SocketAddr, payload: &[u8]) -> Result<Reply> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, payload).await?;
    let reply = read_message(&mut stream).await?;
    stream.shutdown().await.ok();
    Ok(serde_json::from_slice(&reply)?)
}
