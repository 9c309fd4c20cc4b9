#![forbid(unsafe_code)]

//! `session-relay-ctl`: local CLI companion for `session-relay`.
//!
//! Connects to the IPC socket and sends JSON commands to the server.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "session-relay-ctl",
    about = "Local CLI for session-relay server",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match server's `ipc_name` config).
    #[arg(long, default_value = "session-relay")]
    ipc_name: String,

    /// File holding the server's IPC auth token (`ipc.token` next to the database).
    #[arg(long)]
    token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List live sessions.
    List,

    /// Kill one session, or all sessions when no id is given.
    Kill {
        /// Session ID.
        id: Option<String>,
    },
}

fn main() {
    let args = Cli::parse();

    let mut request_json = match &args.command {
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Kill { id } => {
            let mut req = serde_json::json!({ "command": "kill" });
            if let Some(id) = id {
                req["id"] = serde_json::Value::String(id.clone());
            }
            req
        }
    };

    if let Some(path) = &args.token_file {
        match std::fs::read_to_string(path) {
            Ok(token) => {
                request_json["auth_token"] = serde_json::Value::String(token.trim().to_owned());
            }
            Err(err) => {
                eprintln!("Failed to read token file {}: {err}", path.display());
                std::process::exit(1);
            }
        }
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is session-relay running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
