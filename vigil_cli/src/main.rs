use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use vigil_protocol::control::{ControlRequest, ControlResponse, FenceRecord};

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Control client for the vigil HA daemon")]
struct Cli {
    /// Control socket of the local daemon.
    #[arg(long, default_value = "/run/vigil/control.sock", env = "VIGIL_SOCKET")]
    socket: PathBuf,

    /// Print raw JSON responses instead of formatted output.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Node and cluster status.
    Status,
    /// Health monitor results.
    Health,
    /// Declared resources and their activation state.
    Resources,
    /// Put this node into standby.
    Standby,
    /// Take this node out of standby.
    Unstandby,
    /// Hand leadership to another node.
    Failover {
        /// Preferred successor (optional).
        target: Option<String>,
    },
    /// Re-read the daemon configuration.
    Reload,
    /// Fencing subcommands.
    #[command(subcommand)]
    Stonith(StonithCommands),
    /// Decode a join token and print its payload.
    Token {
        /// The token, with or without the `vigil-join://` prefix.
        value: String,
    },
}

#[derive(Subcommand, Debug)]
enum StonithCommands {
    /// Driver and gate status.
    Status,
    /// Manually fence a node.
    Fence { node: String },
    /// Power a fenced node back on.
    Unfence { node: String },
    /// The persisted fence history, newest first.
    History,
}

impl Commands {
    fn into_request(self) -> ControlRequest {
        match self {
            Commands::Status => ControlRequest::Status,
            Commands::Health => ControlRequest::Health,
            Commands::Resources => ControlRequest::Resources,
            Commands::Standby => ControlRequest::Standby,
            Commands::Unstandby => ControlRequest::Unstandby,
            Commands::Failover { target } => ControlRequest::Failover { target },
            Commands::Reload => ControlRequest::Reload,
            Commands::Stonith(StonithCommands::Status) => ControlRequest::StonithStatus,
            Commands::Stonith(StonithCommands::Fence { node }) => {
                ControlRequest::StonithFence { node }
            }
            Commands::Stonith(StonithCommands::Unfence { node }) => {
                ControlRequest::StonithUnfence { node }
            }
            Commands::Stonith(StonithCommands::History) => ControlRequest::StonithHistory,
            Commands::Token { .. } => unreachable!("token is handled locally"),
        }
    }
}

async fn send_request(socket: &PathBuf, request: &ControlRequest) -> anyhow::Result<ControlResponse> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to {} (is vigild running?)", socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;

    let mut reply = String::new();
    BufReader::new(read_half)
        .read_line(&mut reply)
        .await
        .context("reading daemon response")?;
    Ok(serde_json::from_str(reply.trim()).context("parsing daemon response")?)
}

fn print_history(data: &serde_json::Value) {
    let Ok(records) = serde_json::from_value::<Vec<FenceRecord>>(data.clone()) else {
        println!("{data}");
        return;
    };
    if records.is_empty() {
        println!("no fence events recorded");
        return;
    }
    for record in records {
        println!(
            "{}  {:<10} {:?}  success={}  {}ms  {}  ({:?})",
            record.timestamp,
            record.node,
            record.action,
            record.success,
            record.duration_ms,
            record.reason,
            record.initiated_by,
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Commands::Token { value } = &cli.command {
        let token = vigil_protocol::token::JoinToken::decode(value)?;
        println!("{}", serde_json::to_string_pretty(&token)?);
        return Ok(());
    }
    let raw_json = cli.json;
    let is_history = matches!(cli.command, Commands::Stonith(StonithCommands::History));
    let request = cli.command.into_request();
    let response = send_request(&cli.socket, &request).await?;

    if raw_json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else if !response.success {
        anyhow::bail!(
            "{}",
            response.error.unwrap_or_else(|| "command failed".to_string())
        );
    } else if is_history {
        if let Some(data) = &response.data {
            print_history(data);
        }
    } else if let Some(message) = &response.message {
        println!("{message}");
        if let Some(data) = &response.data {
            println!("{}", serde_json::to_string_pretty(data)?);
        }
    } else if let Some(data) = &response.data {
        println!("{}", serde_json::to_string_pretty(data)?);
    } else {
        println!("ok");
    }

    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_map_to_wire_requests() {
        assert_eq!(Commands::Status.into_request(), ControlRequest::Status);
        assert_eq!(
            Commands::Failover {
                target: Some("ns2".to_string())
            }
            .into_request(),
            ControlRequest::Failover {
                target: Some("ns2".to_string())
            }
        );
        assert_eq!(
            Commands::Stonith(StonithCommands::Fence {
                node: "ns3".to_string()
            })
            .into_request(),
            ControlRequest::StonithFence {
                node: "ns3".to_string()
            }
        );
    }

    #[test]
    fn cli_parses_stonith_subcommands() {
        use clap::Parser as _;
        let cli = Cli::try_parse_from(["vigil", "stonith", "history"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Stonith(StonithCommands::History)
        ));
    }
}
