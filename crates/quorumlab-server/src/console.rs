//! Operator commands read from the console.

use quorumlab_store::KvResponse;

use crate::control::ControlPlane;

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print every member's status as JSON.
    Status,
    /// Print client endpoints.
    Endpoints,
    /// Stop the member at an index.
    Stop(usize),
    /// Restart the member at an index.
    Restart(usize),
    /// Add a member.
    Add,
    /// Remove the member at an index.
    Remove(usize),
    /// Write through a member.
    Put { index: usize, key: String, value: String },
    /// Read through a member.
    Get { index: usize, key: String },
    /// Delete through a member.
    Delete { index: usize, key: String },
    /// Show help.
    Help,
    /// Shut the cluster down.
    Exit,
}

/// Result of executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Nothing to print.
    Continue,
    /// Output to display.
    Output(String),
    /// Stop reading commands and shut down.
    Exit,
}

impl Command {
    /// Parse one console line. `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return Ok(None);
        };
        let name = command.to_lowercase();
        let args: Vec<&str> = parts.collect();

        let command = match (name.as_str(), args.as_slice()) {
            ("status" | "st", []) => Command::Status,
            ("endpoints" | "ep", []) => Command::Endpoints,
            ("stop", [i]) => Command::Stop(index(i)?),
            ("restart", [i]) => Command::Restart(index(i)?),
            ("add", []) => Command::Add,
            ("remove" | "rm", [i]) => Command::Remove(index(i)?),
            ("put", [i, key, value @ ..]) if !value.is_empty() => Command::Put {
                index: index(i)?,
                key: key.to_string(),
                value: value.join(" "),
            },
            ("get", [i, key]) => Command::Get {
                index: index(i)?,
                key: key.to_string(),
            },
            ("delete" | "del", [i, key]) => Command::Delete {
                index: index(i)?,
                key: key.to_string(),
            },
            ("help" | "h" | "?", []) => Command::Help,
            ("exit" | "quit" | "q", []) => Command::Exit,
            _ => {
                return Err(match usage(&name) {
                    Some(usage) => format!("Usage: {}", usage),
                    None => format!("Unknown command: {}", command),
                })
            }
        };
        Ok(Some(command))
    }

    /// Run the command against the control plane.
    pub async fn execute(self, control: &ControlPlane) -> CommandResult {
        let output = match self {
            Command::Status => match serde_json::to_string_pretty(&control.status()) {
                Ok(json) => json,
                Err(e) => format!("Error: {}", e),
            },
            Command::Endpoints => control
                .cluster()
                .all_endpoints(true)
                .iter()
                .enumerate()
                .map(|(i, ep)| format!("{}  {}", i, ep))
                .collect::<Vec<_>>()
                .join("\n"),
            Command::Stop(i) => message(control.stop(i).await),
            Command::Restart(i) => message(control.restart(i).await),
            Command::Add => message(control.add().await),
            Command::Remove(i) => message(control.remove(i).await),
            Command::Put { index, key, value } => match control.put(index, &key, &value).await {
                Ok(KvResponse::Put { previous: Some(prev) }) => {
                    format!("OK (previous value {:?})", prev)
                }
                Ok(resp) => kv_message(resp),
                Err(e) => format!("Error: {}", e),
            },
            Command::Get { index, key } => match control.get(index, &key).await {
                Ok(Some(value)) => value,
                Ok(None) => format!("{} not found", key),
                Err(e) => format!("Error: {}", e),
            },
            Command::Delete { index, key } => match control.delete(index, &key).await {
                Ok(KvResponse::Deleted { existed: false }) => format!("{} not found", key),
                Ok(resp) => kv_message(resp),
                Err(e) => format!("Error: {}", e),
            },
            Command::Help => help(),
            Command::Exit => return CommandResult::Exit,
        };
        if output.is_empty() {
            CommandResult::Continue
        } else {
            CommandResult::Output(output)
        }
    }
}

fn index(arg: &str) -> Result<usize, String> {
    arg.parse()
        .map_err(|_| format!("Invalid member index '{}'", arg))
}

fn message(result: crate::Result<String>) -> String {
    match result {
        Ok(msg) => msg,
        Err(e) => format!("Error: {}", e),
    }
}

fn kv_message(resp: KvResponse) -> String {
    match resp.error_message() {
        Some(e) => format!("Error: {}", e),
        None => "OK".to_string(),
    }
}

fn usage(name: &str) -> Option<&'static str> {
    Some(match name {
        "stop" => "stop <index>",
        "restart" => "restart <index>",
        "remove" | "rm" => "remove <index>",
        "put" => "put <index> <key> <value>",
        "get" => "get <index> <key>",
        "delete" | "del" => "delete <index> <key>",
        "status" | "st" => "status",
        "endpoints" | "ep" => "endpoints",
        "add" => "add",
        "help" | "h" | "?" => "help",
        "exit" | "quit" | "q" => "exit",
        _ => return None,
    })
}

fn help() -> String {
    r#"Commands
========

status                      Show every member's status as JSON
endpoints                   List client endpoints by index
stop <index>                Stop a member (refused if quorum would be lost)
restart <index>             Restart a stopped member
add                         Add a member
remove <index>              Remove a member
put <index> <key> <value>   Write through a member
get <index> <key>           Linearizable read through a member
delete <index> <key>        Delete through a member
help                        Show this help message
exit / quit                 Shut the cluster down
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("status").unwrap(), Some(Command::Status));
        assert_eq!(Command::parse("  STOP 2 ").unwrap(), Some(Command::Stop(2)));
        assert_eq!(Command::parse("restart 0").unwrap(), Some(Command::Restart(0)));
        assert_eq!(Command::parse("add").unwrap(), Some(Command::Add));
        assert_eq!(Command::parse("rm 4").unwrap(), Some(Command::Remove(4)));
        assert_eq!(
            Command::parse("put 1 greeting hello world").unwrap(),
            Some(Command::Put {
                index: 1,
                key: "greeting".to_string(),
                value: "hello world".to_string(),
            })
        );
        assert_eq!(
            Command::parse("get 0 greeting").unwrap(),
            Some(Command::Get {
                index: 0,
                key: "greeting".to_string(),
            })
        );
        assert_eq!(Command::parse("q").unwrap(), Some(Command::Exit));
        assert_eq!(Command::parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse("stop").unwrap_err(), "Usage: stop <index>");
        assert_eq!(
            Command::parse("put 1 key").unwrap_err(),
            "Usage: put <index> <key> <value>"
        );
        assert_eq!(
            Command::parse("stop two").unwrap_err(),
            "Invalid member index 'two'"
        );
        assert_eq!(Command::parse("launch").unwrap_err(), "Unknown command: launch");
        assert_eq!(Command::parse("STATUS now").unwrap_err(), "Usage: status");
    }

    #[test]
    fn test_help_lists_every_command() {
        let text = help();
        let names = [
            "status", "endpoints", "stop", "restart", "add", "remove", "put", "get", "delete",
            "exit",
        ];
        for name in names {
            assert!(text.contains(name), "help is missing {}", name);
        }
    }
}
