use std::path::PathBuf;

pub const USAGE: &str = "\
Usage: clawdesk [--config <path>] <command>

Commands:
  gateway run             Start (or adopt) the gateway and supervise it
  gateway status          Check whether a gateway answers on the configured port
  connect                 Connect to the gateway and print events
  call <method> [json]    Send one request and print the result
  identity show           Print the device identity
  identity verify         Sign and verify a sample connect assertion
  help                    Show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    GatewayRun,
    GatewayStatus,
    Connect,
    Call { method: String, params: Option<String> },
    IdentityShow,
    IdentityVerify,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub config: Option<PathBuf>,
    pub command: CliCommand,
}

/// Parse arguments without the program name.
pub fn parse_args(args: &[String]) -> Result<Cli, String> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let path = iter
                .next()
                .ok_or_else(|| format!("{} needs a path", arg))?;
            config = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg.as_str());
        }
    }

    let command = match rest.as_slice() {
        [] | ["help"] | ["--help"] | ["-h"] => CliCommand::Help,
        ["gateway", "run"] => CliCommand::GatewayRun,
        ["gateway", "status"] => CliCommand::GatewayStatus,
        ["connect"] => CliCommand::Connect,
        ["call", method] => CliCommand::Call {
            method: method.to_string(),
            params: None,
        },
        ["call", method, params] => CliCommand::Call {
            method: method.to_string(),
            params: Some(params.to_string()),
        },
        ["identity", "show"] => CliCommand::IdentityShow,
        ["identity", "verify"] => CliCommand::IdentityVerify,
        other => return Err(format!("Unknown command: {}", other.join(" "))),
    };

    Ok(Cli { config, command })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_args(&args("gateway run")).unwrap().command, CliCommand::GatewayRun);
        assert_eq!(parse_args(&args("")).unwrap().command, CliCommand::Help);
        assert_eq!(
            parse_args(&args("call health")).unwrap().command,
            CliCommand::Call {
                method: "health".to_string(),
                params: None
            }
        );
        assert_eq!(
            parse_args(&args("call chat.send {\"text\":\"hi\"}")).unwrap().command,
            CliCommand::Call {
                method: "chat.send".to_string(),
                params: Some("{\"text\":\"hi\"}".to_string())
            }
        );
    }

    #[test]
    fn test_config_flag_anywhere() {
        let cli = parse_args(&args("identity show --config /tmp/c.yaml")).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert_eq!(cli.command, CliCommand::IdentityShow);

        let cli = parse_args(&args("--config=/etc/clawdesk.yaml connect")).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/clawdesk.yaml")));
        assert_eq!(cli.command, CliCommand::Connect);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args("gateway")).is_err());
        assert!(parse_args(&args("connect --config")).is_err());
        assert!(parse_args(&args("call a b c")).is_err());
    }
}
