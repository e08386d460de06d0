use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Rotate { format: OutputFormat },
    Roster,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub config: PathBuf,
    pub command: Command,
}

/// Parse `args` (without the program name).
pub fn parse(args: &[String]) -> Result<Cli, String> {
    let mut config = None;
    let mut format = OutputFormat::Json;
    let mut command = None;

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--config" | "-c" => {
                let path = args
                    .get(i + 1)
                    .ok_or_else(|| "--config requires a path argument".to_string())?;
                config = Some(PathBuf::from(path));
                i += 1;
            }
            "--format" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "--format requires json or text".to_string())?;
                format = parse_format(value)?;
                i += 1;
            }
            "--help" | "-h" | "help" => command = Some(Command::Help),
            "rotate" if command.is_none() => command = Some(Command::Rotate { format }),
            "roster" if command.is_none() => command = Some(Command::Roster),
            _ => {
                if let Some(path) = arg.strip_prefix("--config=") {
                    config = Some(PathBuf::from(path));
                } else if let Some(value) = arg.strip_prefix("--format=") {
                    format = parse_format(value)?;
                } else {
                    return Err(format!("unknown argument: {arg}"));
                }
            }
        }
        i += 1;
    }

    let command = match command.unwrap_or(Command::Help) {
        Command::Rotate { .. } => Command::Rotate { format },
        other => other,
    };
    Ok(Cli {
        config: config.unwrap_or_else(default_config_path),
        command,
    })
}

fn parse_format(value: &str) -> Result<OutputFormat, String> {
    match value {
        "json" => Ok(OutputFormat::Json),
        "text" | "table" => Ok(OutputFormat::Text),
        other => Err(format!("unknown format: {other} (expected json or text)")),
    }
}

pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!("neither XDG_CONFIG_HOME nor HOME are set; using current directory for config");
            PathBuf::from(".")
        });
    base.join("keyrot").join("config.toml")
}

pub fn print_help() {
    println!(
        "\
keyrot - rotate managed SSH authorized_keys entries for a roster of users

USAGE:
    keyrot [--config <path>] <command> [options]

COMMANDS:
    rotate [--format json|text]     Run one reconciliation pass over the roster
    roster                          Parse the roster and print the records (no remote access)
    help                            Show this help

OPTIONS:
    -c, --config <path>             Config file (default: $XDG_CONFIG_HOME/keyrot/config.toml)
    --format json|text              Run summary format on stdout [default: json]

EXIT STATUS:
    0    every user replaced, appended or skipped
    1    at least one user failed and rotation.failure_policy = \"fatal\"
    2    configuration, connection or roster error; nothing was reconciled
    130  interrupted; remaining users were skipped

Logs go to stderr; set RUST_LOG=debug for command-level detail."
    );
}
