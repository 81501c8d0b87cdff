//! Operator command grammar

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unterminated quote in command line")]
    UnterminatedQuote,
}

/// One line typed at the console prompt
#[derive(Parser, Debug)]
#[command(
    name = "outpost",
    no_binary_name = true,
    disable_help_subcommand = true,
    disable_version_flag = true
)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Show available commands, or help for one command
    Help {
        /// Command to describe
        topic: Option<String>,
    },

    /// List connected sessions
    #[command(visible_aliases = ["s", "sess"])]
    Sessions,

    /// Show details for a session
    Info {
        /// Session id or name (defaults to the active session)
        target: Option<String>,
    },

    /// Select the session commands run against
    Use {
        /// Session id or name
        target: String,
    },

    /// Deselect the active session
    Background,

    /// Build a new agent binary
    #[command(visible_alias = "gen")]
    Generate {
        /// Target operating system
        #[arg(long, default_value = "windows")]
        os: String,

        /// Target CPU architecture (amd64, 386)
        #[arg(long, default_value = "amd64")]
        arch: String,

        /// Address the agent calls back to
        #[arg(long)]
        lhost: Option<String>,

        /// Port the agent calls back to
        #[arg(long)]
        lport: Option<u16>,

        /// Build a debug binary
        #[arg(long)]
        debug: bool,

        /// Copy the binary to this file or directory
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Run a framework payload inside the active session
    Msf {
        #[arg(long, default_value = "meterpreter_reverse_https")]
        payload: String,

        /// Payload listener host
        #[arg(long)]
        lhost: Option<String>,

        /// Payload listener port
        #[arg(long, default_value_t = 4444)]
        lport: u16,
    },

    /// Inject a framework payload into a remote process
    Inject {
        /// Process to inject into
        #[arg(long)]
        pid: i32,

        #[arg(long, default_value = "meterpreter_reverse_https")]
        payload: String,

        /// Payload listener host
        #[arg(long)]
        lhost: Option<String>,

        /// Payload listener port
        #[arg(long, default_value_t = 4444)]
        lport: u16,
    },

    /// List processes on the active session's host
    Ps {
        /// Only show this pid
        #[arg(long)]
        pid: Option<i32>,

        /// Only show executables starting with this prefix
        #[arg(long)]
        exe: Option<String>,
    },

    /// Round-trip a ping to a session
    Ping {
        /// Session id or name (defaults to the active session)
        target: Option<String>,
    },

    /// Tell a session's agent to exit
    Kill {
        /// Session id or name (defaults to the active session)
        target: Option<String>,

        #[arg(long)]
        force: bool,
    },

    /// List a remote directory
    Ls {
        /// Directory to list
        #[arg(default_value = ".")]
        path: String,
    },

    /// Change the remote working directory
    Cd { path: String },

    /// Print the remote working directory
    Pwd,

    /// Fetch a remote file
    Download {
        /// Remote file
        path: String,

        /// Local file or directory to write to
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Send a local file to the remote host
    Upload {
        /// Local file
        local: PathBuf,

        /// Remote destination (defaults to the local file name)
        remote: Option<String>,
    },

    /// List listener jobs, or stop one
    Jobs {
        /// Job id to stop
        #[arg(long, short = 'k')]
        kill: Option<u32>,
    },

    /// Start a session listener
    Listen {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Wrap the listener in TLS
        #[arg(long, requires_all = ["cert", "key"])]
        tls: bool,

        /// PEM certificate chain
        #[arg(long)]
        cert: Option<PathBuf>,

        /// PEM private key
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Start a TCP stager listener
    StageListener {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long)]
        port: u16,

        /// File whose contents are served to each client
        #[arg(long)]
        stage_file: PathBuf,

        #[arg(long, default_value = "")]
        profile: String,
    },

    /// Leave the console
    Exit,
}

impl ConsoleCommand {
    /// Parse one prompt line. Blank lines give `Ok(None)`.
    pub fn parse_line(line: &str) -> Result<Option<Self>, clap::Error> {
        let words = split_words(line).map_err(|e| {
            ConsoleLine::command().error(clap::error::ErrorKind::InvalidValue, e.to_string())
        })?;
        if words.is_empty() {
            return Ok(None);
        }

        ConsoleLine::try_parse_from(words).map(|line| Some(line.command))
    }
}

/// Overview of every command
pub fn render_help() -> String {
    ConsoleLine::command().render_help().to_string()
}

/// Help for one command, if it exists
pub fn render_command_help(topic: &str) -> Option<String> {
    let mut root = ConsoleLine::command();
    root.build();

    let command = root.get_subcommands_mut().find(|c| {
        c.get_name() == topic || c.get_all_aliases().any(|alias| alias == topic)
    })?;
    Some(command.render_help().to_string())
}

/// Split a command line on whitespace, honoring single and double quotes.
///
/// Inside double quotes `\"` and `\\` are escapes; every other backslash is
/// kept so Windows paths survive.
pub fn split_words(line: &str) -> Result<Vec<String>, ParseError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' && matches!(chars.peek(), Some('"') | Some('\\')) => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(ParseError::UnterminatedQuote);
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
