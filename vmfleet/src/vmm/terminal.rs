//! Terminal windows attached to instance consoles.
//!
//! Opening a window is cosmetic. Callers log failures and move on.

use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::process::Command;
use vmfleet_shared::errors::{FleetError, PreconditionError};

use crate::util::{find_in_path, run_tool};

/// Something that can show a command in a new window.
#[async_trait]
pub trait TerminalSurface: Send + Sync {
    fn name(&self) -> &str;

    /// Open a window titled `title` running `command`.
    async fn open(&self, title: &str, command: &[String]) -> Result<(), String>;
}

/// Supported terminal emulators.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TerminalKind {
    /// macOS Terminal.app, driven through `osascript`
    MacTerminal,
    Xterm,
    GnomeTerminal,
    /// New window in the current tmux server
    Tmux,
}

impl TerminalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalKind::MacTerminal => "terminal",
            TerminalKind::Xterm => "xterm",
            TerminalKind::GnomeTerminal => "gnome-terminal",
            TerminalKind::Tmux => "tmux",
        }
    }

    /// Program that must be installed for this terminal.
    pub fn program(&self) -> &'static str {
        match self {
            TerminalKind::MacTerminal => "osascript",
            TerminalKind::Xterm => "xterm",
            TerminalKind::GnomeTerminal => "gnome-terminal",
            TerminalKind::Tmux => "tmux",
        }
    }
}

impl FromStr for TerminalKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "terminal" | "macos" | "terminal.app" => Ok(TerminalKind::MacTerminal),
            "xterm" => Ok(TerminalKind::Xterm),
            "gnome-terminal" | "gnome" => Ok(TerminalKind::GnomeTerminal),
            "tmux" => Ok(TerminalKind::Tmux),
            _ => Err(FleetError::Config(format!(
                "Unknown terminal: '{}'. Supported: terminal, xterm, gnome-terminal, tmux",
                s
            ))),
        }
    }
}

/// A located terminal emulator.
#[derive(Debug, Clone)]
pub struct Terminal {
    kind: TerminalKind,
    binary: PathBuf,
}

impl Terminal {
    pub fn new(kind: TerminalKind, binary: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            binary: binary.into(),
        }
    }

    /// Check that the terminal's program is installed.
    pub fn locate(kind: TerminalKind) -> Result<Self, PreconditionError> {
        find_in_path(kind.program())
            .map(|binary| Self::new(kind, binary))
            .ok_or_else(|| PreconditionError::MissingTerminal {
                terminal: kind.as_str().to_string(),
                program: kind.program().to_string(),
            })
    }

    pub fn kind(&self) -> TerminalKind {
        self.kind
    }

    /// Arguments passed to the terminal's program.
    pub fn args(&self, title: &str, command: &[String]) -> Vec<String> {
        let mut args: Vec<String> = match self.kind {
            TerminalKind::MacTerminal => {
                let script = format!(
                    "tell application \"Terminal\" to do script \"{}\"",
                    applescript_escape(&shell_join(command))
                );
                return vec!["-e".to_string(), script];
            }
            TerminalKind::Xterm => vec!["-T".into(), title.into(), "-e".into()],
            TerminalKind::GnomeTerminal => vec!["--title".into(), title.into(), "--".into()],
            TerminalKind::Tmux => vec!["new-window".into(), "-d".into(), "-n".into(), title.into()],
        };
        args.extend(command.iter().cloned());
        args
    }
}

#[async_trait]
impl TerminalSurface for Terminal {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn open(&self, title: &str, command: &[String]) -> Result<(), String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(title, command)).stdin(Stdio::null());

        match self.kind {
            // xterm stays in the foreground for the life of the window
            TerminalKind::Xterm => {
                cmd.stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .process_group(0)
                    .spawn()
                    .map(|_| ())
                    .map_err(|e| format!("failed to start xterm: {e}"))
            }
            _ => run_tool(&mut cmd).await.map(|_| ()),
        }
    }
}

/// Quote `args` for a POSIX shell.
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "/._-:=,@+".contains(c))
            {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn applescript_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
