//! Running commands with administrator rights.
//!
//! The title and body end up inside shell and AppleScript strings without
//! escaping; only pass constants.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::CaptureMode;
use crate::error::EscalationError;

pub const PROMPT_TITLE: &str = "Authentication Required";
pub const PROMPT_BODY: &str = "Authentication is needed to capture packets.";

const FLATPAK_SPAWN: &str = "flatpak-spawn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        match env::consts::OS {
            "windows" => Platform::Windows,
            "macos" => Platform::MacOs,
            _ => Platform::Linux,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElevatedCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// What the process does once the elevated command succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterEscalation {
    /// The executable now carries capture capability; a fresh capture child
    /// picks it up.
    Reprobe,
    /// The executable now carries capture capability, but this process does
    /// not; start a new instance with the same arguments.
    Relaunch,
    /// The elevated command already started a privileged instance.
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationPlan {
    pub command: String,
    pub then: AfterEscalation,
}

/// Decide how capture capability is obtained on `platform`.
///
/// Linux grants raw-capture capabilities to the executable file. Elsewhere
/// the whole command line is started again with elevated rights.
pub fn plan(platform: Platform, mode: CaptureMode, executable: &Path, args: &[OsString]) -> EscalationPlan {
    let exe = executable.to_string_lossy();
    let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();

    match platform {
        Platform::Linux => EscalationPlan {
            command: format!("setcap cap_net_raw,cap_net_admin=eip {}", shell_quote(&exe)),
            then: match mode {
                CaptureMode::Relay => AfterEscalation::Reprobe,
                CaptureMode::Direct => AfterEscalation::Relaunch,
            },
        },
        Platform::MacOs => {
            let mut words = vec![shell_quote(&exe)];
            words.extend(args.iter().map(|a| shell_quote(a)));
            EscalationPlan {
                command: format!("{} > /dev/null 2>&1 &", words.join(" ")),
                then: AfterEscalation::Exit,
            }
        }
        Platform::Windows => {
            let mut command = format!("Start-Process -FilePath {}", powershell_quote(&exe));
            if !args.is_empty() {
                let quoted: Vec<String> = args.iter().map(|a| powershell_quote(a)).collect();
                command.push_str(&format!(" -ArgumentList {}", quoted.join(",")));
            }
            EscalationPlan {
                command,
                then: AfterEscalation::Exit,
            }
        }
    }
}

/// Build the OS-specific invocation that runs `command` elevated.
/// `lookup` resolves executable names on the PATH.
pub fn build<F>(platform: Platform, title: &str, body: &str, command: &str, lookup: F) -> Result<ElevatedCommand, EscalationError>
where
    F: Fn(&str) -> Option<PathBuf>,
{
    if command.trim().is_empty() {
        return Err(EscalationError::Construct("empty command".into()));
    }

    match platform {
        Platform::Windows => {
            let powershell = lookup("pwsh.exe")
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "powershell.exe".into());
            if command.contains('"') {
                return Err(EscalationError::Construct(
                    "command may not contain double quotes".into(),
                ));
            }

            Ok(ElevatedCommand {
                args: vec![
                    "-Command".into(),
                    format!("Start-Process '{powershell}' -Verb RunAs -Wait -ArgumentList \"{command}\""),
                ],
                program: powershell,
            })
        }
        Platform::MacOs => Ok(ElevatedCommand {
            program: "osascript".into(),
            args: vec![
                "-e".into(),
                format!(
                    "do shell script \"{}\" with administrator privileges with prompt \"{title}: {body}\"",
                    applescript_escape(command)
                ),
            ],
        }),
        Platform::Linux => {
            let command = if let Some(pkexec) = lookup("pkexec") {
                format!("{} {command}", pkexec.display())
            } else {
                // Terminal fallback for hosts without a polkit agent.
                let terminal = lookup("xterm").ok_or(EscalationError::NoTerminal)?;
                let suid = ["run0", "sudo", "doas"]
                    .into_iter()
                    .find_map(&lookup)
                    .ok_or(EscalationError::NoEscalationMethod)?;

                format!(
                    "{} -T '{title}' -e \"echo '{body}' && {} {command}\"",
                    terminal.display(),
                    suid.display()
                )
            };

            if lookup(FLATPAK_SPAWN).is_some() {
                Ok(ElevatedCommand {
                    program: FLATPAK_SPAWN.into(),
                    args: vec!["--host".into(), "sh".into(), "-c".into(), command],
                })
            } else {
                Ok(ElevatedCommand {
                    program: "sh".into(),
                    args: vec!["-c".into(), command],
                })
            }
        }
    }
}

/// Run `command` with elevated rights, blocking until it exits. May wait for
/// the user indefinitely.
pub async fn run_elevated(command: &str) -> Result<(), EscalationError> {
    let elevated = build(
        Platform::current(),
        PROMPT_TITLE,
        PROMPT_BODY,
        command,
        find_executable,
    )?;
    info!(program = %elevated.program, "requesting elevated privileges");
    debug!(args = ?elevated.args, "elevation command");

    let output = Command::new(&elevated.program)
        .args(&elevated.args)
        .output()
        .await?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(EscalationError::CommandFailed {
            status: output.status.to_string(),
            output: combined.trim().to_string(),
        });
    }

    Ok(())
}

/// Resolve `name` against the PATH.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// PowerShell literal string; a single quote is doubled.
fn powershell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', "''"))
}

fn applescript_escape(command: &str) -> String {
    command.replace('\\', r"\\").replace('"', "\\\"")
}
