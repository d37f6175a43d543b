use std::collections::BTreeSet;
use std::process::Command;
use std::time::Instant;

use camino::Utf8Path;
use serde::Serialize;

use crate::output::PostWriteCommand;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Captured stderr, or the spawn error when the command never started.
    pub message: String,
}

/// Commands that should run after a sync, in execution order.
///
/// A command with `only_if_changed` paths runs only when one of them was
/// written. Identical commands run once. Commands are ordered by priority,
/// then by program and arguments, whatever order the tasks finished in.
pub fn select_commands<'a>(
    commands: &'a [PostWriteCommand],
    written: &[String],
) -> Vec<&'a PostWriteCommand> {
    let written: BTreeSet<&str> = written.iter().map(String::as_str).collect();
    let mut selected: Vec<&PostWriteCommand> = Vec::new();

    for command in commands {
        let triggered = command.only_if_changed.is_empty()
            || command
                .only_if_changed
                .iter()
                .any(|path| written.contains(path.as_str()));

        if !triggered {
            continue;
        }

        let duplicate = selected.iter().any(|other| {
            other.command == command.command
                && other.args == command.args
                && other.working_directory == command.working_directory
        });
        if !duplicate {
            selected.push(command);
        }
    }

    selected.sort_by(|a, b| {
        (a.priority, &a.command, &a.args, &a.working_directory)
            .cmp(&(b.priority, &b.command, &b.args, &b.working_directory))
    });
    selected
}

fn display(command: &PostWriteCommand) -> String {
    std::iter::once(command.command.as_str())
        .chain(command.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs the selected commands one by one inside the package directory.
///
/// A failing command does not stop the ones after it.
pub fn run_post_write_commands(
    package_directory: &Utf8Path,
    commands: &[PostWriteCommand],
    written: &[String],
) -> Vec<CommandOutcome> {
    select_commands(commands, written)
        .into_iter()
        .map(|command| {
            let s = Instant::now();
            let cwd = match &command.working_directory {
                Some(dir) => package_directory.join(dir),
                None => package_directory.to_owned(),
            };
            let shown = display(command);

            let outcome = match Command::new(&command.command)
                .args(&command.args)
                .current_dir(&cwd)
                .output()
            {
                Ok(output) => CommandOutcome {
                    command: shown,
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                },
                Err(err) => CommandOutcome {
                    command: shown,
                    success: false,
                    exit_code: None,
                    message: err.to_string(),
                },
            };

            if outcome.success {
                tracing::info!(
                    "Ran '{}' {}",
                    outcome.command,
                    crate::utils::as_overhead(s)
                );
            } else {
                tracing::warn!(command = %outcome.command, "post-write command failed: {}", outcome.message);
            }

            outcome
        })
        .collect()
}
