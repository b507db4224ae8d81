//! Commands that run in the shell process itself instead of being exec'd.
//!
//! Each builtin is an [`argh`] `FromArgs` struct, parsed the same way the
//! top-level CLI parses its own arguments. Builtins are dispatched through
//! two free functions rather than a boxed-command factory: a standalone
//! builtin runs in the shell's own process and never needs to cross a
//! trait-object IO boundary.

use std::fs;
use std::path::PathBuf;

use argh::{EarlyExit, FromArgs};

use crate::job::JobId;
use crate::job_control::signal_from_name;
use crate::shell::Shell;

pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "pwd" | "cd" | "echo" | "exit" | "jobs" | "fg" | "bg" | "kill" | "export" | "unset"
    )
}

pub fn execute_builtin(shell: &mut Shell, words: &[String]) -> i32 {
    let name = words[0].as_str();
    let args: Vec<&str> = words[1..].iter().map(String::as_str).collect();
    match name {
        "pwd" => parse::<Pwd>(name, &args).map_or_else(|code| code, |cmd| cmd.run(shell)),
        "cd" => parse::<Cd>(name, &args).map_or_else(|code| code, |cmd| cmd.run(shell)),
        "echo" => parse::<Echo>(name, &args).map_or_else(|code| code, |cmd| cmd.run(shell)),
        "exit" => parse::<Exit>(name, &args).map_or_else(|code| code, |cmd| cmd.run(shell)),
        "jobs" => parse::<Jobs>(name, &args).map_or_else(|code| code, |cmd| cmd.run(shell)),
        "fg" => parse::<Fg>(name, &args).map_or_else(|code| code, |cmd| cmd.run(shell)),
        "bg" => parse::<Bg>(name, &args).map_or_else(|code| code, |cmd| cmd.run(shell)),
        "kill" => parse::<Kill>(name, &args).map_or_else(|code| code, |cmd| cmd.run(shell)),
        "export" => parse::<Export>(name, &args).map_or_else(|code| code, |cmd| cmd.run(shell)),
        "unset" => parse::<Unset>(name, &args).map_or_else(|code| code, |cmd| cmd.run(shell)),
        _ => 127,
    }
}

fn parse<T: FromArgs>(name: &str, args: &[&str]) -> Result<T, i32> {
    match T::from_args(&[name], args) {
        Ok(cmd) => Ok(cmd),
        Err(EarlyExit { output, status }) => match status {
            Ok(()) => {
                println!("{output}");
                Err(0)
            }
            Err(()) => {
                eprintln!("{output}");
                Err(1)
            }
        },
    }
}

/// Resolve a `fg`/`bg`/`kill` job argument (`%3`, `3`, or omitted for "most
/// recent") to a [`JobId`].
fn resolve_job(shell: &Shell, spec: Option<&str>) -> Result<JobId, String> {
    match spec {
        Some(s) => {
            let digits = s.strip_prefix('%').unwrap_or(s);
            let n: u32 = digits.parse().map_err(|_| format!("{s}: no such job"))?;
            let id = JobId(n);
            if shell.jobs.get(id).is_some() { Ok(id) } else { Err(format!("{s}: no such job")) }
        }
        None => shell.jobs.current().ok_or_else(|| "no current job".to_string()),
    }
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {}

impl Pwd {
    fn run(self, shell: &mut Shell) -> i32 {
        println!("{}", shell.env.current_dir.to_string_lossy());
        0
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// Defaults to $HOME when no target is given.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to, absolute or relative to the current directory
    pub target: Option<String>,
}

impl Cd {
    fn run(self, shell: &mut Shell) -> i32 {
        let target = match &self.target {
            Some(t) if !t.is_empty() => PathBuf::from(t),
            _ => match shell.env.get_var("HOME") {
                Some(home) => PathBuf::from(home),
                None => {
                    eprintln!("cd: no target and HOME not set");
                    return 1;
                }
            },
        };

        let new_dir = if target.is_absolute() { target } else { shell.env.current_dir.join(target) };

        let canonical = match fs::canonicalize(&new_dir) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("cd: {}: {e}", new_dir.display());
                return 1;
            }
        };

        if let Err(e) = std::env::set_current_dir(&canonical) {
            eprintln!("cd: {}: {e}", canonical.display());
            return 1;
        }
        shell.env.current_dir = canonical;
        0
    }
}

#[derive(FromArgs)]
/// Set a shell variable, as `NAME=value`.
pub struct Export {
    #[argh(positional)]
    /// `NAME=value` to set, or a bare `NAME` to export it unchanged
    pub assignment: String,
}

impl Export {
    fn run(self, shell: &mut Shell) -> i32 {
        match self.assignment.split_once('=') {
            Some((key, val)) => shell.env.set_var(key, val),
            None if shell.env.get_var(&self.assignment).is_none() => {
                shell.env.set_var(self.assignment, "");
            }
            None => {}
        }
        0
    }
}

#[derive(FromArgs)]
/// Remove a variable from the shell's environment.
pub struct Unset {
    #[argh(positional)]
    /// name of the variable to remove
    pub name: String,
}

impl Unset {
    fn run(self, shell: &mut Shell) -> i32 {
        shell.env.unset_var(&self.name);
        0
    }
}

#[derive(FromArgs)]
/// Write the arguments to standard output, separated by spaces.
pub struct Echo {
    #[argh(switch, short = 'n')]
    /// do not print the trailing newline
    pub no_newline: bool,

    #[argh(positional, greedy)]
    /// values to print as-is, separated by spaces
    pub args: Vec<String>,
}

impl Echo {
    fn run(self, _shell: &mut Shell) -> i32 {
        let s = self.args.join(" ");
        if self.no_newline { print!("{s}") } else { println!("{s}") }
        0
    }
}

#[derive(FromArgs)]
/// Request that the shell exit, optionally with a status code.
pub struct Exit {
    #[argh(positional)]
    /// exit status; defaults to the status of the last command
    pub code: Option<i32>,
}

impl Exit {
    fn run(self, shell: &mut Shell) -> i32 {
        let code = self.code.unwrap_or(shell.last_exit_code);
        shell.request_exit(code);
        code
    }
}

#[derive(FromArgs)]
/// List jobs known to the shell.
pub struct Jobs {}

impl Jobs {
    fn run(self, shell: &mut Shell) -> i32 {
        for job in shell.jobs.iter() {
            let marker = shell.jobs.marker_for(job.id);
            println!("[{}]{} {}\t{}", job.id, marker, job.state_name(), job.command_text);
        }
        0
    }
}

#[derive(FromArgs)]
/// Resume a stopped or backgrounded job in the foreground.
pub struct Fg {
    #[argh(positional)]
    /// job id, as `%N` or `N`; defaults to the most recent job
    pub job: Option<String>,
}

impl Fg {
    fn run(self, shell: &mut Shell) -> i32 {
        let id = match resolve_job(shell, self.job.as_deref()) {
            Ok(id) => id,
            Err(msg) => {
                eprintln!("fg: {msg}");
                return 1;
            }
        };
        shell.jobs.touch(id);
        match shell.job_control.foreground(&mut shell.jobs, id, true) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("fg: {e}");
                1
            }
        }
    }
}

#[derive(FromArgs)]
/// Resume a stopped job in the background.
pub struct Bg {
    #[argh(positional)]
    /// job id, as `%N` or `N`; defaults to the most recent job
    pub job: Option<String>,
}

impl Bg {
    fn run(self, shell: &mut Shell) -> i32 {
        let id = match resolve_job(shell, self.job.as_deref()) {
            Ok(id) => id,
            Err(msg) => {
                eprintln!("bg: {msg}");
                return 1;
            }
        };
        shell.jobs.touch(id);
        match shell.job_control.background(&mut shell.jobs, id) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("bg: {e}");
                1
            }
        }
    }
}

#[derive(FromArgs)]
/// Send a signal to a job.
pub struct Kill {
    #[argh(option, short = 's', default = "String::from(\"TERM\")")]
    /// signal name or number, default TERM
    pub signal: String,

    #[argh(positional)]
    /// job id, as `%N` or `N`
    pub job: Option<String>,
}

impl Kill {
    fn run(self, shell: &mut Shell) -> i32 {
        let id = match resolve_job(shell, self.job.as_deref()) {
            Ok(id) => id,
            Err(msg) => {
                eprintln!("kill: {msg}");
                return 1;
            }
        };
        let sig = match signal_from_name(&self.signal) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("kill: {e}");
                return 1;
            }
        };
        match shell.job_control.kill(&shell.jobs, id, sig) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("kill: {e}");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_control::JobControl;

    fn test_shell() -> Shell {
        Shell::new(JobControl::new().expect("job control init"))
    }

    #[test]
    fn pwd_prints_current_dir() {
        let mut shell = test_shell();
        let cwd = shell.env.current_dir.clone();
        assert_eq!(execute_builtin(&mut shell, &["pwd".into()]), 0);
        assert_eq!(shell.env.current_dir, cwd);
    }

    #[test]
    fn exit_sets_shell_flags() {
        let mut shell = test_shell();
        execute_builtin(&mut shell, &["exit".into(), "7".into()]);
        assert!(shell.should_exit);
        assert_eq!(shell.exit_code, 7);
    }

    #[test]
    fn unknown_job_reference_is_an_error() {
        let mut shell = test_shell();
        assert_eq!(execute_builtin(&mut shell, &["fg".into(), "%9".into()]), 1);
    }

    #[test]
    fn is_builtin_recognizes_known_names() {
        assert!(is_builtin("cd"));
        assert!(is_builtin("jobs"));
        assert!(!is_builtin("ls"));
    }

    #[test]
    fn export_sets_a_variable() {
        let mut shell = test_shell();
        execute_builtin(&mut shell, &["export".into(), "FOO=bar".into()]);
        assert_eq!(shell.env.get_var("FOO"), Some("bar".to_string()));
    }

    #[test]
    fn unset_removes_a_variable() {
        let mut shell = test_shell();
        shell.env.set_var("FOO", "bar");
        execute_builtin(&mut shell, &["unset".into(), "FOO".into()]);
        assert_eq!(shell.env.get_var("FOO"), None);
    }
}
