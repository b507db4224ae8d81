//! Walks the AST, spawns processes, and wires up pipes and redirections.

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use log::{debug, trace, warn};
use nix::fcntl::{self, OFlag};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::ast::{AstNode, RedirectKind};
use crate::builtin;
use crate::error::ExecError;
use crate::external;
use crate::job::{JobState, Process, ProcessState};
use crate::shell::Shell;

fn stdin_fd() -> std::os::fd::BorrowedFd<'static> {
    unsafe { std::os::fd::BorrowedFd::borrow_raw(0) }
}

/// What a subtree should do about process-group membership and whether it
/// is the sole, self-contained body of an already-forked child.
#[derive(Clone, Copy)]
struct ExecCtx {
    /// `None`: the next process created in this subtree becomes the leader
    /// of a brand-new group. `Some(pgid)`: join that group instead (used
    /// inside pipelines and already-backgrounded subshells).
    group: Option<Pid>,
    foreground: bool,
    /// True only for the single AST node that *is* the entire body of an
    /// already-forked pipeline-stage process: it execs or runs a builtin
    /// and then exits, rather than forking again.
    exec_in_place: bool,
}

/// Evaluate an AST node and return its exit code, updating `last_exit_code`.
pub fn execute(shell: &mut Shell, node: &AstNode) -> i32 {
    let ctx = ExecCtx { group: None, foreground: true, exec_in_place: false };
    let code = execute_inner(shell, node, ctx);
    shell.last_exit_code = code;
    code
}

fn execute_inner(shell: &mut Shell, node: &AstNode, ctx: ExecCtx) -> i32 {
    match node {
        AstNode::Command { words } => exec_command(shell, words, ctx),
        AstNode::Pipeline { .. } => exec_pipeline(shell, node, ctx),
        AstNode::Sequence { left, right } => {
            execute_inner(shell, left, ctx);
            execute_inner(shell, right, ctx)
        }
        AstNode::And { left, right } => {
            let code = execute_inner(shell, left, ctx);
            if code == 0 { execute_inner(shell, right, ctx) } else { code }
        }
        AstNode::Or { left, right } => {
            let code = execute_inner(shell, left, ctx);
            if code != 0 { execute_inner(shell, right, ctx) } else { 0 }
        }
        AstNode::Background { inner } => exec_background(shell, inner, ctx),
        AstNode::Subshell { inner } => exec_subshell(shell, inner, ctx),
        AstNode::Redirect { .. } => {
            let (chain, base) = collect_redirect_chain(node);
            exec_with_redirects(shell, base, &chain, ctx)
        }
    }
}

fn collect_redirect_chain(mut node: &AstNode) -> (Vec<(RedirectKind, String)>, &AstNode) {
    let mut chain = Vec::new();
    while let AstNode::Redirect { target, kind, path } = node {
        chain.push((*kind, path.clone()));
        node = target;
    }
    chain.reverse(); // chronological: first-typed .. last-typed
    (chain, node)
}

fn target_fd(kind: RedirectKind) -> i32 {
    match kind {
        RedirectKind::In => 0,
        RedirectKind::Out | RedirectKind::OutAppend => 1,
        RedirectKind::Err | RedirectKind::ErrAppend => 2,
        RedirectKind::Both | RedirectKind::BothAppend => 1,
    }
}

fn open_for_redirect(kind: RedirectKind, path: &str) -> nix::Result<i32> {
    let flags = match kind {
        RedirectKind::In => OFlag::O_RDONLY,
        RedirectKind::Out | RedirectKind::Err | RedirectKind::Both => {
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC
        }
        RedirectKind::OutAppend | RedirectKind::ErrAppend | RedirectKind::BothAppend => {
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND
        }
    };
    let mode = Mode::from_bits_truncate(0o644);
    fcntl::open(path, flags, mode)
}

/// Apply a redirect chain (last-typed wins per target fd), run `base`, and
/// restore the original fds before returning.
fn exec_with_redirects(shell: &mut Shell, base: &AstNode, chain: &[(RedirectKind, String)], ctx: ExecCtx) -> i32 {
    let mut saved: HashMap<i32, i32> = HashMap::new();
    for (kind, path) in chain {
        let opened = match open_for_redirect(*kind, path) {
            Ok(fd) => fd,
            Err(e) => {
                let err = ExecError::RedirectOpen { path: path.clone(), source: std::io::Error::from(e) };
                eprintln!("{err}");
                restore_fds(&saved);
                if ctx.exec_in_place {
                    std::process::exit(1);
                }
                return 1;
            }
        };
        // `&>`/`&>>` share this single fd between stdout and stderr instead
        // of opening the path twice, which would give each stream its own
        // file description and offset and let one clobber the other.
        if matches!(kind, RedirectKind::Both | RedirectKind::BothAppend) {
            for fd in [1, 2] {
                saved.entry(fd).or_insert_with(|| unistd::dup(fd).unwrap_or(-1));
                let _ = unistd::dup2(opened, fd);
            }
            let _ = unistd::close(opened);
            continue;
        }
        let fd = target_fd(*kind);
        saved.entry(fd).or_insert_with(|| unistd::dup(fd).unwrap_or(-1));
        let _ = unistd::dup2(opened, fd);
        let _ = unistd::close(opened);
    }
    let code = execute_inner(shell, base, ctx);
    if !ctx.exec_in_place {
        restore_fds(&saved);
    }
    code
}

fn restore_fds(saved: &HashMap<i32, i32>) {
    for (&target, &original) in saved {
        if original >= 0 {
            let _ = unistd::dup2(original, target);
            let _ = unistd::close(original);
        }
    }
}

fn child_setup(group: Option<Pid>) {
    let me = unistd::getpid();
    let _ = unistd::setpgid(me, group.unwrap_or(Pid::from_raw(0)));
    for sig in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTSTP, Signal::SIGTTIN, Signal::SIGTTOU] {
        unsafe { let _ = signal::signal(sig, SigHandler::SigDfl); }
    }
}

fn exec_external_or_exit(shell: &Shell, words: &[String]) -> ! {
    let path_var = shell.env.get_var("PATH").unwrap_or_default();
    match external::find_command_path(OsStr::new(&path_var), Path::new(&words[0])) {
        Some(resolved) => {
            let program = CString::new(resolved.as_os_str().as_bytes()).unwrap();
            let argv: Vec<CString> = words.iter().map(|w| CString::new(w.as_str()).unwrap_or_default()).collect();
            let _ = unistd::execv(&program, &argv);
            eprintln!("{}", ExecError::CommandNotFound { program: words[0].clone() });
            std::process::exit(127);
        }
        None => {
            eprintln!("{}", ExecError::CommandNotFound { program: words[0].clone() });
            std::process::exit(127);
        }
    }
}

fn exec_command(shell: &mut Shell, words: &[String], ctx: ExecCtx) -> i32 {
    if words.is_empty() {
        return 1;
    }

    if ctx.exec_in_place {
        if builtin::is_builtin(&words[0]) {
            let code = builtin::execute_builtin(shell, words);
            std::process::exit(code);
        }
        exec_external_or_exit(shell, words);
    }

    if builtin::is_builtin(&words[0]) {
        return builtin::execute_builtin(shell, words);
    }

    match unsafe { unistd::fork() } {
        Ok(ForkResult::Child) => {
            child_setup(ctx.group);
            exec_external_or_exit(shell, words);
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = unistd::setpgid(child, ctx.group.unwrap_or(child));
            let processes = vec![Process::new(child, words.join(" "))];
            finish_single_job(shell, child, processes, ctx)
        }
        Err(e) => {
            eprintln!("{}", ExecError::Fork(std::io::Error::from(e)));
            1
        }
    }
}

fn exec_subshell(shell: &mut Shell, inner: &AstNode, ctx: ExecCtx) -> i32 {
    if ctx.exec_in_place {
        let inner_ctx = ExecCtx { group: Some(unistd::getpgrp()), foreground: true, exec_in_place: false };
        let code = execute_inner(shell, inner, inner_ctx);
        std::process::exit(code);
    }

    match unsafe { unistd::fork() } {
        Ok(ForkResult::Child) => {
            child_setup(ctx.group);
            let pgid = unistd::getpgrp();
            let inner_ctx = ExecCtx { group: Some(pgid), foreground: true, exec_in_place: false };
            let code = execute_inner(shell, inner, inner_ctx);
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = unistd::setpgid(child, ctx.group.unwrap_or(child));
            let processes = vec![Process::new(child, inner.render())];
            finish_single_job(shell, child, processes, ctx)
        }
        Err(e) => {
            eprintln!("{}", ExecError::Fork(std::io::Error::from(e)));
            1
        }
    }
}

fn exec_background(shell: &mut Shell, inner: &AstNode, ctx: ExecCtx) -> i32 {
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Child) => {
            child_setup(ctx.group);
            let pgid = unistd::getpgrp();
            // A plain command is the whole body of this already-forked
            // child: run it in place instead of handing it to exec_command
            // with exec_in_place: false, which would fork it again and
            // leave the grandchild untracked by the job's process list.
            let exec_in_place = matches!(inner, AstNode::Command { .. });
            let inner_ctx = ExecCtx { group: Some(pgid), foreground: false, exec_in_place };
            let code = execute_inner(shell, inner, inner_ctx);
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = unistd::setpgid(child, ctx.group.unwrap_or(child));
            shell.last_background_pid = Some(child.as_raw());
            let text = inner.render();
            let id = shell.jobs.insert(child, JobState::Background, vec![Process::new(child, text.clone())], text);
            println!("[{}] {}", id, child.as_raw());
            debug!("job {id} backgrounded, pgid={child}");
            0
        }
        Err(e) => {
            eprintln!("{}", ExecError::Fork(std::io::Error::from(e)));
            1
        }
    }
}

fn exec_pipeline(shell: &mut Shell, node: &AstNode, ctx: ExecCtx) -> i32 {
    let (stages, flags) = flatten_pipeline(node);
    let n = stages.len();
    let mut pipe_fds: Vec<(i32, i32)> = Vec::with_capacity(n.saturating_sub(1));
    for _ in 0..n.saturating_sub(1) {
        match unistd::pipe() {
            Ok((r, w)) => {
                use std::os::fd::IntoRawFd;
                pipe_fds.push((r.into_raw_fd(), w.into_raw_fd()));
            }
            Err(e) => {
                eprintln!("{}", ExecError::Pipe(std::io::Error::from(e)));
                return 1;
            }
        }
    }

    let mut processes = Vec::with_capacity(n);
    let mut leader_pgid: Option<Pid> = ctx.group;

    for (i, stage) in stages.iter().enumerate() {
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                child_setup(leader_pgid);
                if i > 0 {
                    let _ = unistd::dup2(pipe_fds[i - 1].0, 0);
                }
                if i < n - 1 {
                    let _ = unistd::dup2(pipe_fds[i].1, 1);
                    if flags[i] {
                        let _ = unistd::dup2(pipe_fds[i].1, 2);
                    }
                }
                for &(r, w) in &pipe_fds {
                    let _ = unistd::close(r);
                    let _ = unistd::close(w);
                }
                let stage_ctx = ExecCtx { group: Some(unistd::getpgrp()), foreground: ctx.foreground, exec_in_place: true };
                let code = execute_inner(shell, stage, stage_ctx);
                std::process::exit(code);
            }
            Ok(ForkResult::Parent { child }) => {
                let target = leader_pgid.unwrap_or(child);
                let _ = unistd::setpgid(child, target);
                if leader_pgid.is_none() {
                    leader_pgid = Some(child);
                }
                processes.push(Process::new(child, stage.render()));
            }
            Err(e) => {
                eprintln!("{}", ExecError::Fork(std::io::Error::from(e)));
                return 1;
            }
        }
    }

    for &(r, w) in &pipe_fds {
        let _ = unistd::close(r);
        let _ = unistd::close(w);
    }

    let pgid = leader_pgid.expect("at least one stage always forks");
    finish_job(shell, pgid, processes, node.render(), ctx)
}

fn flatten_pipeline(node: &AstNode) -> (Vec<&AstNode>, Vec<bool>) {
    match node {
        AstNode::Pipeline { left, right, forward_stderr } => {
            let (mut stages, mut flags) = flatten_pipeline(left);
            stages.push(right);
            flags.push(*forward_stderr);
            (stages, flags)
        }
        other => (vec![other], Vec::new()),
    }
}

fn finish_single_job(shell: &mut Shell, pid: Pid, processes: Vec<Process>, ctx: ExecCtx) -> i32 {
    let text = processes[0].command_text.clone();
    finish_job(shell, pid, processes, text, ctx)
}

/// Wait for every process in the group, create a `Stopped` job if any of
/// them stopped, and reclaim the terminal on the way out.
fn finish_job(shell: &mut Shell, pgid: Pid, mut processes: Vec<Process>, command_text: String, ctx: ExecCtx) -> i32 {
    if ctx.foreground && shell.job_control.is_interactive {
        let _ = unistd::tcsetpgrp(stdin_fd(), pgid);
    }

    loop {
        if processes.iter().all(|p| p.state == ProcessState::Completed) {
            break;
        }
        if processes.iter().any(|p| p.state == ProcessState::Stopped)
            && !processes.iter().any(|p| p.state == ProcessState::Running)
        {
            break;
        }
        match waitpid(Pid::from_raw(-pgid.as_raw()), Some(WaitPidFlag::WUNTRACED)) {
            Ok(status) => apply_status(&mut processes, status),
            Err(nix::Error::ECHILD) => break,
            Err(e) => {
                warn!("{}", ExecError::Wait(e));
                break;
            }
        }
    }

    if ctx.foreground && shell.job_control.is_interactive {
        let _ = unistd::tcsetpgrp(stdin_fd(), shell.job_control.shell_pgid);
    }

    let stopped = processes.iter().any(|p| p.state == ProcessState::Stopped);
    let code = processes.last().and_then(|p| p.exit_status).unwrap_or(0);

    if stopped {
        let id = shell.jobs.insert(pgid, JobState::Stopped, processes, command_text.clone());
        warn!("[{id}] Stopped   {command_text}");
        println!("\n[{id}] Stopped   {command_text}");
        0
    } else {
        trace!("pgid {pgid} finished with code {code}");
        code
    }
}

fn apply_status(processes: &mut [Process], status: WaitStatus) {
    let Some(pid) = status.pid() else { return };
    let Some(proc) = processes.iter_mut().find(|p| p.pid == pid) else { return };
    match status {
        WaitStatus::Exited(_, code) => {
            proc.state = ProcessState::Completed;
            proc.exit_status = Some(code);
        }
        WaitStatus::Signaled(_, sig, _) => {
            proc.state = ProcessState::Completed;
            proc.exit_status = Some(128 + sig as i32);
        }
        WaitStatus::Stopped(..) => proc.state = ProcessState::Stopped,
        WaitStatus::Continued(_) => proc.state = ProcessState::Running,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_control::JobControl;
    use crate::parser;

    fn noninteractive_shell() -> Shell {
        // Safe in tests: stdin under a test harness is never the controlling
        // terminal, so JobControl::new() takes the non-interactive branch.
        Shell::new(JobControl::new().expect("job control init"))
    }

    #[test]
    #[cfg(unix)]
    fn runs_true_and_false() {
        let mut shell = noninteractive_shell();
        let ast = parser::parse("true").unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 0);
        let ast = parser::parse("false").unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 1);
    }

    #[test]
    #[cfg(unix)]
    fn sequence_returns_right_code() {
        let mut shell = noninteractive_shell();
        let ast = parser::parse("false ; true").unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 0);
    }

    #[test]
    #[cfg(unix)]
    fn and_short_circuits() {
        let mut shell = noninteractive_shell();
        let ast = parser::parse("false && true").unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 1);
    }

    #[test]
    #[cfg(unix)]
    fn or_short_circuits() {
        let mut shell = noninteractive_shell();
        let ast = parser::parse("true || false").unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 0);
    }

    #[test]
    #[cfg(unix)]
    fn background_reports_zero_and_records_pid() {
        let mut shell = noninteractive_shell();
        let ast = parser::parse("true &").unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 0);
        assert!(shell.last_background_pid.is_some());
    }

    #[test]
    #[cfg(unix)]
    fn pipeline_plumbs_stdout_to_stdin() {
        let mut shell = noninteractive_shell();
        let dir = std::env::temp_dir().join(format!("posh_pipe_test_{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let out = dir.join("out.txt");
        let line = format!("echo hello | cat > {}", out.display());
        let ast = parser::parse(&line).unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 0);
        let contents = std::fs::read_to_string(&out).unwrap();
        assert_eq!(contents.trim(), "hello");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    #[cfg(unix)]
    fn redirect_out_then_append_overwrites_then_appends() {
        let mut shell = noninteractive_shell();
        let dir = std::env::temp_dir().join(format!("posh_redir_test_{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let out = dir.join("out.txt");

        let ast = parser::parse(&format!("echo one > {}", out.display())).unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 0);
        let ast = parser::parse(&format!("echo two >> {}", out.display())).unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 0);

        let contents = std::fs::read_to_string(&out).unwrap();
        assert_eq!(contents, "one\ntwo\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    #[cfg(unix)]
    fn combined_redirect_captures_stdout_and_stderr() {
        let mut shell = noninteractive_shell();
        let dir = std::env::temp_dir().join(format!("posh_both_redir_{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let script = dir.join("both.sh");
        let out = dir.join("out.txt");
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(&script, "#!/bin/sh\necho to-out\necho to-err 1>&2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let line = format!("sh {} &> {}", script.display(), out.display());
        let ast = parser::parse(&line).unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 0);

        let contents = std::fs::read_to_string(&out).unwrap();
        assert!(contents.contains("to-out"), "missing stdout line: {contents:?}");
        assert!(contents.contains("to-err"), "missing stderr line: {contents:?}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    #[cfg(unix)]
    fn last_typed_redirect_wins_for_same_fd() {
        let mut shell = noninteractive_shell();
        let dir = std::env::temp_dir().join(format!("posh_redir_wins_{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let first = dir.join("first.txt");
        let second = dir.join("second.txt");

        let line = format!("echo hi > {} > {}", first.display(), second.display());
        let ast = parser::parse(&line).unwrap().unwrap();
        assert_eq!(execute(&mut shell, &ast), 0);

        assert_eq!(std::fs::read_to_string(&second).unwrap().trim(), "hi");
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
