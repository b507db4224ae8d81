//! Terminal ownership, signal configuration, and job status reconciliation.
//!
//! The SIGCHLD handler only writes one byte to a non-blocking self-pipe
//! (calling straight into reconciliation from the handler is not
//! async-signal-safe); the main loop drains that pipe and runs
//! reconciliation synchronously.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use log::{debug, trace, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::termios::{self, SetArg, Termios};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};

use crate::error::JobControlError;
use crate::job::{Job, JobId, JobRegistry, JobState, Process, ProcessState};

static SIGCHLD_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigchld(_signum: i32) {
    let fd = SIGCHLD_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = unistd::write(borrowed, &[0u8]);
    }
}

fn stdin_fd() -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(0) }
}

pub struct JobControl {
    pub shell_pgid: Pid,
    pub is_interactive: bool,
    saved_termios: Option<Termios>,
    sigchld_read: RawFd,
}

impl JobControl {
    /// Claim the controlling terminal (if stdin is one), set up signal
    /// dispositions, and install the SIGCHLD self-pipe.
    pub fn new() -> Result<Self, JobControlError> {
        let is_interactive = unistd::isatty(stdin_fd()).unwrap_or(false);

        if is_interactive {
            // Ignore the job-control signals that would otherwise stop or
            // kill the shell itself when a foreground child is signalled.
            for sig in [
                Signal::SIGINT,
                Signal::SIGQUIT,
                Signal::SIGTSTP,
                Signal::SIGTTIN,
                Signal::SIGTTOU,
            ] {
                unsafe { signal::signal(sig, SigHandler::SigIgn) }
                    .map_err(JobControlError::Terminal)?;
            }

            // Wait until we are the foreground process group (we may have
            // been started in the background of a job-control-unaware
            // parent).
            loop {
                let owner = unistd::tcgetpgrp(stdin_fd()).map_err(JobControlError::Terminal)?;
                let shell_pgid = unistd::getpgrp();
                if owner == shell_pgid {
                    break;
                }
                signal::kill(Pid::from_raw(-shell_pgid.as_raw()), Signal::SIGTTIN)
                    .map_err(JobControlError::Terminal)?;
            }

            let shell_pgid = unistd::getpid();
            unistd::setpgid(shell_pgid, shell_pgid).map_err(JobControlError::Terminal)?;
            unistd::tcsetpgrp(stdin_fd(), shell_pgid).map_err(JobControlError::Terminal)?;
            let saved_termios = Some(termios::tcgetattr(stdin_fd()).map_err(JobControlError::Terminal)?);

            let sigchld_read = Self::install_sigchld_pipe()?;
            debug!("shell took terminal ownership, pgid={shell_pgid}");

            Ok(JobControl { shell_pgid, is_interactive, saved_termios, sigchld_read })
        } else {
            Ok(JobControl {
                shell_pgid: unistd::getpgrp(),
                is_interactive: false,
                saved_termios: None,
                sigchld_read: -1,
            })
        }
    }

    fn install_sigchld_pipe() -> Result<RawFd, JobControlError> {
        let (read_fd, write_fd) =
            unistd::pipe().map_err(JobControlError::Terminal)?;
        let flags = nix::fcntl::OFlag::O_NONBLOCK;
        nix::fcntl::fcntl(&read_fd, nix::fcntl::FcntlArg::F_SETFL(flags))
            .map_err(JobControlError::Terminal)?;

        use std::os::fd::IntoRawFd;
        let read_raw = read_fd.into_raw_fd();
        let write_raw = write_fd.into_raw_fd();
        SIGCHLD_PIPE_WRITE.store(write_raw, Ordering::Relaxed);

        let action = SigAction::new(SigHandler::Handler(on_sigchld), SaFlags::SA_RESTART, SigSet::empty());
        unsafe { signal::sigaction(Signal::SIGCHLD, &action) }.map_err(JobControlError::Terminal)?;
        Ok(read_raw)
    }

    /// Drain the self-pipe. Call at the top of the REPL loop and before
    /// every blocking foreground wait.
    pub fn drain_sigchld_pipe(&self) {
        if self.sigchld_read < 0 {
            return;
        }
        let fd = unsafe { BorrowedFd::borrow_raw(self.sigchld_read) };
        let mut buf = [0u8; 64];
        while matches!(unistd::read(fd, &mut buf), Ok(n) if n > 0) {}
    }

    /// Non-blocking reap pass over every non-completed process in every job.
    pub fn reconcile(&self, registry: &mut JobRegistry) {
        let mask = block_job_signals();
        for job in registry.iter_mut() {
            update_job(job);
        }
        restore_signals(mask);
    }

    /// `notify_completed`: print and drop jobs that finished since the last
    /// notification pass.
    pub fn notify_completed(&self, registry: &mut JobRegistry) -> Vec<String> {
        let mut lines = Vec::new();
        let completed: Vec<JobId> = registry
            .iter()
            .filter(|j| j.state == JobState::Completed && !j.notified)
            .map(|j| j.id)
            .collect();
        for id in completed {
            if let Some(job) = registry.get(id) {
                lines.push(format!("[{}]{} Done\t{}", job.id, registry.marker_for(id), job.command_text));
            }
            registry.remove(id);
        }
        lines
    }

    /// Put a job in the foreground and wait for it to complete or stop.
    /// Returns the job's representative exit code.
    pub fn foreground(
        &self,
        registry: &mut JobRegistry,
        id: JobId,
        resume: bool,
    ) -> Result<i32, JobControlError> {
        let pgid = {
            let job = registry.get_mut(id).ok_or_else(|| JobControlError::UnknownJob(id.to_string()))?;
            job.state = JobState::Foreground;
            job.pgid
        };

        if self.is_interactive {
            unistd::tcsetpgrp(stdin_fd(), pgid).map_err(JobControlError::Terminal)?;
        }

        if resume {
            for p in registry.get_mut(id).unwrap().processes.iter_mut() {
                if p.state == ProcessState::Stopped {
                    p.state = ProcessState::Running;
                }
            }
            signal::kill(Pid::from_raw(-pgid.as_raw()), Signal::SIGCONT).ok();
        }

        loop {
            let job = registry.get(id).unwrap();
            if job.is_completed() || (job.has_stopped_member() && !job.has_running_member()) {
                break;
            }
            let mask = block_job_signals();
            let status = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WUNTRACED));
            restore_signals(mask);
            match status {
                Ok(ws) => apply_status(registry, ws),
                Err(nix::Error::ECHILD) => break,
                Err(_) => break,
            }
        }

        if self.is_interactive {
            unistd::tcsetpgrp(stdin_fd(), self.shell_pgid).map_err(JobControlError::Terminal)?;
            if let Some(t) = &self.saved_termios {
                termios::tcsetattr(stdin_fd(), SetArg::TCSADRAIN, t).ok();
            }
        }

        let job = registry.get(id).unwrap();
        let code = job.last_exit_code().unwrap_or(0);
        let stopped = job.state == JobState::Stopped;
        if stopped {
            warn!("[{}] Stopped   {}", job.id, job.command_text);
        }
        Ok(code)
    }

    /// `bg`: resume a stopped job in the background. Does not wait.
    pub fn background(&self, registry: &mut JobRegistry, id: JobId) -> Result<(), JobControlError> {
        let job = registry.get_mut(id).ok_or_else(|| JobControlError::UnknownJob(id.to_string()))?;
        if job.state != JobState::Stopped {
            return Err(JobControlError::NotStopped(id.0 as i32));
        }
        job.state = JobState::Background;
        for p in job.processes.iter_mut() {
            if p.state == ProcessState::Stopped {
                p.state = ProcessState::Running;
            }
        }
        signal::kill(Pid::from_raw(-job.pgid.as_raw()), Signal::SIGCONT).ok();
        Ok(())
    }

    /// Send `sig` to every member of the job's process group.
    pub fn kill(&self, registry: &JobRegistry, id: JobId, sig: Signal) -> Result<(), JobControlError> {
        let job = registry.get(id).ok_or_else(|| JobControlError::UnknownJob(id.to_string()))?;
        signal::kill(Pid::from_raw(-job.pgid.as_raw()), sig).map_err(JobControlError::Terminal)
    }
}

fn apply_status(registry: &mut JobRegistry, status: WaitStatus) {
    let pid = match status.pid() {
        Some(p) => p,
        None => return,
    };
    let Some(id) = registry.find_by_pid(pid) else { return };
    let Some(job) = registry.get_mut(id) else { return };
    let Some(proc) = job.processes.iter_mut().find(|p| p.pid == pid) else { return };

    match status {
        WaitStatus::Exited(_, code) => {
            proc.state = ProcessState::Completed;
            proc.exit_status = Some(code);
        }
        WaitStatus::Signaled(_, sig, _) => {
            proc.state = ProcessState::Completed;
            proc.exit_status = Some(128 + sig as i32);
        }
        WaitStatus::Stopped(..) => {
            proc.state = ProcessState::Stopped;
        }
        WaitStatus::Continued(_) => {
            proc.state = ProcessState::Running;
        }
        _ => {}
    }
    recompute_job_state(job);
}

fn update_job(job: &mut Job) {
    for proc in job.processes.iter_mut() {
        if proc.state == ProcessState::Completed {
            continue;
        }
        match waitpid(proc.pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED)) {
            Ok(WaitStatus::Exited(_, code)) => {
                proc.state = ProcessState::Completed;
                proc.exit_status = Some(code);
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                proc.state = ProcessState::Completed;
                proc.exit_status = Some(128 + sig as i32);
            }
            Ok(WaitStatus::Stopped(..)) => proc.state = ProcessState::Stopped,
            Ok(WaitStatus::Continued(_)) => proc.state = ProcessState::Running,
            Ok(WaitStatus::StillAlive) | Ok(_) => {}
            Err(_) => {}
        }
    }
    recompute_job_state(job);
}

fn recompute_job_state(job: &mut Job) {
    if job.is_completed() {
        job.state = JobState::Completed;
        trace!("job {} completed", job.id);
    } else if !job.has_running_member() && job.has_stopped_member() {
        job.state = JobState::Stopped;
    }
}

/// Block SIGCHLD and the interactive signals for the duration of a job
/// registry mutation, per the race discipline in the job-control design.
fn block_job_signals() -> SigSet {
    let mut set = SigSet::empty();
    for sig in [Signal::SIGCHLD, Signal::SIGINT, Signal::SIGTSTP, Signal::SIGTTOU, Signal::SIGTTIN] {
        set.add(sig);
    }
    let mut old = SigSet::empty();
    let _ = signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut old));
    old
}

fn restore_signals(old: SigSet) {
    let _ = signal::sigprocmask(signal::SigmaskHow::SIG_SETMASK, Some(&old), None);
}

pub fn signal_from_name(name: &str) -> Result<Signal, JobControlError> {
    if let Ok(n) = name.parse::<i32>() {
        return Signal::try_from(n).map_err(|_| JobControlError::UnknownSignal(name.to_string()));
    }
    match name.to_ascii_uppercase().trim_start_matches("SIG") {
        "HUP" => Ok(Signal::SIGHUP),
        "INT" => Ok(Signal::SIGINT),
        "QUIT" => Ok(Signal::SIGQUIT),
        "KILL" => Ok(Signal::SIGKILL),
        "STOP" => Ok(Signal::SIGSTOP),
        "TSTP" => Ok(Signal::SIGTSTP),
        "CONT" => Ok(Signal::SIGCONT),
        "TERM" => Ok(Signal::SIGTERM),
        _ => Err(JobControlError::UnknownSignal(name.to_string())),
    }
}
