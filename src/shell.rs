//! Ties the environment, job registry, and job control together into the
//! single object the executor and built-ins operate on — the core's
//! external-interface surface from the overview (last exit code, last
//! background pid, the exit flags, and job registry access).

use crate::env::Environment;
use crate::job::JobRegistry;
use crate::job_control::JobControl;

pub struct Shell {
    pub env: Environment,
    pub jobs: JobRegistry,
    pub job_control: JobControl,
    pub last_exit_code: i32,
    pub last_background_pid: Option<i32>,
    pub should_exit: bool,
    pub exit_code: i32,
}

impl Shell {
    pub fn new(job_control: JobControl) -> Self {
        Shell {
            env: Environment::new(),
            jobs: JobRegistry::new(),
            job_control,
            last_exit_code: 0,
            last_background_pid: None,
            should_exit: false,
            exit_code: 0,
        }
    }

    pub fn request_exit(&mut self, code: i32) {
        self.should_exit = true;
        self.exit_code = code;
    }
}
