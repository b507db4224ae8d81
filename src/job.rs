//! In-memory registry of process groups spawned by the executor.
//!
//! A slot-indexed arena keyed by a stable [`JobId`] handle, with a separate
//! recency-ordered list used to reconstruct the `+`/`-` job markers a plain
//! insertion-ordered list can't give you once jobs are removed out of order.

use nix::unistd::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u32);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Stopped,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Process {
    pub pid: Pid,
    pub state: ProcessState,
    pub exit_status: Option<i32>,
    pub command_text: String,
}

impl Process {
    pub fn new(pid: Pid, command_text: String) -> Self {
        Process { pid, state: ProcessState::Running, exit_status: None, command_text }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Foreground,
    Background,
    Stopped,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub pgid: Pid,
    pub state: JobState,
    pub processes: Vec<Process>,
    pub command_text: String,
    pub notified: bool,
}

impl Job {
    /// True once every member process has completed.
    pub fn is_completed(&self) -> bool {
        self.processes.iter().all(|p| p.state == ProcessState::Completed)
    }

    pub fn has_stopped_member(&self) -> bool {
        self.processes.iter().any(|p| p.state == ProcessState::Stopped)
    }

    pub fn has_running_member(&self) -> bool {
        self.processes.iter().any(|p| p.state == ProcessState::Running)
    }

    /// The representative exit code of the job: the last process's status,
    /// reduced to an exit code (signal deaths map to 128+signum upstream).
    pub fn last_exit_code(&self) -> Option<i32> {
        self.processes.last().and_then(|p| p.exit_status)
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            JobState::Completed => "Done",
            JobState::Stopped => "Stopped",
            JobState::Foreground | JobState::Background => "Running",
        }
    }
}

/// Slot-indexed arena of jobs, keyed by a stable, never-reused [`JobId`].
#[derive(Debug, Default)]
pub struct JobRegistry {
    slots: Vec<Option<Job>>,
    next_id: u32,
    /// Order in which jobs are still "recent"; front is most recent (`+`).
    recency: Vec<JobId>,
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry { slots: Vec::new(), next_id: 1, recency: Vec::new() }
    }

    fn index_of(&self, id: JobId) -> Option<usize> {
        self.slots.iter().position(|slot| matches!(slot, Some(j) if j.id == id))
    }

    pub fn insert(&mut self, pgid: Pid, state: JobState, processes: Vec<Process>, command_text: String) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        let job = Job { id, pgid, state, processes, command_text, notified: false };
        self.slots.push(Some(job));
        self.recency.insert(0, id);
        id
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.index_of(id).and_then(|i| self.slots[i].as_ref())
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        match self.index_of(id) {
            Some(i) => self.slots[i].as_mut(),
            None => None,
        }
    }

    pub fn find_by_pid(&self, pid: Pid) -> Option<JobId> {
        self.slots
            .iter()
            .flatten()
            .find(|j| j.processes.iter().any(|p| p.pid == pid))
            .map(|j| j.id)
    }

    pub fn find_by_pgid(&self, pgid: Pid) -> Option<JobId> {
        self.slots.iter().flatten().find(|j| j.pgid == pgid).map(|j| j.id)
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let idx = self.index_of(id)?;
        let job = self.slots[idx].take();
        self.recency.retain(|&j| j != id);
        job
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.slots.iter_mut().flatten()
    }

    /// Any job currently in the `Foreground` state, if there is one.
    pub fn foreground(&self) -> Option<&Job> {
        self.iter().find(|j| j.state == JobState::Foreground)
    }

    /// `+` and `-` markers, most-recent and next-most-recent respectively.
    pub fn marker_for(&self, id: JobId) -> &'static str {
        match self.recency.iter().position(|&j| j == id) {
            Some(0) => "+",
            Some(1) => "-",
            _ => " ",
        }
    }

    /// Move a job to the front of the recency order (it was just referenced).
    pub fn touch(&mut self, id: JobId) {
        self.recency.retain(|&j| j != id);
        self.recency.insert(0, id);
    }

    /// The job marked `+`: the one `fg`/`bg`/`kill` act on when given no
    /// argument.
    pub fn current(&self) -> Option<JobId> {
        self.recency.first().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn ids_are_stable_and_never_reused() {
        let mut reg = JobRegistry::new();
        let a = reg.insert(pid(10), JobState::Background, vec![Process::new(pid(10), "a".into())], "a".into());
        let b = reg.insert(pid(20), JobState::Background, vec![Process::new(pid(20), "b".into())], "b".into());
        assert_ne!(a, b);
        reg.remove(a);
        let c = reg.insert(pid(30), JobState::Background, vec![Process::new(pid(30), "c".into())], "c".into());
        assert_ne!(c, a);
        assert_ne!(c, b);
        assert!(reg.get(a).is_none());
    }

    #[test]
    fn recency_markers_track_insert_order() {
        let mut reg = JobRegistry::new();
        let a = reg.insert(pid(1), JobState::Background, vec![], "a".into());
        let b = reg.insert(pid(2), JobState::Background, vec![], "b".into());
        assert_eq!(reg.marker_for(b), "+");
        assert_eq!(reg.marker_for(a), "-");
        reg.touch(a);
        assert_eq!(reg.marker_for(a), "+");
        assert_eq!(reg.marker_for(b), "-");
    }

    #[test]
    fn current_tracks_the_plus_job() {
        let mut reg = JobRegistry::new();
        let a = reg.insert(pid(1), JobState::Background, vec![], "a".into());
        let b = reg.insert(pid(2), JobState::Background, vec![], "b".into());
        assert_eq!(reg.current(), Some(b));
        reg.touch(a);
        assert_eq!(reg.current(), Some(a));
    }

    #[test]
    fn find_by_pid_locates_owning_job() {
        let mut reg = JobRegistry::new();
        let id = reg.insert(pid(5), JobState::Background, vec![Process::new(pid(5), "x".into())], "x".into());
        assert_eq!(reg.find_by_pid(pid(5)), Some(id));
        assert_eq!(reg.find_by_pid(pid(6)), None);
    }
}
