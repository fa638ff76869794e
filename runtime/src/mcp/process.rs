//! Process-tree termination
//!
//! A spawned server may start its own children (npm wrappers, browsers).
//! Closing the session only ends the root, so after every stdio close the
//! whole tree is walked down with an escalating state machine:
//!
//! ```text
//! Grace ──(survivors)──► Terminate ──(survivors)──► Kill ──► Done
//!   │ no signal             │ SIGTERM all             │ SIGKILL all
//!   └────(all gone)─────────┴────────(all gone)───────┴──► Exited
//! ```
//!
//! Descendants are re-discovered before every stage. A process whose parent
//! died is re-parented, so discovery walks from every pid ever seen, not only
//! the root.

use std::collections::BTreeSet;
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, System};

/// Timing for each escalation stage
#[derive(Debug, Clone, Copy)]
pub struct TerminationPlan {
    /// Wait for a voluntary exit before signalling
    pub grace: Duration,
    /// Wait after SIGTERM
    pub term_wait: Duration,
    /// Wait after SIGKILL
    pub kill_wait: Duration,
    /// Liveness poll interval
    pub poll: Duration,
}

impl Default for TerminationPlan {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(500),
            term_wait: Duration::from_secs(2),
            kill_wait: Duration::from_secs(1),
            poll: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Grace,
    Terminate,
    Kill,
    Done,
}

/// How the tree ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Everything exited without any signal
    ExitedCleanly,
    /// SIGTERM was needed
    Terminated,
    /// SIGKILL was needed
    Killed,
    /// These pids were still alive after SIGKILL
    Survivors(Vec<u32>),
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Snapshot of the process table
struct ProcessTable {
    system: System,
}

impl ProcessTable {
    fn snapshot() -> Self {
        Self {
            system: System::new_all(),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.system
            .process(Pid::from_u32(pid))
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    /// All transitive children of any pid in `roots`
    fn descendants_of(&self, roots: &BTreeSet<u32>) -> BTreeSet<u32> {
        let mut found: BTreeSet<u32> = BTreeSet::new();
        let mut frontier: Vec<u32> = roots.iter().copied().collect();
        while let Some(parent) = frontier.pop() {
            for (pid, process) in self.system.processes() {
                let pid = pid.as_u32();
                if process.parent().map(Pid::as_u32) == Some(parent)
                    && !roots.contains(&pid)
                    && found.insert(pid)
                {
                    frontier.push(pid);
                }
            }
        }
        found
    }
}

/// Current descendants of `root` (not including `root`)
pub fn descendants(root: u32) -> Vec<u32> {
    let table = ProcessTable::snapshot();
    let roots = BTreeSet::from([root]);
    table.descendants_of(&roots).into_iter().collect()
}

/// True when the pid exists and is not a zombie
pub fn is_alive(pid: u32) -> bool {
    ProcessTable::snapshot().is_alive(pid)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, signo) };
    if rc != 0 {
        tracing::debug!(
            "kill({}, {:?}) failed: {}",
            pid,
            signal,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) {
    let system = System::new_all();
    if let Some(process) = system.process(Pid::from_u32(pid)) {
        let sent = match signal {
            Signal::Term => process
                .kill_with(sysinfo::Signal::Term)
                .unwrap_or_else(|| process.kill()),
            Signal::Kill => process.kill(),
        };
        if !sent {
            tracing::debug!("failed to signal {} with {:?}", pid, signal);
        }
    }
}

/// Signal a single pid with SIGTERM
pub fn terminate(pid: u32) {
    send_signal(pid, Signal::Term);
}

/// Signal a single pid with SIGKILL
pub fn kill(pid: u32) {
    send_signal(pid, Signal::Kill);
}

/// Walk the tree rooted at `root` down until nothing in it is alive
///
/// `known` seeds the set with pids observed earlier (typically a snapshot
/// taken before the session was closed, while the tree was still intact).
pub async fn terminate_tree(root: u32, known: &[u32], plan: TerminationPlan) -> TerminationOutcome {
    let mut tracked: BTreeSet<u32> = known.iter().copied().collect();
    tracked.insert(root);
    let mut stage = Stage::Grace;

    loop {
        let table = ProcessTable::snapshot();
        let discovered = table.descendants_of(&tracked);
        tracked.extend(discovered);
        let alive: Vec<u32> = tracked
            .iter()
            .copied()
            .filter(|pid| table.is_alive(*pid))
            .collect();
        drop(table);

        if alive.is_empty() {
            // `stage` is the step that would have run next
            return match stage {
                Stage::Grace | Stage::Terminate => TerminationOutcome::ExitedCleanly,
                Stage::Kill => TerminationOutcome::Terminated,
                Stage::Done => TerminationOutcome::Killed,
            };
        }

        stage = match stage {
            Stage::Grace => {
                if wait_until_dead(&alive, plan.grace, plan.poll).await {
                    return TerminationOutcome::ExitedCleanly;
                }
                Stage::Terminate
            }
            Stage::Terminate => {
                tracing::debug!("sending SIGTERM to {:?}", alive);
                for pid in &alive {
                    send_signal(*pid, Signal::Term);
                }
                // Late children are picked up by the next discovery pass
                wait_until_dead(&alive, plan.term_wait, plan.poll).await;
                Stage::Kill
            }
            Stage::Kill => {
                tracing::debug!("sending SIGKILL to {:?}", alive);
                for pid in &alive {
                    send_signal(*pid, Signal::Kill);
                }
                wait_until_dead(&alive, plan.kill_wait, plan.poll).await;
                Stage::Done
            }
            Stage::Done => {
                tracing::warn!("processes survived SIGKILL: {:?}", alive);
                return TerminationOutcome::Survivors(alive);
            }
        };
    }
}

async fn wait_until_dead(pids: &[u32], limit: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let table = ProcessTable::snapshot();
        if pids.iter().all(|pid| !table.is_alive(*pid)) {
            return true;
        }
        drop(table);
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn quick_plan() -> TerminationPlan {
        TerminationPlan {
            grace: Duration::from_millis(200),
            term_wait: Duration::from_millis(1500),
            kill_wait: Duration::from_millis(1500),
            poll: Duration::from_millis(25),
        }
    }

    async fn spawn_shell(script: &str) -> tokio::process::Child {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn sh")
    }

    async fn wait_for_descendants(root: u32, count: usize) -> Vec<u32> {
        for _ in 0..100 {
            let found = descendants(root);
            if found.len() >= count {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        descendants(root)
    }

    #[tokio::test]
    async fn test_tree_with_sleeping_children_is_terminated() {
        let mut child = spawn_shell("sleep 30 & sleep 30 & wait").await;
        let root = child.id().expect("pid");
        let known = wait_for_descendants(root, 2).await;
        assert!(known.len() >= 2);

        let reaper = tokio::spawn(async move { child.wait().await });
        let outcome = terminate_tree(root, &known, quick_plan()).await;
        assert!(matches!(
            outcome,
            TerminationOutcome::Terminated | TerminationOutcome::Killed
        ));
        for pid in known {
            assert!(!is_alive(pid), "pid {pid} still alive");
        }
        let _ = reaper.await;
    }

    #[tokio::test]
    async fn test_child_ignoring_sigterm_is_killed() {
        let mut child = spawn_shell("trap '' TERM; sh -c \"trap '' TERM; sleep 30\" & wait").await;
        let root = child.id().expect("pid");
        let known = wait_for_descendants(root, 1).await;

        let reaper = tokio::spawn(async move { child.wait().await });
        let outcome = terminate_tree(root, &known, quick_plan()).await;
        assert_eq!(outcome, TerminationOutcome::Killed);
        for pid in known {
            assert!(!is_alive(pid), "pid {pid} still alive");
        }
        let _ = reaper.await;
    }

    #[tokio::test]
    async fn test_already_exited_tree_needs_no_signal() {
        let mut child = spawn_shell("exit 0").await;
        let root = child.id().expect("pid");
        child.wait().await.expect("wait");
        let outcome = terminate_tree(root, &[], quick_plan()).await;
        assert_eq!(outcome, TerminationOutcome::ExitedCleanly);
    }
}
