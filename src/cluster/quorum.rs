use crate::node::SelfStatus;

/// State machine deriving the node's own serving status from the configured
/// cluster size and the number of reachable members.
///
/// A node is in quorum while it can reach a strict majority of the cluster,
/// itself included. Losing quorum does not demote the node immediately:
/// it keeps serving as [UpAndWaitingForQuorum](SelfStatus::UpAndWaitingForQuorum)
/// while a one-shot timer runs, so transient partitions do not cause flapping.
/// Only when the timer fires without recovery does the node step down to
/// [WaitingForQuorum](SelfStatus::WaitingForQuorum).
///
/// The monitor is pure: it owns no clock and spawns no task. Its owner feeds
/// it reachable counts and timer expiries, and executes the returned
/// [TimerCommand]s.
#[derive(Debug)]
pub struct QuorumMonitor {
    cluster_size: u32,
    status: SelfStatus,
    timer_armed: bool,
}

/// What the owner should do with the one-shot quorum timer after an event.
/// Arming while armed and disarming while disarmed both come back as `Keep`,
/// so the timer is never restarted by repeated evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Keep,
    Arm,
    Disarm,
}

impl QuorumMonitor {
    pub fn new(cluster_size: u32) -> Self {
        Self {
            cluster_size: cluster_size.max(1),
            status: SelfStatus::Down,
            timer_armed: false,
        }
    }

    pub fn status(&self) -> SelfStatus {
        self.status
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    /// Members needed for quorum: a strict majority of the cluster.
    pub fn quorum(&self) -> usize {
        (self.cluster_size / 2 + 1) as usize
    }

    /// Sets the cluster size exactly, as instructed by the operator.
    pub fn set_cluster_size(&mut self, size: u32) {
        self.cluster_size = size.max(1);
    }

    /// Adopts a cluster size announced by a peer when it exceeds our own.
    /// Returns whether the size changed.
    pub fn observe_remote_cluster_size(&mut self, size: u32) -> bool {
        if size > self.cluster_size {
            self.cluster_size = size;
            true
        } else {
            false
        }
    }

    /// Leaves the terminal `Down` state and evaluates against `reachable`.
    pub fn start(&mut self, reachable: usize) -> TimerCommand {
        self.status = SelfStatus::Up;
        self.timer_armed = false;
        self.reevaluate(reachable)
    }

    /// Enters the terminal `Down` state. Only [start](Self::start) leaves it.
    pub fn stop(&mut self) -> TimerCommand {
        self.status = SelfStatus::Down;
        self.disarm()
    }

    /// Re-derives the status from the current reachable count. Invoked on
    /// every completed exchange, liveness tick and cluster-size change.
    pub fn reevaluate(&mut self, reachable: usize) -> TimerCommand {
        let in_quorum = reachable >= self.quorum();
        match self.status {
            SelfStatus::Down => TimerCommand::Keep,
            SelfStatus::Up if !in_quorum => {
                self.status = SelfStatus::UpAndWaitingForQuorum;
                self.arm()
            }
            SelfStatus::Up => TimerCommand::Keep,
            SelfStatus::UpAndWaitingForQuorum if in_quorum => {
                self.status = SelfStatus::Up;
                self.disarm()
            }
            SelfStatus::UpAndWaitingForQuorum => self.arm(),
            SelfStatus::WaitingForQuorum if in_quorum => {
                self.status = SelfStatus::Up;
                TimerCommand::Keep
            }
            SelfStatus::WaitingForQuorum => TimerCommand::Keep,
        }
    }

    /// Handles expiry of the quorum timer. A stale expiry, delivered after
    /// quorum was regained or the timer disarmed, demotes nothing.
    pub fn on_timer_fired(&mut self, reachable: usize) {
        self.timer_armed = false;
        if self.status == SelfStatus::UpAndWaitingForQuorum {
            self.status = if reachable < self.quorum() {
                SelfStatus::WaitingForQuorum
            } else {
                SelfStatus::Up
            };
        }
    }

    fn arm(&mut self) -> TimerCommand {
        if self.timer_armed {
            TimerCommand::Keep
        } else {
            self.timer_armed = true;
            TimerCommand::Arm
        }
    }

    fn disarm(&mut self) -> TimerCommand {
        if self.timer_armed {
            self.timer_armed = false;
            TimerCommand::Disarm
        } else {
            TimerCommand::Keep
        }
    }
}
