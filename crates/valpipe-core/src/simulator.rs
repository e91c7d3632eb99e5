use crate::AgentStatus;

/// Pointer-based stand-in for progress while the channel has produced no
/// real agent status. The pointer only moves forward, never past the last
/// roster slot, and stops for good once any real status shows up in the run.
#[derive(Debug, Clone, Default)]
pub struct FallbackSimulator {
    roster_len: usize,
    pointer: Option<usize>,
    engaged: bool,
    preempted: bool,
}

impl FallbackSimulator {
    pub fn new(roster_len: usize) -> Self {
        Self {
            roster_len,
            ..Self::default()
        }
    }

    /// Fresh state for a user-triggered run.
    pub fn reset(&mut self, roster_len: usize) {
        *self = Self::new(roster_len);
    }

    /// Roster replaced mid-run. The pointer is clamped, never rewound.
    pub fn set_roster_len(&mut self, roster_len: usize) {
        self.roster_len = roster_len;
        if roster_len == 0 {
            self.pointer = None;
            self.engaged = false;
        } else if let Some(pointer) = self.pointer {
            self.pointer = Some(pointer.min(roster_len - 1));
        }
    }

    /// Re-evaluates engagement against the current status map. Returns
    /// whether the simulation is engaged afterwards.
    pub fn observe<I>(&mut self, statuses: I, run_started: bool) -> bool
    where
        I: IntoIterator<Item = AgentStatus>,
    {
        let all_idle = statuses.into_iter().all(|status| status.is_idle());
        if !all_idle {
            self.preempted = true;
        }
        let engage = all_idle && run_started && !self.preempted && self.roster_len > 0;
        if engage && self.pointer.is_none() {
            self.pointer = Some(0);
        }
        self.engaged = engage;
        engage
    }

    /// Advance by one stage. Returns false when there was nothing to do.
    pub fn tick(&mut self) -> bool {
        if !self.engaged {
            return false;
        }
        match self.pointer {
            Some(pointer) if pointer + 1 < self.roster_len => {
                self.pointer = Some(pointer + 1);
                true
            }
            _ => false,
        }
    }

    pub fn derived_status(&self, index: usize) -> Option<AgentStatus> {
        if !self.engaged || index >= self.roster_len {
            return None;
        }
        let pointer = self.pointer?;
        let status = if index < pointer {
            AgentStatus::Success
        } else if index == pointer {
            AgentStatus::Processing
        } else {
            AgentStatus::Queued
        };
        Some(status)
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    pub fn is_preempted(&self) -> bool {
        self.preempted
    }

    pub fn pointer(&self) -> Option<usize> {
        self.pointer
    }

    /// True while a further `tick` could still move the pointer.
    pub fn can_advance(&self) -> bool {
        self.engaged && matches!(self.pointer, Some(pointer) if pointer + 1 < self.roster_len)
    }
}
