/// Frame state machine shared by the caller thread and the job chain.
/// Always accessed under the pipeline's state mutex.
use crate::query::PassInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareState {
    Idle,
    PrepareStarted,
    PrepareDone,
    /// The caller asked for the check while prepare was still running
    CheckRequested,
    CheckStarted,
}

/// What `cull_start` should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAction {
    LaunchCheck(PassInfo),
    /// Launched by the prepare chain when it completes
    Deferred,
    Rejected(PrepareState),
}

/// What the prepare chain should do once its last stage finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    LaunchCheck(PassInfo),
    /// Buffer is ready, waiting for `cull_start`
    Ready,
    /// The frame was ended before any check was requested
    FrameEnded,
}

/// What `cull_end` must do to keep the queue balanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndAction {
    /// No check will run this frame: release the prepare producer
    ReleaseProducer,
    /// The check job owns the producer release
    CheckOwnsProducer,
    /// Nothing was prepared
    Nothing,
}

#[derive(Debug)]
pub struct CullStateMachine {
    state: PrepareState,
    end_requested: bool,
    pass: PassInfo,
}

impl Default for CullStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CullStateMachine {
    pub fn new() -> Self {
        Self {
            state: PrepareState::Idle,
            end_requested: false,
            pass: PassInfo::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> PrepareState {
        self.state
    }

    /// Idle -> PrepareStarted. Returns false from any other state.
    pub fn begin_prepare(&mut self) -> bool {
        if self.state != PrepareState::Idle {
            return false;
        }
        self.state = PrepareState::PrepareStarted;
        self.end_requested = false;
        true
    }

    pub fn request_check(&mut self, pass: PassInfo) -> StartAction {
        match self.state {
            PrepareState::PrepareDone => {
                self.state = PrepareState::CheckStarted;
                StartAction::LaunchCheck(pass)
            }
            PrepareState::PrepareStarted if !self.end_requested => {
                self.pass = pass;
                self.state = PrepareState::CheckRequested;
                StartAction::Deferred
            }
            other => StartAction::Rejected(other),
        }
    }

    pub fn finish_prepare(&mut self) -> PrepareOutcome {
        match self.state {
            PrepareState::CheckRequested => {
                self.state = PrepareState::CheckStarted;
                PrepareOutcome::LaunchCheck(self.pass)
            }
            PrepareState::PrepareStarted if self.end_requested => {
                self.state = PrepareState::Idle;
                self.end_requested = false;
                PrepareOutcome::FrameEnded
            }
            PrepareState::PrepareStarted => {
                self.state = PrepareState::PrepareDone;
                PrepareOutcome::Ready
            }
            other => {
                debug_assert!(false, "prepare finished in state {other:?}");
                PrepareOutcome::Ready
            }
        }
    }

    /// CheckStarted -> Idle.
    pub fn finish_check(&mut self) {
        debug_assert_eq!(self.state, PrepareState::CheckStarted);
        self.state = PrepareState::Idle;
    }

    pub fn end_frame(&mut self) -> EndAction {
        match self.state {
            PrepareState::PrepareDone => {
                self.state = PrepareState::Idle;
                EndAction::ReleaseProducer
            }
            PrepareState::PrepareStarted if !self.end_requested => {
                self.end_requested = true;
                EndAction::ReleaseProducer
            }
            PrepareState::CheckRequested | PrepareState::CheckStarted => EndAction::CheckOwnsProducer,
            PrepareState::PrepareStarted | PrepareState::Idle => EndAction::Nothing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_after_prepare_done_launches_immediately() {
        let mut fsm = CullStateMachine::new();
        assert!(fsm.begin_prepare());
        assert_eq!(fsm.finish_prepare(), PrepareOutcome::Ready);
        let pass = PassInfo { frame_id: 3, pass_id: 1 };
        assert_eq!(fsm.request_check(pass), StartAction::LaunchCheck(pass));
        assert_eq!(fsm.state(), PrepareState::CheckStarted);
        fsm.finish_check();
        assert_eq!(fsm.state(), PrepareState::Idle);
    }

    #[test]
    fn early_check_request_is_launched_by_prepare() {
        let mut fsm = CullStateMachine::new();
        fsm.begin_prepare();
        let pass = PassInfo { frame_id: 9, pass_id: 0 };
        assert_eq!(fsm.request_check(pass), StartAction::Deferred);
        assert_eq!(fsm.state(), PrepareState::CheckRequested);
        assert_eq!(fsm.finish_prepare(), PrepareOutcome::LaunchCheck(pass));
    }

    #[test]
    fn second_prepare_is_rejected_until_idle() {
        let mut fsm = CullStateMachine::new();
        assert!(fsm.begin_prepare());
        assert!(!fsm.begin_prepare());
        fsm.finish_prepare();
        assert!(!fsm.begin_prepare());
        assert_eq!(fsm.end_frame(), EndAction::ReleaseProducer);
        assert!(fsm.begin_prepare());
    }

    #[test]
    fn ending_during_prepare_returns_to_idle_on_completion() {
        let mut fsm = CullStateMachine::new();
        fsm.begin_prepare();
        assert_eq!(fsm.end_frame(), EndAction::ReleaseProducer);
        assert_eq!(fsm.end_frame(), EndAction::Nothing, "producer is released only once");
        assert!(matches!(fsm.request_check(PassInfo::default()), StartAction::Rejected(_)));
        assert_eq!(fsm.finish_prepare(), PrepareOutcome::FrameEnded);
        assert_eq!(fsm.state(), PrepareState::Idle);
    }

    #[test]
    fn check_rejected_without_prepare() {
        let mut fsm = CullStateMachine::new();
        assert_eq!(
            fsm.request_check(PassInfo::default()),
            StartAction::Rejected(PrepareState::Idle)
        );
        assert_eq!(fsm.end_frame(), EndAction::Nothing);
    }
}
