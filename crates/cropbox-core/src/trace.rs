//! Evaluation stack with nested regimes
//!
//! Every rule evaluation pushes an `(entity, rule)` frame. A frame already
//! on the stack means the rule is being re-entered: the cycle check only
//! looks at the innermost regime, so a solver trial that re-reads the rule
//! that started it does not count as a cycle of the enclosing evaluation.

use crate::{EntityId, RuleId};
use tracing::{debug, trace};

/// Id of the outermost regime, the one ordinary evaluation runs in
pub const BASE_REGIME: u64 = 0;

/// One rule evaluation in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    pub entity: EntityId,
    pub rule: RuleId,
}

impl Frame {
    pub fn new(entity: EntityId, rule: RuleId) -> Self {
        Self { entity, rule }
    }
}

#[derive(Debug)]
struct Regime {
    id: u64,
    frames: Vec<Frame>,
}

/// Stack of regimes, each a stack of frames. The outermost regime is never
/// removed.
#[derive(Debug)]
pub struct Trace {
    regimes: Vec<Regime>,
    next_regime: u64,
}

impl Trace {
    pub fn new() -> Self {
        Self {
            regimes: vec![Regime {
                id: BASE_REGIME,
                frames: Vec::new(),
            }],
            next_regime: 1,
        }
    }

    fn innermost(&self) -> &Regime {
        // the base regime is never popped
        &self.regimes[self.regimes.len() - 1]
    }

    fn innermost_mut(&mut self) -> &mut Regime {
        let last = self.regimes.len() - 1;
        &mut self.regimes[last]
    }

    /// Id of the innermost regime
    pub fn regime(&self) -> u64 {
        self.innermost().id
    }

    /// Whether the frame is already being evaluated in the innermost regime
    pub fn is_reentrant(&self, frame: &Frame) -> bool {
        self.innermost().frames.contains(frame)
    }

    pub fn push(&mut self, frame: Frame) {
        trace!(entity = %frame.entity, rule = %frame.rule, depth = self.depth(), "push");
        self.innermost_mut().frames.push(frame);
    }

    /// Open a fresh regime whose first frame is `frame`. Popping that frame
    /// closes the regime again.
    pub fn push_regime(&mut self, frame: Frame) -> u64 {
        let id = self.next_regime;
        self.next_regime += 1;
        debug!(entity = %frame.entity, rule = %frame.rule, regime = id, "open regime");
        self.regimes.push(Regime {
            id,
            frames: vec![frame],
        });
        id
    }

    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.innermost_mut().frames.pop();
        if self.regimes.len() > 1 && self.innermost().frames.is_empty() {
            if let Some(closed) = self.regimes.pop() {
                debug!(regime = closed.id, "close regime");
            }
        }
        frame
    }

    /// Frames in progress across all regimes
    pub fn depth(&self) -> usize {
        self.regimes.iter().map(|r| r.frames.len()).sum()
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}
