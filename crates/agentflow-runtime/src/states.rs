// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Transition tables for the step state machine.
//!
//! The state alphabet is shared, the transition function is not: each
//! object type walks a different subset of the lifecycle. Tables are
//! total over the states each variant can occupy; `None` marks a
//! terminal.

use agentflow_core::ObjectType;
use agentflow_state::StepState;

/// Select the next state for a step, per its object type's table.
///
/// Returns `None` when the current state is terminal for that table.
pub fn select_next_state(object_type: ObjectType, current: StepState) -> Option<StepState> {
    match object_type {
        ObjectType::AndThenBlock => block_next(current),
        ObjectType::YieldAssignment => yield_next(current),
        ObjectType::VariableAssignment | ObjectType::SchemaInstantiation => full_next(current),
    }
}

/// Full lifecycle, used by VariableAssignment and SchemaInstantiation.
///
/// `EventTransmit` is always on the path; its handler identity-advances
/// when the facet is not an event facet.
fn full_next(current: StepState) -> Option<StepState> {
    use StepState::*;
    match current {
        Created => Some(FacetInitializationBegin),
        FacetInitializationBegin => Some(FacetInitializationEnd),
        FacetInitializationEnd => Some(FacetScriptsBegin),
        FacetScriptsBegin => Some(FacetScriptsEnd),
        FacetScriptsEnd => Some(StatementScriptsBegin),
        StatementScriptsBegin => Some(StatementScriptsEnd),
        StatementScriptsEnd => Some(MixinBlocksBegin),
        MixinBlocksBegin => Some(MixinBlocksContinue),
        MixinBlocksContinue => Some(MixinBlocksEnd),
        MixinBlocksEnd => Some(MixinCaptureBegin),
        MixinCaptureBegin => Some(MixinCaptureEnd),
        MixinCaptureEnd => Some(EventTransmit),
        EventTransmit => Some(StatementBlocksBegin),
        StatementBlocksBegin => Some(StatementBlocksContinue),
        StatementBlocksContinue => Some(StatementBlocksEnd),
        StatementBlocksEnd => Some(StatementCaptureBegin),
        StatementCaptureBegin => Some(StatementCaptureEnd),
        StatementCaptureEnd => Some(StatementEnd),
        StatementEnd => Some(StatementComplete),
        _ => None,
    }
}

/// Reduced lifecycle for AndThenBlock steps.
fn block_next(current: StepState) -> Option<StepState> {
    use StepState::*;
    match current {
        Created => Some(BlockExecutionBegin),
        BlockExecutionBegin => Some(BlockExecutionContinue),
        BlockExecutionContinue => Some(BlockExecutionEnd),
        BlockExecutionEnd => Some(StatementComplete),
        _ => None,
    }
}

/// Minimal lifecycle for YieldAssignment steps: no blocks, no capture.
fn yield_next(current: StepState) -> Option<StepState> {
    use StepState::*;
    match current {
        Created => Some(FacetInitializationBegin),
        FacetInitializationBegin => Some(FacetInitializationEnd),
        FacetInitializationEnd => Some(FacetScriptsBegin),
        FacetScriptsBegin => Some(FacetScriptsEnd),
        FacetScriptsEnd => Some(StatementEnd),
        StatementEnd => Some(StatementComplete),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StepState::*;

    #[test]
    fn test_full_table_walks_to_completion() {
        let mut state = Created;
        let mut visited = vec![state];
        while let Some(next) = select_next_state(ObjectType::VariableAssignment, state) {
            state = next;
            visited.push(state);
            assert!(visited.len() < 32, "table must terminate");
        }
        assert_eq!(state, StatementComplete);
        assert!(visited.contains(&EventTransmit));
        assert!(visited.contains(&StatementCaptureBegin));
    }

    #[test]
    fn test_block_table() {
        assert_eq!(
            select_next_state(ObjectType::AndThenBlock, Created),
            Some(BlockExecutionBegin)
        );
        assert_eq!(
            select_next_state(ObjectType::AndThenBlock, BlockExecutionEnd),
            Some(StatementComplete)
        );
        assert_eq!(
            select_next_state(ObjectType::AndThenBlock, StatementComplete),
            None
        );
        // Block steps never enter facet phases.
        assert_eq!(
            select_next_state(ObjectType::AndThenBlock, FacetInitializationBegin),
            None
        );
    }

    #[test]
    fn test_yield_table_skips_blocks() {
        let mut state = Created;
        let mut visited = vec![state];
        while let Some(next) = select_next_state(ObjectType::YieldAssignment, state) {
            state = next;
            visited.push(state);
        }
        assert_eq!(state, StatementComplete);
        assert!(!visited.contains(&StatementBlocksBegin));
        assert!(!visited.contains(&EventTransmit));
        assert!(!visited.contains(&MixinBlocksBegin));
    }

    #[test]
    fn test_terminal_states_have_no_successor() {
        for object_type in [
            ObjectType::VariableAssignment,
            ObjectType::YieldAssignment,
            ObjectType::AndThenBlock,
        ] {
            assert_eq!(select_next_state(object_type, StatementComplete), None);
            assert_eq!(select_next_state(object_type, Error), None);
            assert_eq!(select_next_state(object_type, Cancelled), None);
        }
    }
}
