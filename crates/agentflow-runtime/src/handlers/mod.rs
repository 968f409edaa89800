// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! State handlers.
//!
//! One function per lifecycle phase, dispatched by the current state.
//! Handlers are synchronous over the tick snapshot: they read through
//! [`TickContext`], mutate the step in place, and queue writes in the
//! change set. A handler that needs external work emits a task and
//! returns [`HandlerResult::Stay`]; it must never block.

pub mod block_execution;
pub mod blocks;
pub mod capture;
pub mod completion;
pub mod initialization;
pub mod scripts;

use agentflow_core::AflError;
use agentflow_state::{StepRecord, StepState};

use crate::tick::TickContext;

/// What a phase handler decided.
#[derive(Debug)]
pub enum HandlerResult {
    /// Request the next state and keep looping.
    Advance,

    /// No progress possible now. `push` asks the execution loop to come
    /// back; without it the step parks until something wakes the runner.
    Stay {
        /// Re-schedule the step this tick.
        push: bool,
    },

    /// The step failed; the changer records the error terminally.
    Error(AflError),
}

/// Execute the handler for the step's current state.
pub fn execute(step: &mut StepRecord, ctx: &mut TickContext<'_>) -> HandlerResult {
    use StepState::*;

    match step.state {
        Created => HandlerResult::Advance,
        FacetInitializationBegin => initialization::facet_initialization_begin(step, ctx),
        FacetInitializationEnd => HandlerResult::Advance,
        FacetScriptsBegin => scripts::facet_scripts_begin(step, ctx),
        FacetScriptsEnd => HandlerResult::Advance,
        StatementScriptsBegin | StatementScriptsEnd => HandlerResult::Advance,
        MixinBlocksBegin => HandlerResult::Advance,
        MixinBlocksContinue => blocks::mixin_blocks_continue(step, ctx),
        MixinBlocksEnd => HandlerResult::Advance,
        MixinCaptureBegin => capture::mixin_capture_begin(step, ctx),
        MixinCaptureEnd => HandlerResult::Advance,
        EventTransmit => completion::event_transmit(step, ctx),
        StatementBlocksBegin => blocks::statement_blocks_begin(step, ctx),
        StatementBlocksContinue => blocks::statement_blocks_continue(step, ctx),
        StatementBlocksEnd => HandlerResult::Advance,
        StatementCaptureBegin => capture::statement_capture_begin(step, ctx),
        StatementCaptureEnd => HandlerResult::Advance,
        StatementEnd => HandlerResult::Advance,
        BlockExecutionBegin => block_execution::block_execution_begin(step, ctx),
        BlockExecutionContinue => block_execution::block_execution_continue(step, ctx),
        BlockExecutionEnd => HandlerResult::Advance,
        // Terminal states are filtered out by the changer.
        StatementComplete | Error | Cancelled => HandlerResult::Stay { push: false },
    }
}
