use slog::info;

use super::{Next, StateType};
use crate::raft::context::RaftContext;

/// Initial state: restores persisted state, then hands over to the role the
/// local member holds.
pub struct Start;

impl Start {
    pub fn open(&mut self, ctx: &mut RaftContext) -> Next {
        ctx.restore()?;
        let applied = ctx.apply_committed()?;
        info!(ctx.logger(), "Replayed committed entries"; "count" => applied.len());

        if ctx.membership().is_active(ctx.id()) {
            Ok(Some(StateType::Follower))
        } else {
            Ok(Some(StateType::Passive))
        }
    }
}
