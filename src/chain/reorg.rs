//! Fork choice: switching the canonical chain to a longer competing segment

use crate::block::Block;
use crate::chain::manager::{ChainState, Env};
use crate::chain::ChainManager;
use crate::error::{ChainError, ConsensusError};
use crate::hash::BlockHash;
use crate::storage::KvStore;
use tracing::{info, warn};

/// Result of a successful reorganization
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReorgOutcome {
    /// Height of the last block both chains share
    pub ancestor_height: u64,
    /// Blocks taken off the chain, tip first
    pub reverted: Vec<BlockHash>,
    /// Blocks now canonical, lowest first
    pub applied: Vec<BlockHash>,
    /// Transactions from reverted blocks returned to the mempool
    pub requeued: usize,
}

impl<S: KvStore> ChainManager<S> {
    /// Replace the blocks above the segment's parent with `segment`.
    ///
    /// The segment must be contiguous, attach to a canonical block no deeper
    /// than the configured maximum and not below the finalized height, and
    /// end higher than the current tip. Every block is validated as it is
    /// applied; on any failure the chain is left exactly as it was.
    pub fn reorganize(&self, segment: Vec<Block>) -> Result<ReorgOutcome, ChainError> {
        let mut guard = self.state.write();
        let env = self.env(self.clock.now());
        let ancestor = plan(&guard, &segment, self.config.consensus.max_reorg_depth)?;

        let backup = guard.clone();
        let reverted = match switch(&mut guard, &segment, ancestor, &env) {
            Ok(reverted) => reverted,
            Err(e) => {
                warn!(ancestor, error = %e, "reorganization failed, chain unchanged");
                *guard = backup;
                return Err(e);
            }
        };

        let requeued = guard.requeue(reverted.iter().flat_map(|b| b.transactions.iter()), &env);
        let dropped = guard.checkpoints.truncate_above(ancestor);

        if let Err(e) = self.persist(&guard, &reverted, &segment, &dropped) {
            warn!(ancestor, error = %e, "failed to persist reorganization, restoring previous chain");
            *guard = backup;
            return Err(e);
        }

        let outcome = ReorgOutcome {
            ancestor_height: ancestor,
            reverted: reverted.iter().map(|b| b.hash).collect(),
            applied: segment.iter().map(|b| b.hash).collect(),
            requeued,
        };
        info!(
            ancestor,
            reverted = outcome.reverted.len(),
            applied = outcome.applied.len(),
            requeued,
            tip = %guard.tip_hash().short(),
            "chain reorganized"
        );
        Ok(outcome)
    }

    fn persist(
        &self,
        state: &ChainState,
        reverted: &[Block],
        applied: &[Block],
        dropped_checkpoints: &[u64],
    ) -> Result<(), ChainError> {
        for block in reverted {
            self.store.uncommit_block(block, &[])?;
        }
        for block in applied {
            self.store.commit_block(block, &[])?;
        }
        self.store
            .put_balances(&state.balances_touched_by(reverted.iter().chain(applied.iter())))?;
        for height in dropped_checkpoints {
            self.store.delete_checkpoint(*height)?;
        }
        Ok(())
    }
}

/// Check the segment against the fork-choice rules. Returns the ancestor height.
fn plan(state: &ChainState, segment: &[Block], max_depth: u64) -> Result<u64, ConsensusError> {
    let first = segment.first().ok_or(ConsensusError::EmptySegment)?;
    for (index, pair) in segment.windows(2).enumerate() {
        if pair[1].prev_hash != pair[0].hash || pair[0].height.checked_add(1) != Some(pair[1].height) {
            return Err(ConsensusError::BrokenSegment(index + 1));
        }
    }

    let ancestor = first
        .height
        .checked_sub(1)
        .ok_or(ConsensusError::UnknownAncestor(first.prev_hash))?;
    match state.blocks.get(ancestor as usize) {
        Some(block) if block.hash == first.prev_hash => {}
        _ => return Err(ConsensusError::UnknownAncestor(first.prev_hash)),
    }

    let current = state.height();
    let depth = current - ancestor;
    if depth > max_depth {
        return Err(ConsensusError::ReorgTooDeep { depth, max: max_depth });
    }
    let finalized = state.finalizer.latest_finalized_height();
    if ancestor < finalized {
        return Err(ConsensusError::FinalizedConflict { ancestor, finalized });
    }
    let proposed = ancestor.saturating_add(segment.len() as u64);
    if proposed <= current {
        return Err(ConsensusError::NotHeavier { current, proposed });
    }
    Ok(ancestor)
}

/// Revert down to `ancestor`, then validate and apply the segment
fn switch(state: &mut ChainState, segment: &[Block], ancestor: u64, env: &Env<'_>) -> Result<Vec<Block>, ChainError> {
    let mut reverted = Vec::new();
    while state.height() > ancestor {
        reverted.push(state.revert_tip()?);
    }
    for block in segment {
        state.validate(block, env)?;
        state.apply(block, env)?;
    }
    Ok(reverted)
}
