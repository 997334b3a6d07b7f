//! A single review sitting.

use std::collections::VecDeque;

use crate::engine::ProgressEngine;
use crate::entitlements::QueueFilter;
use crate::error::CadenceResult;
use crate::types::{ReviewableItem, SessionOutcome, SessionStats};

/// Items queued for one sitting plus the running statistics.
///
/// Every answer is persisted as it is given, so dropping a session without
/// calling [`finish`](Self::finish) loses only the session counters.
pub struct ReviewSession<'a> {
    engine: &'a ProgressEngine,
    user_id: String,
    queue: VecDeque<ReviewableItem>,
    stats: SessionStats,
    prompt_upgrade: bool,
    withheld: usize,
}

impl<'a> ReviewSession<'a> {
    pub(crate) fn new(engine: &'a ProgressEngine, user_id: &str, filter: QueueFilter) -> Self {
        Self {
            engine,
            user_id: user_id.to_string(),
            prompt_upgrade: filter.should_prompt_upgrade(),
            withheld: filter.withheld,
            queue: filter.admitted.into(),
            stats: SessionStats::default(),
        }
    }

    /// The next item to show, if any.
    pub fn current(&self) -> Option<&ReviewableItem> {
        self.queue.front()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Gated items left out of this session by quota or plan.
    pub fn withheld(&self) -> usize {
        self.withheld
    }

    /// Whether the learner should see an upgrade prompt for this session.
    pub fn should_prompt_upgrade(&self) -> bool {
        self.prompt_upgrade
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Record an answer and return the item's new state.
    ///
    /// The answered item leaves the queue wherever it sits in it.
    pub async fn answer(&mut self, outcome: &SessionOutcome) -> CadenceResult<ReviewableItem> {
        let updated = self.engine.submit_outcome(&self.user_id, outcome).await?;
        self.stats.record(outcome);
        if let Some(pos) = self.queue.iter().position(|i| i.item_id == outcome.item_id) {
            self.queue.remove(pos);
        }
        Ok(updated)
    }

    /// Close the session and return the user's lifetime totals.
    pub async fn finish(self) -> CadenceResult<SessionStats> {
        self.engine.complete_session(&self.user_id, &self.stats).await
    }
}
