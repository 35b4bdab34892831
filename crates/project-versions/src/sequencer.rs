use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::error::VersionResult;
use crate::models::{version_code, ProjectVersion};
use crate::store::VersionStore;

/// Assigns `number`/`code` to persisted drafts from durable creation order.
#[derive(Clone)]
pub struct Sequencer {
    store: Arc<dyn VersionStore>,
    draft_ttl: Duration,
}

impl Sequencer {
    /// Drafts created more than `draft_ttl` before the one being numbered are treated as abandoned.
    pub fn new(store: Arc<dyn VersionStore>, draft_ttl: Duration) -> Self { Self { store, draft_ttl } }

    /// Number the draft should receive: the closest numbered predecessor plus one,
    /// plus one for every live unnumbered draft created between them.
    pub async fn next_number(&self, draft: &ProjectVersion) -> VersionResult<i64> {
        let mut pending = 0i64;
        let mut cursor = draft.created_at;
        loop {
            let Some(prev) = self.store.find_previous(&draft.project_id, cursor).await? else { return Ok(pending + 1) };
            if let Some(n) = prev.number { return Ok(n + pending + 1); }
            let abandoned = (draft.created_at - prev.created_at).to_std().map_or(false, |age| age > self.draft_ttl);
            if abandoned {
                debug!(project_id=%draft.project_id, draft_id=%prev.id, "sequencer.skip_abandoned_draft");
            } else {
                pending += 1;
            }
            cursor = prev.created_at;
        }
    }

    /// Numbers the draft. A concurrent writer that took the same code surfaces as `DuplicateCode`.
    pub async fn assign(&self, draft: &ProjectVersion) -> VersionResult<ProjectVersion> {
        let number = self.next_number(draft).await?;
        let code = version_code(number);
        debug!(project_id=%draft.project_id, version_id=%draft.id, number, "sequencer.assign");
        self.store.assign_number(draft.id, number, &code).await
    }
}
