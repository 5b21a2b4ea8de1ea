use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::{Category, ItemId, Movie, Tallies, VoteOutcome};
use crate::cursor::QueryIdentity;
use crate::data::VoteService;
use crate::error::ApiError;
use crate::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteError {
    #[error("a vote for movie {0} is already being submitted")]
    InFlight(ItemId),
    #[error("no identity available to vote with")]
    MissingIdentity,
    #[error("voting is not available for this list")]
    Unsupported,
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl VoteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            VoteError::Api(err) => err.status,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotePatch {
    pub item_id: ItemId,
    pub tallies: Option<Tallies>,
    pub voted_category: Option<Category>,
}

impl VotePatch {
    pub fn from_outcome(item_id: ItemId, outcome: &VoteOutcome) -> Self {
        Self {
            item_id,
            tallies: outcome.tallies.clone(),
            voted_category: outcome.voted_category,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tallies.is_none() && self.voted_category.is_none()
    }

    pub fn merged_with(&self, newer: &VotePatch) -> VotePatch {
        VotePatch {
            item_id: self.item_id,
            tallies: newer.tallies.clone().or_else(|| self.tallies.clone()),
            voted_category: newer.voted_category.or(self.voted_category),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub patched: Vec<QueryIdentity>,
    pub stale: Vec<QueryIdentity>,
}

pub struct VoteCoordinator {
    service: Arc<dyn VoteService>,
    registry: Arc<Registry<Movie>>,
    voting: Mutex<HashSet<ItemId>>,
}

struct VotingGuard<'a> {
    voting: &'a Mutex<HashSet<ItemId>>,
    item_id: ItemId,
}

impl Drop for VotingGuard<'_> {
    fn drop(&mut self) {
        self.voting.lock().remove(&self.item_id);
    }
}

impl VoteCoordinator {
    pub fn new(service: Arc<dyn VoteService>, registry: Arc<Registry<Movie>>) -> Self {
        Self {
            service,
            registry,
            voting: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry<Movie>> {
        &self.registry
    }

    pub fn is_voting(&self, item_id: ItemId) -> bool {
        self.voting.lock().contains(&item_id)
    }

    pub fn submit_vote(
        &self,
        item_id: ItemId,
        category: Category,
        identifier: &str,
    ) -> Result<VoteOutcome, VoteError> {
        if identifier.trim().is_empty() {
            return Err(VoteError::MissingIdentity);
        }
        let _guard = self.claim(item_id)?;

        let outcome = self
            .service
            .submit_vote(item_id, category, identifier)
            .map_err(|err| {
                warn!(item_id, error = %err, "vote: submission failed");
                VoteError::Api(err)
            })?;

        let report = self.apply(item_id, &outcome);
        info!(
            item_id,
            requested = category.as_str(),
            inserted = outcome.inserted,
            recorded = outcome.voted_category.map(|c| c.as_str()).unwrap_or("none"),
            patched = report.patched.len(),
            stale = report.stale.len(),
            "vote: resolved"
        );
        Ok(outcome)
    }

    pub fn apply(&self, item_id: ItemId, outcome: &VoteOutcome) -> PatchReport {
        let patch = VotePatch::from_outcome(item_id, outcome);
        let mut report = PatchReport::default();
        if patch.is_empty() {
            return report;
        }

        // Held or fetching is decided under the cursor lock, so a page that
        // completes concurrently lands either before the patch or after it.
        for (query, cursor, displayed) in self.registry.cursors() {
            let mut cursor = cursor.lock();
            if cursor.contains(item_id) {
                cursor.apply_patch(&patch);
                if !displayed {
                    cursor.mark_stale();
                    report.stale.push(query.clone());
                }
                report.patched.push(query);
            } else if cursor.is_fetching() {
                cursor.apply_patch(&patch);
                debug!(item_id, resource = %query.resource.label(), "vote: patch queued for in-flight page");
            }
        }

        report
    }

    fn claim(&self, item_id: ItemId) -> Result<VotingGuard<'_>, VoteError> {
        let mut voting = self.voting.lock();
        if !voting.insert(item_id) {
            debug!(item_id, "vote: duplicate submission refused");
            return Err(VoteError::InFlight(item_id));
        }
        Ok(VotingGuard {
            voting: &self.voting,
            item_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn for_vote(result: &Result<VoteOutcome, VoteError>) -> Self {
        match result {
            Ok(outcome) => Notice {
                level: NoticeLevel::Info,
                title: if outcome.inserted {
                    "Vote recorded".to_string()
                } else {
                    "Duplicate vote".to_string()
                },
                message: outcome.message.clone(),
            },
            Err(VoteError::Api(err)) => Notice {
                level: NoticeLevel::Error,
                title: match err.status {
                    Some(status) => format!("Error {status}"),
                    None => "Error".to_string(),
                },
                message: err.message.clone(),
            },
            Err(other) => Notice {
                level: NoticeLevel::Error,
                title: "Error".to_string(),
                message: other.to_string(),
            },
        }
    }
}
