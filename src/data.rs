use std::sync::Arc;

use crate::api::{self, Category, ItemId, Movie, Page, Snapshot, Tally, VoteOutcome};
use crate::cursor::{QueryIdentity, Resource};
use crate::error::ApiError;

pub trait PageSource<T>: Send + Sync {
    fn fetch_page(&self, query: &QueryIdentity, cursor: Option<&str>) -> Result<Page<T>, ApiError>;
}

pub trait VoteService: Send + Sync {
    fn submit_vote(
        &self,
        item_id: ItemId,
        category: Category,
        fingerprint: &str,
    ) -> Result<VoteOutcome, ApiError>;
}

pub struct ActiveMovieSource {
    client: Arc<api::Client>,
}

impl ActiveMovieSource {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl PageSource<Movie> for ActiveMovieSource {
    fn fetch_page(&self, query: &QueryIdentity, cursor: Option<&str>) -> Result<Page<Movie>, ApiError> {
        match query.resource {
            Resource::Active => {
                self.client
                    .active_movies(query.filters, cursor, query.fingerprint.as_deref())
            }
            other => Err(mismatch("active movies", other)),
        }
    }
}

pub struct SnapshotSource {
    client: Arc<api::Client>,
}

impl SnapshotSource {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl PageSource<Snapshot> for SnapshotSource {
    fn fetch_page(
        &self,
        query: &QueryIdentity,
        cursor: Option<&str>,
    ) -> Result<Page<Snapshot>, ApiError> {
        match query.resource {
            Resource::Snapshot { year, month } => self.client.snapshots(
                year,
                month,
                query.filters,
                cursor,
                query.fingerprint.as_deref(),
            ),
            other => Err(mismatch("snapshots", other)),
        }
    }
}

pub struct TallySource {
    client: Arc<api::Client>,
}

impl TallySource {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl PageSource<Tally> for TallySource {
    fn fetch_page(&self, query: &QueryIdentity, cursor: Option<&str>) -> Result<Page<Tally>, ApiError> {
        match query.resource {
            Resource::Tallies { movie_id } => {
                let limit = Some(query.filters.limit).filter(|limit| *limit > 0);
                self.client.movie_tallies(movie_id, cursor, limit)
            }
            other => Err(mismatch("tallies", other)),
        }
    }
}

pub struct ApiVoteService {
    client: Arc<api::Client>,
}

impl ApiVoteService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl VoteService for ApiVoteService {
    fn submit_vote(
        &self,
        item_id: ItemId,
        category: Category,
        fingerprint: &str,
    ) -> Result<VoteOutcome, ApiError> {
        self.client.submit_vote(item_id, category, Some(fingerprint))
    }
}

fn mismatch(source: &str, resource: Resource) -> ApiError {
    ApiError::invalid(format!(
        "{source} source cannot serve {}",
        resource.label()
    ))
}
