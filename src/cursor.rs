use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::api::{ItemId, ListFilters, Movie, Page, Snapshot, Tally};
use crate::error::ApiError;
use crate::vote::VotePatch;

pub trait PageItem: Clone + Send + 'static {
    fn item_id(&self) -> ItemId;

    fn apply_vote(&mut self, _patch: &VotePatch) {}
}

impl PageItem for Movie {
    fn item_id(&self) -> ItemId {
        self.id
    }

    fn apply_vote(&mut self, patch: &VotePatch) {
        if patch.item_id != self.id {
            return;
        }
        if let Some(tallies) = &patch.tallies {
            self.tallies = tallies.clone();
        }
        if let Some(category) = patch.voted_category {
            self.voted_category = Some(category);
        }
    }
}

impl PageItem for Snapshot {
    fn item_id(&self) -> ItemId {
        self.movie_id
    }
}

impl PageItem for Tally {
    fn item_id(&self) -> ItemId {
        // One row per category within a movie's tally listing.
        self.category
            .bytes()
            .fold(0i64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as i64))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Active,
    Snapshot { year: i32, month: u32 },
    Tallies { movie_id: ItemId },
}

impl Resource {
    pub fn label(&self) -> String {
        match self {
            Resource::Active => "active movies".to_string(),
            Resource::Snapshot { year, month } => format!("snapshot {year}-{month:02}"),
            Resource::Tallies { movie_id } => format!("tallies for movie {movie_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryIdentity {
    pub resource: Resource,
    pub filters: ListFilters,
    pub fingerprint: Option<String>,
}

impl QueryIdentity {
    pub fn new(resource: Resource, filters: ListFilters, fingerprint: Option<String>) -> Self {
        Self {
            resource,
            filters,
            fingerprint: fingerprint.filter(|fp| !fp.is_empty()),
        }
    }

    pub fn active(filters: ListFilters, fingerprint: Option<String>) -> Self {
        Self::new(Resource::Active, filters, fingerprint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Idle,
    Fetching,
    Errored,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub query: QueryIdentity,
    pub generation: u64,
    pub after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Appended(usize),
    Skipped,
    Discarded,
    Failed(ApiError),
}

#[derive(Debug, Clone)]
pub struct Cursor<T> {
    query: QueryIdentity,
    generation: u64,
    pages: Vec<Page<T>>,
    seen: HashSet<ItemId>,
    next_cursor: Option<String>,
    state: CursorState,
    error: Option<ApiError>,
    stale: bool,
    loaded_at: Option<Instant>,
    overrides: HashMap<ItemId, VotePatch>,
}

impl<T: PageItem> Cursor<T> {
    pub fn new(query: QueryIdentity) -> Self {
        Self {
            query,
            generation: 0,
            pages: Vec::new(),
            seen: HashSet::new(),
            next_cursor: None,
            state: CursorState::Idle,
            error: None,
            stale: false,
            loaded_at: None,
            overrides: HashMap::new(),
        }
    }

    pub fn open(&mut self, query: QueryIdentity) -> bool {
        if self.query == query {
            return false;
        }
        self.query = query;
        self.reset();
        true
    }

    pub fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.pages.clear();
        self.seen.clear();
        self.next_cursor = None;
        self.state = CursorState::Idle;
        self.error = None;
        self.stale = false;
        self.loaded_at = None;
        self.overrides.clear();
    }

    pub fn begin_fetch(&mut self) -> Option<FetchTicket> {
        match self.state {
            CursorState::Fetching | CursorState::Exhausted => return None,
            CursorState::Idle | CursorState::Errored => {}
        }
        if !self.pages.is_empty() && self.next_cursor.is_none() {
            return None;
        }
        self.state = CursorState::Fetching;
        Some(FetchTicket {
            query: self.query.clone(),
            generation: self.generation,
            after: self.next_cursor.clone(),
        })
    }

    pub fn complete(
        &mut self,
        ticket: &FetchTicket,
        result: Result<Page<T>, ApiError>,
    ) -> FetchOutcome {
        if !self.accepts(ticket) {
            return FetchOutcome::Discarded;
        }
        match result {
            Ok(page) => FetchOutcome::Appended(self.append(page)),
            Err(err) => {
                self.state = CursorState::Errored;
                self.error = Some(err.clone());
                FetchOutcome::Failed(err)
            }
        }
    }

    pub fn cancel(&mut self, ticket: &FetchTicket) -> bool {
        if !self.accepts(ticket) {
            return false;
        }
        self.state = if self.error.is_some() {
            CursorState::Errored
        } else {
            CursorState::Idle
        };
        true
    }

    pub fn fetch_next<F>(&mut self, fetch: F) -> FetchOutcome
    where
        F: FnOnce(&QueryIdentity, Option<&str>) -> Result<Page<T>, ApiError>,
    {
        let Some(ticket) = self.begin_fetch() else {
            return FetchOutcome::Skipped;
        };
        let result = fetch(&ticket.query, ticket.after.as_deref());
        self.complete(&ticket, result)
    }

    pub fn items(&self) -> Vec<T> {
        self.pages
            .iter()
            .flat_map(|page| page.items.iter().cloned())
            .collect()
    }

    pub fn item(&self, id: ItemId) -> Option<&T> {
        self.pages
            .iter()
            .flat_map(|page| page.items.iter())
            .find(|item| item.item_id() == id)
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.seen.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.state != CursorState::Exhausted && self.next_cursor.is_some()
    }

    pub fn is_unstarted(&self) -> bool {
        self.pages.is_empty() && self.state != CursorState::Fetching
    }

    pub fn is_fetching(&self) -> bool {
        self.state == CursorState::Fetching
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn error(&self) -> Option<&ApiError> {
        self.error.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn loaded_at(&self) -> Option<Instant> {
        self.loaded_at
    }

    pub fn is_stale_at(&self, now: Instant, max_age: Duration) -> bool {
        self.stale
            || self
                .loaded_at
                .map(|at| now.saturating_duration_since(at) > max_age)
                .unwrap_or(false)
    }

    pub fn apply_patch(&mut self, patch: &VotePatch) -> bool {
        let merged = match self.overrides.get(&patch.item_id) {
            Some(existing) => existing.merged_with(patch),
            None => patch.clone(),
        };
        self.overrides.insert(patch.item_id, merged);

        let mut hit = false;
        for page in &mut self.pages {
            for item in page.items.iter_mut().filter(|i| i.item_id() == patch.item_id) {
                item.apply_vote(patch);
                hit = true;
            }
        }
        hit
    }

    fn accepts(&self, ticket: &FetchTicket) -> bool {
        self.state == CursorState::Fetching
            && ticket.generation == self.generation
            && ticket.query == self.query
            && ticket.after == self.next_cursor
    }

    fn append(&mut self, mut page: Page<T>) -> usize {
        // Items already held (boundary shifts between requests) keep their
        // first position.
        let mut kept = Vec::with_capacity(page.items.len());
        for mut item in page.items.drain(..) {
            if !self.seen.insert(item.item_id()) {
                continue;
            }
            if let Some(patch) = self.overrides.get(&item.item_id()) {
                item.apply_vote(patch);
            }
            kept.push(item);
        }
        page.items = kept;
        self.next_cursor = page.continuation().map(str::to_string);
        page.next_cursor = self.next_cursor.clone();
        self.state = if self.next_cursor.is_some() {
            CursorState::Idle
        } else {
            CursorState::Exhausted
        };
        self.error = None;
        self.loaded_at = Some(Instant::now());
        let added = page.items.len();
        self.pages.push(page);
        added
    }
}
