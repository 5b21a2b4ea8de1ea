use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::api::Page;
use crate::cursor::{Cursor, FetchOutcome, FetchTicket, PageItem, QueryIdentity};
use crate::error::ApiError;

pub const DEFAULT_RETAINED: usize = 8;

pub type SharedCursor<T> = Arc<Mutex<Cursor<T>>>;

struct Entry<T> {
    cursor: SharedCursor<T>,
    viewers: usize,
    last_used: u64,
}

// Lock order: `entries`, then a cursor.
pub struct Registry<T> {
    entries: RwLock<HashMap<QueryIdentity, Entry<T>>>,
    retained: usize,
    clock: AtomicU64,
}

impl<T: PageItem> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PageItem> Registry<T> {
    pub fn new() -> Self {
        Self::with_retained(DEFAULT_RETAINED)
    }

    pub fn with_retained(retained: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retained,
            clock: AtomicU64::new(0),
        }
    }

    pub fn show(&self, query: &QueryIdentity) -> SharedCursor<T> {
        let tick = self.tick();
        let mut entries = self.entries.write();
        let entry = entries.entry(query.clone()).or_insert_with(|| Entry {
            cursor: Arc::new(Mutex::new(Cursor::new(query.clone()))),
            viewers: 0,
            last_used: tick,
        });
        entry.viewers += 1;
        entry.last_used = tick;
        entry.cursor.clone()
    }

    pub fn hide(&self, query: &QueryIdentity) {
        let tick = self.tick();
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(query) {
            entry.viewers = entry.viewers.saturating_sub(1);
            entry.last_used = tick;
        }
        self.trim(&mut entries);
    }

    pub fn get(&self, query: &QueryIdentity) -> Option<SharedCursor<T>> {
        self.entries.read().get(query).map(|entry| entry.cursor.clone())
    }

    pub fn is_displayed(&self, query: &QueryIdentity) -> bool {
        self.entries
            .read()
            .get(query)
            .map(|entry| entry.viewers > 0)
            .unwrap_or(false)
    }

    pub fn with_cursor<R>(
        &self,
        query: &QueryIdentity,
        f: impl FnOnce(&mut Cursor<T>) -> R,
    ) -> Option<R> {
        let cursor = self.get(query)?;
        let mut guard = cursor.lock();
        Some(f(&mut guard))
    }

    pub fn cursors(&self) -> Vec<(QueryIdentity, SharedCursor<T>, bool)> {
        self.entries
            .read()
            .iter()
            .map(|(query, entry)| (query.clone(), entry.cursor.clone(), entry.viewers > 0))
            .collect()
    }

    pub fn reset(&self, query: &QueryIdentity) -> bool {
        self.with_cursor(query, |cursor| cursor.reset()).is_some()
    }

    pub fn begin_fetch(&self, query: &QueryIdentity) -> Option<FetchTicket> {
        self.with_cursor(query, |cursor| cursor.begin_fetch()).flatten()
    }

    pub fn complete(&self, ticket: &FetchTicket, result: Result<Page<T>, ApiError>) -> FetchOutcome {
        match self.with_cursor(&ticket.query, |cursor| cursor.complete(ticket, result)) {
            Some(outcome) => outcome,
            None => {
                debug!(resource = %ticket.query.resource.label(), "registry: response for evicted cursor dropped");
                FetchOutcome::Discarded
            }
        }
    }

    pub fn cancel(&self, ticket: &FetchTicket) -> bool {
        self.with_cursor(&ticket.query, |cursor| cursor.cancel(ticket))
            .unwrap_or(false)
    }

    pub fn items(&self, query: &QueryIdentity) -> Vec<T> {
        self.with_cursor(query, |cursor| cursor.items())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn trim(&self, entries: &mut HashMap<QueryIdentity, Entry<T>>) {
        let mut hidden: Vec<(u64, QueryIdentity)> = entries
            .iter()
            .filter(|(_, entry)| entry.viewers == 0)
            .map(|(query, entry)| (entry.last_used, query.clone()))
            .collect();
        if hidden.len() <= self.retained {
            return;
        }
        hidden.sort_by_key(|(last_used, _)| *last_used);
        let excess = hidden.len() - self.retained;
        for (_, query) in hidden.into_iter().take(excess) {
            debug!(resource = %query.resource.label(), "registry: evicting hidden cursor");
            entries.remove(&query);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ItemId, ListFilters, Movie, SortField, Tallies};

    fn movie(id: ItemId) -> Movie {
        Movie {
            id,
            title: format!("movie {id}"),
            release_date: String::new(),
            overview: None,
            poster_path: None,
            backdrop_path: None,
            popularity: 0.0,
            tallies: Tallies::default(),
            voted_category: None,
            cinemagia_url: None,
            imdb_url: None,
        }
    }

    fn load(registry: &Registry<Movie>, query: &QueryIdentity, ids: &[ItemId], next: Option<&str>) {
        let ticket = registry.begin_fetch(query).unwrap();
        let page = Page::new(ids.iter().copied().map(movie).collect(), next);
        registry.complete(&ticket, Ok(page));
    }

    fn by_popularity() -> QueryIdentity {
        QueryIdentity::active(ListFilters::default(), None)
    }

    fn by_couple() -> QueryIdentity {
        QueryIdentity::active(
            ListFilters {
                sort_by: SortField::Couple,
                ..ListFilters::default()
            },
            None,
        )
    }

    fn min_popularity(n: usize) -> QueryIdentity {
        QueryIdentity::active(
            ListFilters {
                min_popularity: Some(n as f64),
                ..ListFilters::default()
            },
            None,
        )
    }

    #[test]
    fn same_identity_shares_cursor() {
        let registry: Registry<Movie> = Registry::new();
        let a = registry.show(&by_popularity());
        let b = registry.show(&by_popularity());
        assert!(Arc::ptr_eq(&a, &b));
        registry.show(&by_couple());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn viewers_are_counted() {
        let registry: Registry<Movie> = Registry::new();
        let q = by_popularity();
        registry.show(&q);
        registry.show(&q);
        registry.hide(&q);
        assert!(registry.is_displayed(&q));
        registry.hide(&q);
        assert!(!registry.is_displayed(&q));
        assert!(registry.get(&q).is_some());
    }

    #[test]
    fn hidden_cursors_are_capped_oldest_first() {
        let registry: Registry<Movie> = Registry::with_retained(2);
        let shown = by_couple();
        registry.show(&shown);
        for n in 0..5 {
            let q = min_popularity(n);
            registry.show(&q);
            load(&registry, &q, &[n as ItemId], None);
            registry.hide(&q);
        }

        assert_eq!(registry.len(), 3);
        assert!(registry.get(&shown).is_some());
        assert!(registry.get(&min_popularity(0)).is_none());
        assert!(registry.get(&min_popularity(2)).is_none());
        assert_eq!(registry.items(&min_popularity(3))[0].id, 3);
        assert_eq!(registry.items(&min_popularity(4))[0].id, 4);
    }

    #[test]
    fn cursors_report_display_state() {
        let registry: Registry<Movie> = Registry::new();
        registry.show(&by_popularity());
        registry.show(&by_couple());
        registry.hide(&by_couple());
        let mut seen: Vec<(SortField, bool)> = registry
            .cursors()
            .into_iter()
            .map(|(query, _, displayed)| (query.filters.sort_by, displayed))
            .collect();
        seen.sort_by_key(|(field, _)| field.as_str());
        assert_eq!(
            seen,
            vec![(SortField::Couple, false), (SortField::Popularity, true)]
        );
    }

    #[test]
    fn response_for_evicted_cursor_is_discarded() {
        let registry: Registry<Movie> = Registry::with_retained(0);
        let q = by_popularity();
        registry.show(&q);
        let ticket = registry.begin_fetch(&q).unwrap();
        registry.hide(&q);
        assert!(registry.is_empty());
        let outcome = registry.complete(&ticket, Ok(Page::new(vec![movie(1)], None)));
        assert_eq!(outcome, FetchOutcome::Discarded);
    }
}
