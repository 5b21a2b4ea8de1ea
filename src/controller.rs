use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::api::{Category, ItemId, ListFilters, Movie, Page, VoteOutcome};
use crate::cursor::{CursorState, FetchOutcome, FetchTicket, PageItem, QueryIdentity, Resource};
use crate::data::PageSource;
use crate::error::ApiError;
use crate::identity::Provider;
use crate::registry::Registry;
use crate::trigger::{self, ProximityGate, DEFAULT_PREFETCH_MARGIN};
use crate::vote::{VoteCoordinator, VoteError};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct ListView<T> {
    pub items: Vec<T>,
    pub loading: bool,
    pub loading_more: bool,
    pub error: Option<ApiError>,
    pub exhausted: bool,
    pub has_more: bool,
    pub stale: bool,
}

impl<T> Default for ListView<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            loading: false,
            loading_more: false,
            error: None,
            exhausted: false,
            has_more: false,
            stale: false,
        }
    }
}

struct PendingFetch {
    ticket: FetchTicket,
    cancel_flag: Arc<AtomicBool>,
}

struct PageResponse<T> {
    ticket: FetchTicket,
    result: Result<Page<T>, ApiError>,
}

pub struct ListController<T: PageItem> {
    source: Arc<dyn PageSource<T>>,
    registry: Arc<Registry<T>>,
    identity: Arc<Provider>,
    resource: Resource,
    filters: ListFilters,
    query: Option<QueryIdentity>,
    pending: Option<PendingFetch>,
    response_tx: Sender<PageResponse<T>>,
    response_rx: Receiver<PageResponse<T>>,
    gate: ProximityGate,
    prefetch_margin: usize,
    stale_after: Duration,
    mounted: bool,
    votes: Option<Arc<VoteCoordinator>>,
}

impl<T: PageItem> ListController<T> {
    pub fn new(
        source: Arc<dyn PageSource<T>>,
        registry: Arc<Registry<T>>,
        identity: Arc<Provider>,
        resource: Resource,
        filters: ListFilters,
    ) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            source,
            registry,
            identity,
            resource,
            filters,
            query: None,
            pending: None,
            response_tx,
            response_rx,
            gate: ProximityGate::default(),
            prefetch_margin: DEFAULT_PREFETCH_MARGIN,
            stale_after: DEFAULT_STALE_AFTER,
            mounted: false,
            votes: None,
        }
    }

    pub fn with_gate(mut self, gate: ProximityGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_prefetch_margin(mut self, margin: usize) -> Self {
        self.prefetch_margin = margin;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub fn filters(&self) -> ListFilters {
        self.filters
    }

    pub fn query(&self) -> Option<&QueryIdentity> {
        self.query.as_ref()
    }

    pub fn is_fetching(&self) -> bool {
        self.pending.is_some()
    }

    pub fn mount(&mut self) {
        self.mount_at(Instant::now());
    }

    pub fn mount_at(&mut self, now: Instant) {
        if self.mounted {
            return;
        }
        self.mounted = true;
        let query = self.current_query();
        let shared = self.registry.is_displayed(&query);
        let cursor = self.registry.show(&query);
        self.query = Some(query.clone());

        let (stale, unstarted) = {
            let cursor = cursor.lock();
            (
                !shared && cursor.is_stale_at(now, self.stale_after),
                cursor.is_unstarted(),
            )
        };
        if stale {
            debug!(resource = %query.resource.label(), "list: reloading stale cursor");
            self.registry.reset(&query);
            self.start_fetch();
        } else if unstarted {
            self.start_fetch();
        }
    }

    pub fn set_filters(&mut self, filters: ListFilters) {
        if filters == self.filters {
            return;
        }
        self.filters = filters;
        self.requery();
    }

    pub fn set_resource(&mut self, resource: Resource) {
        if resource == self.resource {
            return;
        }
        self.resource = resource;
        self.requery();
    }

    pub fn near_end(&mut self) -> bool {
        self.near_end_at(Instant::now())
    }

    pub fn near_end_at(&mut self, now: Instant) -> bool {
        if !self.mounted {
            return false;
        }
        let Some(query) = self.query.clone() else {
            return false;
        };
        let eligible = self
            .registry
            .with_cursor(&query, |cursor| {
                cursor.has_more() && cursor.state() == CursorState::Idle
            })
            .unwrap_or(false);
        if !eligible {
            return false;
        }
        let busy = self.pending.is_some();
        if !self.gate.offer(now, busy) {
            return false;
        }
        self.start_fetch()
    }

    pub fn scrolled_to(&mut self, position: usize) -> bool {
        let len = self
            .query
            .as_ref()
            .and_then(|query| self.registry.with_cursor(query, |cursor| cursor.len()))
            .unwrap_or(0);
        if !trigger::near_end(position, len, self.prefetch_margin) {
            return false;
        }
        self.near_end()
    }

    pub fn refresh(&mut self) {
        if !self.mounted {
            return;
        }
        self.cancel_pending();
        if let Some(query) = self.query.clone() {
            self.registry.reset(&query);
        }
        self.gate.reset();
        self.start_fetch();
    }

    pub fn retry(&mut self) -> bool {
        if !self.mounted || self.pending.is_some() {
            return false;
        }
        let errored = self
            .query
            .as_ref()
            .and_then(|query| {
                self.registry
                    .with_cursor(query, |cursor| cursor.state() == CursorState::Errored)
            })
            .unwrap_or(false);
        errored && self.start_fetch()
    }

    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(response) = self.response_rx.try_recv() {
            changed |= self.handle_response(response);
        }
        changed
    }

    pub fn wait(&mut self, timeout: Duration) -> bool {
        match self.response_rx.recv_timeout(timeout) {
            Ok(response) => {
                let changed = self.handle_response(response);
                self.poll() || changed
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending.is_some() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.wait(deadline - now);
        }
        true
    }

    pub fn view(&self) -> ListView<T> {
        let Some(query) = self.query.as_ref() else {
            return ListView::default();
        };
        self.registry
            .with_cursor(query, |cursor| {
                let fetching = cursor.is_fetching();
                ListView {
                    items: cursor.items(),
                    loading: fetching && cursor.is_empty(),
                    loading_more: fetching && !cursor.is_empty(),
                    error: cursor.error().cloned(),
                    exhausted: cursor.state() == CursorState::Exhausted,
                    has_more: cursor.has_more(),
                    stale: cursor.is_stale(),
                }
            })
            .unwrap_or_default()
    }

    pub fn items(&self) -> Vec<T> {
        self.view().items
    }

    pub fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.cancel_pending();
        if let Some(query) = self.query.as_ref() {
            self.registry.hide(query);
        }
        self.mounted = false;
        while self.response_rx.try_recv().is_ok() {}
    }

    fn current_query(&self) -> QueryIdentity {
        QueryIdentity::new(self.resource, self.filters, Some(self.identity.identifier()))
    }

    fn requery(&mut self) {
        let query = self.current_query();
        if !self.mounted {
            self.query = None;
            return;
        }
        self.cancel_pending();
        if let Some(previous) = self.query.take() {
            self.registry.hide(&previous);
        }
        self.registry.show(&query);
        self.registry.reset(&query);
        self.query = Some(query);
        self.gate.reset();
        self.start_fetch();
    }

    fn start_fetch(&mut self) -> bool {
        if !self.mounted || self.pending.is_some() {
            return false;
        }
        let Some(query) = self.query.as_ref() else {
            return false;
        };
        let Some(ticket) = self.registry.begin_fetch(query) else {
            return false;
        };

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending = Some(PendingFetch {
            ticket: ticket.clone(),
            cancel_flag: cancel_flag.clone(),
        });
        debug!(
            resource = %ticket.query.resource.label(),
            after = ticket.after.as_deref().unwrap_or(""),
            "list: fetching page"
        );

        let tx = self.response_tx.clone();
        let source = self.source.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = source.fetch_page(&ticket.query, ticket.after.as_deref());
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(PageResponse { ticket, result });
        });
        true
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
            self.registry.cancel(&pending.ticket);
        }
    }

    fn handle_response(&mut self, response: PageResponse<T>) -> bool {
        if !self.mounted {
            return false;
        }
        let Some(pending) = &self.pending else {
            return false;
        };
        if pending.cancel_flag.load(Ordering::SeqCst) || pending.ticket != response.ticket {
            debug!("list: ignoring superseded response");
            return false;
        }
        self.pending = None;

        match self.registry.complete(&response.ticket, response.result) {
            FetchOutcome::Appended(added) => {
                debug!(added, "list: page appended");
                true
            }
            FetchOutcome::Failed(err) => {
                warn!(resource = %response.ticket.query.resource.label(), error = %err, "list: page fetch failed");
                true
            }
            FetchOutcome::Discarded | FetchOutcome::Skipped => {
                debug!("list: response discarded by cursor");
                false
            }
        }
    }
}

impl ListController<Movie> {
    pub fn with_votes(mut self, votes: Arc<VoteCoordinator>) -> Self {
        debug_assert!(Arc::ptr_eq(votes.registry(), &self.registry));
        self.votes = Some(votes);
        self
    }

    pub fn vote(&mut self, item_id: ItemId, category: Category) -> Result<VoteOutcome, VoteError> {
        let Some(votes) = self.votes.clone() else {
            return Err(VoteError::Unsupported);
        };
        let identifier = self.identity.identifier();
        votes.submit_vote(item_id, category, &identifier)
    }

    pub fn is_voting(&self, item_id: ItemId) -> bool {
        self.votes
            .as_ref()
            .map(|votes| votes.is_voting(item_id))
            .unwrap_or(false)
    }
}

impl<T: PageItem> Drop for ListController<T> {
    fn drop(&mut self) {
        self.unmount();
    }
}
