use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use movievote::api::{
    Category, ItemId, ListFilters, Movie, Page, SortDirection, Tallies, VoteOutcome,
};
use movievote::controller::ListController;
use movievote::cursor::{QueryIdentity, Resource};
use movievote::data::{PageSource, VoteService};
use movievote::error::ApiError;
use movievote::identity::Provider;
use movievote::registry::Registry;
use movievote::storage::MemoryStore;
use movievote::trigger::ProximityGate;
use movievote::vote::{Notice, VoteCoordinator};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(5);

struct Hold {
    entered: Sender<()>,
    release: Receiver<()>,
}

// Popularity falls as the id grows; cursors are offsets.
struct FakeServer {
    movies: Vec<Movie>,
    page_size: usize,
    votes: Mutex<HashMap<ItemId, Category>>,
    hold: Mutex<Option<Hold>>,
    page_calls: AtomicUsize,
    vote_calls: AtomicUsize,
}

impl FakeServer {
    fn new(count: ItemId, page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            movies: (1..=count).map(movie).collect(),
            page_size,
            votes: Mutex::new(HashMap::new()),
            hold: Mutex::new(None),
            page_calls: AtomicUsize::new(0),
            vote_calls: AtomicUsize::new(0),
        })
    }

    fn hold_next(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        *self.hold.lock() = Some(Hold {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }

    fn tallies_for(&self, id: ItemId) -> Tallies {
        match self.votes.lock().get(&id) {
            Some(category) => Tallies::default().with(*category, 1),
            None => Tallies::default(),
        }
    }
}

impl PageSource<Movie> for FakeServer {
    fn fetch_page(&self, query: &QueryIdentity, cursor: Option<&str>) -> Result<Page<Movie>, ApiError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.hold.lock().take();
        if let Some(hold) = hold {
            let _ = hold.entered.send(());
            let _ = hold.release.recv_timeout(WAIT);
        }

        let mut ordered = self.movies.clone();
        if query.filters.sort_dir == SortDirection::Asc {
            ordered.reverse();
        }
        let offset: usize = match cursor {
            Some(token) => token
                .parse()
                .map_err(|_| ApiError::new(Some(400), "bad cursor"))?,
            None => 0,
        };
        let end = (offset + self.page_size).min(ordered.len());
        let items: Vec<Movie> = ordered[offset.min(end)..end]
            .iter()
            .cloned()
            .map(|mut m| {
                m.tallies = self.tallies_for(m.id);
                m.voted_category = self.votes.lock().get(&m.id).copied();
                m
            })
            .collect();
        let next = (end < ordered.len()).then(|| end.to_string());
        Ok(Page::new(items, next.as_deref()))
    }
}

impl VoteService for FakeServer {
    fn submit_vote(&self, item_id: ItemId, category: Category, _fingerprint: &str) -> Result<VoteOutcome, ApiError> {
        self.vote_calls.fetch_add(1, Ordering::SeqCst);
        let mut votes = self.votes.lock();
        if let Some(existing) = votes.get(&item_id) {
            return Ok(VoteOutcome {
                inserted: false,
                message: "You already voted for this movie".into(),
                tallies: None,
                voted_category: Some(*existing),
            });
        }
        votes.insert(item_id, category);
        Ok(VoteOutcome {
            inserted: true,
            message: "Vote recorded".into(),
            tallies: Some(Tallies::default().with(category, 1)),
            voted_category: Some(category),
        })
    }
}

fn movie(id: ItemId) -> Movie {
    Movie {
        id,
        title: format!("movie {id}"),
        release_date: "2024-01-01".into(),
        overview: None,
        poster_path: None,
        backdrop_path: None,
        popularity: (100 - id) as f64,
        tallies: Tallies::default(),
        voted_category: None,
        cinemagia_url: None,
        imdb_url: None,
    }
}

struct World {
    server: Arc<FakeServer>,
    registry: Arc<Registry<Movie>>,
    identity: Arc<Provider>,
    votes: Arc<VoteCoordinator>,
}

impl World {
    fn new(count: ItemId, page_size: usize) -> Self {
        let server = FakeServer::new(count, page_size);
        let registry = Arc::new(Registry::new());
        let identity = Arc::new(Provider::new(Some(Arc::new(MemoryStore::new())), "sync-test"));
        let votes = Arc::new(VoteCoordinator::new(server.clone(), registry.clone()));
        Self {
            server,
            registry,
            identity,
            votes,
        }
    }

    fn list(&self, filters: ListFilters) -> ListController<Movie> {
        ListController::new(
            self.server.clone(),
            self.registry.clone(),
            self.identity.clone(),
            Resource::Active,
            filters,
        )
        .with_gate(ProximityGate::new(Duration::ZERO))
        .with_votes(self.votes.clone())
    }
}

fn ids(list: &ListController<Movie>) -> Vec<ItemId> {
    list.items().iter().map(|m| m.id).collect()
}

fn ascending() -> ListFilters {
    ListFilters {
        sort_dir: SortDirection::Asc,
        ..ListFilters::default()
    }
}

#[test]
fn scenario_a_pages_until_exhausted() {
    let world = World::new(3, 2);
    let mut list = world.list(ListFilters::default());

    list.mount();
    assert!(list.wait_idle(WAIT));
    assert_eq!(ids(&list), vec![1, 2]);
    assert!(list.view().has_more);

    assert!(list.near_end());
    assert!(list.wait_idle(WAIT));
    assert_eq!(ids(&list), vec![1, 2, 3]);
    let view = list.view();
    assert!(!view.has_more);
    assert!(view.exhausted);

    assert!(!list.near_end());
    assert_eq!(world.server.page_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn scrolling_triggers_only_near_the_end() {
    let world = World::new(40, 18);
    let mut list = world.list(ListFilters::default()).with_prefetch_margin(6);
    list.mount();
    assert!(list.wait_idle(WAIT));

    assert!(!list.scrolled_to(5));
    assert!(list.scrolled_to(12));
    assert!(list.wait_idle(WAIT));
    assert_eq!(list.items().len(), 36);
}

#[test]
fn scenario_b_and_c_vote_reaches_every_cursor() {
    let world = World::new(4, 4);
    let mut shown = world.list(ListFilters::default());
    let mut hidden = world.list(ascending());

    shown.mount();
    hidden.mount();
    assert!(shown.wait_idle(WAIT));
    assert!(hidden.wait_idle(WAIT));
    hidden.unmount();

    let result = shown.vote(2, Category::Couple);
    let notice = Notice::for_vote(&result);
    assert_eq!(notice.title, "Vote recorded");
    assert!(!shown.is_voting(2));

    let patched = |items: Vec<Movie>| items.into_iter().find(|m| m.id == 2).unwrap();
    let in_shown = patched(shown.items());
    assert_eq!(in_shown.voted_category, Some(Category::Couple));
    assert_eq!(in_shown.tallies.get(Category::Couple), 1);

    let hidden_query = QueryIdentity::new(
        Resource::Active,
        ascending(),
        Some(world.identity.identifier()),
    );
    let in_hidden = patched(world.registry.items(&hidden_query));
    assert_eq!(in_hidden.voted_category, Some(Category::Couple));
    assert!(world.registry.with_cursor(&hidden_query, |c| c.is_stale()).unwrap());
    assert!(!shown.view().stale);

    // Scenario C: a different category for the same movie comes back as a
    // duplicate and the recorded category stands.
    let result = shown.vote(2, Category::Arr);
    let outcome = result.as_ref().unwrap();
    assert!(!outcome.inserted);
    assert_eq!(Notice::for_vote(&result).title, "Duplicate vote");
    let in_shown = patched(shown.items());
    assert_eq!(in_shown.voted_category, Some(Category::Couple));
    assert_eq!(in_shown.tallies.get(Category::Couple), 1);
    assert_eq!(in_shown.tallies.get(Category::Arr), 0);

    // The stale listing reloads when it comes back on screen.
    let calls_before = world.server.page_calls.load(Ordering::SeqCst);
    hidden.mount();
    assert!(hidden.wait_idle(WAIT));
    assert_eq!(world.server.page_calls.load(Ordering::SeqCst), calls_before + 1);
    let view = hidden.view();
    assert!(!view.stale);
    let reloaded = patched(view.items);
    assert_eq!(reloaded.voted_category, Some(Category::Couple));
    assert_eq!(world.server.vote_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn scenario_d_response_for_old_filters_is_discarded() {
    let world = World::new(6, 3);
    let mut list = world.list(ListFilters::default());

    let (entered, release) = world.server.hold_next();
    list.mount();
    entered.recv_timeout(WAIT).unwrap();

    list.set_filters(ascending());
    assert!(list.wait_idle(WAIT));
    assert_eq!(ids(&list), vec![6, 5, 4]);

    release.send(()).unwrap();
    assert!(!list.wait(Duration::from_millis(300)));
    assert_eq!(ids(&list), vec![6, 5, 4]);
    assert_eq!(list.query().unwrap().filters, ascending());
}

#[test]
fn vote_patch_survives_page_that_lands_afterwards() {
    let world = World::new(6, 3);
    let mut list = world.list(ListFilters::default());
    list.mount();
    assert!(list.wait_idle(WAIT));

    // Page two is in flight with pre-vote data when the vote resolves.
    let (entered, release) = world.server.hold_next();
    assert!(list.near_end());
    entered.recv_timeout(WAIT).unwrap();

    let outcome = VoteOutcome {
        inserted: true,
        message: "Vote recorded".into(),
        tallies: Some(Tallies::default().with(Category::Streaming, 5)),
        voted_category: Some(Category::Streaming),
    };
    world.votes.apply(5, &outcome);

    release.send(()).unwrap();
    assert!(list.wait_idle(WAIT));
    let m5 = list.items().into_iter().find(|m| m.id == 5).unwrap();
    assert_eq!(m5.voted_category, Some(Category::Streaming));
    assert_eq!(m5.tallies.get(Category::Streaming), 5);
}
