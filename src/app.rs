use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::warn;

use crate::api::{self, Category, Movie, Snapshot, Tallies, Tally};
use crate::cli::{Cli, Command};
use crate::config::{self, Config};
use crate::controller::{ListController, ListView};
use crate::cursor::{PageItem, Resource};
use crate::data::{ActiveMovieSource, ApiVoteService, PageSource, SnapshotSource, TallySource};
use crate::identity::Provider;
use crate::registry::Registry;
use crate::storage::{self, IdentityStore};
use crate::trigger::ProximityGate;
use crate::vote::{Notice, NoticeLevel, VoteCoordinator};

pub fn run(cli: Cli) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: cli.config.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    let json = cli.json;

    match cli.command {
        Command::Active { filters, pages } => {
            let client = client(&cfg)?;
            let mut list = list_controller::<Movie>(
                &cfg,
                Arc::new(ActiveMovieSource::new(client)),
                Resource::Active,
                filters.to_filters(cfg.api.page_size),
            );
            let view = load_pages(&mut list, &cfg, pages)?;
            print_movies(&view.items, &cfg.api.image_base_url, json)
        }
        Command::Snapshots {
            year,
            month,
            filters,
            pages,
        } => {
            if !(1..=12).contains(&month) {
                bail!("month must be between 1 and 12, got {month}");
            }
            let client = client(&cfg)?;
            let mut list = list_controller::<Snapshot>(
                &cfg,
                Arc::new(SnapshotSource::new(client)),
                Resource::Snapshot { year, month },
                filters.to_filters(cfg.api.page_size),
            );
            let view = load_pages(&mut list, &cfg, pages)?;
            print_snapshots(&view.items, &cfg.api.image_base_url, json)
        }
        Command::Periods => {
            let periods = client(&cfg)?
                .snapshot_periods()
                .context("fetch snapshot periods")?;
            if json {
                return print_json(&periods);
            }
            if periods.is_empty() {
                println!("No closed months yet.");
            }
            for period in periods {
                let months: Vec<String> = period.months.iter().map(|m| format!("{m:02}")).collect();
                println!("{}: {}", period.year, months.join(", "));
            }
            Ok(())
        }
        Command::Vote { movie_id, category } => {
            let client = client(&cfg)?;
            let identity = provider(&cfg);
            let coordinator = VoteCoordinator::new(
                Arc::new(ApiVoteService::new(client)),
                Arc::new(Registry::new()),
            );
            let result = coordinator.submit_vote(movie_id, category, &identity.identifier());
            let notice = Notice::for_vote(&result);
            match result {
                Ok(outcome) => {
                    if json {
                        return print_json(&outcome);
                    }
                    println!("{}: {}", notice.title, notice.message);
                    if let Some(recorded) = outcome.voted_category {
                        println!("Your vote: {}", recorded.label());
                    }
                    if let Some(tallies) = outcome.tallies.as_ref() {
                        println!("{}", tallies_summary(tallies));
                    }
                    Ok(())
                }
                Err(err) => {
                    debug_assert_eq!(notice.level, NoticeLevel::Error);
                    eprintln!("{}: {}", notice.title, notice.message);
                    Err(err).with_context(|| format!("vote for movie {movie_id}"))
                }
            }
        }
        Command::Tallies { movie_id, pages } => {
            let client = client(&cfg)?;
            let mut list = list_controller::<Tally>(
                &cfg,
                Arc::new(TallySource::new(client)),
                Resource::Tallies { movie_id },
                api::ListFilters {
                    limit: cfg.api.page_size,
                    ..api::ListFilters::default()
                },
            );
            let view = load_pages(&mut list, &cfg, pages)?;
            print_tallies(&view.items, json)
        }
        Command::Health => {
            let health = client(&cfg)?.health().context("health check")?;
            if json {
                return print_json(&health);
            }
            println!(
                "{} ({}) up {}",
                health.status,
                health.service,
                humantime::format_duration(Duration::from_secs(health.uptime_seconds.max(0.0) as u64))
            );
            Ok(())
        }
        Command::Identity { reset } => {
            let store = open_store(&cfg);
            if reset {
                let removed = provider_with(&cfg, store.clone())
                    .forget()
                    .context("reset identity")?;
                if !removed && !json {
                    println!("No stored identifier to reset.");
                }
            }
            let identity = provider_with(&cfg, store);
            let record = identity.record();
            if json {
                return print_json(&serde_json::json!({
                    "key": identity.key(),
                    "identifier": record.identifier,
                    "strategy": record.strategy,
                    "created_at": record.created_at,
                }));
            }
            println!("{}", record.identifier);
            println!(
                "strategy {}, created {}",
                record.strategy.as_str(),
                record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            Ok(())
        }
    }
}

fn client(cfg: &Config) -> Result<Arc<api::Client>> {
    let client = api::Client::new(api::ClientConfig {
        base_url: cfg.api.base_url.clone(),
        user_agent: cfg.api.user_agent.clone(),
        timeout: Some(cfg.api.timeout),
        http_client: None,
    })
    .context("create api client")?;
    Ok(Arc::new(client))
}

fn open_store(cfg: &Config) -> Option<Arc<dyn IdentityStore>> {
    let path = cfg.storage.resolved_path()?;
    match storage::Store::open(storage::Options { path: Some(path) }) {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "storage unavailable, identity will not persist");
            None
        }
    }
}

fn provider(cfg: &Config) -> Arc<Provider> {
    Arc::new(provider_with(cfg, open_store(cfg)))
}

fn provider_with(cfg: &Config, store: Option<Arc<dyn IdentityStore>>) -> Provider {
    Provider::standard(
        store,
        cfg.identity.storage_key.clone(),
        cfg.identity.machine_id_paths.clone(),
        &cfg.api.user_agent,
    )
}

fn list_controller<T: PageItem>(
    cfg: &Config,
    source: Arc<dyn PageSource<T>>,
    resource: Resource,
    filters: api::ListFilters,
) -> ListController<T> {
    ListController::new(source, Arc::new(Registry::new()), provider(cfg), resource, filters)
        .with_gate(ProximityGate::new(cfg.list.debounce))
        .with_prefetch_margin(cfg.list.prefetch_margin)
        .with_stale_after(cfg.list.stale_after)
}

fn load_pages<T: PageItem>(
    list: &mut ListController<T>,
    cfg: &Config,
    pages: usize,
) -> Result<ListView<T>> {
    let timeout = cfg.api.timeout.saturating_mul(2);
    list.mount();
    if !list.wait_idle(timeout) {
        bail!("list: timed out waiting for the first page");
    }
    let mut loaded = 1;
    loop {
        let view = list.view();
        if let Some(err) = view.error.clone() {
            if view.items.is_empty() {
                return Err(err).context("list: fetch failed");
            }
            warn!(error = %err, "list: stopped early");
            return Ok(view);
        }
        if loaded >= pages.max(1) || !view.has_more {
            return Ok(view);
        }
        if list.near_end() {
            if !list.wait_idle(timeout) {
                bail!("list: timed out waiting for page {}", loaded + 1);
            }
            loaded += 1;
        } else {
            thread::sleep(cfg.list.debounce.max(Duration::from_millis(10)));
        }
    }
}

#[derive(Serialize)]
struct MovieRow<'a> {
    #[serde(flatten)]
    movie: &'a Movie,
    poster_url: Option<String>,
    hottest: Vec<Category>,
}

fn print_movies(movies: &[Movie], image_base: &str, json: bool) -> Result<()> {
    if json {
        let rows: Vec<MovieRow<'_>> = movies
            .iter()
            .map(|movie| MovieRow {
                movie,
                poster_url: api::resolve_image_url(image_base, movie.poster_path.as_deref()),
                hottest: movie.tallies.hottest(),
            })
            .collect();
        return print_json(&rows);
    }
    if movies.is_empty() {
        println!("No movies.");
    }
    for movie in movies {
        let voted = movie
            .voted_category
            .map(|c| format!("  [voted {}]", c.label()))
            .unwrap_or_default();
        println!(
            "{:>8}  {} ({})  popularity {:.1}{}",
            movie.id,
            movie.title,
            year_of(&movie.release_date),
            movie.popularity,
            voted
        );
        println!("          {}", tallies_summary(&movie.tallies));
    }
    Ok(())
}

fn print_snapshots(snapshots: &[Snapshot], image_base: &str, json: bool) -> Result<()> {
    if json {
        let rows: Vec<serde_json::Value> = snapshots
            .iter()
            .map(|snapshot| -> std::result::Result<serde_json::Value, serde_json::Error> {
                let mut value = serde_json::to_value(snapshot)?;
                if let Some(object) = value.as_object_mut() {
                    object.insert(
                        "poster_url".into(),
                        serde_json::to_value(api::resolve_image_url(
                            image_base,
                            snapshot.poster_path.as_deref(),
                        ))?,
                    );
                }
                Ok(value)
            })
            .collect::<std::result::Result<_, _>>()
            .context("encode snapshots")?;
        return print_json(&rows);
    }
    if snapshots.is_empty() {
        println!("No results for this month.");
    }
    for snapshot in snapshots {
        println!(
            "{:>8}  {} ({})  closed {}",
            snapshot.movie_id,
            snapshot.title,
            year_of(&snapshot.release_date),
            snapshot.closed_at.format("%Y-%m-%d")
        );
        println!("          {}", tallies_summary(&snapshot.tallies));
    }
    Ok(())
}

fn print_tallies(tallies: &[Tally], json: bool) -> Result<()> {
    if json {
        return print_json(&tallies);
    }
    if tallies.is_empty() {
        println!("No votes yet.");
    }
    for tally in tallies {
        let label = tally
            .category
            .parse::<Category>()
            .map(|c| c.label().to_string())
            .unwrap_or_else(|_| tally.category.clone());
        println!("{label:<14} {}", tally.count);
    }
    Ok(())
}

fn tallies_summary(tallies: &Tallies) -> String {
    let hottest = tallies.hottest();
    Category::ALL
        .iter()
        .map(|category| {
            let mark = if hottest.contains(category) { "*" } else { "" };
            format!("{}{} {}", category.label(), mark, tallies.get(*category))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn year_of(release_date: &str) -> &str {
    match release_date.get(..4) {
        Some(year) if !year.is_empty() => year,
        _ => "n/a",
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("encode json")?;
    println!("{out}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_marks_hottest() {
        let tallies = Tallies::default()
            .with(Category::Couple, 4)
            .with(Category::Arr, 1);
        assert_eq!(
            tallies_summary(&tallies),
            "Solo/Friends 0, Couple* 4, Streaming 0, ARR 1"
        );
    }

    #[test]
    fn year_prefix() {
        assert_eq!(year_of("2024-05-01"), "2024");
        assert_eq!(year_of(""), "n/a");
    }
}
