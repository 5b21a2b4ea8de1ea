use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::api::{Category, ItemId, ListFilters, SortDirection, SortField};

#[derive(Debug, Parser)]
#[command(name = "movievote")]
#[command(about = "Browse and vote on this month's movies", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/movievote/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List movies open for voting.
    Active {
        #[command(flatten)]
        filters: FilterArgs,
        /// Number of pages to load
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },

    /// List a closed month's results.
    Snapshots {
        year: i32,
        month: u32,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },

    /// Show which months have results.
    Periods,

    /// Vote for a movie in one category.
    Vote {
        movie_id: ItemId,
        /// solo_friends, couple, streaming or arr
        category: Category,
    },

    /// Per-category vote counts for one movie.
    Tallies {
        movie_id: ItemId,
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },

    /// Check that the server is up.
    Health,

    /// Show the identifier votes are sent with.
    Identity {
        /// Forget the stored identifier and derive a new one
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Debug, Clone, Args, Default)]
pub struct FilterArgs {
    /// popularity, release_date, solo_friends, couple, streaming or arr
    #[arg(long)]
    pub sort_by: Option<SortField>,
    /// asc or desc
    #[arg(long)]
    pub sort_dir: Option<SortDirection>,
    #[arg(long)]
    pub min_popularity: Option<f64>,
    #[arg(long)]
    pub max_popularity: Option<f64>,
    /// Page size (default from config)
    #[arg(long)]
    pub limit: Option<u32>,
}

impl FilterArgs {
    pub fn to_filters(&self, page_size: u32) -> ListFilters {
        ListFilters {
            sort_by: self.sort_by.unwrap_or_default(),
            sort_dir: self.sort_dir.unwrap_or_default(),
            min_popularity: self.min_popularity,
            max_popularity: self.max_popularity,
            limit: self.limit.unwrap_or(page_size),
        }
    }
}
