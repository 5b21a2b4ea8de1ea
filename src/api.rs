use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::error::{ApiError, ParseEnumError};

pub const FINGERPRINT_HEADER: &str = "X-Fingerprint";
pub const DEFAULT_PAGE_SIZE: u32 = 18;
pub const DEFAULT_IMAGE_BASE_URL: &str = "https://image.tmdb.org/t/p/w342";

pub type ItemId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SoloFriends,
    Couple,
    Streaming,
    Arr,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::SoloFriends,
        Category::Couple,
        Category::Streaming,
        Category::Arr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::SoloFriends => "solo_friends",
            Category::Couple => "couple",
            Category::Streaming => "streaming",
            Category::Arr => "arr",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::SoloFriends => "Solo/Friends",
            Category::Couple => "Couple",
            Category::Streaming => "Streaming",
            Category::Arr => "ARR",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "solo_friends" | "solo" | "friends" => Ok(Category::SoloFriends),
            "couple" => Ok(Category::Couple),
            "streaming" => Ok(Category::Streaming),
            "arr" => Ok(Category::Arr),
            _ => Err(ParseEnumError::new("category", s)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, u64>", into = "BTreeMap<String, u64>")]
pub struct Tallies(BTreeMap<Category, u64>);

impl From<BTreeMap<String, u64>> for Tallies {
    fn from(raw: BTreeMap<String, u64>) -> Self {
        Tallies(
            raw.into_iter()
                .filter_map(|(key, count)| key.parse::<Category>().ok().map(|cat| (cat, count)))
                .collect(),
        )
    }
}

impl From<Tallies> for BTreeMap<String, u64> {
    fn from(tallies: Tallies) -> Self {
        tallies
            .0
            .into_iter()
            .map(|(cat, count)| (cat.as_str().to_string(), count))
            .collect()
    }
}

impl Tallies {
    pub fn get(&self, category: Category) -> u64 {
        self.0.get(&category).copied().unwrap_or(0)
    }

    pub fn set(&mut self, category: Category, count: u64) {
        self.0.insert(category, count);
    }

    pub fn with(mut self, category: Category, count: u64) -> Self {
        self.set(category, count);
        self
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    // A tie across three or more categories means nothing stands out.
    pub fn hottest(&self) -> Vec<Category> {
        let max = Category::ALL
            .iter()
            .map(|cat| self.get(*cat))
            .max()
            .unwrap_or(0);
        if max == 0 {
            return Vec::new();
        }
        let hot: Vec<Category> = Category::ALL
            .iter()
            .copied()
            .filter(|cat| self.get(*cat) == max)
            .collect();
        if hot.len() >= 3 {
            Vec::new()
        } else {
            hot
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Popularity,
    ReleaseDate,
    SoloFriends,
    Couple,
    Streaming,
    Arr,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Popularity => "popularity",
            SortField::ReleaseDate => "release_date",
            SortField::SoloFriends => "solo_friends",
            SortField::Couple => "couple",
            SortField::Streaming => "streaming",
            SortField::Arr => "arr",
        }
    }
}

impl FromStr for SortField {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "popularity" => Ok(SortField::Popularity),
            "release_date" | "release" => Ok(SortField::ReleaseDate),
            "solo_friends" => Ok(SortField::SoloFriends),
            "couple" => Ok(SortField::Couple),
            "streaming" => Ok(SortField::Streaming),
            "arr" => Ok(SortField::Arr),
            _ => Err(ParseEnumError::new("sort field", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

impl FromStr for SortDirection {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            _ => Err(ParseEnumError::new("sort direction", s)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListFilters {
    pub sort_by: SortField,
    pub sort_dir: SortDirection,
    pub min_popularity: Option<f64>,
    pub max_popularity: Option<f64>,
    pub limit: u32,
}

impl Default for ListFilters {
    fn default() -> Self {
        Self {
            sort_by: SortField::default(),
            sort_dir: SortDirection::default(),
            min_popularity: None,
            max_popularity: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

// Popularity bounds compare bitwise so filters can key a cache.
impl PartialEq for ListFilters {
    fn eq(&self, other: &Self) -> bool {
        self.sort_by == other.sort_by
            && self.sort_dir == other.sort_dir
            && self.min_popularity.map(f64::to_bits) == other.min_popularity.map(f64::to_bits)
            && self.max_popularity.map(f64::to_bits) == other.max_popularity.map(f64::to_bits)
            && self.limit == other.limit
    }
}

impl Eq for ListFilters {}

impl Hash for ListFilters {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sort_by.hash(state);
        self.sort_dir.hash(state);
        self.min_popularity.map(f64::to_bits).hash(state);
        self.max_popularity.map(f64::to_bits).hash(state);
        self.limit.hash(state);
    }
}

impl ListFilters {
    pub fn into_params(self, cursor: Option<&str>) -> Vec<(String, String)> {
        let mut params = vec![
            ("sort_by".to_string(), self.sort_by.as_str().to_string()),
            ("sort_dir".to_string(), self.sort_dir.as_str().to_string()),
        ];
        if let Some(min) = self.min_popularity {
            params.push(("min_popularity".into(), min.to_string()));
        }
        if let Some(max) = self.max_popularity {
            params.push(("max_popularity".into(), max.to_string()));
        }
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            params.push(("cursor".into(), cursor.to_string()));
        }
        if self.limit > 0 {
            params.push(("limit".into(), self.limit.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<&str>) -> Self {
        let count = items.len() as u64;
        Self {
            items,
            count,
            total: count,
            next_cursor: next_cursor.map(str::to_string),
        }
    }

    pub fn continuation(&self) -> Option<&str> {
        self.next_cursor.as_deref().filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub id: ItemId,
    pub title: String,
    #[serde(default, deserialize_with = "null_default")]
    pub release_date: String,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub backdrop_path: Option<String>,
    #[serde(default)]
    pub popularity: f64,
    #[serde(default, deserialize_with = "null_default")]
    pub tallies: Tallies,
    #[serde(default, deserialize_with = "known_category")]
    pub voted_category: Option<Category>,
    #[serde(default)]
    pub cinemagia_url: Option<String>,
    #[serde(default)]
    pub imdb_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub month: String,
    pub movie_id: ItemId,
    #[serde(default, deserialize_with = "null_default")]
    pub tallies: Tallies,
    pub closed_at: DateTime<Utc>,
    pub title: String,
    #[serde(default, deserialize_with = "null_default")]
    pub release_date: String,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub backdrop_path: Option<String>,
    #[serde(default)]
    pub popularity: f64,
    #[serde(default, deserialize_with = "known_category")]
    pub voted_category: Option<Category>,
    #[serde(default)]
    pub cinemagia_url: Option<String>,
    #[serde(default)]
    pub imdb_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub movie_id: ItemId,
    pub category: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPeriod {
    pub year: i32,
    #[serde(default)]
    pub months: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotPeriods {
    #[serde(default)]
    items: Vec<SnapshotPeriod>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub inserted: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub tallies: Option<Tallies>,
    #[serde(default, deserialize_with = "known_category")]
    pub voted_category: Option<Category>,
}

#[derive(Debug, Serialize)]
struct VoteRequest {
    category: Category,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

fn null_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn known_category<'de, D>(deserializer: D) -> std::result::Result<Option<Category>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.and_then(|raw| raw.parse().ok()))
}

pub fn resolve_image_url(base: &str, path: Option<&str>) -> Option<String> {
    let path = path.map(str::trim).filter(|p| !p.is_empty())?;
    let lower = path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(path.to_string());
    }
    let base = base.trim().trim_end_matches('/');
    if base.is_empty() {
        return None;
    }
    if path.starts_with('/') {
        Some(format!("{base}{path}"))
    } else {
        Some(format!("{base}/{path}"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: String,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            bail!("api: base url required");
        }
        if config.user_agent.trim().is_empty() {
            bail!("api: user agent required");
        }
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url)?;

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub fn health(&self) -> std::result::Result<HealthResponse, ApiError> {
        self.get_json("/health", &[], None)
    }

    pub fn active_movies(
        &self,
        filters: ListFilters,
        cursor: Option<&str>,
        fingerprint: Option<&str>,
    ) -> std::result::Result<Page<Movie>, ApiError> {
        self.get_json("/movies/active", &filters.into_params(cursor), fingerprint)
    }

    pub fn snapshots(
        &self,
        year: i32,
        month: u32,
        filters: ListFilters,
        cursor: Option<&str>,
        fingerprint: Option<&str>,
    ) -> std::result::Result<Page<Snapshot>, ApiError> {
        if !(1..=12).contains(&month) {
            return Err(ApiError::invalid(format!("month out of range: {month}")));
        }
        let path = format!("/snapshots/{year}/{month}");
        self.get_json(&path, &filters.into_params(cursor), fingerprint)
    }

    pub fn snapshot_periods(&self) -> std::result::Result<Vec<SnapshotPeriod>, ApiError> {
        let periods: SnapshotPeriods = self.get_json("/snapshots/available", &[], None)?;
        Ok(periods.items)
    }

    pub fn movie_tallies(
        &self,
        movie_id: ItemId,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> std::result::Result<Page<Tally>, ApiError> {
        let mut params = Vec::new();
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            params.push(("cursor".to_string(), cursor.to_string()));
        }
        if let Some(limit) = limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        let path = format!("/movies/{movie_id}/tallies");
        self.get_json(&path, &params, None)
    }

    pub fn submit_vote(
        &self,
        movie_id: ItemId,
        category: Category,
        fingerprint: Option<&str>,
    ) -> std::result::Result<VoteOutcome, ApiError> {
        let url = self.url(&format!("/movies/{movie_id}/votes"), &[])?;
        let mut req = self
            .http
            .post(url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&VoteRequest { category });
        req = with_fingerprint(req, fingerprint);
        self.send(req)
    }

    fn get_json<T>(
        &self,
        path: &str,
        params: &[(String, String)],
        fingerprint: Option<&str>,
    ) -> std::result::Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path, params)?;
        let req = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.clone());
        self.send(with_fingerprint(req, fingerprint))
    }

    fn url(&self, path: &str, params: &[(String, String)]) -> std::result::Result<Url, ApiError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|err| ApiError::invalid(format!("invalid url for {path}: {err}")))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn send<T>(&self, req: RequestBuilder) -> std::result::Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let resp = req.send().map_err(ApiError::transport)?;
        handle_response(resp)
    }
}

fn with_fingerprint(req: RequestBuilder, fingerprint: Option<&str>) -> RequestBuilder {
    match fingerprint.filter(|f| !f.is_empty()) {
        Some(fp) => req.header(FINGERPRINT_HEADER, fp),
        None => req,
    }
}

fn handle_response<T>(resp: Response) -> std::result::Result<T, ApiError>
where
    T: DeserializeOwned,
{
    let status = resp.status();
    let is_json = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("application/json"))
        .unwrap_or(false);

    if !status.is_success() {
        let message = if is_json {
            resp.json::<ErrorBody>().ok().and_then(|body| body.message)
        } else {
            None
        };
        return Err(ApiError::from_status(status, message));
    }

    resp.json::<T>().map_err(|err| {
        ApiError::new(
            Some(status.as_u16()),
            format!("decode response: {err}"),
        )
    })
}
