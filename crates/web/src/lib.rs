mod brave;
mod duckduckgo;
mod scrape;

pub use brave::BraveSearch;
pub use duckduckgo::DuckDuckGoSearch;
pub use scrape::{HttpScraper, ScrapedPage};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sites commonly refuse the default reqwest agent string.
pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// One search result. `content` stays empty until a caller deep-fetches
/// the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// A web search backend. Implementations return the top hits for a
/// query, best first.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>>;
}

/// Fetches a page and reduces it to readable markdown.
#[async_trait]
pub trait PageScraper: Send + Sync {
    async fn scrape(&self, url: &str) -> Result<ScrapedPage>;
}
