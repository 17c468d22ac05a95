use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use web::PageScraper;

/// What the extraction source saw: a regular page or a YouTube video.
#[derive(Debug, Clone)]
pub enum PageContent {
    Webpage {
        url: String,
        title: String,
        content: String,
    },
    Youtube {
        video_id: String,
        title: String,
        channel: String,
        description: String,
        transcript: String,
    },
}

/// Source of "what the user is currently looking at". A browser host
/// backs this with its content script; the CLI points it at a URL.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn active_page(&self) -> Result<PageContent>;
}

/// Extractor over a plain HTTP scraper with an explicitly selected URL.
pub struct SetUrlExtractor {
    scraper: Arc<dyn PageScraper>,
    url: Mutex<Option<String>>,
}

impl SetUrlExtractor {
    pub fn new(scraper: Arc<dyn PageScraper>) -> Self {
        Self {
            scraper,
            url: Mutex::new(None),
        }
    }

    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.lock().unwrap() = Some(url.into());
    }
}

#[async_trait]
impl PageExtractor for SetUrlExtractor {
    async fn active_page(&self) -> Result<PageContent> {
        let url = self
            .url
            .lock()
            .unwrap()
            .clone()
            .context("No page selected, set one with /page <url>")?;
        if is_youtube(&url) {
            anyhow::bail!("YouTube transcripts need a browser host, only plain pages work here");
        }
        let page = self.scraper.scrape(&url).await?;
        Ok(PageContent::Webpage {
            url: page.url,
            title: page.title,
            content: page.content,
        })
    }
}

fn is_youtube(url: &str) -> bool {
    url.contains("youtube.com/") || url.contains("youtu.be/")
}
