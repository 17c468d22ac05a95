use crate::{SearchEngine, SearchHit, REQUEST_TIMEOUT, USER_AGENT};
use anyhow::Result;
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header;
use reqwest::Client;
use scraper::{Html, Selector};
use url::Url;

/// Searches the DuckDuckGo HTML endpoint. Needs no API key, which makes
/// it the default engine when no paid one is configured.
pub struct DuckDuckGoSearch {
    http_client: Client,
    base_url: String,
    max_results: usize,
}

impl DuckDuckGoSearch {
    pub fn new(max_results: usize) -> Self {
        Self {
            http_client: Client::new(),
            base_url: "https://html.duckduckgo.com".to_string(),
            max_results,
        }
    }

    // For testing: allows specifying a different base URL
    #[cfg(test)]
    fn with_base_url(base_url: String, max_results: usize) -> Self {
        Self {
            http_client: Client::new(),
            base_url,
            max_results,
        }
    }
}

#[async_trait]
impl SearchEngine for DuckDuckGoSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let search_url = format!(
            "{}/html/?q={}",
            self.base_url,
            utf8_percent_encode(query, NON_ALPHANUMERIC)
        );

        let response = self
            .http_client
            .get(&search_url)
            .header(header::USER_AGENT, USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let html = response.text().await?;

        Ok(parse_results(&html, self.max_results))
    }
}

fn parse_results(html: &str, limit: usize) -> Vec<SearchHit> {
    let document = Html::parse_document(html);

    let result_selector = Selector::parse(".result").unwrap();
    let link_selector = Selector::parse(".result__a").unwrap();
    let snippet_selector = Selector::parse(".result__snippet").unwrap();

    let mut hits = Vec::new();
    for result in document.select(&result_selector) {
        let Some(link) = result.select(&link_selector).next() else {
            continue;
        };
        let Some(url) = decode_result_url(link.value().attr("href").unwrap_or_default()) else {
            continue;
        };

        let title = link.text().collect::<String>().trim().to_string();
        let snippet = result
            .select(&snippet_selector)
            .next()
            .map(|s| s.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        hits.push(SearchHit {
            title,
            url,
            snippet,
            content: None,
        });
        if hits.len() >= limit {
            break;
        }
    }

    hits
}

/// Result links point at a redirect endpoint carrying the real target in
/// the `uddg` parameter.
fn decode_result_url(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let parsed = Url::parse(&absolute).ok()?;

    if let Some(target) = parsed
        .query_pairs()
        .find(|(key, _)| key == "uddg")
        .map(|(_, value)| value.to_string())
    {
        return Some(target);
    }
    Some(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    const RESULTS_PAGE: &str = r#"
<html><body>
  <div class="results">
    <div class="result">
      <h2 class="result__title">
        <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust%2Dlang.org%2F&rut=abc123">Rust Programming Language</a>
      </h2>
      <a class="result__snippet">A language empowering everyone.</a>
    </div>
    <div class="result">
      <a class="result__a" href="https://docs.rs/">Docs.rs</a>
      <div class="result__snippet">Documentation host.</div>
    </div>
    <div class="result">
      <span>No link in this one</span>
    </div>
  </div>
</body></html>"#;

    #[test]
    fn test_parse_results_decodes_redirect_urls() {
        let hits = parse_results(RESULTS_PAGE, 10);
        assert_eq!(hits.len(), 2);

        assert_eq!(hits[0].title, "Rust Programming Language");
        assert_eq!(hits[0].url, "https://www.rust-lang.org/");
        assert_eq!(hits[0].snippet, "A language empowering everyone.");

        assert_eq!(hits[1].url, "https://docs.rs/");
    }

    #[test]
    fn test_parse_results_honors_limit() {
        let hits = parse_results(RESULTS_PAGE, 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Rust Programming Language");
    }

    #[test]
    fn test_decode_result_url_passthrough() {
        assert_eq!(
            decode_result_url("https://example.com/page").as_deref(),
            Some("https://example.com/page")
        );
        assert_eq!(decode_result_url("not a url"), None);
    }

    #[tokio::test]
    async fn test_search_against_mock_endpoint() {
        let app = Router::new().route("/html/", get(|| async { RESULTS_PAGE }));
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let engine = DuckDuckGoSearch::with_base_url(format!("http://{}", addr), 5);
        let hits = engine.search("rust programming").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://www.rust-lang.org/");
    }
}
