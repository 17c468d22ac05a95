use crate::{SearchEngine, SearchHit, REQUEST_TIMEOUT};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

/// Brave Search API backend. Used when the user has configured a
/// subscription token; same contract as the free engine.
pub struct BraveSearch {
    http_client: Client,
    api_key: String,
    base_url: String,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    description: String,
}

impl BraveSearch {
    pub fn new(api_key: impl Into<String>, max_results: usize) -> Self {
        Self {
            http_client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.search.brave.com".to_string(),
            max_results,
        }
    }

    // For testing: allows specifying a different base URL
    #[cfg(test)]
    fn with_base_url(api_key: String, base_url: String, max_results: usize) -> Self {
        Self {
            http_client: Client::new(),
            api_key,
            base_url,
            max_results,
        }
    }
}

#[async_trait]
impl SearchEngine for BraveSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let count = self.max_results.to_string();
        let response = self
            .http_client
            .get(format!("{}/res/v1/web/search", self.base_url))
            .query(&[("q", query), ("count", count.as_str())])
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Brave Search API error: {} {}",
                status.as_u16(),
                error_text
            ));
        }

        let parsed: BraveResponse = response.json().await?;
        let results = parsed.web.map(|web| web.results).unwrap_or_default();

        Ok(results
            .into_iter()
            .take(self.max_results)
            .map(|result| SearchHit {
                title: result.title,
                url: result.url,
                snippet: result.description,
                content: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn spawn(app: Router) -> String {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_search_maps_results() {
        let app = Router::new().route(
            "/res/v1/web/search",
            get(|| async {
                Json(json!({
                    "web": {
                        "results": [
                            {
                                "title": "Rust",
                                "url": "https://www.rust-lang.org/",
                                "description": "The Rust language."
                            },
                            {
                                "title": "Crates",
                                "url": "https://crates.io/"
                            }
                        ]
                    }
                }))
            }),
        );
        let base_url = spawn(app).await;

        let engine = BraveSearch::with_base_url("token".to_string(), base_url, 5);
        let hits = engine.search("rust").await.unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Rust");
        assert_eq!(hits[0].snippet, "The Rust language.");
        assert_eq!(hits[1].snippet, "");
    }

    #[tokio::test]
    async fn test_search_reports_api_errors() {
        let app = Router::new().route(
            "/res/v1/web/search",
            get(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    Json(json!({"message": "invalid token"})),
                )
            }),
        );
        let base_url = spawn(app).await;

        let engine = BraveSearch::with_base_url("bad".to_string(), base_url, 5);
        let error = engine.search("rust").await.unwrap_err();
        assert!(error.to_string().contains("Brave Search API error: 401"));
    }
}
