use crate::{PageScraper, REQUEST_TIMEOUT, USER_AGENT};
use anyhow::Result;
use async_trait::async_trait;
use htmd::{Element, HtmlToMarkdown};
use regex::Regex;
use reqwest::header;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub url: String,
    pub title: String,
    pub content: String,
}

/// Plain-HTTP scraper that reduces a page to markdown. Pages that need
/// script execution come out sparse; that is an accepted trade-off.
pub struct HttpScraper {
    http_client: Client,
}

impl HttpScraper {
    pub fn new() -> Self {
        Self {
            http_client: Client::new(),
        }
    }
}

impl Default for HttpScraper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageScraper for HttpScraper {
    async fn scrape(&self, url: &str) -> Result<ScrapedPage> {
        let url = Url::parse(url)?;
        let response = self
            .http_client
            .get(url.as_str())
            .header(header::USER_AGENT, USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Fetch failed with {} for {}",
                response.status(),
                url
            ));
        }

        let html = response.text().await?;
        let (title, fragment) = extract_content(&html);
        let content = to_markdown(&fragment, &url)?;

        let title = if title.is_empty() {
            url.host_str().unwrap_or_default().to_string()
        } else {
            title
        };

        Ok(ScrapedPage {
            url: url.to_string(),
            title,
            content,
        })
    }
}

/// Pulls the page title and the most content-like fragment out of the
/// document. Falls back to the whole body.
fn extract_content(html: &str) -> (String, String) {
    let document = Html::parse_document(html);

    let title_selector = Selector::parse("title").unwrap();
    let title = document
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let main_selector = Selector::parse("main, article, #content, .content").unwrap();
    let body_selector = Selector::parse("body").unwrap();
    let fragment = document
        .select(&main_selector)
        .next()
        .or_else(|| document.select(&body_selector).next())
        .map(|el| el.inner_html())
        .unwrap_or_else(|| html.to_string());

    (title, fragment)
}

fn to_markdown(html: &str, url: &Url) -> Result<String> {
    let converter = HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "noscript"])
        .add_handler(vec!["svg"], |_: Element| Some("".to_string()))
        .build();
    let content = converter.convert(html)?;

    // Clean up the markdown
    let image_pattern = Regex::new(r"!\[.*?\]\([^)]*\)\n?").unwrap();
    let empty_heading_pattern = Regex::new(r"\n*#+ *\n+").unwrap();
    let relative_link_pattern = Regex::new(r"\[([^\]]+)\]\(/[^)]+\)").unwrap();
    let multiple_newlines = Regex::new(r"\n{3,}").unwrap();
    let empty_brackets = Regex::new(r"\[\]").unwrap();

    let mut content = image_pattern.replace_all(&content, "").to_string();
    content = empty_heading_pattern.replace_all(&content, "").to_string();
    content = multiple_newlines.replace_all(&content, "\n\n").to_string();
    content = empty_brackets.replace_all(&content, "").to_string();

    // Resolve relative links against the page origin
    let base_url = url.origin().ascii_serialization();
    content = relative_link_pattern
        .replace_all(&content, |caps: &regex::Captures| {
            let link_text = &caps[1];
            let link_url = &caps[0][caps[1].len() + 3..].trim_end_matches(')');
            format!("[{link_text}]({base_url}{link_url})")
        })
        .into_owned();

    Ok(content.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::Html as AxumHtml;
    use axum::{routing::get, Router};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    const PAGE: &str = r#"<html>
<head><title>Example Domain</title></head>
<body>
  <nav><a href="/home">Home</a></nav>
  <main>
    <h1>Welcome</h1>
    <p>Some <b>bold</b> text with a <a href="/docs/guide">guide link</a>.</p>
    <img src="/logo.png" alt="logo">
    <script>var tracked = true;</script>
  </main>
</body></html>"#;

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

    #[test]
    fn test_extract_content_prefers_main() {
        let (title, fragment) = extract_content(PAGE);
        assert_eq!(title, "Example Domain");
        assert!(fragment.contains("<h1>Welcome</h1>"));
        assert!(!fragment.contains("Home"));
    }

    #[tokio::test]
    async fn test_scrape_converts_to_markdown() {
        let app = Router::new().route("/page", get(|| async { AxumHtml(PAGE) }));
        let base_url = spawn(app).await;

        let scraper = HttpScraper::new();
        let page = scraper.scrape(&format!("{}/page", base_url)).await.unwrap();

        assert_eq!(page.title, "Example Domain");
        assert!(page.content.contains("# Welcome"));
        assert!(page.content.contains("**bold**"));
        // Relative links are rewritten against the page origin.
        assert!(page
            .content
            .contains(&format!("[guide link]({}/docs/guide)", base_url)));
        // Images and scripts are dropped.
        assert!(!page.content.contains("logo.png"));
        assert!(!page.content.contains("tracked"));
    }

    #[tokio::test]
    async fn test_scrape_reports_http_errors() {
        let app = Router::new().route(
            "/missing",
            get(|| async { axum::http::StatusCode::NOT_FOUND }),
        );
        let base_url = spawn(app).await;

        let scraper = HttpScraper::new();
        let error = scraper
            .scrape(&format!("{}/missing", base_url))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("Fetch failed"));
    }
}
