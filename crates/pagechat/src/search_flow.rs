use crate::context::cut_at_boundary;
use llm::{ChatRequest, ChatTransport, Message, ProviderSettings, Role};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use web::{PageScraper, SearchEngine, SearchHit};

/// Best-effort side calls may not stall the primary send.
pub const SIDE_CALL_TIMEOUT: Duration = Duration::from_secs(15);

const REFINEMENT_PROMPT: &str = "You turn chat messages into concise web search queries. \
Reply with the search query only, no quotes and no explanation.";
const HISTORY_TAIL: usize = 4;
const HISTORY_SNIPPET_BYTES: usize = 400;
const HITS_WITH_CONTENT: usize = 2;
const HIT_CONTENT_BYTES: usize = 8000;

/// Derives a search query from the user input plus trailing conversation
/// context via a small non-streaming completion. Any failure falls back
/// to the raw input.
pub async fn refine_query(
    transport: &dyn ChatTransport,
    provider: &ProviderSettings,
    history: &[Message],
    input: &str,
) -> String {
    let mut messages = vec![Message::text(Role::System, REFINEMENT_PROMPT)];
    let tail: Vec<&Message> = history.iter().filter(|m| m.role != Role::System).collect();
    let start = tail.len().saturating_sub(HISTORY_TAIL);
    for message in &tail[start..] {
        let text = message.text_content();
        let snippet = cut_at_boundary(&text, HISTORY_SNIPPET_BYTES);
        if snippet.trim().is_empty() {
            continue;
        }
        messages.push(Message::text(message.role, snippet));
    }
    messages.push(Message::text(Role::User, input));

    let mut request = ChatRequest::new(&provider.model, messages);
    request.max_tokens = 100;
    request.temperature = Some(0.0);

    match timeout(SIDE_CALL_TIMEOUT, transport.complete(provider, request)).await {
        Ok(Ok(completion)) => {
            let refined = completion
                .text
                .lines()
                .next()
                .unwrap_or("")
                .trim()
                .trim_matches('"')
                .to_string();
            if refined.is_empty() {
                debug!("Query refinement returned nothing, using raw input");
                input.to_string()
            } else {
                debug!("Refined search query: {}", refined);
                refined
            }
        }
        Ok(Err(err)) => {
            warn!("Query refinement failed, using raw input: {:#}", err);
            input.to_string()
        }
        Err(_) => {
            warn!("Query refinement timed out, using raw input");
            input.to_string()
        }
    }
}

/// Refines the query, runs the search and fetches page text for the top
/// hits. Returns `None` when the search fails or finds nothing, which
/// drops the augmentation for this turn.
pub async fn gather(
    transport: &dyn ChatTransport,
    provider: &ProviderSettings,
    engine: &dyn SearchEngine,
    scraper: &dyn PageScraper,
    history: &[Message],
    input: &str,
) -> Option<(String, Vec<SearchHit>)> {
    let query = refine_query(transport, provider, history, input).await;

    let mut hits = match timeout(SIDE_CALL_TIMEOUT, engine.search(&query)).await {
        Ok(Ok(hits)) => hits,
        Ok(Err(err)) => {
            warn!("Web search failed, continuing without results: {:#}", err);
            return None;
        }
        Err(_) => {
            warn!("Web search timed out, continuing without results");
            return None;
        }
    };
    if hits.is_empty() {
        debug!("Web search returned no results for: {}", query);
        return None;
    }

    // Snippets alone are thin, fetch page text for the top hits.
    for hit in hits.iter_mut().take(HITS_WITH_CONTENT) {
        match timeout(SIDE_CALL_TIMEOUT, scraper.scrape(&hit.url)).await {
            Ok(Ok(page)) => {
                hit.content = Some(cut_at_boundary(&page.content, HIT_CONTENT_BYTES).to_string());
            }
            Ok(Err(err)) => debug!("Could not fetch search hit {}: {:#}", hit.url, err),
            Err(_) => debug!("Timed out fetching search hit {}", hit.url),
        }
    }

    Some((query, hits))
}

/// Renders hits as the system message block injected upstream.
pub fn format_results(query: &str, hits: &[SearchHit]) -> String {
    let mut block = format!("Web search results for \"{query}\":\n");
    for (i, hit) in hits.iter().enumerate() {
        block.push_str(&format!("\n{}. {}\nURL: {}\n", i + 1, hit.title, hit.url));
        if !hit.snippet.is_empty() {
            block.push_str(&hit.snippet);
            block.push('\n');
        }
        if let Some(content) = hit.content.as_deref() {
            if !content.is_empty() {
                block.push_str("Content:\n");
                block.push_str(content);
                block.push('\n');
            }
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mocks::{
        test_provider, FailingSearch, ScriptedTransport, StaticScraper, StaticSearch,
    };
    use llm::{Completion, Usage};

    fn hit(title: &str, url: &str) -> SearchHit {
        SearchHit {
            title: title.to_string(),
            url: url.to_string(),
            snippet: format!("snippet for {title}"),
            content: None,
        }
    }

    #[tokio::test]
    async fn refinement_takes_first_line_without_quotes() {
        let transport = ScriptedTransport::default();
        transport.push_complete(Ok(Completion {
            text: "\"rust borrow checker\"\nexplanation".to_string(),
            usage: Usage::default(),
        }));

        let query = refine_query(&transport, &test_provider(), &[], "how does borrowing work?").await;
        assert_eq!(query, "rust borrow checker");
    }

    #[tokio::test]
    async fn refinement_failure_falls_back_to_raw_input() {
        let transport = ScriptedTransport::default();
        transport.push_complete(Err(anyhow::anyhow!("refinement broke")));

        let query = refine_query(&transport, &test_provider(), &[], "plain question").await;
        assert_eq!(query, "plain question");
    }

    #[tokio::test]
    async fn failed_search_yields_none() {
        let transport = ScriptedTransport::default();
        transport.push_complete(Ok(Completion {
            text: "query".to_string(),
            usage: Usage::default(),
        }));
        let scraper = StaticScraper::new("Example", "Example body text");

        let gathered = gather(
            &transport,
            &test_provider(),
            &FailingSearch,
            &scraper,
            &[],
            "anything",
        )
        .await;
        assert!(gathered.is_none());
    }

    #[tokio::test]
    async fn top_hits_get_scraped_content() {
        let transport = ScriptedTransport::default();
        transport.push_complete(Ok(Completion {
            text: "refined query".to_string(),
            usage: Usage::default(),
        }));
        let engine = StaticSearch(vec![
            hit("First", "https://a.example/1"),
            hit("Second", "https://a.example/2"),
            hit("Third", "https://a.example/3"),
        ]);
        let scraper = StaticScraper::new("Example", "Example body text");

        let (query, hits) = gather(
            &transport,
            &test_provider(),
            &engine,
            &scraper,
            &[],
            "anything",
        )
        .await
        .expect("search results");

        assert_eq!(query, "refined query");
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].content.as_deref(), Some("Example body text"));
        assert_eq!(hits[1].content.as_deref(), Some("Example body text"));
        assert_eq!(hits[2].content, None);
    }

    #[test]
    fn formatted_results_list_every_hit() {
        let mut first = hit("Rust Book", "https://doc.rust-lang.org/book/");
        first.content = Some("Ownership is...".to_string());
        let block = format_results("rust ownership", &[first, hit("Blog", "https://blog.example")]);

        assert!(block.starts_with("Web search results for \"rust ownership\":"));
        assert!(block.contains("1. Rust Book\nURL: https://doc.rust-lang.org/book/"));
        assert!(block.contains("Content:\nOwnership is..."));
        assert!(block.contains("2. Blog\nURL: https://blog.example"));
    }
}
