//! Builds the upstream message list for one completion turn.
//!
//! The persisted conversation is never sent as-is: status notices are
//! filtered out, image references are resolved to inline data, and the
//! active contexts (document, page, YouTube, search results, linked
//! pages) are injected as system messages at fixed positions. The
//! user's typed text always goes last, verbatim.

use std::sync::Arc;

use base64::Engine;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::context::{
    chunk_text, cut_at_boundary, ActiveContexts, DocumentContext, ScrapedUrlContext,
    YoutubeContext, CHUNK_TARGET,
};
use crate::controller::ChatEvent;
use crate::persistence::ImageStore;
use crate::search_flow;
use llm::{ChatTransport, ContentPart, Message, MessageContent, ProviderSettings, Role};
use web::{PageScraper, ScrapedPage, SearchEngine};

/// System messages starting with one of these are transient status
/// notices shown to the user; they are never sent upstream.
const NOTICE_PREFIXES: [&str; 2] = ["[Searching the web", "[Fetching linked page"];

/// Upper bound for a single injected context block, in bytes.
const PER_CONTEXT_BUDGET: usize = 24_000;
/// Upper bound for all injected context blocks together, in bytes.
const COMBINED_CONTEXT_BUDGET: usize = 60_000;
/// At most this many linked pages are fetched per turn.
const MAX_LINKED_PAGES: usize = 3;

/// The messages to send upstream plus the status notices that should
/// become visible in the conversation.
pub struct AssembledTurn {
    pub messages: Vec<Message>,
    pub notices: Vec<String>,
}

pub struct ContextAssembler {
    transport: Arc<dyn ChatTransport>,
    images: Arc<dyn ImageStore>,
    scraper: Arc<dyn PageScraper>,
    search: Option<Arc<dyn SearchEngine>>,
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl ContextAssembler {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        images: Arc<dyn ImageStore>,
        scraper: Arc<dyn PageScraper>,
        search: Option<Arc<dyn SearchEngine>>,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Self {
        Self {
            transport,
            images,
            scraper,
            search,
            events,
        }
    }

    /// Builds the full upstream message list for one turn. Side
    /// lookups (search, linked pages) are best effort: failures are
    /// logged and the turn proceeds without them.
    pub async fn assemble(
        &self,
        provider: &ProviderSettings,
        history: &[Message],
        contexts: &ActiveContexts,
        user_message: &Message,
        web_search: bool,
    ) -> AssembledTurn {
        let input = user_message.text_content();
        let mut notices = Vec::new();

        let search_block = if web_search {
            match &self.search {
                Some(engine) => {
                    let gathered = search_flow::gather(
                        self.transport.as_ref(),
                        provider,
                        engine.as_ref(),
                        self.scraper.as_ref(),
                        history,
                        &input,
                    )
                    .await;
                    match gathered {
                        Some((query, hits)) => {
                            self.notice(&mut notices, format!("[Searching the web for: {query}]"));
                            Some(search_flow::format_results(&query, &hits))
                        }
                        None => None,
                    }
                }
                None => {
                    debug!("Web search requested but no search engine is configured");
                    None
                }
            }
        } else {
            None
        };

        let mut pages = Vec::new();
        for url in linked_urls(&input) {
            self.notice(&mut notices, format!("[Fetching linked page: {url}]"));
            match self.scraper.scrape(&url).await {
                Ok(page) => pages.push(page),
                Err(err) => warn!("Skipping linked page {}: {:#}", url, err),
            }
        }

        let messages = compose(
            history,
            contexts,
            search_block,
            &pages,
            user_message,
            self.images.as_ref(),
        );
        AssembledTurn { messages, notices }
    }

    fn notice(&self, notices: &mut Vec<String>, text: String) {
        let _ = self.events.send(ChatEvent::Notice(text.clone()));
        notices.push(text);
    }
}

/// Pure assembly step: filter, resolve images, inject context blocks
/// and append the new user message.
fn compose(
    history: &[Message],
    contexts: &ActiveContexts,
    search_block: Option<String>,
    pages: &[ScrapedPage],
    user_message: &Message,
    images: &dyn ImageStore,
) -> Vec<Message> {
    let mut messages: Vec<Message> = history
        .iter()
        .filter(|message| !is_status_notice(message))
        .map(|message| resolve_images(message, images))
        .collect();

    let mut youtube = contexts
        .youtube
        .as_ref()
        .map(|video| clamp_block(youtube_block(video)));
    let mut document = contexts
        .document
        .as_ref()
        .map(|doc| clamp_block(document_block(doc)));
    let mut scraped = contexts
        .scraped_url
        .as_ref()
        .map(|page| clamp_block(scraped_url_block(page)));
    let mut search = search_block.map(clamp_block);
    let mut page_blocks: Vec<String> = pages
        .iter()
        .map(|page| clamp_block(linked_page_block(page)))
        .collect();

    // Combined cap, shedding the most expendable block first.
    loop {
        let total = youtube.as_deref().map_or(0, str::len)
            + document.as_deref().map_or(0, str::len)
            + scraped.as_deref().map_or(0, str::len)
            + search.as_deref().map_or(0, str::len)
            + page_blocks.iter().map(String::len).sum::<usize>();
        if total <= COMBINED_CONTEXT_BUDGET {
            break;
        }
        if search.take().is_some() {
            warn!("Dropping search results to fit the context budget");
        } else if page_blocks.pop().is_some() {
            warn!("Dropping a linked page to fit the context budget");
        } else if scraped.take().is_some() {
            warn!("Dropping the scraped page to fit the context budget");
        } else if youtube.take().is_some() {
            warn!("Dropping the YouTube transcript to fit the context budget");
        } else if document.take().is_some() {
            warn!("Dropping the attached document to fit the context budget");
        } else {
            break;
        }
    }

    // The transcript goes right before the question it most likely
    // belongs to; everything else is appended after the history.
    if let Some(block) = youtube {
        let position = messages
            .iter()
            .rposition(|message| message.role == Role::User)
            .unwrap_or(0);
        messages.insert(position, Message::text(Role::System, block));
    }
    if let Some(block) = document {
        messages.push(Message::text(Role::System, block));
    }
    if let Some(block) = scraped {
        messages.push(Message::text(Role::System, block));
    }
    if let Some(block) = search {
        messages.push(Message::text(Role::System, block));
    }
    for block in page_blocks {
        messages.push(Message::text(Role::System, block));
    }
    messages.push(resolve_images(user_message, images));
    messages
}

fn is_status_notice(message: &Message) -> bool {
    if message.role != Role::System {
        return false;
    }
    let text = message.text_content();
    NOTICE_PREFIXES
        .iter()
        .any(|prefix| text.starts_with(prefix))
}

/// Replaces stored image references with inline base64 data for the
/// upstream request. The persisted message is left untouched; parts
/// that cannot be resolved are dropped with a warning.
fn resolve_images(message: &Message, images: &dyn ImageStore) -> Message {
    let parts = match &message.content {
        MessageContent::Parts(parts)
            if parts
                .iter()
                .any(|part| matches!(part, ContentPart::ImageRef { .. })) =>
        {
            parts
        }
        _ => return message.clone(),
    };
    let resolved = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::ImageRef { reference } => match images.load_image(reference) {
                Ok((media_type, data)) => Some(ContentPart::Image {
                    media_type,
                    data: base64::engine::general_purpose::STANDARD.encode(data),
                }),
                Err(err) => {
                    warn!("Omitting unresolvable image {}: {:#}", reference, err);
                    None
                }
            },
            other => Some(other.clone()),
        })
        .collect();
    Message {
        role: message.role,
        content: MessageContent::Parts(resolved),
        meta: message.meta.clone(),
    }
}

fn clamp_block(text: String) -> String {
    if text.len() <= PER_CONTEXT_BUDGET {
        return text;
    }
    let mut clipped = cut_at_boundary(&text, PER_CONTEXT_BUDGET).to_string();
    clipped.push_str("\n[Content truncated]");
    clipped
}

fn youtube_block(video: &YoutubeContext) -> String {
    let mut block = format!(
        "YouTube video \"{}\" by {} ({})\n",
        video.title, video.channel, video.video_id
    );
    if !video.description.trim().is_empty() {
        block.push_str(&format!(
            "Description: {}\n",
            cut_at_boundary(video.description.trim(), 1000)
        ));
    }
    let chunks = chunk_text(&video.transcript, CHUNK_TARGET, 0);
    let total = chunks.len();
    for chunk in &chunks {
        block.push_str(&format!(
            "\nTranscript chunk {}/{}:\n{}\n",
            chunk.index + 1,
            total,
            chunk.text
        ));
    }
    if total == 0 {
        block.push_str("\nNo transcript available.\n");
    }
    block
}

fn document_block(document: &DocumentContext) -> String {
    let total = document.chunks.len();
    let mut block = format!("The user attached the document \"{}\".\n", document.name);
    for chunk in &document.chunks {
        block.push_str(&format!(
            "\nDocument chunk {}/{}:\n{}\n",
            chunk.index + 1,
            total,
            chunk.text
        ));
    }
    block
}

fn scraped_url_block(page: &ScrapedUrlContext) -> String {
    let total = page.chunks.len();
    let mut block = format!("Content of the page \"{}\" ({}):\n", page.title, page.url);
    for chunk in &page.chunks {
        block.push_str(&format!(
            "\nPage chunk {}/{}:\n{}\n",
            chunk.index + 1,
            total,
            chunk.text
        ));
    }
    block
}

fn linked_page_block(page: &ScrapedPage) -> String {
    format!(
        "Content of the linked page \"{}\" ({}):\n\n{}",
        page.title, page.url, page.content
    )
}

/// URLs to fetch for this input. A bracketed command like
/// `[summarize https://example.com]` is treated the same as a bare
/// link in the text.
fn linked_urls(input: &str) -> Vec<String> {
    let trimmed = input.trim();
    if let Some(inner) = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    {
        let urls = detect_urls(inner);
        if !urls.is_empty() {
            return urls;
        }
    }
    detect_urls(trimmed)
}

fn detect_urls(text: &str) -> Vec<String> {
    let pattern = Regex::new(r#"https?://[^\s<>()\[\]{}"']+"#).unwrap();
    let mut urls = Vec::new();
    for found in pattern.find_iter(text) {
        let url = found
            .as_str()
            .trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if !url.is_empty() && !urls.iter().any(|existing| existing == url) {
            urls.push(url.to_string());
        }
    }
    urls.truncate(MAX_LINKED_PAGES);
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mocks::{
        test_provider, FailingSearch, MemoryStore, ScriptedTransport, StaticScraper, StaticSearch,
    };
    use llm::Completion;
    use web::SearchHit;

    fn assembler_with(
        transport: Arc<ScriptedTransport>,
        scraper: Arc<dyn PageScraper>,
        search: Option<Arc<dyn SearchEngine>>,
    ) -> (ContextAssembler, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let assembler = ContextAssembler::new(
            transport,
            Arc::new(MemoryStore::default()),
            scraper,
            search,
            events,
        );
        (assembler, receiver)
    }

    fn system_texts(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .filter(|message| message.role == Role::System)
            .map(|message| message.text_content())
            .collect()
    }

    fn user(text: &str) -> Message {
        Message::text(Role::User, text)
    }

    #[test]
    fn status_notices_are_filtered_from_upstream() {
        let history = vec![
            Message::text(Role::User, "look this up"),
            Message::text(Role::System, "[Searching the web for: rust borrow checker]"),
            Message::text(Role::System, "[Fetching linked page: https://example.com]"),
            Message::text(Role::System, "You are a helpful assistant."),
            Message::text(Role::Assistant, "Done."),
        ];
        let store = MemoryStore::default();
        let messages = compose(
            &history,
            &ActiveContexts::default(),
            None,
            &[],
            &user("thanks"),
            &store,
        );
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].text_content(), "look this up");
        assert_eq!(messages[1].text_content(), "You are a helpful assistant.");
        assert_eq!(messages[2].text_content(), "Done.");
        assert_eq!(messages[3].text_content(), "thanks");
    }

    #[test]
    fn context_blocks_take_fixed_positions() {
        let mut contexts = ActiveContexts::default();
        contexts.set_scraped_url(ScrapedUrlContext {
            url: "https://site.test/a".into(),
            title: "Site".into(),
            chunks: chunk_text("page words", CHUNK_TARGET, 0),
        });
        contexts.set_youtube(YoutubeContext {
            video_id: "abc123".into(),
            title: "Talk".into(),
            channel: "Conf".into(),
            description: String::new(),
            transcript: "hello from the talk".into(),
        });
        contexts.set_document(DocumentContext {
            name: "notes.txt".into(),
            chunks: chunk_text("doc words", CHUNK_TARGET, 0),
        });

        let history = vec![
            Message::text(Role::User, "first question"),
            Message::text(Role::Assistant, "first answer"),
        ];
        let store = MemoryStore::default();
        let messages = compose(&history, &contexts, None, &[], &user("latest question"), &store);

        // Transcript right before the latest user message in history,
        // document then page appended after it, input last.
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].text_content().starts_with("YouTube video"));
        assert_eq!(messages[1].text_content(), "first question");
        assert_eq!(messages[2].text_content(), "first answer");
        assert!(messages[3]
            .text_content()
            .starts_with("The user attached the document"));
        assert!(messages[4].text_content().starts_with("Content of the page"));
        assert_eq!(messages[5].role, Role::User);
        assert_eq!(messages[5].text_content(), "latest question");
    }

    #[test]
    fn transcript_precedes_empty_history_input() {
        let mut contexts = ActiveContexts::default();
        contexts.set_youtube(YoutubeContext {
            video_id: "v".into(),
            title: "T".into(),
            channel: "C".into(),
            description: String::new(),
            transcript: "words".into(),
        });
        let store = MemoryStore::default();
        let messages = compose(&[], &contexts, None, &[], &user("question"), &store);
        assert!(messages[0].text_content().starts_with("YouTube video"));
        assert_eq!(messages[1].text_content(), "question");
    }

    #[test]
    fn image_references_resolve_without_touching_history() {
        let store = MemoryStore::default();
        let reference = store.save_image("image/png", &[1, 2, 3, 4]).unwrap();
        let history = vec![Message::parts(
            Role::User,
            vec![
                ContentPart::Text {
                    text: "what is this?".into(),
                },
                ContentPart::ImageRef {
                    reference: reference.clone(),
                },
            ],
        )];

        let messages = compose(
            &history,
            &ActiveContexts::default(),
            None,
            &[],
            &user("next"),
            &store,
        );

        match &messages[0].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                match &parts[1] {
                    ContentPart::Image { media_type, data } => {
                        assert_eq!(media_type, "image/png");
                        assert!(!data.is_empty());
                    }
                    other => panic!("expected inline image, got {other:?}"),
                }
            }
            other => panic!("expected parts, got {other:?}"),
        }
        // The stored history still carries the reference.
        match &history[0].content {
            MessageContent::Parts(parts) => {
                assert!(matches!(&parts[1], ContentPart::ImageRef { .. }))
            }
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn unresolvable_image_parts_are_dropped() {
        let store = MemoryStore::default();
        let history = vec![Message::parts(
            Role::User,
            vec![
                ContentPart::Text { text: "hi".into() },
                ContentPart::ImageRef {
                    reference: "img_missing.png".into(),
                },
            ],
        )];
        let messages = compose(
            &history,
            &ActiveContexts::default(),
            None,
            &[],
            &user("next"),
            &store,
        );
        match &messages[0].content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 1),
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn oversized_blocks_are_clamped() {
        let mut contexts = ActiveContexts::default();
        contexts.set_document(DocumentContext {
            name: "big.txt".into(),
            chunks: chunk_text(&"word ".repeat(10_000), CHUNK_TARGET, 0),
        });
        let store = MemoryStore::default();
        let messages = compose(&[], &contexts, None, &[], &user("q"), &store);
        let block = messages[0].text_content();
        assert!(block.len() <= PER_CONTEXT_BUDGET + "\n[Content truncated]".len());
        assert!(block.ends_with("[Content truncated]"));
    }

    #[test]
    fn combined_budget_sheds_search_and_pages_first() {
        let big = "word ".repeat(6_000);
        let mut contexts = ActiveContexts::default();
        contexts.set_document(DocumentContext {
            name: "big.txt".into(),
            chunks: chunk_text(&big, CHUNK_TARGET, 0),
        });
        contexts.set_scraped_url(ScrapedUrlContext {
            url: "https://site.test".into(),
            title: "Site".into(),
            chunks: chunk_text(&big, CHUNK_TARGET, 0),
        });
        let pages = vec![ScrapedPage {
            url: "https://linked.test".into(),
            title: "Linked".into(),
            content: big.clone(),
        }];
        let store = MemoryStore::default();
        let messages = compose(&[], &contexts, Some(big.clone()), &pages, &user("q"), &store);

        let blocks = system_texts(&messages);
        assert!(blocks
            .iter()
            .any(|block| block.starts_with("The user attached the document")));
        assert!(blocks
            .iter()
            .any(|block| block.starts_with("Content of the page")));
        assert!(!blocks.iter().any(|block| block.contains("linked.test")));
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn bracket_commands_and_bare_links_yield_urls() {
        assert_eq!(
            linked_urls("[summarize https://example.com]"),
            vec!["https://example.com"]
        );
        assert_eq!(
            linked_urls("see https://a.test/x, then https://b.test."),
            vec!["https://a.test/x", "https://b.test"]
        );
        assert_eq!(
            linked_urls("https://a.test https://a.test"),
            vec!["https://a.test"]
        );
        let many = "https://a.test https://b.test https://c.test https://d.test";
        assert_eq!(linked_urls(many).len(), 3);
        assert!(linked_urls("no links here").is_empty());
        assert!(linked_urls("[just a command]").is_empty());
    }

    #[tokio::test]
    async fn linked_page_lands_before_verbatim_input() {
        let transport = Arc::new(ScriptedTransport::default());
        let scraper = Arc::new(StaticScraper::new("Example", "Example body text"));
        let (assembler, mut events) = assembler_with(transport, scraper.clone(), None);

        let turn = assembler
            .assemble(
                &test_provider(),
                &[],
                &ActiveContexts::default(),
                &user("[summarize https://example.com]"),
                false,
            )
            .await;

        assert_eq!(
            turn.notices,
            vec!["[Fetching linked page: https://example.com]"]
        );
        assert_eq!(scraper.requested(), vec!["https://example.com"]);
        let last = turn.messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(last.text_content(), "[summarize https://example.com]");
        let block = &turn.messages[turn.messages.len() - 2];
        assert_eq!(block.role, Role::System);
        assert!(block.text_content().contains("Example"));
        assert!(block.text_content().contains("Example body text"));
        match events.try_recv().unwrap() {
            ChatEvent::Notice(text) => {
                assert_eq!(text, "[Fetching linked page: https://example.com]")
            }
            other => panic!("expected notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_search_degrades_to_plain_turn() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_complete(Ok(Completion {
            text: "refined query".into(),
            usage: Default::default(),
        }));
        let scraper = Arc::new(StaticScraper::new("ignored", "ignored"));
        let (assembler, _events) =
            assembler_with(transport, scraper, Some(Arc::new(FailingSearch)));

        let turn = assembler
            .assemble(
                &test_provider(),
                &[],
                &ActiveContexts::default(),
                &user("what happened today?"),
                true,
            )
            .await;

        assert!(turn.notices.is_empty());
        assert_eq!(turn.messages.len(), 1);
        assert_eq!(turn.messages[0].text_content(), "what happened today?");
    }

    #[tokio::test]
    async fn search_results_are_injected_before_input() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_complete(Ok(Completion {
            text: "rust borrow checker".into(),
            usage: Default::default(),
        }));
        let hits = vec![SearchHit {
            title: "The Rust Book".into(),
            url: "https://doc.rust-lang.org/book".into(),
            snippet: "Understanding ownership".into(),
            content: None,
        }];
        let scraper = Arc::new(StaticScraper::new("Page", "page content"));
        let (assembler, _events) =
            assembler_with(transport, scraper, Some(Arc::new(StaticSearch(hits))));

        let turn = assembler
            .assemble(
                &test_provider(),
                &[],
                &ActiveContexts::default(),
                &user("explain the borrow checker"),
                true,
            )
            .await;

        assert_eq!(
            turn.notices,
            vec!["[Searching the web for: rust borrow checker]"]
        );
        let blocks = system_texts(&turn.messages);
        assert!(blocks
            .iter()
            .any(|block| block.contains("Web search results for \"rust borrow checker\"")));
        assert_eq!(
            turn.messages.last().unwrap().text_content(),
            "explain the borrow checker"
        );
    }
}
