//! pagechat: chat with LLM providers about web pages, documents and
//! videos from the terminal.
//!
//! Replies stream to stdout as they arrive. Slash commands manage
//! conversations, contexts and providers; everything else you type is
//! sent as a chat message.

mod assembler;
mod context;
mod controller;
mod conversation;
mod extract;
mod logging;
mod persistence;
mod search_flow;


use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::info;

use crate::assembler::ContextAssembler;
use crate::controller::{ChatController, ChatEvent, ControllerError};
use crate::conversation::Conversation;
use crate::extract::SetUrlExtractor;
use crate::persistence::{media_type_for, ConversationStore, ConversationSummary, FileStore};
use llm::{
    ChatTransport, HttpChatTransport, ProviderRegistry, ProviderSettings, ProviderStore, Role,
};
use web::{BraveSearch, DuckDuckGoSearch, HttpScraper, PageScraper, SearchEngine};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory for conversations and images (defaults to the user
    /// data dir)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Enable verbose logging (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Provider entry to use for this session
    #[arg(short = 'p', long)]
    pub provider: Option<String>,

    /// Model override for this session
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Conversation id to resume
    #[arg(short = 'c', long)]
    pub conversation: Option<String>,

    /// List stored conversations and exit
    #[arg(long)]
    pub list: bool,

    /// Delete a stored conversation and exit
    #[arg(long)]
    pub delete: Option<String>,

    /// Send one prompt, print the reply and exit
    #[arg(long)]
    pub prompt: Option<String>,

    /// Enable web search context for new turns
    #[arg(long)]
    pub search: bool,
}

/// Provider store for one CLI session: the file-backed registry plus
/// the `--model` override.
struct SessionProviders {
    registry: ProviderRegistry,
    model_override: Option<String>,
}

impl ProviderStore for SessionProviders {
    fn active_provider(&self) -> Result<ProviderSettings> {
        let mut provider = self.registry.active_provider()?;
        if let Some(model) = &self.model_override {
            provider.model = model.clone();
        }
        Ok(provider)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_logging(args.verbose);

    let store = Arc::new(match &args.data_dir {
        Some(dir) => FileStore::with_root(dir.clone()),
        None => FileStore::new(),
    });

    if args.list {
        print_conversations(&store.list()?);
        return Ok(());
    }
    if let Some(id) = &args.delete {
        store.delete(id)?;
        println!("Deleted conversation {id}");
        return Ok(());
    }

    let registry = ProviderRegistry::load()?;
    if let Some(name) = &args.provider {
        registry.set_active(name)?;
    }
    let providers = Arc::new(SessionProviders {
        registry,
        model_override: args.model.clone(),
    });

    let transport: Arc<dyn ChatTransport> = Arc::new(HttpChatTransport::new());
    let scraper: Arc<dyn PageScraper> = Arc::new(HttpScraper::new());
    let search: Arc<dyn SearchEngine> = match std::env::var("BRAVE_API_KEY") {
        Ok(key) if !key.trim().is_empty() => {
            info!("Using Brave search");
            Arc::new(BraveSearch::new(key, 5))
        }
        _ => Arc::new(DuckDuckGoSearch::new(5)),
    };
    let extractor = Arc::new(SetUrlExtractor::new(scraper.clone()));

    let (events, mut receiver) = mpsc::unbounded_channel();
    let assembler = ContextAssembler::new(
        transport.clone(),
        store.clone(),
        scraper,
        Some(search),
        events.clone(),
    );
    let controller = Arc::new(ChatController::new(
        transport,
        providers.clone(),
        store.clone(),
        store,
        assembler,
        Some(extractor.clone()),
        events,
    ));
    if args.search {
        controller.set_web_search(true);
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match event {
                ChatEvent::Notice(text) => println!("{text}"),
                ChatEvent::Delta(delta) => {
                    print!("{delta}");
                    let _ = std::io::stdout().flush();
                }
                ChatEvent::Finished { .. } | ChatEvent::Cancelled => println!(),
                ChatEvent::Failed(err) => eprintln!("\nCompletion failed: {err}"),
            }
        }
    });

    if let Some(id) = &args.conversation {
        let title = controller.open(id)?;
        println!("Resumed: {title}");
        print_transcript(&controller.snapshot());
    }

    if let Some(prompt) = &args.prompt {
        let result = controller.send(prompt).await;
        drop(controller);
        let _ = printer.await;
        return result.map_err(Into::into);
    }

    run_repl(controller, extractor, providers).await;
    Ok(())
}

const HELP: &str = "\
Commands:
  /new                    start a new conversation
  /list                   list stored conversations
  /open <id>              switch to a stored conversation
  /delete <id>            delete a stored conversation
  /redo                   resend the last user message
  /edit <text>            replace the last user message and resend
  /stop                   stop the streaming reply
  /page <url>             use a web page as context
  /doc <path>             attach a text file as context
  /image <path>           stage an image for the next message
  /contexts               show active contexts
  /clear                  drop all active contexts
  /search on|off          toggle web search context
  /models                 list models of the active provider
  /provider               list providers; see /provider use|add|remove
  /quit                   exit

Anything else is sent as a chat message.";

async fn run_repl(
    controller: Arc<ChatController>,
    extractor: Arc<SetUrlExtractor>,
    providers: Arc<SessionProviders>,
) {
    println!("pagechat. Type /help for commands.");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('/') {
            spawn_send(&controller, line.to_string());
            continue;
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        match command {
            "/help" => println!("{HELP}"),
            "/quit" | "/exit" => break,
            "/new" => {
                controller.new_conversation();
                println!("Started a new conversation.");
            }
            "/list" => match controller.conversations() {
                Ok(summaries) => print_conversations(&summaries),
                Err(err) => println!("Could not list conversations: {err:#}"),
            },
            "/open" => match controller.open(rest) {
                Ok(title) => {
                    println!("Opened: {title}");
                    print_transcript(&controller.snapshot());
                }
                Err(err) => println!("{err:#}"),
            },
            "/delete" => match controller.delete(rest) {
                Ok(()) => println!("Deleted conversation {rest}"),
                Err(err) => println!("{err:#}"),
            },
            "/redo" => {
                let controller = controller.clone();
                tokio::spawn(async move {
                    report(controller.redo().await);
                });
            }
            "/edit" => {
                let snapshot = controller.snapshot();
                let index = snapshot
                    .messages
                    .iter()
                    .rposition(|message| message.role == Role::User);
                match index {
                    Some(index) => {
                        let controller = controller.clone();
                        let text = rest.to_string();
                        tokio::spawn(async move {
                            report(controller.edit_and_resend(index, &text).await);
                        });
                    }
                    None => println!("No user message to edit."),
                }
            }
            "/stop" => {
                if controller.is_busy() {
                    controller.cancel();
                } else {
                    println!("No response in progress.");
                }
            }
            "/page" => {
                if rest.is_empty() {
                    println!("Usage: /page <url>");
                    continue;
                }
                extractor.set_url(rest);
                match controller.use_page_context().await {
                    Ok(label) => println!("Using page: {label}"),
                    Err(err) => println!("Could not load the page: {err:#}"),
                }
            }
            "/doc" => match std::fs::read_to_string(rest) {
                Ok(text) => {
                    let name = file_name(rest);
                    let chunks = controller.attach_document(&name, &text);
                    println!("Attached {name} ({chunks} chunks)");
                }
                Err(err) => println!("Could not read {rest}: {err}"),
            },
            "/image" => match std::fs::read(rest) {
                Ok(data) => {
                    let extension = rest.rsplit('.').next().unwrap_or("").to_lowercase();
                    match controller.attach_image(media_type_for(&extension), &data) {
                        Ok(_) => println!(
                            "Staged image ({} pending)",
                            controller.pending_image_count()
                        ),
                        Err(err) => println!("Could not store the image: {err:#}"),
                    }
                }
                Err(err) => println!("Could not read {rest}: {err}"),
            },
            "/contexts" => {
                let labels = controller.context_labels();
                if labels.is_empty() {
                    println!("No active contexts.");
                } else {
                    for label in labels {
                        println!("{label}");
                    }
                }
            }
            "/clear" => {
                controller.clear_contexts();
                println!("Contexts cleared.");
            }
            "/search" => match rest {
                "on" => controller.set_web_search(true),
                "off" => controller.set_web_search(false),
                _ => println!(
                    "Web search is {}. Usage: /search on|off",
                    if controller.web_search() { "on" } else { "off" }
                ),
            },
            "/models" => match controller.list_models().await {
                Ok(models) if models.is_empty() => println!("No models reported."),
                Ok(models) => {
                    for model in models {
                        println!("{model}");
                    }
                }
                Err(err) => println!("{err:#}"),
            },
            "/provider" => handle_provider_command(&providers, rest),
            _ => println!("Unknown command {command}. Type /help for commands."),
        }
    }
}

fn spawn_send(controller: &Arc<ChatController>, text: String) {
    let controller = controller.clone();
    tokio::spawn(async move {
        report(controller.send(&text).await);
    });
}

fn report(result: Result<(), ControllerError>) {
    match result {
        Ok(()) => {}
        Err(ControllerError::Busy) => {
            println!("A reply is already streaming, use /stop first.")
        }
        Err(ControllerError::Other(err)) => eprintln!("Error: {err:#}"),
    }
}

fn handle_provider_command(providers: &Arc<SessionProviders>, rest: &str) {
    let mut words = rest.split_whitespace();
    match words.next() {
        None => {
            let active = providers.registry.active_name();
            let entries = providers.registry.list();
            if entries.is_empty() {
                println!("No providers configured. Add one with /provider add <name> <endpoint> <model> [api_key]");
                return;
            }
            for entry in entries {
                let marker = if active.as_deref() == Some(entry.name.as_str()) {
                    "*"
                } else {
                    " "
                };
                let key = if entry.has_api_key() { "key set" } else { "no key" };
                println!(
                    "{marker} {}  {}  {}  ({key})",
                    entry.name, entry.endpoint, entry.model
                );
            }
        }
        Some("use") => match words.next() {
            Some(name) => {
                let result = providers
                    .registry
                    .set_active(name)
                    .and_then(|()| providers.registry.save());
                match result {
                    Ok(()) => println!("Active provider: {name}"),
                    Err(err) => println!("{err:#}"),
                }
            }
            None => println!("Usage: /provider use <name>"),
        },
        Some("add") => {
            let (name, endpoint, model) = match (words.next(), words.next(), words.next()) {
                (Some(name), Some(endpoint), Some(model)) => (name, endpoint, model),
                _ => {
                    println!("Usage: /provider add <name> <endpoint> <model> [api_key]");
                    return;
                }
            };
            providers.registry.upsert(ProviderSettings {
                name: name.to_string(),
                endpoint: endpoint.to_string(),
                api_key: words.next().unwrap_or("").to_string(),
                model: model.to_string(),
            });
            let result = providers
                .registry
                .set_active(name)
                .and_then(|()| providers.registry.save());
            match result {
                Ok(()) => println!("Added provider {name}"),
                Err(err) => println!("{err:#}"),
            }
        }
        Some("remove") => match words.next() {
            Some(name) => {
                if providers.registry.remove(name) {
                    match providers.registry.save() {
                        Ok(()) => println!("Removed provider {name}"),
                        Err(err) => println!("{err:#}"),
                    }
                } else {
                    println!("Unknown provider: {name}");
                }
            }
            None => println!("Usage: /provider remove <name>"),
        },
        Some(other) => println!("Unknown subcommand {other}. Try /provider use|add|remove."),
    }
}

fn print_conversations(summaries: &[ConversationSummary]) {
    if summaries.is_empty() {
        println!("No conversations found.");
        return;
    }
    for summary in summaries {
        println!(
            "{}  {:<40}  {} messages, {}",
            summary.id,
            summary.title,
            summary.message_count,
            format_age(summary.updated_at)
        );
    }
}

fn print_transcript(conversation: &Conversation) {
    for message in &conversation.messages {
        match message.role {
            Role::User => println!("You: {}", message.text_content()),
            Role::Assistant => println!("Assistant: {}", message.text_content()),
            Role::System => println!("{}", message.text_content()),
        }
    }
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn format_age(timestamp: SystemTime) -> String {
    let seconds = timestamp
        .elapsed()
        .unwrap_or_default()
        .as_secs();
    if seconds < 60 {
        "just now".to_string()
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86_400 {
        format!("{}h ago", seconds / 3600)
    } else {
        format!("{}d ago", seconds / 86_400)
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::try_parse_from(["pagechat"]).expect("Failed to parse default args");
        assert_eq!(args.verbose, 0);
        assert!(args.data_dir.is_none());
        assert!(args.provider.is_none());
        assert!(args.model.is_none());
        assert!(args.conversation.is_none());
        assert!(!args.list);
        assert!(args.prompt.is_none());
        assert!(!args.search);
    }

    #[test]
    fn test_verbose_levels() {
        let args = Args::try_parse_from(["pagechat", "-vv"]).expect("Failed to parse verbose args");
        assert_eq!(args.verbose, 2);

        let args = Args::try_parse_from(["pagechat", "-v", "-v", "-v"])
            .expect("Failed to parse verbose args");
        assert_eq!(args.verbose, 3);
    }

    #[test]
    fn test_one_shot_args() {
        let args = Args::try_parse_from([
            "pagechat",
            "--prompt",
            "hello",
            "--search",
            "-m",
            "llama3.2",
        ])
        .expect("Failed to parse one-shot args");
        assert_eq!(args.prompt.as_deref(), Some("hello"));
        assert!(args.search);
        assert_eq!(args.model.as_deref(), Some("llama3.2"));
    }

    #[test]
    fn test_data_dir_and_resume() {
        let args = Args::try_parse_from([
            "pagechat",
            "--data-dir",
            "/tmp/pagechat",
            "-c",
            "conv_abc_1",
        ])
        .expect("Failed to parse resume args");
        assert_eq!(args.data_dir, Some(PathBuf::from("/tmp/pagechat")));
        assert_eq!(args.conversation.as_deref(), Some("conv_abc_1"));
    }

    #[test]
    fn test_file_name_helper() {
        assert_eq!(file_name("/tmp/notes/report.md"), "report.md");
        assert_eq!(file_name("report.md"), "report.md");
    }
}
