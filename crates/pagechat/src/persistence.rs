use crate::conversation::Conversation;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Storage for conversation logs, keyed by conversation id.
pub trait ConversationStore: Send + Sync {
    fn save(&self, conversation: &Conversation) -> Result<()>;
    fn load(&self, id: &str) -> Result<Option<Conversation>>;
    fn list(&self) -> Result<Vec<ConversationSummary>>;
    fn delete(&self, id: &str) -> Result<()>;
}

/// Storage for image attachments. Conversations persist only the opaque
/// reference; binary data lives here.
pub trait ImageStore: Send + Sync {
    fn save_image(&self, media_type: &str, data: &[u8]) -> Result<String>;
    fn load_image(&self, reference: &str) -> Result<(String, Vec<u8>)>;
}

/// Metadata for a conversation (used for listing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub updated_at: SystemTime,
    pub message_count: usize,
}

/// One JSON file per conversation under `{root}/conversations/`, image
/// blobs under `{root}/images/`.
#[derive(Clone)]
pub struct FileStore {
    root_dir: PathBuf,
}

static IMAGE_SEQ: AtomicU64 = AtomicU64::new(0);

impl FileStore {
    pub fn new() -> Self {
        let root_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pagechat");
        info!("Storing conversations in: {:?}", root_dir);
        Self { root_dir }
    }

    pub fn with_root(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    fn ensure_conversations_dir(&self) -> Result<PathBuf> {
        let dir = self.root_dir.join("conversations");
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    fn conversation_path(&self, id: &str) -> Result<PathBuf> {
        let dir = self.ensure_conversations_dir()?;
        Ok(dir.join(format!("{id}.json")))
    }

    fn ensure_images_dir(&self) -> Result<PathBuf> {
        let dir = self.root_dir.join("images");
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }
}

impl ConversationStore for FileStore {
    fn save(&self, conversation: &Conversation) -> Result<()> {
        let path = self.conversation_path(&conversation.id)?;
        debug!("Saving conversation to {}", path.display());
        let json = serde_json::to_string_pretty(conversation)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Conversation>> {
        let path = self.conversation_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        debug!("Loading conversation from {}", path.display());
        let json = std::fs::read_to_string(path)?;
        let conversation: Conversation = serde_json::from_str(&json)?;
        Ok(Some(conversation))
    }

    fn list(&self) -> Result<Vec<ConversationSummary>> {
        let dir = self.root_dir.join("conversations");
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    warn!("Skipping unreadable file {}: {}", path.display(), err);
                    continue;
                }
            };
            match serde_json::from_str::<Conversation>(&content) {
                Ok(conversation) => summaries.push(ConversationSummary {
                    id: conversation.id,
                    title: conversation.title,
                    updated_at: conversation.updated_at,
                    message_count: conversation.messages.len(),
                }),
                Err(err) => {
                    warn!(
                        "Skipping corrupt conversation file {}: {}",
                        path.display(),
                        err
                    );
                }
            }
        }

        // Sort by updated_at in descending order (newest first)
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.conversation_path(id)?;
        if path.exists() {
            debug!("Deleting conversation file {}", path.display());
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl ImageStore for FileStore {
    fn save_image(&self, media_type: &str, data: &[u8]) -> Result<String> {
        let dir = self.ensure_images_dir()?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let seq = IMAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        let reference = format!("img_{stamp:x}_{seq}.{}", extension_for(media_type));
        std::fs::write(dir.join(&reference), data)?;
        Ok(reference)
    }

    fn load_image(&self, reference: &str) -> Result<(String, Vec<u8>)> {
        if reference.contains('/') || reference.contains('\\') || reference.contains("..") {
            anyhow::bail!("Invalid image reference: {}", reference);
        }
        let path = self.root_dir.join("images").join(reference);
        let data = std::fs::read(&path)
            .with_context(|| format!("Failed to read image {}", path.display()))?;
        let extension = reference.rsplit('.').next().unwrap_or("");
        Ok((media_type_for(extension).to_string(), data))
    }
}

/// Generate a unique conversation ID
pub fn generate_conversation_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    // Simple random component using timestamp
    let random_part = (timestamp % 10000) + (std::process::id() as u64 % 1000);

    format!("conv_{timestamp:x}_{random_part:x}")
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// Media type for a file extension, for callers attaching images from
/// disk.
pub fn media_type_for(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}
