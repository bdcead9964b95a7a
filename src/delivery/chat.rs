use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

/// Hard limit the chat platform enforces on message text.
pub const MAX_TEXT_LEN: usize = 4096;
/// Hard limit on captions for media messages.
pub const MAX_CAPTION_LEN: usize = 2048;

#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("subscriber unreachable: {0}")]
    SubscriberGone(String),
    #[error("bad message: {0}")]
    BadMessage(String),
    #[error("message too long: {length} > {limit}")]
    MessageTooLong { length: usize, limit: usize },
    #[error("chat api error: {0}")]
    Api(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub url: String,
}

/// Rows of URL buttons attached below a message.
pub type InlineKeyboard = Vec<Vec<InlineButton>>;

/// The chat-platform surface the delivery queues drive. Kept narrow so
/// tests can substitute a scripted fake.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Returns the id of the created message.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        buttons: Option<&InlineKeyboard>,
    ) -> Result<i64, ChatError>;

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        buttons: Option<&InlineKeyboard>,
    ) -> Result<bool, ChatError>;

    /// Returns the id of the created message.
    async fn send_photo(
        &self,
        chat_id: i64,
        photo_url: &str,
        caption: &str,
    ) -> Result<i64, ChatError>;
}

/// HTTP client for one bot token.
///
/// Every text-bearing call is decorated with HTML formatting mode and
/// disabled link previews here, so callers never set them.
pub struct BotClient {
    http: reqwest::Client,
    base: String,
}

impl BotClient {
    pub fn new(api_base: &str, token: &str) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        })
    }

    /// Verify the token and return the bot's username.
    pub async fn get_me(&self) -> Result<String, ChatError> {
        let result = self.invoke("getMe", json!({})).await?;
        Ok(result
            .get("username")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    pub async fn set_my_commands(&self, commands: &[(&str, &str)]) -> Result<bool, ChatError> {
        let commands: Vec<Value> = commands
            .iter()
            .map(|(command, description)| json!({"command": command, "description": description}))
            .collect();
        let result = self
            .invoke("setMyCommands", json!({ "commands": commands }))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    async fn invoke(&self, method: &str, mut payload: Value) -> Result<Value, ChatError> {
        apply_defaults(method, &mut payload);
        let url = format!("{}/{}", self.base, method);
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        if body.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(body.get("result").cloned().unwrap_or(Value::Null));
        }

        let description = body
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error");
        let retry_after = body
            .pointer("/parameters/retry_after")
            .and_then(|v| v.as_u64());
        Err(classify_api_error(description, retry_after))
    }
}

/// Transport-layer defaults: HTML parse mode everywhere text renders, and
/// no link previews on plain messages.
fn apply_defaults(method: &str, payload: &mut Value) {
    let Some(map) = payload.as_object_mut() else {
        return;
    };
    match method {
        "sendMessage" | "editMessageText" => {
            map.insert("parse_mode".to_string(), json!("HTML"));
            map.insert("disable_web_page_preview".to_string(), json!(true));
        }
        "sendPhoto" => {
            map.insert("parse_mode".to_string(), json!("HTML"));
        }
        _ => {}
    }
}

/// Map an API error description (plus the optional retry-after advisory)
/// onto the delivery taxonomy.
pub fn classify_api_error(description: &str, retry_after: Option<u64>) -> ChatError {
    if let Some(seconds) = retry_after {
        return ChatError::RateLimited(seconds);
    }
    let lower = description.to_lowercase();
    if lower.contains("too many requests") {
        return ChatError::RateLimited(5);
    }
    if lower.contains("bot was blocked")
        || lower.contains("bot was kicked")
        || lower.contains("chat not found")
        || lower.contains("user is deactivated")
    {
        return ChatError::SubscriberGone(description.to_string());
    }
    if lower.contains("message to edit not found")
        || lower.contains("can't parse entities")
        || lower.contains("message is too long")
        || lower.contains("message text is empty")
    {
        return ChatError::BadMessage(description.to_string());
    }
    ChatError::Api(description.to_string())
}

fn keyboard_markup(buttons: &InlineKeyboard) -> Value {
    let rows: Vec<Vec<Value>> = buttons
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({"text": b.text, "url": b.url}))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

fn message_id_of(result: &Value) -> Result<i64, ChatError> {
    result
        .get("message_id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ChatError::Api("response carried no message_id".to_string()))
}

#[async_trait]
impl ChatApi for BotClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        buttons: Option<&InlineKeyboard>,
    ) -> Result<i64, ChatError> {
        let mut payload = json!({ "chat_id": chat_id, "text": text });
        if let Some(buttons) = buttons {
            payload["reply_markup"] = keyboard_markup(buttons);
        }
        let result = self.invoke("sendMessage", payload).await?;
        message_id_of(&result)
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        buttons: Option<&InlineKeyboard>,
    ) -> Result<bool, ChatError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(buttons) = buttons {
            payload["reply_markup"] = keyboard_markup(buttons);
        }
        self.invoke("editMessageText", payload).await?;
        Ok(true)
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        photo_url: &str,
        caption: &str,
    ) -> Result<i64, ChatError> {
        let payload = json!({
            "chat_id": chat_id,
            "photo": photo_url,
            "caption": caption,
        });
        let result = self.invoke("sendPhoto", payload).await?;
        message_id_of(&result)
    }
}
