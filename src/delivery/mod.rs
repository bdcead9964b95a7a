pub mod chat;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::watchlist::SubscriberKey;
use chat::{ChatApi, ChatError, InlineKeyboard, MAX_CAPTION_LEN, MAX_TEXT_LEN};

/// A message about to be sent, either plain text or captioned media.
#[derive(Debug)]
enum SendKind {
    Text {
        text: String,
        buttons: Option<InlineKeyboard>,
    },
    Photo {
        photo_url: String,
        caption: String,
    },
}

struct SendItem {
    chat_id: i64,
    kind: SendKind,
    responder: oneshot::Sender<Result<i64, ChatError>>,
}

struct EditItem {
    chat_id: i64,
    message_id: i64,
    text: String,
    buttons: Option<InlineKeyboard>,
    responder: oneshot::Sender<Result<bool, ChatError>>,
}

/// The two per-bot FIFOs: one for sends, one for edits. Each is drained by
/// a single worker in strict arrival order with a minimum spacing between
/// remote calls. A rate-limited item stays at the queue head; terminal
/// errors reject the item's future and move on.
pub struct BotQueues {
    send_tx: mpsc::UnboundedSender<SendItem>,
    edit_tx: mpsc::UnboundedSender<EditItem>,
}

impl BotQueues {
    pub fn spawn(
        bot_id: String,
        api: Arc<dyn ChatApi>,
        spacing: Duration,
        removals: mpsc::UnboundedSender<SubscriberKey>,
        shutdown: CancellationToken,
    ) -> Self {
        let (send_tx, send_rx) = mpsc::unbounded_channel::<SendItem>();
        let (edit_tx, edit_rx) = mpsc::unbounded_channel::<EditItem>();

        tokio::spawn(send_worker(
            bot_id.clone(),
            api.clone(),
            spacing,
            send_rx,
            removals.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(edit_worker(
            bot_id,
            api,
            spacing,
            edit_rx,
            removals,
            shutdown,
        ));

        Self { send_tx, edit_tx }
    }

    /// Enqueue a text send. The returned future resolves to the message id.
    pub fn submit_send(
        &self,
        chat_id: i64,
        text: String,
        buttons: Option<InlineKeyboard>,
    ) -> oneshot::Receiver<Result<i64, ChatError>> {
        let (responder, receiver) = oneshot::channel();
        if text.chars().count() > MAX_TEXT_LEN {
            let _ = responder.send(Err(ChatError::MessageTooLong {
                length: text.chars().count(),
                limit: MAX_TEXT_LEN,
            }));
            return receiver;
        }
        let item = SendItem {
            chat_id,
            kind: SendKind::Text { text, buttons },
            responder,
        };
        if let Err(mpsc::error::SendError(item)) = self.send_tx.send(item) {
            let _ = item
                .responder
                .send(Err(ChatError::Api("send queue closed".to_string())));
        }
        receiver
    }

    /// Enqueue a captioned photo send.
    pub fn submit_photo(
        &self,
        chat_id: i64,
        photo_url: String,
        caption: String,
    ) -> oneshot::Receiver<Result<i64, ChatError>> {
        let (responder, receiver) = oneshot::channel();
        if caption.chars().count() > MAX_CAPTION_LEN {
            let _ = responder.send(Err(ChatError::MessageTooLong {
                length: caption.chars().count(),
                limit: MAX_CAPTION_LEN,
            }));
            return receiver;
        }
        let item = SendItem {
            chat_id,
            kind: SendKind::Photo { photo_url, caption },
            responder,
        };
        if let Err(mpsc::error::SendError(item)) = self.send_tx.send(item) {
            let _ = item
                .responder
                .send(Err(ChatError::Api("send queue closed".to_string())));
        }
        receiver
    }

    /// Enqueue an in-place edit of a previously sent message.
    pub fn submit_edit(
        &self,
        chat_id: i64,
        message_id: i64,
        text: String,
        buttons: Option<InlineKeyboard>,
    ) -> oneshot::Receiver<Result<bool, ChatError>> {
        let (responder, receiver) = oneshot::channel();
        if text.chars().count() > MAX_TEXT_LEN {
            let _ = responder.send(Err(ChatError::MessageTooLong {
                length: text.chars().count(),
                limit: MAX_TEXT_LEN,
            }));
            return receiver;
        }
        let item = EditItem {
            chat_id,
            message_id,
            text,
            buttons,
            responder,
        };
        if let Err(mpsc::error::SendError(item)) = self.edit_tx.send(item) {
            let _ = item
                .responder
                .send(Err(ChatError::Api("edit queue closed".to_string())));
        }
        receiver
    }
}

async fn send_worker(
    bot_id: String,
    api: Arc<dyn ChatApi>,
    spacing: Duration,
    mut rx: mpsc::UnboundedReceiver<SendItem>,
    removals: mpsc::UnboundedSender<SubscriberKey>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            _ = shutdown.cancelled() => break,
        };
        let Some(item) = item else { break };

        let outcome = loop {
            let attempt = match &item.kind {
                SendKind::Text { text, buttons } => {
                    api.send_message(item.chat_id, text, buttons.as_ref()).await
                }
                SendKind::Photo { photo_url, caption } => {
                    api.send_photo(item.chat_id, photo_url, caption).await
                }
            };
            match attempt {
                Err(ChatError::RateLimited(seconds)) => {
                    tracing::warn!(bot = %bot_id, chat = item.chat_id, seconds, "Rate limited, retrying send");
                    tokio::time::sleep(Duration::from_secs(seconds)).await;
                }
                other => break other,
            }
        };

        if let Err(ChatError::SubscriberGone(reason)) = &outcome {
            tracing::info!(bot = %bot_id, chat = item.chat_id, reason = %reason, "Subscriber unreachable, flagging for removal");
            let _ = removals.send(SubscriberKey::new(item.chat_id, bot_id.clone()));
        }
        if let Err(e) = &outcome {
            if !matches!(e, ChatError::SubscriberGone(_)) {
                tracing::warn!(bot = %bot_id, chat = item.chat_id, error = %e, "Send failed");
            }
        }
        let _ = item.responder.send(outcome);

        tokio::time::sleep(spacing).await;
    }
    tracing::debug!(bot = %bot_id, "Send worker stopped");
}

async fn edit_worker(
    bot_id: String,
    api: Arc<dyn ChatApi>,
    spacing: Duration,
    mut rx: mpsc::UnboundedReceiver<EditItem>,
    removals: mpsc::UnboundedSender<SubscriberKey>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            _ = shutdown.cancelled() => break,
        };
        let Some(item) = item else { break };

        let outcome = loop {
            let attempt = api
                .edit_message_text(item.chat_id, item.message_id, &item.text, item.buttons.as_ref())
                .await;
            match attempt {
                Err(ChatError::RateLimited(seconds)) => {
                    tracing::warn!(bot = %bot_id, chat = item.chat_id, seconds, "Rate limited, retrying edit");
                    tokio::time::sleep(Duration::from_secs(seconds)).await;
                }
                other => break other,
            }
        };

        if let Err(ChatError::SubscriberGone(reason)) = &outcome {
            tracing::info!(bot = %bot_id, chat = item.chat_id, reason = %reason, "Subscriber unreachable, flagging for removal");
            let _ = removals.send(SubscriberKey::new(item.chat_id, bot_id.clone()));
        }
        if let Err(e) = &outcome {
            if !matches!(e, ChatError::SubscriberGone(_)) {
                tracing::warn!(bot = %bot_id, chat = item.chat_id, error = %e, "Edit failed");
            }
        }
        let _ = item.responder.send(outcome);

        tokio::time::sleep(spacing).await;
    }
    tracing::debug!(bot = %bot_id, "Edit worker stopped");
}

/// All per-bot queues, keyed by bot id. Only bots that passed the startup
/// token check are present.
pub struct Delivery {
    queues: HashMap<String, BotQueues>,
}

impl Delivery {
    pub fn new(queues: HashMap<String, BotQueues>) -> Self {
        Self { queues }
    }

    pub fn queues_for(&self, bot_id: &str) -> Option<&BotQueues> {
        self.queues.get(bot_id)
    }

    pub fn is_active(&self, bot_id: &str) -> bool {
        self.queues.contains_key(bot_id)
    }

    pub fn active_count(&self) -> usize {
        self.queues.len()
    }
}
