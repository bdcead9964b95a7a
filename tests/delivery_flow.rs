use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use walletwatch::delivery::chat::{ChatApi, ChatError, InlineKeyboard};
use walletwatch::delivery::BotQueues;
use walletwatch::watchlist::SubscriberKey;

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecordedCall {
    Send { chat_id: i64, text: String },
    Edit { chat_id: i64, message_id: i64, text: String },
}

/// A chat API that replays scripted outcomes and records every call.
#[derive(Default)]
struct ScriptedChat {
    calls: Mutex<Vec<RecordedCall>>,
    send_script: Mutex<VecDeque<Result<i64, ChatError>>>,
    edit_script: Mutex<VecDeque<Result<bool, ChatError>>>,
}

impl ScriptedChat {
    fn with_send_script(outcomes: Vec<Result<i64, ChatError>>) -> Self {
        Self {
            send_script: Mutex::new(outcomes.into()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatApi for ScriptedChat {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        _buttons: Option<&InlineKeyboard>,
    ) -> Result<i64, ChatError> {
        self.calls.lock().unwrap().push(RecordedCall::Send {
            chat_id,
            text: text.to_string(),
        });
        self.send_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(1))
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        _buttons: Option<&InlineKeyboard>,
    ) -> Result<bool, ChatError> {
        self.calls.lock().unwrap().push(RecordedCall::Edit {
            chat_id,
            message_id,
            text: text.to_string(),
        });
        self.edit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(true))
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        _photo_url: &str,
        caption: &str,
    ) -> Result<i64, ChatError> {
        self.calls.lock().unwrap().push(RecordedCall::Send {
            chat_id,
            text: caption.to_string(),
        });
        Ok(1)
    }
}

fn spawn_queues(api: Arc<ScriptedChat>) -> (BotQueues, mpsc::UnboundedReceiver<SubscriberKey>) {
    let (removal_tx, removal_rx) = mpsc::unbounded_channel();
    let queues = BotQueues::spawn(
        "mainbot".to_string(),
        api,
        Duration::from_millis(200),
        removal_tx,
        CancellationToken::new(),
    );
    (queues, removal_rx)
}

#[tokio::test(start_paused = true)]
async fn rate_limited_send_retries_in_place() {
    let api = Arc::new(ScriptedChat::with_send_script(vec![
        Err(ChatError::RateLimited(3)),
        Ok(7),
    ]));
    let (queues, _removals) = spawn_queues(api.clone());

    let started = tokio::time::Instant::now();
    let receiver = queues.submit_send(10, "hello".to_string(), None);
    let message_id = receiver.await.unwrap().unwrap();
    assert_eq!(message_id, 7);

    // The worker slept at least the advisory duration before retrying
    assert!(started.elapsed() >= Duration::from_secs(3));

    // Both attempts carried the same item; nothing was dequeued in between
    let calls = api.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], calls[1]);
}

#[tokio::test(start_paused = true)]
async fn send_then_edit_targets_same_message() {
    let api = Arc::new(ScriptedChat::with_send_script(vec![Ok(42)]));
    let (queues, _removals) = spawn_queues(api.clone());

    let message_id = queues
        .submit_send(55, "fast view".to_string(), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message_id, 42);

    let edited = queues
        .submit_edit(55, message_id, "full view".to_string(), None)
        .await
        .unwrap()
        .unwrap();
    assert!(edited);

    assert_eq!(
        api.calls(),
        vec![
            RecordedCall::Send {
                chat_id: 55,
                text: "fast view".to_string()
            },
            RecordedCall::Edit {
                chat_id: 55,
                message_id: 42,
                text: "full view".to_string()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn sends_drain_in_submission_order() {
    let api = Arc::new(ScriptedChat::with_send_script(vec![Ok(1), Ok(2), Ok(3)]));
    let (queues, _removals) = spawn_queues(api.clone());

    let first = queues.submit_send(1, "first".to_string(), None);
    let second = queues.submit_send(1, "second".to_string(), None);
    let third = queues.submit_send(1, "third".to_string(), None);

    assert_eq!(first.await.unwrap().unwrap(), 1);
    assert_eq!(second.await.unwrap().unwrap(), 2);
    assert_eq!(third.await.unwrap().unwrap(), 3);

    let texts: Vec<String> = api
        .calls()
        .into_iter()
        .map(|call| match call {
            RecordedCall::Send { text, .. } => text,
            other => panic!("unexpected call {other:?}"),
        })
        .collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
}

#[tokio::test(start_paused = true)]
async fn too_long_message_rejected_before_enqueue() {
    let api = Arc::new(ScriptedChat::default());
    let (queues, _removals) = spawn_queues(api.clone());

    let oversized = "x".repeat(5_000);
    let result = queues.submit_send(1, oversized, None).await.unwrap();
    match result {
        Err(ChatError::MessageTooLong { length, limit }) => {
            assert_eq!(length, 5_000);
            assert_eq!(limit, 4_096);
        }
        other => panic!("expected MessageTooLong, got {other:?}"),
    }
    // Nothing reached the remote API
    assert!(api.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn oversized_caption_rejected_before_enqueue() {
    let api = Arc::new(ScriptedChat::default());
    let (queues, _removals) = spawn_queues(api.clone());

    let caption = "y".repeat(3_000);
    let result = queues
        .submit_photo(1, "https://charts.example/p.png".to_string(), caption)
        .await
        .unwrap();
    match result {
        Err(ChatError::MessageTooLong { limit, .. }) => assert_eq!(limit, 2_048),
        other => panic!("expected MessageTooLong, got {other:?}"),
    }
    assert!(api.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn blocked_subscriber_is_flagged_for_removal() {
    let api = Arc::new(ScriptedChat::with_send_script(vec![Err(
        ChatError::SubscriberGone("Forbidden: bot was blocked by the user".to_string()),
    )]));
    let (queues, mut removals) = spawn_queues(api.clone());

    let result = queues.submit_send(99, "hello".to_string(), None).await.unwrap();
    assert!(matches!(result, Err(ChatError::SubscriberGone(_))));

    let flagged = removals.recv().await.unwrap();
    assert_eq!(flagged, SubscriberKey::new(99, "mainbot"));

    // The item was dequeued, not retried
    assert_eq!(api.calls().len(), 1);
}
