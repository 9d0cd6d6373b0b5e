mod error;
mod view;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gemchat_llm::{CompletionClient, CompletionRequest, ProjectedTurn};
use gemchat_storage::{ChatTurn, NewTurn, TurnId, TurnStore, now_timestamp};
use snafu::{OptionExt, ResultExt, ensure};

pub use error::ExchangeError;
pub use view::{ConversationView, ExchangeKeys, PENDING_PLACEHOLDER, ViewTurn};

use self::error::{ConfigurationRequiredSnafu, MalformedResponseSnafu, StorageUnavailableSnafu};
use crate::history::{project, project_view};
use crate::settings::SettingsStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Answered { text: String },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyInput,
    InFlight,
}

/// Drives question/answer exchanges and is the only writer to the turn store.
///
/// At most one exchange runs at a time. A failed exchange leaves both the transcript and
/// the store as they were before the question was submitted, with the question back in the
/// draft.
pub struct Conversation {
    store: Arc<dyn TurnStore>,
    client: Arc<dyn CompletionClient>,
    settings: Arc<SettingsStore>,
    view: Mutex<ConversationView>,
    in_flight: AtomicBool,
}

impl Conversation {
    pub fn new(
        store: Arc<dyn TurnStore>,
        client: Arc<dyn CompletionClient>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            store,
            client,
            settings,
            view: Mutex::new(ConversationView::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Loads stored history into the transcript; returns how many turns were restored.
    pub async fn restore(&self) -> Result<usize, ExchangeError> {
        let stored = self.store.load_all().await.context(StorageUnavailableSnafu {
            stage: "restore-load-history",
        })?;
        self.view().replace_with_stored(&stored);
        tracing::debug!(turns = stored.len(), "restored conversation history");
        Ok(stored.len())
    }

    pub fn set_draft(&self, draft: impl Into<String>) {
        self.view().set_draft(draft);
    }

    pub fn draft(&self) -> String {
        self.view().draft().to_string()
    }

    pub fn turns(&self) -> Vec<ViewTurn> {
        self.view().turns().to_vec()
    }

    /// Nothing to show yet; front ends greet the user instead.
    pub fn is_welcome(&self) -> bool {
        self.view().is_empty()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Sends the current draft as a question and waits for the reply.
    pub async fn submit(&self) -> Result<SubmitOutcome, ExchangeError> {
        let draft = self.draft();
        let question = draft.trim().to_string();
        if question.is_empty() {
            return Ok(SubmitOutcome::Skipped(SkipReason::EmptyInput));
        }

        let Some(_in_flight) = InFlightGuard::acquire(&self.in_flight) else {
            tracing::debug!("submit ignored while an exchange is in flight");
            return Ok(SubmitOutcome::Skipped(SkipReason::InFlight));
        };

        let credentials = self
            .settings
            .settings()
            .credentials()
            .context(ConfigurationRequiredSnafu {
                stage: "submit-credentials",
            })?;

        // The question travels in its own field, so history is read before it is stored.
        let chat_history = self.history_for_request().await;

        // A store failure degrades this exchange to the transcript only.
        let (question_id, question_timestamp) =
            match self.store.append(NewTurn::user(question.clone())).await {
                Ok(ChatTurn { id, timestamp, .. }) => (Some(id), timestamp),
                Err(error) => {
                    tracing::warn!(%error, "failed to persist question, keeping it in the transcript only");
                    (None, now_timestamp())
                }
            };
        let keys = self
            .view()
            .begin_exchange(&question, question_timestamp, question_id);

        tracing::info!(
            client = self.client.name(),
            model = %credentials.model,
            history_len = chat_history.len(),
            "submitting question"
        );

        let request = CompletionRequest::new(
            question,
            chat_history,
            credentials.api_key,
            credentials.model,
        );
        let reply = self
            .client
            .complete(request)
            .await
            .map_err(|error| ExchangeError::from_completion("submit-complete", error))
            .and_then(|text| {
                ensure!(
                    !text.trim().is_empty(),
                    MalformedResponseSnafu {
                        stage: "submit-blank-reply",
                        detail: "reply contained no text",
                    }
                );
                Ok(text)
            });

        match reply {
            Ok(text) => {
                self.commit_reply(keys, text.clone()).await;
                Ok(SubmitOutcome::Answered { text })
            }
            Err(error) => {
                tracing::warn!(%error, "exchange failed, rolling back");
                self.roll_back(keys, question_id, draft).await;
                Err(error)
            }
        }
    }

    /// Empties the store, then the transcript. A failed clear leaves the transcript intact.
    pub async fn clear_history(&self) -> Result<(), ExchangeError> {
        self.store.clear().await.context(StorageUnavailableSnafu {
            stage: "clear-history",
        })?;
        self.view().clear();
        tracing::info!("cleared conversation history");
        Ok(())
    }

    async fn history_for_request(&self) -> Vec<ProjectedTurn> {
        match self.store.load_all().await {
            Ok(stored) => project(&stored),
            Err(error) => {
                tracing::warn!(%error, "history unavailable, replaying the transcript instead");
                let view = self.view();
                project_view(view.turns())
            }
        }
    }

    async fn commit_reply(&self, keys: ExchangeKeys, text: String) {
        // A clear while the request was out already emptied the store; the reply must not
        // come back as an orphan.
        if !self.view().is_awaiting(keys) {
            tracing::debug!("transcript cleared while the exchange was in flight, dropping reply");
            return;
        }

        let (stored_id, timestamp) = match self.store.append(NewTurn::model(text.clone())).await {
            Ok(ChatTurn { id, timestamp, .. }) => (Some(id), timestamp),
            Err(error) => {
                tracing::warn!(%error, "failed to persist reply, keeping it in the transcript only");
                (None, now_timestamp())
            }
        };

        let completed = self
            .view()
            .complete_exchange(keys, text, stored_id, timestamp);
        if !completed && let Some(id) = stored_id {
            tracing::debug!(turn_id = %id, "transcript cleared while persisting the reply");
            self.forget(id).await;
        }
    }

    async fn roll_back(&self, keys: ExchangeKeys, question_id: Option<TurnId>, draft: String) {
        self.view().rollback_exchange(keys, draft);

        if let Some(id) = question_id {
            self.forget(id).await;
        }
    }

    async fn forget(&self, id: TurnId) {
        if let Err(error) = self.store.remove(id).await {
            tracing::warn!(%error, turn_id = %id, "failed to remove turn from history");
        }
    }

    fn view(&self) -> MutexGuard<'_, ConversationView> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the in-flight flag for the lifetime of one exchange.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    use gemchat_llm::{BoxFuture, CompletionError, CompletionResult};
    use gemchat_storage::{
        BoxFuture as StoreFuture, MemoryTurnStore, StorageError, StorageResult, TurnAuthor,
        TurnId,
    };
    use tokio::sync::Notify;

    use super::*;
    use crate::settings::ChatSettings;

    /// Answers with queued results and records every request it receives.
    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<CompletionResult<String>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedClient {
        fn with_replies(replies: Vec<CompletionResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::default(),
            })
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl CompletionClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        fn complete<'a>(
            &'a self,
            request: CompletionRequest,
        ) -> BoxFuture<'a, CompletionResult<String>> {
            self.requests.lock().unwrap().push(request);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("default reply".to_string()));
            Box::pin(async move { reply })
        }
    }

    /// Parks inside `complete` until released.
    #[derive(Default)]
    struct BlockingClient {
        started: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    impl CompletionClient for BlockingClient {
        fn name(&self) -> &str {
            "blocking"
        }

        fn complete<'a>(
            &'a self,
            _request: CompletionRequest,
        ) -> BoxFuture<'a, CompletionResult<String>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.started.notify_one();
                self.release.notified().await;
                Ok("finally".to_string())
            })
        }
    }

    /// Memory store with switchable failures for appends and clears.
    struct FailingStore {
        inner: MemoryTurnStore,
        fail_append: bool,
        fail_clear: bool,
    }

    impl Default for FailingStore {
        fn default() -> Self {
            Self {
                inner: MemoryTurnStore::new(50),
                fail_append: false,
                fail_clear: false,
            }
        }
    }

    impl FailingStore {
        fn locked(stage: &'static str) -> StorageError {
            StorageError::InvariantViolation {
                stage,
                details: "database is locked".to_string(),
            }
        }
    }

    impl TurnStore for FailingStore {
        fn append_at(
            &self,
            turn: NewTurn,
            timestamp: chrono::DateTime<chrono::Utc>,
        ) -> StoreFuture<'_, StorageResult<ChatTurn>> {
            if self.fail_append {
                return Box::pin(async { Err(Self::locked("test-append")) });
            }
            self.inner.append_at(turn, timestamp)
        }

        fn load_all(&self) -> StoreFuture<'_, StorageResult<Vec<ChatTurn>>> {
            self.inner.load_all()
        }

        fn remove(&self, id: TurnId) -> StoreFuture<'_, StorageResult<()>> {
            self.inner.remove(id)
        }

        fn clear(&self) -> StoreFuture<'_, StorageResult<()>> {
            if self.fail_clear {
                return Box::pin(async { Err(Self::locked("test-clear")) });
            }
            self.inner.clear()
        }

        fn capacity(&self) -> usize {
            self.inner.capacity()
        }
    }

    fn configured_settings() -> Arc<SettingsStore> {
        let settings = ChatSettings {
            api_key: "test-key".to_string(),
            ..ChatSettings::default()
        };
        Arc::new(SettingsStore::from_settings(
            PathBuf::from("unused-settings.json"),
            settings,
        ))
    }

    fn conversation(store: Arc<dyn TurnStore>, client: Arc<dyn CompletionClient>) -> Conversation {
        Conversation::new(store, client, configured_settings())
    }

    fn texts(turns: &[ViewTurn]) -> Vec<&str> {
        turns.iter().map(|turn| turn.content.as_str()).collect()
    }

    async fn store_with(turns: &[NewTurn]) -> Arc<MemoryTurnStore> {
        let store = Arc::new(MemoryTurnStore::new(50));
        for turn in turns {
            store.append(turn.clone()).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn successful_exchange_persists_both_turns_and_replays_prior_history() {
        let store = store_with(&[NewTurn::user("A"), NewTurn::model("B")]).await;
        let client = ScriptedClient::with_replies(vec![Ok("C".to_string())]);
        let conversation = conversation(store.clone(), client.clone());
        conversation.restore().await.unwrap();

        conversation.set_draft("  next question ");
        let outcome = conversation.submit().await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Answered {
                text: "C".to_string()
            }
        );

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].question, "next question");
        assert_eq!(requests[0].api_key, "test-key");
        assert_eq!(
            requests[0].chat_history,
            vec![ProjectedTurn::user("A"), ProjectedTurn::model("B")]
        );

        assert_eq!(
            texts(&conversation.turns()),
            vec!["A", "B", "next question", "C"]
        );
        assert!(conversation.turns().iter().all(|turn| !turn.pending));
        assert_eq!(conversation.draft(), "");
        assert!(!conversation.is_busy());

        let stored = store.load_all().await.unwrap();
        let stored_texts = stored
            .iter()
            .map(|turn| turn.content.as_text())
            .collect::<Vec<_>>();
        assert_eq!(stored_texts, vec!["A", "B", "next question", "C"]);
        assert_eq!(stored[3].author, TurnAuthor::Model);
    }

    #[tokio::test]
    async fn remote_error_rolls_back_view_store_and_draft() {
        let store = store_with(&[NewTurn::user("A")]).await;
        let client = ScriptedClient::with_replies(vec![Err(CompletionError::RemoteStatus {
            stage: "proxy-status",
            status: 403,
            detail: "API key does not have access".to_string(),
        })]);
        let conversation = conversation(store.clone(), client);
        conversation.restore().await.unwrap();

        conversation.set_draft("will fail");
        let error = conversation.submit().await.unwrap_err();

        assert!(matches!(
            error,
            ExchangeError::RemoteError {
                status: Some(403),
                ..
            }
        ));
        assert_eq!(texts(&conversation.turns()), vec!["A"]);
        assert_eq!(conversation.draft(), "will fail");
        assert!(!conversation.is_busy());

        let stored = store.load_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content.as_text(), "A");
    }

    #[tokio::test]
    async fn blank_reply_is_malformed_and_rolled_back() {
        let store = store_with(&[]).await;
        let client = ScriptedClient::with_replies(vec![Ok("   ".to_string())]);
        let conversation = conversation(store.clone(), client);

        conversation.set_draft("hi");
        let error = conversation.submit().await.unwrap_err();

        assert!(matches!(error, ExchangeError::MalformedResponse { .. }));
        assert!(conversation.is_welcome());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_draft_is_skipped_without_a_request() {
        let client = ScriptedClient::with_replies(Vec::new());
        let conversation = conversation(store_with(&[]).await, client.clone());

        conversation.set_draft(" \n\t ");
        let outcome = conversation.submit().await.unwrap();

        assert_eq!(outcome, SubmitOutcome::Skipped(SkipReason::EmptyInput));
        assert!(client.requests().is_empty());
        assert_eq!(conversation.draft(), " \n\t ");
    }

    #[tokio::test]
    async fn missing_api_key_requires_configuration() {
        let store = store_with(&[]).await;
        let client = ScriptedClient::with_replies(Vec::new());
        let settings = Arc::new(SettingsStore::from_settings(
            PathBuf::from("unused-settings.json"),
            ChatSettings::default(),
        ));
        let conversation = Conversation::new(store.clone(), client.clone(), settings);

        conversation.set_draft("hello");
        let error = conversation.submit().await.unwrap_err();

        assert!(matches!(error, ExchangeError::ConfigurationRequired { .. }));
        assert_eq!(conversation.draft(), "hello");
        assert!(conversation.turns().is_empty());
        assert!(client.requests().is_empty());
        assert!(store.load_all().await.unwrap().is_empty());
        assert!(!conversation.is_busy());
    }

    #[tokio::test]
    async fn second_submit_while_awaiting_a_reply_is_ignored() {
        let client = Arc::new(BlockingClient::default());
        let conversation = Arc::new(conversation(store_with(&[]).await, client.clone()));

        conversation.set_draft("first");
        let running = tokio::spawn({
            let conversation = conversation.clone();
            async move { conversation.submit().await }
        });
        client.started.notified().await;

        assert!(conversation.is_busy());
        let before = conversation.turns();
        assert_eq!(before.last().map(|turn| turn.pending), Some(true));

        conversation.set_draft("second");
        let outcome = conversation.submit().await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(conversation.turns(), before);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        client.release.notify_one();
        let finished = running.await.unwrap().unwrap();
        assert_eq!(
            finished,
            SubmitOutcome::Answered {
                text: "finally".to_string()
            }
        );
        assert!(!conversation.is_busy());
        assert_eq!(texts(&conversation.turns()), vec!["first", "finally"]);
    }

    #[tokio::test]
    async fn clear_history_empties_store_and_transcript() {
        let store = store_with(&[NewTurn::user("A"), NewTurn::model("B")]).await;
        let conversation = conversation(store.clone(), ScriptedClient::with_replies(Vec::new()));
        assert_eq!(conversation.restore().await.unwrap(), 2);
        assert!(!conversation.is_welcome());

        conversation.clear_history().await.unwrap();

        assert!(conversation.is_welcome());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_clear_leaves_the_transcript_untouched() {
        let inner = MemoryTurnStore::new(50);
        inner.append(NewTurn::user("A")).await.unwrap();
        let store = Arc::new(FailingStore {
            inner,
            fail_clear: true,
            ..FailingStore::default()
        });
        let conversation = conversation(store, ScriptedClient::with_replies(Vec::new()));
        conversation.restore().await.unwrap();

        let error = conversation.clear_history().await.unwrap_err();

        assert!(matches!(error, ExchangeError::StorageUnavailable { .. }));
        assert_eq!(texts(&conversation.turns()), vec!["A"]);
    }

    #[tokio::test]
    async fn network_failure_rolls_back_view_store_and_draft() {
        let store = store_with(&[NewTurn::user("A"), NewTurn::model("B")]).await;
        let client = ScriptedClient::with_replies(vec![Err(CompletionError::MissingEndpoint {
            stage: "proxy-client-new",
            backend: "proxy",
        })]);
        let conversation = conversation(store.clone(), client.clone());
        conversation.restore().await.unwrap();

        conversation.set_draft("unreachable?");
        let error = conversation.submit().await.unwrap_err();

        assert!(matches!(error, ExchangeError::NetworkFailure { .. }));
        assert_eq!(client.requests().len(), 1);
        assert_eq!(texts(&conversation.turns()), vec!["A", "B"]);
        assert_eq!(conversation.draft(), "unreachable?");
        assert!(!conversation.is_busy());

        let stored = store.load_all().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|turn| turn.content.as_text() != "unreachable?"));
    }

    #[tokio::test]
    async fn store_failure_still_answers_from_the_transcript() {
        let store = Arc::new(FailingStore {
            fail_append: true,
            ..FailingStore::default()
        });
        let client = ScriptedClient::with_replies(vec![Ok("answer".to_string())]);
        let conversation = conversation(store.clone(), client.clone());

        conversation.set_draft("still there?");
        let outcome = conversation.submit().await.unwrap();

        assert_eq!(
            outcome,
            SubmitOutcome::Answered {
                text: "answer".to_string()
            }
        );
        assert_eq!(client.requests().len(), 1);
        let turns = conversation.turns();
        assert_eq!(texts(&turns), vec!["still there?", "answer"]);
        assert!(turns.iter().all(|turn| turn.stored_id.is_none() && !turn.pending));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_then_remote_error_restores_the_draft() {
        let store = Arc::new(FailingStore {
            fail_append: true,
            ..FailingStore::default()
        });
        let client = ScriptedClient::with_replies(vec![Err(CompletionError::RemoteStatus {
            stage: "proxy-status",
            status: 500,
            detail: "upstream failed".to_string(),
        })]);
        let conversation = conversation(store, client);

        conversation.set_draft("again");
        let error = conversation.submit().await.unwrap_err();

        assert!(matches!(error, ExchangeError::RemoteError { .. }));
        assert!(conversation.is_welcome());
        assert_eq!(conversation.draft(), "again");
    }

    #[tokio::test]
    async fn reply_arriving_after_a_clear_is_not_stored() {
        let client = Arc::new(BlockingClient::default());
        let store = store_with(&[NewTurn::user("A")]).await;
        let conversation = Arc::new(conversation(store.clone(), client.clone()));
        conversation.restore().await.unwrap();

        conversation.set_draft("slow question");
        let running = tokio::spawn({
            let conversation = conversation.clone();
            async move { conversation.submit().await }
        });
        client.started.notified().await;

        conversation.clear_history().await.unwrap();
        client.release.notify_one();
        running.await.unwrap().unwrap();

        assert!(conversation.is_welcome());
        assert!(store.load_all().await.unwrap().is_empty());

        let reopened = Conversation::new(store, client, configured_settings());
        assert_eq!(reopened.restore().await.unwrap(), 0);
    }
}
