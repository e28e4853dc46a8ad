// Join Strategy Engine
// Retry/invite policy layered on top of room joins. Strategies decorate a
// join attempt; the appservice strategy can self-invite a virtual user from
// the bot before retrying.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::client::{ClientError, MatrixClient};

#[derive(Error, Debug)]
pub enum JoinStrategyError {
    #[error("Join attempt failed: {0}")]
    Attempt(ClientError),

    #[error("Invite before retry failed: {0}")]
    Invite(ClientError),
}

impl JoinStrategyError {
    pub fn status_code(&self) -> u16 {
        match self {
            JoinStrategyError::Attempt(e) => e.status_code(),
            JoinStrategyError::Invite(e) => e.status_code(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        "M_UNKNOWN"
    }
}

/// The underlying join call a strategy decorates.
#[async_trait::async_trait]
pub trait JoinAttempt: Send + Sync {
    async fn attempt(&self, room_id_or_alias: &str) -> Result<String, ClientError>;
}

/// A join attempt backed by a user's client.
pub struct ClientJoinAttempt {
    client: Arc<dyn MatrixClient>,
}

impl ClientJoinAttempt {
    pub fn new(client: Arc<dyn MatrixClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl JoinAttempt for ClientJoinAttempt {
    async fn attempt(&self, room_id_or_alias: &str) -> Result<String, ClientError> {
        self.client.join_room(room_id_or_alias).await
    }
}

/// A join policy. Implementations decide when and how often to run the
/// attempt; every terminal failure surfaces the error that aborted the
/// sequence.
#[async_trait::async_trait]
pub trait JoinStrategy: Send + Sync {
    async fn join(
        &self,
        room_id_or_alias: &str,
        user_id: &str,
        attempt: &dyn JoinAttempt,
    ) -> Result<String, JoinStrategyError>;
}

/// Retries the join on a fixed schedule. The leading zero means "try once
/// immediately"; each later entry is the pause before the next attempt.
pub struct SimpleRetryStrategy {
    schedule: Vec<Duration>,
}

impl SimpleRetryStrategy {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }
}

impl Default for SimpleRetryStrategy {
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(300),
            Duration::from_secs(900),
        ])
    }
}

#[async_trait::async_trait]
impl JoinStrategy for SimpleRetryStrategy {
    async fn join(
        &self,
        room_id_or_alias: &str,
        user_id: &str,
        attempt: &dyn JoinAttempt,
    ) -> Result<String, JoinStrategyError> {
        let mut last_error = None;
        for delay in &self.schedule {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }
            match attempt.attempt(room_id_or_alias).await {
                Ok(room_id) => return Ok(room_id),
                Err(error) => {
                    tracing::debug!(
                        "Join attempt for {} in {} failed: {}",
                        user_id,
                        room_id_or_alias,
                        error
                    );
                    last_error = Some(error);
                }
            }
        }
        Err(JoinStrategyError::Attempt(last_error.unwrap_or_else(|| {
            ClientError::InvalidResponse("empty retry schedule".to_string())
        })))
    }
}

/// Appservice-aware strategy: on a failed join of a non-bot user, the bot
/// invites that user into the room and the join is retried, either through
/// an inner strategy or with a single further attempt.
pub struct AppserviceJoinStrategy {
    bot_user_id: String,
    bot_client: Arc<dyn MatrixClient>,
    inner: Option<Arc<dyn JoinStrategy>>,
}

impl AppserviceJoinStrategy {
    pub fn new(
        bot_user_id: String,
        bot_client: Arc<dyn MatrixClient>,
        inner: Option<Arc<dyn JoinStrategy>>,
    ) -> Self {
        Self {
            bot_user_id,
            bot_client,
            inner,
        }
    }
}

#[async_trait::async_trait]
impl JoinStrategy for AppserviceJoinStrategy {
    async fn join(
        &self,
        room_id_or_alias: &str,
        user_id: &str,
        attempt: &dyn JoinAttempt,
    ) -> Result<String, JoinStrategyError> {
        let first_failure = match attempt.attempt(room_id_or_alias).await {
            Ok(room_id) => return Ok(room_id),
            Err(error) => error,
        };

        // The bot cannot invite itself; surface the original failure.
        if user_id == self.bot_user_id {
            return Err(JoinStrategyError::Attempt(first_failure));
        }

        tracing::debug!(
            "Join of {} for {} failed, inviting via bot before retry",
            room_id_or_alias,
            user_id
        );

        let room_id = self
            .bot_client
            .resolve_room(room_id_or_alias)
            .await
            .map_err(JoinStrategyError::Invite)?;
        self.bot_client
            .invite_user(user_id, &room_id)
            .await
            .map_err(JoinStrategyError::Invite)?;

        match &self.inner {
            Some(inner) => inner.join(room_id_or_alias, user_id, attempt).await,
            None => attempt
                .attempt(room_id_or_alias)
                .await
                .map_err(JoinStrategyError::Attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{remote_error, MockMatrixClient};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    /// Attempt stub that fails a scripted number of times and records when
    /// each attempt happened.
    struct CountdownAttempt {
        remaining_failures: Mutex<usize>,
        attempt_times: Mutex<Vec<Instant>>,
    }

    impl CountdownAttempt {
        fn failing(failures: usize) -> Self {
            Self {
                remaining_failures: Mutex::new(failures),
                attempt_times: Mutex::new(Vec::new()),
            }
        }

        async fn attempt_count(&self) -> usize {
            self.attempt_times.lock().await.len()
        }
    }

    #[async_trait::async_trait]
    impl JoinAttempt for CountdownAttempt {
        async fn attempt(&self, _room: &str) -> Result<String, ClientError> {
            self.attempt_times.lock().await.push(Instant::now());
            let mut remaining = self.remaining_failures.lock().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(remote_error(403, "M_FORBIDDEN"));
            }
            Ok("!joined:example.org".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simple_retry_schedule_timing() {
        let strategy = SimpleRetryStrategy::new(vec![
            Duration::ZERO,
            Duration::from_millis(50),
            Duration::from_millis(100),
        ]);
        let attempt = CountdownAttempt::failing(2);

        let start = Instant::now();
        let room = strategy
            .join("!r:example.org", "@u:example.org", &attempt)
            .await
            .unwrap();

        assert_eq!(room, "!joined:example.org");
        let times = attempt.attempt_times.lock().await;
        assert_eq!(times.len(), 3);
        // First attempt immediate, then the scheduled pauses.
        assert!(times[0] - start < Duration::from_millis(5));
        let second_gap = times[1] - times[0];
        let third_gap = times[2] - times[1];
        assert!(second_gap >= Duration::from_millis(50) && second_gap < Duration::from_millis(150));
        assert!(third_gap >= Duration::from_millis(100) && third_gap < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simple_retry_exhaustion_surfaces_last_error() {
        let strategy =
            SimpleRetryStrategy::new(vec![Duration::ZERO, Duration::from_millis(10)]);
        let attempt = CountdownAttempt::failing(5);

        let result = strategy
            .join("!r:example.org", "@u:example.org", &attempt)
            .await;

        assert_eq!(attempt.attempt_count().await, 2);
        assert!(matches!(
            result,
            Err(JoinStrategyError::Attempt(ClientError::Remote { status: 403, .. }))
        ));
    }

    #[tokio::test]
    async fn test_appservice_strategy_success_without_invite() {
        let bot = Arc::new(MockMatrixClient::new());
        let strategy =
            AppserviceJoinStrategy::new("@bot:example.org".to_string(), bot.clone(), None);
        let attempt = CountdownAttempt::failing(0);

        let room = strategy
            .join("!r:example.org", "@u:example.org", &attempt)
            .await
            .unwrap();

        assert_eq!(room, "!joined:example.org");
        assert_eq!(bot.count_calls("invite:").await, 0);
    }

    #[tokio::test]
    async fn test_appservice_strategy_skips_invite_for_bot() {
        let bot = Arc::new(MockMatrixClient::new());
        let strategy =
            AppserviceJoinStrategy::new("@bot:example.org".to_string(), bot.clone(), None);
        let attempt = CountdownAttempt::failing(10);

        let result = strategy
            .join("!r:example.org", "@bot:example.org", &attempt)
            .await;

        assert!(matches!(result, Err(JoinStrategyError::Attempt(_))));
        assert_eq!(attempt.attempt_count().await, 1);
        assert_eq!(bot.count_calls("invite:").await, 0);
    }

    #[tokio::test]
    async fn test_appservice_strategy_invites_then_retries_once() {
        let bot = Arc::new(MockMatrixClient::new());
        let strategy =
            AppserviceJoinStrategy::new("@bot:example.org".to_string(), bot.clone(), None);
        let attempt = CountdownAttempt::failing(1);

        let room = strategy
            .join("!r:example.org", "@u:example.org", &attempt)
            .await
            .unwrap();

        assert_eq!(room, "!joined:example.org");
        assert_eq!(attempt.attempt_count().await, 2);
        assert_eq!(bot.count_calls("invite:@u:example.org:!r:example.org").await, 1);
    }

    /// Inner strategy that records how often it was delegated to and
    /// succeeds without touching the decorated attempt.
    struct RecordingInner {
        joins: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl JoinStrategy for RecordingInner {
        async fn join(
            &self,
            _room: &str,
            _user_id: &str,
            _attempt: &dyn JoinAttempt,
        ) -> Result<String, JoinStrategyError> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            Ok("!joined:example.org".to_string())
        }
    }

    #[tokio::test]
    async fn test_appservice_strategy_delegates_to_inner_after_invite() {
        let bot = Arc::new(MockMatrixClient::new());
        let inner = Arc::new(RecordingInner {
            joins: AtomicUsize::new(0),
        });
        let strategy = AppserviceJoinStrategy::new(
            "@bot:example.org".to_string(),
            bot.clone(),
            Some(inner.clone()),
        );
        let attempt = CountdownAttempt::failing(1);

        let room = strategy
            .join("#alias:example.org", "@u:example.org", &attempt)
            .await
            .unwrap();

        assert_eq!(room, "!joined:example.org");
        // Exactly one direct attempt, one invite, one inner delegation.
        assert_eq!(attempt.attempt_count().await, 1);
        assert_eq!(bot.count_calls("invite:").await, 1);
        assert_eq!(bot.count_calls("resolve:#alias:example.org").await, 1);
        assert_eq!(inner.joins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_appservice_strategy_propagates_invite_failure() {
        struct RefusingBot;

        #[async_trait::async_trait]
        impl MatrixClient for RefusingBot {
            async fn create_room(&self, _: serde_json::Value) -> Result<String, ClientError> {
                unimplemented!()
            }
            async fn join_room(&self, _: &str) -> Result<String, ClientError> {
                unimplemented!()
            }
            async fn leave_room(&self, _: &str) -> Result<(), ClientError> {
                unimplemented!()
            }
            async fn invite_user(&self, _: &str, _: &str) -> Result<(), ClientError> {
                Err(remote_error(403, "M_FORBIDDEN"))
            }
            async fn get_joined_rooms(&self) -> Result<Vec<String>, ClientError> {
                unimplemented!()
            }
            async fn resolve_room(&self, room: &str) -> Result<String, ClientError> {
                Ok(room.to_string())
            }
            async fn get_room_state_event(
                &self,
                _: &str,
                _: &str,
                _: &str,
            ) -> Result<serde_json::Value, ClientError> {
                unimplemented!()
            }
            async fn send_event(
                &self,
                _: &str,
                _: &str,
                _: serde_json::Value,
            ) -> Result<String, ClientError> {
                unimplemented!()
            }
            async fn set_display_name(&self, _: &str) -> Result<(), ClientError> {
                unimplemented!()
            }
            async fn set_avatar_url(&self, _: &str) -> Result<(), ClientError> {
                unimplemented!()
            }
            async fn register(&self, _: &str) -> Result<(), ClientError> {
                unimplemented!()
            }
        }

        let strategy = AppserviceJoinStrategy::new(
            "@bot:example.org".to_string(),
            Arc::new(RefusingBot),
            None,
        );
        let attempt = CountdownAttempt::failing(10);

        let result = strategy
            .join("!r:example.org", "@u:example.org", &attempt)
            .await;

        assert!(matches!(result, Err(JoinStrategyError::Invite(_))));
        // No retry happened after the failed invite.
        assert_eq!(attempt.attempt_count().await, 1);
    }
}
