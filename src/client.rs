// Matrix Client-Server API Client
// The small verb set the runtime needs from the homeserver, behind a trait
// so tests can substitute an in-memory implementation. The HTTP client
// authenticates with the as_token and impersonates virtual users through
// the user_id query parameter.

use std::sync::Arc;

use reqwest::Url;
use serde_json::{json, Value};
use thiserror::Error;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Homeserver returned {status}: {errcode} {error}")]
    Remote {
        status: u16,
        errcode: String,
        error: String,
    },

    #[error("Invalid homeserver URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response shape: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    pub fn status_code(&self) -> u16 {
        match self {
            ClientError::Remote { status, .. } => *status,
            ClientError::InvalidUrl(_) => 500,
            ClientError::Http(_) => 502,
            ClientError::InvalidResponse(_) => 502,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ClientError::Remote { .. } => "M_UNKNOWN",
            ClientError::InvalidUrl(_) => "M_UNKNOWN",
            ClientError::Http(_) => "M_UNKNOWN",
            ClientError::InvalidResponse(_) => "M_UNKNOWN",
        }
    }

    /// True when the homeserver reported the localpart as taken, which
    /// `ensureRegistered` treats as success.
    pub fn is_user_in_use(&self) -> bool {
        matches!(self, ClientError::Remote { errcode, .. } if errcode == "M_USER_IN_USE")
    }
}

/// The client-server operations the appservice core consumes.
#[async_trait::async_trait]
pub trait MatrixClient: Send + Sync {
    async fn create_room(&self, options: Value) -> Result<String, ClientError>;
    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, ClientError>;
    async fn leave_room(&self, room_id: &str) -> Result<(), ClientError>;
    async fn invite_user(&self, user_id: &str, room_id: &str) -> Result<(), ClientError>;
    async fn get_joined_rooms(&self) -> Result<Vec<String>, ClientError>;
    async fn resolve_room(&self, room_id_or_alias: &str) -> Result<String, ClientError>;
    async fn get_room_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Value, ClientError>;
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, ClientError>;
    async fn set_display_name(&self, display_name: &str) -> Result<(), ClientError>;
    async fn set_avatar_url(&self, avatar_mxc: &str) -> Result<(), ClientError>;
    async fn register(&self, localpart: &str) -> Result<(), ClientError>;
}

/// Builds a client per virtual user. Intents receive their client from here
/// instead of reaching for any process-wide state.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, user_id: &str) -> Arc<dyn MatrixClient>;
}

/// reqwest-backed client factory sharing one connection pool.
pub struct HttpClientFactory {
    homeserver_url: Url,
    as_token: String,
    http: reqwest::Client,
}

impl HttpClientFactory {
    pub fn new(homeserver_url: &str, as_token: &str) -> Result<Self, ClientError> {
        let homeserver_url = Url::parse(homeserver_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", homeserver_url, e)))?;
        Ok(Self {
            homeserver_url,
            as_token: as_token.to_string(),
            http: reqwest::Client::new(),
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn client_for(&self, user_id: &str) -> Arc<dyn MatrixClient> {
        Arc::new(HttpMatrixClient {
            homeserver_url: self.homeserver_url.clone(),
            as_token: self.as_token.clone(),
            user_id: user_id.to_string(),
            http: self.http.clone(),
        })
    }
}

/// HTTP implementation of the client-server verb set.
pub struct HttpMatrixClient {
    homeserver_url: Url,
    as_token: String,
    user_id: String,
    http: reqwest::Client,
}

impl HttpMatrixClient {
    fn endpoint(&self, segments: &[&str], impersonate: bool) -> Result<Url, ClientError> {
        let mut url = self.homeserver_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ClientError::InvalidUrl(self.homeserver_url.to_string()))?;
            for segment in segments {
                path.push(segment);
            }
        }
        if impersonate {
            url.query_pairs_mut().append_pair("user_id", &self.user_id);
        }
        Ok(url)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Value, ClientError> {
        let response = request.bearer_auth(&self.as_token).send().await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or_else(|_| json!({}));

        if status.is_success() {
            return Ok(body);
        }

        let errcode = body
            .get("errcode")
            .and_then(Value::as_str)
            .unwrap_or("M_UNKNOWN")
            .to_string();
        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();
        Err(ClientError::Remote {
            status: status.as_u16(),
            errcode,
            error,
        })
    }

    fn string_field(body: &Value, field: &str) -> Result<String, ClientError> {
        body.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::InvalidResponse(format!("missing {}", field)))
    }
}

#[async_trait::async_trait]
impl MatrixClient for HttpMatrixClient {
    async fn create_room(&self, options: Value) -> Result<String, ClientError> {
        let url = self.endpoint(&["_matrix", "client", "v3", "createRoom"], true)?;
        let body = self.execute(self.http.post(url).json(&options)).await?;
        Self::string_field(&body, "room_id")
    }

    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, ClientError> {
        let url = self.endpoint(&["_matrix", "client", "v3", "join", room_id_or_alias], true)?;
        let body = self.execute(self.http.post(url).json(&json!({}))).await?;
        Self::string_field(&body, "room_id")
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), ClientError> {
        let url = self.endpoint(
            &["_matrix", "client", "v3", "rooms", room_id, "leave"],
            true,
        )?;
        self.execute(self.http.post(url).json(&json!({}))).await?;
        Ok(())
    }

    async fn invite_user(&self, user_id: &str, room_id: &str) -> Result<(), ClientError> {
        let url = self.endpoint(
            &["_matrix", "client", "v3", "rooms", room_id, "invite"],
            true,
        )?;
        self.execute(self.http.post(url).json(&json!({"user_id": user_id})))
            .await?;
        Ok(())
    }

    async fn get_joined_rooms(&self) -> Result<Vec<String>, ClientError> {
        let url = self.endpoint(&["_matrix", "client", "v3", "joined_rooms"], true)?;
        let body = self.execute(self.http.get(url)).await?;
        let rooms = body
            .get("joined_rooms")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::InvalidResponse("missing joined_rooms".to_string()))?;
        Ok(rooms
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    async fn resolve_room(&self, room_id_or_alias: &str) -> Result<String, ClientError> {
        if room_id_or_alias.starts_with('!') {
            return Ok(room_id_or_alias.to_string());
        }
        let url = self.endpoint(
            &["_matrix", "client", "v3", "directory", "room", room_id_or_alias],
            true,
        )?;
        let body = self.execute(self.http.get(url)).await?;
        Self::string_field(&body, "room_id")
    }

    async fn get_room_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Value, ClientError> {
        let url = self.endpoint(
            &[
                "_matrix", "client", "v3", "rooms", room_id, "state", event_type, state_key,
            ],
            true,
        )?;
        self.execute(self.http.get(url)).await
    }

    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, ClientError> {
        let txn_id = uuid::Uuid::new_v4().to_string();
        let url = self.endpoint(
            &[
                "_matrix", "client", "v3", "rooms", room_id, "send", event_type, &txn_id,
            ],
            true,
        )?;
        let body = self.execute(self.http.put(url).json(&content)).await?;
        Self::string_field(&body, "event_id")
    }

    async fn set_display_name(&self, display_name: &str) -> Result<(), ClientError> {
        let url = self.endpoint(
            &[
                "_matrix",
                "client",
                "v3",
                "profile",
                &self.user_id,
                "displayname",
            ],
            true,
        )?;
        self.execute(self.http.put(url).json(&json!({"displayname": display_name})))
            .await?;
        Ok(())
    }

    async fn set_avatar_url(&self, avatar_mxc: &str) -> Result<(), ClientError> {
        let url = self.endpoint(
            &[
                "_matrix",
                "client",
                "v3",
                "profile",
                &self.user_id,
                "avatar_url",
            ],
            true,
        )?;
        self.execute(self.http.put(url).json(&json!({"avatar_url": avatar_mxc})))
            .await?;
        Ok(())
    }

    async fn register(&self, localpart: &str) -> Result<(), ClientError> {
        // AS registration form; no impersonation parameter on this call.
        let url = self.endpoint(&["_matrix", "client", "v3", "register"], false)?;
        self.execute(self.http.post(url).json(&json!({
            "type": "m.login.application_service",
            "username": localpart,
        })))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::Mutex;

    /// Call-recording client used across the crate's tests. Join attempts
    /// can be scripted; everything else succeeds with canned data.
    pub(crate) struct MockMatrixClient {
        pub calls: Mutex<Vec<String>>,
        pub join_results: Mutex<VecDeque<Result<String, ClientError>>>,
        pub register_failure: Mutex<Option<ClientError>>,
        pub resolve_aliases: Mutex<HashMap<String, String>>,
        pub state_events: Mutex<HashMap<(String, String, String), Value>>,
        pub joined_rooms: Mutex<Vec<String>>,
        pub default_room_id: String,
    }

    impl MockMatrixClient {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                join_results: Mutex::new(VecDeque::new()),
                register_failure: Mutex::new(None),
                resolve_aliases: Mutex::new(HashMap::new()),
                state_events: Mutex::new(HashMap::new()),
                joined_rooms: Mutex::new(Vec::new()),
                default_room_id: "!room:example.org".to_string(),
            }
        }

        pub async fn record(&self, call: String) {
            self.calls.lock().await.push(call);
        }

        pub async fn count_calls(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .await
                .iter()
                .filter(|call| call.starts_with(prefix))
                .count()
        }

        pub async fn script_join_failures(&self, count: usize) {
            let mut results = self.join_results.lock().await;
            for _ in 0..count {
                results.push_back(Err(ClientError::Remote {
                    status: 403,
                    errcode: "M_FORBIDDEN".to_string(),
                    error: "You are not invited to this room".to_string(),
                }));
            }
        }
    }

    pub(crate) fn remote_error(status: u16, errcode: &str) -> ClientError {
        ClientError::Remote {
            status,
            errcode: errcode.to_string(),
            error: errcode.to_string(),
        }
    }

    #[async_trait::async_trait]
    impl MatrixClient for MockMatrixClient {
        async fn create_room(&self, options: Value) -> Result<String, ClientError> {
            self.record(format!("create_room:{}", options)).await;
            Ok("!created:example.org".to_string())
        }

        async fn join_room(&self, room_id_or_alias: &str) -> Result<String, ClientError> {
            self.record(format!("join:{}", room_id_or_alias)).await;
            if let Some(result) = self.join_results.lock().await.pop_front() {
                return result;
            }
            if room_id_or_alias.starts_with('!') {
                Ok(room_id_or_alias.to_string())
            } else {
                Ok(self.default_room_id.clone())
            }
        }

        async fn leave_room(&self, room_id: &str) -> Result<(), ClientError> {
            self.record(format!("leave:{}", room_id)).await;
            Ok(())
        }

        async fn invite_user(&self, user_id: &str, room_id: &str) -> Result<(), ClientError> {
            self.record(format!("invite:{}:{}", user_id, room_id)).await;
            Ok(())
        }

        async fn get_joined_rooms(&self) -> Result<Vec<String>, ClientError> {
            self.record("joined_rooms".to_string()).await;
            Ok(self.joined_rooms.lock().await.clone())
        }

        async fn resolve_room(&self, room_id_or_alias: &str) -> Result<String, ClientError> {
            self.record(format!("resolve:{}", room_id_or_alias)).await;
            if room_id_or_alias.starts_with('!') {
                return Ok(room_id_or_alias.to_string());
            }
            let aliases = self.resolve_aliases.lock().await;
            Ok(aliases
                .get(room_id_or_alias)
                .cloned()
                .unwrap_or_else(|| self.default_room_id.clone()))
        }

        async fn get_room_state_event(
            &self,
            room_id: &str,
            event_type: &str,
            state_key: &str,
        ) -> Result<Value, ClientError> {
            self.record(format!("state:{}:{}", room_id, event_type)).await;
            let events = self.state_events.lock().await;
            events
                .get(&(
                    room_id.to_string(),
                    event_type.to_string(),
                    state_key.to_string(),
                ))
                .cloned()
                .ok_or_else(|| remote_error(404, "M_NOT_FOUND"))
        }

        async fn send_event(
            &self,
            room_id: &str,
            event_type: &str,
            content: Value,
        ) -> Result<String, ClientError> {
            self.record(format!("send:{}:{}:{}", room_id, event_type, content))
                .await;
            Ok("$sent:example.org".to_string())
        }

        async fn set_display_name(&self, display_name: &str) -> Result<(), ClientError> {
            self.record(format!("set_display_name:{}", display_name)).await;
            Ok(())
        }

        async fn set_avatar_url(&self, avatar_mxc: &str) -> Result<(), ClientError> {
            self.record(format!("set_avatar_url:{}", avatar_mxc)).await;
            Ok(())
        }

        async fn register(&self, localpart: &str) -> Result<(), ClientError> {
            // Yield once so concurrent callers genuinely overlap.
            tokio::task::yield_now().await;
            self.record(format!("register:{}", localpart)).await;
            if let Some(error) = self.register_failure.lock().await.take() {
                return Err(error);
            }
            Ok(())
        }
    }

    /// Hands the same mock client to every user so tests can assert on one
    /// aggregated call log.
    pub(crate) struct MockClientFactory {
        pub client: Arc<MockMatrixClient>,
    }

    impl MockClientFactory {
        pub fn new() -> Self {
            Self {
                client: Arc::new(MockMatrixClient::new()),
            }
        }
    }

    impl ClientFactory for MockClientFactory {
        fn client_for(&self, _user_id: &str) -> Arc<dyn MatrixClient> {
            self.client.clone()
        }
    }
}
