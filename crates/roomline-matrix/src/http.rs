//! HTTP endpoint bindings for the client-server API.
//!
//! All authorized calls go through one request path that injects the
//! bearer token and intercepts soft-logout auth failures: the failing
//! request triggers (or awaits) the session's single-flight refresh and
//! is retried once with the rotated token.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use roomline_core::{
    classify_http_status, ClientError, Cursor, ErrorCategory, Event, Filter, PowerLevels,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::command::{CommandTransport, Operation, PendingCommand};
use crate::session::{Credentials, NoopListener, Session, SessionListener, TokenPair};
use crate::sync::SyncTransport;
use crate::wire::{
    ApiErrorBody, JoinResponse, JoinedRoomsResponse, LoginResponse, MembersResponse, MessagesPage,
    RefreshResponse, SendEventResponse, SyncResponse, VersionsResponse, WellKnownClient,
};

const USER_AGENT: &str = "roomline/0.1";
const CLIENT_PREFIX: &str = "/_matrix/client/";
const MEDIA_DOWNLOAD_PREFIX: &str = "/_matrix/media/v3/download/";
const POWER_LEVELS_EVENT_TYPE: &str = "m.room.power_levels";
const SOFT_LOGOUT_ERRCODE: &str = "M_UNKNOWN_TOKEN";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Slack on top of the server-side long-poll wait before the client
/// gives up on a delta fetch.
const LONG_POLL_MARGIN: Duration = Duration::from_secs(10);

/// Authenticated endpoint bindings for one homeserver session.
pub struct HttpApi {
    http: reqwest::Client,
    root: Url,
    base: Url,
    session: Arc<Session>,
}

struct ApiRequest {
    method: Method,
    url: Url,
    query: Vec<(&'static str, String)>,
    body: Option<Value>,
    timeout: Duration,
}

impl ApiRequest {
    fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            query: Vec::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    fn post(url: Url, body: Option<Value>) -> Self {
        Self {
            method: Method::POST,
            url,
            query: Vec::new(),
            body,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    fn put(url: Url, body: Value) -> Self {
        Self {
            method: Method::PUT,
            url,
            query: Vec::new(),
            body: Some(body),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl HttpApi {
    pub fn new(credentials: Credentials) -> Result<Self, ClientError> {
        Self::with_listener(credentials, Box::new(NoopListener))
    }

    /// Build the API surface and register a listener for token
    /// rotations.
    pub fn with_listener(
        credentials: Credentials,
        listener: Box<dyn SessionListener>,
    ) -> Result<Self, ClientError> {
        let root = parse_base_url(&credentials.home_server_url)?;
        let base = root.join(CLIENT_PREFIX).map_err(|err| {
            ClientError::new(
                ErrorCategory::Config,
                "invalid_homeserver_url",
                err.to_string(),
            )
        })?;
        let http = build_http_client()?;

        Ok(Self {
            http,
            root,
            base,
            session: Arc::new(Session::with_listener(credentials, listener)),
        })
    }

    /// Shared session state (token pair and account identity).
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// One delta fetch against `GET /sync`.
    ///
    /// `timeout` is the server-side long-poll wait; the HTTP request
    /// itself is bounded by `timeout` plus a fixed margin.
    pub async fn sync(
        &self,
        since: Option<&Cursor>,
        filter: Option<&Filter>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SyncResponse, ClientError> {
        let mut request = ApiRequest::get(self.endpoint(&["v3", "sync"])?);
        request.query.push(("timeout", timeout.as_millis().to_string()));
        if let Some(since) = since {
            request.query.push(("since", since.to_string()));
        }
        if let Some(filter) = filter {
            request.query.push(("filter", filter.encode()?));
        }
        request.timeout = timeout + LONG_POLL_MARGIN;

        decode_json(self.execute(request, Some(cancel)).await?).await
    }

    /// One pagination call against `GET /rooms/{id}/messages`.
    pub async fn messages(
        &self,
        room_id: &str,
        options: &crate::wire::MessagesOptions,
    ) -> Result<MessagesPage, ClientError> {
        let mut request = ApiRequest::get(self.endpoint(&["v3", "rooms", room_id, "messages"])?);
        request.query.push(("dir", options.dir.as_str().to_owned()));
        if let Some(from) = &options.from {
            request.query.push(("from", from.to_string()));
        }
        if let Some(to) = &options.to {
            request.query.push(("to", to.to_string()));
        }
        if let Some(limit) = options.limit {
            request.query.push(("limit", limit.to_string()));
        }
        if let Some(filter) = &options.filter {
            request.query.push(("filter", filter.encode()?));
        }

        decode_json(self.execute(request, None).await?).await
    }

    /// Send a message event, generating a transaction ID when the caller
    /// does not supply one.
    pub async fn send_message_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
        txn_id: Option<String>,
    ) -> Result<SendEventResponse, ClientError> {
        let txn_id = txn_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let request = ApiRequest::put(
            self.endpoint(&["v3", "rooms", room_id, "send", event_type, &txn_id])?,
            content.clone(),
        );
        decode_json(self.execute(request, None).await?).await
    }

    /// Send a state event, optionally scoped by a state key.
    pub async fn send_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
        state_key: Option<&str>,
    ) -> Result<SendEventResponse, ClientError> {
        let mut segments = vec!["v3", "rooms", room_id, "state", event_type];
        if let Some(state_key) = state_key {
            segments.push(state_key);
        }
        let request = ApiRequest::put(self.endpoint(&segments)?, content.clone());
        decode_json(self.execute(request, None).await?).await
    }

    pub async fn invite(&self, room_id: &str, user_id: &str) -> Result<(), ClientError> {
        let request = ApiRequest::post(
            self.endpoint(&["v3", "rooms", room_id, "invite"])?,
            Some(json!({ "user_id": user_id })),
        );
        expect_success(self.execute(request, None).await?).await
    }

    /// Join a room by ID or alias. Rooms homed on another server need
    /// the `server_name` query parameter even though the endpoint
    /// documentation does not say so.
    pub async fn join(&self, room_id_or_alias: &str) -> Result<JoinResponse, ClientError> {
        let mut request = ApiRequest::post(self.endpoint(&["v3", "join", room_id_or_alias])?, None);
        let home_server = self.session.credentials().home_server;
        if let Some(server_name) = server_name_for_join(room_id_or_alias, &home_server) {
            request.query.push(("server_name", server_name));
        }
        decode_json(self.execute(request, None).await?).await
    }

    pub async fn leave(&self, room_id: &str) -> Result<(), ClientError> {
        let request = ApiRequest::post(self.endpoint(&["v3", "rooms", room_id, "leave"])?, None);
        expect_success(self.execute(request, None).await?).await
    }

    pub async fn forget(&self, room_id: &str) -> Result<(), ClientError> {
        let request = ApiRequest::post(self.endpoint(&["v3", "rooms", room_id, "forget"])?, None);
        expect_success(self.execute(request, None).await?).await
    }

    pub async fn kick(&self, room_id: &str, user_id: &str) -> Result<(), ClientError> {
        let request = ApiRequest::post(
            self.endpoint(&["v3", "rooms", room_id, "kick"])?,
            Some(json!({ "user_id": user_id })),
        );
        expect_success(self.execute(request, None).await?).await
    }

    pub async fn ban(&self, room_id: &str, user_id: &str) -> Result<(), ClientError> {
        let request = ApiRequest::post(
            self.endpoint(&["v3", "rooms", room_id, "ban"])?,
            Some(json!({ "user_id": user_id })),
        );
        expect_success(self.execute(request, None).await?).await
    }

    pub async fn joined_rooms(&self) -> Result<Vec<String>, ClientError> {
        let request = ApiRequest::get(self.endpoint(&["v3", "joined_rooms"])?);
        let response: JoinedRoomsResponse = decode_json(self.execute(request, None).await?).await?;
        Ok(response.joined_rooms)
    }

    pub async fn members(
        &self,
        room_id: &str,
        exclude_membership: Option<&str>,
    ) -> Result<MembersResponse, ClientError> {
        let mut request = ApiRequest::get(self.endpoint(&["v3", "rooms", room_id, "members"])?);
        if let Some(exclude) = exclude_membership {
            request.query.push(("not_membership", exclude.to_owned()));
        }
        decode_json(self.execute(request, None).await?).await
    }

    /// Full current state of a room.
    pub async fn room_state(&self, room_id: &str) -> Result<Vec<Event>, ClientError> {
        let request = ApiRequest::get(self.endpoint(&["v3", "rooms", room_id, "state"])?);
        decode_json(self.execute(request, None).await?).await
    }

    /// The room's power-level document, for feeding the role resolver.
    pub async fn room_power_levels(&self, room_id: &str) -> Result<PowerLevels, ClientError> {
        let state = self.room_state(room_id).await?;
        let event = state
            .into_iter()
            .find(|event| event.event_type == POWER_LEVELS_EVENT_TYPE)
            .ok_or_else(|| {
                ClientError::new(
                    ErrorCategory::Config,
                    "power_levels_missing",
                    format!("room {room_id} has no {POWER_LEVELS_EVENT_TYPE} state"),
                )
            })?;

        serde_json::from_value(event.content).map_err(|err| {
            ClientError::new(
                ErrorCategory::Serialization,
                "power_levels_invalid",
                err.to_string(),
            )
        })
    }

    /// Resolvable download URL for an `mxc://` media reference.
    pub fn media_content_url(&self, mxc_url: &str) -> Result<Url, ClientError> {
        media_download_url(&self.root, mxc_url)
    }

    /// Log in with a password, requesting a refreshable token pair.
    pub async fn login_with_password(
        home_server_url: &str,
        user_id: &str,
        password: &str,
        device_id: Option<&str>,
    ) -> Result<Credentials, ClientError> {
        let root = parse_base_url(home_server_url)?;
        let url = join_url(&root, "_matrix/client/v3/login")?;
        let mut body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": user_id },
            "password": password,
            "refresh_token": true,
        });
        if let Some(device_id) = device_id {
            body["device_id"] = Value::String(device_id.to_owned());
        }

        let http = build_http_client()?;
        let response = http
            .post(url)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let login: LoginResponse = decode_json(response).await?;

        let home_server = login
            .home_server
            .or_else(|| home_server_from_user_id(&login.user_id))
            .unwrap_or_default();

        Ok(Credentials {
            user_id: login.user_id,
            home_server,
            home_server_url: root.as_str().trim_end_matches('/').to_owned(),
            access_token: login.access_token,
            refresh_token: login.refresh_token,
            expires_in_ms: login.expires_in_ms,
        })
    }

    /// `.well-known/matrix/client` discovery document of a server.
    pub async fn well_known_client(home_server_url: &str) -> Result<WellKnownClient, ClientError> {
        let root = parse_base_url(home_server_url)?;
        let url = join_url(&root, ".well-known/matrix/client")?;
        let http = build_http_client()?;
        let response = http
            .get(url)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(map_transport_error)?;
        decode_json(response).await
    }

    /// Protocol versions supported by a server.
    pub async fn versions(home_server_url: &str) -> Result<VersionsResponse, ClientError> {
        let root = parse_base_url(home_server_url)?;
        let url = join_url(&root, "_matrix/client/versions")?;
        let http = build_http_client()?;
        let response = http
            .get(url)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(map_transport_error)?;
        decode_json(response).await
    }

    /// Exchange the refresh token for a new pair (`POST /refresh`).
    ///
    /// Deliberately bypasses the authorized request path: refresh must
    /// not recurse into itself.
    async fn refresh(&self, refresh_token: String) -> Result<TokenPair, ClientError> {
        let url = self.endpoint(&["v3", "refresh"])?;
        let response = self
            .http
            .post(url)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(map_transport_error)?;
        let refreshed: RefreshResponse = decode_json(response).await?;

        debug!("access token refreshed");
        Ok(TokenPair {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token,
            expires_in_ms: refreshed.expires_in_ms,
        })
    }

    /// Authorized request path shared by every endpoint binding.
    async fn execute(
        &self,
        request: ApiRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, ClientError> {
        let access_token = self.session.access_token();
        let response = self
            .dispatch(self.builder_for(&request, &access_token), cancel)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let body = response.json::<ApiErrorBody>().await.unwrap_or_default();
        if body.errcode.as_deref() != Some(SOFT_LOGOUT_ERRCODE) || !body.soft_logout {
            return Err(ClientError::new(
                ErrorCategory::Auth,
                body.errcode.unwrap_or_else(|| "auth_rejected".to_owned()),
                body.error
                    .unwrap_or_else(|| "server rejected the session".to_owned()),
            ));
        }

        let rotated = self
            .session
            .refresh_with(&access_token, |refresh_token| self.refresh(refresh_token))
            .await?;
        self.dispatch(self.builder_for(&request, &rotated), cancel)
            .await
    }

    fn builder_for(&self, request: &ApiRequest, access_token: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .timeout(request.timeout)
            .bearer_auth(access_token);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    async fn dispatch(
        &self,
        builder: RequestBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, ClientError> {
        match cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => Err(ClientError::cancelled("http request")),
                result = builder.send() => result.map_err(map_transport_error),
            },
            None => builder.send().await.map_err(map_transport_error),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                ClientError::new(
                    ErrorCategory::Internal,
                    "invalid_base_url",
                    "homeserver URL cannot carry path segments",
                )
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}

#[async_trait::async_trait]
impl SyncTransport for HttpApi {
    async fn delta_fetch(
        &self,
        since: Option<&Cursor>,
        filter: Option<&Filter>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SyncResponse, ClientError> {
        self.sync(since, filter, timeout, cancel).await
    }

    async fn paginate(
        &self,
        room_id: &str,
        options: crate::wire::MessagesOptions,
    ) -> Result<MessagesPage, ClientError> {
        self.messages(room_id, &options).await
    }
}

#[async_trait::async_trait]
impl CommandTransport for HttpApi {
    async fn invoke(&self, command: &PendingCommand) -> Result<(), ClientError> {
        match command.operation {
            Operation::SendMessageEvent => {
                let room_id = string_arg(command, 0)?;
                let event_type = string_arg(command, 1)?;
                let content = value_arg(command, 2)?;
                self.send_message_event(room_id, event_type, content, None)
                    .await
                    .map(|_| ())
            }
            Operation::SendStateEvent => {
                let room_id = string_arg(command, 0)?;
                let event_type = string_arg(command, 1)?;
                let content = value_arg(command, 2)?;
                let state_key = optional_string_arg(command, 3)?;
                self.send_state_event(room_id, event_type, content, state_key)
                    .await
                    .map(|_| ())
            }
            Operation::Invite => {
                self.invite(string_arg(command, 0)?, string_arg(command, 1)?)
                    .await
            }
            Operation::Join => self.join(string_arg(command, 0)?).await.map(|_| ()),
            Operation::Leave => self.leave(string_arg(command, 0)?).await,
            Operation::Forget => self.forget(string_arg(command, 0)?).await,
            Operation::Kick => {
                self.kick(string_arg(command, 0)?, string_arg(command, 1)?)
                    .await
            }
            Operation::Ban => {
                self.ban(string_arg(command, 0)?, string_arg(command, 1)?)
                    .await
            }
        }
    }
}

fn build_http_client() -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|err| {
            ClientError::new(
                ErrorCategory::Internal,
                "http_client_build_error",
                err.to_string(),
            )
        })
}

fn parse_base_url(home_server_url: &str) -> Result<Url, ClientError> {
    Url::parse(home_server_url).map_err(|err| {
        ClientError::new(
            ErrorCategory::Config,
            "invalid_homeserver_url",
            format!("cannot parse '{home_server_url}': {err}"),
        )
    })
}

fn join_url(root: &Url, path: &str) -> Result<Url, ClientError> {
    root.join(path).map_err(|err| {
        ClientError::new(
            ErrorCategory::Config,
            "invalid_homeserver_url",
            err.to_string(),
        )
    })
}

/// Build the download URL for an `mxc://server/media-id` reference.
pub fn media_download_url(root: &Url, mxc_url: &str) -> Result<Url, ClientError> {
    let stripped = mxc_url.strip_prefix("mxc://").ok_or_else(|| {
        ClientError::new(
            ErrorCategory::Config,
            "invalid_media_url",
            format!("'{mxc_url}' is not an mxc URL"),
        )
    })?;
    join_url(root, &format!("{}{stripped}", MEDIA_DOWNLOAD_PREFIX.trim_start_matches('/')))
}

/// Server name to pass when joining a room homed on another server.
fn server_name_for_join(room_id_or_alias: &str, home_server: &str) -> Option<String> {
    let host = room_id_or_alias.split(':').nth(1)?;
    if host == home_server {
        None
    } else {
        Some(host.to_owned())
    }
}

fn home_server_from_user_id(user_id: &str) -> Option<String> {
    user_id.split(':').nth(1).map(ToOwned::to_owned)
}

fn map_transport_error(err: reqwest::Error) -> ClientError {
    let code = if err.is_timeout() {
        "request_timeout"
    } else if err.is_connect() {
        "connection_failed"
    } else {
        "transport_error"
    };
    ClientError::new(ErrorCategory::Network, code, err.to_string())
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.json::<ApiErrorBody>().await.unwrap_or_default();
        return Err(error_from_parts(status.as_u16(), body));
    }

    response.json::<T>().await.map_err(|err| {
        ClientError::new(
            ErrorCategory::Serialization,
            "invalid_response_body",
            err.to_string(),
        )
    })
}

async fn expect_success(response: Response) -> Result<(), ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.json::<ApiErrorBody>().await.unwrap_or_default();
    Err(error_from_parts(status.as_u16(), body))
}

/// Map a non-success status plus the server error body to a
/// [`ClientError`].
fn error_from_parts(status: u16, body: ApiErrorBody) -> ClientError {
    let category = classify_http_status(status);
    let code = body
        .errcode
        .unwrap_or_else(|| format!("http_status_{status}"));
    let message = body
        .error
        .unwrap_or_else(|| format!("request failed with status {status}"));

    let mut err = ClientError::new(category, code, message);
    if let Some(retry_after_ms) = body.retry_after_ms {
        err = err.with_retry_after(Duration::from_millis(retry_after_ms));
    } else if category == ErrorCategory::RateLimited {
        warn!(status, "rate limited without retry hint");
    }
    err
}

fn string_arg<'a>(command: &'a PendingCommand, index: usize) -> Result<&'a str, ClientError> {
    command
        .args
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_argument(command, index, "string"))
}

fn optional_string_arg<'a>(
    command: &'a PendingCommand,
    index: usize,
) -> Result<Option<&'a str>, ClientError> {
    match command.args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.as_str())),
        Some(_) => Err(invalid_argument(command, index, "string or null")),
    }
}

fn value_arg<'a>(command: &'a PendingCommand, index: usize) -> Result<&'a Value, ClientError> {
    command
        .args
        .get(index)
        .ok_or_else(|| invalid_argument(command, index, "value"))
}

fn invalid_argument(command: &PendingCommand, index: usize, expected: &str) -> ClientError {
    ClientError::new(
        ErrorCategory::Config,
        "invalid_argument",
        format!(
            "operation '{}' expects a {expected} at position {index}",
            command.operation.name()
        ),
    )
}
