//! Per-connection client session state machine.
//!
//! A session translates inbound client requests into engine operations and
//! engine events into outbound envelopes. States: `Connected` (transport
//! open, not authenticated) → `Authenticated` → `Closed`. A connect with
//! expired credentials parks the session on a one-shot hand-off that the
//! coordinator's sweep resolves; until then the connect call simply hangs
//! from the client's point of view.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use vortex_core::message::{epoch_seconds, generate_uid};
use vortex_core::{auth, channel, ClientHandle, ClientInfo, Message};
use vortex_protocol::{
    decode_batch, push, ChannelParams, ClientRequest, ConnectParams, ErrorCode, Method,
    PublishParams, Response,
};

use crate::node::NodeCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    Authenticated,
    Closed,
}

struct SessionInner {
    state: SessionState,
    user: String,
    project: String,
    default_info: Option<Value>,
    /// Per-channel info set by the authorization callback.
    channel_info: HashMap<String, Value>,
    channels: HashSet<String>,
    presence_task: Option<tokio::task::JoinHandle<()>>,
}

/// One client connection's protocol state.
pub struct Session {
    /// Unique connection id.
    pub id: String,
    coordinator: Arc<NodeCoordinator>,
    sender: mpsc::UnboundedSender<String>,
    /// Last liveness check, epoch seconds. Read by the sweep without
    /// taking the session lock.
    examined_at: AtomicU64,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// Create a session for a freshly opened transport.
    #[must_use]
    pub fn new(coordinator: Arc<NodeCoordinator>, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: generate_uid(),
            coordinator,
            sender,
            examined_at: AtomicU64::new(epoch_seconds()),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connected,
                user: String::new(),
                project: String::new(),
                default_info: None,
                channel_info: HashMap::new(),
                channels: HashSet::new(),
                presence_task: None,
            }),
        }
    }

    /// Last liveness check, epoch seconds.
    #[must_use]
    pub fn examined_at(&self) -> u64 {
        self.examined_at.load(Ordering::Relaxed)
    }

    /// Record a passed liveness check.
    pub fn refresh_examined(&self, now: u64) {
        self.examined_at.store(now, Ordering::Relaxed);
    }

    /// Queue a best-effort disconnect notice for the client.
    pub fn send_disconnect(&self, reason: &str) {
        let notice = push("disconnect", json!({ "reason": reason })).to_string();
        if self.sender.send(notice).is_err() {
            debug!(connection = %self.id, "Disconnect notice undeliverable");
        }
    }

    /// Handle one request. Returns the response and whether the transport
    /// must close afterwards. Only protocol violations (unknown method,
    /// schema failure) close; business-logic errors are ordinary
    /// responses.
    pub async fn handle(self: &Arc<Self>, request: ClientRequest) -> (Response, bool) {
        let uid = request.uid.clone();
        let name = request.method.clone();

        let Some(method) = request.method() else {
            return (
                Response::err(uid, name, ErrorCode::MethodNotFound.as_str(), Value::Null),
                true,
            );
        };

        match method {
            Method::Connect => match request.parse_params::<ConnectParams>() {
                Ok(params) => self.handle_connect(uid, params).await,
                Err(e) => (Response::err(uid, name, e.to_string(), Value::Null), true),
            },
            Method::Ping => (
                Response::ok(uid, name, json!({ "data": "pong" })),
                false,
            ),
            Method::Subscribe => match request.parse_params::<ChannelParams>() {
                Ok(params) => self.handle_subscribe(uid, params).await,
                Err(e) => (Response::err(uid, name, e.to_string(), Value::Null), true),
            },
            Method::Unsubscribe => match request.parse_params::<ChannelParams>() {
                Ok(params) => self.handle_unsubscribe(uid, params).await,
                Err(e) => (Response::err(uid, name, e.to_string(), Value::Null), true),
            },
            Method::Publish => match request.parse_params::<PublishParams>() {
                Ok(params) => self.handle_publish(uid, params).await,
                Err(e) => (Response::err(uid, name, e.to_string(), Value::Null), true),
            },
            Method::Presence => match request.parse_params::<ChannelParams>() {
                Ok(params) => self.handle_presence(uid, params).await,
                Err(e) => (Response::err(uid, name, e.to_string(), Value::Null), true),
            },
            Method::History => match request.parse_params::<ChannelParams>() {
                Ok(params) => self.handle_history(uid, params).await,
                Err(e) => (Response::err(uid, name, e.to_string(), Value::Null), true),
            },
        }
    }

    async fn handle_connect(
        self: &Arc<Self>,
        uid: Option<String>,
        params: ConnectParams,
    ) -> (Response, bool) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Closed => {
                return (
                    Response::err(uid, "connect", ErrorCode::Unauthorized.as_str(), Value::Null),
                    true,
                )
            }
            // Repeated connect on an authenticated session is idempotent.
            SessionState::Authenticated => {
                return (
                    Response::ok(uid, "connect", json!({ "client": self.id })),
                    false,
                )
            }
            SessionState::Connected => {}
        }

        let project = match self.coordinator.structure().get_project_by_id(&params.project) {
            Ok(Some(project)) => project,
            Ok(None) => {
                return (
                    Response::err(uid, "connect", ErrorCode::NotFound.as_str(), Value::Null),
                    false,
                )
            }
            Err(e) => {
                warn!(error = %e, "Structure lookup failed");
                return (
                    Response::err(
                        uid,
                        "connect",
                        ErrorCode::InternalServerError.as_str(),
                        Value::Null,
                    ),
                    false,
                );
            }
        };

        if !auth::check_client_token(
            &project.secret,
            &params.project,
            &params.user,
            &params.timestamp,
            params.info.as_deref(),
            &params.token,
        ) {
            return (
                Response::err(uid, "connect", ErrorCode::InvalidToken.as_str(), Value::Null),
                false,
            );
        }

        if project.connection_lifetime > 0 {
            let issued: u64 = params.timestamp.parse().unwrap_or(0);
            if issued + project.connection_lifetime < epoch_seconds() {
                // Credentials expired: park until the sweep's liveness
                // verdict. This request, and with it the whole
                // connection's read loop, hangs until then.
                debug!(connection = %self.id, user = %params.user, "Connect parked");
                let verdict = self.coordinator.park_reconnect(&params.project, &params.user);
                match verdict.await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        return (
                            Response::err(
                                uid,
                                "connect",
                                ErrorCode::Unauthorized.as_str(),
                                Value::Null,
                            ),
                            true,
                        )
                    }
                }
            }
        }

        inner.state = SessionState::Authenticated;
        inner.user = params.user.clone();
        inner.project = params.project.clone();
        inner.default_info = params.info.as_deref().map(|raw| {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        });
        self.refresh_examined(epoch_seconds());

        self.coordinator
            .add_connection(&params.project, &params.user, Arc::clone(self));

        // Presence-refresh timer, keeps every subscribed channel's entry
        // alive for the life of the session.
        let session = Arc::clone(self);
        let interval = self.coordinator.settings().presence_ping_interval;
        inner.presence_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                session.refresh_presence().await;
            }
        }));

        debug!(connection = %self.id, user = %params.user, project = %params.project, "Authenticated");
        (
            Response::ok(uid, "connect", json!({ "client": self.id })),
            false,
        )
    }

    async fn handle_subscribe(
        self: &Arc<Self>,
        uid: Option<String>,
        params: ChannelParams,
    ) -> (Response, bool) {
        let channel_name = params.channel;
        let body = json!({ "channel": channel_name });

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Authenticated {
            return (
                Response::err(uid, "subscribe", ErrorCode::Unauthorized.as_str(), body),
                false,
            );
        }

        if channel_name.len() > self.coordinator.settings().max_channel_length {
            return (
                Response::err(uid, "subscribe", ErrorCode::LimitExceeded.as_str(), body),
                false,
            );
        }
        if let Err(reason) = channel::validate_channel_name(
            &channel_name,
            self.coordinator.settings().max_channel_length,
        ) {
            debug!(channel = %channel_name, reason, "Rejected channel name");
            return (
                Response::err(uid, "subscribe", ErrorCode::PermissionDenied.as_str(), body),
                false,
            );
        }

        // User-restricted channel: the authenticated user must be listed.
        if let Some(allowed) = channel::allowed_users(&channel_name) {
            if !allowed.contains(&inner.user.as_str()) {
                return (
                    Response::err(uid, "subscribe", ErrorCode::PermissionDenied.as_str(), body),
                    false,
                );
            }
        }

        let project = inner.project.clone();
        let options = match self.coordinator.structure().channel_options(&project, &channel_name) {
            Ok(Some(options)) => options,
            Ok(None) => {
                return (
                    Response::err(uid, "subscribe", ErrorCode::NotFound.as_str(), body),
                    false,
                )
            }
            Err(e) => {
                warn!(error = %e, "Structure lookup failed");
                return (
                    Response::err(
                        uid,
                        "subscribe",
                        ErrorCode::InternalServerError.as_str(),
                        body,
                    ),
                    false,
                );
            }
        };

        if !options.anonymous && inner.user.is_empty() {
            return (
                Response::err(uid, "subscribe", ErrorCode::PermissionDenied.as_str(), body),
                false,
            );
        }

        if options.is_private {
            match self
                .coordinator
                .authorizer()
                .authorize_channel(&project, &inner.user, &channel_name)
                .await
            {
                Some(info) => {
                    inner.channel_info.insert(channel_name.clone(), info);
                }
                None => {
                    return (
                        Response::err(
                            uid,
                            "subscribe",
                            ErrorCode::PermissionDenied.as_str(),
                            body,
                        ),
                        false,
                    )
                }
            }
        }

        // Registry first, then the session's own set.
        let handle = ClientHandle::new(&self.id, self.sender.clone());
        if let Err(e) = self
            .coordinator
            .engine()
            .add_subscription(&project, &channel_name, handle)
            .await
        {
            warn!(channel = %channel_name, error = %e, "Subscribe failed");
            inner.channel_info.remove(&channel_name);
            return (
                Response::err(
                    uid,
                    "subscribe",
                    ErrorCode::InternalServerError.as_str(),
                    body,
                ),
                false,
            );
        }
        inner.channels.insert(channel_name.clone());

        let info = client_info(&inner, &self.id, &channel_name);
        let info_value = serde_json::to_value(&info).unwrap_or(Value::Null);
        if let Err(e) = self
            .coordinator
            .engine()
            .add_presence(
                &project,
                &channel_name,
                &self.id,
                info_value.clone(),
                self.coordinator.settings().presence_expire,
            )
            .await
        {
            warn!(channel = %channel_name, error = %e, "Presence add failed");
        }

        if options.join_leave {
            let join = json!({ "channel": channel_name, "data": info_value });
            if let Err(e) = self
                .coordinator
                .engine()
                .publish_message(&project, &channel_name, "join", join)
                .await
            {
                warn!(channel = %channel_name, error = %e, "Join broadcast failed");
            }
        }

        crate::metrics::record_subscription();
        (Response::ok(uid, "subscribe", body), false)
    }

    async fn handle_unsubscribe(
        &self,
        uid: Option<String>,
        params: ChannelParams,
    ) -> (Response, bool) {
        let body = json!({ "channel": params.channel });

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Authenticated {
            return (
                Response::err(uid, "unsubscribe", ErrorCode::Unauthorized.as_str(), body),
                false,
            );
        }

        // Idempotent: succeeds whether or not currently subscribed.
        self.drop_channel(&mut inner, &params.channel).await;
        (Response::ok(uid, "unsubscribe", body), false)
    }

    async fn handle_publish(
        &self,
        uid: Option<String>,
        params: PublishParams,
    ) -> (Response, bool) {
        let body = json!({ "channel": params.channel });

        let inner = self.inner.lock().await;
        if inner.state != SessionState::Authenticated {
            return (
                Response::err(uid, "publish", ErrorCode::Unauthorized.as_str(), body),
                false,
            );
        }
        // Publishing requires a prior subscription, checked against the
        // session's own set.
        if !inner.channels.contains(&params.channel) {
            return (
                Response::err(uid, "publish", ErrorCode::PermissionDenied.as_str(), body),
                false,
            );
        }

        let project = inner.project.clone();
        let options = match self
            .coordinator
            .structure()
            .channel_options(&project, &params.channel)
        {
            Ok(Some(options)) => options,
            Ok(None) => {
                return (
                    Response::err(uid, "publish", ErrorCode::NotFound.as_str(), body),
                    false,
                )
            }
            Err(e) => {
                warn!(error = %e, "Structure lookup failed");
                return (
                    Response::err(uid, "publish", ErrorCode::InternalServerError.as_str(), body),
                    false,
                );
            }
        };
        if !options.publish {
            return (
                Response::err(uid, "publish", ErrorCode::PermissionDenied.as_str(), body),
                false,
            );
        }

        let info = client_info(&inner, &self.id, &params.channel);
        match self
            .coordinator
            .process_publish(&project, &params.channel, &options, params.data, Some(info))
            .await
        {
            Ok(()) => (Response::ok(uid, "publish", body), false),
            Err(e) => {
                warn!(channel = %params.channel, error = %e, "Publish failed");
                (
                    Response::err(uid, "publish", ErrorCode::InternalServerError.as_str(), body),
                    false,
                )
            }
        }
    }

    async fn handle_presence(
        &self,
        uid: Option<String>,
        params: ChannelParams,
    ) -> (Response, bool) {
        let body = json!({ "channel": params.channel });

        let inner = self.inner.lock().await;
        if inner.state != SessionState::Authenticated {
            return (
                Response::err(uid, "presence", ErrorCode::Unauthorized.as_str(), body),
                false,
            );
        }
        if !inner.channels.contains(&params.channel) {
            return (
                Response::err(uid, "presence", ErrorCode::PermissionDenied.as_str(), body),
                false,
            );
        }

        let project = inner.project.clone();
        let options = match self
            .coordinator
            .structure()
            .channel_options(&project, &params.channel)
        {
            Ok(Some(options)) => options,
            Ok(None) => {
                return (
                    Response::err(uid, "presence", ErrorCode::NotFound.as_str(), body),
                    false,
                )
            }
            Err(e) => {
                warn!(error = %e, "Structure lookup failed");
                return (
                    Response::err(
                        uid,
                        "presence",
                        ErrorCode::InternalServerError.as_str(),
                        body,
                    ),
                    false,
                );
            }
        };
        // Operator choice, not a per-user grant: distinct error code.
        if !options.presence {
            return (
                Response::err(uid, "presence", ErrorCode::NotAvailable.as_str(), body),
                false,
            );
        }

        match self.coordinator.engine().presence(&project, &params.channel).await {
            Ok(data) => (
                Response::ok(
                    uid,
                    "presence",
                    json!({ "channel": params.channel, "data": data }),
                ),
                false,
            ),
            Err(e) => {
                warn!(channel = %params.channel, error = %e, "Presence read failed");
                (
                    Response::err(
                        uid,
                        "presence",
                        ErrorCode::InternalServerError.as_str(),
                        body,
                    ),
                    false,
                )
            }
        }
    }

    async fn handle_history(
        &self,
        uid: Option<String>,
        params: ChannelParams,
    ) -> (Response, bool) {
        let body = json!({ "channel": params.channel });

        let inner = self.inner.lock().await;
        if inner.state != SessionState::Authenticated {
            return (
                Response::err(uid, "history", ErrorCode::Unauthorized.as_str(), body),
                false,
            );
        }
        if !inner.channels.contains(&params.channel) {
            return (
                Response::err(uid, "history", ErrorCode::PermissionDenied.as_str(), body),
                false,
            );
        }

        let project = inner.project.clone();
        let options = match self
            .coordinator
            .structure()
            .channel_options(&project, &params.channel)
        {
            Ok(Some(options)) => options,
            Ok(None) => {
                return (
                    Response::err(uid, "history", ErrorCode::NotFound.as_str(), body),
                    false,
                )
            }
            Err(e) => {
                warn!(error = %e, "Structure lookup failed");
                return (
                    Response::err(
                        uid,
                        "history",
                        ErrorCode::InternalServerError.as_str(),
                        body,
                    ),
                    false,
                );
            }
        };
        if options.history_size == 0 {
            return (
                Response::err(uid, "history", ErrorCode::NotAvailable.as_str(), body),
                false,
            );
        }

        match self.coordinator.engine().history(&project, &params.channel).await {
            Ok(messages) => {
                let data: Vec<Value> = messages.iter().map(Message::client_body).collect();
                (
                    Response::ok(
                        uid,
                        "history",
                        json!({ "channel": params.channel, "data": data }),
                    ),
                    false,
                )
            }
            Err(e) => {
                warn!(channel = %params.channel, error = %e, "History read failed");
                (
                    Response::err(
                        uid,
                        "history",
                        ErrorCode::InternalServerError.as_str(),
                        body,
                    ),
                    false,
                )
            }
        }
    }

    /// Force-unsubscribe from one channel, or all when `channel` is
    /// `None`. Used by control-message dispatch.
    pub async fn force_unsubscribe(&self, channel: Option<&str>) {
        let mut inner = self.inner.lock().await;
        let targets: Vec<String> = match channel {
            Some(name) => inner.channels.get(name).cloned().into_iter().collect(),
            None => inner.channels.iter().cloned().collect(),
        };
        for name in targets {
            self.drop_channel(&mut inner, &name).await;
        }
    }

    /// Refresh presence for every subscribed channel. Runs on the
    /// presence-refresh timer.
    async fn refresh_presence(&self) {
        let inner = self.inner.lock().await;
        if inner.state != SessionState::Authenticated {
            return;
        }
        let project = inner.project.clone();
        let ttl = self.coordinator.settings().presence_expire;

        for channel_name in inner.channels.clone() {
            let info = client_info(&inner, &self.id, &channel_name);
            let info_value = serde_json::to_value(&info).unwrap_or(Value::Null);
            if let Err(e) = self
                .coordinator
                .engine()
                .add_presence(&project, &channel_name, &self.id, info_value, ttl)
                .await
            {
                warn!(channel = %channel_name, error = %e, "Presence refresh failed");
            }
        }
    }

    /// Remove one channel: presence, registry membership, the session's
    /// own bookkeeping, and the leave notice where the namespace asks for
    /// one. No-op if not subscribed.
    async fn drop_channel(&self, inner: &mut SessionInner, channel_name: &str) {
        if !inner.channels.contains(channel_name) {
            return;
        }
        let project = inner.project.clone();
        let info = client_info(inner, &self.id, channel_name);

        if let Err(e) = self
            .coordinator
            .engine()
            .remove_presence(&project, channel_name, &self.id)
            .await
        {
            warn!(channel = %channel_name, error = %e, "Presence remove failed");
        }
        if let Err(e) = self
            .coordinator
            .engine()
            .remove_subscription(&project, channel_name, &self.id)
            .await
        {
            warn!(channel = %channel_name, error = %e, "Subscription remove failed");
        }
        inner.channels.remove(channel_name);
        inner.channel_info.remove(channel_name);

        let join_leave = self
            .coordinator
            .structure()
            .channel_options(&project, channel_name)
            .ok()
            .flatten()
            .is_some_and(|options| options.join_leave);
        if join_leave {
            let info_value = serde_json::to_value(&info).unwrap_or(Value::Null);
            let leave = json!({ "channel": channel_name, "data": info_value });
            if let Err(e) = self
                .coordinator
                .engine()
                .publish_message(&project, channel_name, "leave", leave)
                .await
            {
                warn!(channel = %channel_name, error = %e, "Leave broadcast failed");
            }
        }
    }

    /// Tear the session down: stop the presence timer, leave every
    /// channel, deregister from the coordinator. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        if let Some(task) = inner.presence_task.take() {
            task.abort();
        }

        let channels: Vec<String> = inner.channels.iter().cloned().collect();
        for name in channels {
            self.drop_channel(&mut inner, &name).await;
        }

        let project = std::mem::take(&mut inner.project);
        let user = std::mem::take(&mut inner.user);
        inner.default_info = None;
        inner.channel_info.clear();
        inner.state = SessionState::Closed;
        drop(inner);

        if !project.is_empty() || !user.is_empty() {
            self.coordinator.remove_connection(&project, &user, &self.id);
        }
        debug!(connection = %self.id, "Session closed");
    }
}

fn client_info(inner: &SessionInner, connection_id: &str, channel_name: &str) -> ClientInfo {
    ClientInfo {
        user: inner.user.clone(),
        client: connection_id.to_string(),
        default_info: inner.default_info.clone(),
        channel_info: inner.channel_info.get(channel_name).cloned(),
    }
}

/// Process one transport frame: decode the batch and run each request in
/// order. The first protocol violation abandons the rest of the batch and
/// asks the transport to close after flushing the partial response.
pub async fn process_frame(
    session: &Arc<Session>,
    frame: &str,
    max_batch: usize,
) -> (Vec<Response>, bool) {
    let requests = match decode_batch(frame, max_batch) {
        Ok(requests) => requests,
        Err(e) => {
            let code = match e {
                vortex_protocol::ProtocolError::BatchTooLarge(..) => {
                    ErrorCode::LimitExceeded.as_str().to_string()
                }
                _ => e.to_string(),
            };
            return (
                vec![Response::err(None, String::new(), code, Value::Null)],
                true,
            );
        }
    };

    let mut responses = Vec::with_capacity(requests.len());
    for request in requests {
        let (response, close) = session.handle(request).await;
        responses.push(response);
        if close {
            return (responses, true);
        }
    }
    (responses, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorize::{AuthError, Authorizer};
    use crate::config::{Config, NamespaceConfig, ProjectConfig};
    use crate::node::NodeSettings;
    use crate::structure::{ChannelOptions, ConfigStructure};
    use async_trait::async_trait;
    use std::time::Duration;
    use vortex_core::{AdminHub, ControlMessage, MemoryEngine, SubscriptionRegistry};

    struct StaticAuthorizer {
        allow: bool,
    }

    #[async_trait]
    impl Authorizer for StaticAuthorizer {
        async fn authorize_channel(&self, _: &str, _: &str, _: &str) -> Option<Value> {
            self.allow.then(|| json!({ "role": "member" }))
        }

        async fn check_users(&self, _: &str, _: &[String]) -> Result<Vec<String>, AuthError> {
            Ok(Vec::new())
        }
    }

    fn settings() -> NodeSettings {
        NodeSettings {
            name: "test".into(),
            ping_interval: Duration::from_secs(25),
            info_max_delay: Duration::from_secs(60),
            presence_ping_interval: Duration::from_secs(25),
            presence_expire: 60,
            max_channel_length: 64,
            max_batch: 10,
            collect_interval: Duration::from_secs(3),
            verify_interval: Duration::from_secs(10),
            min_verify_interval: Duration::ZERO,
        }
    }

    fn structure() -> Arc<ConfigStructure> {
        let config = Config {
            projects: vec![ProjectConfig {
                id: "p1".into(),
                secret: "secret".into(),
                connection_lifetime: 0,
                options: ChannelOptions {
                    publish: true,
                    ..ChannelOptions::default()
                },
                namespaces: vec![
                    NamespaceConfig {
                        name: "news".into(),
                        options: ChannelOptions {
                            publish: true,
                            history_size: 2,
                            ..ChannelOptions::default()
                        },
                    },
                    NamespaceConfig {
                        name: "chat".into(),
                        options: ChannelOptions {
                            publish: true,
                            presence: true,
                            join_leave: true,
                            ..ChannelOptions::default()
                        },
                    },
                    NamespaceConfig {
                        name: "secure".into(),
                        options: ChannelOptions {
                            publish: true,
                            is_private: true,
                            ..ChannelOptions::default()
                        },
                    },
                ],
            }],
            ..Config::default()
        };
        Arc::new(ConfigStructure::new(&config))
    }

    struct World {
        coordinator: Arc<NodeCoordinator>,
        registry: Arc<SubscriptionRegistry>,
        _control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    }

    fn world(allow_private: bool) -> World {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MemoryEngine::new(
            Arc::clone(&registry),
            Arc::new(AdminHub::new()),
            control_tx,
        ));
        let coordinator = Arc::new(NodeCoordinator::new(
            settings(),
            engine,
            structure(),
            Arc::new(StaticAuthorizer {
                allow: allow_private,
            }),
        ));
        World {
            coordinator,
            registry,
            _control_rx: control_rx,
        }
    }

    fn new_session(world: &World) -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Session::new(Arc::clone(&world.coordinator), tx)),
            rx,
        )
    }

    fn request(method: &str, params: Value) -> ClientRequest {
        serde_json::from_value(json!({ "method": method, "params": params })).unwrap()
    }

    async fn connect(session: &Arc<Session>, user: &str) {
        let timestamp = epoch_seconds().to_string();
        let token = auth::generate_client_token("secret", "p1", user, &timestamp, None);
        let (response, close) = session
            .handle(request(
                "connect",
                json!({
                    "token": token,
                    "user": user,
                    "project": "p1",
                    "timestamp": timestamp,
                }),
            ))
            .await;
        assert!(response.error.is_none(), "connect failed: {:?}", response.error);
        assert!(!close);
    }

    async fn subscribe(session: &Arc<Session>, channel: &str) -> Response {
        session
            .handle(request("subscribe", json!({ "channel": channel })))
            .await
            .0
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_token() {
        let w = world(true);
        let (session, _rx) = new_session(&w);

        let (response, close) = session
            .handle(request(
                "connect",
                json!({
                    "token": "forged",
                    "user": "alice",
                    "project": "p1",
                    "timestamp": "1700000000",
                }),
            ))
            .await;
        assert_eq!(response.error.as_deref(), Some("invalid token"));
        assert!(!close);
        assert_eq!(w.coordinator.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_connect_unknown_project() {
        let w = world(true);
        let (session, _rx) = new_session(&w);

        let (response, _) = session
            .handle(request(
                "connect",
                json!({
                    "token": "x",
                    "user": "alice",
                    "project": "missing",
                    "timestamp": "1700000000",
                }),
            ))
            .await;
        assert_eq!(response.error.as_deref(), Some("not_found"));
    }

    #[tokio::test]
    async fn test_requires_authentication() {
        let w = world(true);
        let (session, _rx) = new_session(&w);

        let response = subscribe(&session, "news:sports").await;
        assert_eq!(response.error.as_deref(), Some("unauthorized"));
        // Denied subscribe still echoes the channel.
        assert_eq!(response.body["channel"], "news:sports");
    }

    #[tokio::test]
    async fn test_channel_length_cap() {
        let w = world(true);
        let (session, _rx) = new_session(&w);
        connect(&session, "alice").await;

        let long = format!("news:{}", "x".repeat(100));
        let response = subscribe(&session, &long).await;
        assert_eq!(response.error.as_deref(), Some("limit_exceeded"));
    }

    #[tokio::test]
    async fn test_user_restricted_channel() {
        let w = world(true);
        let (session, _rx) = new_session(&w);
        connect(&session, "alice").await;

        let denied = subscribe(&session, "chat:room#bob").await;
        assert_eq!(denied.error.as_deref(), Some("permission_denied"));
        assert_eq!(denied.body["channel"], "chat:room#bob");

        let allowed = subscribe(&session, "chat:room#alice,bob").await;
        assert!(allowed.error.is_none());
    }

    #[tokio::test]
    async fn test_anonymous_gating() {
        let w = world(true);
        let (session, _rx) = new_session(&w);
        connect(&session, "").await;

        // news disallows anonymous subscribers.
        let response = subscribe(&session, "news:sports").await;
        assert_eq!(response.error.as_deref(), Some("permission_denied"));
    }

    #[tokio::test]
    async fn test_scenario_connect_publish_history() {
        let w = world(true);
        let (session, _rx) = new_session(&w);
        connect(&session, "alice").await;

        assert!(subscribe(&session, "news:sports").await.error.is_none());

        for n in 1..=3 {
            let (response, close) = session
                .handle(request(
                    "publish",
                    json!({ "channel": "news:sports", "data": { "n": n } }),
                ))
                .await;
            assert!(response.error.is_none());
            assert!(!close);
        }

        let (response, _) = session
            .handle(request("history", json!({ "channel": "news:sports" })))
            .await;
        assert!(response.error.is_none());
        let data = response.body["data"].as_array().unwrap();
        // Size cap 2, most-recent-first.
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["data"]["n"], 3);
        assert_eq!(data[1]["data"]["n"], 2);
    }

    #[tokio::test]
    async fn test_scenario_private_channel_denied() {
        let w = world(false);
        let (session, _rx) = new_session(&w);
        connect(&session, "alice").await;

        let response = subscribe(&session, "secure:vault").await;
        assert_eq!(response.error.as_deref(), Some("permission_denied"));
        assert_eq!(response.body["channel"], "secure:vault");

        // Not in the registry, not in presence.
        assert!(!w.registry.has_channel("p1", "secure:vault"));
        let presence = w
            .coordinator
            .engine()
            .presence("p1", "secure:vault")
            .await
            .unwrap();
        assert!(presence.is_empty());
    }

    #[tokio::test]
    async fn test_scenario_private_channel_allowed_merges_info() {
        let w = world(true);
        let (session, _rx) = new_session(&w);
        connect(&session, "alice").await;

        assert!(subscribe(&session, "secure:vault").await.error.is_none());

        // Authorization response body lands in the presence entry's
        // channel info.
        let presence = w
            .coordinator
            .engine()
            .presence("p1", "secure:vault")
            .await
            .unwrap();
        let entry = presence.get(&session.id).unwrap();
        assert_eq!(entry["channel_info"]["role"], "member");
    }

    #[tokio::test]
    async fn test_scenario_leave_notice() {
        let w = world(true);
        let (s1, _rx1) = new_session(&w);
        let (s2, mut rx2) = new_session(&w);
        connect(&s1, "alice").await;
        connect(&s2, "bob").await;

        assert!(subscribe(&s2, "chat:room1").await.error.is_none());
        assert!(subscribe(&s1, "chat:room1").await.error.is_none());

        // Drain the join notices (S2's own and S1's) from S2's queue.
        let mut joins = 0;
        while let Ok(payload) = rx2.try_recv() {
            let envelope: Value = serde_json::from_str(&payload).unwrap();
            assert_eq!(envelope["method"], "join");
            joins += 1;
        }
        assert_eq!(joins, 2);

        let (response, _) = s1
            .handle(request("unsubscribe", json!({ "channel": "chat:room1" })))
            .await;
        assert!(response.error.is_none());

        let leave: Value = serde_json::from_str(&rx2.try_recv().unwrap()).unwrap();
        assert_eq!(leave["method"], "leave");
        assert_eq!(leave["body"]["channel"], "chat:room1");
        assert_eq!(leave["body"]["data"]["user"], "alice");
        // Exactly one leave notice.
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let w = world(true);
        let (session, _rx) = new_session(&w);
        connect(&session, "alice").await;

        let (response, close) = session
            .handle(request("unsubscribe", json!({ "channel": "never:subscribed" })))
            .await;
        assert!(response.error.is_none());
        assert!(!close);
    }

    #[tokio::test]
    async fn test_publish_requires_subscription() {
        let w = world(true);
        let (session, _rx) = new_session(&w);
        connect(&session, "alice").await;

        let (response, _) = session
            .handle(request(
                "publish",
                json!({ "channel": "news:sports", "data": 1 }),
            ))
            .await;
        assert_eq!(response.error.as_deref(), Some("permission_denied"));
    }

    #[tokio::test]
    async fn test_presence_flag_off_is_not_available() {
        let w = world(true);
        let (session, _rx) = new_session(&w);
        connect(&session, "alice").await;
        assert!(subscribe(&session, "news:sports").await.error.is_none());

        let (response, _) = session
            .handle(request("presence", json!({ "channel": "news:sports" })))
            .await;
        assert_eq!(response.error.as_deref(), Some("not_available"));
    }

    #[tokio::test]
    async fn test_scenario_batch_fail_fast() {
        let w = world(true);
        let (session, _rx) = new_session(&w);
        connect(&session, "alice").await;

        let frame = json!([
            { "method": "subscribe", "params": { "channel": "x" } },
            { "method": "bogus" },
            { "method": "ping" },
        ])
        .to_string();

        let (responses, close) = process_frame(&session, &frame, 10).await;
        // Third request abandoned, transport closes.
        assert_eq!(responses.len(), 2);
        assert!(responses[0].error.is_none());
        assert_eq!(responses[1].error.as_deref(), Some("method_not_found"));
        assert!(close);
    }

    #[tokio::test]
    async fn test_business_error_does_not_close() {
        let w = world(true);
        let (session, _rx) = new_session(&w);
        connect(&session, "alice").await;

        let frame = json!([
            { "method": "publish", "params": { "channel": "not:subscribed", "data": 1 } },
            { "method": "ping" },
        ])
        .to_string();

        let (responses, close) = process_frame(&session, &frame, 10).await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].error.as_deref(), Some("permission_denied"));
        assert!(responses[1].error.is_none());
        assert!(!close);
    }

    #[tokio::test]
    async fn test_batch_cap_closes() {
        let w = world(true);
        let (session, _rx) = new_session(&w);

        let frame = json!([
            { "method": "ping" },
            { "method": "ping" },
            { "method": "ping" },
        ])
        .to_string();
        let (responses, close) = process_frame(&session, &frame, 2).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].error.as_deref(), Some("limit_exceeded"));
        assert!(close);
    }

    #[tokio::test]
    async fn test_close_cleans_up_everything() {
        let w = world(true);
        let (session, _rx1) = new_session(&w);
        let (other, mut rx2) = new_session(&w);
        connect(&session, "alice").await;
        connect(&other, "bob").await;
        assert!(subscribe(&session, "chat:room1").await.error.is_none());
        assert!(subscribe(&other, "chat:room1").await.error.is_none());
        while rx2.try_recv().is_ok() {}

        session.close().await;

        // Registry membership, presence, and coordinator registration all
        // cleared; remaining subscriber saw the leave notice.
        assert_eq!(w.registry.subscriber_count("p1", "chat:room1"), 1);
        let presence = w
            .coordinator
            .engine()
            .presence("p1", "chat:room1")
            .await
            .unwrap();
        assert!(!presence.contains_key(&session.id));
        assert_eq!(w.coordinator.stats(), (1, 1));

        let leave: Value = serde_json::from_str(&rx2.try_recv().unwrap()).unwrap();
        assert_eq!(leave["method"], "leave");

        // Second close is a no-op.
        session.close().await;
        assert_eq!(w.coordinator.stats(), (1, 1));
    }

    /// Authorizer whose liveness check reports every user inactive.
    struct AllInactive;

    #[async_trait]
    impl Authorizer for AllInactive {
        async fn authorize_channel(&self, _: &str, _: &str, _: &str) -> Option<Value> {
            None
        }

        async fn check_users(
            &self,
            _: &str,
            users: &[String],
        ) -> Result<Vec<String>, AuthError> {
            Ok(users.to_vec())
        }
    }

    fn expiring_world(
        authorizer: Arc<dyn Authorizer>,
    ) -> (Arc<NodeCoordinator>, mpsc::UnboundedReceiver<ControlMessage>) {
        let config = Config {
            projects: vec![ProjectConfig {
                id: "p1".into(),
                secret: "secret".into(),
                connection_lifetime: 60,
                options: ChannelOptions::default(),
                namespaces: Vec::new(),
            }],
            ..Config::default()
        };
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MemoryEngine::new(
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(AdminHub::new()),
            control_tx,
        ));
        let coordinator = Arc::new(NodeCoordinator::new(
            settings(),
            engine,
            Arc::new(ConfigStructure::new(&config)),
            authorizer,
        ));
        (coordinator, control_rx)
    }

    fn stale_connect_request(user: &str) -> ClientRequest {
        let timestamp = (epoch_seconds() - 3600).to_string();
        let token = auth::generate_client_token("secret", "p1", user, &timestamp, None);
        request(
            "connect",
            json!({
                "token": token,
                "user": user,
                "project": "p1",
                "timestamp": timestamp,
            }),
        )
    }

    #[tokio::test]
    async fn test_parked_connect_rejected_closes() {
        let (coordinator, _control_rx) = expiring_world(Arc::new(AllInactive));
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(Arc::clone(&coordinator), tx));

        let connect_session = Arc::clone(&session);
        let connect = tokio::spawn(async move {
            connect_session.handle(stale_connect_request("alice")).await
        });

        // The connect parks: it must not complete on its own.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!connect.is_finished());

        // The sweep's verdict (inactive) rejects it and closes the
        // transport.
        coordinator.sweep_verify().await;
        let (response, close) = connect.await.unwrap();
        assert_eq!(response.error.as_deref(), Some("unauthorized"));
        assert!(close);
        assert_eq!(coordinator.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_parked_connect_approved_authenticates() {
        let (coordinator, _control_rx) =
            expiring_world(Arc::new(StaticAuthorizer { allow: true }));
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(Arc::clone(&coordinator), tx));

        let connect_session = Arc::clone(&session);
        let connect = tokio::spawn(async move {
            connect_session.handle(stale_connect_request("alice")).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!connect.is_finished());

        // StaticAuthorizer reports nobody inactive: the parked connect
        // proceeds to Authenticated.
        coordinator.sweep_verify().await;
        let (response, close) = connect.await.unwrap();
        assert!(response.error.is_none());
        assert!(!close);
        assert_eq!(coordinator.stats(), (1, 1));
    }
}
