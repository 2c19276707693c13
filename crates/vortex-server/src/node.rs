//! Node coordinator: process-wide connection registry, heartbeat,
//! inter-node control dispatch, expired-connection sweep, and the publish
//! pipeline.
//!
//! One coordinator instance is constructed per process and passed by
//! handle to sessions and handlers; nothing here is global, so tests can
//! run several independent coordinators side by side.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use async_trait::async_trait;
use vortex_core::message::epoch_seconds;
use vortex_core::{ClientInfo, ControlMessage, Engine, EngineError, Message};
use vortex_protocol::{ClientRequest, ErrorCode, Response};

use crate::authorize::Authorizer;
use crate::config::Config;
use crate::session::Session;
use crate::structure::{ChannelOptions, Structure};

/// Coordinator timing and limit settings, resolved from the config.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Node name carried in heartbeat messages.
    pub name: String,
    /// Heartbeat interval. Also the initial stagger delay for the
    /// heartbeat and purge tasks.
    pub ping_interval: Duration,
    /// Max age of a node-info entry before the purge task drops it.
    pub info_max_delay: Duration,
    /// Session presence-refresh timer interval.
    pub presence_ping_interval: Duration,
    /// Presence entry TTL in seconds.
    pub presence_expire: u64,
    /// Channel name length cap.
    pub max_channel_length: usize,
    /// Requests-per-frame cap.
    pub max_batch: usize,
    /// Phase-1 sweep interval.
    pub collect_interval: Duration,
    /// Phase-2 sweep interval.
    pub verify_interval: Duration,
    /// Minimum gap between Phase-2 rounds for one project.
    pub min_verify_interval: Duration,
}

impl From<&Config> for NodeSettings {
    fn from(config: &Config) -> Self {
        Self {
            name: config.node.name.clone(),
            ping_interval: Duration::from_secs(config.node.ping_interval_secs),
            info_max_delay: Duration::from_secs(config.node.info_max_delay_secs),
            presence_ping_interval: Duration::from_secs(config.presence.ping_interval_secs),
            presence_expire: config.presence.expire_secs,
            max_channel_length: config.limits.max_channel_length,
            max_batch: config.limits.max_batch,
            collect_interval: Duration::from_secs(config.sweep.collect_interval_secs),
            verify_interval: Duration::from_secs(config.sweep.verify_interval_secs),
            min_verify_interval: Duration::from_secs(config.sweep.min_project_interval_secs),
        }
    }
}

/// Liveness info about one node, refreshed by heartbeat control messages.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node id.
    pub uid: String,
    /// Node name.
    pub name: String,
    /// Connected clients on that node.
    pub clients: usize,
    /// Unique users on that node.
    pub unique_users: usize,
    /// Channels with local subscribers on that node.
    pub channels: usize,
    /// Last refresh, epoch seconds.
    pub updated_at: u64,
}

/// Pre-publish hook. Runs before the message reaches the engine; returning
/// `None` vetoes the publish, which is then reported as success with no
/// error (a soft discard, not a failure).
#[async_trait]
pub trait PublishTransform: Send + Sync {
    /// Transform or veto a message about to be published.
    async fn transform(&self, message: Message) -> Option<Message>;
}

/// Post-publish hook. Runs after delivery; failures are logged and never
/// fail the publish.
#[async_trait]
pub trait PublishNotifier: Send + Sync {
    /// Observe a published message.
    async fn notify(&self, message: &Message) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct PingParams {
    uid: String,
    name: String,
    #[serde(default)]
    clients: usize,
    #[serde(default)]
    unique_users: usize,
    #[serde(default)]
    channels: usize,
}

#[derive(Debug, Deserialize)]
struct UserTargetParams {
    project: String,
    user: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUserParams {
    user: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

type ConnectionMap = HashMap<String, HashMap<String, HashMap<String, Arc<Session>>>>;

/// The per-process coordinator.
pub struct NodeCoordinator {
    uid: String,
    settings: NodeSettings,
    engine: Arc<dyn Engine>,
    structure: Arc<dyn Structure>,
    authorizer: Arc<dyn Authorizer>,
    /// project → user → connection id → session.
    connections: Mutex<ConnectionMap>,
    nodes: Mutex<HashMap<String, NodeInfo>>,
    /// Parked connects awaiting a Phase-2 liveness verdict, per project.
    pending_reconnects: Mutex<HashMap<String, Vec<(String, oneshot::Sender<bool>)>>>,
    /// Users flagged by Phase 1 as possibly expired, per project.
    pending_expired: Mutex<HashMap<String, HashSet<String>>>,
    last_verify: Mutex<HashMap<String, Instant>>,
    transforms: Vec<Box<dyn PublishTransform>>,
    notifiers: Vec<Box<dyn PublishNotifier>>,
}

impl NodeCoordinator {
    /// Create a coordinator with no hooks.
    #[must_use]
    pub fn new(
        settings: NodeSettings,
        engine: Arc<dyn Engine>,
        structure: Arc<dyn Structure>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            uid: vortex_core::message::generate_uid(),
            settings,
            engine,
            structure,
            authorizer,
            connections: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
            pending_reconnects: Mutex::new(HashMap::new()),
            pending_expired: Mutex::new(HashMap::new()),
            last_verify: Mutex::new(HashMap::new()),
            transforms: Vec::new(),
            notifiers: Vec::new(),
        }
    }

    /// Append a pre-publish transform hook. Hooks run in registration
    /// order.
    #[must_use]
    pub fn with_transform(mut self, transform: Box<dyn PublishTransform>) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Append a post-publish notifier hook.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Box<dyn PublishNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// This node's id.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The engine this coordinator publishes through.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Project/namespace structure.
    #[must_use]
    pub fn structure(&self) -> &Arc<dyn Structure> {
        &self.structure
    }

    /// External HTTP collaborators.
    #[must_use]
    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }

    /// Coordinator settings.
    #[must_use]
    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Start background tasks: control dispatch, heartbeat, node-info
    /// purge, and the two sweep phases. The heartbeat and purge tasks
    /// stagger their start by one ping interval so a fleet restarting
    /// together does not stampede the control channel.
    pub fn start(self: &Arc<Self>, mut control_rx: mpsc::UnboundedReceiver<ControlMessage>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = control_rx.recv().await {
                node.handle_control(message).await;
            }
            debug!("Control channel closed");
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(node.settings.ping_interval).await;
            loop {
                node.heartbeat().await;
                tokio::time::sleep(node.settings.ping_interval).await;
            }
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(node.settings.ping_interval).await;
            loop {
                node.purge_nodes();
                tokio::time::sleep(node.settings.ping_interval).await;
            }
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(node.settings.collect_interval).await;
                node.sweep_collect();
            }
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(node.settings.verify_interval).await;
                // Reschedules unconditionally, collaborator failures
                // included.
                node.sweep_verify().await;
            }
        });

        info!(node = %self.uid, name = %self.settings.name, "Node coordinator started");
    }

    // -- connection registry ------------------------------------------------

    /// Register an authenticated session.
    pub fn add_connection(&self, project: &str, user: &str, session: Arc<Session>) {
        let mut connections = lock(&self.connections);
        connections
            .entry(project.to_string())
            .or_default()
            .entry(user.to_string())
            .or_default()
            .insert(session.id.clone(), session);
    }

    /// Deregister a session, pruning emptied user and project maps.
    pub fn remove_connection(&self, project: &str, user: &str, connection_id: &str) {
        let mut connections = lock(&self.connections);
        let Some(users) = connections.get_mut(project) else {
            return;
        };
        if let Some(conns) = users.get_mut(user) {
            conns.remove(connection_id);
            if conns.is_empty() {
                users.remove(user);
            }
        }
        if users.is_empty() {
            connections.remove(project);
        }
    }

    /// All sessions of one user in a project.
    #[must_use]
    pub fn sessions_for_user(&self, project: &str, user: &str) -> Vec<Arc<Session>> {
        lock(&self.connections)
            .get(project)
            .and_then(|users| users.get(user))
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total connected clients and unique users across all projects.
    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        let connections = lock(&self.connections);
        let clients = connections
            .values()
            .flat_map(|users| users.values())
            .map(HashMap::len)
            .sum();
        let users = connections.values().map(HashMap::len).sum();
        (clients, users)
    }

    // -- heartbeat & node info ----------------------------------------------

    /// Publish this node's heartbeat. Own node info is applied locally
    /// first; the control broadcast exists for the other nodes, and the
    /// loopback echo is filtered out on receipt.
    pub async fn heartbeat(&self) {
        let (clients, unique_users) = self.stats();
        let info = NodeInfo {
            uid: self.uid.clone(),
            name: self.settings.name.clone(),
            clients,
            unique_users,
            channels: self.engine.channel_count(),
            updated_at: epoch_seconds(),
        };
        lock(&self.nodes).insert(self.uid.clone(), info);

        let params = json!({
            "uid": self.uid,
            "name": self.settings.name,
            "clients": clients,
            "unique_users": unique_users,
            "channels": self.engine.channel_count(),
        });
        let message = ControlMessage::new(&self.uid, "ping", params);
        if let Err(e) = self.engine.publish_control(message).await {
            warn!(error = %e, "Heartbeat publish failed");
        }
    }

    /// Drop node-info entries not refreshed within the max-delay window.
    pub fn purge_nodes(&self) {
        let cutoff = epoch_seconds().saturating_sub(self.settings.info_max_delay.as_secs());
        let mut nodes = lock(&self.nodes);
        nodes.retain(|uid, info| {
            let keep = info.updated_at > cutoff;
            if !keep {
                info!(node = %uid, "Purging stale node info");
            }
            keep
        });
    }

    /// Known nodes, most recently refreshed state.
    #[must_use]
    pub fn node_list(&self) -> Vec<NodeInfo> {
        lock(&self.nodes).values().cloned().collect()
    }

    // -- control dispatch ---------------------------------------------------

    /// Dispatch one inter-node control message. A message carrying this
    /// node's own uid is a loopback echo of its own publish and is ignored;
    /// the local effect was already applied before publishing.
    pub async fn handle_control(&self, message: ControlMessage) {
        if message.uid == self.uid {
            debug!(method = %message.method, "Ignoring own control message");
            return;
        }

        match message.method.as_str() {
            "ping" => match serde_json::from_value::<PingParams>(message.params) {
                Ok(params) => {
                    let info = NodeInfo {
                        uid: params.uid.clone(),
                        name: params.name,
                        clients: params.clients,
                        unique_users: params.unique_users,
                        channels: params.channels,
                        updated_at: epoch_seconds(),
                    };
                    lock(&self.nodes).insert(params.uid, info);
                }
                Err(e) => warn!(error = %e, "Malformed ping control message"),
            },
            "unsubscribe" => match serde_json::from_value::<UserTargetParams>(message.params) {
                Ok(params) => {
                    self.unsubscribe_user_local(
                        &params.project,
                        &params.user,
                        params.channel.as_deref(),
                    )
                    .await;
                }
                Err(e) => warn!(error = %e, "Malformed unsubscribe control message"),
            },
            "disconnect" => match serde_json::from_value::<UserTargetParams>(message.params) {
                Ok(params) => {
                    self.disconnect_user_local(
                        &params.project,
                        &params.user,
                        params.reason.as_deref().unwrap_or("disconnect"),
                    )
                    .await;
                }
                Err(e) => warn!(error = %e, "Malformed disconnect control message"),
            },
            "update_structure" => {
                if let Err(e) = self.structure.reload() {
                    warn!(error = %e, "Structure reload failed");
                }
            }
            other => warn!(method = %other, "Unknown control message method"),
        }
    }

    /// Force-unsubscribe a user on every node: applied locally, then
    /// broadcast so other nodes apply it to their own sessions.
    pub async fn unsubscribe_user(
        &self,
        project: &str,
        user: &str,
        channel: Option<&str>,
    ) -> Result<(), EngineError> {
        self.unsubscribe_user_local(project, user, channel).await;
        let params = json!({ "project": project, "user": user, "channel": channel });
        self.engine
            .publish_control(ControlMessage::new(&self.uid, "unsubscribe", params))
            .await
    }

    /// Force-disconnect a user on every node.
    pub async fn disconnect_user(
        &self,
        project: &str,
        user: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.disconnect_user_local(project, user, reason).await;
        let params = json!({ "project": project, "user": user, "reason": reason });
        self.engine
            .publish_control(ControlMessage::new(&self.uid, "disconnect", params))
            .await
    }

    async fn unsubscribe_user_local(&self, project: &str, user: &str, channel: Option<&str>) {
        for session in self.sessions_for_user(project, user) {
            session.force_unsubscribe(channel).await;
        }
    }

    async fn disconnect_user_local(&self, project: &str, user: &str, reason: &str) {
        for session in self.sessions_for_user(project, user) {
            session.send_disconnect(reason);
            session.close().await;
        }
    }

    // -- expired-connection sweep -------------------------------------------

    /// Park an expired connect until the next Phase-2 verdict for its
    /// project. The returned receiver resolves `true` to let the connect
    /// proceed, `false` to reject it. There is no timeout: a parked
    /// connect waits as long as the collaborator stays unreachable.
    pub fn park_reconnect(&self, project: &str, user: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_reconnects)
            .entry(project.to_string())
            .or_default()
            .push((user.to_string(), tx));
        lock(&self.pending_expired)
            .entry(project.to_string())
            .or_default()
            .insert(user.to_string());
        rx
    }

    /// Phase 1: flag users whose sessions have outlived the project's
    /// connection lifetime. Anonymous sessions are never expiry-checked.
    pub fn sweep_collect(&self) {
        let projects = match self.structure.project_list() {
            Ok(projects) => projects,
            Err(e) => {
                warn!(error = %e, "Sweep collect: structure unavailable");
                return;
            }
        };
        let now = epoch_seconds();

        for project in projects.iter().filter(|p| p.connection_lifetime > 0) {
            let expired: Vec<String> = {
                let connections = lock(&self.connections);
                let Some(users) = connections.get(&project.id) else {
                    continue;
                };
                users
                    .iter()
                    .filter(|(user, _)| !user.is_empty())
                    .filter(|(_, conns)| {
                        conns.values().any(|s| {
                            s.examined_at() + project.connection_lifetime < now
                        })
                    })
                    .map(|(user, _)| user.clone())
                    .collect()
            };
            if expired.is_empty() {
                continue;
            }
            lock(&self.pending_expired)
                .entry(project.id.clone())
                .or_default()
                .extend(expired);
        }
    }

    /// Phase 2: verify flagged users against the external liveness check.
    /// Inactive users are disconnected, active ones refreshed, and every
    /// parked connect for the project gets its verdict. A collaborator
    /// failure leaves the pending set intact for the next cycle.
    pub async fn sweep_verify(&self) {
        let due: Vec<(String, Vec<String>)> = {
            let pending = lock(&self.pending_expired);
            let last = lock(&self.last_verify);
            pending
                .iter()
                .filter(|(_, users)| !users.is_empty())
                .filter(|(project, _)| {
                    last.get(project.as_str())
                        .map_or(true, |t| t.elapsed() >= self.settings.min_verify_interval)
                })
                .map(|(project, users)| (project.clone(), users.iter().cloned().collect()))
                .collect()
        };

        for (project, users) in due {
            lock(&self.last_verify).insert(project.clone(), Instant::now());

            let inactive = match self.authorizer.check_users(&project, &users).await {
                Ok(inactive) => inactive,
                Err(e) => {
                    warn!(project = %project, error = %e, "Liveness check failed, retrying next cycle");
                    continue;
                }
            };
            if let Some(users) = lock(&self.pending_expired).get_mut(&project) {
                users.clear();
            }

            let now = epoch_seconds();
            for user in &users {
                let alive = !inactive.contains(user);
                for session in self.sessions_for_user(&project, user) {
                    if alive {
                        session.refresh_examined(now);
                    } else {
                        session.send_disconnect("expired");
                        session.close().await;
                    }
                }
            }

            let parked = lock(&self.pending_reconnects)
                .remove(&project)
                .unwrap_or_default();
            for (user, tx) in parked {
                let verdict = !inactive.contains(&user);
                if tx.send(verdict).is_err() {
                    debug!(user = %user, "Parked connect gone before verdict");
                }
            }
        }
    }

    // -- publish pipeline ---------------------------------------------------

    /// Run a publish through the hook pipeline and hand it to the engine
    /// exactly once: admin broadcast for watched namespaces, subscriber
    /// broadcast with the project id stripped, history append per the
    /// namespace's settings.
    ///
    /// # Errors
    ///
    /// Returns an error on engine failure. A transform veto is a soft
    /// discard and reports success.
    pub async fn process_publish(
        &self,
        project: &str,
        channel: &str,
        options: &ChannelOptions,
        data: Value,
        info: Option<ClientInfo>,
    ) -> Result<(), EngineError> {
        let mut message = Message::new(project, channel, data, info);

        for transform in &self.transforms {
            match transform.transform(message).await {
                Some(next) => message = next,
                None => {
                    debug!(channel = %channel, "Publish discarded by transform");
                    return Ok(());
                }
            }
        }

        if options.is_watching {
            let admin_body = json!({
                "method": "message",
                "body": serde_json::to_value(&message)?,
            });
            if let Err(e) = self.engine.publish_admin(admin_body).await {
                warn!(channel = %channel, error = %e, "Admin broadcast failed");
            }
        }

        self.engine
            .publish_message(project, channel, "message", message.client_body())
            .await?;

        if options.history_size > 0 {
            self.engine
                .add_history_message(
                    project,
                    channel,
                    &message,
                    options.history_size,
                    options.history_lifetime,
                )
                .await?;
        }

        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(&message).await {
                warn!(channel = %channel, error = %e, "Publish notifier failed");
            }
        }

        crate::metrics::record_publish();
        Ok(())
    }

    // -- API dispatch -------------------------------------------------------

    /// Dispatch one signed API command for a project. The method set is
    /// closed; structure CRUD is not served by this node.
    pub async fn api_dispatch(&self, project: &str, request: &ClientRequest) -> Response {
        let uid = request.uid.clone();
        let method = request.method.clone();

        match method.as_str() {
            "publish" => {
                let params: vortex_protocol::PublishParams = match request.parse_params() {
                    Ok(p) => p,
                    Err(e) => return Response::err(uid, method, e.to_string(), Value::Null),
                };
                let options = match self.structure.channel_options(project, &params.channel) {
                    Ok(Some(options)) => options,
                    Ok(None) => {
                        return Response::err(
                            uid,
                            method,
                            ErrorCode::NotFound.as_str(),
                            json!({ "channel": params.channel }),
                        )
                    }
                    Err(e) => {
                        warn!(error = %e, "Structure lookup failed");
                        return Response::err(
                            uid,
                            method,
                            ErrorCode::InternalServerError.as_str(),
                            Value::Null,
                        );
                    }
                };
                match self
                    .process_publish(project, &params.channel, &options, params.data, None)
                    .await
                {
                    Ok(()) => Response::ok(uid, method, json!({ "channel": params.channel })),
                    Err(e) => {
                        warn!(error = %e, "API publish failed");
                        Response::err(
                            uid,
                            method,
                            ErrorCode::InternalServerError.as_str(),
                            json!({ "channel": params.channel }),
                        )
                    }
                }
            }
            "unsubscribe" => {
                let params: ApiUserParams = match request.parse_params() {
                    Ok(p) => p,
                    Err(e) => return Response::err(uid, method, e.to_string(), Value::Null),
                };
                match self
                    .unsubscribe_user(project, &params.user, params.channel.as_deref())
                    .await
                {
                    Ok(()) => Response::ok(uid, method, json!({ "user": params.user })),
                    Err(e) => {
                        warn!(error = %e, "API unsubscribe failed");
                        Response::err(
                            uid,
                            method,
                            ErrorCode::InternalServerError.as_str(),
                            Value::Null,
                        )
                    }
                }
            }
            "disconnect" => {
                let params: ApiUserParams = match request.parse_params() {
                    Ok(p) => p,
                    Err(e) => return Response::err(uid, method, e.to_string(), Value::Null),
                };
                let reason = params.reason.as_deref().unwrap_or("disconnect");
                match self.disconnect_user(project, &params.user, reason).await {
                    Ok(()) => Response::ok(uid, method, json!({ "user": params.user })),
                    Err(e) => {
                        warn!(error = %e, "API disconnect failed");
                        Response::err(
                            uid,
                            method,
                            ErrorCode::InternalServerError.as_str(),
                            Value::Null,
                        )
                    }
                }
            }
            "presence" | "history" => {
                let params: vortex_protocol::ChannelParams = match request.parse_params() {
                    Ok(p) => p,
                    Err(e) => return Response::err(uid, method, e.to_string(), Value::Null),
                };
                let options = match self.structure.channel_options(project, &params.channel) {
                    Ok(Some(options)) => options,
                    Ok(None) => {
                        return Response::err(
                            uid,
                            method,
                            ErrorCode::NotFound.as_str(),
                            json!({ "channel": params.channel }),
                        )
                    }
                    Err(e) => {
                        warn!(error = %e, "Structure lookup failed");
                        return Response::err(
                            uid,
                            method,
                            ErrorCode::InternalServerError.as_str(),
                            Value::Null,
                        );
                    }
                };

                if method == "presence" {
                    if !options.presence {
                        return Response::err(
                            uid,
                            method,
                            ErrorCode::NotAvailable.as_str(),
                            json!({ "channel": params.channel }),
                        );
                    }
                    match self.engine.presence(project, &params.channel).await {
                        Ok(data) => Response::ok(
                            uid,
                            method,
                            json!({ "channel": params.channel, "data": data }),
                        ),
                        Err(e) => {
                            warn!(error = %e, "API presence failed");
                            Response::err(
                                uid,
                                method,
                                ErrorCode::InternalServerError.as_str(),
                                Value::Null,
                            )
                        }
                    }
                } else {
                    if options.history_size == 0 {
                        return Response::err(
                            uid,
                            method,
                            ErrorCode::NotAvailable.as_str(),
                            json!({ "channel": params.channel }),
                        );
                    }
                    match self.engine.history(project, &params.channel).await {
                        Ok(messages) => {
                            let data: Vec<Value> =
                                messages.iter().map(Message::client_body).collect();
                            Response::ok(
                                uid,
                                method,
                                json!({ "channel": params.channel, "data": data }),
                            )
                        }
                        Err(e) => {
                            warn!(error = %e, "API history failed");
                            Response::err(
                                uid,
                                method,
                                ErrorCode::InternalServerError.as_str(),
                                Value::Null,
                            )
                        }
                    }
                }
            }
            _ => Response::err(
                uid,
                method,
                ErrorCode::MethodNotFound.as_str(),
                Value::Null,
            ),
        }
    }
}

/// Lock a mutex, recovering from poisoning. State behind these locks stays
/// consistent because every critical section is panic-free.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
