//! One participant: the WebSocket event loop, the action inbox that
//! other tasks use to reach it, and ownership of its up- and
//! down-connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow, bail};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use palaver_protocol::{
    AdmissionError, ClientMessage, GroupActionKind, IceCandidate, JoinKind, JoinedKind,
    PROTOCOL_VERSIONS, Permissions, TrackRequest, UserActionKind, UserKind,
};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, interval};
use tokio_util::sync::CancellationToken;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::conn::{self, DownConnection, UpConnection, UpTrack};
use crate::group::{ChatEntry, Group};
use crate::web::AppState;

/// Heartbeat cadence of the event loop.
const TICK_INTERVAL: Duration = Duration::from_secs(10);
/// Silence after which the server sends a protocol-level ping.
const PING_AFTER: Duration = Duration::from_secs(60);
/// Silence after which the client is declared dead.
const DEAD_AFTER: Duration = Duration::from_secs(90);
/// How long the client gets to send its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages posted to a client's action inbox, either by its own
/// connections (ICE, negotiation progress) or by other clients in the
/// group (stream push/teardown, moderation).
pub enum Action {
    /// Forward a protocol message to this client's WebSocket.
    Deliver(Box<ClientMessage>),
    /// One of this client's up-connections produced all its tracks.
    UpComplete { id: String },
    UpIceFailed { id: String },
    DownIceFailed { id: String },
    /// A stream published by another client is available.
    Push { conn: Arc<UpConnection> },
    /// A stream published by another client went away.
    StreamClosed { id: String },
    Kick {
        by_id: String,
        by_username: Option<String>,
        message: String,
    },
    PermissionsChanged,
}

/// Items owned by the writer task, the sole owner of the WebSocket
/// write half.
enum Outgoing {
    Message(Box<ClientMessage>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

pub struct ClientChannels {
    actions_rx: mpsc::Receiver<Action>,
    outbox_rx: mpsc::Receiver<Outgoing>,
}

pub struct Client {
    pub id: String,
    username: parking_lot::Mutex<Option<String>>,
    permissions: parking_lot::Mutex<Permissions>,
    data: parking_lot::Mutex<serde_json::Map<String, serde_json::Value>>,
    group: parking_lot::Mutex<Option<Arc<Group>>>,
    requested: parking_lot::Mutex<HashMap<String, Vec<TrackRequest>>>,
    up: parking_lot::Mutex<HashMap<String, Arc<UpConnection>>>,
    down: parking_lot::Mutex<HashMap<String, Arc<DownConnection>>>,
    allocator: parking_lot::Mutex<Option<CancellationToken>>,
    actions_tx: mpsc::Sender<Action>,
    outbox_tx: mpsc::Sender<Outgoing>,
    pub done: CancellationToken,
}

impl Client {
    pub fn new(id: String, outbox: usize, actions: usize) -> (Arc<Client>, ClientChannels) {
        let (actions_tx, actions_rx) = mpsc::channel(actions);
        let (outbox_tx, outbox_rx) = mpsc::channel(outbox);
        let client = Arc::new(Client {
            id,
            username: parking_lot::Mutex::new(None),
            permissions: parking_lot::Mutex::new(Permissions::default()),
            data: parking_lot::Mutex::new(serde_json::Map::new()),
            group: parking_lot::Mutex::new(None),
            requested: parking_lot::Mutex::new(HashMap::new()),
            up: parking_lot::Mutex::new(HashMap::new()),
            down: parking_lot::Mutex::new(HashMap::new()),
            allocator: parking_lot::Mutex::new(None),
            actions_tx,
            outbox_tx,
            done: CancellationToken::new(),
        });
        (
            client,
            ClientChannels {
                actions_rx,
                outbox_rx,
            },
        )
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: &str) -> (Arc<Client>, ClientChannels) {
        Client::new(id.to_owned(), 64, 32)
    }

    pub fn username(&self) -> Option<String> {
        self.username.lock().clone()
    }

    pub fn permissions(&self) -> Permissions {
        *self.permissions.lock()
    }

    pub fn set_permissions(&self, permissions: Permissions) {
        *self.permissions.lock() = permissions;
    }

    pub fn group(&self) -> Option<Arc<Group>> {
        self.group.lock().clone()
    }

    pub fn up_connections(&self) -> Vec<Arc<UpConnection>> {
        self.up.lock().values().cloned().collect()
    }

    /// Enqueue a message toward this client's WebSocket. Never blocks
    /// forever: the send is raced against the client's `done` signal.
    pub async fn send(&self, msg: ClientMessage) {
        self.send_outgoing(Outgoing::Message(Box::new(msg))).await;
    }

    async fn send_outgoing(&self, item: Outgoing) {
        tokio::select! {
            _ = self.done.cancelled() => {}
            _ = self.outbox_tx.send(item) => {}
        }
    }

    /// Post an action to this client's inbox, racing against `done`.
    pub async fn post(&self, action: Action) {
        tokio::select! {
            _ = self.done.cancelled() => {}
            _ = self.actions_tx.send(action) => {}
        }
    }

    pub fn actions_sender(&self) -> mpsc::Sender<Action> {
        self.actions_tx.clone()
    }

    async fn error_message(&self, code: &str, text: &str) {
        self.send(ClientMessage::UserMessage {
            kind: "error".to_owned(),
            source: None,
            username: None,
            dest: Some(self.id.clone()),
            privileged: false,
            value: Some(serde_json::json!({ "error": code, "message": text })),
        })
        .await;
    }

    fn requested_kinds(&self, label: Option<&str>) -> Vec<TrackRequest> {
        let requested = self.requested.lock();
        if let Some(label) = label {
            if let Some(kinds) = requested.get(label) {
                return kinds.clone();
            }
        }
        requested.get("").cloned().unwrap_or_default()
    }

    fn user_entry(&self, kind: UserKind) -> ClientMessage {
        let data = self.data.lock();
        ClientMessage::User {
            kind,
            id: self.id.clone(),
            username: self.username(),
            permissions: self.permissions().to_strings(),
            data: (!data.is_empty()).then(|| serde_json::Value::Object(data.clone())),
        }
    }
}

fn generate_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{micros:x}-{seq:04x}")
}

/// Entry point for an upgraded WebSocket: negotiate the handshake,
/// then run the event loop until the peer leaves or dies.
pub async fn handle_ws(state: Arc<AppState>, socket: WebSocket) {
    let (sink, mut stream) = socket.split();

    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_text(&mut stream)).await;
    let Ok(Some(text)) = handshake else {
        tracing::debug!("WebSocket closed before handshake");
        return;
    };
    let (versions, id) = match serde_json::from_str::<ClientMessage>(&text) {
        Ok(ClientMessage::Handshake { version, id }) => (version, id),
        _ => {
            tracing::debug!("First message was not a handshake");
            return;
        }
    };
    let version = versions
        .iter()
        .find(|v| PROTOCOL_VERSIONS.contains(&v.as_str()))
        .cloned()
        .unwrap_or_else(|| "2".to_owned());

    let id = id.filter(|s| !s.is_empty()).unwrap_or_else(generate_id);
    let (client, channels) = Client::new(
        id,
        state.config.limits.outbox,
        state.config.limits.actions,
    );
    tracing::info!(client = %client.id, %version, "Client connected");

    tokio::spawn(writer_task(sink, channels.outbox_rx, client.done.clone()));

    client
        .send(ClientMessage::Handshake {
            version: vec![version],
            id: None,
        })
        .await;

    client_loop(&state, &client, stream, channels.actions_rx).await;

    leave_group(&state, &client).await;
    client.done.cancel();
    tracing::info!(client = %client.id, "Client disconnected");
}

async fn read_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Sole owner of the WebSocket write half; drains the outbox.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox_rx: mpsc::Receiver<Outgoing>,
    done: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = done.cancelled() => break,
            item = outbox_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        match item {
            Outgoing::Message(msg) => {
                let json = match serde_json::to_string(&*msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Outgoing::Pong(payload) => {
                if sink.send(Message::Pong(payload.into())).await.is_err() {
                    break;
                }
            }
            Outgoing::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn client_loop(
    state: &Arc<AppState>,
    client: &Arc<Client>,
    mut stream: SplitStream<WebSocket>,
    mut actions_rx: mpsc::Receiver<Action>,
) {
    let mut tick = interval(TICK_INTERVAL);
    let mut last_activity = Instant::now();
    let mut pinged = false;

    loop {
        tokio::select! {
            _ = client.done.cancelled() => break,
            _ = tick.tick() => {
                let silence = last_activity.elapsed();
                if silence > DEAD_AFTER {
                    tracing::info!(client = %client.id, "Client dead after {}s of silence", silence.as_secs());
                    break;
                }
                if silence > PING_AFTER && !pinged {
                    pinged = true;
                    client.send(ClientMessage::Ping).await;
                }
            }
            action = actions_rx.recv() => {
                let Some(action) = action else { break };
                if let Err(e) = handle_action(state, client, action).await {
                    tracing::info!(client = %client.id, "Terminating: {e}");
                    break;
                }
            }
            frame = stream.next() => {
                let Some(frame) = frame else { break };
                last_activity = Instant::now();
                pinged = false;
                match frame {
                    Ok(Message::Text(text)) => {
                        let msg = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                tracing::warn!(client = %client.id, "Protocol error: {e}");
                                client.error_message("protocol-error", "could not parse message").await;
                                client.send_outgoing(Outgoing::Close {
                                    code: 1002,
                                    reason: "protocol error".to_owned(),
                                }).await;
                                break;
                            }
                        };
                        match dispatch(state, client, msg).await {
                            Ok(()) => {}
                            Err(e) => {
                                tracing::warn!(client = %client.id, "Closing: {e}");
                                client.error_message("protocol-error", &e.to_string()).await;
                                client.send_outgoing(Outgoing::Close {
                                    code: 1002,
                                    reason: "protocol error".to_owned(),
                                }).await;
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        client.send_outgoing(Outgoing::Pong(payload.to_vec())).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(client = %client.id, "WebSocket error: {e}");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle one message from the client. An `Err` return is fatal for
/// the connection (protocol errors); user errors are reported in-band.
async fn dispatch(state: &Arc<AppState>, client: &Arc<Client>, msg: ClientMessage) -> Result<()> {
    match msg {
        ClientMessage::Handshake { .. } => Ok(()), // duplicate handshake is harmless
        ClientMessage::Ping => {
            client.send(ClientMessage::Pong).await;
            Ok(())
        }
        ClientMessage::Pong => Ok(()),
        ClientMessage::Join {
            kind,
            group,
            username,
            password,
            token,
        } => match kind {
            JoinKind::Join => handle_join(state, client, group, username, password, token).await,
            JoinKind::Leave => {
                leave_group(state, client).await;
                client
                    .send(ClientMessage::Joined {
                        kind: JoinedKind::Leave,
                        group,
                        username: client.username(),
                        permissions: Vec::new(),
                        status: None,
                        rtc_configuration: None,
                        error: None,
                        value: None,
                    })
                    .await;
                Ok(())
            }
        },
        ClientMessage::Request { request } => {
            *client.requested.lock() = request.normalize();
            resync_subscriptions(state, client).await;
            Ok(())
        }
        ClientMessage::Offer {
            id,
            label,
            replace,
            labels,
            sdp,
            ..
        } => handle_offer(state, client, id, label, replace, labels.unwrap_or_default(), sdp).await,
        ClientMessage::Answer { id, sdp } => {
            let conn = client.down.lock().get(&id).cloned();
            match conn {
                Some(conn) => {
                    if let Err(e) = conn.accept_answer(&sdp).await {
                        tracing::warn!(client = %client.id, conn = %id, "Bad answer: {e}");
                        close_down(client, &conn, true).await;
                    }
                }
                None => tracing::debug!(client = %client.id, conn = %id, "Answer for unknown stream"),
            }
            Ok(())
        }
        ClientMessage::Ice { id, candidate } => {
            handle_ice(client, &id, candidate).await;
            Ok(())
        }
        ClientMessage::Renegotiate { id } => {
            let conn = client.down.lock().get(&id).cloned();
            if let Some(conn) = conn {
                send_down_offer(client, &conn, true).await;
            }
            Ok(())
        }
        ClientMessage::RequestStream { id, request } => {
            handle_request_stream(state, client, id, request).await;
            Ok(())
        }
        ClientMessage::Close { id } => {
            let conn = client.up.lock().get(&id).cloned();
            if let Some(conn) = conn {
                close_up(state, client, &conn, true).await;
            }
            Ok(())
        }
        ClientMessage::Abort { id } => {
            let conn = client.down.lock().get(&id).cloned();
            if let Some(conn) = conn {
                close_down(client, &conn, true).await;
            }
            Ok(())
        }
        ClientMessage::Chat {
            kind,
            dest,
            noecho,
            value,
            ..
        } => {
            handle_chat(client, kind, dest, noecho, value).await;
            Ok(())
        }
        ClientMessage::UserAction {
            kind,
            dest,
            value,
            ..
        } => handle_useraction(client, kind, dest, value).await,
        ClientMessage::GroupAction { kind, value, .. } => {
            handle_groupaction(state, client, kind, value).await
        }
        ClientMessage::UserMessage {
            kind, dest, value, ..
        } => {
            handle_usermessage(client, kind, dest, value).await;
            Ok(())
        }
        ClientMessage::Joined { .. }
        | ClientMessage::User { .. }
        | ClientMessage::ChatHistory { .. } => {
            bail!("unexpected server-to-client message type")
        }
    }
}

/// Out-of-band message from an operator toward one user or the whole
/// group. Never archived.
async fn handle_usermessage(
    client: &Arc<Client>,
    kind: String,
    dest: Option<String>,
    value: Option<serde_json::Value>,
) {
    let permissions = client.permissions();
    let Some(group) = client.group() else {
        client.error_message("not-joined", "join a group first").await;
        return;
    };
    if !permissions.op {
        client
            .error_message("not-authorised", "this action requires operator rights")
            .await;
        return;
    }

    let msg = ClientMessage::UserMessage {
        kind,
        source: Some(client.id.clone()),
        username: client.username(),
        dest: dest.clone(),
        privileged: true,
        value,
    };
    match dest {
        Some(dest_id) => match group.get_client(&dest_id) {
            Some(target) => target.send(msg).await,
            None => {
                client
                    .error_message("unknown-user", "no such user in this group")
                    .await;
            }
        },
        None => {
            for member in group.members() {
                member.send(msg.clone()).await;
            }
        }
    }
}

async fn handle_action(state: &Arc<AppState>, client: &Arc<Client>, action: Action) -> Result<()> {
    match action {
        Action::Deliver(msg) => {
            client.send_outgoing(Outgoing::Message(msg)).await;
            Ok(())
        }
        Action::UpComplete { id } => {
            let conn = client.up.lock().get(&id).cloned();
            let (Some(conn), Some(group)) = (conn, client.group()) else {
                return Ok(());
            };
            if conn.has_video() && !conn.video_counted.swap(true, Ordering::Relaxed) {
                let count = group.add_video_publisher();
                tracing::debug!(group = %group.name(), count, "Video publisher added");
            }
            if let Some(old) = conn.replace.clone() {
                let old_conn = client.up.lock().get(&old).cloned();
                if let Some(old_conn) = old_conn {
                    close_up(state, client, &old_conn, true).await;
                }
            }
            for member in group.members() {
                if member.id != client.id {
                    member.post(Action::Push { conn: conn.clone() }).await;
                }
            }
            Ok(())
        }
        Action::UpIceFailed { id } => {
            tracing::info!(client = %client.id, conn = %id, "Up connection ICE failed");
            let conn = client.up.lock().get(&id).cloned();
            if let Some(conn) = conn {
                close_up(state, client, &conn, true).await;
            }
            client
                .send(ClientMessage::Abort { id })
                .await;
            Ok(())
        }
        Action::DownIceFailed { id } => {
            let conn = client.down.lock().get(&id).cloned();
            let Some(conn) = conn else { return Ok(()) };
            tracing::info!(
                client = %client.id,
                conn = %id,
                state = ?conn.ice_state(),
                "Down connection ICE failed, restarting"
            );
            match conn.create_offer(true).await {
                Ok(sdp) => {
                    client
                        .send(ClientMessage::Offer {
                            id: conn.id.clone(),
                            label: conn.label.clone(),
                            replace: None,
                            source: Some(conn.source_client.clone()),
                            username: None,
                            labels: None,
                            sdp,
                        })
                        .await;
                }
                Err(e) => {
                    tracing::warn!(conn = %id, "ICE restart failed, re-pushing: {e}");
                    close_down(client, &conn, true).await;
                    if let Some(up) = find_published_stream(client, &id) {
                        ensure_down(state, client, &up).await;
                    }
                }
            }
            Ok(())
        }
        Action::Push { conn } => {
            ensure_down(state, client, &conn).await;
            Ok(())
        }
        Action::StreamClosed { id } => {
            let conn = client.down.lock().get(&id).cloned();
            if let Some(conn) = conn {
                close_down(client, &conn, true).await;
            }
            Ok(())
        }
        Action::Kick {
            by_id,
            by_username,
            message,
        } => {
            client
                .send(ClientMessage::UserMessage {
                    kind: "kicked".to_owned(),
                    source: Some(by_id),
                    username: by_username,
                    dest: Some(client.id.clone()),
                    privileged: true,
                    value: Some(serde_json::Value::String(message)),
                })
                .await;
            client
                .send_outgoing(Outgoing::Close {
                    code: 1000,
                    reason: "kicked".to_owned(),
                })
                .await;
            Err(anyhow!("kicked"))
        }
        Action::PermissionsChanged => {
            let Some(group) = client.group() else {
                return Ok(());
            };
            let permissions = client.permissions();
            client
                .send(ClientMessage::Joined {
                    kind: JoinedKind::Change,
                    group: group.name().to_owned(),
                    username: client.username(),
                    permissions: permissions.to_strings(),
                    status: Some(group.status(&state.base_url(), true)),
                    rtc_configuration: None,
                    error: None,
                    value: None,
                })
                .await;
            if !permissions.present {
                // publishing rights were revoked
                for conn in client.up_connections() {
                    close_up(state, client, &conn, true).await;
                    client.send(ClientMessage::Abort { id: conn.id.clone() }).await;
                }
            }
            Ok(())
        }
    }
}

async fn handle_join(
    state: &Arc<AppState>,
    client: &Arc<Client>,
    group_name: String,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let fail = |error: AdmissionError| ClientMessage::Joined {
        kind: JoinedKind::Fail,
        group: group_name.clone(),
        username: username.clone(),
        permissions: Vec::new(),
        status: None,
        rtc_configuration: None,
        error: Some(error.code().to_owned()),
        value: Some(error.to_string()),
    };

    if client.group().is_some() {
        bail!("join while already in a group");
    }
    if token.is_some() {
        client.send(fail(AdmissionError::NotSupported)).await;
        return Ok(());
    }

    let group = match state.groups.add(&group_name, None) {
        Ok(group) => group,
        Err(e) => {
            client.send(fail(e)).await;
            return Ok(());
        }
    };

    let description = group.description();
    let permissions = match description.authorize(username.as_deref(), password.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            client.send(fail(e)).await;
            return Ok(());
        }
    };

    if let Err(e) = group.add_client(client.clone(), permissions.op) {
        client.send(fail(e.clone())).await;
        if e == AdmissionError::DuplicateId {
            // a second connection claiming an existing id is a protocol
            // violation, not a recoverable user error
            bail!("duplicate client id");
        }
        return Ok(());
    }

    *client.username.lock() = username.clone();
    client.set_permissions(permissions);
    *client.group.lock() = Some(group.clone());

    tracing::info!(client = %client.id, group = %group.name(), "Client joined");

    client
        .send(ClientMessage::Joined {
            kind: JoinedKind::Join,
            group: group_name,
            username,
            permissions: permissions.to_strings(),
            status: Some(group.status(&state.base_url(), true)),
            rtc_configuration: Some(conn::client_rtc_configuration(&state.config.ice)),
            error: None,
            value: None,
        })
        .await;

    // introduce everyone to everyone
    for member in group.members() {
        if member.id == client.id {
            continue;
        }
        member.send(client.user_entry(UserKind::Add)).await;
        client.send(member.user_entry(UserKind::Add)).await;
    }

    // replay archived chat
    for entry in group.chat_history() {
        client
            .send(ClientMessage::ChatHistory {
                kind: entry.kind,
                source: entry.source,
                username: entry.username,
                time: Some(entry.time),
                value: entry.value,
            })
            .await;
    }

    // subscribe to whatever is already being published
    resync_subscriptions(state, client).await;

    let allocator = crate::allocator::spawn(client.clone(), group);
    if let Some(old) = client.allocator.lock().replace(allocator) {
        old.cancel();
    }
    Ok(())
}

async fn leave_group(state: &Arc<AppState>, client: &Arc<Client>) {
    let Some(group) = client.group.lock().take() else {
        return;
    };
    if let Some(allocator) = client.allocator.lock().take() {
        allocator.cancel();
    }

    let ups: Vec<_> = client.up.lock().drain().map(|(_, c)| c).collect();
    for conn in ups {
        conn.close().await;
        if conn.video_counted.load(Ordering::Relaxed) {
            group.del_video_publisher();
        }
        notify_stream_closed(&group, client, &conn.id).await;
    }
    let downs: Vec<_> = client.down.lock().drain().map(|(_, c)| c).collect();
    for conn in downs {
        conn.close().await;
    }

    group.del_client(&client.id);
    for member in group.members() {
        member.send(client.user_entry(UserKind::Delete)).await;
    }

    // a group that auto-locks closes behind its last operator
    if group.description().auto_lock
        && !group.members().iter().any(|m| m.permissions().op)
    {
        tracing::info!(group = %group.name(), "Last operator left, auto-locking");
        group.set_locked(Some("locked until an operator returns".to_owned()));
    }

    tracing::info!(client = %client.id, group = %group.name(), "Client left");
    state.groups.cleanup();
}

async fn notify_stream_closed(group: &Arc<Group>, client: &Arc<Client>, id: &str) {
    for member in group.members() {
        if member.id != client.id {
            member
                .post(Action::StreamClosed { id: id.to_owned() })
                .await;
        }
    }
}

async fn handle_offer(
    state: &Arc<AppState>,
    client: &Arc<Client>,
    id: String,
    label: Option<String>,
    replace: Option<String>,
    labels: HashMap<String, String>,
    sdp: String,
) -> Result<()> {
    if sdp.is_empty() {
        bail!("null SDP in offer");
    }
    if !client.permissions().present {
        client
            .error_message("not-authorised", "not authorised to publish")
            .await;
        client.send(ClientMessage::Abort { id }).await;
        return Ok(());
    }
    let Some(group) = client.group() else {
        client.error_message("not-joined", "join a group first").await;
        client.send(ClientMessage::Abort { id }).await;
        return Ok(());
    };

    // renegotiation of an existing stream
    let existing = client.up.lock().get(&id).cloned();
    if let Some(conn) = existing {
        match conn.answer_offer(&sdp).await {
            Ok(answer) => {
                client
                    .send(ClientMessage::Answer { id, sdp: answer })
                    .await;
                return Ok(());
            }
            Err(e) => {
                // fall back to tearing down and starting over
                tracing::warn!(conn = %id, "Renegotiation failed, restarting stream: {e}");
                close_up(state, client, &conn, true).await;
            }
        }
    }

    let conn = match UpConnection::new(
        group.api(),
        &state.config.ice,
        id.clone(),
        label,
        replace,
        labels,
        client.id.clone(),
        client.actions_sender(),
    )
    .await
    {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(conn = %id, "Failed to create up connection: {e}");
            client.send(ClientMessage::Abort { id }).await;
            return Ok(());
        }
    };

    match conn.answer_offer(&sdp).await {
        Ok(answer) => {
            client.up.lock().insert(id.clone(), conn);
            client
                .send(ClientMessage::Answer { id, sdp: answer })
                .await;
        }
        Err(e) => {
            tracing::warn!(conn = %id, "Offer failed: {e}");
            conn.close().await;
            client.send(ClientMessage::Abort { id }).await;
        }
    }
    Ok(())
}

async fn handle_ice(client: &Arc<Client>, id: &str, candidate: IceCandidate) {
    let up = client.up.lock().get(id).cloned();
    if let Some(conn) = up {
        if let Err(e) = conn.add_ice_candidate(candidate).await {
            tracing::debug!(conn = %id, "ICE candidate rejected: {e}");
        }
        return;
    }
    let down = client.down.lock().get(id).cloned();
    if let Some(conn) = down {
        if let Err(e) = conn.add_ice_candidate(candidate).await {
            tracing::debug!(conn = %id, "ICE candidate rejected: {e}");
        }
        return;
    }
    tracing::debug!(conn = %id, "ICE candidate for unknown stream");
}

async fn handle_chat(
    client: &Arc<Client>,
    kind: String,
    dest: Option<String>,
    noecho: bool,
    value: String,
) {
    let permissions = client.permissions();
    if !permissions.message {
        client
            .error_message("not-authorised", "not allowed to send messages")
            .await;
        return;
    }
    let Some(group) = client.group() else {
        client.error_message("not-joined", "join a group first").await;
        return;
    };

    let time = Utc::now();
    let msg = ClientMessage::Chat {
        kind: kind.clone(),
        source: client.id.clone(),
        username: client.username(),
        dest: dest.clone(),
        privileged: permissions.op,
        time: Some(time),
        noecho,
        value: value.clone(),
    };

    match dest {
        Some(dest_id) => {
            if let Some(target) = group.get_client(&dest_id) {
                target.send(msg.clone()).await;
                if !noecho && dest_id != client.id {
                    client.send(msg).await;
                }
            } else {
                client
                    .error_message("unknown-user", "no such user in this group")
                    .await;
            }
        }
        None => {
            group.add_chat(ChatEntry {
                source: client.id.clone(),
                username: client.username(),
                kind,
                time,
                value,
            });
            for member in group.members() {
                if noecho && member.id == client.id {
                    continue;
                }
                member.send(msg.clone()).await;
            }
        }
    }
}

async fn handle_useraction(
    client: &Arc<Client>,
    kind: UserActionKind,
    dest: String,
    value: Option<serde_json::Value>,
) -> Result<()> {
    let permissions = client.permissions();
    let Some(group) = client.group() else {
        client.error_message("not-joined", "join a group first").await;
        return Ok(());
    };
    if !permissions.op {
        client
            .error_message("not-authorised", "this action requires operator rights")
            .await;
        return Ok(());
    }
    let Some(target) = group.get_client(&dest) else {
        client
            .error_message("unknown-user", "no such user in this group")
            .await;
        return Ok(());
    };

    match kind {
        UserActionKind::Kick => {
            let message = value
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            target
                .post(Action::Kick {
                    by_id: client.id.clone(),
                    by_username: client.username(),
                    message,
                })
                .await;
        }
        UserActionKind::Op
        | UserActionKind::Unop
        | UserActionKind::Present
        | UserActionKind::Unpresent => {
            let mut p = target.permissions();
            match kind {
                UserActionKind::Op => {
                    p.op = true;
                    p.record = group.description().allow_recording;
                }
                UserActionKind::Unop => {
                    p.op = false;
                    p.record = false;
                }
                UserActionKind::Present => p.present = true,
                UserActionKind::Unpresent => p.present = false,
                _ => unreachable!(),
            }
            target.set_permissions(p);
            target.post(Action::PermissionsChanged).await;
            for member in group.members() {
                member.send(target.user_entry(UserKind::Change)).await;
            }
        }
        UserActionKind::Setdata => {
            if let Some(serde_json::Value::Object(map)) = value {
                let mut data = target.data.lock();
                for (k, v) in map {
                    data.insert(k, v);
                }
            }
            for member in group.members() {
                member.send(target.user_entry(UserKind::Change)).await;
            }
        }
    }
    Ok(())
}

async fn handle_groupaction(
    state: &Arc<AppState>,
    client: &Arc<Client>,
    kind: GroupActionKind,
    value: Option<serde_json::Value>,
) -> Result<()> {
    let permissions = client.permissions();
    let Some(group) = client.group() else {
        client.error_message("not-joined", "join a group first").await;
        return Ok(());
    };

    match kind {
        GroupActionKind::Clearchat => {
            if !permissions.op {
                client.error_message("not-authorised", "operator only").await;
                return Ok(());
            }
            group.clear_chat_history();
            let msg = ClientMessage::UserMessage {
                kind: "clearchat".to_owned(),
                source: Some(client.id.clone()),
                username: client.username(),
                dest: None,
                privileged: true,
                value: None,
            };
            for member in group.members() {
                member.send(msg.clone()).await;
            }
        }
        GroupActionKind::Lock | GroupActionKind::Unlock => {
            if !permissions.op {
                client.error_message("not-authorised", "operator only").await;
                return Ok(());
            }
            if kind == GroupActionKind::Lock {
                let message = value
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default();
                group.set_locked(Some(message));
            } else {
                group.unlock();
            }
        }
        GroupActionKind::Record | GroupActionKind::Unrecord => {
            if !permissions.record {
                client.error_message("not-authorised", "recording not allowed").await;
                return Ok(());
            }
            client
                .error_message("not-implemented", "recording is not supported by this server")
                .await;
        }
        GroupActionKind::Subgroups => {
            if !group.description().allow_subgroups {
                client
                    .error_message("not-authorised", "this group has no subgroups")
                    .await;
                return Ok(());
            }
            let prefix = format!("{}/", group.name());
            let names: Vec<serde_json::Value> = state
                .groups
                .public_statuses(&state.base_url())
                .into_iter()
                .filter(|s| s.name.starts_with(&prefix))
                .map(|s| serde_json::Value::String(s.name))
                .collect();
            client
                .send(ClientMessage::UserMessage {
                    kind: "info".to_owned(),
                    source: None,
                    username: None,
                    dest: Some(client.id.clone()),
                    privileged: false,
                    value: Some(serde_json::Value::Array(names)),
                })
                .await;
        }
        GroupActionKind::Setdata => {
            if !permissions.op {
                client.error_message("not-authorised", "operator only").await;
                return Ok(());
            }
            if let Some(value) = value {
                group.merge_data(&value);
                tracing::debug!(group = %group.name(), data = ?group.data(), "Group data updated");
            }
        }
    }
    Ok(())
}

/// Bring this client's down-connections in line with its requested
/// labels and whatever the rest of the group currently publishes.
async fn resync_subscriptions(state: &Arc<AppState>, client: &Arc<Client>) {
    let Some(group) = client.group() else { return };
    for member in group.members() {
        if member.id == client.id {
            continue;
        }
        for conn in member.up_connections() {
            if conn.complete() {
                ensure_down(state, client, &conn).await;
            }
        }
    }
}

/// Locate the up-connection behind a stream id among the other members
/// of this client's group.
fn find_published_stream(client: &Arc<Client>, id: &str) -> Option<Arc<UpConnection>> {
    let group = client.group()?;
    for member in group.members() {
        if member.id == client.id {
            continue;
        }
        if let Some(conn) = member.up.lock().get(id) {
            return Some(conn.clone());
        }
    }
    None
}

/// Create, retarget or drop the down-connection for one published
/// stream according to the subscriber's requested track kinds.
async fn ensure_down(state: &Arc<AppState>, client: &Arc<Client>, up_conn: &Arc<UpConnection>) {
    let kinds = client.requested_kinds(up_conn.label.as_deref());
    let desired = select_tracks(&up_conn.tracks(), &kinds);
    let existing = client.down.lock().get(&up_conn.id).cloned();

    match existing {
        Some(conn) if desired.is_empty() => {
            close_down(client, &conn, true).await;
        }
        Some(conn) => {
            if conn.tracks().len() == desired.len() {
                switch_sources(&conn, &desired).await;
            } else {
                close_down(client, &conn, false).await;
                create_down(state, client, up_conn, &desired).await;
            }
        }
        None if desired.is_empty() => {}
        None => {
            create_down(state, client, up_conn, &desired).await;
        }
    }
}

/// Pick the up-tracks matching the requested kinds. `video-low`
/// selects the low simulcast layer when the publisher provides one.
fn select_tracks(tracks: &[Arc<UpTrack>], kinds: &[TrackRequest]) -> Vec<Arc<UpTrack>> {
    let want_audio = kinds.contains(&TrackRequest::Audio);
    let want_video = kinds.contains(&TrackRequest::Video);
    let want_low = kinds.contains(&TrackRequest::VideoLow);

    let mut out = Vec::new();
    if want_audio {
        out.extend(
            tracks
                .iter()
                .filter(|t| t.kind == RTPCodecType::Audio)
                .cloned(),
        );
    }
    if want_video || want_low {
        let low = tracks
            .iter()
            .find(|t| t.kind == RTPCodecType::Video && t.label == "video-low");
        let high: Vec<_> = tracks
            .iter()
            .filter(|t| t.kind == RTPCodecType::Video && t.label == "video")
            .cloned()
            .collect();
        match (want_low, low) {
            (true, Some(low)) => out.push(low.clone()),
            _ => {
                if !high.is_empty() {
                    out.extend(high);
                } else if let Some(low) = low {
                    out.push(low.clone());
                }
            }
        }
    }
    out
}

/// Re-home existing down-tracks onto the desired up-tracks without
/// renegotiating either side (simulcast layer switches).
async fn switch_sources(conn: &Arc<DownConnection>, desired: &[Arc<UpTrack>]) {
    for down in conn.tracks() {
        let want = desired.iter().find(|u| u.kind == down.kind);
        match want {
            None => {
                if let Some(current) = down.source() {
                    current.detach(&down).await;
                }
                down.clear_source();
            }
            Some(up) => {
                let current = down.source();
                let changed = current.as_ref().is_none_or(|c| !Arc::ptr_eq(c, up));
                if changed {
                    if let Some(current) = current {
                        current.detach(&down).await;
                    }
                    down.set_source(up);
                    up.attach(down.clone()).await;
                }
            }
        }
    }
}

async fn create_down(
    state: &Arc<AppState>,
    client: &Arc<Client>,
    up_conn: &Arc<UpConnection>,
    tracks: &[Arc<UpTrack>],
) {
    let Some(group) = client.group() else { return };
    let conn = match DownConnection::new(
        group.api(),
        &state.config.ice,
        up_conn.id.clone(),
        up_conn.label.clone(),
        up_conn.client_id.clone(),
        client.id.clone(),
        client.actions_sender(),
    )
    .await
    {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(conn = %up_conn.id, "Failed to create down connection: {e}");
            return;
        }
    };

    for up in tracks {
        if let Err(e) = conn.add_track(up).await {
            tracing::warn!(conn = %conn.id, "Failed to add down-track: {e}");
            conn.close().await;
            return;
        }
    }
    tokio::spawn(crate::conn::down::sr_sender_loop(conn.clone()));

    client.down.lock().insert(conn.id.clone(), conn.clone());
    send_down_offer(client, &conn, false).await;
}

async fn send_down_offer(client: &Arc<Client>, conn: &Arc<DownConnection>, ice_restart: bool) {
    let username = client
        .group()
        .and_then(|g| g.get_client(&conn.source_client))
        .and_then(|c| c.username());
    match conn.create_offer(ice_restart).await {
        Ok(sdp) => {
            client
                .send(ClientMessage::Offer {
                    id: conn.id.clone(),
                    label: conn.label.clone(),
                    replace: None,
                    source: Some(conn.source_client.clone()),
                    username,
                    labels: None,
                    sdp,
                })
                .await;
        }
        Err(e) => {
            tracing::warn!(conn = %conn.id, "Failed to create down offer: {e}");
            close_down(client, conn, true).await;
        }
    }
}

async fn handle_request_stream(
    state: &Arc<AppState>,
    client: &Arc<Client>,
    id: String,
    request: Vec<TrackRequest>,
) {
    // remember the per-stream choice under the stream's label
    let conn = client.down.lock().get(&id).cloned();
    let Some(conn) = conn else {
        tracing::debug!(conn = %id, "requestStream for unknown stream");
        return;
    };
    let label = conn.label.clone().unwrap_or_default();
    client.requested.lock().insert(label, request);

    if let Some(up) = find_published_stream(client, &id) {
        ensure_down(state, client, &up).await;
    }
}

async fn close_down(client: &Arc<Client>, conn: &Arc<DownConnection>, send_close: bool) {
    client.down.lock().remove(&conn.id);
    conn.close().await;
    if send_close {
        client
            .send(ClientMessage::Close {
                id: conn.id.clone(),
            })
            .await;
    }
}

async fn close_up(
    _state: &Arc<AppState>,
    client: &Arc<Client>,
    conn: &Arc<UpConnection>,
    notify_group: bool,
) {
    client.up.lock().remove(&conn.id);
    conn.close().await;
    if let Some(group) = client.group() {
        if conn.video_counted.load(Ordering::Relaxed) {
            group.del_video_publisher();
        }
        if notify_group {
            notify_stream_closed(&group, client, &conn.id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> Arc<AppState> {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let dir = std::env::temp_dir().join(format!(
            "palaver-client-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("room.json"),
            r#"{"allow-anonymous": true, "presenter": [{}]}"#,
        )
        .unwrap();

        let api = Arc::new(crate::engine::build_api().unwrap());
        let mut config = palaver_protocol::PalaverConfig::default();
        config.groups.dir = dir.to_str().unwrap().to_owned();
        let groups = crate::group::Groups::new(api, &config.groups.dir, 20);
        Arc::new(AppState {
            config,
            groups,
            started_at: std::time::Instant::now(),
        })
    }

    #[tokio::test]
    async fn duplicate_client_id_is_fatal() {
        let state = test_state();
        let (first, _first_channels) = Client::for_tests("dup");
        let (second, mut second_channels) = Client::for_tests("dup");

        let joined = handle_join(&state, &first, "room".to_owned(), None, None, None).await;
        assert!(joined.is_ok());
        assert!(first.group().is_some());

        // the same id on a second connection is a protocol error: the
        // join fails AND the connection must be torn down
        let joined = handle_join(&state, &second, "room".to_owned(), None, None, None).await;
        assert!(joined.is_err());
        match second_channels.outbox_rx.recv().await {
            Some(Outgoing::Message(msg)) => {
                let json = serde_json::to_string(&*msg).unwrap();
                assert!(json.contains(r#""kind":"fail""#));
                assert!(json.contains(r#""error":"duplicate-id""#));
            }
            _ => panic!("expected the joined/fail reply"),
        }
    }

    #[tokio::test]
    async fn kick_sends_message_then_closes_normally() {
        let state = test_state();
        let (client, mut channels) = Client::for_tests("victim");

        let result = handle_action(
            &state,
            &client,
            Action::Kick {
                by_id: "op-id".to_owned(),
                by_username: Some("op".to_owned()),
                message: "be nice".to_owned(),
            },
        )
        .await;
        assert!(result.is_err(), "kick must terminate the event loop");

        // first the kicked notice...
        match channels.outbox_rx.recv().await {
            Some(Outgoing::Message(msg)) => {
                let json = serde_json::to_string(&*msg).unwrap();
                assert!(json.contains(r#""type":"usermessage""#));
                assert!(json.contains(r#""kind":"kicked""#));
                assert!(json.contains("be nice"));
            }
            _ => panic!("expected the kicked usermessage first"),
        }
        // ...then a normal-status close
        match channels.outbox_rx.recv().await {
            Some(Outgoing::Close { code, .. }) => assert_eq!(code, 1000),
            _ => panic!("expected a close frame"),
        }
    }

    #[tokio::test]
    async fn stream_closed_without_subscription_is_harmless() {
        let state = test_state();
        let (client, _channels) = Client::for_tests("c");
        let result = handle_action(
            &state,
            &client,
            Action::StreamClosed {
                id: "nonexistent".to_owned(),
            },
        )
        .await;
        assert!(result.is_ok());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn requested_kinds_fall_back_to_default_label() {
        let (client, _channels) = Client::for_tests("c");
        client.requested.lock().insert(
            String::new(),
            vec![TrackRequest::Audio, TrackRequest::Video],
        );
        client
            .requested
            .lock()
            .insert("screenshare".to_owned(), vec![TrackRequest::Video]);

        assert_eq!(
            client.requested_kinds(Some("screenshare")),
            vec![TrackRequest::Video]
        );
        assert_eq!(
            client.requested_kinds(Some("camera")),
            vec![TrackRequest::Audio, TrackRequest::Video]
        );
        assert_eq!(
            client.requested_kinds(None),
            vec![TrackRequest::Audio, TrackRequest::Video]
        );
    }

    #[tokio::test]
    async fn send_unblocks_on_done() {
        let (client, _channels) = Client::for_tests("c");
        // fill the outbox without draining it
        while client.outbox_tx.try_send(Outgoing::Pong(Vec::new())).is_ok() {}
        client.done.cancel();
        // must return immediately instead of blocking on the full channel
        client.send(ClientMessage::Ping).await;
    }

    #[tokio::test]
    async fn user_entry_carries_permissions() {
        let (client, _channels) = Client::for_tests("c");
        client.set_permissions(Permissions {
            op: true,
            present: true,
            record: false,
            message: true,
            token: false,
        });
        *client.username.lock() = Some("alice".to_owned());
        let msg = client.user_entry(UserKind::Add);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"user""#));
        assert!(json.contains(r#""kind":"add""#));
        assert!(json.contains(r#""permissions":["op","present","message"]"#));
    }
}
