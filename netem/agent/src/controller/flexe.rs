//! Flexe controller: drives a remote impairment engine instead of the
//! local kernel.
//!
//! Two channels to the engine: a WebSocket carrying JSON messages in both
//! directions (filter programming, live counters) and a REST side channel
//! for profile CRUD. The outbound socket half is owned by a writer task
//! fed through a queue; the inbound half by a reader task updating the
//! shared engine state.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use netem_crd::ControllerKind;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::{
    env,
    error::{AgentError, AgentResult},
    profile::ProfileHandle,
};

use super::{ImpairmentController, MarkPool, ProfileRegistry};

#[derive(Clone, Debug)]
pub struct FlexeOptions {
    pub host: String,
    pub rest_port: u16,
    pub ws_port: u16,
    pub user: String,
    pub password: String,
}

impl FlexeOptions {
    pub fn from_env() -> Self {
        Self {
            host: env::flexe_host(),
            rest_port: env::flexe_rest_port(),
            ws_port: env::flexe_ws_port(),
            user: env::flexe_user(),
            password: env::flexe_password(),
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.ws_port)
    }

    fn profiles_url(&self) -> String {
        format!("http://{}:{}/flexe/profiles", self.host, self.rest_port)
    }
}

/// Byte position of one field inside the engine's packed filter key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSlot {
    pub offset: usize,
    pub len: usize,
}

/// State pushed by the engine over the socket.
#[derive(Debug, Default)]
pub struct EngineState {
    layout: HashMap<String, FieldSlot>,
    total_len: usize,
    /// `(name, bitmask, index)` triples from `NewInterface`.
    interfaces: Vec<(String, u64, i64)>,
}

/// Fold a `GetPacking` result into field slots and the total key length.
fn packing_layout(fields: &[(u32, String, String, String)]) -> (HashMap<String, FieldSlot>, usize) {
    let mut layout = HashMap::new();
    let mut offset = 0;

    for (len, _type, name, _description) in fields {
        layout.insert(
            name.clone(),
            FieldSlot {
                offset,
                len: *len as usize,
            },
        );
        offset += *len as usize;
    }

    (layout, offset)
}

/// Pack a fwmark into the engine's filter key format: the mark's
/// big-endian bytes at the field's slot, everything else zero. The mask
/// covers exactly the slot.
fn pack_mark(slot: FieldSlot, total_len: usize, mark: u32) -> (Vec<u8>, Vec<u8>) {
    let mut key = vec![0u8; total_len];
    let mut mask = vec![0u8; total_len];

    let bytes = mark.to_be_bytes();
    let take = slot.len.min(bytes.len());
    key[slot.offset + slot.len - take..slot.offset + slot.len]
        .copy_from_slice(&bytes[bytes.len() - take..]);

    for byte in &mut mask[slot.offset..slot.offset + slot.len] {
        *byte = 0xff;
    }

    (key, mask)
}

/// Dispatch one inbound frame.
fn handle_frame(state: &Mutex<EngineState>, text: &str) -> AgentResult<()> {
    let frame: Value =
        serde_json::from_str(text).map_err(|e| AgentError::Protocol(format!("bad frame: {e}")))?;

    let Some(id) = frame.get("id").and_then(Value::as_str) else {
        return Err(AgentError::Protocol("frame without id".to_string()));
    };

    match id {
        "GetPacking" => {
            let fields: Vec<(u32, String, String, String)> =
                serde_json::from_value(frame.get("result").cloned().unwrap_or_default())
                    .map_err(|e| AgentError::Protocol(format!("bad GetPacking result: {e}")))?;

            let (layout, total_len) = packing_layout(&fields);
            tracing::debug!(?layout, total_len, "Received packing layout");

            let mut state = state.lock().unwrap();
            state.layout = layout;
            state.total_len = total_len;
        }
        "NewInterface" => {
            let interfaces: Vec<(String, u64, i64)> =
                serde_json::from_value(frame.get("result").cloned().unwrap_or_default())
                    .map_err(|e| AgentError::Protocol(format!("bad NewInterface result: {e}")))?;

            tracing::debug!(?interfaces, "Received engine interfaces");
            state.lock().unwrap().interfaces = interfaces;
        }
        "filter" => {
            // per-filter counters, `(0, 0, 0, ts)` rows are heartbeats
            tracing::trace!(fid = ?frame.get("fid"), "Received filter counters");
        }
        "SetFilters" | "RunApplication" | "ProfileTemplate" => {
            tracing::debug!(id, "Ignoring engine acknowledgement");
        }
        other => {
            return Err(AgentError::Protocol(format!("unknown message id {other}")));
        }
    }

    Ok(())
}

pub struct FlexeController {
    interface: String,
    marks: MarkPool,
    registry: ProfileRegistry,
    options: FlexeOptions,
    state: Arc<Mutex<EngineState>>,
    tx: mpsc::Sender<Message>,
    fid: u64,
    http: reqwest::Client,
    remote_profiles: HashMap<String, Value>,
    cancel: CancellationToken,
}

impl FlexeController {
    #[tracing::instrument(level = Level::DEBUG, skip(marks, options), err)]
    pub async fn connect(
        interface: &str,
        marks: MarkPool,
        options: FlexeOptions,
    ) -> AgentResult<Self> {
        let (socket, _) = connect_async(options.ws_url()).await?;
        let (sink, stream) = socket.split();

        let (tx, rx) = mpsc::channel(64);
        let state = Arc::new(Mutex::new(EngineState::default()));
        let cancel = CancellationToken::new();

        tokio::spawn(write_loop(sink, rx, cancel.child_token()));
        tokio::spawn(read_loop(stream, state.clone(), tx.clone(), cancel.child_token()));

        let mut ctrl = Self {
            interface: interface.to_string(),
            marks,
            registry: ProfileRegistry::default(),
            options,
            state,
            tx,
            fid: 1,
            http: reqwest::Client::new(),
            remote_profiles: HashMap::new(),
            cancel,
        };

        ctrl.send(json!({ "id": "GetPacking", "user": ctrl.options.user }))
            .await?;
        ctrl.fetch_remote_profiles().await?;

        Ok(ctrl)
    }

    async fn send(&self, message: Value) -> AgentResult<()> {
        self.tx
            .send(Message::Text(message.to_string()))
            .await
            .map_err(|_| AgentError::Protocol("engine writer task is gone".to_string()))
    }

    /// Fetch the profile list and every profile's segment data over REST.
    async fn fetch_remote_profiles(&mut self) -> AgentResult<()> {
        let url = self.options.profiles_url();
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.options.user, Some(&self.options.password))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AgentError::Protocol(format!(
                "profile listing failed with status {}",
                response.status()
            )));
        }

        let body: Value = response.json().await?;
        let names: Vec<String> =
            serde_json::from_value(body.get("result").cloned().unwrap_or_default())
                .unwrap_or_default();

        for name in names {
            let info = self.fetch_remote_profile(&name).await?;
            self.remote_profiles.insert(name, info);
        }

        tracing::info!(profiles = self.remote_profiles.len(), "Fetched engine profiles");

        Ok(())
    }

    async fn fetch_remote_profile(&self, name: &str) -> AgentResult<Value> {
        let url = format!("{}/{name}", self.options.profiles_url());
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.options.user, Some(&self.options.password))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AgentError::Protocol(format!(
                "fetching profile {name} failed with status {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    /// Upload a segment set under the given name.
    pub async fn upload_profile(&mut self, name: &str, body: &Value) -> AgentResult<()> {
        let url = format!("{}/{name}", self.options.profiles_url());
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.options.user, Some(&self.options.password))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AgentError::Protocol(format!(
                "uploading profile {name} failed with status {}",
                response.status()
            )));
        }

        self.remote_profiles.insert(name.to_string(), body.clone());

        Ok(())
    }

    /// Remote profile name a driven profile refers to.
    fn remote_name(profile: &ProfileHandle) -> Option<String> {
        profile
            .parameters
            .get("flexe")
            .and_then(|block| block.get("profile"))
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// Push the current profile set to the engine: filters keyed on each
    /// profile's mark, then the application run referencing the segment
    /// sets. An empty set stops the engine.
    async fn apply(&mut self) -> AgentResult<()> {
        if self.registry.is_empty() {
            self.fid += 1;

            return self
                .send(json!({
                    "id": "RunApplication",
                    "user": self.options.user,
                    "fid": self.fid,
                    "profile_data": {},
                }))
                .await;
        }

        let (slot, total_len, bitmask) = {
            let state = self.state.lock().unwrap();

            let Some(slot) = state.layout.get("fwmark").copied() else {
                return Err(AgentError::Protocol(
                    "packing not yet received from engine".to_string(),
                ));
            };

            let bitmask = state
                .interfaces
                .iter()
                .find(|(name, _, _)| *name == self.interface)
                .map(|(_, bitmask, _)| *bitmask);

            (slot, state.total_len, bitmask)
        };

        let Some(bitmask) = bitmask else {
            return Err(AgentError::Protocol(format!(
                "engine does not know interface {}",
                self.interface
            )));
        };

        let mut filters = Vec::new();
        let mut profiles = Vec::new();
        let mut profile_data = serde_json::Map::new();

        let handles: Vec<ProfileHandle> = self.registry.iter().cloned().collect();
        for profile in handles {
            let Some(name) = Self::remote_name(&profile) else {
                tracing::warn!(profile = %profile.name, "Profile names no engine profile, skipping");
                continue;
            };

            if !self.remote_profiles.contains_key(&name) {
                let info = self.fetch_remote_profile(&name).await?;
                self.remote_profiles.insert(name.clone(), info);
            }
            let info = self.remote_profiles[&name].clone();

            let (key, mask) = pack_mark(slot, total_len, profile.mark);
            filters.push(json!([
                BASE64.encode(&key),
                BASE64.encode(&mask),
                0,
                bitmask,
                true,
            ]));

            profiles.push(json!(["", name]));
            profile_data.insert(
                name,
                json!({
                    "segments": [info],
                    "run": { "start": 0, "end": 1 },
                }),
            );
        }

        self.fid += 1;

        self.send(json!({
            "id": "SetFilters",
            "user": self.options.user,
            "fid": self.fid,
            "filters": filters,
        }))
        .await?;

        self.send(json!({
            "id": "RunApplication",
            "user": self.options.user,
            "fid": self.fid,
            "profiles": profiles,
            "profile_data": profile_data,
        }))
        .await
    }
}

async fn write_loop(
    mut sink: impl futures::Sink<Message> + Unpin,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => message,
        };

        let Some(message) = message else { break };

        if sink.send(message).await.is_err() {
            tracing::warn!("Engine socket write failed, stopping writer");
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

async fn read_loop(
    mut stream: impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
    state: Arc<Mutex<EngineState>>,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            None | Some(Ok(Message::Close(_))) => {
                tracing::info!("Engine socket closed");
                break;
            }
            Some(Ok(Message::Text(text))) => {
                // a malformed frame is logged and the channel stays open
                if let Err(error) = handle_frame(&state, &text) {
                    tracing::warn!(%error, "Dropping engine frame");
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = tx.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                tracing::warn!(%error, "Engine socket read failed");
                break;
            }
        }
    }
}

#[async_trait]
impl ImpairmentController for FlexeController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Flexe
    }

    fn get_mark(&self) -> u32 {
        self.marks.next()
    }

    fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, profile), fields(profile = %profile.name), err)]
    async fn add_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        self.registry.insert_new(profile)?;
        self.apply().await
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, profile), fields(profile = %profile.name), err)]
    async fn update_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        self.registry.replace(profile)?;
        self.apply().await
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, profile), fields(profile = %profile.name), err)]
    async fn remove_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        self.registry.remove(profile)?;
        self.apply().await
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self), err)]
    async fn deinit(&mut self) -> AgentResult<()> {
        self.cancel.cancel();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(spec: &[(u32, &str)]) -> Vec<(u32, String, String, String)> {
        spec.iter()
            .map(|(len, name)| (*len, "int".to_string(), name.to_string(), String::new()))
            .collect()
    }

    #[test]
    fn layout_accumulates_offsets() {
        let (layout, total) = packing_layout(&fields(&[(2, "proto"), (4, "fwmark"), (2, "port")]));

        assert_eq!(total, 8);
        assert_eq!(layout["proto"], FieldSlot { offset: 0, len: 2 });
        assert_eq!(layout["fwmark"], FieldSlot { offset: 2, len: 4 });
        assert_eq!(layout["port"], FieldSlot { offset: 6, len: 2 });
    }

    #[test]
    fn mark_is_packed_big_endian_into_its_slot() {
        let slot = FieldSlot { offset: 2, len: 4 };
        let (key, mask) = pack_mark(slot, 8, 1000);

        assert_eq!(key, vec![0, 0, 0, 0, 0x03, 0xe8, 0, 0]);
        assert_eq!(mask, vec![0, 0, 0xff, 0xff, 0xff, 0xff, 0, 0]);
    }

    #[test]
    fn packing_frame_updates_the_shared_state() {
        let state = Mutex::new(EngineState::default());

        handle_frame(
            &state,
            &json!({
                "id": "GetPacking",
                "result": [[4, "int", "fwmark", "firewall mark"]],
            })
            .to_string(),
        )
        .unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.total_len, 4);
        assert_eq!(state.layout["fwmark"], FieldSlot { offset: 0, len: 4 });
    }

    #[test]
    fn interface_frame_updates_the_shared_state() {
        let state = Mutex::new(EngineState::default());

        handle_frame(
            &state,
            &json!({
                "id": "NewInterface",
                "result": [["eth0", 1, 2], ["eth1", 2, 3]],
            })
            .to_string(),
        )
        .unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.interfaces.len(), 2);
        assert_eq!(state.interfaces[0], ("eth0".to_string(), 1, 2));
    }

    #[test]
    fn unknown_ids_and_garbage_are_protocol_errors() {
        let state = Mutex::new(EngineState::default());

        assert!(matches!(
            handle_frame(&state, "{\"id\": \"Bogus\"}"),
            Err(AgentError::Protocol(_))
        ));
        assert!(matches!(
            handle_frame(&state, "not json"),
            Err(AgentError::Protocol(_))
        ));
        assert!(matches!(
            handle_frame(&state, "{\"result\": []}"),
            Err(AgentError::Protocol(_))
        ));
    }

    #[test]
    fn counter_frames_are_accepted() {
        let state = Mutex::new(EngineState::default());

        handle_frame(
            &state,
            &json!({
                "id": "filter",
                "fid": 3,
                "cnt": [[0, 0, 0, 1234567]],
            })
            .to_string(),
        )
        .unwrap();
    }

    #[test]
    fn remote_name_comes_from_the_flexe_block() {
        let profile = ProfileHandle {
            uid: "u".into(),
            name: "p".into(),
            mark: 1000,
            parameters: json!({"flexe": {"profile": "lte-handover"}}),
        };

        assert_eq!(
            FlexeController::remote_name(&profile).as_deref(),
            Some("lte-handover")
        );

        let bare = ProfileHandle {
            parameters: Value::Null,
            ..profile
        };
        assert_eq!(FlexeController::remote_name(&bare), None);
    }
}
