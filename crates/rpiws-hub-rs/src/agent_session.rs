//! Broker side of one agent connection.
//!
//! Mirrors the agent's phases on a [`StateStack`]: `Register` (challenge and
//! response), `Config` (push bindings, wait for `CONFIG_OK`) and `Stream`
//! (transform frames, grant credit, relay writes). Handlers never touch the
//! socket; everything they want sent or announced lands in an [`Outbox`]
//! that the registry flushes.

use indexmap::IndexMap;
use rpiws_core::auth::Challenge;
use rpiws_core::binding::{merge_bindings, BindingMap, BindingRequest};
use rpiws_core::buffer::DeltaBuffer;
use rpiws_core::expr::{Equation, ExprError};
use rpiws_core::flow::AckCounter;
use rpiws_core::protocol::{
    decode_message, peek_cmd, AgentPresence, AgentToBroker, BrokerToAgent, ConfigPayload,
    InterfaceDescriptor, RegisterRequest, TokenPayload, ValueMap, WriteSample,
};
use rpiws_core::session::{Lifecycle, SessionError, StateStack, Transition};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEffect {
    /// Handshake completed; `mac` and the interface descriptor are final.
    Registered,
    Presence(AgentPresence),
    NewData,
}

#[derive(Debug, Default)]
pub struct Outbox {
    pub messages: Vec<BrokerToAgent>,
    pub effects: Vec<AgentEffect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Register,
    Config,
    Stream,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Register => "register",
            Phase::Config => "config",
            Phase::Stream => "stream",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub secret: Arc<[u8]>,
    pub max_message_bytes: usize,
}

#[derive(Debug)]
struct Shared {
    settings: SessionSettings,
    mac: Option<String>,
    inter_face: InterfaceDescriptor,
}

impl Shared {
    fn mac(&self) -> &str {
        self.mac.as_deref().unwrap_or("-")
    }
}

#[derive(Debug)]
enum BrokerState {
    Register(RegisterState),
    Config(ConfigState),
    Stream(Box<StreamState>),
}

impl Lifecycle<Outbox> for BrokerState {
    fn activated(&mut self, out: &mut Outbox) {
        match self {
            BrokerState::Register(_) => {}
            BrokerState::Config(_) => out.effects.push(AgentEffect::Presence(AgentPresence::Config)),
            BrokerState::Stream(_) => out.effects.push(AgentEffect::Presence(AgentPresence::Stream)),
        }
    }
}

#[derive(Debug, Default)]
enum RegisterStep {
    #[default]
    AwaitingRequest,
    AwaitingResponse(Challenge),
}

#[derive(Debug, Default)]
struct RegisterState {
    step: RegisterStep,
}

impl RegisterState {
    fn on_message(
        &mut self,
        shared: &mut Shared,
        raw: &str,
        out: &mut Outbox,
    ) -> Result<Transition<BrokerState>, SessionError> {
        let max = shared.settings.max_message_bytes;
        if let RegisterStep::AwaitingResponse(challenge) = &self.step {
            let AgentToBroker::Auth { payload } = decode_message(raw, max)? else {
                return Err(SessionError::ProtocolViolation(
                    "expected AUTH response".to_string(),
                ));
            };
            if challenge.verify(&payload.token).is_err() {
                return Err(SessionError::AuthenticationFailed {
                    mac: shared.mac().to_string(),
                });
            }
            out.messages.push(BrokerToAgent::Ack);
            out.effects.push(AgentEffect::Registered);
            return Ok(Transition::Push(BrokerState::Config(ConfigState::default())));
        }

        if let Some(cmd) = peek_cmd(raw, max)? {
            debug!(event = "register_ignored", cmd = %cmd);
            return Ok(Transition::Stay);
        }
        let request: RegisterRequest = decode_message(raw, max)?;
        if request.mac.trim().is_empty() {
            return Err(SessionError::ProtocolViolation(
                "registration without mac".to_string(),
            ));
        }
        let challenge = Challenge::issue(&shared.settings.secret, &request.mac);
        out.messages.push(BrokerToAgent::Auth {
            payload: TokenPayload {
                token: challenge.token().to_string(),
            },
        });
        shared.mac = Some(request.mac);
        shared.inter_face = request.inter_face;
        self.step = RegisterStep::AwaitingResponse(challenge);
        Ok(Transition::Stay)
    }
}

/// Waits to be configured. The broker may leave an agent here indefinitely.
///
/// Only one `CONFIG` is ever in flight. A configuration requested before
/// the agent answers is held in `queued` and applied through drop-to-config
/// once the first one is confirmed.
#[derive(Debug, Default)]
struct ConfigState {
    pending: Option<ConfigPayload>,
    queued: Option<ConfigPayload>,
}

impl ConfigState {
    fn on_message(
        &mut self,
        shared: &Shared,
        raw: &str,
        out: &mut Outbox,
    ) -> Result<Transition<BrokerState>, SessionError> {
        match decode_message(raw, shared.settings.max_message_bytes)? {
            AgentToBroker::ConfigOk => match self.pending.take() {
                Some(config) => {
                    let mut stream = StreamState::new(config);
                    if let Some(next) = self.queued.take() {
                        stream.drop_to_config(next, out);
                    }
                    Ok(Transition::Push(BrokerState::Stream(Box::new(stream))))
                }
                None => {
                    warn!(event = "config_ok_unsolicited", mac = %shared.mac());
                    Ok(Transition::Stay)
                }
            },
            AgentToBroker::ConfigFail => {
                warn!(event = "config_failed", mac = %shared.mac());
                self.pending = None;
                if let Some(next) = self.queued.take() {
                    self.send_config(next, out);
                }
                Ok(Transition::Stay)
            }
            other => {
                debug!(event = "message_ignored", state = "config", msg = ?other);
                Ok(Transition::Stay)
            }
        }
    }

    fn send_config(&mut self, config: ConfigPayload, out: &mut Outbox) {
        if self.pending.is_some() {
            debug!(event = "config_queued");
            self.queued = Some(config);
            return;
        }
        out.messages.push(BrokerToAgent::Config {
            payload: config.clone(),
        });
        self.pending = Some(config);
    }
}

#[derive(Debug)]
struct StreamState {
    read_bindings: BindingMap,
    write_bindings: BindingMap,
    equations: HashMap<String, Result<Equation, ExprError>>,
    read_eq: DeltaBuffer<String, Value>,
    write_eq: DeltaBuffer<String, WriteSample>,
    /// Equation-qualified write key -> base binding key.
    write_targets: HashMap<String, String>,
    acks: AckCounter,
    resumed: bool,
    /// Configuration waiting for `DROP_TO_CONFIG_OK`.
    deferred: Option<ConfigPayload>,
}

impl StreamState {
    fn new(config: ConfigPayload) -> Self {
        let mut equations = HashMap::new();
        let mut write_targets = HashMap::new();
        for binding in config.read.values().chain(config.write.values()) {
            for source in &binding.equations {
                equations.entry(source.clone()).or_insert_with(|| {
                    let compiled = Equation::parse(source);
                    if let Err(err) = &compiled {
                        warn!(event = "equation_invalid", equation = %source, error = %err);
                    }
                    compiled
                });
            }
        }
        for (key, binding) in &config.write {
            for source in &binding.equations {
                write_targets.insert(binding.equation_key(source), key.clone());
            }
        }
        Self {
            read_bindings: config.read,
            write_bindings: config.write,
            equations,
            read_eq: DeltaBuffer::new(),
            write_eq: DeltaBuffer::new(),
            write_targets,
            acks: AckCounter::default(),
            resumed: false,
            deferred: None,
        }
    }

    fn evaluate(&self, source: &str, value: &Value) -> Value {
        match self.equations.get(source) {
            Some(Ok(equation)) => equation.apply(value).unwrap_or_else(|err| {
                debug!(event = "equation_error", equation = %source, error = %err);
                Value::Null
            }),
            _ => Value::Null,
        }
    }

    fn on_message(
        &mut self,
        shared: &Shared,
        raw: &str,
        out: &mut Outbox,
    ) -> Result<Transition<BrokerState>, SessionError> {
        match decode_message(raw, shared.settings.max_message_bytes)? {
            AgentToBroker::Data { read, write } => {
                self.absorb(read, write);
                if let Some(ack_count) = self.acks.record() {
                    out.messages.push(BrokerToAgent::AckData { ack_count });
                }
                out.effects.push(AgentEffect::NewData);
                Ok(Transition::Stay)
            }
            AgentToBroker::DropToConfigOk => Ok(Transition::Pop),
            other => {
                debug!(event = "message_ignored", state = "stream", msg = ?other);
                Ok(Transition::Stay)
            }
        }
    }

    fn absorb(&mut self, read: ValueMap, write: ValueMap) {
        for (key, value) in read {
            match self.read_bindings.get(&key) {
                Some(binding) => {
                    for source in &binding.equations {
                        let calculated = self.evaluate(source, &value);
                        self.read_eq.insert(binding.equation_key(source), calculated);
                    }
                }
                None => debug!(event = "stale_key", key = %key),
            }
        }
        for (key, value) in write {
            match self.write_bindings.get(&key) {
                Some(binding) => {
                    for source in &binding.equations {
                        let sample = WriteSample {
                            calculated: self.evaluate(source, &value),
                            real: value.clone(),
                        };
                        self.write_eq.insert(binding.equation_key(source), sample);
                    }
                }
                None => debug!(event = "stale_key", key = %key),
            }
        }
    }

    fn drop_to_config(&mut self, config: ConfigPayload, out: &mut Outbox) {
        if self.deferred.is_none() {
            out.messages.push(BrokerToAgent::DropToConfig);
        }
        self.deferred = Some(config);
    }
}

#[derive(Debug)]
pub struct AgentSession {
    shared: Shared,
    stack: StateStack<BrokerState>,
}

impl AgentSession {
    pub fn new(settings: SessionSettings) -> Self {
        let mut stack = StateStack::new();
        stack.push(
            BrokerState::Register(RegisterState::default()),
            &mut Outbox::default(),
        );
        Self {
            shared: Shared {
                settings,
                mac: None,
                inter_face: InterfaceDescriptor::default(),
            },
            stack,
        }
    }

    pub fn mac(&self) -> Option<&str> {
        self.shared.mac.as_deref()
    }

    pub fn inter_face(&self) -> &InterfaceDescriptor {
        &self.shared.inter_face
    }

    pub fn phase(&self) -> Option<Phase> {
        match self.stack.current().ok()? {
            BrokerState::Register(_) => Some(Phase::Register),
            BrokerState::Config(_) => Some(Phase::Config),
            BrokerState::Stream(_) => Some(Phase::Stream),
        }
    }

    pub fn on_message(&mut self, raw: &str, out: &mut Outbox) -> Result<(), SessionError> {
        let transition = match self.stack.current_mut()? {
            BrokerState::Register(state) => state.on_message(&mut self.shared, raw, out)?,
            BrokerState::Config(state) => state.on_message(&self.shared, raw, out)?,
            BrokerState::Stream(state) => state.on_message(&self.shared, raw, out)?,
        };
        // The config that triggered a drop goes out only once the stream
        // state is gone, so new bindings never overlap the old ones.
        if let Some(BrokerState::Stream(mut popped)) = self.stack.apply(transition, out)? {
            if let Some(config) = popped.deferred.take() {
                if let Ok(BrokerState::Config(state)) = self.stack.current_mut() {
                    state.send_config(config, out);
                }
            }
        }
        Ok(())
    }

    /// Applies a new configuration: sent directly in `Config`, via
    /// drop-to-config in `Stream`. Returns false while still registering.
    pub fn configure(
        &mut self,
        reads: &[BindingRequest],
        writes: &[BindingRequest],
        out: &mut Outbox,
    ) -> bool {
        let config = ConfigPayload {
            read: merge_bindings(reads),
            write: merge_bindings(writes),
        };
        match self.stack.current_mut() {
            Ok(BrokerState::Config(state)) => {
                state.send_config(config, out);
                true
            }
            Ok(BrokerState::Stream(state)) => {
                state.drop_to_config(config, out);
                true
            }
            _ => false,
        }
    }

    pub fn resume_streaming(&mut self, out: &mut Outbox) -> bool {
        match self.stack.current_mut() {
            Ok(BrokerState::Stream(state)) => {
                state.resumed = true;
                out.messages.push(BrokerToAgent::ResumeStreaming);
                true
            }
            _ => false,
        }
    }

    pub fn pause_streaming(&mut self, out: &mut Outbox) -> bool {
        match self.stack.current_mut() {
            Ok(BrokerState::Stream(state)) => {
                state.resumed = false;
                out.messages.push(BrokerToAgent::PauseStreaming);
                true
            }
            _ => false,
        }
    }

    /// True while streaming and the agent has been told to resume.
    pub fn is_streaming(&self) -> bool {
        matches!(self.stack.current(), Ok(BrokerState::Stream(state)) if state.resumed)
    }

    /// Forwards a viewer write, translating the equation-qualified key back
    /// to the binding it belongs to. Unknown keys are dropped.
    pub fn write_interface(&self, key: &str, value: Value, out: &mut Outbox) -> bool {
        let Ok(BrokerState::Stream(state)) = self.stack.current() else {
            return false;
        };
        match state.write_targets.get(key) {
            Some(base) => {
                out.messages.push(BrokerToAgent::WriteData {
                    inter_face_port: base.clone(),
                    value,
                });
                true
            }
            None => {
                debug!(event = "write_unknown_key", mac = %self.shared.mac(), key = %key);
                false
            }
        }
    }

    /// Latest transformed read values and write samples.
    pub fn transformed(&self) -> Option<(&ValueMap, &IndexMap<String, WriteSample>)> {
        match self.stack.current() {
            Ok(BrokerState::Stream(state)) => {
                Some((state.read_eq.snapshot(), state.write_eq.snapshot()))
            }
            _ => None,
        }
    }

    pub fn teardown(&mut self) {
        self.stack.clear(&mut Outbox::default());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rpiws_core::auth::sign_challenge;
    use rpiws_core::protocol::DEFAULT_MAX_MESSAGE_BYTES;
    use serde_json::json;

    pub const SECRET: &[u8] = b"test-secret";
    pub const MAC: &str = "AA:BB:CC:DD:EE:FF";

    pub fn settings() -> SessionSettings {
        SessionSettings {
            secret: Arc::from(SECRET),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn register_request(mac: &str) -> String {
        json!({
            "mac": mac,
            "inter_face": {
                "read": [{"name": "Temperature", "desc": "", "choices": [], "io_type": "I"}],
                "write": []
            }
        })
        .to_string()
    }

    pub fn token_of(out: &Outbox) -> String {
        match out.messages.last() {
            Some(BrokerToAgent::Auth { payload }) => payload.token.clone(),
            other => panic!("expected AUTH, got {other:?}"),
        }
    }

    pub fn auth_reply(mac: &str, token: &str) -> String {
        json!({"cmd": "AUTH", "payload": {"token": sign_challenge(SECRET, mac, token)}}).to_string()
    }

    fn registered() -> AgentSession {
        let mut session = AgentSession::new(settings());
        let mut out = Outbox::default();
        session.on_message(&register_request(MAC), &mut out).expect("register");
        let token = token_of(&out);
        session.on_message(&auth_reply(MAC, &token), &mut out).expect("auth");
        session
    }

    fn streaming(reads: &[BindingRequest], writes: &[BindingRequest]) -> AgentSession {
        let mut session = registered();
        let mut out = Outbox::default();
        assert!(session.configure(reads, writes, &mut out));
        session.on_message(r#"{"cmd":"CONFIG_OK"}"#, &mut out).expect("config ok");
        assert_eq!(session.phase(), Some(Phase::Stream));
        session
    }

    #[test]
    fn handshake_registers_and_enters_config() {
        let mut session = AgentSession::new(settings());
        let mut out = Outbox::default();
        session.on_message(&register_request(MAC), &mut out).expect("register");
        let token = token_of(&out);
        assert_eq!(session.mac(), Some(MAC));
        assert_eq!(session.inter_face().read[0].name, "Temperature");

        let mut out = Outbox::default();
        session.on_message(&auth_reply(MAC, &token), &mut out).expect("auth");
        assert_eq!(out.messages, vec![BrokerToAgent::Ack]);
        assert_eq!(
            out.effects,
            vec![AgentEffect::Registered, AgentEffect::Presence(AgentPresence::Config)]
        );
        assert_eq!(session.phase(), Some(Phase::Config));
    }

    #[test]
    fn out_of_order_commands_are_ignored_before_registration() {
        let mut session = AgentSession::new(settings());
        let mut out = Outbox::default();
        session.on_message(r#"{"cmd":"CONFIG_OK"}"#, &mut out).expect("ignored");
        assert!(out.messages.is_empty());
        assert_eq!(session.phase(), Some(Phase::Register));

        session.on_message(&register_request(MAC), &mut out).expect("register");
        assert!(matches!(out.messages[0], BrokerToAgent::Auth { .. }));
    }

    #[test]
    fn wrong_token_fails_authentication() {
        let mut session = AgentSession::new(settings());
        let mut out = Outbox::default();
        session.on_message(&register_request(MAC), &mut out).expect("register");
        let err = session
            .on_message(&auth_reply(MAC, "not-the-token"), &mut out)
            .unwrap_err();
        assert!(matches!(err, SessionError::AuthenticationFailed { ref mac } if mac == MAC));
    }

    #[test]
    fn wrong_command_or_garbage_is_a_violation() {
        let mut session = AgentSession::new(settings());
        let mut out = Outbox::default();
        session.on_message(&register_request(MAC), &mut out).expect("register");
        let err = session.on_message(r#"{"cmd":"CONFIG_OK"}"#, &mut out).unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));

        let mut fresh = AgentSession::new(settings());
        let err = fresh.on_message("{oops", &mut out).unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
    }

    #[test]
    fn config_waits_for_config_ok_before_streaming() {
        let mut session = registered();
        let mut out = Outbox::default();
        let reads = vec![
            BindingRequest::new("Temp", "dev1", "x*2"),
            BindingRequest::new("Temp", "dev1", "x+1"),
        ];
        assert!(session.configure(&reads, &[], &mut out));
        match &out.messages[..] {
            [BrokerToAgent::Config { payload }] => {
                assert_eq!(payload.read.len(), 1);
                assert_eq!(payload.read[0].equations, vec!["x*2", "x+1"]);
            }
            other => panic!("expected CONFIG, got {other:?}"),
        }
        assert_eq!(session.phase(), Some(Phase::Config));

        let mut out = Outbox::default();
        session.on_message(r#"{"cmd":"CONFIG_OK"}"#, &mut out).expect("config ok");
        assert_eq!(session.phase(), Some(Phase::Stream));
        assert_eq!(out.effects, vec![AgentEffect::Presence(AgentPresence::Stream)]);
    }

    #[test]
    fn five_frames_grant_one_ack() {
        let mut session = streaming(&[BindingRequest::new("Temp", "dev1", "x*2")], &[]);
        let mut acks = Vec::new();
        for n in 0..5 {
            let mut out = Outbox::default();
            let frame = json!({"cmd": "DATA", "read": {"cls:Temp, port:dev1": n}, "write": {}});
            session.on_message(&frame.to_string(), &mut out).expect("data");
            assert_eq!(out.effects, vec![AgentEffect::NewData]);
            acks.extend(out.messages);
        }
        assert_eq!(acks, vec![BrokerToAgent::AckData { ack_count: 5 }]);

        let (read, _) = session.transformed().expect("streaming");
        assert_eq!(read["cls:Temp, port:dev1, eq:x*2"], json!(8));
    }

    #[test]
    fn transforms_reads_and_keeps_real_write_values() {
        let reads = vec![
            BindingRequest::new("Temp", "dev1", ""),
            BindingRequest::new("Temp", "dev1", "x/1000"),
        ];
        let writes = vec![BindingRequest::new("GPIOOutput", 17, "x*1")];
        let mut session = streaming(&reads, &writes);
        let mut out = Outbox::default();
        let frame = json!({
            "cmd": "DATA",
            "read": {"cls:Temp, port:dev1": 21500, "cls:Gone, port:1": 3},
            "write": {"cls:GPIOOutput, port:17": true}
        });
        session.on_message(&frame.to_string(), &mut out).expect("data");

        let (read, write) = session.transformed().expect("streaming");
        assert_eq!(read["cls:Temp, port:dev1, eq:"], json!(21500));
        assert_eq!(read["cls:Temp, port:dev1, eq:x/1000"], json!(21.5));
        assert!(!read.keys().any(|key| key.starts_with("cls:Gone")));
        assert_eq!(
            write["cls:GPIOOutput, port:17, eq:x*1"],
            WriteSample {
                calculated: json!(1),
                real: json!(true)
            }
        );
    }

    #[test]
    fn writes_resolve_to_the_base_binding() {
        let writes = vec![BindingRequest::new("GPIOOutput", 17, "x*1")];
        let session = streaming(&[], &writes);
        let mut out = Outbox::default();
        assert!(session.write_interface("cls:GPIOOutput, port:17, eq:x*1", json!(true), &mut out));
        assert!(!session.write_interface("cls:GPIOOutput, port:18, eq:x*1", json!(true), &mut out));
        assert_eq!(
            out.messages,
            vec![BrokerToAgent::WriteData {
                inter_face_port: "cls:GPIOOutput, port:17".to_string(),
                value: json!(true)
            }]
        );
    }

    #[test]
    fn reconfiguration_drops_before_sending_new_config() {
        let mut session = streaming(&[BindingRequest::new("Temp", "dev1", "")], &[]);
        let mut out = Outbox::default();
        assert!(session.configure(&[BindingRequest::new("Temp", "dev2", "")], &[], &mut out));
        assert!(session.configure(&[BindingRequest::new("Temp", "dev3", "")], &[], &mut out));
        assert_eq!(out.messages, vec![BrokerToAgent::DropToConfig]);
        assert_eq!(session.phase(), Some(Phase::Stream));

        let mut out = Outbox::default();
        session
            .on_message(r#"{"cmd":"DROP_TO_CONFIG_OK"}"#, &mut out)
            .expect("drop ok");
        assert_eq!(session.phase(), Some(Phase::Config));
        assert_eq!(out.effects, vec![AgentEffect::Presence(AgentPresence::Config)]);
        match &out.messages[..] {
            [BrokerToAgent::Config { payload }] => {
                assert!(payload.read.contains_key("cls:Temp, port:dev3"));
                assert_eq!(payload.read.len(), 1);
            }
            other => panic!("expected CONFIG, got {other:?}"),
        }
    }

    #[test]
    fn second_configure_waits_for_the_first_config_ok() {
        let mut session = registered();
        let mut out = Outbox::default();
        assert!(session.configure(&[BindingRequest::new("Temp", "dev1", "x*2")], &[], &mut out));
        assert!(session.configure(&[BindingRequest::new("Temp", "dev2", "x*3")], &[], &mut out));
        assert_eq!(out.messages.len(), 1);

        let mut out = Outbox::default();
        session.on_message(r#"{"cmd":"CONFIG_OK"}"#, &mut out).expect("config ok");
        assert_eq!(session.phase(), Some(Phase::Stream));
        assert_eq!(out.messages, vec![BrokerToAgent::DropToConfig]);

        // The agent is streaming the first configuration.
        let frame = json!({"cmd": "DATA", "read": {"cls:Temp, port:dev1": 4}, "write": {}});
        session.on_message(&frame.to_string(), &mut out).expect("data");
        let (read, _) = session.transformed().expect("streaming");
        assert_eq!(read["cls:Temp, port:dev1, eq:x*2"], json!(8));

        let mut out = Outbox::default();
        session
            .on_message(r#"{"cmd":"DROP_TO_CONFIG_OK"}"#, &mut out)
            .expect("drop ok");
        match &out.messages[..] {
            [BrokerToAgent::Config { payload }] => {
                assert!(payload.read.contains_key("cls:Temp, port:dev2"));
                assert_eq!(payload.read.len(), 1);
            }
            other => panic!("expected CONFIG, got {other:?}"),
        }
    }

    #[test]
    fn config_fail_sends_the_queued_config() {
        let mut session = registered();
        let mut out = Outbox::default();
        session.configure(&[BindingRequest::new("Temp", "dev1", "")], &[], &mut out);
        session.configure(&[BindingRequest::new("Temp", "dev2", "")], &[], &mut out);

        let mut out = Outbox::default();
        session.on_message(r#"{"cmd":"CONFIG_FAIL"}"#, &mut out).expect("config fail");
        assert_eq!(session.phase(), Some(Phase::Config));
        match &out.messages[..] {
            [BrokerToAgent::Config { payload }] => {
                assert!(payload.read.contains_key("cls:Temp, port:dev2"));
            }
            other => panic!("expected CONFIG, got {other:?}"),
        }
    }

    #[test]
    fn resume_and_pause_only_apply_while_streaming() {
        let mut session = registered();
        let mut out = Outbox::default();
        assert!(!session.resume_streaming(&mut out));

        let mut session = streaming(&[], &[]);
        assert!(session.resume_streaming(&mut out));
        assert!(session.is_streaming());
        assert!(session.pause_streaming(&mut out));
        assert!(!session.is_streaming());
        assert_eq!(
            out.messages,
            vec![BrokerToAgent::ResumeStreaming, BrokerToAgent::PauseStreaming]
        );
    }

    #[test]
    fn configure_is_refused_while_registering() {
        let mut session = AgentSession::new(settings());
        assert!(!session.configure(&[], &[], &mut Outbox::default()));
    }
}
