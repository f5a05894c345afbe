//! Session controller
//!
//! One task owns every piece of session state and reacts to API commands,
//! channel events, playback completions, tool outcomes and wake events in
//! arrival order. [`SessionHandle`] is the cheap, cloneable front door; the
//! presentation layer renders whatever arrives on [`SessionHandle::subscribe`].

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::commands::{Interception, LocalCommandInterceptor};
use super::state::{ActivityFlags, Lifecycle, SessionSnapshot, SessionState};
use super::transcript::{Message, MessageLog, Sender, TranscriptionAggregator};
use crate::assistant::{Assistant, SpeechAudio, ToolBackend};
use crate::realtime::{
    ChannelEvent, ChannelSender, Connector, DuplexChannel, SessionSetup, Speaker,
};
use crate::tools::{Completion, Dispatch, ToolDispatcher, ToolMessage, ToolOutcome};
use crate::voice::{
    AudioBackend, AudioFrameDecoder, CaptureLoop, FatalCallback, LevelMeter, PlaybackScheduler,
    RecognizerFactory, SourceId, WakeEvent, WakeWordDetector, WakeWordListener,
};
use crate::{Error, Result};

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sent when the duplex channel opens
    pub setup: SessionSetup,
    /// Samples per outbound microphone frame
    pub frame_samples: usize,
    /// Stream typed-text replies instead of waiting for the full text
    pub stream_replies: bool,
    /// Phrases that wake the session from standby
    pub wake_words: Vec<String>,
    /// Whether standby listens for the wake word at all
    pub wake_enabled: bool,
}

/// Collaborators the session talks to
pub struct SessionServices {
    /// Audio devices
    pub audio: Arc<dyn AudioBackend>,
    /// Opens the duplex channel
    pub connector: Arc<dyn Connector>,
    /// Typed-text replies and speech synthesis
    pub assistant: Arc<dyn Assistant>,
    /// Tool execution
    pub tools: Arc<dyn ToolBackend>,
    /// Wake word recognition, if available on this machine
    pub recognizer: Option<Arc<dyn RecognizerFactory>>,
    /// Local command tables
    pub commands: LocalCommandInterceptor,
}

/// Current input and output levels in `0.0..=1.0`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Levels {
    /// Microphone level
    pub input: f32,
    /// Speaker level
    pub output: f32,
}

type Ack = oneshot::Sender<()>;

enum Command {
    Start(Ack),
    Stop(Ack),
    Restart(Ack),
    Shutdown(Ack),
    Wake(Option<String>, Ack),
    SendText(String, Ack),
    Interrupt(Ack),
}

enum Internal {
    Connected {
        epoch: u64,
        result: Result<DuplexChannel>,
    },
    CaptureFailed {
        epoch: u64,
        error: String,
    },
    ReplyDelta {
        epoch: u64,
        text: String,
    },
    ReplyDone {
        epoch: u64,
        result: std::result::Result<String, String>,
    },
    Speech {
        epoch: u64,
        result: std::result::Result<SpeechAudio, String>,
    },
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    meter: Arc<LevelMeter>,
}

impl SessionHandle {
    /// Spawn the session task
    ///
    /// Must be called from within a tokio runtime. The speaker is opened
    /// here; if that fails the session still runs, silently.
    #[must_use]
    pub fn spawn(config: SessionConfig, services: SessionServices) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let meter = Arc::new(LevelMeter::new());
        let controller = SessionController::new(config, services, Arc::clone(&meter), commands_rx);
        let snapshot = controller.snapshot_tx.subscribe();
        let task = tokio::spawn(controller.run());

        (
            Self {
                commands: commands_tx,
                snapshot,
                meter,
            },
            task,
        )
    }

    async fn request(&self, build: impl FnOnce(Ack) -> Command) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(build(ack))
            .map_err(|_| Error::Session("session task has stopped".to_string()))?;
        done.await
            .map_err(|_| Error::Session("session task has stopped".to_string()))
    }

    /// Connect, from idle or error
    ///
    /// Returns once connecting has begun.
    ///
    /// # Errors
    ///
    /// Returns error if the session task has stopped
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await
    }

    /// Disconnect and go idle; standby is left alone
    ///
    /// # Errors
    ///
    /// Returns error if the session task has stopped
    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    /// Tear everything down, clear errors and connect again
    ///
    /// # Errors
    ///
    /// Returns error if the session task has stopped
    pub async fn restart(&self) -> Result<()> {
        self.request(Command::Restart).await
    }

    /// Go to standby and listen for the wake word
    ///
    /// # Errors
    ///
    /// Returns error if the session task has stopped
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    /// Wake from standby, optionally sending `command` once connected
    ///
    /// # Errors
    ///
    /// Returns error if the session task has stopped
    pub async fn wake(&self, command: Option<String>) -> Result<()> {
        self.request(|ack| Command::Wake(command, ack)).await
    }

    /// Send typed text
    ///
    /// # Errors
    ///
    /// Returns error if the session task has stopped
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|ack| Command::SendText(text, ack)).await
    }

    /// Cut off any speech that is playing or queued
    ///
    /// # Errors
    ///
    /// Returns error if the session task has stopped
    pub async fn interrupt(&self) -> Result<()> {
        self.request(Command::Interrupt).await
    }

    /// Watch session snapshots
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Latest snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current audio levels
    #[must_use]
    pub fn levels(&self) -> Levels {
        Levels {
            input: self.meter.input(),
            output: self.meter.output(),
        }
    }
}

struct SessionController {
    config: SessionConfig,
    services: SessionServices,

    lifecycle: Lifecycle,
    flags: ActivityFlags,
    log: MessageLog,
    error: Option<String>,
    wake_available: bool,

    aggregator: TranscriptionAggregator,
    dispatcher: ToolDispatcher,
    capture: CaptureLoop,
    scheduler: Option<PlaybackScheduler>,
    decoder: Option<AudioFrameDecoder>,

    sender: Option<ChannelSender>,
    channel_events: Option<mpsc::Receiver<ChannelEvent>>,
    /// Bumped on every connect and teardown; stale connects and capture
    /// failures carry an older value
    epoch: u64,
    /// Bumped whenever queued speech is discarded
    speech_epoch: u64,
    /// Bumped on teardown; one-shot replies requested before it are dropped
    reply_epoch: u64,
    pending_command: Option<String>,
    pending_replies: usize,
    /// The user finished a turn and the model has not answered yet
    awaiting_model: bool,
    /// Agent audio or transcript arrived during the current turn
    agent_output: bool,

    wake_listener: Option<WakeWordListener>,
    wake_events: Option<mpsc::UnboundedReceiver<WakeEvent>>,

    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    tool_tx: mpsc::UnboundedSender<ToolOutcome>,
    tool_rx: mpsc::UnboundedReceiver<ToolOutcome>,
    ended_rx: mpsc::UnboundedReceiver<SourceId>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    fn new(
        config: SessionConfig,
        services: SessionServices,
        meter: Arc<LevelMeter>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let mut log = MessageLog::new();

        let scheduler = match services.audio.open_output(ended_tx, Arc::clone(&meter)) {
            Ok(device) => Some(PlaybackScheduler::new(device)),
            Err(e) => {
                tracing::warn!(error = %e, "speaker unavailable, replies will not be spoken");
                log.push(Message::system(format!("Speaker unavailable: {e}")));
                None
            }
        };
        let decoder = scheduler.as_ref().map(PlaybackScheduler::decoder);
        let wake_available = config.wake_enabled && services.recognizer.is_some();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            wake_word_available: wake_available,
            ..SessionSnapshot::default()
        });

        Self {
            dispatcher: ToolDispatcher::new(Arc::clone(&services.tools)),
            capture: CaptureLoop::new(config.frame_samples, meter),
            config,
            services,
            lifecycle: Lifecycle::Idle,
            flags: ActivityFlags::default(),
            log,
            error: None,
            wake_available,
            aggregator: TranscriptionAggregator::new(),
            scheduler,
            decoder,
            sender: None,
            channel_events: None,
            epoch: 0,
            speech_epoch: 0,
            reply_epoch: 0,
            pending_command: None,
            pending_replies: 0,
            awaiting_model: false,
            agent_output: false,
            wake_listener: None,
            wake_events: None,
            commands,
            internal_tx,
            internal_rx,
            tool_tx,
            tool_rx,
            ended_rx,
            snapshot_tx,
        }
    }

    async fn run(mut self) {
        self.publish();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = recv_bounded(&mut self.channel_events) => match event {
                    Some(event) => self.handle_channel_event(event),
                    None => self.handle_channel_event(ChannelEvent::Closed { reason: None }),
                },
                Some(id) = self.ended_rx.recv() => self.handle_source_ended(id),
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                Some(outcome) = self.tool_rx.recv() => {
                    if let Some(completion) = self.dispatcher.complete(outcome) {
                        self.apply_completion(completion);
                    }
                }
                event = recv_unbounded(&mut self.wake_events) => match event {
                    Some(event) => self.handle_wake_event(event),
                    None => self.wake_events = None,
                },
            }

            self.publish();
        }

        self.teardown();
        self.stop_wake_listener();
        self.capture.release();
        tracing::debug!("session task finished");
    }

    fn handle_command(&mut self, command: Command) {
        let ack = match command {
            Command::Start(ack) => {
                self.start();
                ack
            }
            Command::Stop(ack) => {
                self.stop();
                ack
            }
            Command::Restart(ack) => {
                self.restart();
                ack
            }
            Command::Shutdown(ack) => {
                let acknowledgement = self.services.commands.acknowledgement().map(str::to_string);
                self.enter_standby(acknowledgement);
                ack
            }
            Command::Wake(command, ack) => {
                self.wake(command.as_deref().unwrap_or_default());
                ack
            }
            Command::SendText(text, ack) => {
                self.send_text(&text);
                ack
            }
            Command::Interrupt(ack) => {
                self.interrupt_playback();
                ack
            }
        };

        self.publish();
        let _ = ack.send(());
    }

    fn start(&mut self) {
        match self.lifecycle {
            Lifecycle::Idle | Lifecycle::Error => self.begin_connect(Lifecycle::Connecting),
            other => tracing::debug!(lifecycle = ?other, "start ignored"),
        }
    }

    fn stop(&mut self) {
        if self.lifecycle == Lifecycle::Standby {
            tracing::debug!("stop ignored in standby");
            return;
        }

        self.teardown();
        self.pending_command = None;
        self.lifecycle = Lifecycle::Idle;
        tracing::info!("session stopped");
    }

    fn restart(&mut self) {
        self.teardown();
        self.stop_wake_listener();
        self.flags = ActivityFlags::default();
        self.pending_command = None;
        self.error = None;
        self.lifecycle = Lifecycle::Idle;
        tracing::info!("session restarting");
        self.start();
    }

    fn begin_connect(&mut self, lifecycle: Lifecycle) {
        self.lifecycle = lifecycle;
        self.epoch += 1;
        self.publish();

        let epoch = self.epoch;
        let connector = Arc::clone(&self.services.connector);
        let setup = self.config.setup.clone();
        let internal = self.internal_tx.clone();

        tracing::info!(epoch, "connecting");
        tokio::spawn(async move {
            let result = connector.connect(setup).await;
            let _ = internal.send(Internal::Connected { epoch, result });
        });
    }

    fn handle_connected(&mut self, epoch: u64, result: Result<DuplexChannel>) {
        let current = epoch == self.epoch
            && matches!(self.lifecycle, Lifecycle::Connecting | Lifecycle::WakingUp);

        if !current {
            if let Ok(channel) = result {
                tracing::debug!(epoch, "discarding stale connection");
                channel.sender.close();
            }
            return;
        }

        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(error = %e, "failed to connect");
                self.lifecycle = Lifecycle::Error;
                self.pending_command = None;
                let message = format!("Couldn't connect: {e}");
                self.log.push(Message::system(&message));
                self.error = Some(message);
                return;
            }
        };

        let DuplexChannel { sender, events } = channel;
        self.sender = Some(sender.clone());
        self.channel_events = Some(events);
        self.lifecycle = Lifecycle::Active;
        self.error = None;
        tracing::info!(epoch, "session active");

        let internal = self.internal_tx.clone();
        let on_fatal: FatalCallback = Box::new(move |e: Error| {
            let _ = internal.send(Internal::CaptureFailed {
                epoch,
                error: e.to_string(),
            });
        });

        if let Err(e) = self
            .capture
            .start(self.services.audio.as_ref(), Arc::new(sender), on_fatal)
        {
            tracing::warn!(error = %e, "microphone unavailable");
            self.log
                .push(Message::system(format!("Microphone unavailable: {e}")));
        }

        if let Some(command) = self.pending_command.take() {
            self.send_text(&command);
        }
    }

    /// Close the channel and stop everything tied to it
    fn teardown(&mut self) {
        self.epoch += 1;

        let cancelled = self.dispatcher.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "tool calls cancelled");
        }
        self.capture.stop();
        if let Some(sender) = self.sender.take() {
            sender.close();
        }
        self.channel_events = None;

        self.interrupt_playback();
        self.aggregator.reset();
        self.log.clear_partials();

        self.reply_epoch += 1;
        self.pending_replies = 0;
        self.awaiting_model = false;
        self.agent_output = false;
        self.flags.listening = false;
        self.flags.processing = false;
        self.refresh_thinking();
    }

    fn refresh_thinking(&mut self) {
        self.flags.thinking = self.pending_replies > 0 || self.awaiting_model;
    }

    /// The model started answering the current turn
    fn agent_responding(&mut self) {
        self.agent_output = true;
        self.awaiting_model = false;
        self.flags.listening = false;
        self.refresh_thinking();
    }

    fn fail(&mut self, message: String) {
        tracing::error!(error = %message, "session failed");
        self.teardown();
        self.pending_command = None;
        self.lifecycle = Lifecycle::Error;
        self.log.push(Message::system(&message));
        self.error = Some(message);
    }

    fn enter_standby(&mut self, acknowledgement: Option<String>) {
        if matches!(self.lifecycle, Lifecycle::Standby | Lifecycle::ShuttingDown) {
            return;
        }

        self.lifecycle = Lifecycle::ShuttingDown;
        self.publish();

        self.teardown();
        self.pending_command = None;
        self.lifecycle = Lifecycle::Standby;
        tracing::info!("entered standby");
        self.start_wake_listener();

        if let Some(text) = acknowledgement {
            self.log.push(Message::new(Sender::Agent, &text));
            self.speak(text);
        }
    }

    fn start_wake_listener(&mut self) {
        if !self.wake_available {
            return;
        }
        let Some(factory) = self.services.recognizer.clone() else {
            return;
        };

        // A fresh channel per listener: events from an older one are dropped
        // with its receiver
        let (tx, rx) = mpsc::unbounded_channel();
        let detector = WakeWordDetector::new(self.config.wake_words.clone());
        self.wake_listener = Some(WakeWordListener::spawn(factory, detector, tx));
        self.wake_events = Some(rx);
        tracing::debug!("wake word listener started");
    }

    fn stop_wake_listener(&mut self) {
        if let Some(listener) = self.wake_listener.take() {
            listener.stop();
        }
        self.wake_events = None;
    }

    fn handle_wake_event(&mut self, event: WakeEvent) {
        match event {
            WakeEvent::Detected(found) => {
                tracing::info!(phrase = %found.phrase, "wake word detected");
                if self.lifecycle == Lifecycle::Standby {
                    self.wake(&found.command);
                }
            }
            WakeEvent::Unavailable { reason } => {
                self.stop_wake_listener();
                self.wake_available = false;
                self.log.push(Message::system(format!(
                    "Wake word listening unavailable: {reason}"
                )));
            }
        }
    }

    fn wake(&mut self, command: &str) {
        if self.lifecycle != Lifecycle::Standby {
            tracing::debug!(lifecycle = ?self.lifecycle, "wake ignored");
            return;
        }

        let command = command.trim();
        if self.services.commands.is_shutdown(command) {
            tracing::debug!(command = %command, "wake command asks to sleep, staying in standby");
            self.stop_wake_listener();
            self.start_wake_listener();
            return;
        }

        self.stop_wake_listener();
        self.pending_command = (!command.is_empty()).then(|| command.to_string());
        self.begin_connect(Lifecycle::WakingUp);
    }

    fn send_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        self.log.push(Message::new(Sender::User, text));

        match self.services.commands.intercept(text) {
            Interception::Shutdown { acknowledgement } => self.enter_standby(acknowledgement),
            Interception::Reply(reply) => self.reply_locally(reply),
            Interception::Unhandled => self.request_reply(text.to_string()),
        }
    }

    fn reply_locally(&mut self, reply: String) {
        self.interrupt_playback();
        self.log.push(Message::new(Sender::Agent, &reply));
        self.speak(reply);
    }

    fn request_reply(&mut self, prompt: String) {
        self.pending_replies += 1;
        self.refresh_thinking();

        let assistant = Arc::clone(&self.services.assistant);
        let internal = self.internal_tx.clone();
        let stream = self.config.stream_replies;
        let epoch = self.reply_epoch;

        tokio::spawn(async move {
            let result = if stream {
                stream_reply(assistant.as_ref(), &prompt, epoch, &internal).await
            } else {
                assistant.generate_text(&prompt).await
            };
            let _ = internal.send(Internal::ReplyDone {
                epoch,
                result: result.map_err(|e| e.to_string()),
            });
        });
    }

    fn speak(&mut self, text: String) {
        if self.scheduler.is_none() {
            return;
        }

        let assistant = Arc::clone(&self.services.assistant);
        let internal = self.internal_tx.clone();
        let epoch = self.speech_epoch;

        tokio::spawn(async move {
            let result = assistant.synthesize(&text).await.map_err(|e| e.to_string());
            let _ = internal.send(Internal::Speech { epoch, result });
        });
    }

    fn play(&mut self, mime_type: &str, data: &str) {
        let (Some(scheduler), Some(decoder)) = (self.scheduler.as_mut(), self.decoder.as_ref())
        else {
            return;
        };

        let scheduled = decoder
            .decode_base64(mime_type, data)
            .and_then(|chunk| scheduler.enqueue(chunk));
        match scheduled {
            Ok(Some(source)) => {
                tracing::trace!(id = source.id, start = source.start, "speech scheduled");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, mime_type, "dropped audio chunk");
                self.log
                    .push(Message::system(format!("Couldn't play audio: {e}")));
            }
        }
        self.flags.speaking = self.scheduler.as_ref().is_some_and(PlaybackScheduler::is_speaking);
    }

    fn interrupt_playback(&mut self) {
        self.speech_epoch += 1;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.interrupt();
        }
        self.flags.speaking = false;
    }

    fn handle_source_ended(&mut self, id: SourceId) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            if scheduler.source_ended(id) {
                tracing::trace!("playback drained");
            }
            self.flags.speaking = scheduler.is_speaking();
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Ready => tracing::debug!("setup acknowledged"),
            ChannelEvent::PartialTranscript { speaker, text } => {
                match speaker {
                    Speaker::User if !text.trim().is_empty() => self.flags.listening = true,
                    Speaker::User => {}
                    Speaker::Agent => self.agent_responding(),
                }
                self.aggregator.apply(speaker, &text, &mut self.log);
            }
            ChannelEvent::Audio { mime_type, data } => {
                self.agent_responding();
                self.play(&mime_type, &data);
            }
            ChannelEvent::TurnComplete => {
                let turn = self.aggregator.complete_turn(&mut self.log);
                let answered = self.agent_output || turn.agent.is_some();
                self.agent_output = false;
                self.awaiting_model = false;
                self.flags.listening = false;

                if let Some(user) = turn.user {
                    match self.services.commands.intercept(&user) {
                        Interception::Shutdown { acknowledgement } => {
                            self.enter_standby(acknowledgement);
                        }
                        Interception::Reply(reply) => self.reply_locally(reply),
                        Interception::Unhandled => self.awaiting_model = !answered,
                    }
                }
                self.refresh_thinking();
            }
            ChannelEvent::Interrupted => {
                self.awaiting_model = false;
                self.refresh_thinking();
                self.interrupt_playback();
            }
            ChannelEvent::ToolCall(call) => {
                tracing::info!(id = %call.id, name = %call.name, "tool call");
                match self.dispatcher.dispatch(call, &self.tool_tx) {
                    Dispatch::Spawned => {}
                    Dispatch::Immediate(completion) => self.apply_completion(completion),
                    // The running call answers this id; a second result would
                    // break correlation
                    Dispatch::Duplicate { name } => self.log.push(Message::system(format!(
                        "Ignored a repeated request to run {name}"
                    ))),
                    Dispatch::Shutdown(result) => {
                        if let Some(sender) = &self.sender {
                            sender.send_tool_result(result);
                        }
                        let acknowledgement =
                            self.services.commands.acknowledgement().map(str::to_string);
                        self.enter_standby(acknowledgement);
                    }
                }
                self.flags.processing = self.dispatcher.in_flight() > 0;
            }
            ChannelEvent::Error(e) => self.fail(format!("Connection error: {e}")),
            ChannelEvent::Closed { reason } => {
                self.channel_events = None;
                if self.lifecycle == Lifecycle::Active {
                    let message = match reason {
                        Some(reason) if !reason.is_empty() => {
                            format!("Connection closed: {reason}")
                        }
                        _ => "Connection closed unexpectedly".to_string(),
                    };
                    self.fail(message);
                }
            }
        }
    }

    fn apply_completion(&mut self, completion: Completion) {
        let Completion { message, result } = completion;

        let message = match message {
            ToolMessage::Answer { text, sources } => {
                Message::new(Sender::Agent, text).with_sources(sources)
            }
            ToolMessage::Image { text, image } => {
                Message::new(Sender::Agent, text).with_image(image)
            }
            ToolMessage::Failure { text } => Message::system(text),
        };
        self.log.push(message);

        match &self.sender {
            Some(sender) => {
                if !sender.send_tool_result(result) {
                    tracing::warn!("channel closed before tool result was sent");
                }
            }
            None => tracing::debug!(id = %result.id, "no channel for tool result"),
        }

        self.flags.processing = self.dispatcher.in_flight() > 0;
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Connected { epoch, result } => self.handle_connected(epoch, result),
            Internal::CaptureFailed { epoch, error } => {
                if epoch == self.epoch && self.lifecycle == Lifecycle::Active {
                    self.fail(format!("Audio capture failed: {error}"));
                }
            }
            Internal::ReplyDelta { epoch, text } => {
                if epoch == self.reply_epoch {
                    self.log.upsert_partial(Sender::Agent, &text);
                }
            }
            Internal::ReplyDone { epoch, result } => {
                if epoch != self.reply_epoch {
                    tracing::debug!("discarding reply requested before teardown");
                    return;
                }
                self.pending_replies = self.pending_replies.saturating_sub(1);
                self.refresh_thinking();

                match result {
                    Ok(text) if !text.trim().is_empty() => {
                        let text = text.trim().to_string();
                        self.log.finalize(Sender::Agent, &text);
                        self.speak(text);
                    }
                    Ok(_) => {
                        self.log.remove_partial(Sender::Agent);
                        self.log
                            .push(Message::system("The assistant returned an empty reply"));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reply failed");
                        self.log.remove_partial(Sender::Agent);
                        self.log
                            .push(Message::system(format!("I couldn't get a reply: {e}")));
                    }
                }
            }
            Internal::Speech { epoch, result } => {
                if epoch != self.speech_epoch {
                    tracing::debug!("discarding speech for an interrupted reply");
                    return;
                }
                match result {
                    Ok(audio) => self.play(&audio.mime_type, &audio.data),
                    Err(e) => {
                        tracing::warn!(error = %e, "speech synthesis failed");
                        self.log
                            .push(Message::system(format!("Couldn't speak the reply: {e}")));
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: SessionState::resolve(self.lifecycle, self.flags),
            lifecycle: self.lifecycle,
            flags: self.flags,
            messages: self.log.messages().to_vec(),
            error: self.error.clone(),
            wake_word_available: self.wake_available,
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn stream_reply(
    assistant: &dyn Assistant,
    prompt: &str,
    epoch: u64,
    internal: &mpsc::UnboundedSender<Internal>,
) -> Result<String> {
    let mut stream = assistant.stream_text(prompt).await?;
    let mut text = String::new();

    while let Some(delta) = stream.next().await {
        text.push_str(&delta?);
        let _ = internal.send(Internal::ReplyDelta {
            epoch,
            text: text.clone(),
        });
    }

    Ok(text)
}

async fn recv_bounded<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_unbounded<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
