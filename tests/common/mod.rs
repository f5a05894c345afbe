//! Shared test utilities
//!
//! Fakes for every session collaborator so tests run without audio hardware
//! or network access.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::sync::{Semaphore, mpsc, watch};

use vesper_voice::assistant::{
    Assistant, GeneratedImage, Source, SourcedAnswer, SpeechAudio, TextStream, ToolBackend,
};
use vesper_voice::realtime::{
    ChannelEvent, Connector, DuplexChannel, INBOUND_CAPACITY, OUTBOUND_CAPACITY, OutboundReceiver,
    SessionSetup, outbound_channel,
};
use vesper_voice::session::{LocalCommandInterceptor, SessionConfig, SessionServices};
use vesper_voice::voice::{
    AudioBackend, AudioChunk, INPUT_SAMPLE_RATE, InputDevice, LevelMeter, OutputDevice,
    Recognition, Recognizer, RecognizerError, RecognizerFactory, SampleCallback, SourceId,
    pcm16_le,
};
use vesper_voice::{Error, Result, SessionHandle, SessionSnapshot};

/// How long tests wait for the session to reach a state
pub const WAIT: Duration = Duration::from_secs(5);

/// The model's side of one duplex connection
pub struct RemoteEnd {
    /// Push inbound events into the session
    pub events: mpsc::Sender<ChannelEvent>,
    /// What the session sent
    pub outbound: OutboundReceiver,
}

/// Connector handing out in-memory channels
#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicUsize,
    refuse: AtomicBool,
    remotes: Mutex<VecDeque<RemoteEnd>>,
}

impl FakeConnector {
    /// Number of connection attempts
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make further connection attempts fail
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Take the oldest connection not yet taken
    pub fn take_remote(&self) -> RemoteEnd {
        self.remotes
            .lock()
            .unwrap()
            .pop_front()
            .expect("no connection was opened")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _setup: SessionSetup) -> Result<DuplexChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Channel("connection refused".to_string()));
        }

        let (sender, outbound) = outbound_channel(OUTBOUND_CAPACITY);
        let (events_tx, events) = mpsc::channel(INBOUND_CAPACITY);
        self.remotes.lock().unwrap().push_back(RemoteEnd {
            events: events_tx,
            outbound,
        });

        Ok(DuplexChannel { sender, events })
    }
}

/// A source the output device was asked to play
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Played {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

/// Output device with a hand-driven clock
#[derive(Default)]
pub struct ManualOutput {
    now: Mutex<f64>,
    played: Mutex<Vec<Played>>,
    stopped: Mutex<Vec<SourceId>>,
    ended: Mutex<Option<mpsc::UnboundedSender<SourceId>>>,
}

impl ManualOutput {
    /// Move the clock forward
    pub fn advance(&self, seconds: f64) {
        *self.now.lock().unwrap() += seconds;
    }

    /// Everything started so far
    pub fn played(&self) -> Vec<Played> {
        self.played.lock().unwrap().clone()
    }

    /// Ids stopped early
    pub fn stopped(&self) -> Vec<SourceId> {
        self.stopped.lock().unwrap().clone()
    }

    /// Report every started source as finished
    pub fn finish_all(&self) {
        let ended = self.ended.lock().unwrap();
        if let Some(ended) = ended.as_ref() {
            for played in self.played() {
                let _ = ended.send(played.id);
            }
        }
    }
}

impl OutputDevice for ManualOutput {
    fn sample_rate(&self) -> u32 {
        24_000
    }

    fn channels(&self) -> u16 {
        1
    }

    fn current_time(&self) -> f64 {
        *self.now.lock().unwrap()
    }

    fn start_source(&self, id: SourceId, chunk: AudioChunk, start_at: f64) -> Result<()> {
        self.played.lock().unwrap().push(Played {
            id,
            start: start_at,
            duration: chunk.duration(),
        });
        Ok(())
    }

    fn stop_source(&self, id: SourceId) {
        self.stopped.lock().unwrap().push(id);
    }
}

type SharedCallback = Arc<Mutex<Option<SampleCallback>>>;

struct ScriptedInput {
    callback: SharedCallback,
}

impl InputDevice for ScriptedInput {
    fn sample_rate(&self) -> u32 {
        INPUT_SAMPLE_RATE
    }

    fn start(&mut self, on_samples: SampleCallback) -> Result<()> {
        *self.callback.lock().unwrap() = Some(on_samples);
        Ok(())
    }

    fn stop(&mut self) {
        self.callback.lock().unwrap().take();
    }

    fn is_capturing(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    fn is_alive(&self) -> bool {
        true
    }
}

/// Audio backend with a scripted microphone and a manual-clock speaker
#[derive(Default)]
pub struct FakeAudio {
    pub output: Arc<ManualOutput>,
    callback: SharedCallback,
    mic_denied: AtomicBool,
    inputs_opened: AtomicUsize,
}

impl FakeAudio {
    /// Make the microphone unavailable
    pub fn deny_microphone(&self) {
        self.mic_denied.store(true, Ordering::SeqCst);
    }

    /// Whether the microphone is streaming
    pub fn capturing(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    /// Number of times the microphone was acquired
    pub fn inputs_opened(&self) -> usize {
        self.inputs_opened.load(Ordering::SeqCst)
    }

    /// Deliver samples as if from the device thread
    pub fn feed(&self, samples: &[f32]) {
        if let Some(callback) = self.callback.lock().unwrap().as_mut() {
            callback(samples);
        }
    }
}

impl AudioBackend for FakeAudio {
    fn open_input(&self) -> Result<Box<dyn InputDevice>> {
        if self.mic_denied.load(Ordering::SeqCst) {
            return Err(Error::Audio("microphone permission denied".to_string()));
        }
        self.inputs_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedInput {
            callback: Arc::clone(&self.callback),
        }))
    }

    fn open_output(
        &self,
        ended: mpsc::UnboundedSender<SourceId>,
        _meter: Arc<LevelMeter>,
    ) -> Result<Arc<dyn OutputDevice>> {
        *self.output.ended.lock().unwrap() = Some(ended);
        Ok(Arc::clone(&self.output) as Arc<dyn OutputDevice>)
    }
}

/// Base64 PCM16 speech lasting `seconds` at 24 kHz
pub fn speech(seconds: f64) -> String {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let frames = (seconds * 24_000.0) as usize;
    base64::engine::general_purpose::STANDARD.encode(pcm16_le(&vec![0.2; frames]))
}

/// One-shot assistant with canned replies
pub struct FakeAssistant {
    reply: Mutex<std::result::Result<String, String>>,
    prompts: Mutex<Vec<String>>,
    synthesized: Mutex<Vec<String>>,
    held: AtomicBool,
    gate: Semaphore,
}

impl Default for FakeAssistant {
    fn default() -> Self {
        Self {
            reply: Mutex::new(Ok("Paris is the capital of France.".to_string())),
            prompts: Mutex::new(Vec::new()),
            synthesized: Mutex::new(Vec::new()),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

impl FakeAssistant {
    /// Make replies wait for [`release_reply`](Self::release_reply)
    pub fn hold_replies(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let one held reply through
    pub fn release_reply(&self) {
        self.gate.add_permits(1);
    }

    /// Make replies fail
    pub fn fail_replies(&self, error: &str) {
        *self.reply.lock().unwrap() = Err(error.to_string());
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Texts synthesized so far
    pub fn synthesized(&self) -> Vec<String> {
        self.synthesized.lock().unwrap().clone()
    }

    async fn answer(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.held.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        self.reply.lock().unwrap().clone().map_err(Error::Assistant)
    }
}

#[async_trait]
impl Assistant for FakeAssistant {
    async fn generate_text(&self, prompt: &str) -> Result<String> {
        self.answer(prompt).await
    }

    async fn stream_text(&self, prompt: &str) -> Result<TextStream> {
        let reply = self.answer(prompt).await?;
        let words: Vec<Result<String>> = reply
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(words)))
    }

    async fn synthesize(&self, text: &str) -> Result<SpeechAudio> {
        self.synthesized.lock().unwrap().push(text.to_string());
        Ok(SpeechAudio {
            mime_type: "audio/L16;codec=pcm;rate=24000".to_string(),
            data: speech(0.5),
        })
    }
}

/// Tool backend whose web search can be made to fail or wait
pub struct FakeTools {
    fail_search: AtomicBool,
    searches: AtomicUsize,
    held: AtomicBool,
    gate: Semaphore,
}

impl Default for FakeTools {
    fn default() -> Self {
        Self {
            fail_search: AtomicBool::new(false),
            searches: AtomicUsize::new(0),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

impl FakeTools {
    /// Make web searches wait for [`release_search`](Self::release_search)
    pub fn hold_searches(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let one held search through
    pub fn release_search(&self) {
        self.gate.add_permits(1);
    }

    /// Make `search_web` fail
    pub fn fail_search(&self) {
        self.fail_search.store(true, Ordering::SeqCst);
    }

    /// Number of web searches run
    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolBackend for FakeTools {
    async fn search_web(&self, query: &str) -> Result<SourcedAnswer> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.held.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(Error::Tool("search backend offline".to_string()));
        }
        Ok(SourcedAnswer {
            text: format!("Results for {query}"),
            sources: vec![Source {
                uri: "https://example.com".to_string(),
                title: "Example".to_string(),
            }],
        })
    }

    async fn search_places(&self, query: &str, _location: Option<&str>) -> Result<SourcedAnswer> {
        Ok(SourcedAnswer {
            text: format!("Places for {query}"),
            sources: Vec::new(),
        })
    }

    async fn generate_image(&self, _prompt: &str, _aspect_ratio: &str) -> Result<GeneratedImage> {
        Ok(GeneratedImage {
            uri: "data:image/png;base64,AAAA".to_string(),
            mime_type: "image/png".to_string(),
        })
    }
}

/// Recognizer fed by the test through a channel
struct ScriptedRecognizer {
    transcripts: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn next_result(&mut self) -> std::result::Result<Option<Recognition>, RecognizerError> {
        let text = self.transcripts.lock().await.recv().await;
        Ok(text.map(|text| Recognition {
            text,
            is_final: true,
        }))
    }
}

/// Wake word recognizer factory driven by [`ScriptedRecognizerFactory::hear`]
pub struct ScriptedRecognizerFactory {
    tx: mpsc::UnboundedSender<String>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    denied: AtomicBool,
    created: AtomicUsize,
}

impl Default for ScriptedRecognizerFactory {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            denied: AtomicBool::new(false),
            created: AtomicUsize::new(0),
        }
    }
}

impl ScriptedRecognizerFactory {
    /// Pretend the recognizer heard `text`
    pub fn hear(&self, text: &str) {
        let _ = self.tx.send(text.to_string());
    }

    /// Refuse microphone access
    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    /// Number of recognizers created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl RecognizerFactory for ScriptedRecognizerFactory {
    fn create(&self) -> std::result::Result<Box<dyn Recognizer>, RecognizerError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(RecognizerError::PermissionDenied(
                "speech recognition not permitted".to_string(),
            ));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedRecognizer {
            transcripts: Arc::clone(&self.rx),
        }))
    }
}

/// A session wired to fakes
pub struct Harness {
    pub session: SessionHandle,
    pub connector: Arc<FakeConnector>,
    pub audio: Arc<FakeAudio>,
    pub assistant: Arc<FakeAssistant>,
    pub tools: Arc<FakeTools>,
    pub recognizer: Arc<ScriptedRecognizerFactory>,
}

/// Session tunables used by the tests
pub fn test_config(stream_replies: bool) -> SessionConfig {
    SessionConfig {
        setup: SessionSetup {
            model: "test-model".to_string(),
            voice: "Puck".to_string(),
            system_instruction: None,
            function_declarations: vesper_voice::tools::function_declarations(),
        },
        frame_samples: 160,
        stream_replies,
        wake_words: vec!["hey vesper".to_string(), "vesper".to_string()],
        wake_enabled: true,
    }
}

/// Spawn a session over fresh fakes
pub fn harness(stream_replies: bool) -> Harness {
    let connector = Arc::new(FakeConnector::default());
    let audio = Arc::new(FakeAudio::default());
    let assistant = Arc::new(FakeAssistant::default());
    let tools = Arc::new(FakeTools::default());
    let recognizer = Arc::new(ScriptedRecognizerFactory::default());

    let services = SessionServices {
        audio: Arc::clone(&audio) as Arc<dyn AudioBackend>,
        connector: Arc::clone(&connector) as Arc<dyn Connector>,
        assistant: Arc::clone(&assistant) as Arc<dyn Assistant>,
        tools: Arc::clone(&tools) as Arc<dyn ToolBackend>,
        recognizer: Some(Arc::clone(&recognizer) as Arc<dyn RecognizerFactory>),
        commands: LocalCommandInterceptor::default(),
    };
    let (session, _task) = SessionHandle::spawn(test_config(stream_replies), services);

    Harness {
        session,
        connector,
        audio,
        assistant,
        tools,
        recognizer,
    }
}

/// Wait until a snapshot satisfies `predicate`
pub async fn wait_for(
    session: &SessionHandle,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut snapshots: watch::Receiver<SessionSnapshot> = session.subscribe();
    tokio::time::timeout(WAIT, snapshots.wait_for(predicate))
        .await
        .expect("timed out waiting for session state")
        .expect("session task stopped")
        .clone()
}

/// Poll `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
