//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::sync::Arc;

use vesper_voice::realtime::{ChannelEvent, ServerDecoder, Speaker};
use vesper_voice::session::{MessageLog, Sender, TranscriptionAggregator};
use vesper_voice::voice::{
    INPUT_SAMPLE_RATE, OutputDevice, PlaybackScheduler, SegmenterState, SpeechSegmenter,
    WakeWordDetector, encode_frame, pcm16_le, samples_to_wav,
};

mod common;
use common::ManualOutput;

/// Generate sine wave audio samples
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let sample_rate = INPUT_SAMPLE_RATE as f32;
    let num_samples = (sample_rate * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    vec![0.0; (INPUT_SAMPLE_RATE as f32 * duration_secs) as usize]
}

#[test]
fn test_server_fragments_become_one_message() {
    let mut decoder = ServerDecoder::new();
    let mut aggregator = TranscriptionAggregator::new();
    let mut log = MessageLog::new();

    let frames = [
        r#"{"serverContent":{"inputTranscription":{"text":"Find"}}}"#,
        r#"{"serverContent":{"inputTranscription":{"text":" coffee"}}}"#,
        r#"{"serverContent":{"outputTranscription":{"text":"Here are"}}}"#,
        r#"{"serverContent":{"inputTranscription":{"text":" nearby"}}}"#,
        r#"{"serverContent":{"outputTranscription":{"text":" three places."}}}"#,
        r#"{"serverContent":{"turnComplete":true}}"#,
    ];

    let mut completed = None;
    for frame in frames {
        for event in decoder.decode(frame).unwrap() {
            match event {
                ChannelEvent::PartialTranscript { speaker, text } => {
                    aggregator.apply(speaker, &text, &mut log);
                }
                ChannelEvent::TurnComplete => completed = Some(aggregator.complete_turn(&mut log)),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    let turn = completed.unwrap();
    assert_eq!(turn.user.as_deref(), Some("Find coffee nearby"));
    assert_eq!(turn.agent.as_deref(), Some("Here are three places."));

    assert_eq!(log.len(), 2);
    assert!(log.messages().iter().all(|m| !m.partial));
    assert_eq!(log.messages()[0].sender, Sender::User);
    assert_eq!(aggregator.buffer(Speaker::User), "");
}

#[test]
fn test_decoded_speech_is_resampled_and_packed() {
    let device = Arc::new(ManualOutput::default());
    let mut scheduler = PlaybackScheduler::new(Arc::clone(&device) as Arc<dyn OutputDevice>);
    let decoder = scheduler.decoder();

    // 100ms at 16kHz, played on a 24kHz device
    let pcm = pcm16_le(&generate_sine_samples(220.0, 0.1, 0.3));
    for _ in 0..3 {
        let chunk = decoder.decode("audio/pcm;rate=16000", &pcm).unwrap();
        assert_eq!(chunk.sample_rate(), 24_000);
        scheduler.enqueue(chunk).unwrap();
    }

    let played = device.played();
    assert_eq!(played.len(), 3);
    for pair in played.windows(2) {
        assert!((pair[1].start - (pair[0].start + pair[0].duration)).abs() < 1e-9);
    }
    assert!((played[0].duration - 0.1).abs() < 0.01);

    // The device fell behind: the next chunk starts now, not in the past
    device.advance(1.0);
    let late = scheduler
        .enqueue(decoder.decode("audio/pcm;rate=16000", &pcm).unwrap())
        .unwrap()
        .unwrap();
    assert!((late.start - 1.0).abs() < 1e-9);

    assert_eq!(scheduler.interrupt(), 4);
    assert!(!scheduler.is_speaking());
    assert_eq!(device.stopped().len(), 4);
}

#[test]
fn test_captured_frame_encoding() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let frame = encode_frame(&samples, INPUT_SAMPLE_RATE).unwrap();

    assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
    // 1600 samples of 16-bit PCM, base64 encoded
    assert_eq!(frame.data.len(), 3200_usize.div_ceil(3) * 4);
}

#[test]
fn test_wake_word_detector_multiple_words() {
    let detector = WakeWordDetector::new(vec![
        "  Hey VESPER ".to_string(),
        "vesper".to_string(),
        "hello assistant".to_string(),
    ]);

    assert_eq!(detector.wake_words().len(), 3);
    assert!(detector.detect("hello world").is_none());

    let found = detector.detect("HEY VESPER turn on the lights").unwrap();
    assert_eq!(found.phrase, "hey vesper");
    assert_eq!(found.command, "turn on the lights");

    let found = detector.detect("ok hello, assistant").unwrap();
    assert_eq!(found.phrase, "hello assistant");
}

#[test]
fn test_speech_segmentation() {
    let mut segmenter = SpeechSegmenter::new(INPUT_SAMPLE_RATE);

    // Silent samples - should not trigger
    assert!(segmenter.push(&generate_silence(0.1)).is_none());
    assert_eq!(segmenter.state(), SegmenterState::Idle);

    // Loud samples - should start listening
    let speech = generate_sine_samples(440.0, 0.5, 0.3);
    assert!(segmenter.push(&speech).is_none());
    assert_eq!(segmenter.state(), SegmenterState::Listening);

    // Silence after enough speech completes the segment
    let segment = segmenter.push(&generate_silence(0.6)).unwrap();
    assert_eq!(segment.len(), speech.len() + generate_silence(0.6).len());
    assert_eq!(segmenter.state(), SegmenterState::Idle);
}

#[test]
fn test_short_blip_is_discarded() {
    let mut segmenter = SpeechSegmenter::new(INPUT_SAMPLE_RATE);

    segmenter.push(&generate_sine_samples(440.0, 0.1, 0.3));
    assert_eq!(segmenter.state(), SegmenterState::Listening);

    assert!(segmenter.push(&generate_silence(1.2)).is_none());
    assert_eq!(segmenter.state(), SegmenterState::Idle);
}

#[test]
fn test_wav_roundtrip() {
    let original_samples: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
    let wav_data = samples_to_wav(&original_samples, INPUT_SAMPLE_RATE).unwrap();

    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");

    let mut reader = hound::WavReader::new(Cursor::new(wav_data)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, INPUT_SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), original_samples.len());
}
