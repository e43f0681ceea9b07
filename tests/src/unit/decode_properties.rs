use super::test_runtime;
use finchat_core::testkit::{frame_body, RecordingObserver};
use finchat_core::{
    AbortSignal, ChatError, DecodeError, DecodeOutcome, DecoderOptions, ObserverGuard,
    StreamDecoder,
};

/// `frames - 1` text frames followed by the terminal frame.
fn wire(frames: usize) -> String {
    let mut wire: String = (1..frames)
        .map(|index| format!(r#"{{"delta":"part-{index} ","done":false}}"#))
        .collect();
    wire.push_str(r#"{"done":"true"}"#);
    wire
}

fn chunks_of(wire: &str, width: usize) -> Vec<String> {
    wire.as_bytes()
        .chunks(width)
        .map(|chunk| String::from_utf8(chunk.to_vec()).expect("ascii wire"))
        .collect()
}

fn decode(chunks: &[String], options: DecoderOptions) -> (DecodeOutcome, RecordingObserver, bool) {
    let runtime = test_runtime();
    let parts: Vec<&str> = chunks.iter().map(String::as_str).collect();
    let (body, released) = frame_body(&parts);
    let mut observer = ObserverGuard::new(RecordingObserver::default());
    let outcome = runtime.block_on(StreamDecoder::new(options).decode(
        body,
        &mut observer,
        &mut AbortSignal::never(),
    ));
    (outcome, observer.into_inner(), released.is_released())
}

#[test]
fn n_frames_yield_n_nexts_in_order_then_one_complete() {
    for frames in 1..=6 {
        for width in [1, 5, 17, 1024] {
            let chunks = chunks_of(&wire(frames), width);
            let (outcome, observer, released) = decode(&chunks, DecoderOptions::default());

            assert_eq!(outcome, DecodeOutcome::Completed { frames }, "width {width}");
            assert_eq!(observer.events.len(), frames);
            for (index, event) in observer.events.iter().take(frames - 1).enumerate() {
                assert_eq!(event.delta.as_deref(), Some(format!("part-{} ", index + 1).as_str()));
                assert!(!event.done);
            }
            assert!(observer.events[frames - 1].done);
            assert_eq!(observer.completions, 1);
            assert!(observer.errors.is_empty());
            assert!(released);
        }
    }
}

#[test]
fn trailing_partial_frame_yields_exactly_one_error() {
    let full = wire(3);
    let last_frame_start = full.rfind(r#"{"done""#).expect("terminal frame");
    for cut in last_frame_start + 1..full.len() {
        let chunks = chunks_of(&full[..cut], 4);
        for options in [
            DecoderOptions::default(),
            DecoderOptions {
                require_terminal_frame: false,
            },
        ] {
            let (outcome, observer, released) = decode(&chunks, options);

            assert!(
                matches!(
                    outcome,
                    DecodeOutcome::Failed(ChatError::Decode(DecodeError::Truncated { .. }))
                ),
                "cut at {cut}: {outcome:?}"
            );
            assert_eq!(observer.events.len(), 2);
            assert_eq!(observer.errors.len(), 1);
            assert_eq!(observer.completions, 0);
            assert!(released);
        }
    }
}

#[test]
fn stream_without_terminal_frame_is_an_error_by_default() {
    let chunks = vec![r#"{"delta":"a"}{"delta":"b"}"#.to_string()];

    let (outcome, observer, _) = decode(&chunks, DecoderOptions::default());
    assert_eq!(
        outcome,
        DecodeOutcome::Failed(ChatError::Decode(DecodeError::MissingTerminalFrame))
    );
    assert_eq!(observer.events.len(), 2);
    assert_eq!(observer.completions, 0);

    let lenient = DecoderOptions {
        require_terminal_frame: false,
    };
    let (outcome, observer, _) = decode(&chunks, lenient);
    assert_eq!(outcome, DecodeOutcome::Completed { frames: 2 });
    assert_eq!(observer.completions, 1);
}
