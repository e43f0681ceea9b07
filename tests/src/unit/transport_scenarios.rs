use super::{script_session, test_runtime, transport};
use finchat::TerminalObserver;
use finchat_core::http::Method;
use finchat_core::testkit::{
    chunked_body, FakeAuthority, RecordingObserver, ScriptedBackend, ScriptedResponse,
};
use finchat_core::{AbortSignal, AuthEvent, ChatError, ChatPhase, SessionId, StreamMessage};
use futures::future::join_all;
use std::sync::Arc;

const CHAT: &str = "/api/sessions/s-1/chat";

#[test]
fn stale_credential_refreshes_once_and_reuses_session() {
    let runtime = test_runtime();
    let authority = Arc::new(FakeAuthority::signed_in("user-1"));
    let backend = Arc::new(ScriptedBackend::new());
    script_session(&backend, "s-1");
    let chat = transport(authority.clone(), backend.clone());
    runtime
        .block_on(chat.sessions().ensure_session())
        .expect("session");
    assert_eq!(authority.credential_calls(), 1);

    // Idle period: the cached credential goes stale.
    chat.tokens().store().mark_stale();
    let (reply, _) = ScriptedResponse::frames(&[
        r#"{"delta":"Your "}{"delta":"spending "}"#,
        r#"{"delta":"is "}"#,
        r#"{"delta":"on track."}{"done":true}"#,
    ]);
    backend.respond(Method::POST, CHAT, reply);
    let mut observer = RecordingObserver::default();

    let phase = runtime.block_on(chat.send_message(
        "How am I doing?",
        &mut observer,
        AbortSignal::never(),
    ));

    assert_eq!(phase, ChatPhase::Completed);
    assert_eq!(authority.credential_calls(), 2);
    assert_eq!(authority.forced_calls(), 0);
    assert_eq!(backend.count(&Method::POST, "/api/sessions"), 1);
    assert_eq!(observer.events.len(), 5);
    assert_eq!(observer.text(), "Your spending is on track.");
    assert!(observer.events[4].done);
    assert_eq!(observer.completions, 1);
    assert!(observer.errors.is_empty());
    assert_eq!(
        backend.requests_to(CHAT)[0].authorization.as_deref(),
        Some("Bearer token-2")
    );
}

#[test]
fn unauthorized_chat_is_retried_once_with_refreshed_credential() {
    let runtime = test_runtime();
    let authority = Arc::new(FakeAuthority::signed_in("user-1"));
    let backend = Arc::new(ScriptedBackend::new());
    script_session(&backend, "s-1");
    backend.respond(Method::POST, CHAT, ScriptedResponse::status(401));
    backend.respond(
        Method::POST,
        CHAT,
        ScriptedResponse::frames(&[r#"{"delta":"ok"}{"done":true}"#]).0,
    );
    let chat = transport(authority.clone(), backend.clone());
    let mut events = chat.auth_events();
    let mut observer = RecordingObserver::default();

    let phase = runtime.block_on(chat.send_message("hi", &mut observer, AbortSignal::never()));

    assert_eq!(phase, ChatPhase::Completed);
    let sent = backend.requests_to(CHAT);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].authorization.as_deref(), Some("Bearer token-1"));
    assert_eq!(sent[1].authorization.as_deref(), Some("Bearer token-2"));
    assert_eq!(sent[0].idempotency_key, sent[1].idempotency_key);
    assert_eq!(sent[0].body, sent[1].body);
    assert_eq!(authority.forced_calls(), 1);
    assert_eq!(observer.text(), "ok");
    assert!(events.try_recv().is_err());
}

#[test]
fn unauthorized_twice_surfaces_auth_expired_and_signs_out_once() {
    let runtime = test_runtime();
    let authority = Arc::new(FakeAuthority::signed_in("user-1"));
    let backend = Arc::new(ScriptedBackend::new());
    script_session(&backend, "s-1");
    backend.respond(Method::POST, CHAT, ScriptedResponse::status(401));
    backend.respond(Method::POST, CHAT, ScriptedResponse::status(401));
    let chat = transport(authority, backend.clone());
    let mut events = chat.auth_events();
    let mut observer = RecordingObserver::default();

    let phase = runtime.block_on(chat.send_message("hi", &mut observer, AbortSignal::never()));

    assert_eq!(phase, ChatPhase::Failed);
    assert!(matches!(observer.errors.as_slice(), [ChatError::AuthExpired(_)]));
    assert!(observer.events.is_empty());
    assert_eq!(observer.completions, 0);
    assert_eq!(backend.requests_to(CHAT).len(), 2);
    assert!(matches!(events.try_recv(), Ok(AuthEvent::SignedOut { .. })));
    assert!(events.try_recv().is_err());
    assert!(chat.tokens().store().current().is_none());
    assert!(chat.sessions().current().is_none());
}

#[test]
fn cancel_after_second_of_five_frames_is_silent_and_releases_body() {
    let runtime = test_runtime();
    let backend = Arc::new(ScriptedBackend::new());
    script_session(&backend, "s-1");
    let (body, released, feed) = chunked_body();
    backend.respond(Method::POST, CHAT, ScriptedResponse::body(200, body));
    let chat = transport(Arc::new(FakeAuthority::signed_in("user-1")), backend);

    let (seen, tail, phase) = runtime.block_on(async {
        let mut stream = chat.start_message("hi");
        let mut seen = Vec::new();
        for frame in [r#"{"delta":"one"}"#, r#"{"delta":"two"}"#] {
            feed.send(frame);
            seen.push(stream.next_message().await.expect("frame"));
        }
        stream.abort();
        feed.send(r#"{"delta":"three"}"#);
        feed.send(r#"{"delta":"four"}"#);
        feed.send(r#"{"done":true}"#);

        let mut tail = Vec::new();
        while let Some(message) = stream.next_message().await {
            tail.push(message);
        }
        (seen, tail, stream.wait().await)
    });

    assert_eq!(seen.len(), 2);
    assert!(seen
        .iter()
        .all(|message| matches!(message, StreamMessage::Next(_))));
    assert!(tail.is_empty(), "no calls after cancellation: {tail:?}");
    assert_eq!(phase, ChatPhase::Canceled);
    assert!(released.is_released());
}

#[test]
fn concurrent_callers_create_one_session() {
    let runtime = test_runtime();
    let backend = Arc::new(ScriptedBackend::new());
    script_session(&backend, "s-1");
    let chat = transport(Arc::new(FakeAuthority::signed_in("user-1")), backend.clone());

    let ids = runtime.block_on(join_all((0..16).map(|_| chat.sessions().ensure_session())));

    assert_eq!(backend.count(&Method::POST, "/api/sessions"), 1);
    assert!(ids
        .into_iter()
        .all(|id| id.expect("session") == SessionId::new("s-1")));
}

#[test]
fn concurrent_messages_share_the_new_session() {
    let runtime = test_runtime();
    let backend = Arc::new(ScriptedBackend::new());
    script_session(&backend, "s-1");
    for reply in ["first", "second"] {
        let frames = format!(r#"{{"delta":"{reply}"}}{{"done":true}}"#);
        backend.respond(
            Method::POST,
            CHAT,
            ScriptedResponse::frames(&[frames.as_str()]).0,
        );
    }
    let chat = transport(Arc::new(FakeAuthority::signed_in("user-1")), backend.clone());

    let phases = runtime.block_on(async {
        let a = chat.start_message("one");
        let b = chat.start_message("two");
        (a.wait().await, b.wait().await)
    });

    assert_eq!(phases, (ChatPhase::Completed, ChatPhase::Completed));
    assert_eq!(backend.count(&Method::POST, "/api/sessions"), 1);
    assert_eq!(backend.requests_to(CHAT).len(), 2);
}

#[test]
fn terminal_observer_prints_streamed_reply() {
    let runtime = test_runtime();
    let backend = Arc::new(ScriptedBackend::new());
    script_session(&backend, "s-1");
    backend.respond(
        Method::POST,
        CHAT,
        ScriptedResponse::frames(&[
            r#"{"content":{"parts":[{"text":"Rent is "}]}}"#,
            r#"{"delta":"42% of income.","tool_results":[{"chart":"bar"}]}{"done":"true"}"#,
        ])
        .0,
    );
    let chat = transport(Arc::new(FakeAuthority::signed_in("user-1")), backend);
    let mut observer = TerminalObserver::new(Vec::new(), true);

    let phase = runtime.block_on(chat.send_message("rent?", &mut observer, AbortSignal::never()));

    assert_eq!(phase, ChatPhase::Completed);
    assert_eq!(observer.reply(), "Rent is 42% of income.");
    let printed = String::from_utf8(observer.into_inner()).expect("utf-8");
    assert!(printed.contains(r#"[tool] {"chart":"bar"}"#));
}
