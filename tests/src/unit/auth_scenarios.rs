use super::{script_session, test_runtime, transport, transport_with_store};
use finchat::ensure_signed_in;
use finchat_core::http::Method;
use finchat_core::identity::PrincipalCallback;
use finchat_core::testkit::{FakeAuthority, ScriptedBackend, ScriptedResponse};
use finchat_core::{
    AbortSignal, AuthEvent, ChatPhase, Credential, CredentialFile, CredentialStore,
    IdentityAuthority, Principal,
};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;

#[test]
fn concurrent_token_requests_share_one_refresh() {
    let runtime = test_runtime();
    let authority = Arc::new(FakeAuthority::signed_in("user-1").gated());
    let chat = transport(authority.clone(), Arc::new(ScriptedBackend::new()));

    let tokens = runtime.block_on(async {
        let callers = join_all((0..12).map(|_| chat.tokens().get_token(false)));
        let release = async {
            while authority.credential_calls() == 0 {
                tokio::task::yield_now().await;
            }
            authority.release(1);
        };
        futures::join!(callers, release).0
    });

    assert_eq!(authority.credential_calls(), 1);
    for token in tokens {
        assert_eq!(token.expect("credential").token(), "token-1");
    }
}

#[test]
fn concurrent_unauthorized_requests_share_one_forced_refresh() {
    let runtime = test_runtime();
    let authority = Arc::new(FakeAuthority::signed_in("user-1").gated());
    let backend = Arc::new(ScriptedBackend::new());
    backend.respond(Method::GET, "/api/sessions", ScriptedResponse::status(401));
    backend.respond(Method::GET, "/api/sessions", ScriptedResponse::status(401));
    backend.respond(Method::GET, "/api/sessions", ScriptedResponse::json(200, json!([])));
    backend.respond(Method::GET, "/api/sessions", ScriptedResponse::json(200, json!([])));
    let chat = transport(authority.clone(), backend.clone());

    let (first, second) = runtime.block_on(async {
        authority.release(1);
        chat.tokens().get_token(false).await.expect("initial credential");

        let client = chat.client();
        let requests = futures::future::join(
            client.get_json::<Vec<Value>>("sessions"),
            client.get_json::<Vec<Value>>("sessions"),
        );
        let release = async {
            while authority.credential_calls() < 2 {
                tokio::task::yield_now().await;
            }
            for _ in 0..50 {
                tokio::task::yield_now().await;
            }
            // Two permits so a missed join fails the assertion instead of hanging.
            authority.release(2);
        };
        futures::join!(requests, release).0
    });

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(authority.forced_calls(), 1);
    let retried: Vec<_> = backend
        .requests_to("/api/sessions")
        .into_iter()
        .skip(2)
        .map(|request| request.authorization)
        .collect();
    assert_eq!(
        retried,
        vec![Some("Bearer token-2".to_string()), Some("Bearer token-2".to_string())]
    );
}

#[test]
fn auth_expiry_removes_the_persisted_credential() {
    let runtime = test_runtime();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("credential.json");
    let store = Arc::new(CredentialStore::persistent(CredentialFile::new(&path)));
    let backend = Arc::new(ScriptedBackend::new());
    script_session(&backend, "s-1");
    backend.respond(Method::POST, "/api/sessions/s-1/chat", ScriptedResponse::status(401));
    backend.respond(Method::POST, "/api/sessions/s-1/chat", ScriptedResponse::status(401));
    let chat = transport_with_store(
        Arc::new(FakeAuthority::signed_in("user-1")),
        backend,
        store.clone(),
    );

    runtime
        .block_on(chat.sessions().ensure_session())
        .expect("session");
    assert!(path.exists(), "credential is persisted after the first refresh");

    let mut observer = finchat_core::testkit::RecordingObserver::default();
    let phase = runtime.block_on(chat.send_message("hi", &mut observer, AbortSignal::never()));

    assert_eq!(phase, ChatPhase::Failed);
    assert!(!path.exists());
    assert!(store.current().is_none());
}

#[test]
fn persisted_credential_is_reused_by_a_new_process() {
    let runtime = test_runtime();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("credential.json");
    let backend = Arc::new(ScriptedBackend::new());
    backend.respond(Method::GET, "/api/sessions", ScriptedResponse::json(200, json!([])));
    backend.respond(Method::GET, "/api/sessions", ScriptedResponse::json(200, json!([])));

    let first = Arc::new(FakeAuthority::signed_in("user-1"));
    let chat = transport_with_store(
        first.clone(),
        backend.clone(),
        Arc::new(CredentialStore::persistent(CredentialFile::new(&path))),
    );
    runtime
        .block_on(chat.sessions().list_sessions())
        .expect("listed");

    let second = Arc::new(FakeAuthority::signed_in("user-1"));
    let restarted = transport_with_store(
        second.clone(),
        backend.clone(),
        Arc::new(CredentialStore::persistent(CredentialFile::new(&path))),
    );
    runtime
        .block_on(restarted.sessions().list_sessions())
        .expect("listed again");

    assert_eq!(first.credential_calls(), 1);
    assert_eq!(second.credential_calls(), 0);
    let sent = backend.requests_to("/api/sessions");
    assert_eq!(sent[0].authorization, sent[1].authorization);
}

#[test]
fn identity_sign_out_clears_transport_state() {
    let runtime = test_runtime();
    let authority = Arc::new(FakeAuthority::signed_in("user-1"));
    let backend = Arc::new(ScriptedBackend::new());
    script_session(&backend, "s-1");
    let chat = transport(authority.clone(), backend);
    let mut events = chat.auth_events();
    runtime
        .block_on(chat.sessions().ensure_session())
        .expect("session");

    let watcher = chat.clone();
    let on_change: PrincipalCallback = Arc::new(move |principal| {
        if principal.is_none() {
            watcher.sign_out("identity provider ended the sign-in");
        }
    });
    let subscription = authority.on_principal_changed(on_change);
    authority.sign_out();

    assert_eq!(
        events.try_recv(),
        Ok(AuthEvent::SignedOut {
            reason: "identity provider ended the sign-in".into()
        })
    );
    assert!(chat.tokens().store().current().is_none());
    assert!(chat.sessions().current().is_none());
    subscription.unsubscribe();
}

#[test]
fn signed_out_principal_fails_chat_and_signs_out() {
    let runtime = test_runtime();
    let backend = Arc::new(ScriptedBackend::new());
    script_session(&backend, "s-1");
    let chat = transport(Arc::new(FakeAuthority::signed_out()), backend.clone());
    let mut events = chat.auth_events();
    let mut observer = finchat_core::testkit::RecordingObserver::default();

    let phase = runtime.block_on(chat.send_message("hi", &mut observer, AbortSignal::never()));

    assert_eq!(phase, ChatPhase::Failed);
    assert_eq!(observer.errors.len(), 1);
    assert!(matches!(events.try_recv(), Ok(AuthEvent::SignedOut { .. })));
    assert!(backend.requests().is_empty());
}

fn store_with_fresh_credential() -> CredentialStore {
    let store = CredentialStore::in_memory();
    store.replace(
        store.epoch(),
        Credential::new("stored", Principal::new("user-1"), None),
    );
    store
}

#[test]
fn startup_signs_in_even_with_a_fresh_stored_credential() {
    let runtime = test_runtime();
    let authority = FakeAuthority::signed_out();
    let store = store_with_fresh_credential();

    let principal = runtime
        .block_on(ensure_signed_in(&authority, &store, true))
        .expect("signed in");

    assert_eq!(authority.current_principal(), Some(principal));
}

#[test]
fn startup_without_sign_in_settings_uses_stored_credential() {
    let runtime = test_runtime();
    let authority = FakeAuthority::signed_out();
    let store = store_with_fresh_credential();

    let principal = runtime
        .block_on(ensure_signed_in(&authority, &store, false))
        .expect("stored credential");

    assert_eq!(principal, Principal::new("user-1"));
    assert!(authority.current_principal().is_none());
}

#[test]
fn startup_without_stored_credential_signs_in() {
    let runtime = test_runtime();
    let authority = FakeAuthority::signed_out();

    runtime
        .block_on(ensure_signed_in(&authority, &CredentialStore::in_memory(), false))
        .expect("signed in");

    assert!(authority.current_principal().is_some());
}
