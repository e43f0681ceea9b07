mod auth_scenarios;
mod decode_properties;
mod transport_scenarios;

use finchat_core::http::Method;
use finchat_core::testkit::{FakeAuthority, ScriptedBackend, ScriptedResponse};
use finchat_core::{ChatTransport, CredentialStore, TransportConfig};
use std::sync::Arc;

pub(crate) fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

pub(crate) fn base_url() -> url::Url {
    url::Url::parse("http://backend.test/api/").expect("url")
}

pub(crate) fn transport_with_store(
    authority: Arc<FakeAuthority>,
    backend: Arc<ScriptedBackend>,
    store: Arc<CredentialStore>,
) -> ChatTransport {
    ChatTransport::new(authority, backend, store, TransportConfig::new(base_url()))
}

pub(crate) fn transport(authority: Arc<FakeAuthority>, backend: Arc<ScriptedBackend>) -> ChatTransport {
    transport_with_store(authority, backend, Arc::new(CredentialStore::in_memory()))
}

pub(crate) fn script_session(backend: &ScriptedBackend, id: &str) {
    backend.respond(
        Method::POST,
        "/api/sessions",
        ScriptedResponse::json(200, serde_json::json!({ "id": id })),
    );
}
