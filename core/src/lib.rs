pub mod auth;
pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod http;
pub mod identity;
pub mod session;
pub mod singleflight;
pub mod state;
pub mod store;
pub mod telemetry;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod token;
pub mod transport;

pub use auth::{AuthEvent, Credential, CredentialStore, Principal, SignOutHook};
pub use config::{ClientSettings, ConfigError};
pub use decoder::{DecodeOutcome, Decoded, DecoderOptions, FrameDecoder, StreamDecoder};
pub use error::{
    AuthExpiredError, ChatError, CredentialError, DecodeError, RequestError, SessionCreationError,
    TransportError,
};
pub use event::{ChannelObserver, Observer, ObserverGuard, StreamEvent, StreamMessage};
pub use http::{AuthenticatedHttpClient, HttpBackend, ReqwestBackend, UnauthorizedRetry};
pub use identity::{IdentityAuthority, PasswordAuthority, Subscription};
pub use session::{SessionId, SessionRegistry, SessionSummary, SessionUpdate};
pub use state::{abort_pair, AbortHandle, AbortSignal, ChatPhase};
pub use store::CredentialFile;
pub use token::TokenProvider;
pub use transport::{ChatStream, ChatTransport, TransportConfig};
