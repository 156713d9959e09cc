pub mod audio;
pub mod billing;
pub mod cli;
pub mod config;
pub mod http;
pub mod session;
pub mod transcript;
pub mod transport;

pub use audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFile, AudioFrame, AudioSource,
    ChunkQueue, MicArbiter, MicLease,
};
pub use billing::{AuthProvider, BillingApi, BillingStatus, HttpBillingClient, TokenAuth};
pub use config::Config;
pub use http::{create_router, AppState};
pub use session::{SessionConfig, SessionController, SessionDeps, SessionError, SessionStatus};
pub use transcript::{DraftMerger, StringBuffer, TextBuffer};
pub use transport::{GatewayConnector, Link, WsConnector};
