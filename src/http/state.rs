use crate::session::SessionController;
use crate::transcript::StringBuffer;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The voice note session
    pub controller: SessionController,

    /// Buffer the transcript is written into
    pub buffer: Arc<Mutex<StringBuffer>>,
}

impl AppState {
    pub fn new(controller: SessionController, buffer: Arc<Mutex<StringBuffer>>) -> Self {
        Self { controller, buffer }
    }
}
