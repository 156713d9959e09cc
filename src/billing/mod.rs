pub mod auth;
pub mod client;

pub use auth::{
    AuthProvider, Credentials, LoginMode, LoginPrompt, StaticLogin, StoredAccount, TokenAuth,
    TokenStore,
};
pub use client::{
    format_balance_minutes, BillingApi, BillingStatus, Endpoint, HttpBillingClient,
    DEFAULT_BACKEND_URL,
};
