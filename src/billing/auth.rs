use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::BillingApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginMode {
    Login,
    Register,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub mode: LoginMode,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(mode: LoginMode, username: &str, password: &str) -> Self {
        Self {
            mode,
            username: username.trim().to_string(),
            password: password.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let user = self.username.chars().count();
        if !(3..=32).contains(&user) {
            bail!("Username must be 3-32 characters");
        }
        let pass = self.password.chars().count();
        if !(6..=64).contains(&pass) {
            bail!("Password must be 6-64 characters");
        }
        Ok(())
    }
}

/// Source of credentials when no valid token is cached
#[async_trait::async_trait]
pub trait LoginPrompt: Send + Sync {
    /// `None` means the user declined to log in
    async fn credentials(&self) -> Result<Option<Credentials>>;
}

/// Credentials fixed up front (CLI flags, config)
#[derive(Debug, Clone, Default)]
pub struct StaticLogin {
    credentials: Option<Credentials>,
}

impl StaticLogin {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self { credentials }
    }
}

#[async_trait::async_trait]
impl LoginPrompt for StaticLogin {
    async fn credentials(&self) -> Result<Option<Credentials>> {
        Ok(self.credentials.clone())
    }
}

/// Persisted account record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredAccount {
    pub token: String,
    pub username: String,
}

/// Account record, optionally backed by a JSON file
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    path: Option<PathBuf>,
    account: StoredAccount,
}

impl TokenStore {
    pub fn in_memory(token: Option<String>) -> Self {
        Self {
            path: None,
            account: StoredAccount {
                token: token.unwrap_or_default(),
                username: String::new(),
            },
        }
    }

    /// Load from `path`; a missing file is an empty store
    pub fn load(path: &Path) -> Result<Self> {
        let account = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read account file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Malformed account file {}", path.display()))?
        } else {
            StoredAccount::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            account,
        })
    }

    pub fn token(&self) -> Option<&str> {
        let token = self.account.token.trim();
        (!token.is_empty()).then_some(token)
    }

    pub fn username(&self) -> &str {
        &self.account.username
    }

    pub fn set(&mut self, account: StoredAccount) -> Result<()> {
        self.account = account;
        self.persist()
    }

    pub fn clear_token(&mut self) -> Result<()> {
        self.account.token.clear();
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let text = serde_json::to_string_pretty(&self.account)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write account file {}", path.display()))?;
        Ok(())
    }
}

/// Supplies session tokens to the controller
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    /// A verified token, or `None` if the user could not be authenticated
    async fn ensure_token(&self) -> Result<Option<String>>;

    /// Drop the cached token and authenticate again
    async fn switch_account(&self) -> Result<Option<String>> {
        self.ensure_token().await
    }

    /// End the server session and forget the account
    async fn logout(&self) -> Result<()>;
}

/// Cached-token auth: verify with `me`, else log in through the prompt
pub struct TokenAuth {
    api: Arc<dyn BillingApi>,
    store: Mutex<TokenStore>,
    prompt: Box<dyn LoginPrompt>,
}

impl TokenAuth {
    pub fn new(api: Arc<dyn BillingApi>, store: TokenStore, prompt: Box<dyn LoginPrompt>) -> Self {
        Self {
            api,
            store: Mutex::new(store),
            prompt,
        }
    }

    pub async fn cached_token(&self) -> Option<String> {
        self.store.lock().await.token().map(str::to_string)
    }

    async fn login_interactive(&self) -> Result<Option<String>> {
        let Some(creds) = self.prompt.credentials().await? else {
            return Ok(None);
        };
        creds.validate()?;

        let token = match creds.mode {
            LoginMode::Login => self.api.login(&creds.username, &creds.password).await?,
            LoginMode::Register => self.api.register(&creds.username, &creds.password).await?,
        };
        info!("Logged in as {}", creds.username);

        self.store.lock().await.set(StoredAccount {
            token: token.clone(),
            username: creds.username,
        })?;
        Ok(Some(token))
    }
}

#[async_trait::async_trait]
impl AuthProvider for TokenAuth {
    async fn ensure_token(&self) -> Result<Option<String>> {
        if let Some(token) = self.cached_token().await {
            match self.api.me(&token).await {
                Ok(_) => return Ok(Some(token)),
                Err(e) => {
                    debug!("Cached token rejected: {}", e);
                    self.store.lock().await.clear_token()?;
                }
            }
        }
        self.login_interactive().await
    }

    async fn switch_account(&self) -> Result<Option<String>> {
        self.store.lock().await.clear_token()?;
        self.login_interactive().await
    }

    async fn logout(&self) -> Result<()> {
        if let Some(token) = self.cached_token().await {
            // Local logout proceeds even if the server call fails
            if let Err(e) = self.api.logout(&token).await {
                warn!("Server logout failed: {}", e);
            }
        }
        self.store.lock().await.set(StoredAccount::default())?;
        info!("Logged out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_bounds() {
        assert!(Credentials::new(LoginMode::Login, "bob", "secret").validate().is_ok());
        assert!(Credentials::new(LoginMode::Login, "ab", "secret").validate().is_err());
        assert!(Credentials::new(LoginMode::Login, &"x".repeat(33), "secret")
            .validate()
            .is_err());
        assert!(Credentials::new(LoginMode::Register, "bob", "12345").validate().is_err());
        assert!(Credentials::new(LoginMode::Register, "bob", &"p".repeat(65))
            .validate()
            .is_err());
        // Length counts chars, not bytes
        assert!(Credentials::new(LoginMode::Login, "张三丰", "密码密码密码").validate().is_ok());
    }

    #[test]
    fn test_username_trimmed() {
        let creds = Credentials::new(LoginMode::Login, "  bob ", "secret");
        assert_eq!(creds.username, "bob");
    }

    #[test]
    fn test_token_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account.json");

        let mut store = TokenStore::load(&path).unwrap();
        assert_eq!(store.token(), None);
        store
            .set(StoredAccount {
                token: "tok".to_string(),
                username: "bob".to_string(),
            })
            .unwrap();

        let mut reloaded = TokenStore::load(&path).unwrap();
        assert_eq!(reloaded.token(), Some("tok"));
        assert_eq!(reloaded.username(), "bob");

        reloaded.clear_token().unwrap();
        let cleared = TokenStore::load(&path).unwrap();
        assert_eq!(cleared.token(), None);
        assert_eq!(cleared.username(), "bob");
    }

    #[test]
    fn test_blank_token_is_absent() {
        assert_eq!(TokenStore::in_memory(Some("  ".to_string())).token(), None);
        assert_eq!(TokenStore::in_memory(None).token(), None);
    }
}
