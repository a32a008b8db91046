use crate::config::AppDefaults;
use crate::errors::{AppError, AppResult};
use crate::oauth::{build_client, TokenRecord};
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthorizationCode, CsrfToken, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope,
    TokenResponse,
};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const SERVICE_NAME: &str = "postbox-gmail-oauth";

pub const GMAIL_SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.compose",
];

/// How long to wait for the browser to come back to the loopback listener.
const CONSENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Run the browser consent flow and return a fresh grant.
pub async fn sign_in(defaults: &AppDefaults) -> AppResult<TokenRecord> {
    let client_id = defaults
        .client_id
        .as_deref()
        .ok_or_else(|| AppError::Config("GOOGLE_CLIENT_ID missing".into()))?;

    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| AppError::Unexpected(format!("failed to bind loopback port: {e}")))?;
    let port = listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| AppError::Unexpected(format!("failed to read local addr: {e}")))?;
    let redirect = format!("http://127.0.0.1:{port}");

    let client = build_client(
        client_id,
        defaults.client_secret.as_deref(),
        &defaults.auth_url,
        &defaults.token_url,
    )?
    .set_redirect_uri(
        RedirectUrl::new(redirect.clone())
            .map_err(|e| AppError::Config(format!("invalid redirect uri {redirect}: {e}")))?,
    );

    let (auth_url, verifier, csrf) = consent_url(&client);
    info!(account = %defaults.account, redirect = %redirect, "Opening browser for Google consent");
    open_in_browser(&auth_url);

    let callback = tokio::time::timeout(CONSENT_TIMEOUT, wait_for_callback(listener))
        .await
        .map_err(|_| AppError::Unexpected("timed out waiting for the consent redirect".into()))??;
    if callback.state != *csrf.secret() {
        return Err(AppError::Unexpected("consent redirect carried a foreign state".into()));
    }

    let exchange = client
        .exchange_code(AuthorizationCode::new(callback.code))
        .set_pkce_verifier(verifier)
        .request_async(async_http_client);
    let token_res = tokio::time::timeout(defaults.request_timeout, exchange)
        .await
        .map_err(|_| AppError::Unexpected("token exchange timed out".into()))?
        .map_err(|e| AppError::Unexpected(format!("token exchange failed: {e}")))?;

    if token_res.refresh_token().is_none() {
        warn!("Grant carried no refresh token; the session ends when the access token expires");
    }
    info!(account = %defaults.account, "Signed in");
    Ok(TokenRecord::from_grant(
        token_res.access_token().secret().to_string(),
        token_res.refresh_token().map(|r| r.secret().to_string()),
        token_res.expires_in(),
    ))
}

/// Forget the stored grant for `store`'s account.
pub fn sign_out(store: &TokenStore) -> AppResult<()> {
    store.delete()?;
    info!(account = %store.account, "Signed out");
    Ok(())
}

fn consent_url(client: &BasicClient) -> (String, PkceCodeVerifier, CsrfToken) {
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    let mut req = client
        .authorize_url(CsrfToken::new_random)
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .set_pkce_challenge(challenge);
    for scope in GMAIL_SCOPES {
        req = req.add_scope(Scope::new(scope.to_string()));
    }
    let (url, csrf) = req.url();
    (url.to_string(), verifier, csrf)
}

#[derive(Debug, PartialEq, Eq)]
struct Callback {
    code: String,
    state: String,
}

async fn wait_for_callback(listener: TcpListener) -> AppResult<Callback> {
    loop {
        let (mut stream, _) = listener
            .accept()
            .await
            .map_err(|e| AppError::Unexpected(format!("redirect accept failed: {e}")))?;

        let mut buf = [0u8; 4096];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| AppError::Unexpected(format!("reading auth callback failed: {e}")))?;
        let request = String::from_utf8_lossy(&buf[..n]);

        match parse_callback(&request) {
            Ok(Some(callback)) => {
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nSigned in. You can close this tab.",
                    )
                    .await;
                return Ok(callback);
            }
            Ok(None) => {
                // Favicon and other stray browser requests.
                let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await;
            }
            Err(err) => {
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain\r\n\r\nSign-in failed. Return to the terminal.",
                    )
                    .await;
                return Err(err);
            }
        }
    }
}

/// `Ok(None)` for requests that are not the consent redirect.
fn parse_callback(request: &str) -> AppResult<Option<Callback>> {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| AppError::Unexpected("invalid HTTP request".into()))?;
    let parsed = url::Url::parse(&format!("http://localhost{path}"))
        .map_err(|e| AppError::Unexpected(format!("failed to parse callback url: {e}")))?;

    let param = |name: &str| {
        parsed
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.to_string())
    };

    if let Some(error) = param("error") {
        return Err(AppError::Unexpected(format!("consent denied: {error}")));
    }
    let Some(code) = param("code") else {
        debug!(path, "Ignoring non-callback request");
        return Ok(None);
    };
    Ok(Some(Callback {
        code,
        state: param("state").unwrap_or_default(),
    }))
}

fn open_in_browser(url: &str) {
    let attempt = if cfg!(target_os = "macos") {
        std::process::Command::new("open").arg(url).status()
    } else if cfg!(target_os = "windows") {
        std::process::Command::new("rundll32.exe")
            .args(["url.dll,FileProtocolHandler", url])
            .status()
    } else {
        std::process::Command::new("xdg-open").arg(url).status()
    };
    if let Err(e) = attempt {
        warn!("Could not auto-open browser: {e}. Open this URL manually:\n{url}");
    } else {
        println!("If your browser did not open, navigate to:\n{url}");
    }
}

/// Keyring-backed storage for one account's `TokenRecord`, with a private temp
/// file as fallback when no keyring is reachable.
#[derive(Clone, Debug)]
pub struct TokenStore {
    account: String,
    fallback_dir: PathBuf,
}

impl TokenStore {
    pub fn for_account(account: &str) -> Self {
        Self {
            account: account.to_string(),
            fallback_dir: std::env::temp_dir(),
        }
    }

    /// The fallback file only exists while it holds the newest record, so it wins.
    pub fn load(&self) -> AppResult<Option<TokenRecord>> {
        if let Some(record) = self.load_file()? {
            return Ok(Some(record));
        }
        match self.load_keyring() {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => {}
            Err(e) => warn!("Keyring unavailable: {e}"),
        }
        Ok(None)
    }

    pub fn save(&self, record: &TokenRecord) -> AppResult<()> {
        let serialized =
            serde_json::to_string(record).map_err(|e| AppError::Unexpected(format!("{e}")))?;

        match self.save_keyring(&serialized) {
            Ok(()) => self.remove_file(),
            Err(e) => {
                warn!("Keyring save failed ({e}); writing to temp file as fallback");
                self.save_file(&serialized)
            }
        }
    }

    pub fn delete(&self) -> AppResult<()> {
        if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, &self.account) {
            match entry.delete_password() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => warn!("Keyring delete failed: {e}"),
            }
        }
        self.remove_file()
    }

    fn fallback_path(&self) -> PathBuf {
        self.fallback_dir
            .join(format!("postbox_token_{}.json", self.account))
    }

    fn load_keyring(&self) -> Result<Option<TokenRecord>, String> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.account)
            .map_err(|e| format!("keyring entry error: {e}"))?;
        match entry.get_password() {
            Ok(pwd) => serde_json::from_str(&pwd)
                .map(Some)
                .map_err(|e| format!("keyring token decode: {e}")),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(format!("keyring read: {e}")),
        }
    }

    fn save_keyring(&self, serialized: &str) -> Result<(), String> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.account)
            .map_err(|e| format!("keyring entry error: {e}"))?;
        entry
            .set_password(serialized)
            .map_err(|e| format!("keyring write: {e}"))
    }

    fn load_file(&self) -> AppResult<Option<TokenRecord>> {
        let path = self.fallback_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::Unexpected(format!("reading token file: {e}"))),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| AppError::Unexpected(format!("token file {}: {e}", path.display())))
    }

    fn remove_file(&self) -> AppResult<()> {
        match fs::remove_file(self.fallback_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Unexpected(format!("removing token file: {e}"))),
        }
    }

    fn save_file(&self, serialized: &str) -> AppResult<()> {
        let path = self.fallback_path();

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| AppError::Unexpected(format!("opening temp token file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
        }

        file.write_all(serialized.as_bytes())
            .map_err(|e| AppError::Unexpected(format!("writing token file: {e}")))?;
        file.sync_all()
            .map_err(|e| AppError::Unexpected(format!("syncing token file: {e}")))?;
        warn!(
            path = %path.display(),
            "Token saved to temp file due to keyring issues"
        );
        Ok(())
    }
}
