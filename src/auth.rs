//! OAuth2 authentication and credential plumbing for the Gmail hub

use async_trait::async_trait;
use google_gmail1::common::GetToken;
use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;

use crate::collaborators::CredentialProvider;
use crate::error::{Result, TriageError};

/// Gmail API scopes required by the pipeline
///
/// - gmail.modify: read metadata, label, archive and trash (no permanent deletion)
/// - gmail.labels: label management
pub const REQUIRED_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.labels",
];

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Build a hub whose tokens come from `auth`
pub fn build_hub<A>(auth: A) -> Result<GmailHub>
where
    A: GetToken + Clone + 'static,
{
    // HTTP/1 works better with google-gmail1 than the HTTP/2 default
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| TriageError::AuthError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, auth))
}

/// Token source bound to one mailbox, backed by a [`CredentialProvider`]
///
/// A failed lookup surfaces from the hub as a missing token, which the error
/// conversion turns into `CredentialExpired`.
#[derive(Clone)]
pub struct MailboxTokenSource {
    provider: Arc<dyn CredentialProvider>,
    mailbox_id: String,
}

impl MailboxTokenSource {
    pub fn new(provider: Arc<dyn CredentialProvider>, mailbox_id: &str) -> Self {
        Self {
            provider,
            mailbox_id: mailbox_id.to_string(),
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl GetToken for MailboxTokenSource {
    fn get_token<'a>(
        &'a self,
        _scopes: &'a [&str],
    ) -> Pin<
        Box<
            dyn Future<Output = std::result::Result<Option<String>, BoxError>>
                + Send
                + 'a,
        >,
    > {
        Box::pin(async move {
            self.provider
                .get_valid_credential(&self.mailbox_id)
                .await
                .map(Some)
                .map_err(|e| Box::new(e) as BoxError)
        })
    }
}

/// Refuses the interactive consent screen
///
/// Background workers must never block on a browser prompt; a token that can
/// no longer refresh means the user has to run `auth` again.
struct NonInteractiveDelegate;

impl InstalledFlowDelegate for NonInteractiveDelegate {
    fn present_user_url<'a>(
        &'a self,
        _url: &'a str,
        _need_code: bool,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<String, String>> + Send + 'a>> {
        Box::pin(async { Err("re-authorization required".to_string()) })
    }
}

/// Token cache path for a mailbox
pub fn token_path(token_dir: &Path, mailbox_id: &str) -> PathBuf {
    token_dir.join(format!("{}.json", mailbox_id))
}

/// Credential provider over the installed-flow token cache written by `auth`
pub struct OAuthCredentialProvider {
    credentials_path: PathBuf,
    token_dir: PathBuf,
    authenticators: Mutex<HashMap<String, Arc<dyn GetToken>>>,
}

impl OAuthCredentialProvider {
    pub fn new(credentials_path: &Path, token_dir: &Path) -> Self {
        Self {
            credentials_path: credentials_path.to_path_buf(),
            token_dir: token_dir.to_path_buf(),
            authenticators: Mutex::new(HashMap::new()),
        }
    }

    async fn authenticator(&self, mailbox_id: &str) -> Result<Arc<dyn GetToken>> {
        let mut authenticators = self.authenticators.lock().await;
        if let Some(auth) = authenticators.get(mailbox_id) {
            return Ok(Arc::clone(auth));
        }

        let cache = token_path(&self.token_dir, mailbox_id);
        if !cache.exists() {
            return Err(TriageError::CredentialExpired(format!(
                "no token cache for mailbox {}",
                mailbox_id
            )));
        }

        let secret = yup_oauth2::read_application_secret(&self.credentials_path)
            .await
            .map_err(|e| TriageError::AuthError(format!("Failed to read credentials: {}", e)))?;

        let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
            secret,
            yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
        )
        .persist_tokens_to_disk(cache)
        .flow_delegate(Box::new(NonInteractiveDelegate))
        .build()
        .await
        .map_err(|e| TriageError::AuthError(format!("Failed to build authenticator: {}", e)))?;

        let auth: Arc<dyn GetToken> = Arc::new(auth);
        authenticators.insert(mailbox_id.to_string(), Arc::clone(&auth));
        Ok(auth)
    }
}

#[async_trait]
impl CredentialProvider for OAuthCredentialProvider {
    async fn get_valid_credential(&self, mailbox_id: &str) -> Result<String> {
        let auth = self.authenticator(mailbox_id).await?;

        match auth.get_token(REQUIRED_SCOPES).await {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(TriageError::CredentialExpired(format!(
                "no token issued for mailbox {}",
                mailbox_id
            ))),
            Err(e) => {
                warn!(mailbox_id, "Token refresh failed: {}", e);
                self.authenticators.lock().await.remove(mailbox_id);
                Err(TriageError::CredentialExpired(e.to_string()))
            }
        }
    }
}

/// Run the browser consent flow and cache the token at `token_cache_path`
///
/// Returns a hub bound to the fresh authenticator so the caller can look up
/// the account profile.
pub async fn authorize_interactive(
    credentials_path: &Path,
    token_cache_path: &Path,
) -> Result<GmailHub> {
    let secret = yup_oauth2::read_application_secret(credentials_path)
        .await
        .map_err(|e| TriageError::AuthError(format!("Failed to read credentials: {}", e)))?;

    // HTTPRedirect opens a browser for user authorization
    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| TriageError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    // Pre-authenticate so the token is cached with the full scope set
    auth.token(REQUIRED_SCOPES)
        .await
        .map_err(|e| TriageError::AuthError(format!("Failed to obtain token: {}", e)))?;
    debug!("Token cached at {:?}", token_cache_path);

    secure_token_file(token_cache_path).await?;
    build_hub(auth)
}

/// Restrict the token cache to its owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

/// Windows uses ACLs; the token directory inherits them
#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}
