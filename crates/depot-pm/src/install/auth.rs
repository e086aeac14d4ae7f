//! Retry-on-401
//!
//! An operation failing with `AuthRequired` triggers one credential prompt
//! and one retry. Prompts are serialized; a task whose 401 raced with
//! another task's prompt retries with the fresh credentials instead of
//! prompting again.

use super::InstallError;
use crate::prompt::CredentialPrompt;
use crate::repository::{parse_endpoint, RepositoryClient};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) struct AuthRetry {
    client: Arc<RepositoryClient>,
    prompt: Arc<dyn CredentialPrompt>,
    lock: Mutex<()>,
    /// Bumped every time new credentials are installed
    generation: AtomicU64,
}

impl AuthRetry {
    pub(crate) fn new(client: Arc<RepositoryClient>, prompt: Arc<dyn CredentialPrompt>) -> Self {
        Self {
            client,
            prompt,
            lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `op`, prompting and retrying exactly once if it needs credentials
    pub(crate) async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, InstallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InstallError>>,
    {
        let seen = self.generation.load(Ordering::SeqCst);
        let err = match op().await {
            Err(err) => err,
            ok => return ok,
        };
        let Some(url) = err.auth_url().map(str::to_string) else {
            return Err(err);
        };

        self.authenticate(&url, seen).await?;
        op().await
    }

    async fn authenticate(&self, url: &str, seen: u64) -> Result<(), InstallError> {
        let _guard = self.lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != seen {
            log::debug!("Credentials changed while waiting, retrying {}", url);
            return Ok(());
        }

        log::info!("Authentication required for {}", url);
        let parsed = parse_endpoint(url)?;
        let credentials = self.prompt.credentials(url).await?;
        self.client.set_credentials(&parsed, credentials);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
