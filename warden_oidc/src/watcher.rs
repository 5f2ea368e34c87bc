//! Keeps a verified profile in step with the stored identity token

use tokio::sync::{broadcast, watch};
use warden_tokens::{IdToken, TaskHandle};

use crate::{KeySetVerifier, Profile, TokenVerificationError};

const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Verifies each new identity token and publishes the resulting [`Profile`]
///
/// Tokens are verified one at a time in arrival order. If the token changes
/// while a verification is in progress, the stale result is discarded and
/// the newer token is verified instead.
///
/// When the identity token is cleared or fails verification, the profile
/// becomes `None`. Failures are also broadcast on [`subscribe_errors`].
///
/// [`subscribe_errors`]: ProfileWatcher::subscribe_errors
#[derive(Debug)]
pub struct ProfileWatcher {
    profile: watch::Sender<Option<Profile>>,
    errors: broadcast::Sender<TokenVerificationError>,
    _task: TaskHandle,
}

impl ProfileWatcher {
    /// Spawns a watcher over the given identity token stream
    ///
    /// The token held by `id_tokens` when this is called is verified
    /// immediately.
    pub fn spawn(verifier: KeySetVerifier, id_tokens: watch::Receiver<Option<IdToken>>) -> Self {
        let profile = watch::Sender::new(None);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        let task = TaskHandle::spawn(
            "profile watcher",
            watch_id_tokens(verifier, id_tokens, profile.clone(), errors.clone()),
        );

        Self {
            profile,
            errors,
            _task: task,
        }
    }

    /// The most recently verified profile
    pub fn current_profile(&self) -> Option<Profile> {
        self.profile.borrow().clone()
    }

    /// Subscribes to profile changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Profile>> {
        self.profile.subscribe()
    }

    /// Subscribes to verification failures
    pub fn subscribe_errors(&self) -> broadcast::Receiver<TokenVerificationError> {
        self.errors.subscribe()
    }

    /// Whether the current user has completed onboarding
    pub fn is_onboarded(&self) -> bool {
        self.profile
            .borrow()
            .as_ref()
            .map_or(false, Profile::is_onboarded)
    }

    /// Whether the current user may access more than one tenant
    pub fn has_multi_tenant_access(&self) -> bool {
        self.profile
            .borrow()
            .as_ref()
            .map_or(false, Profile::has_multi_tenant_access)
    }

    /// Clears the held profile without touching the identity token
    pub fn clear_profile(&self) {
        publish(&self.profile, None);
    }
}

async fn watch_id_tokens(
    verifier: KeySetVerifier,
    mut id_tokens: watch::Receiver<Option<IdToken>>,
    profile: watch::Sender<Option<Profile>>,
    errors: broadcast::Sender<TokenVerificationError>,
) {
    loop {
        let token = id_tokens.borrow_and_update().clone();

        let result = verify_and_update(&verifier, token.as_ref()).await;

        if id_tokens.has_changed().unwrap_or(false) {
            tracing::debug!("identity token changed during verification, discarding result");
            continue;
        }

        match result {
            Ok(next) => {
                publish(&profile, next);
            }
            Err(err) => {
                publish(&profile, None);
                let error: &dyn std::error::Error = &err;
                tracing::warn!(error, "identity token verification failed");
                // Nobody listening is fine
                let _ = errors.send(err);
            }
        }

        if id_tokens.changed().await.is_err() {
            tracing::debug!("identity token source closed, stopping profile watcher");
            break;
        }
    }
}

fn publish(profile: &watch::Sender<Option<Profile>>, next: Option<Profile>) {
    profile.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

async fn verify_and_update(
    verifier: &KeySetVerifier,
    token: Option<&IdToken>,
) -> Result<Option<Profile>, TokenVerificationError> {
    let Some(token) = token else {
        return Ok(None);
    };

    let claims = verifier.verify(token).await?;
    let profile = Profile::from(claims);
    tracing::debug!(profile.id = %profile.id, "identity token verified");
    Ok(Some(profile))
}
