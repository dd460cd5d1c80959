use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{oneshot, Mutex};

use crate::errors::Result;

/// Source tag carried by the probe's reply message so the content side can
/// tell it apart from other page traffic.
pub const AUTH_MESSAGE_SOURCE: &str = "plaud-recording-downloader-auth";

/// How long a probe injection may stay unanswered before every waiting
/// caller is released with no token.
pub const AUTH_PROBE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Page-context probe collaborator. `inject` fires the one-shot script;
/// its reply (a token string or nothing) arrives later through
/// [`AuthBridge::deliver_token`], posted by the host's message listener.
#[async_trait::async_trait]
pub trait TokenProbe: Send + Sync {
    async fn inject(&self) -> Result<()>;
}

struct BridgeState {
    cached_token: Option<String>,
    pending: Vec<oneshot::Sender<Option<String>>>,
    injecting: bool,
    generation: u64,
}

/// Brokers bearer-token acquisition between any number of concurrent
/// requesters and a single in-flight page probe. All callers waiting while
/// a probe is out share its one reply; a timed-out probe releases them all
/// with `None` without caching, so the next request tries again.
pub struct AuthBridge {
    probe: Arc<dyn TokenProbe>,
    state: Mutex<BridgeState>,
}

impl AuthBridge {
    pub fn new(probe: Arc<dyn TokenProbe>) -> Arc<Self> {
        Arc::new(Self {
            probe,
            state: Mutex::new(BridgeState {
                cached_token: None,
                pending: Vec::new(),
                injecting: false,
                generation: 0,
            }),
        })
    }

    /// Resolves to the cached token when one exists and no refresh is
    /// forced; otherwise joins (or starts) the in-flight probe and waits
    /// for its shared outcome.
    pub async fn request_token(self: &Arc<Self>, force_refresh: bool) -> Option<String> {
        let receiver = {
            let mut state = self.state.lock().await;

            if !force_refresh {
                if let Some(token) = &state.cached_token {
                    return Some(token.clone());
                }
            }

            let (sender, receiver) = oneshot::channel();
            state.pending.push(sender);

            if !state.injecting {
                state.injecting = true;
                state.generation += 1;
                let generation = state.generation;
                let bridge = Arc::clone(self);
                tokio::spawn(async move {
                    bridge.drive_probe(generation).await;
                });
            }

            receiver
        };

        receiver.await.unwrap_or(None)
    }

    /// Hands the probe's page-message reply to every pending requester.
    /// Non-empty tokens are cached; an empty reply is not, so a later
    /// request re-probes.
    pub async fn deliver_token(&self, token: Option<String>) {
        let mut state = self.state.lock().await;
        state.injecting = false;
        state.generation += 1; // invalidates the outstanding timeout

        let token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        if let Some(token) = &token {
            state.cached_token = Some(token.clone());
        }

        Self::flush(&mut state, token);
    }

    /// Explicit invalidation after an authentication failure; the next
    /// `request_token` goes back to the page.
    pub async fn clear_cached_token(&self) {
        let mut state = self.state.lock().await;
        state.cached_token = None;
    }

    async fn drive_probe(self: Arc<Self>, generation: u64) {
        if let Err(error) = self.probe.inject().await {
            warn!("Failed to inject Plaud auth probe: {}", error);
            self.expire(generation).await;
            return;
        }

        tokio::time::sleep(AUTH_PROBE_TIMEOUT).await;
        self.expire(generation).await;
    }

    async fn expire(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation || !state.injecting {
            return;
        }

        debug!("Plaud auth probe produced no reply");
        state.injecting = false;
        Self::flush(&mut state, None);
    }

    fn flush(state: &mut BridgeState, value: Option<String>) {
        for sender in state.pending.drain(..) {
            let _ = sender.send(value.clone());
        }
    }
}
