use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

use super::refresh;
use super::store::TokenStorage;
use crate::error::RefreshError;
use crate::transport::HttpTransport;

type RefreshFuture = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

/// The refresh operation currently in flight
struct InFlight {
    generation: u64,
    operation: RefreshFuture,
}

type Slot = Arc<Mutex<Option<InFlight>>>;

/// Refresh coordinator
/// Guarantees at most one refresh network operation at a time; every caller
/// that asks while one is running shares its outcome.
pub struct RefreshCoordinator {
    /// Stored credentials
    tokens: TokenStorage,

    /// Transport used for refresh calls (never intercepted)
    transport: Arc<dyn HttpTransport>,

    /// Refresh endpoints, tried in order
    refresh_urls: Arc<Vec<String>>,

    /// Handle to the in-flight operation, if any
    in_flight: Slot,

    /// Number of refresh operations started so far
    generation: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        tokens: TokenStorage,
        transport: Arc<dyn HttpTransport>,
        refresh_urls: Vec<String>,
    ) -> Self {
        Self {
            tokens,
            transport,
            refresh_urls: Arc::new(refresh_urls),
            in_flight: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Get an access token that is newer than `failed_token`
    ///
    /// Joins the in-flight refresh when there is one. Otherwise, if the stored
    /// access token already differs from the one the server rejected, another
    /// caller refreshed in the meantime and that token is returned without a
    /// network call. A missing refresh token fails immediately.
    pub async fn ensure_refreshed(&self, failed_token: Option<&str>) -> Result<String, RefreshError> {
        let operation = {
            let mut slot = self.in_flight.lock().await;

            // A settled operation still in the slot never released it (task panicked)
            if slot.as_ref().is_some_and(|f| f.operation.peek().is_some()) {
                *slot = None;
            }

            match slot.as_ref() {
                Some(in_flight) => {
                    tracing::debug!(
                        generation = in_flight.generation,
                        "Joining in-flight token refresh"
                    );
                    in_flight.operation.clone()
                }
                None => {
                    if let Some(current) = self.tokens.access_token()? {
                        if failed_token != Some(current.as_str()) {
                            tracing::debug!("Access token already replaced, skipping refresh");
                            return Ok(current);
                        }
                    }

                    let refresh_token = self
                        .tokens
                        .refresh_token()?
                        .ok_or(RefreshError::NoRefreshToken)?;

                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

                    // Runs on its own task so it completes even if every waiter is dropped
                    let task = tokio::spawn(run_refresh(
                        self.tokens.clone(),
                        self.transport.clone(),
                        self.refresh_urls.clone(),
                        refresh_token,
                        Arc::downgrade(&self.in_flight),
                        generation,
                    ));
                    let operation = task
                        .map(|joined| {
                            joined.unwrap_or_else(|e| Err(RefreshError::Aborted(e.to_string())))
                        })
                        .boxed()
                        .shared();

                    *slot = Some(InFlight {
                        generation,
                        operation: operation.clone(),
                    });
                    operation
                }
            }
        };

        operation.await
    }

    /// Whether a refresh operation is currently in flight
    pub async fn is_refreshing(&self) -> bool {
        self.in_flight.lock().await.is_some()
    }

    /// Number of refresh operations started since creation
    pub fn operations_started(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// One refresh operation: network call, persistence, then release of the slot
async fn run_refresh(
    tokens: TokenStorage,
    transport: Arc<dyn HttpTransport>,
    refresh_urls: Arc<Vec<String>>,
    refresh_token: String,
    slot: Weak<Mutex<Option<InFlight>>>,
    generation: u64,
) -> Result<String, RefreshError> {
    tracing::info!(generation, "Refreshing access token...");

    let result =
        match refresh::refresh_with_fallback(transport.as_ref(), &refresh_urls, &refresh_token).await
        {
            Ok(data) => tokens
                .update(&data.access_token, data.refresh_token.as_deref())
                .map(|_| data.access_token)
                .map_err(RefreshError::from),
            Err(e) => Err(e),
        };

    match &result {
        Ok(token) => tracing::info!(
            generation,
            "Token refresh complete (token: {}...)",
            token.chars().take(8).collect::<String>()
        ),
        Err(e) => tracing::error!(generation, error = %e, "Token refresh failed"),
    }

    // Settled: the next authorization failure starts a fresh operation
    if let Some(slot) = slot.upgrade() {
        let mut slot = slot.lock().await;
        if slot.as_ref().map(|f| f.generation) == Some(generation) {
            *slot = None;
        }
    }

    result
}
