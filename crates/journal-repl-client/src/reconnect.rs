//! Connection supervision and bounded reconnect.
//!
//! A client's background work is a small state machine:
//!
//! ```text
//! Connected ──(unknown, broken-channel)──▶ Reconnecting ──(handshake ok)──▶ Connected
//!     │                                        │
//!     └──(any other reason)──▶ Terminal ◀──(budget spent, fatal error, halt)
//! ```
//!
//! Only `Terminal` reaches the disconnect callbacks.

use crate::config::ReconnectPolicy;
use crate::disconnect::{DisconnectCallbacks, DisconnectReason, Transition};
use crate::error::ReplicationError;
use crate::registry::SubscriptionRegistry;
use crate::session::{halted, handshake, Link, Session};
use crate::transport::BoxedChannel;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;

enum LinkState {
    Connected(Session),
    Reconnecting(SubscriptionRegistry, DisconnectReason),
    Terminal(SubscriptionRegistry, DisconnectReason),
}

/// Drive connections until a terminal disconnect; returns the registry.
///
/// Each connection's command loop runs in its own task. A panic in it is
/// reported to the callbacks as `ClientError` and then resumed here.
/// Writers are closed before returning once the shutdown sender is gone.
pub(crate) async fn supervise(
    link: Arc<Link>,
    session: Session,
    mut shutdown: watch::Receiver<bool>,
    callbacks: DisconnectCallbacks,
) -> SubscriptionRegistry {
    let mut state = LinkState::Connected(session);

    loop {
        state = match state {
            LinkState::Connected(session) => {
                let (registry, reason) = match tokio::spawn(session.run(shutdown.clone())).await {
                    Ok(ended) => ended,
                    Err(err) if err.is_panic() => {
                        tracing::error!("Unhandled panic in client");
                        link.running.store(false, Ordering::SeqCst);
                        callbacks.notify(DisconnectReason::ClientError);
                        std::panic::resume_unwind(err.into_panic());
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Client task cancelled");
                        (SubscriptionRegistry::default(), DisconnectReason::ClientException)
                    }
                };

                match reason.transition() {
                    Transition::Reconnect => LinkState::Reconnecting(registry, reason),
                    Transition::Terminal => LinkState::Terminal(registry, reason),
                }
            }
            LinkState::Reconnecting(mut registry, reason) => {
                match recover(&link, &mut registry, reason, &mut shutdown).await {
                    Ok(channel) => LinkState::Connected(Session::new(link.clone(), channel, registry)),
                    Err(terminal) => LinkState::Terminal(registry, terminal),
                }
            }
            LinkState::Terminal(mut registry, reason) => {
                tracing::info!(%reason, "Client disconnecting");
                link.running.store(false, Ordering::SeqCst);
                if shutdown.has_changed().is_err() {
                    // client halted or dropped; nobody may take the writers back
                    registry.release();
                }
                callbacks.notify(reason);
                return registry;
            }
        };
    }
}

/// Remaining handshake attempts of one reconnect sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryBudget {
    retries: u32,
    logins: u32,
    attempt: u32,
}

impl RetryBudget {
    pub(crate) fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            retries: policy.retry_count,
            logins: policy.login_retry_count,
            attempt: 0,
        }
    }

    /// Claim the next attempt, if both budgets allow one.
    pub(crate) fn next_attempt(&mut self) -> Option<u32> {
        if self.retries == 0 || self.logins == 0 {
            return None;
        }
        self.retries -= 1;
        self.attempt += 1;
        Some(self.attempt)
    }

    pub(crate) fn login_failed(&mut self) {
        self.logins = self.logins.saturating_sub(1);
    }
}

/// Re-run the handshake until it succeeds or the budget is spent.
///
/// Errors with the reason to deliver to observers.
async fn recover(
    link: &Link,
    registry: &mut SubscriptionRegistry,
    reason: DisconnectReason,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<BoxedChannel, DisconnectReason> {
    let policy = link.config.reconnect;
    let mut budget = RetryBudget::new(&policy);

    while link.is_running() {
        let Some(attempt) = budget.next_attempt() else {
            break;
        };

        tokio::select! {
            biased;
            () = halted(shutdown) => return Err(DisconnectReason::ClientHalted),
            () = tokio::time::sleep(policy.sleep_between_retries) => {}
        }

        tracing::info!(attempt, "Retrying reconnect ... [{attempt}]");
        link.metrics.reconnect_attempted();
        registry.release();

        let result = tokio::select! {
            biased;
            () = halted(shutdown) => return Err(DisconnectReason::ClientHalted),
            result = handshake(link, registry) => result,
        };

        match result {
            Ok(channel) => return Ok(channel),
            Err(err) if err.is_auth() => {
                budget.login_failed();
                tracing::warn!(attempt, error = %err, "Authorization rejected");
            }
            Err(ReplicationError::IncompatibleJournal(message)) => {
                tracing::error!(attempt, error = %message, "Incompatible journal");
                return Err(DisconnectReason::IncompatibleJournal);
            }
            Err(err @ ReplicationError::Configuration(_)) => {
                tracing::error!(attempt, error = %err, "Cannot reconnect");
                return Err(reason);
            }
            Err(err) => {
                tracing::info!(attempt, error = %err, "Error during reconnect");
            }
        }
    }

    Err(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(retry_count: u32, login_retry_count: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            retry_count,
            login_retry_count,
            sleep_between_retries: Duration::ZERO,
        }
    }

    #[test]
    fn retry_budget_bounds_attempts() {
        let mut budget = RetryBudget::new(&policy(3, 3));
        assert_eq!(budget.next_attempt(), Some(1));
        assert_eq!(budget.next_attempt(), Some(2));
        assert_eq!(budget.next_attempt(), Some(3));
        assert_eq!(budget.next_attempt(), None);
    }

    #[test]
    fn login_failures_spend_login_budget_only() {
        let mut budget = RetryBudget::new(&policy(10, 2));
        assert!(budget.next_attempt().is_some());
        budget.login_failed();
        assert!(budget.next_attempt().is_some());
        budget.login_failed();
        assert_eq!(budget.next_attempt(), None);
    }

    #[test]
    fn zero_budget_never_attempts() {
        assert_eq!(RetryBudget::new(&policy(0, 3)).next_attempt(), None);
        assert_eq!(RetryBudget::new(&policy(3, 0)).next_attempt(), None);
    }
}
