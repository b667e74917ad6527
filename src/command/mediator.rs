//! Request/Response Correlation
//!
//! A caller that expects an answer registers a slot, sends its command with the
//! slot's token, and awaits. The receive path resolves the slot by token when
//! the answer arrives. Whichever happens first between resolution and the
//! caller's timeout wins; the loser finds the slot gone and does nothing.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::types::CommandResponse;

struct PendingResponse {
    sender: oneshot::Sender<CommandResponse>,
    deadline: Instant,
}

pub struct ResponseMediator {
    next_token: AtomicU64,
    pending: DashMap<u64, PendingResponse>,
}

impl Default for ResponseMediator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseMediator {
    pub fn new() -> Self {
        // each incarnation starts at a random offset; zero is reserved
        let seed = rand::random::<u32>() as u64 + 1;
        Self {
            next_token: AtomicU64::new(seed),
            pending: DashMap::new(),
        }
    }

    fn allocate_token(&self) -> u64 {
        loop {
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            if token != 0 {
                return token;
            }
        }
    }

    /// Opens a slot. The slot is released when the returned handle is dropped.
    pub fn register_pending_response(&self, timeout: Duration) -> PendingHandle<'_> {
        let token = self.allocate_token();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            token,
            PendingResponse {
                sender,
                deadline: Instant::now() + timeout,
            },
        );
        tracing::trace!("Registered pending response {}", token);

        PendingHandle {
            mediator: self,
            token,
            receiver: Some(receiver),
        }
    }

    /// Waits for the slot to be resolved. `None` on timeout or cancellation.
    pub async fn await_response(
        &self,
        mut handle: PendingHandle<'_>,
        timeout: Duration,
    ) -> Option<CommandResponse> {
        let receiver = handle.receiver.take()?;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => {
                tracing::debug!("Pending response {} was cancelled", handle.token);
                None
            }
            Err(_) => {
                tracing::debug!(
                    "Pending response {} timed out after {:?}",
                    handle.token,
                    timeout
                );
                None
            }
        }
    }

    /// Resolves the slot for `token`. Returns false when nobody is waiting,
    /// which is normal for late or duplicate responses.
    pub fn set_result(&self, token: u64, response: CommandResponse) -> bool {
        match self.pending.remove(&token) {
            Some((_, slot)) => slot.sender.send(response).is_ok(),
            None => {
                tracing::debug!("Dropping response for unknown token {}", token);
                false
            }
        }
    }

    pub fn is_pending(&self, token: u64) -> bool {
        self.pending.contains_key(&token)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drops slots past their deadline whose waiter never came back for them.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, slot| slot.deadline > now);
        before.saturating_sub(self.pending.len())
    }

    /// Releases every waiter; they observe `None`.
    pub fn cancel_all(&self) {
        self.pending.clear();
    }
}

/// A registered wait slot. Dropping it releases the slot.
pub struct PendingHandle<'a> {
    mediator: &'a ResponseMediator,
    token: u64,
    receiver: Option<oneshot::Receiver<CommandResponse>>,
}

impl PendingHandle<'_> {
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for PendingHandle<'_> {
    fn drop(&mut self) {
        self.mediator.pending.remove(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::types::MemberName;

    fn ack(from: &str) -> CommandResponse {
        CommandResponse::Acknowledged {
            responder: MemberName::from(from),
        }
    }

    #[tokio::test]
    async fn test_result_before_await_is_kept() {
        let mediator = ResponseMediator::new();
        let handle = mediator.register_pending_response(Duration::from_secs(1));
        let token = handle.token();
        assert_ne!(token, 0);

        assert!(mediator.set_result(token, ack("b")));
        let response = mediator
            .await_response(handle, Duration::from_millis(100))
            .await;

        assert_eq!(response, Some(ack("b")));
        assert_eq!(mediator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_releases_slot() {
        let mediator = ResponseMediator::new();
        let handle = mediator.register_pending_response(Duration::from_millis(10));
        let token = handle.token();

        let response = mediator
            .await_response(handle, Duration::from_millis(10))
            .await;

        assert!(response.is_none());
        assert!(!mediator.is_pending(token));
        // late response is a no-op
        assert!(!mediator.set_result(token, ack("b")));
    }

    #[tokio::test]
    async fn test_duplicate_response_first_wins() {
        let mediator = ResponseMediator::new();
        let handle = mediator.register_pending_response(Duration::from_secs(1));
        let token = handle.token();

        assert!(mediator.set_result(token, ack("b")));
        assert!(!mediator.set_result(token, ack("c")));

        let response = mediator.await_response(handle, Duration::from_secs(1)).await;
        assert_eq!(response, Some(ack("b")));
    }

    #[tokio::test]
    async fn test_cancel_all_wakes_waiters() {
        let mediator = ResponseMediator::new();
        let handle = mediator.register_pending_response(Duration::from_secs(5));

        mediator.cancel_all();
        let response = mediator.await_response(handle, Duration::from_secs(5)).await;

        assert!(response.is_none());
    }

    #[test]
    fn test_expire_overdue() {
        let mediator = ResponseMediator::new();
        let handle = mediator.register_pending_response(Duration::from_millis(0));
        std::mem::forget(handle);

        let expired = mediator.expire_overdue(Instant::now() + Duration::from_millis(1));
        assert_eq!(expired, 1);
        assert_eq!(mediator.pending_count(), 0);
    }
}
