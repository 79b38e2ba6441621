//! Pending-request correlation for acknowledged messages

use crate::address::Address;
use crate::error::{MeshError, MeshResult};
use crate::message::{Opcode, ReceivedMessage};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Outcome delivered to the sender of an acknowledged message
pub type RequestOutcome = MeshResult<ReceivedMessage>;

/// What a response must match to resolve a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    /// Local element that sent the request
    pub source: Address,
    /// Node the request was sent to
    pub destination: Address,
    pub response_opcode: Opcode,
}

#[derive(Debug)]
struct PendingRequest {
    id: Uuid,
    key: RequestKey,
    deadline: Instant,
    responder: oneshot::Sender<RequestOutcome>,
}

/// Outstanding acknowledged requests, oldest first
#[derive(Debug)]
pub struct Correlator {
    pending: Vec<PendingRequest>,
    max_pending: usize,
    allow_concurrent: bool,
}

impl Correlator {
    pub fn new(max_pending: usize, allow_concurrent: bool) -> Self {
        Self {
            pending: Vec::new(),
            max_pending,
            allow_concurrent,
        }
    }

    /// Register a request; the receiver resolves exactly once.
    pub fn register(
        &mut self,
        id: Uuid,
        key: RequestKey,
        deadline: Instant,
    ) -> MeshResult<oneshot::Receiver<RequestOutcome>> {
        if !self.allow_concurrent && self.pending.iter().any(|request| request.key == key) {
            return Err(MeshError::DuplicateRequest(format!(
                "{} to {} awaiting {}",
                key.source, key.destination, key.response_opcode
            )));
        }
        if self.pending.len() >= self.max_pending {
            return Err(MeshError::TooManyPendingRequests(self.max_pending));
        }

        let (responder, receiver) = oneshot::channel();
        self.pending.push(PendingRequest {
            id,
            key,
            deadline,
            responder,
        });
        Ok(receiver)
    }

    /// Resolve the oldest request answered by a response from `source` to `destination`.
    pub fn resolve(
        &mut self,
        source: Address,
        destination: Address,
        opcode: Opcode,
        response: &ReceivedMessage,
    ) -> bool {
        let position = self.pending.iter().position(|request| {
            request.key.destination == source
                && request.key.source == destination
                && request.key.response_opcode == opcode
        });
        match position {
            Some(position) => {
                let request = self.pending.remove(position);
                debug!(request = %request.id, src = %source, opcode = %opcode, "Response matched");
                // The sender may have given up already
                let _ = request.responder.send(Ok(response.clone()));
                true
            }
            None => false,
        }
    }

    /// Fail a request; returns false if it already resolved.
    pub fn fail(&mut self, id: Uuid, error: MeshError) -> bool {
        match self.take(id) {
            Some(request) => {
                let _ = request.responder.send(Err(error));
                true
            }
            None => false,
        }
    }

    pub fn cancel(&mut self, id: Uuid) -> bool {
        self.fail(id, MeshError::Cancelled)
    }

    /// Forget a request without resolving it.
    pub fn remove(&mut self, id: Uuid) -> bool {
        self.take(id).is_some()
    }

    /// Move the deadline of a request, e.g. when another attempt starts.
    pub fn extend(&mut self, id: Uuid, deadline: Instant) -> bool {
        match self.pending.iter_mut().find(|request| request.id == id) {
            Some(request) => {
                request.deadline = deadline;
                true
            }
            None => false,
        }
    }

    /// Fail every request whose deadline has passed with `Timeout`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let (expired, remaining): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|request| request.deadline <= now);
        self.pending = remaining;
        let count = expired.len();
        for request in expired {
            debug!(request = %request.id, "Pending request expired");
            let _ = request.responder.send(Err(MeshError::Timeout));
        }
        count
    }

    /// Fail every request, used at shutdown.
    pub fn fail_all(&mut self, error: impl Fn() -> MeshError) -> usize {
        let count = self.pending.len();
        for request in self.pending.drain(..) {
            let _ = request.responder.send(Err(error()));
        }
        count
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.pending.iter().any(|request| request.id == id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|request| request.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take(&mut self, id: Uuid) -> Option<PendingRequest> {
        let position = self.pending.iter().position(|request| request.id == id)?;
        Some(self.pending.remove(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MeshAddress;
    use crate::keys::KeyIndex;
    use crate::message::{DecodedMessage, MessageKey};
    use std::time::Duration;

    const LOCAL: Address = Address::new(0x0001);
    const PEER: Address = Address::new(0x0010);
    const STATUS: Opcode = Opcode::from_const(0x8204);

    fn key() -> RequestKey {
        RequestKey {
            source: LOCAL,
            destination: PEER,
            response_opcode: STATUS,
        }
    }

    fn response(source: Address) -> ReceivedMessage {
        ReceivedMessage {
            message: DecodedMessage::Unknown {
                opcode: STATUS,
                parameters: vec![1],
            },
            source,
            destination: MeshAddress::new(LOCAL),
            key: MessageKey::Application(KeyIndex::new(0).unwrap()),
            network_key: KeyIndex::new(0).unwrap(),
            ttl: 5,
            received_at: chrono::Utc::now(),
        }
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_resolve_matching_response() {
        let mut correlator = Correlator::new(4, false);
        let rx = correlator.register(Uuid::new_v4(), key(), later()).unwrap();

        // Wrong source and wrong opcode do not match
        let stranger = Address::new(0x0020);
        assert!(!correlator.resolve(stranger, LOCAL, STATUS, &response(stranger)));
        assert!(!correlator.resolve(PEER, LOCAL, Opcode::from_const(0x8245), &response(PEER)));

        assert!(correlator.resolve(PEER, LOCAL, STATUS, &response(PEER)));
        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.source, PEER);

        // A duplicate response after resolution is ignored
        assert!(!correlator.resolve(PEER, LOCAL, STATUS, &response(PEER)));
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected_unless_allowed() {
        let mut correlator = Correlator::new(4, false);
        let _rx = correlator.register(Uuid::new_v4(), key(), later()).unwrap();
        assert!(matches!(
            correlator.register(Uuid::new_v4(), key(), later()),
            Err(MeshError::DuplicateRequest(_))
        ));

        let mut concurrent = Correlator::new(4, true);
        let _a = concurrent.register(Uuid::new_v4(), key(), later()).unwrap();
        let _b = concurrent.register(Uuid::new_v4(), key(), later()).unwrap();
        assert_eq!(concurrent.len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let mut correlator = Correlator::new(1, true);
        let _rx = correlator.register(Uuid::new_v4(), key(), later()).unwrap();
        assert!(matches!(
            correlator.register(Uuid::new_v4(), key(), later()),
            Err(MeshError::TooManyPendingRequests(1))
        ));
    }

    #[tokio::test]
    async fn test_cancel_resolves_once() {
        let mut correlator = Correlator::new(4, false);
        let id = Uuid::new_v4();
        let rx = correlator.register(id, key(), later()).unwrap();
        assert!(correlator.cancel(id));
        assert!(!correlator.cancel(id));
        assert!(!correlator.resolve(PEER, LOCAL, STATUS, &response(PEER)));
        assert!(matches!(rx.await.unwrap(), Err(MeshError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire() {
        let mut correlator = Correlator::new(4, true);
        let now = Instant::now();
        let soon = correlator
            .register(Uuid::new_v4(), key(), now + Duration::from_secs(1))
            .unwrap();
        let id = Uuid::new_v4();
        let _late = correlator.register(id, key(), now + Duration::from_secs(10)).unwrap();
        assert_eq!(correlator.next_deadline(), Some(now + Duration::from_secs(1)));

        assert_eq!(correlator.expire(now + Duration::from_secs(2)), 1);
        assert!(matches!(soon.await.unwrap(), Err(MeshError::Timeout)));
        assert!(correlator.contains(id));

        assert!(correlator.extend(id, now + Duration::from_secs(20)));
        assert_eq!(correlator.expire(now + Duration::from_secs(15)), 0);
    }
}
