//! Pending client requests waiting on the log.

use std::collections::VecDeque;

use slog::{debug, Logger};
use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::raft::protocol::{RequestKind, Response};

/// Completes one inbound request. Every response leaving a replica passes
/// through here, so this is also where responses are logged.
pub struct Responder {
    tx: oneshot::Sender<Response>,
    logger: Logger,
}

impl Responder {
    pub(crate) fn new(tx: oneshot::Sender<Response>, logger: Logger) -> Self {
        Responder { tx, logger }
    }

    pub fn respond(self, response: Response) {
        debug!(self.logger, "Sent response"; "kind" => %response.kind(), "status" => ?response.status());
        // The caller may have given up waiting.
        let _ = self.tx.send(response);
    }

    pub fn fail(self, kind: RequestKind, error: RaftError) {
        self.respond(Response::failed(kind, error));
    }
}

/// A request whose log entry has been appended but not yet applied.
pub struct Proposal {
    pub kind: RequestKind,
    // Index of the entry the request was appended at.
    pub proposed: u64,
    pub responder: Responder,
}

impl Proposal {
    pub fn new(kind: RequestKind, proposed: u64, responder: Responder) -> Self {
        Proposal {
            kind,
            proposed,
            responder,
        }
    }
}

/// Proposals in index order.
#[derive(Default)]
pub struct Proposals {
    proposed: VecDeque<Proposal>,
}

impl Proposals {
    pub fn push(&mut self, proposal: Proposal) {
        self.proposed.push_back(proposal);
    }

    /// Removes and returns the proposal appended at `index`. Proposals for
    /// earlier indexes can no longer complete and are failed with `error`.
    pub fn take(&mut self, index: u64, error: impl Fn() -> RaftError) -> Option<Proposal> {
        while let Some(front) = self.proposed.front() {
            if front.proposed > index {
                return None;
            }
            let proposal = self.proposed.pop_front()?;
            if proposal.proposed == index {
                return Some(proposal);
            }
            proposal.responder.fail(proposal.kind, error());
        }
        None
    }

    /// Fails every pending proposal.
    pub fn fail_all(&mut self, error: RaftError) {
        for proposal in self.proposed.drain(..) {
            proposal.responder.fail(proposal.kind, error.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.proposed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::protocol::Status;

    fn proposal(index: u64) -> (Proposal, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let responder = Responder::new(tx, Logger::root(slog::Discard, slog::o!()));
        (Proposal::new(RequestKind::Command, index, responder), rx)
    }

    #[test]
    fn test_take_in_order() {
        let mut proposals = Proposals::default();
        let (p1, _rx1) = proposal(3);
        let (p2, mut rx2) = proposal(5);
        proposals.push(p1);
        proposals.push(p2);

        assert!(proposals.take(2, || RaftError::NoLeader).is_none());
        assert_eq!(proposals.take(3, || RaftError::NoLeader).unwrap().proposed, 3);
        assert!(proposals.take(4, || RaftError::NoLeader).is_none());
        assert_eq!(proposals.len(), 1);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_skipped_proposals_fail() {
        let mut proposals = Proposals::default();
        let (p1, mut rx1) = proposal(3);
        let (p2, _rx2) = proposal(4);
        proposals.push(p1);
        proposals.push(p2);

        assert!(proposals.take(4, || RaftError::NoLeader).is_some());
        let response = rx1.try_recv().unwrap();
        assert_eq!(response.status(), Status::Error);
        assert!(proposals.is_empty());
    }

    #[test]
    fn test_fail_all() {
        let mut proposals = Proposals::default();
        let (p1, mut rx1) = proposal(1);
        proposals.push(p1);
        proposals.fail_all(RaftError::Shutdown);
        assert_eq!(rx1.try_recv().unwrap().error(), Some(&RaftError::Shutdown));
    }
}
