//! Two-party mutual exclusion over the signaling channel.
//!
//! The lock is a pure state machine: callers feed it local requests, remote
//! messages and clock ticks, and it answers with [`LockAction`]s to carry
//! out. Request ids always belong to the requester's namespace, so a
//! `lockResponse` or `lockRelease` names the request it settles.
//!
//! When both sides request at once the impolite side defers the remote
//! request while the polite side grants it. A granted remote hold blocks new
//! local requests until the remote releases it or its lease runs out.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::politeness::Role;

pub type RequestId = u64;
/// Local waiter handle.
pub type Ticket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Give up on a request after this long.
    pub timeout: Duration,
    /// Re-send an unanswered request this often.
    pub resend_interval: Duration,
    /// Forget a remote hold that was never released after this long.
    pub lease: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            resend_interval: Duration::from_secs(1),
            lease: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailure {
    Timeout,
    Unreachable,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAction {
    SendRequest(RequestId),
    SendResponse(RequestId),
    SendRelease(RequestId),
    Granted {
        ticket: Ticket,
        request: RequestId,
    },
    Failed {
        ticket: Ticket,
        failure: LockFailure,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockHolder {
    Nobody,
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy)]
enum LocalState {
    Idle,
    Requesting {
        ticket: Ticket,
        request: RequestId,
        deadline: Instant,
        resend_at: Instant,
    },
    Held {
        request: RequestId,
    },
}

#[derive(Debug)]
pub struct DistributedLock {
    role: Role,
    config: LockConfig,
    queue: VecDeque<Ticket>,
    local: LocalState,
    remote_grant: Option<(RequestId, Instant)>,
    deferred: Option<RequestId>,
    next_request: RequestId,
}

impl DistributedLock {
    pub fn new(role: Role, config: LockConfig) -> Self {
        Self::with_first_request(role, config, u64::from(rand::random::<u32>()))
    }

    pub fn with_first_request(role: Role, config: LockConfig, first: RequestId) -> Self {
        Self {
            role,
            config,
            queue: VecDeque::new(),
            local: LocalState::Idle,
            remote_grant: None,
            deferred: None,
            next_request: first,
        }
    }

    pub fn holder(&self) -> LockHolder {
        match (self.local, self.remote_grant) {
            (LocalState::Held { .. }, _) => LockHolder::Local,
            (_, Some(_)) => LockHolder::Remote,
            _ => LockHolder::Nobody,
        }
    }

    /// A remote request is waiting on our release.
    pub fn has_deferred_request(&self) -> bool {
        self.deferred.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue a local acquisition.
    pub fn acquire(&mut self, ticket: Ticket, now: Instant) -> Vec<LockAction> {
        self.queue.push_back(ticket);
        let mut actions = Vec::new();
        self.pump(now, &mut actions);
        actions
    }

    /// Drop a waiter that no longer wants the lock.
    pub fn cancel(&mut self, ticket: Ticket, now: Instant) -> Vec<LockAction> {
        self.queue.retain(|queued| *queued != ticket);
        let mut actions = Vec::new();
        if let LocalState::Requesting {
            ticket: current,
            request,
            ..
        } = self.local
        {
            if current == ticket {
                self.abandon(request, now, &mut actions);
            }
        }
        actions
    }

    /// Release a held lock.
    pub fn release(&mut self, request: RequestId, now: Instant) -> Vec<LockAction> {
        let mut actions = Vec::new();
        match self.local {
            LocalState::Held { request: held } if held == request => {
                self.local = LocalState::Idle;
                actions.push(LockAction::SendRelease(request));
                self.grant_deferred(now, &mut actions);
                self.pump(now, &mut actions);
            }
            _ => debug!(request, "release for a lock we do not hold"),
        }
        actions
    }

    /// Fail the in-flight request because its message could not be sent.
    pub fn abort(&mut self, request: RequestId, now: Instant) -> Vec<LockAction> {
        let mut actions = Vec::new();
        if let LocalState::Requesting {
            ticket,
            request: current,
            ..
        } = self.local
        {
            if current == request {
                self.local = LocalState::Idle;
                actions.push(LockAction::Failed {
                    ticket,
                    failure: LockFailure::Unreachable,
                });
                self.grant_deferred(now, &mut actions);
                self.pump(now, &mut actions);
            }
        }
        actions
    }

    pub fn on_request(&mut self, request: RequestId, now: Instant) -> Vec<LockAction> {
        let mut actions = Vec::new();
        if matches!(self.remote_grant, Some((granted, _)) if granted == request) {
            // our response was lost
            actions.push(LockAction::SendResponse(request));
            return actions;
        }
        let defer = match self.local {
            LocalState::Held { .. } => true,
            LocalState::Requesting { .. } => !self.role.is_polite(),
            LocalState::Idle => false,
        };
        if defer {
            debug!(request, "deferring remote lock request");
            self.deferred = Some(request);
        } else {
            self.remote_grant = Some((request, now));
            actions.push(LockAction::SendResponse(request));
        }
        actions
    }

    pub fn on_response(&mut self, request: RequestId) -> Vec<LockAction> {
        let mut actions = Vec::new();
        match self.local {
            LocalState::Requesting {
                ticket,
                request: current,
                ..
            } if current == request => {
                self.local = LocalState::Held { request };
                actions.push(LockAction::Granted { ticket, request });
            }
            LocalState::Held { request: held } if held == request => {}
            _ => {
                debug!(request, "stale lock grant; handing it back");
                actions.push(LockAction::SendRelease(request));
            }
        }
        actions
    }

    pub fn on_release(&mut self, request: RequestId, now: Instant) -> Vec<LockAction> {
        let mut actions = Vec::new();
        if self.deferred == Some(request) {
            self.deferred = None;
        }
        if matches!(self.remote_grant, Some((granted, _)) if granted == request) {
            self.remote_grant = None;
            self.pump(now, &mut actions);
        }
        actions
    }

    /// Apply resends, request timeouts and lease expiry due at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<LockAction> {
        let mut actions = Vec::new();
        if let Some((request, since)) = self.remote_grant {
            if now >= since + self.config.lease {
                warn!(request, "remote lock hold expired without release");
                self.remote_grant = None;
            }
        }
        if let LocalState::Requesting {
            ticket,
            request,
            deadline,
            resend_at,
        } = self.local
        {
            if now >= deadline {
                warn!(request, "lock request timed out");
                actions.push(LockAction::Failed {
                    ticket,
                    failure: LockFailure::Timeout,
                });
                self.abandon(request, now, &mut actions);
                return actions;
            }
            if now >= resend_at {
                self.local = LocalState::Requesting {
                    ticket,
                    request,
                    deadline,
                    resend_at: now + self.config.resend_interval,
                };
                actions.push(LockAction::SendRequest(request));
            }
        }
        self.pump(now, &mut actions);
        actions
    }

    /// Earliest instant at which [`DistributedLock::poll`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        let lease = self
            .remote_grant
            .map(|(_, since)| since + self.config.lease);
        let request = match self.local {
            LocalState::Requesting {
                deadline,
                resend_at,
                ..
            } => Some(deadline.min(resend_at)),
            _ => None,
        };
        match (lease, request) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fail every waiter. Returns the release owed for a held lock, if any.
    pub fn close(&mut self) -> Vec<LockAction> {
        let mut actions = Vec::new();
        match self.local {
            LocalState::Requesting {
                ticket, request, ..
            } => {
                actions.push(LockAction::Failed {
                    ticket,
                    failure: LockFailure::Closed,
                });
                actions.push(LockAction::SendRelease(request));
            }
            LocalState::Held { request } => actions.push(LockAction::SendRelease(request)),
            LocalState::Idle => {}
        }
        self.local = LocalState::Idle;
        for ticket in self.queue.drain(..) {
            actions.push(LockAction::Failed {
                ticket,
                failure: LockFailure::Closed,
            });
        }
        actions
    }

    fn abandon(&mut self, request: RequestId, now: Instant, actions: &mut Vec<LockAction>) {
        self.local = LocalState::Idle;
        actions.push(LockAction::SendRelease(request));
        self.grant_deferred(now, actions);
        self.pump(now, actions);
    }

    fn grant_deferred(&mut self, now: Instant, actions: &mut Vec<LockAction>) {
        if let Some(request) = self.deferred.take() {
            self.remote_grant = Some((request, now));
            actions.push(LockAction::SendResponse(request));
        }
    }

    fn pump(&mut self, now: Instant, actions: &mut Vec<LockAction>) {
        if !matches!(self.local, LocalState::Idle) || self.remote_grant.is_some() {
            return;
        }
        let Some(ticket) = self.queue.pop_front() else {
            return;
        };
        let request = self.next_request;
        self.next_request = self.next_request.wrapping_add(1);
        self.local = LocalState::Requesting {
            ticket,
            request,
            deadline: now + self.config.timeout,
            resend_at: now + self.config.resend_interval,
        };
        actions.push(LockAction::SendRequest(request));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (DistributedLock, DistributedLock) {
        let config = LockConfig::default();
        (
            DistributedLock::with_first_request(Role::Polite, config, 100),
            DistributedLock::with_first_request(Role::Impolite, config, 200),
        )
    }

    /// Feed `actions` produced by `from` into `to`, returning what `to`
    /// answers plus the local grants `from` produced.
    fn deliver(actions: Vec<LockAction>, to: &mut DistributedLock, now: Instant) -> Vec<LockAction> {
        let mut replies = Vec::new();
        for action in actions {
            match action {
                LockAction::SendRequest(id) => replies.extend(to.on_request(id, now)),
                LockAction::SendResponse(id) => replies.extend(to.on_response(id)),
                LockAction::SendRelease(id) => replies.extend(to.on_release(id, now)),
                LockAction::Granted { .. } | LockAction::Failed { .. } => {}
            }
        }
        replies
    }

    fn granted(actions: &[LockAction]) -> Vec<Ticket> {
        actions
            .iter()
            .filter_map(|action| match action {
                LockAction::Granted { ticket, .. } => Some(*ticket),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn uncontended_acquire_and_release() {
        let now = Instant::now();
        let (mut polite, mut impolite) = pair();
        let request = polite.acquire(1, now);
        assert_eq!(request, vec![LockAction::SendRequest(100)]);
        let response = deliver(request, &mut impolite, now);
        assert_eq!(impolite.holder(), LockHolder::Remote);
        let grant = deliver(response, &mut polite, now);
        assert_eq!(granted(&grant), vec![1]);
        assert_eq!(polite.holder(), LockHolder::Local);

        let release = polite.release(100, now);
        deliver(release, &mut impolite, now);
        assert_eq!(polite.holder(), LockHolder::Nobody);
        assert_eq!(impolite.holder(), LockHolder::Nobody);
    }

    #[test]
    fn simultaneous_requests_resolve_to_impolite_first() {
        let now = Instant::now();
        let (mut polite, mut impolite) = pair();
        let from_polite = polite.acquire(1, now);
        let from_impolite = impolite.acquire(2, now);

        // requests cross on the wire
        let polite_replies = deliver(from_impolite, &mut polite, now);
        let impolite_replies = deliver(from_polite, &mut impolite, now);
        assert!(impolite.has_deferred_request());
        assert!(impolite_replies.is_empty());

        let impolite_grant = deliver(polite_replies, &mut impolite, now);
        assert_eq!(granted(&impolite_grant), vec![2]);
        assert_eq!(polite.holder(), LockHolder::Remote);

        // releasing hands the lock to the deferred polite request
        let handoff = impolite.release(200, now);
        assert!(handoff.contains(&LockAction::SendResponse(100)));
        let polite_grant = deliver(handoff, &mut polite, now);
        assert_eq!(granted(&polite_grant), vec![1]);
        assert_eq!(impolite.holder(), LockHolder::Remote);
    }

    #[test]
    fn remote_hold_blocks_local_requests_until_release() {
        let now = Instant::now();
        let (_, mut impolite) = pair();
        let response = impolite.on_request(100, now);
        assert_eq!(response, vec![LockAction::SendResponse(100)]);
        assert!(impolite.acquire(2, now).is_empty());
        assert_eq!(impolite.queued(), 1);

        let resumed = impolite.on_release(100, now);
        assert_eq!(resumed, vec![LockAction::SendRequest(200)]);
    }

    #[test]
    fn unanswered_request_resends_then_times_out() {
        let start = Instant::now();
        let (mut polite, _) = pair();
        polite.acquire(7, start);

        let resend = polite.poll(start + Duration::from_millis(1_100));
        assert_eq!(resend, vec![LockAction::SendRequest(100)]);

        let expired = polite.poll(start + Duration::from_secs(6));
        assert_eq!(
            expired[0],
            LockAction::Failed {
                ticket: 7,
                failure: LockFailure::Timeout
            }
        );
        assert!(expired.contains(&LockAction::SendRelease(100)));
        assert_eq!(polite.holder(), LockHolder::Nobody);
    }

    #[test]
    fn late_grant_after_timeout_is_returned() {
        let start = Instant::now();
        let (mut polite, mut impolite) = pair();
        let request = polite.acquire(1, start);
        polite.poll(start + Duration::from_secs(6));

        let response = deliver(request, &mut impolite, start);
        let stale = deliver(response, &mut polite, start);
        assert_eq!(stale, vec![LockAction::SendRelease(100)]);
        deliver(stale, &mut impolite, start);
        assert_eq!(impolite.holder(), LockHolder::Nobody);
    }

    #[test]
    fn duplicate_request_re_sends_the_grant() {
        let now = Instant::now();
        let (_, mut impolite) = pair();
        impolite.on_request(100, now);
        assert_eq!(
            impolite.on_request(100, now),
            vec![LockAction::SendResponse(100)]
        );
    }

    #[test]
    fn unreleased_remote_hold_expires() {
        let start = Instant::now();
        let (_, mut impolite) = pair();
        impolite.on_request(100, start);
        assert!(impolite.acquire(3, start).is_empty());
        assert_eq!(
            impolite.next_deadline(),
            Some(start + LockConfig::default().lease)
        );
        let resumed = impolite.poll(start + Duration::from_secs(31));
        assert_eq!(resumed, vec![LockAction::SendRequest(200)]);
    }

    #[test]
    fn cancelling_an_in_flight_request_releases_it() {
        let now = Instant::now();
        let (mut polite, _) = pair();
        polite.acquire(1, now);
        polite.acquire(2, now);
        let actions = polite.cancel(1, now);
        assert_eq!(
            actions,
            vec![LockAction::SendRelease(100), LockAction::SendRequest(101)]
        );
    }

    #[test]
    fn close_fails_all_waiters() {
        let now = Instant::now();
        let (mut polite, _) = pair();
        polite.acquire(1, now);
        polite.acquire(2, now);
        let actions = polite.close();
        assert!(actions.contains(&LockAction::Failed {
            ticket: 1,
            failure: LockFailure::Closed
        }));
        assert!(actions.contains(&LockAction::Failed {
            ticket: 2,
            failure: LockFailure::Closed
        }));
    }
}
