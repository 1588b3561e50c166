use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use tokio::{sync::oneshot, time::Instant};
use tracing::*;

use crate::{device::Xid, error::RequestError, protocol::MultipartReply};

type Outcome<T> = Result<T, RequestError>;

/// Completion side of one request. `None` once completed.
struct Completion<T> {
    sender: Option<oneshot::Sender<Outcome<T>>>,
}

struct CorrelatorState<T> {
    next_xid: u32,
    pending: HashMap<Xid, Completion<T>>,
    closed: bool,
}

struct CorrelatorInner<T> {
    state: Mutex<CorrelatorState<T>>,
}

impl<T> CorrelatorInner<T> {
    fn lock(&self) -> MutexGuard<'_, CorrelatorState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hands out transaction ids and resolves each request exactly once.
pub struct RequestCorrelator<T> {
    inner: Arc<CorrelatorInner<T>>,
}

impl<T> Clone for RequestCorrelator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for RequestCorrelator<T> {
    fn default() -> Self {
        Self::with_first_xid(1)
    }
}

impl<T> std::fmt::Debug for RequestCorrelator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RequestCorrelator")
            .field("next_xid", &state.next_xid)
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> RequestCorrelator<T> {
    pub fn with_first_xid(first_xid: u32) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                state: Mutex::new(CorrelatorState {
                    next_xid: first_xid,
                    pending: HashMap::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Reserves a fresh xid. After [`Self::close`] the returned context is already failed.
    pub fn create_request_context(&self) -> RequestContext<T> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.inner.lock();

        let xid = Self::allocate_xid(&mut state);

        if state.closed {
            let _ = sender.send(Err(RequestError::Closed));
            return RequestContext {
                xid,
                created_at: Instant::now(),
                receiver,
                correlator: Weak::new(),
            };
        }

        let previous = state.pending.insert(
            xid,
            Completion {
                sender: Some(sender),
            },
        );
        debug_assert!(previous.is_none(), "xid {xid} handed out twice");

        RequestContext {
            xid,
            created_at: Instant::now(),
            receiver,
            correlator: Arc::downgrade(&self.inner),
        }
    }

    fn allocate_xid(state: &mut CorrelatorState<T>) -> Xid {
        loop {
            let xid = Xid(state.next_xid);
            state.next_xid = state.next_xid.wrapping_add(1);
            if !state.pending.contains_key(&xid) {
                return xid;
            }
        }
    }

    /// Resolves the request `xid` with `outcome`.
    ///
    /// Fails with [`RequestError::UnknownXid`] when the xid was never issued or its requester is
    /// gone, and with [`RequestError::AlreadyCompleted`] when it was resolved before.
    pub fn complete(&self, xid: Xid, outcome: Outcome<T>) -> Result<(), RequestError> {
        let mut state = self.inner.lock();

        let Some(completion) = state.pending.get_mut(&xid) else {
            debug!("No outstanding request for {xid}, dropping its outcome");
            return Err(RequestError::UnknownXid(xid));
        };

        let Some(sender) = completion.sender.take() else {
            error!("Request {xid} was already completed");
            return Err(RequestError::AlreadyCompleted(xid));
        };

        if sender.send(outcome).is_err() {
            trace!("Requester of {xid} is gone");
        }
        Ok(())
    }

    /// Fails every outstanding request with [`RequestError::Closed`].
    ///
    /// Returns how many requests were failed. Further calls do nothing.
    pub fn close(&self) -> usize {
        let mut state = self.inner.lock();
        if state.closed {
            return 0;
        }
        state.closed = true;

        let mut failed = 0;
        for completion in state.pending.values_mut() {
            if let Some(sender) = completion.sender.take() {
                let _ = sender.send(Err(RequestError::Closed));
                failed += 1;
            }
        }

        debug!("Correlator closed, {failed} outstanding requests failed");
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Whether a requester still waits on `xid`.
    pub fn is_pending(&self, xid: Xid) -> bool {
        self.inner
            .lock()
            .pending
            .get(&xid)
            .is_some_and(|completion| completion.sender.is_some())
    }

    pub fn outstanding(&self) -> usize {
        self.inner
            .lock()
            .pending
            .values()
            .filter(|completion| completion.sender.is_some())
            .count()
    }
}

/// One issued request waiting for its outcome.
pub struct RequestContext<T> {
    xid: Xid,
    created_at: Instant,
    receiver: oneshot::Receiver<Outcome<T>>,
    correlator: Weak<CorrelatorInner<T>>,
}

impl<T> std::fmt::Debug for RequestContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("xid", &self.xid)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl<T> RequestContext<T> {
    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Waits for the outcome. On timeout the request is failed unless its reply won the race.
    pub async fn wait(mut self, timeout: Duration) -> Outcome<T> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RequestError::Closed),
            Err(_) => {
                if self.claim() {
                    return Err(RequestError::Timeout {
                        xid: self.xid,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                self.receiver
                    .try_recv()
                    .unwrap_or(Err(RequestError::Closed))
            }
        }
    }

    /// Marks the request as completed by its owner. `false` if someone else completed it first.
    fn claim(&self) -> bool {
        let Some(correlator) = self.correlator.upgrade() else {
            return false;
        };
        let mut state = correlator.lock();
        state
            .pending
            .get_mut(&self.xid)
            .and_then(|completion| completion.sender.take())
            .is_some()
    }
}

impl<T> Drop for RequestContext<T> {
    fn drop(&mut self) {
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.lock().pending.remove(&self.xid);
        }
    }
}

/// Joins the parts of multi-part replies, keyed by xid.
#[derive(Debug, Default)]
pub struct MultipartCollector {
    parts: HashMap<Xid, Vec<MultipartReply>>,
}

impl MultipartCollector {
    /// Returns every part of the reply once its last part arrived.
    pub fn push(&mut self, reply: MultipartReply) -> Option<(Xid, Vec<MultipartReply>)> {
        let xid = reply.xid;
        let last = !reply.request_more;
        self.parts.entry(xid).or_default().push(reply);

        if !last {
            return None;
        }
        self.parts.remove(&xid).map(|parts| (xid, parts))
    }

    pub fn discard(&mut self, xid: Xid) {
        self.parts.remove(&xid);
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }

    /// Drops the parts of replies nobody waits for anymore, like timed out requests.
    pub fn retain_pending<T>(&mut self, correlator: &RequestCorrelator<T>) -> usize {
        let before = self.parts.len();
        self.parts.retain(|xid, _| correlator.is_pending(*xid));
        before - self.parts.len()
    }

    pub fn in_progress(&self) -> usize {
        self.parts.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::protocol::{MultipartReplyBody, OfVersion};

    #[tokio::test]
    async fn xids_are_unique_among_live_requests() {
        let correlator = RequestCorrelator::<u32>::default();

        let contexts: Vec<_> = (0..64).map(|_| correlator.create_request_context()).collect();
        let xids: HashSet<Xid> = contexts.iter().map(|context| context.xid()).collect();
        assert_eq!(xids.len(), contexts.len());
        assert_eq!(correlator.outstanding(), 64);
    }

    #[tokio::test]
    async fn xid_allocation_skips_live_xids_after_wrap() {
        let correlator = RequestCorrelator::<u32>::with_first_xid(u32::MAX);

        let first = correlator.create_request_context();
        let second = correlator.create_request_context();
        assert_eq!(first.xid(), Xid(u32::MAX));
        assert_eq!(second.xid(), Xid(0));

        drop(second);
        let mut live = vec![first];
        for _ in 0..3 {
            live.push(correlator.create_request_context());
        }
        let xids: HashSet<Xid> = live.iter().map(|context| context.xid()).collect();
        assert_eq!(xids.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_creation_yields_distinct_xids() {
        let correlator = RequestCorrelator::<u32>::default();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let correlator = correlator.clone();
                tokio::spawn(async move {
                    (0..32)
                        .map(|_| correlator.create_request_context())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut xids = HashSet::new();
        let mut contexts = Vec::new();
        for handle in handles {
            for context in handle.await.unwrap() {
                assert!(xids.insert(context.xid()));
                contexts.push(context);
            }
        }
        assert_eq!(xids.len(), 256);
    }

    #[tokio::test]
    async fn completes_exactly_once() {
        let correlator = RequestCorrelator::<u32>::default();
        let context = correlator.create_request_context();
        let xid = context.xid();

        correlator.complete(xid, Ok(7)).unwrap();
        assert_eq!(
            correlator.complete(xid, Ok(8)),
            Err(RequestError::AlreadyCompleted(xid))
        );
        assert_eq!(context.wait(Duration::from_secs(1)).await, Ok(7));

        assert_eq!(
            correlator.complete(xid, Ok(9)),
            Err(RequestError::UnknownXid(xid))
        );
        assert_eq!(
            correlator.complete(Xid(4242), Ok(9)),
            Err(RequestError::UnknownXid(Xid(4242)))
        );
    }

    #[tokio::test]
    async fn close_fails_every_outstanding_request_once() {
        let correlator = RequestCorrelator::<u32>::default();
        let contexts: Vec<_> = (0..5).map(|_| correlator.create_request_context()).collect();
        correlator.complete(contexts[0].xid(), Ok(1)).unwrap();

        assert_eq!(correlator.close(), 4);
        assert_eq!(correlator.close(), 0);
        assert!(correlator.is_closed());

        let mut outcomes = Vec::new();
        for context in contexts {
            outcomes.push(context.wait(Duration::from_secs(1)).await);
        }
        assert_eq!(outcomes[0], Ok(1));
        assert!(outcomes[1..]
            .iter()
            .all(|outcome| *outcome == Err(RequestError::Closed)));

        let late = correlator.create_request_context();
        assert_eq!(
            late.wait(Duration::from_secs(1)).await,
            Err(RequestError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_the_request() {
        let correlator = RequestCorrelator::<u32>::default();
        let context = correlator.create_request_context();
        let xid = context.xid();

        let outcome = context.wait(Duration::from_millis(100)).await;
        assert_eq!(
            outcome,
            Err(RequestError::Timeout {
                xid,
                timeout_ms: 100
            })
        );
        assert_eq!(correlator.outstanding(), 0);
        assert!(correlator.complete(xid, Ok(1)).is_err());
    }

    #[test]
    fn collector_joins_parts() {
        let part = |request_more: bool, xid: u32| MultipartReply {
            xid: Xid(xid),
            version: OfVersion::V13,
            request_more,
            body: MultipartReplyBody::Flow(Vec::new()),
        };

        let mut collector = MultipartCollector::default();
        assert!(collector.push(part(true, 1)).is_none());
        assert!(collector.push(part(true, 2)).is_none());
        assert!(collector.push(part(true, 1)).is_none());

        let (xid, parts) = collector.push(part(false, 1)).unwrap();
        assert_eq!(xid, Xid(1));
        assert_eq!(parts.len(), 3);
        assert_eq!(collector.in_progress(), 1);

        collector.discard(Xid(2));
        assert_eq!(collector.in_progress(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn collector_forgets_parts_of_timed_out_requests() {
        let correlator = RequestCorrelator::<Vec<MultipartReply>>::default();
        let waiting = correlator.create_request_context();
        let abandoned = correlator.create_request_context();
        let part = |xid: Xid| MultipartReply {
            xid,
            version: OfVersion::V13,
            request_more: true,
            body: MultipartReplyBody::Flow(Vec::new()),
        };

        let mut collector = MultipartCollector::default();
        assert!(collector.push(part(waiting.xid())).is_none());
        assert!(collector.push(part(abandoned.xid())).is_none());
        assert!(collector.push(part(Xid(9000))).is_none());
        assert_eq!(collector.retain_pending(&correlator), 1);

        let outcome = abandoned.wait(Duration::from_millis(100)).await;
        assert!(matches!(outcome, Err(RequestError::Timeout { .. })));
        assert_eq!(collector.retain_pending(&correlator), 1);
        assert_eq!(collector.in_progress(), 1);
        assert!(correlator.is_pending(waiting.xid()));
    }
}
