//! Endpoint candidates and failover policy.
//!
//! A [`ContactInfoList`] holds the effective target profile for one object
//! reference; each invocation draws a fresh [`ContactInfoIterator`] from it
//! and reports classified failures back. Retry policy is expressed as an
//! explicit [`RetryDecision`] value, never as control flow smuggled through
//! exceptions.

use crate::error::{ClientError, ClientResult};
use bytes::Bytes;
use corbel_protocol::AddressingDisposition;
use corbel_transport::{BackoffConfig, ContactInfo, TargetProfile, TransportError};
use corbel_protocol::Completion;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What the failover policy decided about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the same endpoint after a backoff wait.
    RetrySame,
    /// Advance to the next candidate endpoint.
    RetryNext,
    /// The failure is not retryable.
    GiveUp,
}

impl RetryDecision {
    /// Classification rule: a rebind retries the same endpoint; a
    /// communications failure that provably never started
    /// (`Completion::No`) moves on to the next candidate; everything else
    /// is terminal.
    pub fn classify(err: &TransportError) -> Self {
        match err {
            TransportError::Rebind => RetryDecision::RetrySame,
            _ if err.completion() == Some(Completion::No) => RetryDecision::RetryNext,
            _ => RetryDecision::GiveUp,
        }
    }
}

/// Ordered endpoint candidates for one target, shared across invocations.
pub struct ContactInfoList {
    root: TargetProfile,
    effective: Mutex<TargetProfile>,
    rotation: AtomicUsize,
}

impl ContactInfoList {
    pub fn new(profile: TargetProfile) -> ClientResult<Self> {
        if profile.contacts.is_empty() {
            return Err(ClientError::NoContacts);
        }
        Ok(Self {
            root: profile.clone(),
            effective: Mutex::new(profile),
            rotation: AtomicUsize::new(0),
        })
    }

    /// The original profile, kept for the last-resort retry.
    pub fn root(&self) -> &TargetProfile {
        &self.root
    }

    /// Replaces the effective target after a location forward. Subsequent
    /// iterators start from the forwarded candidates.
    pub fn adopt(&self, profile: TargetProfile) {
        if profile.contacts.is_empty() {
            return;
        }
        *self.effective.lock() = profile;
    }

    /// A fresh iterator over the current candidate set. With per-request
    /// balancing the starting offset rotates by one per iterator, keeping
    /// candidates of the start endpoint's transport kind ahead of the rest
    /// so a rotation never mixes cleartext and secure orderings.
    pub fn iterator(&self, backoff: BackoffConfig) -> ContactInfoIterator {
        let effective = self.effective.lock().clone();
        let mut candidates = effective.contacts.clone();
        if effective.per_request_balancing && candidates.len() > 1 {
            let start = self.rotation.fetch_add(1, Ordering::Relaxed) % candidates.len();
            candidates.rotate_left(start);
            let kind = candidates[0].transport;
            candidates.sort_by_key(|c| c.transport != kind);
        }
        ContactInfoIterator {
            candidates,
            root: self.root.clone(),
            position: 0,
            root_retry_used: false,
            backoff,
            current_wait: backoff.initial_wait,
            spent: Duration::ZERO,
            object_key: effective.object_key.clone(),
            disposition: AddressingDisposition::Key,
        }
    }
}

/// Per-invocation failover state machine.
pub struct ContactInfoIterator {
    candidates: Vec<ContactInfo>,
    root: TargetProfile,
    position: usize,
    root_retry_used: bool,
    backoff: BackoffConfig,
    current_wait: Duration,
    spent: Duration,
    object_key: Bytes,
    disposition: AddressingDisposition,
}

impl ContactInfoIterator {
    /// The endpoint the next attempt should use.
    pub fn current(&self) -> ClientResult<ContactInfo> {
        self.candidates
            .get(self.position)
            .cloned()
            .ok_or(ClientError::NoContacts)
    }

    pub fn object_key(&self) -> Bytes {
        self.object_key.clone()
    }

    pub fn disposition(&self) -> AddressingDisposition {
        self.disposition
    }

    /// Feeds a classified failure into the policy. `Ok(())` means another
    /// attempt is allowed and [`current`](Self::current) points at the
    /// endpoint to use; an error is terminal for this invocation.
    pub async fn report_exception(&mut self, err: TransportError) -> ClientResult<()> {
        match RetryDecision::classify(&err) {
            RetryDecision::RetrySame => {
                tracing::debug!(endpoint = %self.current()?, "rebind, retrying same endpoint");
                self.wait().await
            }
            RetryDecision::RetryNext => {
                self.position += 1;
                if self.position < self.candidates.len() {
                    tracing::debug!(endpoint = %self.current()?, "advancing to next endpoint");
                    return self.wait().await;
                }
                if !self.root_retry_used {
                    // one last attempt from the unforwarded root profile
                    self.root_retry_used = true;
                    self.candidates = self.root.contacts.clone();
                    self.object_key = self.root.object_key.clone();
                    self.position = 0;
                    tracing::debug!("candidates exhausted, falling back to root profile");
                    return self.wait().await;
                }
                Err(ClientError::EndpointsExhausted { last: err })
            }
            RetryDecision::GiveUp => Err(err.into()),
        }
    }

    /// Adopts a forwarded profile: fresh candidate set, stale positions
    /// never reused.
    pub fn report_redirect(&mut self, profile: TargetProfile) -> ClientResult<()> {
        if profile.contacts.is_empty() {
            return Err(ClientError::NoContacts);
        }
        self.candidates = profile.contacts.clone();
        self.object_key = profile.object_key.clone();
        self.position = 0;
        Ok(())
    }

    /// Same-endpoint retry with an adjusted addressing disposition,
    /// bypassing endpoint iteration entirely.
    pub fn report_addressing_retry(&mut self, disposition: AddressingDisposition) {
        self.disposition = disposition;
    }

    async fn wait(&mut self) -> ClientResult<()> {
        if self.spent + self.current_wait > self.backoff.total_budget {
            return Err(ClientError::RetryBudgetExhausted(self.backoff.total_budget));
        }
        tokio::time::sleep(self.current_wait).await;
        self.spent += self.current_wait;
        self.current_wait = self.backoff.next_wait(self.current_wait);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corbel_transport::TransportKind;

    fn quick_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_wait: Duration::from_millis(1),
            multiplier_pct: 100,
            max_wait: Duration::from_millis(1),
            total_budget: Duration::from_secs(5),
        }
    }

    fn profile(ports: &[u16]) -> TargetProfile {
        TargetProfile::new(
            ports.iter().map(|p| ContactInfo::plain("host", *p)).collect(),
            &b"obj"[..],
        )
    }

    fn refused() -> TransportError {
        TransportError::comm_failure("refused", Completion::No)
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            RetryDecision::classify(&TransportError::Rebind),
            RetryDecision::RetrySame
        );
        assert_eq!(RetryDecision::classify(&refused()), RetryDecision::RetryNext);
        assert_eq!(
            RetryDecision::classify(&TransportError::ConnectionClosed),
            RetryDecision::RetryNext
        );
        assert_eq!(
            RetryDecision::classify(&TransportError::comm_failure("reset", Completion::Maybe)),
            RetryDecision::GiveUp
        );
        assert_eq!(
            RetryDecision::classify(&TransportError::ResponseTimeout(Duration::from_secs(1))),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test]
    async fn test_failover_sequencing_with_root_retry() {
        let list = ContactInfoList::new(profile(&[1, 2, 3])).unwrap();
        let mut iter = list.iterator(quick_backoff());

        assert_eq!(iter.current().unwrap().port, 1);
        iter.report_exception(refused()).await.unwrap();
        assert_eq!(iter.current().unwrap().port, 2);
        iter.report_exception(refused()).await.unwrap();
        assert_eq!(iter.current().unwrap().port, 3);

        // exhausting the candidates grants exactly one root-profile pass
        iter.report_exception(refused()).await.unwrap();
        assert_eq!(iter.current().unwrap().port, 1);
        iter.report_exception(refused()).await.unwrap();
        iter.report_exception(refused()).await.unwrap();
        assert_eq!(iter.current().unwrap().port, 3);

        let err = iter.report_exception(refused()).await.unwrap_err();
        assert!(matches!(err, ClientError::EndpointsExhausted { .. }));
    }

    #[tokio::test]
    async fn test_rebind_stays_on_same_endpoint() {
        let list = ContactInfoList::new(profile(&[1, 2])).unwrap();
        let mut iter = list.iterator(quick_backoff());
        iter.report_exception(TransportError::Rebind).await.unwrap();
        assert_eq!(iter.current().unwrap().port, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_propagates() {
        let list = ContactInfoList::new(profile(&[1, 2])).unwrap();
        let mut iter = list.iterator(quick_backoff());
        let err = iter
            .report_exception(TransportError::comm_failure("mid-flight", Completion::Maybe))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::CommFailure { .. })
        ));
        // position untouched
        assert_eq!(iter.current().unwrap().port, 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_terminal() {
        let backoff = BackoffConfig {
            initial_wait: Duration::from_millis(10),
            multiplier_pct: 100,
            max_wait: Duration::from_millis(10),
            total_budget: Duration::from_millis(15),
        };
        let list = ContactInfoList::new(profile(&[1])).unwrap();
        let mut iter = list.iterator(backoff);
        iter.report_exception(TransportError::Rebind).await.unwrap();
        let err = iter
            .report_exception(TransportError::Rebind)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RetryBudgetExhausted(_)));
    }

    #[tokio::test]
    async fn test_redirect_resets_candidates() {
        let list = ContactInfoList::new(profile(&[1, 2])).unwrap();
        let mut iter = list.iterator(quick_backoff());
        iter.report_exception(refused()).await.unwrap();
        assert_eq!(iter.current().unwrap().port, 2);

        let forwarded = TargetProfile::new(
            vec![ContactInfo::plain("fwd", 9)],
            &b"fwd-key"[..],
        );
        iter.report_redirect(forwarded).unwrap();
        assert_eq!(iter.current().unwrap().host, "fwd");
        assert_eq!(iter.object_key().as_ref(), b"fwd-key");
    }

    #[tokio::test]
    async fn test_addressing_retry_bypasses_iteration() {
        let list = ContactInfoList::new(profile(&[1, 2])).unwrap();
        let mut iter = list.iterator(quick_backoff());
        iter.report_addressing_retry(AddressingDisposition::Profile);
        assert_eq!(iter.disposition(), AddressingDisposition::Profile);
        assert_eq!(iter.current().unwrap().port, 1);
    }

    #[test]
    fn test_per_request_balancing_rotates_start() {
        let prof = profile(&[1, 2, 3]).with_per_request_balancing();
        let list = ContactInfoList::new(prof).unwrap();
        let starts: Vec<u16> = (0..4)
            .map(|_| list.iterator(quick_backoff()).current().unwrap().port)
            .collect();
        assert_eq!(starts, vec![1, 2, 3, 1]);
    }

    #[test]
    fn test_rotation_keeps_transport_kinds_grouped() {
        let contacts = vec![
            ContactInfo::plain("a", 1),
            ContactInfo::new(TransportKind::Secure, "b", 2),
            ContactInfo::plain("c", 3),
        ];
        let prof = TargetProfile::new(contacts, &b"k"[..]).with_per_request_balancing();
        let list = ContactInfoList::new(prof).unwrap();

        // second iterator starts at the secure endpoint; the other secure
        // candidates (none here) would precede the cleartext remainder
        let _first = list.iterator(quick_backoff());
        let iter = list.iterator(quick_backoff());
        let start = iter.current().unwrap();
        assert_eq!(start.transport, TransportKind::Secure);
        assert_eq!(
            iter.candidates.iter().map(|c| c.port).collect::<Vec<_>>(),
            vec![2, 3, 1]
        );
    }

    #[test]
    fn test_adopted_profile_feeds_new_iterators() {
        let list = ContactInfoList::new(profile(&[1])).unwrap();
        list.adopt(TargetProfile::new(
            vec![ContactInfo::plain("moved", 7)],
            &b"obj"[..],
        ));
        let iter = list.iterator(quick_backoff());
        assert_eq!(iter.current().unwrap().host, "moved");
        // the root is untouched
        assert_eq!(list.root().contacts[0].port, 1);
    }

    #[test]
    fn test_empty_profile_rejected() {
        assert!(matches!(
            ContactInfoList::new(TargetProfile::new(vec![], &b"k"[..])),
            Err(ClientError::NoContacts)
        ));
    }
}
