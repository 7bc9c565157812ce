use super::*;
use crate::database::{lock, Database};
use crate::jobs::retrieve_profile;
use crate::jobs::sync_request;
use crate::recipients::{IdentityStore, VerifiedStatus};
use crate::service::{AccountManager, PushTokenSource};
use crate::testing::{Harness, MockAccountManager, StaticPushToken, LOCAL_NUMBER};
use crate::LinkError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn coordinator(
    h: &Harness,
    manager: Arc<MockAccountManager>,
    token: Option<&str>,
) -> LinkingCoordinator {
    let manager: Arc<dyn AccountManager> = manager;
    let push: Arc<dyn PushTokenSource> = Arc::new(StaticPushToken(token.map(str::to_string)));
    LinkingCoordinator::new(
        h.db.clone(),
        h.account.clone(),
        h.queue.clone(),
        h.config.clone(),
        manager,
        push,
    )
}

fn count_rows(h: &Harness, table: &str) -> i64 {
    lock(&h.db, "test")
        .unwrap()
        .conn()
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .unwrap()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<LinkingEvent>) -> Vec<LinkingEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn assert_nothing_persisted(h: &Harness) {
    assert!(!h.account.is_linked());
    assert!(!crate::account::AccountState::load(lock(&h.db, "test").unwrap().conn())
        .unwrap()
        .is_linked());
    assert_eq!(count_rows(h, "identities"), 0);
    assert_eq!(count_rows(h, "prekeys"), 0);
    assert!(h.queue.is_empty().unwrap());
}

#[tokio::test]
async fn test_link_succeeds_after_timeouts() {
    let h = Harness::new();
    let manager = Arc::new(MockAccountManager::new());
    manager.completion_timeouts.store(2, Ordering::SeqCst);
    let coordinator = coordinator(&h, manager.clone(), Some("push-token"));
    let mut rx = coordinator.subscribe();

    for _ in 0..2 {
        let err = coordinator.link().await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout(_)));
        assert_eq!(coordinator.state(), LinkingState::Failed);
    }
    let identity = coordinator.link().await.unwrap();

    assert_eq!(identity.account_id, LOCAL_NUMBER);
    assert_eq!(identity.device_id, 2);
    assert_eq!(coordinator.state(), LinkingState::Completed);
    assert!(h.account.is_linked());
    assert_eq!(manager.completion_calls.load(Ordering::SeqCst), 3);

    // Identity, prekeys and follow-on jobs are written exactly once.
    let record = IdentityStore::get_identity(lock(&h.db, "test").unwrap().conn(), LOCAL_NUMBER)
        .unwrap()
        .unwrap();
    assert_eq!(record.verified_status, VerifiedStatus::Verified);
    assert_eq!(
        record.identity_key,
        manager.registration.identity_key_pair.public_key()
    );
    assert_eq!(count_rows(&h, "identities"), 1);
    assert_eq!(*manager.prekey_uploads.lock().unwrap(), vec![10]);
    assert_eq!(count_rows(&h, "prekeys"), 11);

    let keys = h.factory_keys();
    assert_eq!(keys.len(), 5);
    assert_eq!(keys[0], retrieve_profile::KEY);
    for key in [
        sync_request::CONTACTS_KEY,
        sync_request::GROUPS_KEY,
        sync_request::BLOCKED_KEY,
        sync_request::CONFIGURATION_KEY,
    ] {
        assert!(keys.iter().any(|k| k == key), "missing {}", key);
    }

    let events = drain(&mut rx);
    let uris = events
        .iter()
        .filter(|e| matches!(e, LinkingEvent::ProvisioningUri(_)))
        .count();
    let failures = events
        .iter()
        .filter(|e| matches!(e, LinkingEvent::Failed(_)))
        .count();
    assert_eq!(uris, 3);
    assert_eq!(failures, 2);
    assert_eq!(
        events.last(),
        Some(&LinkingEvent::Linked {
            account_id: LOCAL_NUMBER.to_string(),
            device_id: 2,
        })
    );
}

#[tokio::test]
async fn test_provisioning_uri_event_carries_handle() {
    let h = Harness::new();
    let manager = Arc::new(MockAccountManager::new());
    let coordinator = coordinator(&h, manager, None);
    let mut rx = coordinator.subscribe();

    coordinator.link().await.unwrap();

    let LinkingEvent::ProvisioningUri(uri) = rx.try_recv().unwrap() else {
        panic!("first event should be the provisioning uri");
    };
    let parsed = ProvisioningUri::parse(&uri).unwrap();
    assert_eq!(parsed.handle, "handle-0");
}

#[tokio::test]
async fn test_new_attempt_supersedes_running_one() {
    let h = Harness::new();
    let (manager, gate) = MockAccountManager::gated();
    let manager = Arc::new(manager);
    let coordinator = coordinator(&h, manager.clone(), Some("push-token"));

    let first = coordinator.start().unwrap();
    manager.entered.notified().await;
    assert_eq!(coordinator.state(), LinkingState::AwaitingPrimaryConfirmation);

    let second = coordinator.start().unwrap();
    let aborted = first.await.unwrap_err();
    assert!(aborted.is_cancelled());

    gate.add_permits(1);
    let identity = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(identity.account_id, LOCAL_NUMBER);
    assert_eq!(manager.handles_issued.load(Ordering::SeqCst), 2);
    assert_eq!(*manager.prekey_uploads.lock().unwrap(), vec![10]);
    assert_eq!(count_rows(&h, "identities"), 1);
    assert_eq!(h.queue.len().unwrap(), 5);
    assert_eq!(coordinator.state(), LinkingState::Completed);
}

#[tokio::test]
async fn test_cancelled_attempt_cannot_commit() {
    let h = Harness::new();
    let (manager, gate) = MockAccountManager::gated();
    let manager = Arc::new(manager);
    let coordinator = coordinator(&h, manager.clone(), Some("push-token"));
    let mut rx = coordinator.subscribe();

    let running = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.link().await })
    };
    manager.entered.notified().await;

    coordinator.cancel().unwrap();
    assert_eq!(coordinator.state(), LinkingState::Failed);

    // Let the stale attempt run to its commit.
    gate.add_permits(1);
    let result = running.await.unwrap();
    assert!(matches!(result, Err(LinkError::Cancelled)));

    assert_eq!(manager.prekey_uploads.lock().unwrap().len(), 1);
    assert_nothing_persisted(&h);
    assert_eq!(coordinator.state(), LinkingState::Failed);

    // A stale attempt reports nothing after the URI.
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], LinkingEvent::ProvisioningUri(_)));
}

#[tokio::test]
async fn test_prekey_rejection_persists_nothing() {
    let h = Harness::new();
    let manager = Arc::new(MockAccountManager::new());
    *manager.reject_prekeys.lock().unwrap() = true;
    let coordinator = coordinator(&h, manager.clone(), Some("push-token"));

    let err = coordinator.link().await.unwrap_err();

    assert!(matches!(err, LinkError::UntrustedIdentity(_)));
    assert_eq!(coordinator.state(), LinkingState::Failed);
    assert_eq!(manager.push_registrations.lock().unwrap().len(), 1);
    assert_nothing_persisted(&h);
}

#[tokio::test]
async fn test_missing_push_token_disables_push() {
    let h = Harness::new();
    let manager = Arc::new(MockAccountManager::new());
    let coordinator = coordinator(&h, manager.clone(), None);

    coordinator.link().await.unwrap();

    assert_eq!(*manager.push_registrations.lock().unwrap(), vec![None]);
    let state = h.account.snapshot();
    assert!(state.push_disabled);
    assert!(state.websocket_registered);
    assert!(state.push_token.is_none());
    assert!(state.multi_device);
}

#[tokio::test]
async fn test_push_token_is_registered() {
    let h = Harness::new();
    let manager = Arc::new(MockAccountManager::new());
    let coordinator = coordinator(&h, manager.clone(), Some("push-token"));

    coordinator.link().await.unwrap();

    assert_eq!(
        *manager.push_registrations.lock().unwrap(),
        vec![Some("push-token".to_string())]
    );
    let state = h.account.snapshot();
    assert!(!state.push_disabled);
    assert_eq!(state.push_token.as_deref(), Some("push-token"));
    assert!(state.sender_certificate.is_some());
}

#[tokio::test]
async fn test_linked_account_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::on_disk(dir);
    let manager = Arc::new(MockAccountManager::new());
    let coordinator = coordinator(&h, manager.clone(), Some("push-token"));

    let identity = coordinator.link().await.unwrap();
    let expected_next = h.account.snapshot().next_prekey_id;

    let reopened = Database::open(h.dir.path().join("account.db")).unwrap();
    let state = crate::account::AccountState::load(reopened.conn()).unwrap();
    assert!(state.is_linked());
    assert_eq!(state.local_identifier(), Some(LOCAL_NUMBER));
    assert_eq!(state.next_prekey_id, expected_next);
    let stored = state.identity.unwrap();
    assert_eq!(stored.registration_id, identity.registration_id);
    assert_eq!(
        stored.identity_key_pair.public_key(),
        identity.identity_key_pair.public_key()
    );
    assert_eq!(stored.profile_key, identity.profile_key);
}

#[tokio::test]
async fn test_linked_account_starts_completed() {
    let h = Harness::new();
    h.link_account();
    let coordinator = coordinator(&h, Arc::new(MockAccountManager::new()), None);
    assert_eq!(coordinator.state(), LinkingState::Completed);
}
