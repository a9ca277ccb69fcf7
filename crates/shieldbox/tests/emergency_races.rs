//! concurrency and fail-closed behaviour of the emergency flow and sessions

use std::sync::{Arc, Barrier};
use std::thread;

use shieldbox::crypto::{KdfParams, KdfPolicy};
use shieldbox::directory::{DocumentCatalog, DocumentDescriptor, GuardianProfile, OwnerProfile};
use shieldbox::memory::{MemoryAuditSink, MemoryCatalog, MemoryDirectory};
use shieldbox::*;

struct Harness {
    clock: Arc<ManualClock>,
    sink: Arc<MemoryAuditSink>,
    coordinator: Arc<EmergencyCoordinator>,
}

fn harness(guardians: &[(&str, GuardianRoles)], required: u32) -> Harness {
    let clock = Arc::new(ManualClock::new(5_000));
    let directory = Arc::new(MemoryDirectory::new());
    directory
        .put_owner(OwnerProfile {
            owner_id: "alice".into(),
            is_shield_enabled: true,
            required_confirmations: required,
            inactivity_threshold_secs: None,
        })
        .unwrap();
    for (name, roles) in guardians {
        directory
            .put_guardian(GuardianProfile {
                guardian_id: (*name).into(),
                owner_id: "alice".into(),
                public_key: SecretKey::generate().public_key(),
                roles: *roles,
            })
            .unwrap();
    }

    let catalog = Arc::new(MemoryCatalog::new());
    for (id, category) in [("deed", Category::Property), ("ledger", Category::Financial)] {
        catalog
            .register(&DocumentDescriptor {
                document_id: id.into(),
                owner_id: "alice".into(),
                category,
                version: 1,
            })
            .unwrap();
    }

    let sink = Arc::new(MemoryAuditSink::new());
    let audit = Arc::new(AuditLog::new(sink.clone(), clock.clone()));
    let coordinator = Arc::new(EmergencyCoordinator::new(
        directory,
        catalog,
        audit,
        clock.clone(),
        EmergencyPolicy::default(),
    ));
    Harness { clock, sink, coordinator }
}

fn executor() -> GuardianRoles {
    GuardianRoles { is_will_executor: true, ..Default::default() }
}

fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("g{}", i)).collect()
}

#[test]
fn test_racing_final_confirmations_issue_one_token() {
    for _ in 0..50 {
        let ids = names(3);
        let guardians: Vec<_> = ids.iter().map(|n| (n.as_str(), executor())).collect();
        let h = harness(&guardians, 3);

        let ep = h
            .coordinator
            .trigger(&"alice".into(), Trigger::System, ActivationReason::Inactivity, None)
            .unwrap();
        h.coordinator.confirm(&ep.id, &"g0".into(), None).unwrap();

        // 2nd and 3rd of 3 race
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["g1", "g2"]
            .into_iter()
            .map(|g| {
                let coordinator = h.coordinator.clone();
                let barrier = barrier.clone();
                let id = ep.id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    coordinator.confirm(&id, &g.into(), None).unwrap()
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();
        let activated = outcomes
            .iter()
            .filter(|o| matches!(o, ConfirmOutcome::Activated(_)))
            .count();
        assert_eq!(activated, 1, "outcomes: {:?}", outcomes);
        assert_eq!(h.coordinator.state(&ep.id).unwrap(), ActivationState::Activated);
    }
}

#[test]
fn test_surplus_confirmations_issue_exactly_one_token() {
    // M = 2, M + 2 = 4 confirmations
    let ids = names(4);
    let guardians: Vec<_> = ids.iter().map(|n| (n.as_str(), executor())).collect();
    let h = harness(&guardians, 2);

    let ep = h
        .coordinator
        .trigger(&"alice".into(), Trigger::Guardian { guardian_id: "g0".into() }, ActivationReason::Manual, None)
        .unwrap();

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|g| {
            let coordinator = h.coordinator.clone();
            let id = ep.id.clone();
            thread::spawn(move || coordinator.confirm(&id, &g.into(), None).unwrap())
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    let tokens = outcomes
        .iter()
        .filter(|o| matches!(o, ConfirmOutcome::Activated(_)))
        .count();
    let late = outcomes
        .iter()
        .filter(|o| matches!(o, ConfirmOutcome::AlreadyActivated { .. }))
        .count();
    assert_eq!(tokens, 1);
    assert_eq!(late, 2);
    assert_eq!(h.coordinator.summary(&ep.id).unwrap().confirmations.len(), 4);
}

fn activated_token(h: &Harness, guardian: &str) -> IssuedToken {
    let ep = h
        .coordinator
        .trigger(&"alice".into(), Trigger::Guardian { guardian_id: guardian.into() }, ActivationReason::Emergency, None)
        .unwrap();
    match h.coordinator.confirm(&ep.id, &guardian.into(), None).unwrap() {
        ConfirmOutcome::Activated(t) => t,
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_no_permission_escalation() {
    // will executor: legal, will, estate, property only
    let h = harness(&[("exec", executor())], 1);
    let issued = activated_token(&h, "exec");
    assert!(issued.permissions.contains(Category::Legal));

    h.coordinator
        .exchange_verification_code(&issued.access_token, &issued.verification_code)
        .unwrap();

    for _ in 0..20 {
        assert!(matches!(
            h.coordinator.authorize(&issued.access_token, &"ledger".into(), None),
            Err(Error::Forbidden { category: Category::Financial })
        ));
        h.clock.advance(60);
    }
    assert!(h.coordinator.authorize(&issued.access_token, &"deed".into(), None).is_ok());
}

#[test]
fn test_audit_failure_fails_access() {
    let h = harness(&[("exec", executor())], 1);
    let issued = activated_token(&h, "exec");
    let code = Some(issued.verification_code.as_str());

    h.sink.set_failing(true);
    assert!(matches!(
        h.coordinator.authorize(&issued.access_token, &"deed".into(), code),
        Err(Error::AuditWriteFailure(_))
    ));
    // denials fail closed the same way
    assert!(matches!(
        h.coordinator.authorize(&issued.access_token, &"ledger".into(), code),
        Err(Error::AuditWriteFailure(_))
    ));
    assert!(h.sink.is_empty());

    h.sink.set_failing(false);
    // the unaudited exchange never happened, the code is still required
    assert!(matches!(
        h.coordinator.authorize(&issued.access_token, &"deed".into(), None),
        Err(Error::VerificationRequired)
    ));
    let grant = h.coordinator.authorize(&issued.access_token, &"deed".into(), code).unwrap();
    assert_eq!(grant.audit_sequence, 1);
    assert_eq!(h.sink.len(), 2);
}

#[test]
fn test_owners_do_not_share_episodes() {
    let h = harness(&[("exec", executor())], 1);
    let issued = activated_token(&h, "exec");

    // unknown documents and owners
    assert!(matches!(
        h.coordinator.authorize(&issued.access_token, &"someone-elses".into(), Some(&issued.verification_code)),
        Err(Error::DocumentNotFound(_))
    ));
    assert!(matches!(
        h.coordinator.trigger(&"bob".into(), Trigger::System, ActivationReason::Inactivity, None),
        Err(Error::UserNotFound(_))
    ));
}

#[test]
fn test_parallel_unlocks_respect_lockout() {
    let clock = Arc::new(ManualClock::new(0));
    let policy = KdfPolicy { min_memory_kib: 64, min_iterations: 1 };
    let params = KdfParams { memory_kib: 64, iterations: 1, parallelism: 1 };
    let (header, _) = VaultHeader::create("alice".into(), b"right", params, &policy).unwrap();
    let session = Arc::new(SessionManager::new(
        header,
        policy,
        SessionPolicy {
            auto_lock_timeout_secs: 60,
            max_failed_attempts: 3,
            lockout_duration_secs: 600,
        },
        clock.clone(),
    ));

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let session = session.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                session.unlock(b"wrong")
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    let wrong = results.iter().filter(|r| matches!(r, Err(Error::WrongPassword { .. }))).count();
    let locked = results.iter().filter(|r| matches!(r, Err(Error::LockedOut { .. }))).count();
    assert_eq!(wrong, 3);
    assert_eq!(locked, 5);

    // correct password still refused until the lockout elapses
    assert!(matches!(session.unlock(b"right"), Err(Error::LockedOut { .. })));
    clock.advance(600);
    assert!(session.unlock(b"right").is_ok());
}
