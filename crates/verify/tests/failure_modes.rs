//! Runs against an orchestrator that misbehaves

mod common;

use std::sync::Arc;

use common::*;
use credrot_verify::testing::Faults;
use credrot_verify::{EncryptedDataVerifier, Hook, RunPlan, Step, VerifierRegistry, VerifyError};
use pretty_assertions::assert_eq;

fn faulty(faults: Faults) -> credrot_verify::testing::FakeGarden {
    garden("local", faults)
}

#[tokio::test(start_paused = true)]
async fn ignored_operation_times_out() {
    // GIVEN an orchestrator that never picks up the annotation
    let garden = faulty(Faults {
        ignore_operations: true,
        ..Faults::default()
    });
    let driver = driver(&garden, material_registry(&garden));

    // WHEN a rotation runs
    let failure = driver.run(&RunPlan::TwoPhase).await.unwrap_err();

    // THEN the wait for acceptance times out and cleanup still ran
    assert!(failure.error.is_timeout(), "{}", failure.error);
    let VerifyError::PollTimeout { condition, .. } = failure.error.root() else {
        panic!("expected a timeout, got {}", failure.error);
    };
    assert_eq!(condition, "rotate-credentials-start accepted");
    assert!(failure.report.operations().is_empty());
    assert_eq!(failure.report.hooks(), vec![Hook::Before, Hook::Cleanup]);
}

#[tokio::test(start_paused = true)]
async fn unpruned_primary_fails_with_diff() {
    // GIVEN an orchestrator that keeps the old primary on completion
    let garden = faulty(Faults {
        keep_old_primary: true,
        ..Faults::default()
    });
    let driver = driver(&garden, full_registry(&garden));

    // WHEN a rotation runs
    let failure = driver.run(&RunPlan::TwoPhase).await.unwrap_err();

    // THEN the completed checkpoint reports the retained identity
    assert!(failure.error.is_violation(), "{}", failure.error);
    assert!(matches!(
        failure.error,
        VerifyError::Hook {
            hook: Hook::AfterCompleted,
            ..
        }
    ));
    let diff = failure.error.diff().expect("diff attached");
    assert!(diff.removed.is_empty());
    assert!(diff.retained.iter().any(|name| name.starts_with("ca-g")));

    // AND cleanup released what the run created
    assert_eq!(failure.report.hooks().last(), Some(&Hook::Cleanup));
    assert!(failure.report.cleanup.is_clean());
    assert_eq!(garden.stored_objects(), 0);
    assert_eq!(garden.released_access().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn stale_initiation_is_a_violation() {
    let garden = faulty(Faults {
        stale_initiation: true,
        ..Faults::default()
    });
    let driver = driver(&garden, material_registry(&garden));

    let failure = driver.run(&RunPlan::TwoPhase).await.unwrap_err();

    assert!(failure.error.is_violation(), "{}", failure.error);
    assert!(matches!(
        failure.error,
        VerifyError::Hook {
            hook: Hook::ExpectPreparingStatus,
            ..
        }
    ));
    assert_eq!(failure.report.hooks(), vec![Hook::Before, Hook::Cleanup]);
}

#[tokio::test(start_paused = true)]
async fn completing_without_finished_time_aborts_the_wait() {
    let garden = faulty(Faults {
        drop_finished_time: true,
        ..Faults::default()
    });
    let driver = driver(&garden, material_registry(&garden));

    let failure = driver.run(&RunPlan::TwoPhase).await.unwrap_err();

    // Aborted on the first observation, not after the poll timeout
    assert!(failure.error.is_violation(), "{}", failure.error);
    assert!(failure.error.to_string().contains("lastInitiationFinishedTime"));
    assert_eq!(
        failure.report.operations(),
        vec!["rotate-credentials-start", "rotate-credentials-complete"]
    );
    assert!(!failure.report.hooks().contains(&Hook::ExpectCompletingStatus));
}

#[tokio::test(start_paused = true)]
async fn removed_pool_left_pending_times_out() {
    let garden = faulty(Faults {
        keep_removed_pool_pending: true,
        ..Faults::default()
    });
    let driver = driver(&garden, material_registry(&garden));

    let failure = driver
        .run(&RunPlan::WithoutWorkersRollout {
            remove_last_pool: true,
        })
        .await
        .unwrap_err();

    assert!(failure.error.is_timeout(), "{}", failure.error);
    assert!(failure.error.to_string().contains("worker2 no longer pending"));
    assert!(
        failure
            .report
            .steps
            .iter()
            .any(|record| record.step == Step::WorkerPoolRemoved("worker2".into()))
    );
    assert!(failure.report.rolled_out.is_empty());
}

#[tokio::test(start_paused = true)]
async fn data_not_reencrypted_is_unreadable_after_completion() {
    // GIVEN an orchestrator that retires the old key without re-encrypting
    let garden = faulty(Faults {
        skip_reencryption: true,
        ..Faults::default()
    });
    let registry = VerifierRegistry::new()
        .with(kube_key_verifier(&garden))
        .with(EncryptedDataVerifier::new(
            Arc::new(garden.clone()),
            vec![secrets()],
        ));
    let driver = driver(&garden, registry);

    // WHEN a rotation runs
    let failure = driver.run(&RunPlan::TwoPhase).await.unwrap_err();

    // THEN data written before the rotation cannot be read back
    assert!(failure.error.is_timeout(), "{}", failure.error);
    assert!(matches!(
        &failure.error,
        VerifyError::Hook {
            hook: Hook::AfterCompleted,
            verifier,
            ..
        } if verifier == "encrypted-data"
    ));
    assert!(failure.report.hooks().contains(&Hook::AfterPrepared));

    // AND the objects are still deleted
    assert_eq!(garden.stored_objects(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_release_fails_an_otherwise_good_run() {
    // GIVEN an orchestrator that refuses to release minted credentials
    let garden = faulty(Faults {
        fail_release: true,
        ..Faults::default()
    });
    let driver = driver(&garden, full_registry(&garden));

    // WHEN a rotation runs
    let failure = driver.run(&RunPlan::TwoPhase).await.unwrap_err();

    // THEN every checkpoint passed and only cleanup failed
    assert!(failure.report.hooks().contains(&Hook::AfterCompleted));
    let VerifyError::Cleanup(failures) = &failure.error else {
        panic!("expected a cleanup failure, got {}", failure.error);
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].verifier, "shoot-access");
    assert!(!failure.report.cleanup.released.iter().any(|name| name == "shoot-access"));

    // AND the other members still cleaned up
    assert!(failure.report.cleanup.released.iter().any(|name| name == "encrypted-data"));
    assert_eq!(garden.stored_objects(), 0);
}

#[tokio::test(start_paused = true)]
async fn cleanup_failure_never_replaces_the_first_error() {
    let garden = faulty(Faults {
        stale_initiation: true,
        fail_release: true,
        ..Faults::default()
    });
    let driver = driver(&garden, full_registry(&garden));

    let failure = driver.run(&RunPlan::TwoPhase).await.unwrap_err();

    assert!(failure.error.is_violation(), "{}", failure.error);
    assert_eq!(failure.report.cleanup.failures.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn old_certificates_still_trusted_after_completion() {
    // GIVEN an orchestrator that keeps trusting the retired authorities
    let garden = faulty(Faults {
        keep_old_trust: true,
        ..Faults::default()
    });
    let driver = driver(&garden, full_registry(&garden));

    // WHEN a rotation runs
    let failure = driver.run(&RunPlan::TwoPhase).await.unwrap_err();

    // THEN credentials minted before the rotation are still accepted
    assert!(failure.error.is_violation(), "{}", failure.error);
    assert!(matches!(
        &failure.error,
        VerifyError::Hook {
            hook: Hook::AfterCompleted,
            verifier,
            ..
        } if verifier == "shoot-access"
    ));
    let VerifyError::InvariantViolation { check, .. } = failure.error.root() else {
        panic!("expected a violation, got {}", failure.error);
    };
    assert_eq!(check, "e2e-rotate-csr-before rejected");
    assert_eq!(garden.released_access().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn old_observability_password_still_accepted() {
    let garden = faulty(Faults {
        keep_old_password: true,
        ..Faults::default()
    });
    let driver = driver(&garden, full_registry(&garden));

    let failure = driver.run(&RunPlan::TwoPhase).await.unwrap_err();

    assert!(failure.error.is_violation(), "{}", failure.error);
    assert!(matches!(
        &failure.error,
        VerifyError::Hook {
            hook: Hook::AfterPrepared,
            verifier,
            ..
        } if verifier == "observability"
    ));
    assert!(
        failure
            .error
            .to_string()
            .contains("old observability credentials rejected")
    );
    assert!(!failure.report.hooks().contains(&Hook::AfterPrepared));
}

#[tokio::test(start_paused = true)]
async fn nodes_replaced_before_the_rollout_are_a_violation() {
    // GIVEN an orchestrator that rolls the nodes although the rollout is deferred
    let garden = faulty(Faults {
        roll_nodes_early: true,
        ..Faults::default()
    });
    let driver = driver(&garden, material_registry(&garden));

    // WHEN the workers rollout is deferred
    let failure = driver
        .run(&RunPlan::WithoutWorkersRollout {
            remove_last_pool: false,
        })
        .await
        .unwrap_err();

    // THEN the replaced nodes are reported before any rollout is issued
    assert!(failure.error.is_violation(), "{}", failure.error);
    let VerifyError::InvariantViolation { check, detail, .. } = failure.error.root() else {
        panic!("expected a violation, got {}", failure.error);
    };
    assert_eq!(check, "node identities");
    assert!(detail.contains("machine-worker1-"), "{detail}");
    assert_eq!(
        failure.report.operations(),
        vec!["rotate-credentials-start-without-workers-rollout"]
    );
    assert!(failure.report.rolled_out.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_leaves_cleanup_failures_per_object() {
    // GIVEN a protected store that refuses connections after the first one
    let garden = faulty(Faults {
        refuse_connects_after: Some(1),
        ..Faults::default()
    });
    let registry = VerifierRegistry::new()
        .with(kube_key_verifier(&garden))
        .with(EncryptedDataVerifier::new(
            Arc::new(garden.clone()),
            vec![secrets()],
        ));
    let driver = driver(&garden, registry);

    // WHEN a rotation runs
    let failure = driver.run(&RunPlan::TwoPhase).await.unwrap_err();

    // THEN the checkpoint times out waiting for the store
    assert!(failure.error.is_timeout(), "{}", failure.error);
    assert!(matches!(
        &failure.error,
        VerifyError::Hook {
            hook: Hook::AfterPrepared,
            verifier,
            ..
        } if verifier == "encrypted-data"
    ));

    // AND cleanup still ran every member and named the object it left behind
    assert_eq!(failure.report.hooks().last(), Some(&Hook::Cleanup));
    assert_eq!(failure.report.cleanup.released, vec![KEY_NAME]);
    assert_eq!(failure.report.cleanup.failures.len(), 1);
    let left = &failure.report.cleanup.failures[0];
    assert_eq!(left.verifier, "encrypted-data");
    assert!(left.error.contains("secrets/e2e-rotate-"), "{}", left.error);
    assert!(left.error.contains("protected store reachable"), "{}", left.error);
    assert_eq!(garden.stored_objects(), 1);
}
