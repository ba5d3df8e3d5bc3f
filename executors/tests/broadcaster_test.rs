mod fixtures;

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use fixtures::*;
use tokio::sync::oneshot;
use txm_core::transaction::UnsignedTransaction;
use txm_executors::txm::{
    Attempt, AttemptState, SendEveryStrategy, TxState, TxStore, now_ms,
};

#[tokio::test]
async fn sequential_sends_get_consecutive_nonces() {
    let h = harness(test_config(), &[FROM_A]);
    h.chain.set_pending_nonce(FROM_A, 7);

    for _ in 0..5 {
        h.manager
            .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
            .await
            .unwrap();
    }
    h.drain(FROM_A).await.unwrap();

    let nonces: Vec<Option<u64>> = h
        .store
        .transactions_for(FROM_A)
        .await
        .into_iter()
        .map(|tx| tx.nonce)
        .collect();
    assert_eq!(nonces, (7..12).map(Some).collect::<Vec<_>>());

    // submitted in nonce order, one raw transaction each
    let submitted: Vec<u64> = h
        .chain
        .submitted_from(FROM_A)
        .iter()
        .map(|raw| decode_raw(raw).1)
        .collect();
    assert_eq!(submitted, (7..12).collect::<Vec<_>>());
}

#[tokio::test]
async fn store_counter_wins_over_chain_nonce() {
    let h = harness(test_config(), &[FROM_A]);
    h.chain.set_pending_nonce(FROM_A, 3);

    let first = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    h.drain(FROM_A).await.unwrap();

    // a lagging node must not make the counter go backwards
    h.chain.set_pending_nonce(FROM_A, 0);
    let second = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    h.drain(FROM_A).await.unwrap();

    assert_eq!(h.tx(&first.id).await.nonce, Some(3));
    assert_eq!(h.tx(&second.id).await.nonce, Some(4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_while_running_never_share_a_nonce() {
    let h = Arc::new(harness(test_config(), &[FROM_A]));
    h.chain.set_pending_nonce(FROM_A, 100);
    h.manager.start().await.unwrap();

    let creates = (0..25).map(|_| {
        let h = h.clone();
        tokio::spawn(async move {
            h.manager
                .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
                .await
                .unwrap()
        })
    });
    for created in futures::future::join_all(creates).await {
        created.unwrap();
    }

    let all_sent = wait_until(Duration::from_secs(10), || {
        let h = h.clone();
        async move {
            h.store
                .transactions_for(FROM_A)
                .await
                .iter()
                .all(|tx| tx.state == TxState::Unconfirmed)
        }
    })
    .await;
    h.manager.stop().await.unwrap();
    assert!(all_sent);

    let nonces: BTreeSet<u64> = h
        .store
        .transactions_for(FROM_A)
        .await
        .into_iter()
        .filter_map(|tx| tx.nonce)
        .collect();
    assert_eq!(nonces, (100..125).collect::<BTreeSet<_>>());
}

#[tokio::test]
async fn insufficient_funds_stalls_only_that_address() {
    let h = harness(test_config(), &[FROM_A, FROM_B]);
    h.chain
        .fail_submits_from(FROM_A, node_error(INSUFFICIENT_FUNDS));

    let broke = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    let queued_behind = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    let funded = h
        .manager
        .create_transaction(new_tx(FROM_B), &SendEveryStrategy)
        .await
        .unwrap();

    h.drain(FROM_A).await.unwrap();
    h.drain(FROM_B).await.unwrap();

    let stalled = h.tx(&broke.id).await;
    assert_eq!(stalled.state, TxState::InProgress);
    let attempts = h.attempts(&broke.id).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, AttemptState::InsufficientFunds);
    assert_eq!(h.tx(&queued_behind.id).await.state, TxState::Unstarted);

    assert_eq!(h.tx(&funded.id).await.state, TxState::Unconfirmed);
    let more = h
        .manager
        .create_transaction(new_tx(FROM_B), &SendEveryStrategy)
        .await
        .unwrap();
    h.drain(FROM_B).await.unwrap();
    assert_eq!(h.tx(&more.id).await.state, TxState::Unconfirmed);

    // once funded, the stalled attempt goes out with the same bytes
    h.chain.clear_failures_from(FROM_A);
    h.drain(FROM_A).await.unwrap();

    assert_eq!(h.tx(&broke.id).await.state, TxState::Unconfirmed);
    assert_eq!(h.tx(&queued_behind.id).await.state, TxState::Unconfirmed);
    assert_eq!(h.attempts(&broke.id).await.len(), 1);
    let sent = h.chain.submitted_from(FROM_A);
    assert_eq!(sent.first(), Some(&attempts[0].signed_raw_transaction));
    assert!(sent.iter().filter(|raw| **raw == attempts[0].signed_raw_transaction).count() >= 2);
}

#[tokio::test]
async fn transient_failures_leave_attempt_for_the_next_pass() {
    let h = harness(test_config(), &[FROM_A]);
    // more failures than send_retry_attempts
    for _ in 0..2 {
        h.chain.fail_next_submit(transport_error());
    }

    let tx = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    h.drain(FROM_A).await.unwrap();

    assert_eq!(h.tx(&tx.id).await.state, TxState::InProgress);
    let attempts = h.attempts(&tx.id).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, AttemptState::InProgress);
    assert_eq!(h.chain.submitted().len(), 2);

    h.drain(FROM_A).await.unwrap();
    assert_eq!(h.tx(&tx.id).await.state, TxState::Unconfirmed);
    assert_eq!(h.attempts(&tx.id).await.len(), 1);
    assert!(
        h.chain
            .submitted()
            .iter()
            .all(|raw| *raw == attempts[0].signed_raw_transaction)
    );
}

#[tokio::test]
async fn transient_failure_is_retried_within_one_pass() {
    let h = harness(test_config(), &[FROM_A]);
    h.chain.fail_next_submit(transport_error());

    let tx = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    h.drain(FROM_A).await.unwrap();

    assert_eq!(h.tx(&tx.id).await.state, TxState::Unconfirmed);
    assert_eq!(h.chain.submitted().len(), 2);
}

#[tokio::test]
async fn already_known_counts_as_broadcast() {
    let h = harness(test_config(), &[FROM_A]);
    h.chain
        .fail_next_submit(node_error("already known"));

    let tx = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    h.drain(FROM_A).await.unwrap();

    let stored = h.tx(&tx.id).await;
    assert_eq!(stored.state, TxState::Unconfirmed);
    assert!(stored.broadcast_at.is_some());
    assert_eq!(stored.initial_broadcast_at, stored.broadcast_at);
    assert_eq!(h.attempts(&tx.id).await[0].state, AttemptState::Broadcast);
}

#[tokio::test]
async fn fatal_first_attempt_gives_the_nonce_back() {
    let h = harness(test_config(), &[FROM_A]);
    h.chain.set_pending_nonce(FROM_A, 3);
    h.chain.fail_next_submit(node_error(INVALID_SENDER));

    let rejected = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    let next = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    h.drain(FROM_A).await.unwrap();

    let rejected = h.tx(&rejected.id).await;
    assert_eq!(rejected.state, TxState::FatalError);
    assert_eq!(rejected.nonce, None);
    assert!(rejected.terminal_at.is_some());
    assert!(rejected.error.unwrap().contains(INVALID_SENDER));

    // no gap: the next transaction reuses nonce 3
    assert_eq!(h.tx(&next.id).await.nonce, Some(3));
    assert_eq!(h.tx(&next.id).await.state, TxState::Unconfirmed);
}

#[tokio::test]
async fn nonce_too_low_on_first_send_resyncs_from_chain() {
    let h = harness(test_config(), &[FROM_A]);
    h.chain.set_pending_nonce(FROM_A, 0);
    h.chain.fail_next_submit(node_error(NONCE_TOO_LOW));

    let stale = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    h.drain(FROM_A).await.unwrap();

    let stale = h.tx(&stale.id).await;
    assert_eq!(stale.state, TxState::FatalError);
    assert_eq!(h.store.last_nonce(FROM_A).await.unwrap(), None);

    // keys were used elsewhere; the next send picks up the chain's view
    h.chain.set_pending_nonce(FROM_A, 5);
    let next = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();
    h.drain(FROM_A).await.unwrap();
    assert_eq!(h.tx(&next.id).await.nonce, Some(5));
}

fn sign_for(h: &Harness, tx: &txm_executors::txm::Transaction, gas_price: u128) -> Attempt {
    let signed = h.signer.sign_sync(
        tx.from,
        &UnsignedTransaction {
            chain_id: CHAIN_ID,
            nonce: tx.nonce.unwrap(),
            to: tx.to,
            value: tx.value,
            input: tx.data.clone(),
            gas_limit: tx.gas_limit,
            gas_price,
        },
    );
    Attempt {
        id: format!("{}-crashed", tx.id),
        transaction_id: tx.id.clone(),
        gas_price,
        hash: signed.hash,
        signed_raw_transaction: signed.raw,
        state: AttemptState::InProgress,
        created_at: now_ms(),
    }
}

#[tokio::test]
async fn restart_resends_persisted_attempt_without_resigning() {
    let h = harness(test_config(), &[FROM_A]);
    let tx = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();

    // a worker signed and persisted the attempt, then died before submitting
    h.store.acquire_address_lock(FROM_A, "crashed").await.unwrap();
    let started = h
        .store
        .start_transaction(&tx.id, FROM_A, "crashed", Some(0))
        .await
        .unwrap();
    let attempt = sign_for(&h, &started, GAS_PRICE * 2);
    h.store.insert_attempt(attempt.clone()).await.unwrap();

    h.drain(FROM_A).await.unwrap();

    let attempts = h.attempts(&tx.id).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].id, attempt.id);
    assert_eq!(attempts[0].state, AttemptState::Broadcast);
    assert_eq!(h.chain.submitted(), vec![attempt.signed_raw_transaction]);
    assert_eq!(h.tx(&tx.id).await.state, TxState::Unconfirmed);
}

#[tokio::test]
async fn restart_without_attempt_signs_at_the_assigned_nonce() {
    let h = harness(test_config(), &[FROM_A]);
    let tx = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();

    h.store.acquire_address_lock(FROM_A, "crashed").await.unwrap();
    h.store
        .start_transaction(&tx.id, FROM_A, "crashed", Some(9))
        .await
        .unwrap();

    h.drain(FROM_A).await.unwrap();

    let stored = h.tx(&tx.id).await;
    assert_eq!(stored.state, TxState::Unconfirmed);
    assert_eq!(stored.nonce, Some(9));
    let submitted = h.chain.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(decode_raw(&submitted[0]).1, 9);
}

#[tokio::test]
async fn resumed_attempt_rejected_as_nonce_too_low_goes_to_confirmer() {
    let h = harness(test_config(), &[FROM_A]);
    let tx = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();

    h.store.acquire_address_lock(FROM_A, "crashed").await.unwrap();
    let started = h
        .store
        .start_transaction(&tx.id, FROM_A, "crashed", Some(0))
        .await
        .unwrap();
    h.store
        .insert_attempt(sign_for(&h, &started, GAS_PRICE))
        .await
        .unwrap();

    // the earlier send may well have been mined already
    h.chain.fail_next_submit(node_error(NONCE_TOO_LOW));
    h.drain(FROM_A).await.unwrap();

    let stored = h.tx(&tx.id).await;
    assert_eq!(stored.state, TxState::Unconfirmed);
    assert_eq!(stored.nonce, Some(0));
}

#[tokio::test]
async fn worker_that_lost_its_lock_stops_sending() {
    let h = harness(test_config(), &[FROM_A]);
    let tx = h
        .manager
        .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
        .await
        .unwrap();

    let stale = h.manager.broadcaster(FROM_A);
    h.store
        .acquire_address_lock(FROM_A, stale.worker_id())
        .await
        .unwrap();
    h.store
        .acquire_address_lock(FROM_A, "new-owner")
        .await
        .unwrap();

    let (_shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let err = stale.process_queue(&mut shutdown_rx).await.unwrap_err();

    assert!(err.is_lock_lost(), "{err:?}");
    assert_eq!(h.tx(&tx.id).await.state, TxState::Unstarted);
    assert!(h.chain.submitted().is_empty());
}

#[tokio::test]
async fn shutdown_is_observed_between_transactions() {
    let h = harness(test_config(), &[FROM_A]);
    for _ in 0..3 {
        h.manager
            .create_transaction(new_tx(FROM_A), &SendEveryStrategy)
            .await
            .unwrap();
    }

    let broadcaster = h.manager.broadcaster(FROM_A);
    h.store
        .acquire_address_lock(FROM_A, broadcaster.worker_id())
        .await
        .unwrap();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    shutdown_tx.send(()).unwrap();

    let stopped = broadcaster.process_queue(&mut shutdown_rx).await.unwrap();
    assert!(stopped);
    assert!(h.chain.submitted().is_empty());
    assert!(
        h.store
            .transactions_for(FROM_A)
            .await
            .iter()
            .all(|tx| tx.state == TxState::Unstarted)
    );
}
