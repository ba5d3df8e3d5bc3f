mod fixtures;

use fixtures::*;
use txm_executors::txm::{TxState, TxmConfig, now_ms};

fn resend_after(ms: u64) -> TxmConfig {
    TxmConfig {
        resend_after_threshold_ms: ms,
        ..test_config()
    }
}

#[tokio::test]
async fn resends_only_the_highest_priced_attempt() {
    let h = harness(resend_after(30_000), &[FROM_A]);
    let (tx, attempts) = h.seed_unconfirmed(FROM_A, &[5, 10], ago(60_000)).await;
    let best = attempts.iter().find(|a| a.gas_price == 10).unwrap();

    let resent = h.manager.resender().resend_stale().await.unwrap();
    assert_eq!(resent, 1);

    assert_eq!(h.chain.submitted(), vec![best.signed_raw_transaction.clone()]);
    // resending never creates attempts
    assert_eq!(h.attempts(&tx.id).await.len(), 2);
}

#[tokio::test]
async fn recently_broadcast_transactions_are_left_alone() {
    let h = harness(resend_after(30_000), &[FROM_A]);
    h.seed_unconfirmed(FROM_A, &[GAS_PRICE], now_ms()).await;

    assert_eq!(h.manager.resender().resend_stale().await.unwrap(), 0);
    assert!(h.chain.submitted().is_empty());
}

#[tokio::test]
async fn failed_item_does_not_block_the_batch_and_still_counts_as_sent() {
    let h = harness(resend_after(30_000), &[FROM_A, FROM_B]);
    let before = ago(60_000);
    let (failing, failing_attempts) = h.seed_unconfirmed(FROM_A, &[GAS_PRICE], before).await;
    let (fine, fine_attempts) = h.seed_unconfirmed(FROM_B, &[GAS_PRICE], before).await;

    h.chain.fail_raw(
        failing_attempts[0].signed_raw_transaction.clone(),
        transport_error(),
    );

    let started = now_ms();
    let resent = h.manager.resender().resend_stale().await.unwrap();
    assert_eq!(resent, 2);

    let submitted = h.chain.submitted();
    assert!(submitted.contains(&failing_attempts[0].signed_raw_transaction));
    assert!(submitted.contains(&fine_attempts[0].signed_raw_transaction));

    for id in [&failing.id, &fine.id] {
        let tx = h.tx(id).await;
        assert_eq!(tx.state, TxState::Unconfirmed);
        assert!(tx.broadcast_at.unwrap() >= started, "{id}");
        // first-broadcast time is untouched
        assert_eq!(tx.initial_broadcast_at, Some(before));
    }

    // touched transactions wait a full threshold before the next resend
    assert_eq!(h.manager.resender().resend_stale().await.unwrap(), 0);
}

#[tokio::test]
async fn stale_transactions_are_sent_in_batches() {
    let h = harness(
        TxmConfig {
            rpc_batch_size: 2,
            ..resend_after(30_000)
        },
        &[FROM_A, FROM_B],
    );
    for (i, from) in [FROM_A, FROM_B, FROM_A, FROM_B, FROM_A].into_iter().enumerate() {
        h.seed_unconfirmed(from, &[GAS_PRICE + i as u128], ago(60_000))
            .await;
    }

    let resent = h.manager.resender().resend_stale().await.unwrap();
    assert_eq!(resent, 5);

    let sizes: Vec<usize> = h.chain.batches().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn zero_threshold_sweep_terminates() {
    let h = harness(resend_after(0), &[FROM_A]);
    h.seed_unconfirmed(FROM_A, &[GAS_PRICE], ago(1)).await;

    assert_eq!(h.manager.resender().resend_stale().await.unwrap(), 1);
}

#[tokio::test]
async fn missing_receipt_and_terminal_transactions_are_not_resent() {
    let h = harness(resend_after(30_000), &[FROM_A]);
    let (flagged, _) = h.seed_unconfirmed(FROM_A, &[GAS_PRICE], ago(60_000)).await;

    let mut cmr = flagged.clone();
    cmr.state = TxState::ConfirmedMissingReceipt;
    h.store.update_transaction(cmr).await;

    assert_eq!(h.manager.resender().resend_stale().await.unwrap(), 0);
    assert!(h.chain.submitted().is_empty());
}
