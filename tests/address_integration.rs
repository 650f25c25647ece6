//! Address allocation integration tests.

mod common;

use common::*;
use quorum_engine::AddressManager;
use quorum_storage::SqliteStore;
use quorum_types::{AddressConfig, Chain, EngineConfig, ErrorKind};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn test_twenty_first_unused_address_refused() {
    let ctx = TestContext::new();
    let tw = ctx.setup_wallet(Chain::Btc, 2, 3).await;
    let copayer = tw.copayer(1).id();

    for _ in 0..20 {
        ctx.service
            .derive_address(&tw.wallet.id, &copayer, false)
            .await
            .unwrap();
    }
    let err = ctx
        .service
        .derive_address(&tw.wallet.id, &copayer, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MainAddressGapReached);

    // The relaxed limit allows ten more.
    for _ in 0..10 {
        ctx.service
            .derive_address(&tw.wallet.id, &copayer, true)
            .await
            .unwrap();
    }
    let err = ctx
        .service
        .derive_address(&tw.wallet.id, &copayer, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MainAddressGapReached);
}

#[tokio::test]
async fn test_change_branch_has_its_own_gap() {
    let ctx = TestContext::new();
    let tw = ctx.setup_wallet(Chain::Btc, 2, 3).await;
    let manager = AddressManager::new(
        ctx.store.clone(),
        ctx.chains.clone(),
        ctx.chain.clone(),
        AddressConfig::default(),
    );

    let mut change = Vec::new();
    for _ in 0..20 {
        change.push(manager.derive_next(&tw.wallet, true, false).await.unwrap());
    }
    let err = manager
        .derive_next(&tw.wallet, true, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MainAddressGapReached);

    // Receive addresses are still available.
    let receive = ctx.new_address(&tw).await;
    assert_eq!(receive.path.index, 0);
    assert!(!receive.path.is_change);

    // Funding the last change address reopens the branch.
    ctx.chain
        .add_coin(&change[19].address, 20_000, Some(TIP))
        .await;
    let next = manager.derive_next(&tw.wallet, true, false).await.unwrap();
    assert_eq!(next.path.index, 20);
}

#[tokio::test]
async fn test_addresses_unique_and_deterministic() {
    let ctx = TestContext::new();
    let first = ctx.setup_wallet(Chain::Btc, 2, 3).await;
    let second = ctx.setup_wallet(Chain::Btc, 2, 3).await;

    let mut seen = HashSet::new();
    let mut previous = None;
    for _ in 0..10 {
        let a = ctx.new_address(&first).await;
        let b = ctx.new_address(&second).await;
        // Same public keys, same path, same address.
        assert_eq!(a.address, b.address);
        assert_eq!(a.path, b.path);
        assert!(seen.insert(a.address.clone()));
        if let Some(index) = previous {
            assert!(a.path.index > index);
        }
        previous = Some(a.path.index);
    }
}

#[tokio::test]
async fn test_allocation_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("wallets.db");

    let chain = Arc::new(MockChainState::new(TIP));
    let fees = Arc::new(MockFeeEstimator::new(FEE_PER_KB));

    let ctx = TestContext::with_parts(
        EngineConfig::default(),
        Arc::new(SqliteStore::open(&db).unwrap()),
        chain.clone(),
        fees.clone(),
    );
    let tw = ctx.setup_wallet(Chain::Btc, 2, 3).await;
    let issued = vec![ctx.new_address(&tw).await, ctx.new_address(&tw).await];
    drop(ctx);

    let restarted = TestContext::with_parts(
        EngineConfig::default(),
        Arc::new(SqliteStore::open(&db).unwrap()),
        chain,
        fees,
    );
    let listed = restarted
        .service
        .get_addresses(&tw.wallet.id, &tw.copayer(2).id())
        .await
        .unwrap();
    assert_eq!(listed, issued);

    let third = restarted.new_address(&tw).await;
    assert_eq!(third.path.index, 2);
}
