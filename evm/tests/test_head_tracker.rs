mod common;

use std::{sync::Arc, time::Duration};

use alloy_primitives::Address;
use assert_matches::assert_matches;
use evm_sync::{
    ingestion::{
        BlockFetchService, EventEmitter, HeadTracker, HeadTrackerOptions, IngestionErrorExt,
        SyncEvent, TickOutcome, TrackerState,
    },
    provider::{DispatchErrorExt, RpcFailure},
    source::SharedSource,
    store::{CacheStore, InMemoryCacheStore},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{block_hash, log_filter_source, MockChain, CHAIN_ID};

struct TestTracker {
    tracker: HeadTracker,
    store: Arc<InMemoryCacheStore>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    source: SharedSource,
    ct: CancellationToken,
}

fn address(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn new_tracker(chain: &MockChain, finalized: u64, options: HeadTrackerOptions) -> TestTracker {
    let ct = CancellationToken::new();
    let dispatcher = chain.start_dispatcher(ct.clone());
    let store = Arc::new(InMemoryCacheStore::new());

    let (coordinator, coordinator_fut) =
        BlockFetchService::new("mainnet", CHAIN_ID, dispatcher.clone(), store.clone())
            .start(ct.clone());
    tokio::spawn(coordinator_fut);

    let (events, events_rx) = EventEmitter::new();
    let source = log_filter_source("token", address(1), 0, None, None);

    let tracker = HeadTracker::new(
        "mainnet",
        CHAIN_ID,
        dispatcher,
        store.clone(),
        coordinator,
        events,
        vec![source.clone()],
        chain.canonical_block(finalized).light(),
        options,
    );

    TestTracker {
        tracker,
        store,
        events: events_rx,
        source,
        ct,
    }
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn options(reorg_depth: usize, finality_block_count: u64) -> HeadTrackerOptions {
    HeadTrackerOptions::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_reorg_depth(reorg_depth)
        .with_finality_block_count(finality_block_count)
}

#[tokio::test]
async fn test_advance_and_finalize() {
    let chain = MockChain::new(100);
    let mut test = new_tracker(&chain, 100, options(10, 2));

    assert_eq!(test.tracker.tick().await.unwrap(), TickOutcome::Unchanged);

    chain.mine(0);
    chain.mine(0);
    chain.mine(0);
    chain.add_log(102, address(1), vec![], 0);
    chain.add_log(103, address(2), vec![], 0);

    let outcome = test.tracker.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Advanced {
            from_block: 101,
            to_block: 103,
            logs: 1,
        }
    );
    assert_eq!(test.tracker.head().hash, block_hash(103, 0));
    assert_eq!(test.tracker.state(), TrackerState::Polling);

    let logs = test.store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].block_number, 102);
    assert!(test.store.block(CHAIN_ID, block_hash(102, 0)).is_some());

    // Blocks older than two blocks from the head are final.
    assert_eq!(test.tracker.finalized().number, 101);
    let key = &test.source.interval_keys()[0];
    let intervals = test.store.get_cached_intervals(key).await.unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!((intervals[0].start_block, intervals[0].end_block), (101, 101));

    let events = drain_events(&mut test.events);
    assert!(events.contains(&SyncEvent::NewEventsAdded {
        network: "mainnet".to_string(),
        count: 1,
    }));
    assert!(events.contains(&SyncEvent::Finalized {
        network: "mainnet".to_string(),
        block_number: 101,
    }));

    assert_eq!(test.tracker.tick().await.unwrap(), TickOutcome::Unchanged);

    test.ct.cancel();
}

#[tokio::test]
async fn test_reorg_replaces_orphaned_blocks() {
    let chain = MockChain::new(100);
    let mut test = new_tracker(&chain, 100, options(10, 5));
    let a = chain.canonical_block(100);

    // A -> B -> C
    chain.mine(0);
    chain.mine(0);
    chain.add_log(101, address(1), vec![], 0);
    chain.add_log(102, address(1), vec![], 0);

    assert_matches!(
        test.tracker.tick().await.unwrap(),
        TickOutcome::Advanced { logs: 2, .. }
    );
    assert_eq!(test.store.logs().len(), 2);
    drain_events(&mut test.events);

    // A -> B' -> C'
    chain.reorg(101, 2, 1);
    chain.add_log(101, address(1), vec![], 0);

    let outcome = test.tracker.tick().await.unwrap();
    assert_matches!(outcome, TickOutcome::Reorganized { common_ancestor, depth: 2, to_block: 102, logs: 1 } => {
        assert_eq!(common_ancestor.hash, a.hash);
    });

    assert_eq!(test.tracker.head().hash, block_hash(102, 1));
    let blocks = test
        .tracker
        .window()
        .blocks()
        .map(|block| block.hash)
        .collect::<Vec<_>>();
    assert_eq!(blocks, vec![a.hash, block_hash(101, 1), block_hash(102, 1)]);

    // Only the new canonical data is left.
    let logs = test.store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].block_hash, block_hash(101, 1));
    assert!(test.store.block(CHAIN_ID, block_hash(101, 0)).is_none());
    assert!(test.store.block(CHAIN_ID, block_hash(101, 1)).is_some());

    let events = drain_events(&mut test.events);
    assert_eq!(
        events,
        vec![
            SyncEvent::Reorg {
                network: "mainnet".to_string(),
                common_ancestor_number: 100,
                common_ancestor_hash: a.hash,
                depth: 2,
            },
            SyncEvent::NewEventsAdded {
                network: "mainnet".to_string(),
                count: 1,
            },
        ]
    );

    test.ct.cancel();
}

#[tokio::test]
async fn test_reorg_deeper_than_window_is_fatal() {
    let chain = MockChain::new(100);
    let mut test = new_tracker(&chain, 100, options(3, 1));

    chain.mine(0);
    chain.mine(0);
    chain.mine(0);
    test.tracker.tick().await.unwrap();
    assert_eq!(test.tracker.window().oldest().number, 101);

    chain.reorg(100, 5, 1);

    let err = test.tracker.tick().await.unwrap_err();
    assert!(err.is_reorg_too_deep());

    // The run loop stops and reports the condition.
    let result = test.tracker.run(test.ct.clone()).await;
    assert!(result.is_err());

    let events = drain_events(&mut test.events);
    assert_matches!(events.last(), Some(SyncEvent::RealtimeFatal { network, .. }) if network == "mainnet");

    test.ct.cancel();
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let chain = MockChain::new(100);
    let test = new_tracker(&chain, 100, options(10, 2));

    let ct = CancellationToken::new();
    let handle = tokio::spawn(test.tracker.run(ct.clone()));

    chain.mine(0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    ct.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(chain.count("eth_getBlockByNumber") > 1);

    test.ct.cancel();
}

fn not_found() -> RpcFailure {
    RpcFailure::Http {
        status: 404,
        body: "not found".to_string(),
    }
}

#[tokio::test]
async fn test_failed_ingest_leaves_no_logs() {
    let chain = MockChain::new(100);
    let mut test = new_tracker(&chain, 100, options(10, 2));

    chain.mine(0);
    chain.add_log(101, address(1), vec![], 0);
    chain.fail_next("eth_getBlockByHash", not_found(), 1);

    assert!(test.tracker.tick().await.is_err());
    assert_eq!(test.tracker.head().number, 100);
    assert!(test.store.logs().is_empty());

    // The node switches fork before the next tick.
    chain.reorg(101, 1, 1);
    chain.add_log(101, address(1), vec![], 0);

    assert_matches!(
        test.tracker.tick().await.unwrap(),
        TickOutcome::Advanced { logs: 1, .. }
    );

    let logs = test.store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].block_hash, block_hash(101, 1));

    test.ct.cancel();
}

#[tokio::test]
async fn test_terminal_block_fetch_failure_is_fatal() {
    let chain = MockChain::new(100);
    let test = new_tracker(&chain, 100, options(10, 2));

    chain.mine(0);
    chain.add_log(101, address(1), vec![], 0);
    chain.fail_next("eth_getBlockByHash", not_found(), 1);

    let mut events = test.events;
    let result = tokio::time::timeout(Duration::from_secs(1), test.tracker.run(test.ct.clone()))
        .await
        .unwrap();

    let err = result.unwrap_err();
    assert!(err.is_terminal());
    assert!(test.store.logs().is_empty());

    let events = drain_events(&mut events);
    assert_matches!(events.last(), Some(SyncEvent::RealtimeFatal { network, .. }) if network == "mainnet");

    test.ct.cancel();
}

#[tokio::test]
async fn test_reorg_below_finalized_block() {
    let chain = MockChain::new(100);
    let mut test = new_tracker(&chain, 100, options(10, 1));

    chain.mine(0);
    chain.mine(0);
    chain.mine(0);
    test.tracker.tick().await.unwrap();
    assert_eq!(test.tracker.finalized().hash, block_hash(102, 0));

    // 102 was final, but the node says otherwise.
    chain.reorg(102, 2, 1);

    assert_matches!(
        test.tracker.tick().await.unwrap(),
        TickOutcome::Reorganized { depth: 2, .. }
    );
    assert_eq!(test.tracker.finalized().hash, block_hash(102, 1));

    let key = &test.source.interval_keys()[0];
    let intervals = test.store.get_cached_intervals(key).await.unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!((intervals[0].start_block, intervals[0].end_block), (101, 102));

    test.ct.cancel();
}
