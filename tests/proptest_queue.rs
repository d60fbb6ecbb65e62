//! Property-based tests for retry queue ordering.
//!
//! # Properties Tested
//!
//! 1. **Deque Property**: any mix of push/unshift followed by shifting
//!    everything yields the same order as a `VecDeque` model
//! 2. **Pop Property**: popping returns the most recently pushed entry
//! 3. **Durability Property**: the order survives a store reopen

use offline_kit::background_sync::{QueueOptions, QueueRegistry, QueuedRequest};
use offline_kit::fetch::ScriptedFetcher;
use offline_kit::http::Method;
use offline_kit::store::EntryStore;
use offline_kit::Request;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;
use url::Url;

#[derive(Clone, Debug)]
enum Op {
    Push(u16),
    Unshift(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![any::<u16>().prop_map(Op::Push), any::<u16>().prop_map(Op::Unshift)]
}

fn request(id: u16) -> QueuedRequest {
    let url = Url::parse(&format!("https://api.example.com/items/{}", id)).unwrap();
    QueuedRequest::new(Request::new(Method::Post, url))
}

fn id_of(entry: &QueuedRequest) -> u16 {
    entry
        .request
        .url
        .path_segments()
        .and_then(|mut segments| segments.nth(1))
        .and_then(|id| id.parse().ok())
        .unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn registry(store: Arc<EntryStore>) -> QueueRegistry {
    QueueRegistry::new(store, Arc::new(ScriptedFetcher::new()))
}

proptest! {
    #[test]
    fn prop_queue_matches_deque_model(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let drained = runtime().block_on(async {
            let queue = registry(Arc::new(EntryStore::in_memory()))
                .create("outbox", QueueOptions::default())
                .unwrap();
            for op in &ops {
                match op {
                    Op::Push(id) => queue.push_request(request(*id)).await.unwrap(),
                    Op::Unshift(id) => queue.unshift_request(request(*id)).await.unwrap(),
                }
            }
            let mut drained = Vec::new();
            while let Some(entry) = queue.shift_request().await.unwrap() {
                drained.push(id_of(&entry));
            }
            drained
        });

        let mut model = VecDeque::new();
        for op in &ops {
            match op {
                Op::Push(id) => model.push_back(*id),
                Op::Unshift(id) => model.push_front(*id),
            }
        }
        prop_assert_eq!(drained, model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn prop_pop_returns_newest(ids in prop::collection::vec(any::<u16>(), 1..20)) {
        let popped = runtime().block_on(async {
            let queue = registry(Arc::new(EntryStore::in_memory()))
                .create("outbox", QueueOptions::default())
                .unwrap();
            for id in &ids {
                queue.push_request(request(*id)).await.unwrap();
            }
            let mut popped = Vec::new();
            while let Some(entry) = queue.pop_request().await.unwrap() {
                popped.push(id_of(&entry));
            }
            popped
        });

        let mut expected = ids.clone();
        expected.reverse();
        prop_assert_eq!(popped, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_order_survives_reopen(ops in prop::collection::vec(op_strategy(), 1..15)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.store");

        let (before, after) = runtime().block_on(async {
            let store = Arc::new(EntryStore::open(&path).await.unwrap());
            let queue = registry(store).create("outbox", QueueOptions::default()).unwrap();
            for op in &ops {
                match op {
                    Op::Push(id) => queue.push_request(request(*id)).await.unwrap(),
                    Op::Unshift(id) => queue.unshift_request(request(*id)).await.unwrap(),
                }
            }
            let before: Vec<u16> = queue.get_all().await.unwrap().iter().map(id_of).collect();

            let reopened = Arc::new(EntryStore::open(&path).await.unwrap());
            let queue = registry(reopened).create("outbox", QueueOptions::default()).unwrap();
            let after: Vec<u16> = queue.get_all().await.unwrap().iter().map(id_of).collect();
            (before, after)
        });

        prop_assert_eq!(before, after);
    }
}
