//! Store-independent lease properties, run against every backend.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use claimq::model::{
    Answers, ItemId, ItemState, NewWorkItem, Owner, Payload, SubmissionFilter,
};
use claimq::{LeaseManager, LeasePolicy, Store};
use serde_json::json;

pub const SHORT_TTL: Duration = Duration::from_millis(300);
pub const PAST_SHORT_TTL: Duration = Duration::from_millis(700);
pub const LONG_TTL: Duration = Duration::from_secs(600);

pub fn owner(token: &str) -> Owner {
    Owner::new(token).unwrap()
}

pub fn payload(questions: usize) -> Payload {
    let questions: Vec<_> = (1..=questions)
        .map(|n| {
            json!({
                "qid": format!("q{n}"),
                "prompt": format!("question {n}"),
                "options": [
                    {"key": "A", "text": "first"},
                    {"key": "B", "text": "second"},
                    {"key": "C", "text": "third"}
                ]
            })
        })
        .collect();
    serde_json::from_value(json!({"meta": {"bank": "bank_01"}, "questions": questions})).unwrap()
}

pub fn answers(questions: usize) -> Answers {
    (1..=questions).map(|n| (format!("q{n}"), "A".to_string())).collect()
}

/// Put `count` fresh items into `store` and return their ids.
pub async fn seed(store: &dyn Store, count: usize) -> Vec<ItemId> {
    let items: Vec<NewWorkItem> = (0..count)
        .map(|n| {
            let id = ItemId::new(format!("bank_01/questionnaire_{n:03}.jsonl")).unwrap();
            NewWorkItem::new(id, payload(3))
        })
        .collect();
    assert_eq!(store.insert_items(&items).await.unwrap(), count as u64);
    items.into_iter().map(|i| i.id).collect()
}

pub fn manager(store: Arc<dyn Store>, ttl: Duration) -> LeaseManager {
    LeaseManager::new(
        store,
        LeasePolicy {
            ttl,
            ..LeasePolicy::default()
        },
    )
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// N claimants racing for a smaller pool: no item claimed twice, and exactly
/// `min(N, pool)` of them succeed.
pub async fn mutual_exclusion(store: Arc<dyn Store>) {
    let pool = seed(&*store, 5).await;
    let leases = manager(store, LONG_TTL);

    let mut tasks = Vec::new();
    for n in 0..12 {
        let leases = leases.clone();
        tasks.push(tokio::spawn(async move {
            leases.claim(&owner(&format!("claimant-{n}"))).await.unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for task in tasks {
        if let Some(item) = task.await.unwrap() {
            claimed.push(item.id);
        }
    }

    let distinct: HashSet<_> = claimed.iter().cloned().collect();
    assert_eq!(claimed.len(), pool.len());
    assert_eq!(distinct.len(), claimed.len());
    assert_eq!(distinct, pool.into_iter().collect::<HashSet<_>>());
}

/// An unrenewed lease blocks everyone until it expires, then anyone may
/// claim the item. The original owner's renewal then fails.
pub async fn ttl_reclamation(store: Arc<dyn Store>) {
    let ids = seed(&*store, 1).await;
    let leases = manager(store, SHORT_TTL);
    let (alice, bob) = (owner("alice"), owner("bob"));

    let first = leases.claim(&alice).await.unwrap().unwrap();
    assert_eq!(first.id, ids[0]);
    assert!(leases.claim(&bob).await.unwrap().is_none());

    tokio::time::sleep(PAST_SHORT_TTL).await;
    let stale = first.lease.as_ref().unwrap();
    assert!(stale.is_expired_at(chrono::Utc::now()));

    let second = leases.claim(&bob).await.unwrap().unwrap();
    assert_eq!(second.id, ids[0]);
    assert!(second.is_held_by(&bob));
    assert!(!leases.renew(&ids[0], &alice, LONG_TTL).await.unwrap());
}

/// Completing twice as the same owner succeeds both times and records one
/// submission. Another owner cannot complete a done item.
pub async fn idempotent_completion(store: Arc<dyn Store>) {
    let ids = seed(&*store, 1).await;
    let leases = manager(store, LONG_TTL);
    let alice = owner("alice");

    let item = leases.claim(&alice).await.unwrap().unwrap();
    assert!(leases.complete(&item.id, &alice, &answers(3)).await.unwrap());
    assert!(leases.complete(&item.id, &alice, &answers(3)).await.unwrap());
    assert!(!leases.complete(&item.id, &owner("mallory"), &answers(3)).await.unwrap());

    let done = leases.item(&ids[0]).await.unwrap().unwrap();
    assert_eq!(done.state, ItemState::Done);
    assert_eq!(done.completed_by, Some(alice));
    let recorded = leases
        .submissions(&SubmissionFilter::all().item(ids[0].clone()))
        .await
        .unwrap();
    assert_eq!(recorded.len(), 1);
}

/// A's lease expires and B takes the item over: A's late completion is
/// refused, B's is accepted.
pub async fn rejected_stale_completion(store: Arc<dyn Store>) {
    let ids = seed(&*store, 1).await;
    let leases = manager(store, SHORT_TTL);
    let (alice, bob) = (owner("alice"), owner("bob"));

    leases.claim(&alice).await.unwrap().unwrap();
    tokio::time::sleep(PAST_SHORT_TTL).await;
    leases.claim(&bob).await.unwrap().unwrap();

    assert!(!leases.complete(&ids[0], &alice, &answers(3)).await.unwrap());
    assert!(leases.complete(&ids[0], &bob, &answers(3)).await.unwrap());

    let recorded = leases.submissions(&SubmissionFilter::all()).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].owner, bob);
}

/// Abandon makes the item claimable at once, with no TTL wait.
pub async fn abandon_frees_immediately(store: Arc<dyn Store>) {
    let ids = seed(&*store, 1).await;
    let leases = manager(store, LONG_TTL);
    let (alice, bob) = (owner("alice"), owner("bob"));

    leases.claim(&alice).await.unwrap().unwrap();
    assert!(!leases.abandon(&ids[0], &bob).await.unwrap());
    assert!(leases.abandon(&ids[0], &alice).await.unwrap());
    assert!(!leases.abandon(&ids[0], &alice).await.unwrap());

    let again = leases.claim(&bob).await.unwrap().unwrap();
    assert_eq!(again.id, ids[0]);
}

/// claim, renew a few times, complete: done, one submission by the
/// claimant, never claimable again.
pub async fn round_trip(store: Arc<dyn Store>) {
    let ids = seed(&*store, 1).await;
    let leases = manager(store, LONG_TTL);
    let (alice, bob) = (owner("alice"), owner("bob"));

    let item = leases.claim(&alice).await.unwrap().unwrap();
    assert_eq!(item.state, ItemState::Claimed);
    assert_eq!(item.payload.question_count(), 3);
    for _ in 0..3 {
        assert!(leases.renew(&item.id, &alice, LONG_TTL).await.unwrap());
    }
    assert!(!leases.renew(&item.id, &bob, LONG_TTL).await.unwrap());
    assert!(leases.complete(&item.id, &alice, &answers(3)).await.unwrap());

    let done = leases.item(&ids[0]).await.unwrap().unwrap();
    assert_eq!(done.state, ItemState::Done);
    assert!(done.lease.is_none());

    let recorded = leases.submissions(&SubmissionFilter::all()).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].owner, alice);
    assert_eq!(recorded[0].item_id, ids[0]);
    assert_eq!(recorded[0].answers, answers(3));

    assert!(leases.claim(&bob).await.unwrap().is_none());
    assert!(!leases.renew(&ids[0], &alice, LONG_TTL).await.unwrap());
    assert!(!leases.abandon(&ids[0], &alice).await.unwrap());
}

/// An expired lease nobody has reclaimed yet still belongs to its owner.
pub async fn late_renewal_before_sweep(store: Arc<dyn Store>) {
    let ids = seed(&*store, 1).await;
    let leases = manager(store, SHORT_TTL);
    let alice = owner("alice");

    leases.claim(&alice).await.unwrap().unwrap();
    tokio::time::sleep(PAST_SHORT_TTL).await;
    assert!(leases.renew(&ids[0], &alice, LONG_TTL).await.unwrap());

    // Renewed past the sweep: nothing to reclaim, nobody else gets it.
    assert_eq!(leases.reap_expired().await.unwrap(), 0);
    assert!(leases.claim(&owner("bob")).await.unwrap().is_none());
}

/// Re-importing leaves existing items and their leases untouched.
pub async fn reimport_is_harmless(store: Arc<dyn Store>) {
    let ids = seed(&*store, 3).await;
    let leases = manager(store.clone(), LONG_TTL);
    let alice = owner("alice");

    let held = leases.claim(&alice).await.unwrap().unwrap();
    let again: Vec<NewWorkItem> = ids
        .iter()
        .map(|id| NewWorkItem::new(id.clone(), payload(1)))
        .collect();
    assert_eq!(store.insert_items(&again).await.unwrap(), 0);

    let after = leases.item(&held.id).await.unwrap().unwrap();
    assert!(after.is_held_by(&alice));
    assert_eq!(after.payload.question_count(), 3);

    let stats = leases.stats().await.unwrap();
    assert_eq!((stats.unclaimed, stats.claimed, stats.done), (2, 1, 0));
}

/// Completing without holding the lease is refused: on an item nobody ever
/// claimed, and on one its owner already abandoned.
pub async fn complete_without_lease(store: Arc<dyn Store>) {
    let ids = seed(&*store, 2).await;
    let leases = manager(store, LONG_TTL);
    let alice = owner("alice");

    assert!(!leases.complete(&ids[0], &alice, &answers(3)).await.unwrap());
    let untouched = leases.item(&ids[0]).await.unwrap().unwrap();
    assert_eq!(untouched.state, ItemState::Unclaimed);

    let item = leases.claim(&alice).await.unwrap().unwrap();
    assert!(leases.abandon(&item.id, &alice).await.unwrap());
    assert!(!leases.complete(&item.id, &alice, &answers(3)).await.unwrap());

    let stats = leases.stats().await.unwrap();
    assert_eq!((stats.unclaimed, stats.claimed, stats.done), (2, 0, 0));
    assert!(leases.submissions(&SubmissionFilter::all()).await.unwrap().is_empty());
}

/// A sweep over a pool with no leases reclaims nothing and changes nothing.
pub async fn idle_sweep(store: Arc<dyn Store>) {
    seed(&*store, 3).await;
    let leases = manager(store, LONG_TTL);
    let before = leases.items().await.unwrap();

    assert_eq!(leases.reap_expired().await.unwrap(), 0);
    assert_eq!(leases.reap_expired().await.unwrap(), 0);

    let after = leases.items().await.unwrap();
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(&after) {
        assert_eq!(b.id, a.id);
        assert_eq!(a.state, ItemState::Unclaimed);
        assert!(a.lease.is_none());
    }
}

/// Unknown ids are contention outcomes, not errors.
pub async fn unknown_item(store: Arc<dyn Store>) {
    seed(&*store, 1).await;
    let leases = manager(store, LONG_TTL);
    let id = ItemId::new("bank_09/missing.jsonl").unwrap();
    let alice = owner("alice");

    assert!(leases.item(&id).await.unwrap().is_none());
    assert!(!leases.renew(&id, &alice, LONG_TTL).await.unwrap());
    assert!(!leases.abandon(&id, &alice).await.unwrap());
    assert!(!leases.complete(&id, &alice, &answers(1)).await.unwrap());
}
