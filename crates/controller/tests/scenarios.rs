#![forbid(unsafe_code)]

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{eventually, fast_config, key, next_matching, pod, FakeLw, Pod};
use reflex_controller::{
    Controller, ControllerConfig, ControllerEvent, ControllerState, Error, ListOptions, ObjectKey, ReconcileFn,
};
use reflex_core::WatchEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Calls = Arc<Mutex<Vec<(String, Option<u64>)>>>;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_key_is_retried_with_growing_delays_then_forgotten() {
    let lw = FakeLw::with_list(vec![pod("a", 1)], 1);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let reconciler = ReconcileFn(move |_key: ObjectKey, _obj: Option<Arc<Pod>>| {
        let n = c.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 3 {
                anyhow::bail!("transient failure {n}");
            }
            anyhow::Ok(())
        }
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut ctl = Controller::new(lw, ListOptions::default(), reconciler, fast_config()).with_sink(tx);
    ctl.start().await.unwrap();

    let mut delays = Vec::new();
    for expected in 1..=3 {
        match next_matching(&mut rx, |e| matches!(e, ControllerEvent::Retrying { .. })).await {
            ControllerEvent::Retrying { key: k, attempt, delay, error } => {
                assert_eq!(k, key("a"));
                assert_eq!(attempt, expected);
                assert!(!error.is_panic());
                delays.push(delay);
            }
            other => unreachable!("{other:?}"),
        }
    }
    assert_eq!(delays, vec![Duration::from_millis(10), Duration::from_millis(20), Duration::from_millis(40)]);

    let synced = next_matching(&mut rx, |e| matches!(e, ControllerEvent::Synced { .. })).await;
    assert!(matches!(synced, ControllerEvent::Synced { key: k, .. } if k == key("a")));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(ctl.queue().num_requeues(&key("a")), 0);

    ctl.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_give_up_exactly_once() {
    let lw = FakeLw::with_list(vec![pod("a", 1)], 1);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let reconciler = ReconcileFn(move |_key: ObjectKey, _obj: Option<Arc<Pod>>| {
        c.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(anyhow::anyhow!("permanent")) }
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = ControllerConfig { max_retries: 2, ..fast_config() };
    let mut ctl = Controller::new(lw, ListOptions::default(), reconciler, config).with_sink(tx);
    ctl.start().await.unwrap();

    match next_matching(&mut rx, |e| matches!(e, ControllerEvent::GaveUp { .. })).await {
        ControllerEvent::GaveUp { key: k, attempts, error } => {
            assert_eq!(k, key("a"));
            assert_eq!(attempts, 3);
            assert!(error.to_string().contains("permanent"));
        }
        other => unreachable!("{other:?}"),
    }
    // Nothing is scheduled after giving up
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(ctl.queue().num_requeues(&key("a")), 0);
    assert!(ctl.queue().is_empty());

    ctl.stop().await.unwrap();
    let mut gave_up = 0;
    while let Ok(ev) = rx.try_recv() {
        if matches!(ev, ControllerEvent::GaveUp { .. }) {
            gave_up += 1;
        }
    }
    assert_eq!(gave_up, 0, "only one give-up expected");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_sync_is_contained_and_worker_keeps_going() {
    let lw = FakeLw::with_list(vec![pod("bad", 1), pod("good", 1)], 1);
    let reconciler = ReconcileFn(move |key: ObjectKey, _obj: Option<Arc<Pod>>| async move {
        if key.name == "bad" {
            panic!("reconciler bug");
        }
        anyhow::Ok(())
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = ControllerConfig { workers: 1, ..fast_config() };
    let mut ctl = Controller::new(lw, ListOptions::default(), reconciler, config).with_sink(tx);
    ctl.start().await.unwrap();

    let mut saw_panic = false;
    let mut saw_good = false;
    while !(saw_panic && saw_good) {
        match next_matching(&mut rx, |e| matches!(e, ControllerEvent::GaveUp { .. } | ControllerEvent::Synced { .. })).await {
            ControllerEvent::GaveUp { key: k, error, .. } => {
                assert_eq!(k, key("bad"));
                assert!(error.is_panic());
                assert!(error.to_string().contains("reconciler bug"));
                saw_panic = true;
            }
            ControllerEvent::Synced { key: k, .. } => {
                assert_eq!(k, key("good"));
                saw_good = true;
            }
            other => unreachable!("{other:?}"),
        }
    }
    assert_eq!(ctl.queue().processing_len(), 0);
    assert_eq!(ctl.state(), ControllerState::Running);

    ctl.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_object_is_reconciled_as_absent() {
    let lw = FakeLw::with_list(vec![pod("a", 1)], 1);
    let watch = lw.push_watch();
    let calls: Calls = Arc::default();
    let sink = Arc::clone(&calls);
    let reconciler = ReconcileFn(move |key: ObjectKey, obj: Option<Arc<Pod>>| {
        sink.lock().unwrap().push((key.name.clone(), obj.map(|p| p.rv)));
        async { anyhow::Ok(()) }
    });
    let mut ctl = Controller::new(lw, ListOptions::default(), reconciler, fast_config());
    ctl.start().await.unwrap();
    assert!(eventually(|| calls.lock().unwrap().contains(&("a".into(), Some(1)))).await);

    watch.send(WatchEvent::Deleted(pod("a", 2))).unwrap();
    assert!(eventually(|| calls.lock().unwrap().last() == Some(&("a".into(), None))).await);
    assert!(ctl.cache().store().is_empty());

    ctl.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_is_never_synced_concurrently_and_sees_latest_state() {
    let lw = FakeLw::with_list(vec![pod("a", 1)], 1);
    let watch = lw.push_watch();
    let in_flight: Arc<Mutex<HashSet<ObjectKey>>> = Arc::default();
    let overlapped = Arc::new(AtomicBool::new(false));
    let last_seen = Arc::new(AtomicUsize::new(0));
    let (f, o, l) = (Arc::clone(&in_flight), Arc::clone(&overlapped), Arc::clone(&last_seen));
    let reconciler = ReconcileFn(move |key: ObjectKey, obj: Option<Arc<Pod>>| {
        let (f, o, l) = (Arc::clone(&f), Arc::clone(&o), Arc::clone(&l));
        async move {
            if !f.lock().unwrap().insert(key.clone()) {
                o.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(p) = obj {
                l.store(p.rv as usize, Ordering::SeqCst);
            }
            f.lock().unwrap().remove(&key);
            anyhow::Ok(())
        }
    });
    let config = ControllerConfig { workers: 4, ..fast_config() };
    let mut ctl = Controller::new(lw, ListOptions::default(), reconciler, config);
    ctl.start().await.unwrap();

    for rv in 2..=20 {
        watch.send(WatchEvent::Modified(pod("a", rv))).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(eventually(|| last_seen.load(Ordering::SeqCst) == 20).await);
    assert!(!overlapped.load(Ordering::SeqCst));

    ctl.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_states_and_double_start() {
    let lw = FakeLw::with_list(vec![], 1);
    let reconciler = ReconcileFn(|_key: ObjectKey, _obj: Option<Arc<Pod>>| async { anyhow::Ok(()) });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut ctl = Controller::new(lw, ListOptions::default(), reconciler, fast_config()).with_sink(tx);
    let states = ctl.subscribe_state();
    assert_eq!(ctl.state(), ControllerState::Created);

    ctl.start().await.unwrap();
    assert_eq!(*states.borrow(), ControllerState::Running);
    assert!(ctl.cache().has_synced());
    next_matching(&mut rx, |e| matches!(e, ControllerEvent::CacheSynced)).await;
    assert!(matches!(ctl.start().await, Err(Error::AlreadyStarted)));

    ctl.stop().await.unwrap();
    assert_eq!(ctl.state(), ControllerState::Stopped);
    next_matching(&mut rx, |e| matches!(e, ControllerEvent::ShutdownComplete)).await;
    ctl.stop().await.unwrap();
    assert!(ctl.queue().is_shutting_down());
    assert!(matches!(ctl.start().await, Err(Error::AlreadyStarted)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_fails_when_cache_never_syncs() {
    let lw = FakeLw::default();
    let reconciler = ReconcileFn(|_key: ObjectKey, _obj: Option<Arc<Pod>>| async { anyhow::Ok(()) });
    let config = ControllerConfig { cache_sync_timeout: Duration::from_millis(50), ..fast_config() };
    let mut ctl = Controller::new(lw.clone(), ListOptions::default(), reconciler, config);

    let err = ctl.start().await.unwrap_err();
    assert!(matches!(err, Error::CacheSyncTimeout(d) if d == Duration::from_millis(50)));
    assert_eq!(ctl.state(), ControllerState::Stopped);
    assert!(lw.list_calls() >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_stops_when_token_is_cancelled() {
    let lw = FakeLw::with_list(vec![pod("a", 1)], 1);
    let synced = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&synced);
    let reconciler = ReconcileFn(move |_key: ObjectKey, _obj: Option<Arc<Pod>>| {
        s.fetch_add(1, Ordering::SeqCst);
        async { anyhow::Ok(()) }
    });
    let ctl = Controller::new(lw, ListOptions::default(), reconciler, fast_config());
    let states = ctl.subscribe_state();
    let token = CancellationToken::new();
    let handle = tokio::spawn(ctl.run(token.clone()));

    assert!(eventually(|| synced.load(Ordering::SeqCst) == 1).await);
    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle).await.expect("run ignored cancellation").unwrap().unwrap();
    assert_eq!(*states.borrow(), ControllerState::Stopped);
}
