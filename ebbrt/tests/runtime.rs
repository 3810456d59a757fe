//! Bootstrap and binding behavior of the runtime across threads.

use ebbrt::ebb::{EbbId, EbbRef, EbbRep, SharedRoot};
use ebbrt::error::{EbbError, TranslationError};
use ebbrt::runtime::{Context, LoopCount, Runtime, RuntimeConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Default)]
struct Counter(AtomicUsize);

impl EbbRep for Counter {}

#[test]
fn test_contexts_wait_for_location_zero() {
    init_tracing();
    let initialized = Arc::new(AtomicUsize::new(0));
    let seen = initialized.clone();
    let counter = Arc::new(Counter::default());
    let shared = counter.clone();
    let config = RuntimeConfig::builder()
        .max_contexts(4)
        .static_ebb("Counter", EbbId::new(30))
        .build();
    let runtime = Runtime::builder(config)
        .initializer("Counter", move |_, _| {
            // Give the other contexts time to reach the barrier.
            thread::sleep(Duration::from_millis(20));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(SharedRoot::new(shared.clone())))
        })
        .on_start(|ctx| {
            let counter = ctx.resolve_as(EbbRef::<Counter>::new(EbbId::new(30)))?;
            counter.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();

    let start = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let runtime = runtime.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                Context::new(&runtime).map(|ctx| ctx.location().as_u16())
            })
        })
        .collect();

    let mut locations: Vec<u16> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    locations.sort_unstable();
    assert_eq!(locations, vec![0, 1, 2, 3]);
    assert_eq!(initialized.load(Ordering::SeqCst), 1);

    assert_eq!(runtime.contexts(), 4);
    assert_eq!(counter.0.load(Ordering::SeqCst), 4);
}

#[test]
fn test_failed_initialization_reaches_every_context() {
    init_tracing();
    let config = RuntimeConfig::builder()
        .static_ebb("Broken", EbbId::new(31))
        .build();
    let runtime = Runtime::builder(config)
        .initializer("Broken", |_, _| {
            Err(EbbError::InitFailed("device missing".to_string()))
        })
        .build()
        .unwrap();

    assert!(Context::new(&runtime).is_err());
    assert!(matches!(
        Context::new(&runtime),
        Err(EbbError::InitFailed(_))
    ));
    assert!(!runtime.is_initialized());
}

#[test]
fn test_dynamic_binding_first_wins() {
    init_tracing();
    let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    let ctx = Context::new(&runtime).unwrap();

    let id = runtime.allocate_id().unwrap();
    let unbound = ctx.resolve_as(EbbRef::<Counter>::new(id));
    assert!(matches!(
        unbound,
        Err(EbbError::Translation(TranslationError::Unbound(_)))
    ));

    runtime
        .bind(id, Arc::new(SharedRoot::new(Arc::new(Counter::default()))))
        .unwrap();
    assert!(matches!(
        runtime.bind(id, Arc::new(SharedRoot::new(Arc::new(Counter::default())))),
        Err(EbbError::Translation(TranslationError::AlreadyBound(_)))
    ));

    let a = ctx.resolve_as(EbbRef::<Counter>::new(id)).unwrap();
    let b = ctx.resolve_as(EbbRef::<Counter>::new(id)).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn test_bounded_loop_on_another_thread() {
    init_tracing();
    let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    let ctx = Context::new(&runtime).unwrap();
    let events = ctx.events().clone();
    let ran = Arc::new(AtomicUsize::new(0));

    let worker = thread::spawn(move || ctx.run_loop(LoopCount::Bounded(2)));

    for _ in 0..2 {
        let ran = ran.clone();
        events.defer(move || {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    worker.join().unwrap().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 2);
}
