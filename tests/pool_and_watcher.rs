use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::executor::block_on;
use parking_lot::Mutex;
use promise_interface::{
    run, run_with_producer, Error, Event, EventLoop, Launch, PanicError, PoolConfig, Producer,
    ThreadPool, Watcher, WatcherConfig, WorkerPool,
};

fn pool(threads: usize) -> Arc<dyn ThreadPool> {
    Arc::new(WorkerPool::new(
        PoolConfig::default()
            .with_threads(threads)
            .with_name_prefix("scenario"),
    ))
}

#[test]
fn pooled_task_reports_progress_and_results() {
    let pool = pool(2);
    let future = run_with_producer(&pool, |producer: &Producer<u64>| {
        producer.set_progress_range(0, 10);
        for i in 1..=10u64 {
            if producer.is_canceled() {
                return;
            }
            producer.report_result(i * i);
            producer.report_progress(i as i32, format!("{i}/10"));
        }
    });
    let values = future.results().unwrap();
    assert_eq!(values.len(), 10);
    assert_eq!(values.iter().sum::<u64>(), 385);
    assert_eq!(future.progress_value(), 10);
    assert_eq!(future.progress_text(), "10/10");
}

#[test]
fn chain_inherits_the_parent_pool() {
    let pool = pool(1);
    let parent = run(&pool, || thread::current().name().map(str::to_owned));
    let child = parent.then_with(Launch::Inherit, |name| {
        (name, thread::current().name().map(str::to_owned))
    });
    let (first, second) = child.result().unwrap();
    assert_eq!(first.as_deref(), Some("scenario-0"));
    // the inherited job may also be pulled inline by the waiting thread
    assert!(second.is_some());
}

#[test]
fn panicking_task_surfaces_as_exception() {
    let pool = pool(1);
    let future = run(&pool, || -> u8 { panic!("worker exploded") });
    match future.wait_for_finished() {
        Err(Error::Exception(e)) => {
            let panic = e.downcast_ref::<PanicError>().expect("panic payload");
            assert_eq!(panic.0, "worker exploded");
        }
        other => panic!("expected a panic exception, got {other:?}"),
    }
    // the pool survives and keeps working
    assert_eq!(run(&pool, || 3).result().unwrap(), 3);
}

#[test]
fn awaiting_a_pooled_chain() {
    let pool = pool(2);
    let sum = run(&pool, || vec![1, 2, 3])
        .then(|v| v.into_iter().sum::<i32>())
        .then_with(Launch::Pool(pool.clone()), |s| s * 100);
    let got = block_on(sum).unwrap();
    assert_eq!(got, vec![600]);
}

#[test]
fn suspended_pool_task_frees_its_slot() {
    let pool = pool(1);
    let (gate, gate_future) = Producer::<()>::new();
    let blocked = run_with_producer(&pool, move |producer: &Producer<u32>| {
        producer.report_result(1);
        gate_future.wait_for_finished().ok();
        producer.suspend_if_requested();
        producer.report_result(2);
    });
    blocked.suspend();
    gate.report_started();
    gate.report_finished();
    while !blocked.is_suspended() {
        thread::yield_now();
    }

    // a single-slot pool still runs this while the first task is parked
    let other = run(&pool, || 42);
    assert_eq!(other.result().unwrap(), 42);

    blocked.resume();
    assert_eq!(blocked.results().unwrap(), vec![1, 2]);
}

#[test]
fn watcher_on_an_event_loop_sees_the_whole_run() {
    let event_loop = EventLoop::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let watcher = Watcher::with_options(
        WatcherConfig::default().with_max_pending_results(2),
        Some(event_loop.context()),
        move |event: &Event| sink.lock().push(event.clone()),
    );

    let (producer, consumer) = Producer::<usize>::new();
    watcher.set_future(&consumer);
    let task = thread::spawn(move || {
        producer.report_started();
        for i in 0..20 {
            producer.wait_while_throttled();
            producer.report_result(i);
        }
        producer.report_finished();
    });

    while !consumer.is_finished() {
        event_loop.wait_and_process(Duration::from_millis(5));
    }
    task.join().expect("The task thread has panicked");
    event_loop.process_events();

    let seen = seen.lock();
    let delivered: usize = seen
        .iter()
        .map(|e| match e {
            Event::ResultsReady { begin, end } => end - begin,
            _ => 0,
        })
        .sum();
    assert_eq!(delivered, 20);
    assert_eq!(seen.first(), Some(&Event::Started));
    assert_eq!(seen.last(), Some(&Event::Finished));
    assert!(!consumer.is_throttled());
}

#[test]
fn dropped_producer_does_not_strand_an_awaiter() {
    let (producer, consumer) = Producer::<String>::new();
    let awaiting = thread::spawn(move || block_on(consumer));
    thread::sleep(Duration::from_millis(10));
    thread::spawn(move || {
        producer.report_started();
        drop(producer);
    })
    .join()
    .expect("The producer thread has panicked");
    let outcome = awaiting.join().expect("The awaiting thread has panicked");
    assert!(matches!(outcome, Err(Error::ProducerDropped)));
}
