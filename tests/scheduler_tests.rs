use cdh_core::clock::run_ticker;
use cdh_core::health::ERROR_QUEUE_FULL;
use cdh_core::queue::command_queue;
use cdh_core::scheduler::{run_release_timer, DeferredSchedule, ScheduleError};
use cdh_core::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};

const TICK: Duration = Duration::from_secs(1);

fn deferred(destination: Destination, id: u8, execute_at: u64) -> Envelope {
    Envelope::new(destination, id).due_at(execute_at)
}

/// A context whose onboard clock starts at `at` and ticks once per second.
fn ticking_context(at: u64) -> Arc<FlightContext> {
    let ctx = Arc::new(FlightContext::new());
    ctx.clock.set(at);
    tokio::spawn(run_ticker(Arc::clone(&ctx), TICK));
    ctx
}

#[tokio::test(start_paused = true)]
async fn test_release_timer_delivers_due_commands() {
    let ctx = ticking_context(10);
    let schedule = Arc::new(DeferredSchedule::new(8, TICK));
    let (input, mut rx) = command_queue("cdh", 6).unwrap();
    let timer = tokio::spawn(run_release_timer(Arc::clone(&schedule), input, Arc::clone(&ctx)));

    let started = Instant::now();
    schedule.schedule(deferred(Destination::Power, 4, 13), 10).unwrap();

    let released = rx.recv().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(released.command_id, 4);
    assert_eq!(released.execute_at, 0);
    assert!(released.is_immediate());
    assert_eq!(schedule.stats().total_released, 1);

    timer.abort();
}

#[tokio::test(start_paused = true)]
async fn test_earlier_command_wakes_sleeping_timer() {
    let ctx = ticking_context(0);
    let schedule = Arc::new(DeferredSchedule::new(8, TICK));
    let (input, mut rx) = command_queue("cdh", 6).unwrap();
    let timer = tokio::spawn(run_release_timer(Arc::clone(&schedule), input, ctx));

    schedule.schedule(deferred(Destination::Adcs, 1, 10), 0).unwrap();
    time::sleep(Duration::from_millis(500)).await;
    schedule.schedule(deferred(Destination::Power, 2, 2), 0).unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first.destination(), Ok(Destination::Power));
    let second = rx.recv().await.unwrap();
    assert_eq!(second.destination(), Ok(Destination::Adcs));

    timer.abort();
}

#[tokio::test(start_paused = true)]
async fn test_same_deadline_keeps_insertion_order() {
    let ctx = ticking_context(1);
    let schedule = Arc::new(DeferredSchedule::new(8, TICK));
    let (input, mut rx) = command_queue("cdh", 6).unwrap();
    let timer = tokio::spawn(run_release_timer(Arc::clone(&schedule), input, ctx));

    for id in [5, 6, 7] {
        schedule.schedule(deferred(Destination::Power, id, 4), 1).unwrap();
    }

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(rx.recv().await.unwrap().command_id);
    }
    assert_eq!(ids, vec![5, 6, 7]);

    timer.abort();
}

#[tokio::test(start_paused = true)]
async fn test_release_into_full_input_is_counted_and_flagged() {
    let ctx = ticking_context(0);
    let schedule = Arc::new(DeferredSchedule::new(8, TICK));
    let (input, _rx) = command_queue("cdh", 1).unwrap();
    let timer = tokio::spawn(run_release_timer(Arc::clone(&schedule), input, Arc::clone(&ctx)));

    schedule.schedule(deferred(Destination::Power, 3, 1), 0).unwrap();
    schedule.schedule(deferred(Destination::Power, 4, 1), 0).unwrap();
    time::sleep(Duration::from_secs(2)).await;

    let stats = schedule.stats();
    assert_eq!(stats.total_released, 2);
    assert_eq!(stats.total_dropped, 1);
    assert!(ctx.status(Destination::Cdh).has(ERROR_QUEUE_FULL));

    timer.abort();
}

#[tokio::test(start_paused = true)]
async fn test_capacity_limit_rejects() {
    let schedule = DeferredSchedule::new(2, TICK);
    schedule.schedule(deferred(Destination::Power, 1, 5), 0).unwrap();
    schedule.schedule(deferred(Destination::Power, 2, 6), 0).unwrap();

    let result = schedule.schedule(deferred(Destination::Power, 3, 7), 0);
    assert_eq!(result, Err(ScheduleError::Full(2)));
    assert_eq!(schedule.stats().total_rejected, 1);
    assert_eq!(schedule.pending().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pending_lists_earliest_first() {
    let schedule = DeferredSchedule::new(8, TICK);
    schedule.schedule(deferred(Destination::Power, 1, 9), 0).unwrap();
    schedule.schedule(deferred(Destination::Adcs, 2, 3), 0).unwrap();

    let pending = schedule.pending();
    assert_eq!(pending[0].execution_time, 3);
    assert_eq!(pending[1].execution_time, 9);
    assert_eq!(schedule.next_deadline(), Some(Instant::now() + Duration::from_secs(3)));
}

#[tokio::test(start_paused = true)]
async fn test_release_waits_for_clock_set_back() {
    let ctx = ticking_context(100);
    let schedule = Arc::new(DeferredSchedule::new(8, TICK));
    let (input, mut rx) = command_queue("cdh", 6).unwrap();
    let timer = tokio::spawn(run_release_timer(Arc::clone(&schedule), input, Arc::clone(&ctx)));

    schedule.schedule(deferred(Destination::Power, 4, 105), 100).unwrap();
    time::sleep(Duration::from_millis(500)).await;
    ctx.clock.set(0);

    // The countdown runs out long before the onboard clock gets back to 105.
    time::sleep(Duration::from_secs(10)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(schedule.pending().len(), 1);

    let released = time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("released once the clock catches up")
        .unwrap();
    assert_eq!(released.command_id, 4);
    assert!(ctx.clock.now() >= 105);
    assert_eq!(schedule.stats().total_released, 1);

    timer.abort();
}
