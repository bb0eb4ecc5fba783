mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{price, test_scheduler_config, FakeBroker, Harness};
use exitguard::models::{AckStatus, CloseCommand, CommandAck, PositionStatus, Side};
use exitguard::monitor::scheduler::MonitorError;
use exitguard::monitor::{CommandQueue, SchedulerState};

#[tokio::test]
async fn scenario_a_long_stop_breach_closes_at_observed_price() {
    let h = Harness::new();
    let pos = h.open("XAUUSD", Side::Long, "2650.50", "2645.00", "2670.00").await;
    h.oracle.set("XAUUSD", "2644.50");

    let report = h.monitor.run_tick().await.unwrap();
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.breaches, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.closed, 0);

    // Terminal polls, closes, and acknowledges without a fill price.
    let device = pos.device_id.unwrap();
    let delivered = h.queue.poll(device, 10).await.unwrap();
    assert_eq!(delivered.len(), 1);
    h.orchestrator
        .acknowledge(
            delivered[0].id,
            &CommandAck {
                status: AckStatus::Executed,
                close_price: None,
                error: None,
            },
        )
        .await
        .unwrap();

    let closed = h.ledger.snapshot(pos.id);
    assert_eq!(closed.status, PositionStatus::ClosedStop);
    assert_eq!(closed.close_price, Some(price("2644.50")));
    assert!(closed.closed_at.is_some());
}

#[tokio::test]
async fn scenario_a_direct_broker_closes_within_the_tick() {
    let h = Harness::new();
    let mut pos = common::open_position("XAUUSD", Side::Long, "2650.50");
    pos.device_id = None;
    h.exits
        .store_levels(pos.signal_id, "2645.00", "2670.00")
        .await;
    h.ledger.add(pos.clone());
    h.oracle.set("XAUUSD", "2644.50");

    let report = h.monitor.run_tick().await.unwrap();
    assert_eq!(report.closed, 1);

    let closed = h.ledger.snapshot(pos.id);
    assert_eq!(closed.status, PositionStatus::ClosedStop);
    assert_eq!(closed.close_price, Some(price("2644.50")));
    assert_eq!(h.notifier.closed_count(), 1);
}

#[tokio::test]
async fn scenario_b_short_target_breach() {
    let h = Harness::new();
    let mut pos = common::open_position("US30", Side::Short, "100.00");
    pos.device_id = None;
    h.exits.store_levels(pos.signal_id, "105.00", "90.00").await;
    h.ledger.add(pos.clone());
    h.oracle.set("US30", "89.50");
    h.broker.respond(FakeBroker::filled_at("89.50"));

    let report = h.monitor.run_tick().await.unwrap();
    assert_eq!(report.breaches, 1);
    assert_eq!(report.closed, 1);

    let closed = h.ledger.snapshot(pos.id);
    assert_eq!(closed.status, PositionStatus::ClosedTarget);
    assert_eq!(closed.close_reason.as_deref(), Some("take_profit"));
}

#[tokio::test]
async fn positions_inside_their_levels_are_left_alone() {
    let h = Harness::new();
    let pos = h.open("XAUUSD", Side::Long, "2650.50", "2645.00", "2670.00").await;
    h.oracle.set("XAUUSD", "2655.00");

    let report = h.monitor.run_tick().await.unwrap();
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.breaches, 0);
    assert_eq!(h.queue.len(), 0);
    assert!(h.ledger.snapshot(pos.id).is_open());
}

#[tokio::test]
async fn scenario_c_failed_deliveries_reuse_one_command() {
    let h = Harness::new();
    let mut pos = common::open_position("XAUUSD", Side::Long, "2650.50");
    // Terminal only: no broker fallback available.
    pos.broker_account = None;
    h.exits
        .store_levels(pos.signal_id, "2645.00", "2670.00")
        .await;
    h.ledger.add(pos.clone());
    h.oracle.set("XAUUSD", "2644.50");
    h.queue.fail_enqueue.store(true, Ordering::SeqCst);

    for _ in 0..2 {
        let report = h.monitor.run_tick().await.unwrap();
        assert_eq!(report.breaches, 1);
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.failures, 1);
        assert!(h.ledger.snapshot(pos.id).is_open());
        assert_eq!(h.queue.len(), 0);
    }

    h.queue.fail_enqueue.store(false, Ordering::SeqCst);
    let report = h.monitor.run_tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert!(h.ledger.snapshot(pos.id).is_open());

    let command_id = CloseCommand::id_for(pos.id);
    assert_eq!(h.queue.len(), 1);
    assert_eq!(h.queue.enqueue_calls.load(Ordering::SeqCst), 3);

    // Next tick: command still pending and fresh, so nothing new is issued.
    h.monitor.run_tick().await.unwrap();
    assert_eq!(h.queue.enqueue_calls.load(Ordering::SeqCst), 3);

    h.orchestrator
        .acknowledge(
            command_id,
            &CommandAck {
                status: AckStatus::Executed,
                close_price: Some(price("2644.30")),
                error: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(h.ledger.snapshot(pos.id).status, PositionStatus::ClosedStop);
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn scenario_d_one_bad_blob_does_not_stop_the_batch() {
    let h = Harness::new();
    let mut ids = Vec::new();
    for _ in 0..10 {
        let mut pos = common::open_position("XAUUSD", Side::Long, "2650.50");
        pos.device_id = None;
        h.exits
            .store_levels(pos.signal_id, "2645.00", "2670.00")
            .await;
        h.ledger.add(pos.clone());
        ids.push(pos);
    }
    h.exits.tamper(ids[3].signal_id);
    h.oracle.set("XAUUSD", "2644.00");

    let report = h.monitor.run_tick().await.unwrap();
    assert_eq!(report.evaluated, 9);
    assert_eq!(report.closed, 9);
    assert_eq!(report.failures, 1);

    for (i, pos) in ids.iter().enumerate() {
        let stored = h.ledger.snapshot(pos.id);
        if i == 3 {
            assert!(stored.is_open());
        } else {
            assert_eq!(stored.status, PositionStatus::ClosedStop);
        }
    }
}

#[tokio::test]
async fn persistent_decryption_failure_alerts_once() {
    let h = Harness::new();
    let pos = h.open("XAUUSD", Side::Long, "2650.50", "2645.00", "2670.00").await;
    h.exits.tamper(pos.signal_id);
    h.oracle.set("XAUUSD", "2655.00");

    // alert_after_failures is 3 in the test config.
    for _ in 0..2 {
        h.monitor.run_tick().await.unwrap();
    }
    assert_eq!(h.notifier.alert_count(), 0);

    h.monitor.run_tick().await.unwrap();
    assert_eq!(h.notifier.alert_count(), 1);

    h.monitor.run_tick().await.unwrap();
    assert_eq!(h.notifier.alert_count(), 1);
}

#[tokio::test]
async fn one_price_fetch_per_instrument() {
    let h = Harness::new();
    for _ in 0..5 {
        h.open("XAUUSD", Side::Long, "2650.50", "2645.00", "2670.00").await;
    }
    for _ in 0..3 {
        h.open("EURUSD", Side::Long, "1.0850", "1.0800", "1.0950").await;
    }
    h.oracle.set("XAUUSD", "2655");
    h.oracle.set("EURUSD", "1.0860");

    let report = h.monitor.run_tick().await.unwrap();
    assert_eq!(report.evaluated, 8);
    assert_eq!(h.oracle.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unavailable_price_skips_only_that_instrument() {
    let h = Harness::new();
    let gold = h.open("XAUUSD", Side::Long, "2650.50", "2645.00", "2670.00").await;
    let euro = h.open("EURUSD", Side::Long, "1.0850", "1.0800", "1.0950").await;
    h.oracle.fail("XAUUSD");
    h.oracle.set("EURUSD", "1.0790");

    let report = h.monitor.run_tick().await.unwrap();
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.failures, 1);
    assert_eq!(report.breaches, 1);
    assert!(h.ledger.snapshot(gold.id).is_open());
    assert!(h.queue.command(CloseCommand::id_for(euro.id)).is_some());
}

#[tokio::test]
async fn slow_evaluations_time_out_and_retry_next_tick() {
    let mut config = test_scheduler_config();
    config.eval_timeout = Duration::from_millis(50);
    let h = Harness::with_config(config, Duration::from_secs(120));
    let pos = h.open("XAUUSD", Side::Long, "2650.50", "2645.00", "2670.00").await;
    h.oracle.set("XAUUSD", "2644.50");
    *h.exits.load_delay.lock() = Some(Duration::from_millis(500));

    let report = h.monitor.run_tick().await.unwrap();
    assert_eq!(report.failures, 1);
    assert_eq!(report.evaluated, 0);
    assert_eq!(h.queue.len(), 0);

    *h.exits.load_delay.lock() = None;
    let report = h.monitor.run_tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert!(h.queue.command(CloseCommand::id_for(pos.id)).is_some());
}

#[tokio::test]
async fn listing_failure_is_a_tick_error() {
    let h = Harness::new();
    h.ledger.fail_list.store(true, Ordering::SeqCst);

    let err = h.monitor.run_tick().await.unwrap_err();
    assert!(matches!(err, MonitorError::ListPositions(_)));
}

#[tokio::test]
async fn running_loop_alerts_after_repeated_listing_failures() {
    let h = Harness::new();
    h.ledger.fail_list.store(true, Ordering::SeqCst);

    let handle = h.monitor.start().unwrap();
    assert_eq!(h.monitor.state(), SchedulerState::Running);

    // Three failures with backoff 40ms + 80ms + 160ms, capped at 200ms.
    tokio::time::sleep(Duration::from_millis(600)).await;
    handle.stop().await;

    assert_eq!(h.monitor.state(), SchedulerState::Stopped);
    assert!(h.monitor.status().consecutive_failures >= 3);
    assert_eq!(h.notifier.alert_count(), 1);
}

#[tokio::test]
async fn paused_monitor_skips_ticks_until_resumed() {
    let h = Harness::new();
    let pos = h.open("XAUUSD", Side::Long, "2650.50", "2645.00", "2670.00").await;
    h.oracle.set("XAUUSD", "2644.50");

    h.monitor.pause();
    let handle = h.monitor.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.queue.len(), 0);
    assert!(h.monitor.status().paused);

    h.monitor.resume();
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.stop().await;

    assert!(h.queue.command(CloseCommand::id_for(pos.id)).is_some());
    assert!(h.monitor.status().last_tick.is_some());
}

#[tokio::test]
async fn monitor_cannot_start_twice_and_restarts_after_stop() {
    let h = Harness::new();

    let handle = h.monitor.start().unwrap();
    assert!(matches!(h.monitor.start(), Err(MonitorError::AlreadyRunning)));
    handle.stop().await;
    assert_eq!(h.monitor.state(), SchedulerState::Stopped);

    let handle = h.monitor.start().unwrap();
    handle.stop().await;
    assert_eq!(h.monitor.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn stop_abandons_evaluations_past_the_grace_period() {
    let mut config = test_scheduler_config();
    config.eval_timeout = Duration::from_secs(30);
    config.shutdown_grace = Duration::from_millis(50);
    let h = Harness::with_config(config, Duration::from_secs(120));
    let pos = h.open("XAUUSD", Side::Long, "2650.50", "2645.00", "2670.00").await;
    h.oracle.set("XAUUSD", "2644.50");
    *h.exits.load_delay.lock() = Some(Duration::from_secs(10));

    let handle = h.monitor.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    handle.stop().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(h.monitor.state(), SchedulerState::Stopped);

    // Nothing was dispatched and no in-flight marker leaked.
    assert_eq!(h.queue.len(), 0);
    assert!(!h.orchestrator.is_in_flight(&pos.id));
}

#[tokio::test]
async fn stop_lets_a_short_evaluation_finish_its_close() {
    let mut config = test_scheduler_config();
    config.eval_timeout = Duration::from_secs(5);
    config.shutdown_grace = Duration::from_secs(3);
    let h = Harness::with_config(config, Duration::from_secs(120));
    let pos = h.open("XAUUSD", Side::Long, "2650.50", "2645.00", "2670.00").await;
    h.oracle.set("XAUUSD", "2644.50");
    *h.exits.load_delay.lock() = Some(Duration::from_millis(300));

    let handle = h.monitor.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.queue.len(), 0);

    let stopping = tokio::spawn(handle.stop());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.monitor.state(), SchedulerState::Stopping);

    stopping.await.unwrap();
    assert_eq!(h.monitor.state(), SchedulerState::Stopped);

    let command = h
        .queue
        .command(CloseCommand::id_for(pos.id))
        .expect("close enqueued before shutdown");
    assert!(command.is_pending());
    assert!(h.ledger.snapshot(pos.id).is_open());
    assert!(!h.orchestrator.is_in_flight(&pos.id));
}
