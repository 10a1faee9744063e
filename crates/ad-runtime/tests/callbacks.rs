//! State, event, log and timer callbacks through a running runtime

mod common;

use ad_runtime::{
    AppRegistry, Callback, EventArgs, EventOptions, LogArgs, LogLevel, LogOptions, StateArgs,
    StateOptions, TimerArgs, TimerOptions,
};
use chrono::Duration;
use common::{probe, start_time, Recorder, TestAppDaemon};
use serde_json::json;

const WATCHER: &str = "watcher:\n  module: watch\n  class: Watcher\n";

fn record_state(rec: &Recorder) -> Callback<StateArgs> {
    let rec = rec.clone();
    Callback::sync(move |a: StateArgs| {
        rec.push(format!("state:{}:{}:{}", a.entity_id, a.old, a.new));
        Ok(())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_immediate_match_fires_once() {
    let rec = Recorder::default();
    let registry = AppRegistry::new().with(
        "watch",
        "Watcher",
        probe(&rec, |api, rec| {
            api.listen_state(
                Some("light.a"),
                StateOptions::new().new_state("on").immediate(),
                record_state(rec),
            )?;
            Ok(())
        }),
    );
    let t = TestAppDaemon::builder()
        .apps(WATCHER)
        .entity("light.a", "on")
        .registry(registry)
        .start()
        .await;

    assert_eq!(rec.count("state:light.a:null:\"on\""), 1);
    t.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duration_retracted_when_state_leaves() {
    let rec = Recorder::default();
    let registry = AppRegistry::new().with(
        "watch",
        "Watcher",
        probe(&rec, |api, rec| {
            api.listen_state(
                Some("binary_sensor.door"),
                StateOptions::new().new_state("open").duration(60),
                record_state(rec),
            )?;
            Ok(())
        }),
    );
    let t = TestAppDaemon::builder()
        .apps(WATCHER)
        .entity("binary_sensor.door", "closed")
        .registry(registry)
        .start()
        .await;
    let scheduler = &t.ad.kernel().scheduler;

    t.push_state("binary_sensor.door", "open").await;
    assert_eq!(scheduler.entries(Some("watcher")).len(), 1);

    t.advance(30).await;
    t.push_state("binary_sensor.door", "closed").await;
    assert!(scheduler.entries(Some("watcher")).is_empty());

    t.advance(60).await;
    assert!(rec.entries().iter().all(|e| !e.starts_with("state:")));

    // Held for the full minute this time
    t.push_state("binary_sensor.door", "open").await;
    t.advance(60).await;
    assert_eq!(
        rec.count("state:binary_sensor.door:\"closed\":\"open\""),
        1
    );
    t.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oneshot_and_cancel() {
    let rec = Recorder::default();
    let registry = AppRegistry::new().with(
        "watch",
        "Watcher",
        probe(&rec, |api, rec| {
            api.listen_state(Some("light.a"), StateOptions::new().oneshot(), record_state(rec))?;
            let handle = api.listen_state(Some("light.b"), StateOptions::new(), record_state(rec))?;
            assert!(api.cancel_listen_state(&handle)?);
            assert!(!api.cancel_listen_state(&handle)?);
            Ok(())
        }),
    );
    let t = TestAppDaemon::builder()
        .apps(WATCHER)
        .entity("light.a", "off")
        .entity("light.b", "off")
        .registry(registry)
        .start()
        .await;

    t.push_state("light.a", "on").await;
    t.push_state("light.a", "off").await;
    t.push_state("light.b", "on").await;

    assert_eq!(rec.count("state:light.a:\"off\":\"on\""), 1);
    assert!(rec.entries().iter().all(|e| !e.contains("light.b")));
    assert_eq!(t.ad.kernel().callbacks.count(Some("watcher"), None), 0);
    t.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_timeout_removes_callback() {
    let rec = Recorder::default();
    let registry = AppRegistry::new().with(
        "watch",
        "Watcher",
        probe(&rec, |api, rec| {
            api.listen_state(Some("light.a"), StateOptions::new().timeout(10), record_state(rec))?;
            Ok(())
        }),
    );
    let t = TestAppDaemon::builder()
        .apps(WATCHER)
        .entity("light.a", "off")
        .registry(registry)
        .start()
        .await;

    t.advance(11).await;
    t.push_state("light.a", "on").await;

    assert!(rec.entries().iter().all(|e| !e.starts_with("state:")));
    assert_eq!(t.ad.kernel().callbacks.count(Some("watcher"), None), 0);
    t.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_filters() {
    let rec = Recorder::default();
    let registry = AppRegistry::new().with(
        "watch",
        "Watcher",
        probe(&rec, |api, rec| {
            let rec = rec.clone();
            api.listen_event(
                Some("doorbell"),
                EventOptions::new().filter("floor", "ground"),
                Callback::sync(move |a: EventArgs| {
                    rec.push(format!("event:{}:{}", a.event_type, a.data["floor"]));
                    Ok(())
                }),
            )?;
            Ok(())
        }),
    );
    let t = TestAppDaemon::builder()
        .apps(WATCHER)
        .registry(registry)
        .start()
        .await;

    t.plugin.push_event("doorbell", json!({"floor": "first"}));
    t.plugin.push_event("doorbell", json!({"floor": "ground"}));
    t.plugin.push_event("chime", json!({"floor": "ground"}));
    t.settle().await;

    assert_eq!(rec.entries().iter().filter(|e| e.starts_with("event:")).count(), 1);
    assert!(rec.contains("event:doorbell:\"ground\""));
    t.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_log_callbacks_filter_by_level() {
    let rec = Recorder::default();
    let registry = AppRegistry::new()
        .with(
            "listen",
            "Listener",
            probe(&rec, |api, rec| {
                let rec = rec.clone();
                api.listen_log(
                    LogOptions::new().level(LogLevel::Warning),
                    Callback::sync(move |a: LogArgs| {
                        rec.push(format!("log:{}:{}:{}", a.app_name, a.level, a.message));
                        Ok(())
                    }),
                )?;
                // Not published: this app listens to logs itself
                api.log_at(LogLevel::Error, "from listener");
                Ok(())
            }),
        )
        .with(
            "talk",
            "Talker",
            probe(&rec, |api, _| {
                api.log("quiet");
                api.log_at(LogLevel::Warning, "loud");
                Ok(())
            }),
        );
    let t = TestAppDaemon::builder()
        .apps(
            "listener:\n  module: listen\n  class: Listener\n\
             talker:\n  module: talk\n  class: Talker\n  dependencies: listener\n",
        )
        .registry(registry)
        .start()
        .await;

    let logs: Vec<String> = rec
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("log:"))
        .collect();
    assert_eq!(logs, vec!["log:talker:WARNING:loud".to_string()]);
    t.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timers_fire_and_cancel() {
    let rec = Recorder::default();
    let registry = AppRegistry::new().with(
        "watch",
        "Watcher",
        probe(&rec, |api, rec| {
            let r = rec.clone();
            api.run_in(
                Callback::sync(move |a: TimerArgs| {
                    r.push(format!("run_in:{}", a.kwargs["room"]));
                    Ok(())
                }),
                5.0,
                TimerOptions::new().kwarg("room", "hall"),
            )?;
            let r = rec.clone();
            api.run_every(
                Callback::sync(move |_: TimerArgs| {
                    r.push("every");
                    Ok(())
                }),
                None,
                10.0,
                TimerOptions::new(),
            )?;
            let r = rec.clone();
            let cancelled = api.run_in(
                Callback::sync(move |_: TimerArgs| {
                    r.push("cancelled");
                    Ok(())
                }),
                5.0,
                TimerOptions::new(),
            )?;
            assert!(api.timer_running(&cancelled));
            assert!(api.cancel_timer(&cancelled)?);
            assert!(!api.cancel_timer(&cancelled)?);
            Ok(())
        }),
    );
    let t = TestAppDaemon::builder()
        .apps(WATCHER)
        .registry(registry)
        .start()
        .await;

    t.advance(4).await;
    assert!(!rec.contains("run_in:\"hall\""));
    t.advance(1).await;
    assert!(rec.contains("run_in:\"hall\""));

    t.advance(5).await;
    t.advance(10).await;
    assert_eq!(rec.count("every"), 2);
    assert!(!rec.contains("cancelled"));
    t.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sunrise_offset_and_reseat() {
    let rec = Recorder::default();
    let registry = AppRegistry::new().with(
        "watch",
        "Watcher",
        probe(&rec, |api, rec| {
            let rec = rec.clone();
            api.run_at_sunrise(
                Callback::sync(move |_: TimerArgs| {
                    rec.push("sunrise");
                    Ok(())
                }),
                TimerOptions::new().offset(-60),
            )?;
            Ok(())
        }),
    );
    let t = TestAppDaemon::builder()
        .apps(WATCHER)
        .registry(registry)
        .start()
        .await;
    let kernel = t.ad.kernel();
    let sun = kernel.scheduler.sun();
    let rising = sun.next_rising(start_time()).unwrap();

    let entries = kernel.scheduler.entries(Some("watcher"));
    assert_eq!(entries.len(), 1);
    let id = entries[0].id.clone();
    assert_eq!(entries[0].timestamp, rising - Duration::seconds(60));

    t.set_time(rising - Duration::seconds(61)).await;
    assert!(!rec.contains("sunrise"));
    assert_eq!(t.admin_state("sun.sun"), Some(json!("below_horizon")));

    t.set_time(rising - Duration::seconds(60)).await;
    assert_eq!(rec.count("sunrise"), 1);
    assert!(kernel.scheduler.entry(&id).unwrap().inactive);

    let after = rising + Duration::seconds(120);
    t.set_time(after).await;
    assert_eq!(t.admin_state("sun.sun"), Some(json!("above_horizon")));
    let entry = kernel.scheduler.entry(&id).unwrap();
    assert!(!entry.inactive);
    assert_eq!(
        entry.timestamp,
        sun.next_rising(after).unwrap() - Duration::seconds(60)
    );
    assert_eq!(rec.count("sunrise"), 1);
    t.stop().await;
}
