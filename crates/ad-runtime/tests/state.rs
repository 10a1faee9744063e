//! Timestamps on plugin-backed entities follow the runtime clock

mod common;

use ad_core::LastChanged;
use ad_runtime::{AppRegistry, StateQuery, StateUpdate};
use chrono::{DateTime, Duration, Utc};
use common::{start_time, TestAppDaemon};

fn last_changed(t: &TestAppDaemon, entity_id: &str) -> DateTime<Utc> {
    let value = t
        .ad
        .kernel()
        .state
        .get_state(
            "default",
            &StateQuery::entity(entity_id).attribute("last_changed"),
        )
        .unwrap();
    DateTime::parse_from_rfc3339(value.as_str().unwrap())
        .unwrap()
        .with_timezone(&Utc)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_writes_carry_virtual_time() {
    let t = TestAppDaemon::builder()
        .entity("light.a", "off")
        .registry(AppRegistry::new())
        .start()
        .await;

    let later = start_time() + Duration::days(400);
    t.clock.set(later);

    let written = t
        .ad
        .kernel()
        .state
        .set_state("default", "light.a", StateUpdate::state("on"), false)
        .await
        .unwrap();
    assert_eq!(written.last_changed, LastChanged::At(later));
    assert_eq!(last_changed(&t, "light.a"), later);

    let pushed_at = later + Duration::minutes(5);
    t.clock.set(pushed_at);
    t.push_state("light.b", "on").await;
    assert_eq!(last_changed(&t, "light.b"), pushed_at);
    t.stop().await;
}
