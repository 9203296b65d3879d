//! Flow scheduler integration: cron advancement, script gating, template
//! interpolation, and error isolation.

use std::{io::Write, sync::Arc, time::Duration};

use chrono::Utc;
use cao_server::{
    config::ServerConfig,
    flow::FlowStore,
    mux::{FakeMux, MuxClient},
    orchestrator::Orchestrator,
    registry::Registry,
    scheduler::FlowScheduler,
};

fn test_config() -> ServerConfig {
    ServerConfig {
        poll_interval: Duration::from_millis(10),
        startup_timeout: Duration::from_secs(5),
        ..ServerConfig::default()
    }
}

struct Fixture {
    mux: Arc<FakeMux>,
    store: Arc<FlowStore>,
    scheduler: FlowScheduler,
    _flows_dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let registry = Arc::new(Registry::new());
    let mux = Arc::new(FakeMux::new());
    let orchestrator = Arc::new(Orchestrator::new(registry, mux.clone(), test_config()));
    let flows_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlowStore::open(flows_dir.path()).unwrap());
    let scheduler = FlowScheduler::new(store.clone(), orchestrator, Duration::from_secs(30));
    Fixture {
        mux,
        store,
        scheduler,
        _flows_dir: flows_dir,
    }
}

/// Simulates the agent side: any freshly created pane gets a ready prompt so
/// assigned terminals can come up.
fn spawn_prompt_bot(mux: Arc<FakeMux>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            for session in mux.list().await.unwrap_or_default() {
                let tail = mux.capture(&session, 1).await.unwrap_or_default();
                if tail.trim_end() == "$" {
                    mux.append_line(&session, "> ");
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

#[cfg(unix)]
fn write_script(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("gate.sh");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh\n{body}").unwrap();
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
#[cfg(unix)]
async fn script_gate_suppresses_firings_until_it_allows_one() {
    let fx = fixture();
    let bot = spawn_prompt_bot(fx.mux.clone());

    // Passes on the third invocation, with template values.
    let script_dir = tempfile::tempdir().unwrap();
    let script = write_script(
        script_dir.path(),
        r#"dir="$(dirname "$0")"
n=$(cat "$dir/count" 2>/dev/null || echo 0)
n=$((n+1))
echo "$n" > "$dir/count"
if [ "$n" -lt 3 ]; then
  echo '{"execute": false, "output": {}}'
else
  echo '{"execute": true, "output": {"url": "u", "status_code": "503"}}'
fi"#,
    );

    let flow = format!(
        "---\nname: watchdog\nschedule: \"* * * * *\"\nagent_profile: developer\nscript: {}\n---\n\nInvestigate [[url]] returning [[status_code]].\n",
        script.display()
    );
    fx.store.add(&flow).unwrap();

    // Two gated firings: no terminal, but next_fire_at advances each time.
    let t0 = Utc::now() + chrono::Duration::seconds(61);
    fx.scheduler.run_due(t0).await;
    assert_eq!(fx.mux.session_count(), 0);
    let after_first = fx.store.next_fire_at("watchdog").unwrap();
    assert!(after_first > t0);

    let t1 = t0 + chrono::Duration::seconds(61);
    fx.scheduler.run_due(t1).await;
    assert_eq!(fx.mux.session_count(), 0);
    let after_second = fx.store.next_fire_at("watchdog").unwrap();
    assert!(after_second > after_first);

    // Third firing passes the gate and spawns exactly one terminal with the
    // interpolated prompt.
    let t2 = t1 + chrono::Duration::seconds(61);
    fx.scheduler.run_due(t2).await;
    assert_eq!(fx.mux.session_count(), 1);

    let session = fx.mux.list().await.unwrap().remove(0);
    let injected = &fx.mux.sent_keys(&session)[0];
    assert!(injected.contains("Investigate u returning 503."));

    bot.abort();
}

#[tokio::test]
#[cfg(unix)]
async fn failing_script_is_recorded_and_does_not_stop_the_scheduler() {
    let fx = fixture();

    let script_dir = tempfile::tempdir().unwrap();
    let script = write_script(script_dir.path(), "exit 7");
    let flow = format!(
        "---\nname: broken\nschedule: \"* * * * *\"\nagent_profile: developer\nscript: {}\n---\n\nNever spawns.\n",
        script.display()
    );
    fx.store.add(&flow).unwrap();

    let now = Utc::now() + chrono::Duration::seconds(61);
    fx.scheduler.run_due(now).await;

    assert_eq!(fx.mux.session_count(), 0);
    let summary = fx
        .store
        .list()
        .into_iter()
        .find(|f| f.name == "broken")
        .unwrap();
    assert!(summary.last_error.as_deref().unwrap().contains("script"));
    // The next firing is still scheduled.
    assert!(fx.store.next_fire_at("broken").unwrap() > now);
}

#[tokio::test]
async fn flow_without_script_fires_directly() {
    let fx = fixture();
    let bot = spawn_prompt_bot(fx.mux.clone());

    fx.store
        .add("---\nname: plain\nschedule: \"* * * * *\"\nagent_profile: developer\n---\n\nDo the rounds.\n")
        .unwrap();

    let spawned = fx.scheduler.fire("plain").await.unwrap();
    assert!(spawned.is_some());
    assert_eq!(fx.mux.session_count(), 1);

    let session = fx.mux.list().await.unwrap().remove(0);
    assert!(fx.mux.sent_keys(&session)[0].contains("Do the rounds."));

    bot.abort();
}

#[tokio::test]
async fn firing_an_unknown_flow_is_not_found() {
    let fx = fixture();
    let err = fx.scheduler.fire("ghost").await.unwrap_err();
    assert_eq!(err.kind, cao_server::error::ErrorKind::NotFound);
}
