//! Recurring agent work.
//!
//! Every loop ticks on its own interval and exits when the shutdown flag is
//! raised:
//! - heartbeat: state of every instance on `dea.heartbeat`
//! - monitor: usage sampling and quota enforcement
//! - crash reaper: deletes instances crashed longer than the retention window
//! - varz: refreshes the node counters
//! - dump: logs the droplet collection, when enabled

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::agent::Agent;

/// Runs `tick` every `period` until shutdown. The first run happens one
/// period after the start.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    debug!(task = name, period_ms = period.as_millis() as u64, "Starting periodic task");

    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(task = name, "Periodic task shutting down");
                    break;
                }
            }
        }
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}

/// Spawns every recurring task of `agent`.
pub fn spawn_all(agent: &Arc<Agent>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let intervals = agent.config().intervals.clone();
    let mut handles = Vec::new();

    handles.push(tokio::spawn({
        let agent = Arc::clone(agent);
        let shutdown = shutdown.clone();
        async move {
            run_periodic("heartbeat", secs(intervals.heartbeat_secs), shutdown, || {
                agent.send_heartbeat();
                async {}
            })
            .await
        }
    }));

    handles.push(tokio::spawn({
        let agent = Arc::clone(agent);
        let shutdown = shutdown.clone();
        async move {
            run_periodic("monitor", secs(intervals.monitor_secs), shutdown, || {
                let agent = Arc::clone(&agent);
                async move { agent.monitor_pass(false).await }
            })
            .await
        }
    }));

    handles.push(tokio::spawn({
        let agent = Arc::clone(agent);
        let shutdown = shutdown.clone();
        async move {
            run_periodic("crash_reaper", secs(intervals.crash_reaper_secs), shutdown, || {
                let agent = Arc::clone(&agent);
                async move {
                    let reaped = agent.reap_crashed().await;
                    if reaped > 0 {
                        info!(reaped, "Reaped crashed instances");
                    }
                }
            })
            .await
        }
    }));

    handles.push(tokio::spawn({
        let agent = Arc::clone(agent);
        let shutdown = shutdown.clone();
        async move {
            run_periodic("varz", secs(intervals.varz_secs), shutdown, || {
                agent.update_varz();
                async {}
            })
            .await
        }
    }));

    if agent.config().dump_apps {
        handles.push(tokio::spawn({
            let agent = Arc::clone(agent);
            async move {
                run_periodic("dump", secs(intervals.dump_secs), shutdown, || {
                    agent.dump_droplets();
                    async {}
                })
                .await
            }
        }));
    }

    handles
}
