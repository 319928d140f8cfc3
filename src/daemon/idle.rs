use crate::core::settings::IdleSettings;
use crate::poller::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Slows every poller down after a period without reported activity and
/// restores the default interval on the next report. Ends when the activity
/// channel closes.
pub async fn run_idle_watch(
    registry: Arc<Registry>,
    settings: IdleSettings,
    mut activity: mpsc::UnboundedReceiver<()>,
) {
    if settings.after_secs == 0 {
        tracing::info!("Idle watch disabled");
        return;
    }

    let idle_after = Duration::from_secs(settings.after_secs);
    let idle_interval = Duration::from_millis(settings.interval_ms);
    let deadline = tokio::time::sleep(idle_after);
    tokio::pin!(deadline);
    let mut idle = false;

    loop {
        tokio::select! {
            () = &mut deadline, if !idle => {
                idle = true;
                tracing::info!(
                    idle_secs = settings.after_secs,
                    interval_ms = settings.interval_ms,
                    "No activity, slowing pollers down"
                );
                registry.all().change_interval(Some(idle_interval));
            }
            report = activity.recv() => {
                if report.is_none() {
                    break;
                }
                if idle {
                    idle = false;
                    tracing::info!("Activity resumed, restoring poll interval");
                    registry.all().change_interval(None);
                }
                deadline.as_mut().reset(Instant::now() + idle_after);
            }
        }
    }
}
