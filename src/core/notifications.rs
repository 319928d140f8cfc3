use crate::api::Notice;
use anyhow::Result;
use notify_rust::{Notification, Timeout, Urgency};

const APP_NAME: &str = "console-poller";
const TRANSIENT_TIMEOUT_MS: u32 = 5000;

pub fn show_desktop_notice(notice: &Notice) -> Result<()> {
    let mut notification = Notification::new();
    notification
        .summary(notice.title())
        .body(notice.message())
        .appname(APP_NAME);

    if notice.is_persistent() {
        notification
            .timeout(Timeout::Never)
            .urgency(Urgency::Critical);
    } else {
        notification.timeout(Timeout::Milliseconds(TRANSIENT_TIMEOUT_MS));
    }

    notification.show()?;

    tracing::debug!(title = notice.title(), "Sent desktop notification");
    Ok(())
}
