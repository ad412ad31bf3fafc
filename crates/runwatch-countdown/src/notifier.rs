use async_trait::async_trait;
use tracing::info;

use crate::types::LocalNotice;

/// Presents local notifications to the user. Delivery is best effort.
#[async_trait]
pub trait LocalNotifier: Send + Sync {
    async fn notify(&self, notice: LocalNotice);
}

/// Writes notices to the log. Used where no notification surface exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl LocalNotifier for TracingNotifier {
    async fn notify(&self, notice: LocalNotice) {
        info!(
            key = %notice.key(),
            resource_id = notice.resource_id(),
            title = notice.title(),
            body = %notice.body(),
            "local notice"
        );
    }
}
