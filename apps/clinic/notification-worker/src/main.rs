//! Notification worker entry point

use core_config::tracing::install_color_eyre;
use eyre::Result;

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();
    clinic_notification_worker::run().await
}
