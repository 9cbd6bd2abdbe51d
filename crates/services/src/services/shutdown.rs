use tokio::sync::watch;

/// Resolves once the shutdown flag flips to true. Loops await this between
/// iterations so no database transaction is abandoned mid-flight.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without signalling; treat as shutdown.
            return;
        }
    }
}

pub fn is_shutdown(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}
