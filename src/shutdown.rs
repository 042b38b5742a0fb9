use tokio::sync::watch;

/// Shared close flag. Flipping it is idempotent.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves once the flag is set or every sender is gone.
pub async fn requested(signal: &mut watch::Receiver<bool>) {
    loop {
        let closed = *signal.borrow_and_update();
        if closed {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}
