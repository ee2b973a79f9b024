use tokio::sync::broadcast;

const FOCUS_CHANNEL_CAPACITY: usize = 16;

/// Broadcast of "the consuming surface regained focus".
///
/// The embedding application calls [`notify_focus`](Self::notify_focus);
/// queries subscribed with `refetch_on_focus` revalidate stale entries.
#[derive(Debug, Clone)]
pub struct FocusSignal {
    sender: broadcast::Sender<()>,
}

impl Default for FocusSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusSignal {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FOCUS_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Returns how many subscribers were notified.
    pub fn notify_focus(&self) -> usize {
        self.sender.send(()).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_focus() {
        let signal = FocusSignal::new();
        assert_eq!(signal.notify_focus(), 0);

        let mut rx = signal.subscribe();
        assert_eq!(signal.notify_focus(), 1);
        assert!(rx.recv().await.is_ok());
    }
}
