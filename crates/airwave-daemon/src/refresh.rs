/// Timing rules for now-playing checks.
///
/// The periodic ticker fires every `period`; whether a tick actually turns
/// into a fetch is decided here from the session's last check time and the
/// current visibility.
use airwave_proto::config::MetadataConfig;
use airwave_proto::protocol::Visibility;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::DaemonEvent;

#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub period: Duration,
    pub cooldown: Duration,
    pub background_cooldown: Duration,
}

impl RefreshPolicy {
    pub fn from_config(config: &MetadataConfig) -> Self {
        Self {
            period: config.refresh_period(),
            cooldown: config.cooldown(),
            background_cooldown: config.background_cooldown(),
        }
    }

    /// Minimum spacing between unforced checks for the given visibility.
    pub fn min_spacing(&self, visibility: Visibility) -> Duration {
        match visibility {
            Visibility::Foreground => self.cooldown,
            Visibility::Background => self.background_cooldown.max(self.cooldown),
        }
    }

    /// Whether an unforced check may proceed.  A session that was never
    /// checked is always due.
    pub fn is_due(&self, last_check: Option<Instant>, now: Instant, visibility: Visibility) -> bool {
        match last_check {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.min_spacing(visibility),
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from_config(&MetadataConfig::default())
    }
}

/// Spawn the periodic ticker for `generation`.  It posts `RefreshTick`
/// every `period` until `cancel` fires or the loop is gone.
pub fn spawn_ticker(
    generation: u64,
    period: Duration,
    event_tx: mpsc::Sender<DaemonEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("refresh: ticker for generation {} cancelled", generation);
                    break;
                }
                _ = interval.tick() => {
                    if event_tx.send(DaemonEvent::RefreshTick { generation }).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RefreshPolicy {
        RefreshPolicy {
            period: Duration::from_secs(5),
            cooldown: Duration::from_secs(15),
            background_cooldown: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_first_check_is_always_due() {
        let now = Instant::now();
        assert!(policy().is_due(None, now, Visibility::Foreground));
        assert!(policy().is_due(None, now, Visibility::Background));
    }

    #[test]
    fn test_cooldown_in_foreground() {
        let start = Instant::now();
        let p = policy();
        assert!(!p.is_due(Some(start), start + Duration::from_secs(14), Visibility::Foreground));
        assert!(p.is_due(Some(start), start + Duration::from_secs(15), Visibility::Foreground));
    }

    #[test]
    fn test_background_backs_off() {
        let start = Instant::now();
        let p = policy();
        assert!(!p.is_due(Some(start), start + Duration::from_secs(20), Visibility::Background));
        assert!(p.is_due(Some(start), start + Duration::from_secs(30), Visibility::Background));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_when_cancelled() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        spawn_ticker(4, Duration::from_secs(5), tx, cancel.clone());

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        match rx.try_recv() {
            Ok(DaemonEvent::RefreshTick { generation }) => assert_eq!(generation, 4),
            other => panic!("expected a tick, got {:?}", other),
        }

        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
