use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::{SyncChannel, SyncError, SyncMessage};

const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// The page-level effects a context can perform.
pub trait TabHost: Send + Sync {
    fn stop_polling(&self);
    fn reload_session(&self);
    /// Try to close this context. Browsers refuse for tabs a script did not open.
    fn close(&self) -> bool;
    fn navigate(&self, target: &str);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimaryEffect {
    StopPolling,
    ReloadSession,
    Acknowledge,
}

/// Listener state of a tab waiting for a session to appear elsewhere.
#[derive(Debug, Default)]
pub struct PrimaryTab {
    polling: bool,
    reloaded: bool,
}

impl PrimaryTab {
    #[must_use]
    pub fn new(polling: bool) -> Self {
        Self {
            polling,
            reloaded: false,
        }
    }

    #[must_use]
    pub fn reloaded(&self) -> bool {
        self.reloaded
    }

    /// Effects for one incoming message. Every `SessionReady` is acknowledged;
    /// polling stops and the session reloads only the first time.
    pub fn handle(&mut self, message: &SyncMessage) -> Vec<PrimaryEffect> {
        match message {
            SyncMessage::SessionReady { .. } => {
                let mut effects = Vec::with_capacity(3);
                if std::mem::take(&mut self.polling) {
                    effects.push(PrimaryEffect::StopPolling);
                }
                if !self.reloaded {
                    self.reloaded = true;
                    effects.push(PrimaryEffect::ReloadSession);
                }
                effects.push(PrimaryEffect::Acknowledge);
                effects
            }
            SyncMessage::Acknowledged { .. } => Vec::new(),
        }
    }
}

/// Listen until the channel closes, applying [`PrimaryTab`] effects to `host`.
///
/// # Errors
/// Returns an error if a message cannot be encoded or decoded.
pub async fn run_primary<C, H>(
    channel: &mut C,
    tab: &mut PrimaryTab,
    host: &H,
) -> Result<(), SyncError>
where
    C: SyncChannel + ?Sized,
    H: TabHost + ?Sized,
{
    loop {
        let message = match channel.recv().await {
            Ok(message) => message,
            Err(SyncError::Closed) => return Ok(()),
            Err(err) => return Err(err),
        };
        for effect in tab.handle(&message) {
            match effect {
                PrimaryEffect::StopPolling => host.stop_polling(),
                PrimaryEffect::ReloadSession => {
                    debug!("Session announced by another tab, reloading");
                    host.reload_session();
                }
                PrimaryEffect::Acknowledge => channel.post(&SyncMessage::Acknowledged {
                    timestamp: Some(unix_now()),
                })?,
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct HandoffConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffOutcome {
    Closed,
    Navigated { acknowledged: bool },
}

/// Announce a fresh session from a secondary tab and get out of the way.
///
/// `SessionReady` is posted every `interval`, at most `max_attempts` times,
/// until a primary tab acknowledges or `timeout` elapses. On acknowledgment the
/// tab tries to close and navigates to `target` if that is refused; without
/// one it navigates to `target` anyway.
///
/// # Errors
/// Returns an error if a message cannot be encoded or decoded.
pub async fn run_secondary<C, H>(
    channel: &mut C,
    host: &H,
    target: &str,
    config: &HandoffConfig,
) -> Result<HandoffOutcome, SyncError>
where
    C: SyncChannel + ?Sized,
    H: TabHost + ?Sized,
{
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);
    let mut attempts = 0;

    let acknowledged = loop {
        tokio::select! {
            () = &mut deadline => break false,
            message = channel.recv() => match message {
                Ok(SyncMessage::Acknowledged { .. }) => break true,
                // Another secondary tab announcing its own session.
                Ok(SyncMessage::SessionReady { .. }) => {}
                Err(SyncError::Closed) => break false,
                Err(err) => return Err(err),
            },
            _ = ticker.tick(), if attempts < config.max_attempts => {
                channel.post(&SyncMessage::SessionReady {
                    target: target.to_string(),
                    timestamp: unix_now(),
                })?;
                attempts += 1;
            }
        }
    };

    if !acknowledged {
        info!(attempts, "No tab acknowledged the session, navigating");
        host.navigate(target);
        return Ok(HandoffOutcome::Navigated {
            acknowledged: false,
        });
    }

    debug!(attempts, "Session handoff acknowledged");
    if host.close() {
        Ok(HandoffOutcome::Closed)
    } else {
        host.navigate(target);
        Ok(HandoffOutcome::Navigated { acknowledged: true })
    }
}

fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Envelope, LocalBus};
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingHost {
        can_close: bool,
        polling_stops: AtomicUsize,
        reloads: AtomicUsize,
        closes: AtomicUsize,
        navigations: Mutex<Vec<String>>,
    }

    impl RecordingHost {
        fn new(can_close: bool) -> Self {
            Self {
                can_close,
                ..Self::default()
            }
        }

        fn navigations(&self) -> Vec<String> {
            self.navigations
                .lock()
                .map(|nav| nav.clone())
                .unwrap_or_default()
        }
    }

    impl TabHost for RecordingHost {
        fn stop_polling(&self) {
            self.polling_stops.fetch_add(1, Ordering::SeqCst);
        }

        fn reload_session(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) -> bool {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.can_close
        }

        fn navigate(&self, target: &str) {
            if let Ok(mut nav) = self.navigations.lock() {
                nav.push(target.to_string());
            }
        }
    }

    fn ready() -> SyncMessage {
        SyncMessage::SessionReady {
            target: "/".to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn primary_reacts_once_but_acknowledges_every_announcement() {
        let mut tab = PrimaryTab::new(true);
        assert_eq!(
            tab.handle(&ready()),
            vec![
                PrimaryEffect::StopPolling,
                PrimaryEffect::ReloadSession,
                PrimaryEffect::Acknowledge
            ]
        );
        assert!(tab.reloaded());
        assert_eq!(tab.handle(&ready()), vec![PrimaryEffect::Acknowledge]);
        assert!(tab
            .handle(&SyncMessage::Acknowledged { timestamp: None })
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_handoff_closes_the_tab() -> Result<()> {
        let bus = LocalBus::default();
        let primary_host = Arc::new(RecordingHost::new(true));
        let mut primary_channel = bus.join();
        let host = primary_host.clone();
        let primary = tokio::spawn(async move {
            let mut tab = PrimaryTab::new(true);
            run_primary(&mut primary_channel, &mut tab, host.as_ref()).await
        });

        let secondary_host = RecordingHost::new(true);
        let mut secondary_channel = bus.join();
        let outcome = run_secondary(
            &mut secondary_channel,
            &secondary_host,
            "/dashboard",
            &HandoffConfig::default(),
        )
        .await?;
        primary.abort();

        assert_eq!(outcome, HandoffOutcome::Closed);
        assert!(secondary_host.navigations().is_empty());
        assert_eq!(primary_host.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(primary_host.polling_stops.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn bare_browser_acknowledgment_completes_handoff() -> Result<()> {
        let bus = LocalBus::default();
        let mut browser = bus.join();
        let sender = bus.sender.clone();
        let primary = tokio::spawn(async move {
            while let Ok(message) = browser.recv().await {
                if matches!(message, SyncMessage::SessionReady { .. }) {
                    let _ = sender.send(Envelope {
                        from: 0,
                        payload: r#"{"action":"Acknowledged"}"#.to_string(),
                    });
                }
            }
        });

        let host = RecordingHost::new(true);
        let mut channel = bus.join();
        let started = tokio::time::Instant::now();
        let outcome =
            run_secondary(&mut channel, &host, "/dashboard", &HandoffConfig::default()).await?;
        primary.abort();

        assert_eq!(outcome, HandoffOutcome::Closed);
        assert!(started.elapsed() < DEFAULT_TIMEOUT);
        assert!(host.navigations().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn refused_close_falls_back_to_navigation() -> Result<()> {
        let bus = LocalBus::default();
        let mut primary_channel = bus.join();
        let primary = tokio::spawn(async move {
            let host = RecordingHost::new(false);
            let mut tab = PrimaryTab::new(false);
            run_primary(&mut primary_channel, &mut tab, &host).await
        });

        let host = RecordingHost::new(false);
        let mut channel = bus.join();
        let outcome = run_secondary(&mut channel, &host, "/orders", &HandoffConfig::default())
            .await?;
        primary.abort();

        assert_eq!(outcome, HandoffOutcome::Navigated { acknowledged: true });
        assert_eq!(host.closes.load(Ordering::SeqCst), 1);
        assert_eq!(host.navigations(), vec!["/orders".to_string()]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_handoff_navigates_after_timeout() -> Result<()> {
        let bus = LocalBus::default();
        let mut observer = bus.join();
        let host = RecordingHost::new(true);
        let mut channel = bus.join();
        let config = HandoffConfig {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
            max_attempts: 4,
        };

        let started = tokio::time::Instant::now();
        let outcome = run_secondary(&mut channel, &host, "/home", &config).await?;

        assert_eq!(outcome, HandoffOutcome::Navigated { acknowledged: false });
        assert!(started.elapsed() >= config.timeout);
        assert_eq!(host.closes.load(Ordering::SeqCst), 0);
        assert_eq!(host.navigations(), vec!["/home".to_string()]);

        let mut announcements = 0;
        while let Some(message) = observer.try_recv() {
            assert!(matches!(
                message,
                SyncMessage::SessionReady { ref target, .. } if target == "/home"
            ));
            announcements += 1;
        }
        assert_eq!(announcements, 4);
        Ok(())
    }
}
