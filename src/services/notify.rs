use crate::models::notification::{Notification, NotificationAction, NotificationLevel};

/// Sink for user-facing notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sends notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        let action = notification.action.map(|a| a.to_string());
        match notification.level {
            NotificationLevel::Success | NotificationLevel::Info => tracing::info!(
                level = %notification.level,
                action = action.as_deref(),
                "{}",
                notification.message
            ),
            NotificationLevel::Error => tracing::warn!(
                level = %notification.level,
                action = action.as_deref(),
                "{}",
                notification.message
            ),
        }
    }
}

/// Prints notifications to stderr, for the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notification: Notification) {
        let prefix = match notification.level {
            NotificationLevel::Success => "✓",
            NotificationLevel::Info => "•",
            NotificationLevel::Error => "✗",
        };
        eprintln!("{prefix} {}", notification.message);
        if let Some(action) = notification.action {
            eprintln!("  → {}", action_hint(action));
        }
    }
}

fn action_hint(action: NotificationAction) -> &'static str {
    match action {
        NotificationAction::UpgradeToPremium => {
            "Upgrade to premium for unlimited uploads: visit /premium"
        }
        NotificationAction::LogIn => "Run `outfit-scan login` to sign in again",
    }
}
