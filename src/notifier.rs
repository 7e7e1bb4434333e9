// =============================================================================
// Notification Sink — fire-and-forget alert emitter
// =============================================================================
//
// The engine emits human-readable, HTML-subset-formatted alerts (buy/entry/
// sell fills, trailing events, daily reports, panic actions) through this
// trait. Telegram delivery itself is out of scope (spec §1) — only the
// contract the core depends on lives here. A failure to deliver must never
// block the engine, so implementations swallow their own errors and only
// log them.
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `text` (HTML-subset formatted) to whatever sink is configured.
    /// Implementations must not propagate delivery failures to the caller.
    async fn notify(&self, text: &str);
}

/// Writes alerts to the structured log only — used when no external
/// notification channel (e.g. Telegram) is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) {
        debug!(message = %text, "notification (log sink)");
    }
}

/// Strips the `<b>`/`<i>` HTML-subset tags for sinks (like plain-text logs)
/// that do not render markup.
pub fn strip_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_notifier_never_panics() {
        let n = LogNotifier;
        n.notify("<b>test</b> message").await;
    }

    #[test]
    fn strip_html_removes_tags() {
        assert_eq!(strip_html("<b>BUY</b> filled at 100"), "BUY filled at 100");
        assert_eq!(strip_html("plain text"), "plain text");
    }
}
