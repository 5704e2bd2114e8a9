// =============================================================================
// Risk Notifier — best-effort post-action events
// =============================================================================
//
// Producers enqueue with `try_send` and never wait. A background task drains
// the queue and POSTs each event to the risk webhook when one is configured.
// Nothing here can fail or delay the pipeline that produced the event.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::PortfolioId;

const QUEUE_CAPACITY: usize = 256;
const WEBHOOK_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RiskEvent {
    /// A plan was executed; the risk service should re-assess.
    #[serde(rename_all = "camelCase")]
    ActionExecuted {
        portfolio_id: PortfolioId,
        kind: &'static str,
        tx_hash: String,
        #[serde(rename = "notionalUSD")]
        notional_usd: f64,
        at: DateTime<Utc>,
    },
    /// NAV fell too far below its observed peak.
    #[serde(rename_all = "camelCase")]
    NavDrawdown {
        portfolio_id: PortfolioId,
        #[serde(rename = "navUSD")]
        nav_usd: f64,
        #[serde(rename = "peakNavUSD")]
        peak_nav_usd: f64,
        drawdown_percent: f64,
        at: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct RiskNotifier {
    tx: mpsc::Sender<RiskEvent>,
}

impl RiskNotifier {
    /// A notifier plus the receiving end, for callers that drain it
    /// themselves.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RiskEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue an event. Drops it with a warning when the queue is full or
    /// the consumer has gone away.
    pub fn notify(&self, event: RiskEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "risk event dropped");
        }
    }
}

/// Spawn the webhook forwarder and return a notifier feeding it.
pub fn spawn_risk_notifier(webhook_url: Option<String>) -> RiskNotifier {
    let (notifier, mut rx) = RiskNotifier::channel(QUEUE_CAPACITY);

    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "risk notifier disabled: failed to build HTTP client");
                return;
            }
        };

        match webhook_url.as_deref() {
            Some(url) => info!(url = %url, "risk notifier forwarding to webhook"),
            None => info!("risk notifier running without webhook (events logged only)"),
        }

        while let Some(event) = rx.recv().await {
            let Some(url) = webhook_url.as_deref() else {
                debug!(event = ?event, "risk event");
                continue;
            };
            match client.post(url).json(&event).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(status = %resp.status(), "risk event delivered");
                }
                Ok(resp) => warn!(status = %resp.status(), "risk webhook rejected event"),
                Err(e) => warn!(error = %e, "risk webhook delivery failed"),
            }
        }
    });

    notifier
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> RiskEvent {
        RiskEvent::ActionExecuted {
            portfolio_id: PortfolioId::from(1),
            kind: "hedge",
            tx_hash: "0xabc".into(),
            notional_usd: 10.0,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn events_reach_the_receiver() {
        let (notifier, mut rx) = RiskNotifier::channel(4);
        notifier.notify(event());
        assert!(matches!(rx.recv().await, Some(RiskEvent::ActionExecuted { .. })));
    }

    #[tokio::test]
    async fn closed_or_full_queue_does_not_panic() {
        let (notifier, rx) = RiskNotifier::channel(1);
        notifier.notify(event());
        notifier.notify(event());
        drop(rx);
        notifier.notify(event());
    }

    #[test]
    fn event_wire_shape() {
        let v = serde_json::to_value(event()).unwrap();
        assert_eq!(v["type"], "actionExecuted");
        assert_eq!(v["portfolioId"], "1");
        assert_eq!(v["notionalUSD"], 10.0);
    }
}
