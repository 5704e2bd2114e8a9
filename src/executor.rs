// =============================================================================
// Action Executor — submits a decided plan as one chain transaction
// =============================================================================
//
// A plan goes out whole: one rebalance batch or one hedge. On success the
// executor returns the tx hash, the applied actions, and a proof artifact
// (SHA-256 digest of the submission, HMAC-signed when a proof key exists),
// then fires a best-effort risk event. Cooldown persistence belongs to the
// scheduler, not here.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::chain::ChainClient;
use crate::error::PipelineError;
use crate::notify::{RiskEvent, RiskNotifier};
use crate::types::{ActionPlan, ExecutionMode, PortfolioId, ProposedAction};

type HmacSha256 = Hmac<Sha256>;

/// Lightweight evidence tying a plan to the transaction that applied it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProof {
    /// Hex SHA-256 over the canonical submission JSON.
    pub digest: String,
    /// Hex HMAC-SHA256 over `digest`, when signing is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub tx_hash: String,
    pub applied_actions: Vec<ProposedAction>,
    pub proof: ExecutionProof,
    pub mode: ExecutionMode,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProofPayload<'a> {
    portfolio_id: &'a PortfolioId,
    wallet_address: &'a str,
    plan: &'a ActionPlan,
    tx_hash: &'a str,
}

pub struct ActionExecutor {
    chain: Arc<dyn ChainClient>,
    notifier: RiskNotifier,
    timeout: Duration,
    mode: ExecutionMode,
    proof_key: Option<Vec<u8>>,
}

impl ActionExecutor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        notifier: RiskNotifier,
        timeout: Duration,
        mode: ExecutionMode,
        proof_key: Option<Vec<u8>>,
    ) -> Self {
        Self {
            chain,
            notifier,
            timeout,
            mode,
            proof_key: proof_key.filter(|k| !k.is_empty()),
        }
    }

    pub async fn execute(
        &self,
        portfolio_id: &PortfolioId,
        wallet: &str,
        plan: &ActionPlan,
    ) -> Result<ExecutionResult, PipelineError> {
        info!(
            portfolio_id = %portfolio_id,
            mode = %self.mode,
            legs = plan.actions().len(),
            notional_usd = plan.notional_usd(),
            plan = ?plan,
            "submitting action plan"
        );

        let (kind, submission) = match plan {
            ActionPlan::Rebalance(actions) if !actions.is_empty() => (
                "rebalance",
                tokio::time::timeout(
                    self.timeout,
                    self.chain.submit_rebalance(portfolio_id, wallet, actions),
                )
                .await,
            ),
            ActionPlan::Hedge(hedge) => (
                "hedge",
                tokio::time::timeout(
                    self.timeout,
                    self.chain.submit_hedge(portfolio_id, wallet, hedge),
                )
                .await,
            ),
            _ => {
                return Err(PipelineError::ExecutionFailed(
                    "refusing to submit an empty plan".to_string(),
                ))
            }
        };

        let receipt = submission
            .map_err(|_| {
                PipelineError::ExecutionFailed(format!(
                    "{kind} submission timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| PipelineError::ExecutionFailed(format!("{kind} submission failed: {e:#}")))?;

        let now = Utc::now();
        let proof = self.build_proof(portfolio_id, wallet, plan, &receipt.tx_hash, now)?;

        info!(
            portfolio_id = %portfolio_id,
            kind,
            tx_hash = %receipt.tx_hash,
            digest = %proof.digest,
            "action plan executed"
        );

        self.notifier.notify(RiskEvent::ActionExecuted {
            portfolio_id: portfolio_id.clone(),
            kind,
            tx_hash: receipt.tx_hash.clone(),
            notional_usd: plan.notional_usd(),
            at: now,
        });

        Ok(ExecutionResult {
            tx_hash: receipt.tx_hash,
            applied_actions: plan.actions(),
            proof,
            mode: self.mode,
        })
    }

    fn build_proof(
        &self,
        portfolio_id: &PortfolioId,
        wallet: &str,
        plan: &ActionPlan,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<ExecutionProof, PipelineError> {
        let payload = serde_json::to_vec(&ProofPayload {
            portfolio_id,
            wallet_address: wallet,
            plan,
            tx_hash,
        })
        .map_err(|e| {
            // The transaction already went out; surface loudly but keep the hash.
            warn!(tx_hash, error = %e, "failed to serialise proof payload");
            PipelineError::ExecutionFailed(format!(
                "executed as {tx_hash} but proof serialisation failed: {e}"
            ))
        })?;

        let digest = hex::encode(Sha256::digest(&payload));
        let signature = self.proof_key.as_ref().and_then(|key| {
            let mut mac = HmacSha256::new_from_slice(key).ok()?;
            mac.update(digest.as_bytes());
            Some(hex::encode(mac.finalize().into_bytes()))
        });

        Ok(ExecutionProof {
            digest,
            signature,
            generated_at: now,
        })
    }
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("chain", &"<ChainClient>")
            .field("timeout", &self.timeout)
            .field("mode", &self.mode)
            .field("signing", &self.proof_key.is_some())
            .finish()
    }
}
