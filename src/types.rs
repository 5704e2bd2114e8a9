// =============================================================================
// Shared types used across the rebalance engine
// =============================================================================

use serde::{Deserialize, Deserializer, Serialize};

/// Opaque identifier of a managed portfolio.
///
/// Upstream systems use both integer and string identifiers, so
/// deserialisation accepts either JSON form and normalises to a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PortfolioId(String);

impl PortfolioId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for PortfolioId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Str(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Self(n.to_string()),
            Raw::Str(s) => Self(s),
        })
    }
}

impl From<&str> for PortfolioId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for PortfolioId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl std::fmt::Display for PortfolioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Direction of a drift-correcting trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Side of a protective hedge. Only shorts are ever opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HedgeSide {
    Short,
}

/// A single BUY/SELL leg correcting allocation drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceAction {
    pub asset: String,
    pub action: TradeSide,
    #[serde(rename = "amountUSD")]
    pub amount_usd: f64,
    pub reason: String,
}

/// A protective short opened when portfolio losses breach the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HedgeAction {
    pub asset: String,
    pub side: HedgeSide,
    #[serde(rename = "notionalUSD")]
    pub notional_usd: f64,
    pub leverage: f64,
    pub reason: String,
}

/// Either kind of proposed action, as reported in API payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProposedAction {
    Rebalance(RebalanceAction),
    Hedge(HedgeAction),
}

/// The complete output of one decision. A plan is submitted whole or not at
/// all; there is no partial application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "actions", rename_all = "snake_case")]
pub enum ActionPlan {
    #[default]
    Empty,
    Rebalance(Vec<RebalanceAction>),
    Hedge(HedgeAction),
}

impl ActionPlan {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Rebalance(actions) => actions.is_empty(),
            Self::Hedge(_) => false,
        }
    }

    /// Flatten the plan into its individual actions.
    pub fn actions(&self) -> Vec<ProposedAction> {
        match self {
            Self::Empty => Vec::new(),
            Self::Rebalance(actions) => actions
                .iter()
                .cloned()
                .map(ProposedAction::Rebalance)
                .collect(),
            Self::Hedge(hedge) => vec![ProposedAction::Hedge(hedge.clone())],
        }
    }

    /// Total USD notional touched by the plan.
    pub fn notional_usd(&self) -> f64 {
        match self {
            Self::Empty => 0.0,
            Self::Rebalance(actions) => actions.iter().map(|a| a.amount_usd).sum(),
            Self::Hedge(hedge) => hedge.notional_usd,
        }
    }
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Whether actions hit the real chain gateway or a local simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Demo,
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "demo" => Ok(Self::Demo),
            "live" => Ok(Self::Live),
            other => anyhow::bail!("invalid execution mode '{other}', use 'demo' or 'live'"),
        }
    }
}
