//! Pre-trade risk validation.
//!
//! Every order is checked against the risk profile of its (account, agent):
//! a daily-loss circuit breaker and a maximum position size relative to the
//! account value. Data-service failures never block trading: the order is
//! allowed and the decision carries a warning instead.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};
use trading_core::error::DataError;
use trading_core::traits::{AlertSink, TradingDataService};
use trading_core::types::{Alert, AlertSeverity, OrderSpec, PositionBook};

/// Risk limits for one account, optionally narrowed to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub account: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Maximum position notional, percent of account value
    pub max_position_pct: Decimal,
    /// Daily realized loss that trips the breaker, percent of account value
    pub max_daily_loss_pct: Decimal,
    pub circuit_breaker: bool,
}

impl RiskProfile {
    /// Conservative limits used when nothing is configured.
    pub fn conservative(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            agent_id: None,
            max_position_pct: dec!(10),
            max_daily_loss_pct: dec!(5),
            circuit_breaker: true,
        }
    }
}

/// Limits applied to accounts without a profile of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_pct: Decimal,
    pub max_daily_loss_pct: Decimal,
    pub circuit_breaker: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        let profile = RiskProfile::conservative("");
        Self {
            max_position_pct: profile.max_position_pct,
            max_daily_loss_pct: profile.max_daily_loss_pct,
            circuit_breaker: profile.circuit_breaker,
        }
    }
}

/// Risk management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub default_limits: RiskLimits,
    pub profiles: Vec<RiskProfile>,
    /// Assets valued at face value
    pub stablecoins: Vec<String>,
    /// Quote asset used to price other balances (`{ASSET}{quote}`)
    pub quote_asset: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            default_limits: RiskLimits::default(),
            profiles: Vec::new(),
            stablecoins: ["USDT", "USDC", "BUSD", "DAI", "FDUSD"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            quote_asset: "USDT".to_string(),
        }
    }
}

/// Outcome of a pre-trade check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RiskDecision {
    /// Order may proceed; `warning` is set when a check could not run
    Allowed { warning: Option<String> },
    Rejected { reason: String },
}

impl RiskDecision {
    pub fn allowed() -> Self {
        RiskDecision::Allowed { warning: None }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskDecision::Allowed { .. })
    }

    pub fn warning(&self) -> Option<&str> {
        match self {
            RiskDecision::Allowed { warning } => warning.as_deref(),
            RiskDecision::Rejected { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            RiskDecision::Rejected { reason } => Some(reason),
            RiskDecision::Allowed { .. } => None,
        }
    }
}

/// Pre-trade risk gate.
pub struct RiskManager {
    config: RiskConfig,
    data: Arc<dyn TradingDataService>,
    positions: Arc<PositionBook>,
    profiles: RwLock<HashMap<(String, Option<String>), RiskProfile>>,
    /// Accounts whose breaker tripped, with the UTC day it tripped on
    tripped: Mutex<HashMap<String, NaiveDate>>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, data: Arc<dyn TradingDataService>, positions: Arc<PositionBook>) -> Self {
        let profiles = config
            .profiles
            .iter()
            .map(|p| ((p.account.clone(), p.agent_id.clone()), p.clone()))
            .collect();
        Self {
            config,
            data,
            positions,
            profiles: RwLock::new(profiles),
            tripped: Mutex::new(HashMap::new()),
            alerts: None,
        }
    }

    /// Send an alert whenever a circuit breaker trips or a check fails open.
    pub fn with_alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Install or replace a profile. Takes effect for the next order.
    pub fn set_profile(&self, profile: RiskProfile) {
        let key = (profile.account.clone(), profile.agent_id.clone());
        self.profiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, profile);
    }

    /// Profile for (account, agent), falling back to the account profile and
    /// then to the default limits.
    pub fn profile(&self, account: &str, agent_id: Option<&str>) -> RiskProfile {
        let profiles = self.profiles.read().unwrap_or_else(|e| e.into_inner());
        let agent_key = agent_id.map(|agent| (account.to_string(), Some(agent.to_string())));
        if let Some(profile) = agent_key.and_then(|key| profiles.get(&key)) {
            return profile.clone();
        }
        if let Some(profile) = profiles.get(&(account.to_string(), None)) {
            return profile.clone();
        }

        let limits = &self.config.default_limits;
        RiskProfile {
            account: account.to_string(),
            agent_id: agent_id.map(str::to_string),
            max_position_pct: limits.max_position_pct,
            max_daily_loss_pct: limits.max_daily_loss_pct,
            circuit_breaker: limits.circuit_breaker,
        }
    }

    /// Whether the breaker for `account` is latched on `day`.
    pub fn is_tripped(&self, account: &str, day: NaiveDate) -> bool {
        self.tripped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(account)
            .is_some_and(|tripped_on| *tripped_on == day)
    }

    /// Validate an order against the current time.
    pub async fn validate_order(&self, account: &str, spec: &OrderSpec) -> RiskDecision {
        self.validate_order_at(account, spec, Utc::now()).await
    }

    /// Validate an order as of `now` (the UTC day selects the PnL window).
    pub async fn validate_order_at(&self, account: &str, spec: &OrderSpec, now: DateTime<Utc>) -> RiskDecision {
        if spec.quantity <= Decimal::ZERO {
            return RiskDecision::Rejected {
                reason: format!("Order quantity must be positive, got {}", spec.quantity),
            };
        }

        let profile = self.profile(account, spec.agent_id.as_deref());
        let today = now.date_naive();

        if profile.circuit_breaker && self.is_tripped(account, today) {
            return RiskDecision::Rejected {
                reason: format!("Circuit breaker tripped for {} on {}", account, today),
            };
        }

        let account_value = match self.account_value(account).await {
            Ok(value) => value,
            Err(e) => return self.fail_open(account, spec, "account value", e).await,
        };
        if account_value <= Decimal::ZERO {
            return RiskDecision::Rejected {
                reason: format!("Account {} has no value to trade against", account),
            };
        }

        if profile.circuit_breaker {
            let realized = match self.data.get_realized_pnl(account, today).await {
                Ok(pnl) => pnl,
                Err(e) => return self.fail_open(account, spec, "realized PnL", e).await,
            };
            let loss_pct = -realized / account_value * dec!(100);
            if loss_pct >= profile.max_daily_loss_pct {
                self.trip(account, today, loss_pct, &profile).await;
                return RiskDecision::Rejected {
                    reason: format!(
                        "Daily loss {:.2}% reached limit {}%",
                        loss_pct, profile.max_daily_loss_pct
                    ),
                };
            }
        }

        let mark = match self.data.get_price(&spec.symbol).await {
            Ok(price) => price,
            Err(e) => return self.fail_open(account, spec, "mark price", e).await,
        };
        let current = self.positions.net_quantity(account, &spec.symbol);
        let resulting = current + spec.side.sign() * spec.quantity;
        let notional = resulting.abs() * mark;
        let limit = profile.max_position_pct / dec!(100) * account_value;

        debug!(
            account,
            symbol = %spec.symbol,
            %current,
            %resulting,
            %notional,
            %limit,
            "Position check"
        );

        if notional > limit {
            return RiskDecision::Rejected {
                reason: format!(
                    "Position value {} for {} would exceed {}% of account value {}",
                    notional.round_dp(2),
                    spec.symbol,
                    profile.max_position_pct,
                    account_value.round_dp(2)
                ),
            };
        }

        RiskDecision::allowed()
    }

    /// Stablecoins at face value plus every other asset at its mark price.
    pub async fn account_value(&self, account: &str) -> Result<Decimal, DataError> {
        let balances = self.data.get_balances(account).await?;
        let mut total = Decimal::ZERO;
        for balance in balances {
            let amount = balance.total();
            if amount.is_zero() {
                continue;
            }
            if self.is_stablecoin(&balance.asset) {
                total += amount;
            } else {
                let pair = format!("{}{}", balance.asset, self.config.quote_asset);
                total += amount * self.data.get_price(&pair).await?;
            }
        }
        Ok(total)
    }

    fn is_stablecoin(&self, asset: &str) -> bool {
        self.config
            .stablecoins
            .iter()
            .any(|s| s.eq_ignore_ascii_case(asset))
    }

    async fn fail_open(&self, account: &str, spec: &OrderSpec, what: &str, error: DataError) -> RiskDecision {
        let warning = format!("Risk check skipped, could not load {}: {}", what, error);
        warn!(account, symbol = %spec.symbol, side = %spec.side, quantity = %spec.quantity, %error, "Risk validation failing open");
        if let Some(sink) = &self.alerts {
            let alert = Alert::new(
                AlertSeverity::Warning,
                "risk",
                format!("{} {} {} allowed unchecked: {}", spec.side, spec.quantity, spec.symbol, warning),
            )
            .for_account(account);
            sink.send_alert(alert).await;
        }
        RiskDecision::Allowed {
            warning: Some(warning),
        }
    }

    async fn trip(&self, account: &str, day: NaiveDate, loss_pct: Decimal, profile: &RiskProfile) {
        let newly_tripped = self
            .tripped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account.to_string(), day)
            != Some(day);
        if !newly_tripped {
            return;
        }

        info!(account, %day, loss_pct = %loss_pct.round_dp(2), "Circuit breaker tripped");
        if let Some(sink) = &self.alerts {
            let alert = Alert::new(
                AlertSeverity::Critical,
                "risk",
                format!(
                    "Circuit breaker tripped: daily loss {:.2}% >= {}%",
                    loss_pct, profile.max_daily_loss_pct
                ),
            )
            .for_account(account);
            sink.send_alert(alert).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use trading_core::types::{Balance, Fill, Side};

    #[derive(Default)]
    struct MockData {
        balances: Mutex<Option<Vec<Balance>>>,
        prices: Mutex<HashMap<String, Decimal>>,
        pnl: Mutex<HashMap<NaiveDate, Decimal>>,
    }

    impl MockData {
        fn with_usdt(amount: Decimal) -> Self {
            let data = Self::default();
            *data.balances.lock().unwrap() = Some(vec![Balance::new("USDT", amount, Decimal::ZERO)]);
            data.set_price("BTCUSDT", dec!(50000));
            data
        }

        fn set_price(&self, symbol: &str, price: Decimal) {
            self.prices.lock().unwrap().insert(symbol.to_string(), price);
        }
    }

    #[async_trait]
    impl TradingDataService for MockData {
        async fn get_balances(&self, account: &str) -> Result<Vec<Balance>, DataError> {
            self.balances
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| DataError::ConnectionError(format!("balances unavailable for {}", account)))
        }

        async fn get_price(&self, symbol: &str) -> Result<Decimal, DataError> {
            self.prices
                .lock()
                .unwrap()
                .get(symbol)
                .copied()
                .ok_or_else(|| DataError::PriceUnavailable(symbol.to_string()))
        }

        async fn get_realized_pnl(&self, _account: &str, day: NaiveDate) -> Result<Decimal, DataError> {
            Ok(self.pnl.lock().unwrap().get(&day).copied().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send_alert(&self, alert: Alert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    fn manager(data: MockData) -> (RiskManager, Arc<PositionBook>) {
        let positions = Arc::new(PositionBook::new());
        let manager = RiskManager::new(RiskConfig::default(), Arc::new(data), positions.clone());
        (manager, positions)
    }

    fn buy(quantity: Decimal) -> OrderSpec {
        OrderSpec::market("binance", "BTCUSDT", Side::Buy, quantity)
    }

    fn noon(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_position_limit_allows_and_rejects() {
        // 10% of 100k = 10k, BTC at 50k
        let (manager, _) = manager(MockData::with_usdt(dec!(100000)));

        let allowed = manager.validate_order("acct", &buy(dec!(0.2))).await;
        assert_eq!(allowed, RiskDecision::allowed());

        let rejected = manager.validate_order("acct", &buy(dec!(0.21))).await;
        assert!(!rejected.is_allowed());
        assert!(rejected.reason().unwrap().contains("exceed 10%"));
    }

    #[tokio::test]
    async fn test_existing_position_counts_toward_limit() {
        let (manager, positions) = manager(MockData::with_usdt(dec!(100000)));
        positions.apply_fill(
            "acct",
            None,
            "BTCUSDT",
            &Fill {
                order_id: uuid::Uuid::new_v4(),
                side: Side::Buy,
                quantity: dec!(0.15),
                price: dec!(50000),
                timestamp: noon(1),
            },
        );

        assert!(!manager.validate_order("acct", &buy(dec!(0.1))).await.is_allowed());
        // Reducing the position is re-checked and passes
        let sell = OrderSpec::market("binance", "BTCUSDT", Side::Sell, dec!(0.1));
        assert!(manager.validate_order("acct", &sell).await.is_allowed());
    }

    #[tokio::test]
    async fn test_non_stable_assets_valued_at_mark() {
        let data = MockData::with_usdt(dec!(50000));
        data.balances
            .lock()
            .unwrap()
            .as_mut()
            .unwrap()
            .push(Balance::new("ETH", dec!(10), dec!(5)));
        data.set_price("ETHUSDT", dec!(2000));
        let (manager, _) = manager(data);

        assert_eq!(manager.account_value("acct").await.unwrap(), dec!(80000));
    }

    #[tokio::test]
    async fn test_fails_open_with_warning() {
        let data = MockData::default();
        data.set_price("BTCUSDT", dec!(50000));
        let (manager, _) = manager(data);

        let decision = manager.validate_order("acct", &buy(dec!(100))).await;
        assert!(decision.is_allowed());
        assert!(decision.warning().unwrap().contains("account value"));
    }

    #[tokio::test]
    async fn test_fail_open_sends_one_warning_alert() {
        let data = MockData::default();
        data.set_price("BTCUSDT", dec!(50000));
        let sink = Arc::new(RecordingSink::default());
        let (manager, _) = manager(data);
        let manager = manager.with_alerts(sink.clone());

        let decision = manager.validate_order("acct", &buy(dec!(1))).await;
        assert!(decision.is_allowed());

        let alerts = sink.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(alerts[0].account.as_deref(), Some("acct"));
        assert!(alerts[0].message.contains("account value"));
    }

    #[tokio::test]
    async fn test_missing_mark_price_fails_open() {
        let data = MockData::with_usdt(dec!(100000));
        data.prices.lock().unwrap().clear();
        let (manager, _) = manager(data);

        let decision = manager.validate_order("acct", &buy(dec!(1))).await;
        assert!(decision.is_allowed());
        assert!(decision.warning().unwrap().contains("mark price"));
    }

    #[tokio::test]
    async fn test_circuit_breaker_latches_until_new_day() {
        let data = MockData::with_usdt(dec!(100000));
        let day = noon(5).date_naive();
        data.pnl.lock().unwrap().insert(day, dec!(-5000));
        let data = Arc::new(data);
        let sink = Arc::new(RecordingSink::default());
        let manager = RiskManager::new(RiskConfig::default(), data.clone(), Arc::new(PositionBook::new()))
            .with_alerts(sink.clone());

        let decision = manager.validate_order_at("acct", &buy(dec!(0.01)), noon(5)).await;
        assert!(decision.reason().unwrap().contains("Daily loss"));
        assert!(manager.is_tripped("acct", day));

        // Stays tripped even if the loss is recovered the same day
        data.pnl.lock().unwrap().insert(day, Decimal::ZERO);
        let decision = manager.validate_order_at("acct", &buy(dec!(0.01)), noon(5)).await;
        assert!(decision.reason().unwrap().contains("Circuit breaker tripped"));

        let next_day = manager.validate_order_at("acct", &buy(dec!(0.01)), noon(6)).await;
        assert!(next_day.is_allowed());

        let alerts = sink.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[0].account.as_deref(), Some("acct"));
    }

    #[tokio::test]
    async fn test_breaker_disabled_by_profile() {
        let data = MockData::with_usdt(dec!(100000));
        data.pnl.lock().unwrap().insert(noon(5).date_naive(), dec!(-50000));
        let (manager, _) = manager(data);
        manager.set_profile(RiskProfile {
            circuit_breaker: false,
            ..RiskProfile::conservative("acct")
        });

        assert!(manager.validate_order_at("acct", &buy(dec!(0.01)), noon(5)).await.is_allowed());
    }

    #[tokio::test]
    async fn test_profile_resolution() {
        let (manager, _) = manager(MockData::with_usdt(dec!(100000)));
        manager.set_profile(RiskProfile {
            max_position_pct: dec!(20),
            ..RiskProfile::conservative("acct")
        });
        manager.set_profile(RiskProfile {
            agent_id: Some("agent-1".into()),
            max_position_pct: dec!(1),
            ..RiskProfile::conservative("acct")
        });

        assert_eq!(manager.profile("acct", Some("agent-1")).max_position_pct, dec!(1));
        assert_eq!(manager.profile("acct", Some("agent-2")).max_position_pct, dec!(20));
        assert_eq!(manager.profile("other", None).max_position_pct, dec!(10));

        let spec = buy(dec!(0.1)).with_agent("agent-1");
        assert!(!manager.validate_order("acct", &spec).await.is_allowed());
        assert!(manager.validate_order("acct", &buy(dec!(0.3))).await.is_allowed());
    }

    #[tokio::test]
    async fn test_non_positive_quantity_rejected() {
        let (manager, _) = manager(MockData::with_usdt(dec!(100000)));
        assert!(!manager.validate_order("acct", &buy(Decimal::ZERO)).await.is_allowed());
    }
}
