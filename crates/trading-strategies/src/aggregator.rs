//! Multi-strategy, multi-timeframe signal aggregation.
//!
//! Raw signals are filtered by confidence and capped per symbol, then the
//! entry signals for each symbol are scored per direction as
//! `sum(confidence * timeframe_weight)`. A direction wins when its score
//! reaches the threshold and strictly beats the opposite direction.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use trading_core::types::{ConsensusSignal, Signal, SignalType, Timeframe};

/// Aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub min_confidence: f64,
    pub max_per_symbol: usize,
    /// Minimum weighted score for a consensus
    pub threshold: f64,
    /// Multiplier applied to the mean constituent confidence
    pub confidence_boost: f64,
    /// Overrides for [`Timeframe::default_weight`]
    pub timeframe_weights: BTreeMap<Timeframe, f64>,
    /// Signals older than this are dropped before filtering (0 = keep all)
    pub max_signal_age_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            max_per_symbol: 10,
            threshold: 1.2,
            confidence_boost: 1.1,
            timeframe_weights: BTreeMap::new(),
            max_signal_age_secs: 0,
        }
    }
}

impl AggregatorConfig {
    pub fn weight(&self, timeframe: Timeframe) -> f64 {
        self.timeframe_weights
            .get(&timeframe)
            .copied()
            .unwrap_or_else(|| timeframe.default_weight())
    }
}

/// Output of one aggregation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregationResult {
    pub filtered: Vec<Signal>,
    pub consensus: Vec<ConsensusSignal>,
    /// Latest exit signal per (symbol, exit type)
    pub exits: Vec<Signal>,
}

/// Signal aggregator.
#[derive(Debug, Clone, Default)]
pub struct SignalAggregator {
    config: AggregatorConfig,
}

impl SignalAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Drop stale signals, filter, then aggregate. `now_ms` is the reference
    /// time for the age limit.
    pub fn process(&self, signals: Vec<Signal>, now_ms: i64) -> AggregationResult {
        let fresh: Vec<Signal> = if self.config.max_signal_age_secs == 0 {
            signals
        } else {
            let max_age = self.config.max_signal_age_secs as i64 * 1000;
            signals
                .into_iter()
                .filter(|s| now_ms - s.timestamp <= max_age)
                .collect()
        };

        let filtered = filter_signals(fresh, self.config.min_confidence, self.config.max_per_symbol);
        let consensus = aggregate_with(&filtered, &self.config);
        let exits = exit_signals(&filtered);
        debug!(
            filtered = filtered.len(),
            consensus = consensus.len(),
            exits = exits.len(),
            "Signals aggregated"
        );

        AggregationResult {
            filtered,
            consensus,
            exits,
        }
    }
}

/// Total order used for ranking: confidence desc, timestamp desc, strategy,
/// timeframe, then the remaining fields so equal keys never depend on input
/// order.
fn rank(a: &Signal, b: &Signal) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| a.strategy_name.cmp(&b.strategy_name))
        .then_with(|| a.timeframe.cmp(&b.timeframe))
        .then_with(|| a.signal_type.cmp(&b.signal_type))
        .then_with(|| a.price.total_cmp(&b.price))
}

/// Keep signals with `confidence >= min_confidence`, then the best
/// `max_per_symbol` per symbol. Output is grouped by symbol in name order.
pub fn filter_signals(signals: Vec<Signal>, min_confidence: f64, max_per_symbol: usize) -> Vec<Signal> {
    let mut by_symbol: BTreeMap<String, Vec<Signal>> = BTreeMap::new();
    for signal in signals.into_iter().filter(|s| s.confidence >= min_confidence) {
        by_symbol.entry(signal.symbol.clone()).or_default().push(signal);
    }

    by_symbol
        .into_values()
        .flat_map(|mut group| {
            group.sort_by(rank);
            group.truncate(max_per_symbol);
            group
        })
        .collect()
}

/// Aggregate entry signals per symbol with explicit weights and threshold.
pub fn aggregate_signals(
    signals: &[Signal],
    weights: &BTreeMap<Timeframe, f64>,
    threshold: f64,
) -> Vec<ConsensusSignal> {
    let config = AggregatorConfig {
        threshold,
        timeframe_weights: weights.clone(),
        ..Default::default()
    };
    aggregate_with(signals, &config)
}

fn aggregate_with(signals: &[Signal], config: &AggregatorConfig) -> Vec<ConsensusSignal> {
    let mut by_symbol: BTreeMap<&str, Vec<&Signal>> = BTreeMap::new();
    for signal in signals.iter().filter(|s| s.signal_type.is_entry()) {
        by_symbol.entry(signal.symbol.as_str()).or_default().push(signal);
    }

    by_symbol
        .into_iter()
        .filter_map(|(symbol, mut group)| {
            // Fixed summation order keeps float scores reproducible
            group.sort_by(|a, b| rank(a, b));
            let score = |side: SignalType| -> f64 {
                group
                    .iter()
                    .filter(|s| s.signal_type == side)
                    .map(|s| s.confidence * config.weight(s.timeframe))
                    .sum()
            };
            let (buy, sell) = (score(SignalType::Buy), score(SignalType::Sell));

            let (signal_type, score, opposing) = if buy >= config.threshold && buy > sell {
                (SignalType::Buy, buy, sell)
            } else if sell >= config.threshold && sell > buy {
                (SignalType::Sell, sell, buy)
            } else {
                debug!(symbol, buy, sell, threshold = config.threshold, "No consensus");
                return None;
            };

            let constituents: Vec<Signal> = group
                .iter()
                .filter(|s| s.signal_type == signal_type)
                .map(|s| (*s).clone())
                .collect();
            let latest = constituents
                .iter()
                .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| rank(b, a)))?;
            let mean = constituents.iter().map(|s| s.confidence).sum::<f64>() / constituents.len() as f64;

            Some(ConsensusSignal {
                symbol: symbol.to_string(),
                signal_type,
                price: latest.price,
                timestamp: latest.timestamp,
                confidence: (mean * config.confidence_boost).min(1.0),
                score,
                opposing_score: opposing,
                contributing_strategies: constituents.iter().map(|s| s.strategy_name.clone()).collect::<BTreeSet<_>>(),
                contributing_timeframes: constituents.iter().map(|s| s.timeframe).collect::<BTreeSet<_>>(),
                constituents,
            })
        })
        .collect()
}

/// Latest exit signal per (symbol, exit type).
pub fn exit_signals(signals: &[Signal]) -> Vec<Signal> {
    let mut latest: BTreeMap<(&str, SignalType), &Signal> = BTreeMap::new();
    for signal in signals.iter().filter(|s| !s.signal_type.is_entry()) {
        latest
            .entry((signal.symbol.as_str(), signal.signal_type))
            .and_modify(|current| {
                if signal.timestamp > current.timestamp
                    || (signal.timestamp == current.timestamp && rank(signal, current) == Ordering::Less)
                {
                    *current = signal;
                }
            })
            .or_insert(signal);
    }
    latest.into_values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(symbol: &str, signal_type: SignalType, confidence: f64, strategy: &str, timeframe: Timeframe, ts: i64) -> Signal {
        Signal::new(symbol, signal_type, 100.0 + ts as f64, ts, confidence, strategy, timeframe)
    }

    fn btc_consensus_inputs() -> Vec<Signal> {
        vec![
            signal("BTCUSDT", SignalType::Buy, 0.8, "alligator", Timeframe::Hour1, 1),
            signal("BTCUSDT", SignalType::Buy, 0.75, "darvas_box", Timeframe::Hour1, 3),
            signal("BTCUSDT", SignalType::Buy, 0.9, "renko", Timeframe::Hour1, 2),
        ]
    }

    #[test]
    fn test_three_strategy_consensus() {
        let consensus = aggregate_signals(&btc_consensus_inputs(), &BTreeMap::new(), 1.2);

        assert_eq!(consensus.len(), 1);
        let c = &consensus[0];
        assert_eq!(c.signal_type, SignalType::Buy);
        assert!((c.score - 1.47).abs() < 1e-9);
        assert_eq!(c.opposing_score, 0.0);
        assert_eq!(c.contributing_strategies.len(), 3);
        // Most recent constituent
        assert_eq!(c.timestamp, 3);
        assert_eq!(c.price, 103.0);
        let expected = (0.8 + 0.75 + 0.9) / 3.0 * 1.1;
        assert!((c.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_below_threshold() {
        let signals = &btc_consensus_inputs()[..2];
        assert!(aggregate_signals(signals, &BTreeMap::new(), 1.2).is_empty());
    }

    #[test]
    fn test_tie_produces_nothing() {
        let signals = vec![
            signal("ETHUSDT", SignalType::Buy, 0.8, "alligator", Timeframe::Daily, 1),
            signal("ETHUSDT", SignalType::Sell, 0.8, "renko", Timeframe::Daily, 2),
        ];
        assert!(aggregate_signals(&signals, &BTreeMap::new(), 0.5).is_empty());
    }

    #[test]
    fn test_opposing_signals_reduce_consensus() {
        let mut signals = btc_consensus_inputs();
        signals.push(signal("BTCUSDT", SignalType::Sell, 0.9, "ichimoku", Timeframe::Daily, 4));

        let consensus = aggregate_signals(&signals, &BTreeMap::new(), 1.2);
        assert_eq!(consensus.len(), 1);
        assert!((consensus[0].opposing_score - 0.9).abs() < 1e-9);
        assert_eq!(consensus[0].constituents.len(), 3);
    }

    #[test]
    fn test_custom_weights() {
        let weights = BTreeMap::from([(Timeframe::Hour1, 1.0)]);
        let consensus = aggregate_signals(&btc_consensus_inputs()[..2], &weights, 1.2);
        assert_eq!(consensus.len(), 1);
        assert!((consensus[0].score - 1.55).abs() < 1e-9);
    }

    #[test]
    fn test_aggregation_is_order_independent() {
        let mut signals = btc_consensus_inputs();
        signals.push(signal("ETHUSDT", SignalType::Sell, 0.95, "alligator", Timeframe::Daily, 5));
        signals.push(signal("ETHUSDT", SignalType::Sell, 0.7, "renko", Timeframe::Hour4, 6));

        let forward = aggregate_signals(&signals, &BTreeMap::new(), 1.2);
        signals.reverse();
        let backward = aggregate_signals(&signals, &BTreeMap::new(), 1.2);

        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 2);
    }

    #[test]
    fn test_filter_confidence_and_cap() {
        let signals = vec![
            signal("BTCUSDT", SignalType::Buy, 0.5, "a", Timeframe::Hour1, 1),
            signal("BTCUSDT", SignalType::Buy, 0.7, "b", Timeframe::Hour1, 2),
            signal("BTCUSDT", SignalType::Buy, 0.9, "c", Timeframe::Hour1, 3),
            signal("BTCUSDT", SignalType::Sell, 0.8, "d", Timeframe::Hour1, 4),
            signal("ETHUSDT", SignalType::Buy, 0.6, "a", Timeframe::Hour1, 1),
        ];
        let filtered = filter_signals(signals, 0.6, 2);

        let names: Vec<(&str, &str)> = filtered
            .iter()
            .map(|s| (s.symbol.as_str(), s.strategy_name.as_str()))
            .collect();
        assert_eq!(names, vec![("BTCUSDT", "c"), ("BTCUSDT", "d"), ("ETHUSDT", "a")]);
    }

    #[test]
    fn test_exits_are_reported_separately() {
        let mut signals = btc_consensus_inputs();
        signals.push(signal("BTCUSDT", SignalType::ExitSell, 0.7, "alligator", Timeframe::Hour1, 4));
        signals.push(signal("BTCUSDT", SignalType::ExitSell, 0.7, "ichimoku", Timeframe::Hour1, 6));

        let result = SignalAggregator::default().process(signals, 10);
        assert_eq!(result.consensus.len(), 1);
        assert!(result.consensus[0].constituents.iter().all(|s| s.signal_type.is_entry()));
        assert_eq!(result.exits.len(), 1);
        assert_eq!(result.exits[0].strategy_name, "ichimoku");
    }

    #[test]
    fn test_stale_signals_dropped() {
        let aggregator = SignalAggregator::new(AggregatorConfig {
            max_signal_age_secs: 60,
            ..Default::default()
        });
        let signals = vec![signal("BTCUSDT", SignalType::Buy, 0.9, "renko", Timeframe::Hour1, 0)];

        assert_eq!(aggregator.process(signals.clone(), 60_000).filtered.len(), 1);
        assert!(aggregator.process(signals, 60_001).filtered.is_empty());
    }
}
