//! List strategies command.

use anyhow::Result;
use trading_strategies::{StrategyKind, StrategyRegistry};

pub async fn run() -> Result<()> {
    let registry = StrategyRegistry::new();

    println!("{:<12} {:>7}  {}", "KIND", "WARMUP", "DESCRIPTION");
    for kind in StrategyKind::defaults() {
        let name = kind.name();
        let warmup = kind.clone().build().map(|g| g.warmup_period()).unwrap_or(0);
        let description = registry.get(name).map(|i| i.description.as_str()).unwrap_or("");
        println!("{:<12} {:>7}  {}", name, warmup, description);
    }

    println!();
    println!("Defaults, as [[strategies]] entries:");
    for info in registry.list() {
        println!("  kind = {:?}  {}", info.name, info.default_config);
    }
    Ok(())
}
