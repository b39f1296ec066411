use crate::models::{ExchangePosition, Side, TrackedPosition};
use std::collections::{HashMap, HashSet};

/// One reconciliation step between the ledger and the exchange snapshot
#[derive(Debug, Clone)]
pub enum ReconcileAction {
    /// Exchange position with no open ledger row: adopt it. The watermark
    /// starts at the exchange's average open price.
    Adopt {
        symbol: String,
        side: Side,
        entry_price: f64,
        quantity: f64,
    },
    /// Open ledger row whose exchange position has vanished: close it as a
    /// manual exit with the best price available at apply time.
    CloseZombie { position: TrackedPosition },
    /// Ledger entry price and exchange average diverge beyond tolerance.
    /// Surfaced every tick until resolved; whether to resync is a policy
    /// decision made at apply time.
    FlagDivergence {
        position_id: uuid::Uuid,
        symbol: String,
        ledger_entry: f64,
        exchange_entry: f64,
    },
}

/// Compute the reconciliation plan. Pure: all exchange and ledger reads
/// happen before, all writes after. Adoptions come before zombie closes so
/// a symbol can never be dropped and re-created in the same pass, mirroring
/// an add-then-remove sync.
///
/// Running the plan and then re-planning against the updated inputs yields
/// no further Adopt or CloseZombie actions.
pub fn plan(
    open_rows: &[TrackedPosition],
    exchange_positions: &[ExchangePosition],
    divergence_tolerance: f64,
) -> Vec<ReconcileAction> {
    let active: HashMap<&str, &ExchangePosition> = exchange_positions
        .iter()
        .filter(|p| !p.is_flat())
        .map(|p| (p.symbol.as_str(), p))
        .collect();

    let tracked: HashSet<&str> = open_rows.iter().map(|r| r.symbol.as_str()).collect();

    let mut actions = Vec::new();

    for position in exchange_positions.iter().filter(|p| !p.is_flat()) {
        if !tracked.contains(position.symbol.as_str()) {
            actions.push(ReconcileAction::Adopt {
                symbol: position.symbol.clone(),
                side: position.side(),
                entry_price: position.average_open_price,
                quantity: position.abs_qty(),
            });
        }
    }

    for row in open_rows {
        match active.get(row.symbol.as_str()) {
            None => actions.push(ReconcileAction::CloseZombie {
                position: row.clone(),
            }),
            Some(exchange) => {
                let reference = exchange.average_open_price;
                if reference > 0.0
                    && (row.entry_price - reference).abs() > reference * divergence_tolerance
                {
                    actions.push(ReconcileAction::FlagDivergence {
                        position_id: row.id,
                        symbol: row.symbol.clone(),
                        ledger_entry: row.entry_price,
                        exchange_entry: reference,
                    });
                }
            }
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionOrigin;

    fn open_row(symbol: &str, side: Side, entry: f64, qty: f64) -> TrackedPosition {
        TrackedPosition::open(symbol.to_string(), side, entry, qty, PositionOrigin::Signal)
    }

    fn exchange_pos(symbol: &str, qty: f64, avg: f64) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            quantity: qty,
            average_open_price: avg,
            mark_price: None,
        }
    }

    #[test]
    fn test_orphan_is_adopted_with_entry_as_watermark() {
        let actions = plan(&[], &[exchange_pos("PERP_SOL_USDC", 5.0, 50.0)], 0.01);

        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ReconcileAction::Adopt {
                symbol,
                side,
                entry_price,
                quantity,
            } => {
                assert_eq!(symbol, "PERP_SOL_USDC");
                assert_eq!(*side, Side::Long);
                assert_eq!(*entry_price, 50.0);
                assert_eq!(*quantity, 5.0);
            }
            other => panic!("expected adoption, got {:?}", other),
        }
    }

    #[test]
    fn test_short_orphan_side_from_sign() {
        let actions = plan(&[], &[exchange_pos("PERP_SOL_USDC", -5.0, 50.0)], 0.01);

        match &actions[0] {
            ReconcileAction::Adopt { side, quantity, .. } => {
                assert_eq!(*side, Side::Short);
                assert_eq!(*quantity, 5.0);
            }
            other => panic!("expected adoption, got {:?}", other),
        }
    }

    #[test]
    fn test_zombie_row_is_closed() {
        let row = open_row("PERP_ETH_USDC", Side::Long, 2500.0, 0.1);
        let actions = plan(std::slice::from_ref(&row), &[], 0.01);

        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ReconcileAction::CloseZombie { position } => assert_eq!(position.id, row.id),
            other => panic!("expected zombie close, got {:?}", other),
        }
    }

    #[test]
    fn test_matched_positions_produce_no_actions() {
        let row = open_row("PERP_ETH_USDC", Side::Long, 2500.0, 0.1);
        let exchange = [exchange_pos("PERP_ETH_USDC", 0.1, 2500.0)];

        assert!(plan(std::slice::from_ref(&row), &exchange, 0.01).is_empty());
    }

    #[test]
    fn test_idempotent_after_apply() {
        // First pass: one orphan, one zombie
        let zombie = open_row("PERP_ETH_USDC", Side::Long, 2500.0, 0.1);
        let exchange = [exchange_pos("PERP_SOL_USDC", 5.0, 50.0)];

        let first = plan(std::slice::from_ref(&zombie), &exchange, 0.01);
        assert_eq!(first.len(), 2);

        // Simulate applying the plan: zombie closed, orphan now tracked
        let adopted = open_row("PERP_SOL_USDC", Side::Long, 50.0, 5.0);
        let second = plan(std::slice::from_ref(&adopted), &exchange, 0.01);
        assert!(second.is_empty());
    }

    #[test]
    fn test_divergence_flagged_beyond_tolerance() {
        let row = open_row("PERP_ETH_USDC", Side::Long, 2550.0, 0.1);
        let exchange = [exchange_pos("PERP_ETH_USDC", 0.1, 2500.0)];

        // 2% off with 1% tolerance: flagged, watermark untouched by plan
        let actions = plan(std::slice::from_ref(&row), &exchange, 0.01);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ReconcileAction::FlagDivergence {
                ledger_entry,
                exchange_entry,
                ..
            } => {
                assert_eq!(*ledger_entry, 2550.0);
                assert_eq!(*exchange_entry, 2500.0);
            }
            other => panic!("expected divergence flag, got {:?}", other),
        }

        // 0.5% off: inside tolerance, nothing to surface
        let near = open_row("PERP_ETH_USDC", Side::Long, 2512.0, 0.1);
        assert!(plan(std::slice::from_ref(&near), &exchange, 0.01).is_empty());
    }

    #[test]
    fn test_flat_exchange_rows_are_ignored() {
        let actions = plan(&[], &[exchange_pos("PERP_SOL_USDC", 0.0, 50.0)], 0.01);
        assert!(actions.is_empty());
    }
}
