//! Driver classification + recommended actions.
//!
//! GET /kpi/labor/drivers      ranked labor cost drivers
//! GET /kpi/inventory/drivers  ranked inventory cash drivers + actions
//!
//! Classification is pure: fetch the current KPI rows, grade each metric
//! against fixed (or distribution-derived) thresholds, score, and rank.
//! Keeping the grading side-effect free makes every threshold testable
//! without a database.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::error::ApiResult;
use crate::kpi::{
    self, fetch_inventory_anchor, fetch_inventory_category_mix, fetch_inventory_kpis,
    fetch_inventory_slow_movers, fetch_inventory_top_onhand, KpiQuery, OpsDeltaRow, SlowMover,
};
use crate::model::{LocationInfo, Severity, Unit};
use crate::AppState;

const MAX_DRIVERS: usize = 8;

/// One graded metric behind a driver.
#[derive(Debug, Clone, Serialize)]
pub struct DriverMetric {
    pub code: String,
    pub value: Option<f64>,
    pub unit: Unit,
    pub delta: Option<f64>,
}

/// One ranked driver card.
#[derive(Debug, Clone, Serialize)]
pub struct Driver {
    pub code: String,
    pub title: String,
    pub detail: String,
    pub severity: Severity,
    pub score: f64,
    pub metric: DriverMetric,
}

/// A suggested operational follow-up, owned by a named role.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub title: String,
    pub owner: String,
    pub detail: String,
    pub severity: Severity,
}

// ---------------------------------------------------------------------------
// Grading primitives
// ---------------------------------------------------------------------------

/// Linear-interpolation percentile over an ascending-sorted slice.
pub fn percentile(sorted_asc: &[f64], p: f64) -> Option<f64> {
    if sorted_asc.is_empty() {
        return None;
    }
    if sorted_asc.len() == 1 {
        return Some(sorted_asc[0]);
    }
    let p = p.clamp(0.0, 1.0);
    let pos = p * (sorted_asc.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return Some(sorted_asc[lo]);
    }
    let frac = pos - lo as f64;
    Some(sorted_asc[lo] + (sorted_asc[hi] - sorted_asc[lo]) * frac)
}

/// Two-cut threshold grading. With `higher_is_worse` flipped the cuts apply
/// in the opposite direction (lower values are worse).
pub fn sev_by_threshold(value: Option<f64>, warn: f64, risk: f64, higher_is_worse: bool) -> Severity {
    let Some(v) = value.filter(|v| v.is_finite()) else {
        return Severity::Good;
    };
    if higher_is_worse {
        if v >= risk {
            Severity::Risk
        } else if v >= warn {
            Severity::Warn
        } else {
            Severity::Good
        }
    } else if v <= risk {
        Severity::Risk
    } else if v <= warn {
        Severity::Warn
    } else {
        Severity::Good
    }
}

/// Base score by severity plus a capped bump so same-severity drivers still
/// rank by how far they moved. Callers pre-scale the bump for their metric.
pub fn score_from(sev: Severity, bump: Option<f64>) -> f64 {
    let base = match sev {
        Severity::Risk => 100.0,
        Severity::Warn => 60.0,
        Severity::Good => 20.0,
    };
    base + bump
        .filter(|b| b.is_finite())
        .map(|b| b.abs().min(30.0))
        .unwrap_or(0.0)
}

fn pct100(ratio: Option<f64>) -> Option<f64> {
    ratio.filter(|r| r.is_finite()).map(|r| r * 100.0)
}

/// Stable rank: highest score first, original order breaks ties. Top 8 only.
pub fn rank_drivers(mut drivers: Vec<Driver>) -> Vec<Driver> {
    drivers.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    drivers.truncate(MAX_DRIVERS);
    drivers
}

// ---------------------------------------------------------------------------
// Labor drivers
// ---------------------------------------------------------------------------

pub fn build_labor_drivers(k: &OpsDeltaRow) -> Vec<Driver> {
    let mut out = Vec::new();

    let ratio_sev = sev_by_threshold(k.labor_cost_ratio_pct, 29.0, 32.0, true);
    out.push(Driver {
        code: "LABOR_COST_RATIO".to_string(),
        title: "Labor % of revenue".to_string(),
        detail: "Labor cost ratio above target erodes margin directly.".to_string(),
        severity: ratio_sev,
        score: score_from(ratio_sev, k.labor_ratio_delta_pp.map(|d| d * 2.0)),
        metric: DriverMetric {
            code: "LABOR_COST_RATIO".to_string(),
            value: k.labor_cost_ratio_pct,
            unit: Unit::Pct,
            delta: k.labor_ratio_delta_pp,
        },
    });

    let overtime_pct = match (k.overtime_hours, k.labor_hours) {
        (Some(ot), Some(total)) if total > 0.0 => pct100(Some(ot / total)),
        _ => None,
    };
    let ot_sev = sev_by_threshold(overtime_pct, 5.0, 8.0, true);
    out.push(Driver {
        code: "OVERTIME_PCT".to_string(),
        title: "Overtime share of hours".to_string(),
        detail: "Overtime hours carry premium pay; rebalance schedules first.".to_string(),
        severity: ot_sev,
        score: score_from(ot_sev, k.overtime_hours_delta_pct),
        metric: DriverMetric {
            code: "OVERTIME_PCT".to_string(),
            value: overtime_pct,
            unit: Unit::Pct,
            delta: k.overtime_hours_delta_pct,
        },
    });

    let splh_sev = sev_by_threshold(k.sales_per_labor_hour, 55.0, 45.0, false);
    out.push(Driver {
        code: "SALES_PER_LABOR_HOUR".to_string(),
        title: "Sales per labor hour".to_string(),
        detail: "Low productivity means staffing outpaces demand.".to_string(),
        severity: splh_sev,
        score: score_from(splh_sev, k.sales_per_labor_hour_delta_pct),
        metric: DriverMetric {
            code: "SALES_PER_LABOR_HOUR".to_string(),
            value: k.sales_per_labor_hour,
            unit: Unit::Usd,
            delta: k.sales_per_labor_hour_delta_pct,
        },
    });

    let rate_sev = sev_by_threshold(k.avg_hourly_rate, 28.0, f64::INFINITY, true);
    out.push(Driver {
        code: "AVG_HOURLY_RATE".to_string(),
        title: "Average hourly rate".to_string(),
        detail: "A rising blended rate points at shift mix or premium roles.".to_string(),
        severity: rate_sev,
        score: score_from(rate_sev, None),
        metric: DriverMetric {
            code: "AVG_HOURLY_RATE".to_string(),
            value: k.avg_hourly_rate,
            unit: Unit::Usd,
            delta: None,
        },
    });

    let hours_sev = sev_by_threshold(k.labor_hours_delta_pct, 10.0, f64::INFINITY, true);
    out.push(Driver {
        code: "LABOR_HOURS".to_string(),
        title: "Scheduled hours growth".to_string(),
        detail: "Hours growing faster than sales is the earliest warning sign.".to_string(),
        severity: hours_sev,
        score: score_from(hours_sev, k.labor_hours_delta_pct),
        metric: DriverMetric {
            code: "LABOR_HOURS".to_string(),
            value: k.labor_hours,
            unit: Unit::Hours,
            delta: k.labor_hours_delta_pct,
        },
    });

    rank_drivers(out)
}

/// GET /kpi/labor/drivers
pub async fn labor_drivers_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KpiQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let refreshed_at = Utc::now();
    let window = kpi::parse_window(&params.window);
    let as_of = kpi::parse_as_of(&params.as_of)?.unwrap_or(refreshed_at);
    let location_id = kpi::parse_location(&params.location_id)?;

    let delta = kpi::fetch_ops_delta(&state.pool, as_of, window, location_id).await?;
    let (as_of_ts, drivers) = match &delta {
        Some(k) => (k.as_of_ts, build_labor_drivers(k)),
        None => (None, Vec::new()),
    };

    Ok(Json(json!({
        "ok": true,
        "as_of": as_of_ts,
        "refreshed_at": refreshed_at,
        "window": window,
        "location": LocationInfo::from_param(location_id),
        "drivers": drivers,
    })))
}

// ---------------------------------------------------------------------------
// Inventory drivers
// ---------------------------------------------------------------------------

pub struct InventoryInputs<'a> {
    pub kpis: Option<&'a kpi::InventoryKpisRow>,
    pub top_onhand: &'a [kpi::OnhandItem],
    pub category_mix: &'a [kpi::CategoryMixRow],
    pub slow_movers: &'a [SlowMover],
}

pub fn build_inventory_drivers(inputs: &InventoryInputs<'_>) -> Vec<Driver> {
    let mut out = Vec::new();

    if let Some(k) = inputs.kpis {
        let dih_sev = sev_by_threshold(k.dih_days, kpi::WARN_DIH_DAYS, kpi::RISK_DIH_DAYS, true);
        out.push(Driver {
            code: "INV_DIH".to_string(),
            title: "Days inventory on hand".to_string(),
            detail: "Inventory holding beyond the 60-day target ties up cash.".to_string(),
            severity: dih_sev,
            score: score_from(
                dih_sev,
                k.dih_days.map(|d| d - kpi::TARGET_DIH_DAYS as f64),
            ),
            metric: DriverMetric {
                code: "INV_DIH".to_string(),
                value: k.dih_days,
                unit: Unit::Days,
                delta: None,
            },
        });

        let excess_sev = sev_by_threshold(k.excess_cash, 3000.0, 8000.0, true);
        out.push(Driver {
            code: "INV_EXCESS_CASH".to_string(),
            title: "Excess cash in inventory".to_string(),
            detail: "Cash parked above the DIH policy could fund operations.".to_string(),
            severity: excess_sev,
            score: score_from(excess_sev, k.excess_cash.map(|c| c / 1000.0)),
            metric: DriverMetric {
                code: "INV_EXCESS_CASH".to_string(),
                value: k.excess_cash,
                unit: Unit::Usd,
                delta: None,
            },
        });
    }

    // Concentration drivers use the upload's own distribution so thresholds
    // scale with the operation's size, with sane floors for small menus.
    let mut values: Vec<f64> = inputs
        .top_onhand
        .iter()
        .filter_map(|i| i.avg_on_hand_value)
        .filter(|v| v.is_finite())
        .collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let warn_cut = percentile(&values, 0.75).unwrap_or(0.0).max(150.0);
    let risk_cut = percentile(&values, 0.90).unwrap_or(0.0).max(250.0);

    for item in inputs.top_onhand.iter().take(3) {
        let sev = sev_by_threshold(item.avg_on_hand_value, warn_cut, risk_cut, true);
        out.push(Driver {
            code: format!("INV_ITEM_{}", item.menu_item_id.simple()),
            title: format!("High on-hand: {}", item.item_name),
            detail: format!("{} holds an outsized share of on-hand value.", item.category),
            severity: sev,
            score: score_from(sev, item.avg_on_hand_value.map(|v| v / 100.0)),
            metric: DriverMetric {
                code: "INV_ITEM_ONHAND".to_string(),
                value: item.avg_on_hand_value,
                unit: Unit::Usd,
                delta: None,
            },
        });
    }

    if let Some(top_cat) = inputs.category_mix.first() {
        let sev = sev_by_threshold(top_cat.pct_of_total, 20.0, 30.0, true);
        out.push(Driver {
            code: "INV_CATEGORY_MIX".to_string(),
            title: format!("Category concentration: {}", top_cat.category),
            detail: "One category dominating on-hand value concentrates spoilage risk.".to_string(),
            severity: sev,
            score: score_from(sev, top_cat.pct_of_total),
            metric: DriverMetric {
                code: "INV_CATEGORY_MIX".to_string(),
                value: top_cat.pct_of_total,
                unit: Unit::Pct,
                delta: None,
            },
        });
    }

    if let Some(worst) = inputs.slow_movers.first() {
        let sev = sev_by_threshold(worst.slow_score, 0.08, 0.12, true);
        out.push(Driver {
            code: "INV_SLOW_MOVER".to_string(),
            title: format!("Slow mover: {}", worst.item_name),
            detail: "High on-hand value with weak sell-through.".to_string(),
            severity: sev,
            score: score_from(sev, worst.slow_score.map(|s| s * 100.0)),
            metric: DriverMetric {
                code: "INV_SLOW_MOVER".to_string(),
                value: worst.sell_through_pct,
                unit: Unit::Pct,
                delta: None,
            },
        });
    }

    rank_drivers(out)
}

/// Top 3 slow movers become concrete purchasing/kitchen actions.
pub fn build_inventory_actions(slow_movers: &[SlowMover]) -> Vec<Action> {
    slow_movers
        .iter()
        .take(3)
        .enumerate()
        .map(|(i, m)| {
            let severity = sev_by_threshold(m.slow_score, 0.08, 0.12, true);
            if i == 0 {
                Action {
                    title: format!("Pause reorders for {}", m.item_name),
                    owner: "Purchasing".to_string(),
                    detail: format!(
                        "Sell-through {:.0}% against on-hand value of ${:.0}.",
                        m.sell_through_pct.unwrap_or(0.0),
                        m.avg_on_hand_value.unwrap_or(0.0)
                    ),
                    severity,
                }
            } else {
                Action {
                    title: format!("Run down stock of {}", m.item_name),
                    owner: "GM / Kitchen".to_string(),
                    detail: format!(
                        "Feature in specials or prep plans until on-hand value (${:.0}) normalizes.",
                        m.avg_on_hand_value.unwrap_or(0.0)
                    ),
                    severity,
                }
            }
        })
        .collect()
}

/// GET /kpi/inventory/drivers
pub async fn inventory_drivers_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KpiQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let refreshed_at = Utc::now();
    let window = kpi::parse_window(&params.window);
    let location_id = kpi::parse_location(&params.location_id)?;

    let as_of = match kpi::parse_as_of(&params.as_of)? {
        Some(ts) => Some(ts),
        None => fetch_inventory_anchor(&state.pool, location_id).await?,
    };
    let Some(as_of) = as_of else {
        return Ok(Json(json!({
            "ok": true,
            "as_of": null,
            "refreshed_at": refreshed_at,
            "window": window,
            "location": LocationInfo::from_param(location_id),
            "drivers": [],
            "actions": [],
        })));
    };

    let kpis = fetch_inventory_kpis(&state.pool, as_of, window, location_id).await?;
    let top_onhand = fetch_inventory_top_onhand(&state.pool, as_of, window, location_id).await?;
    let category_mix = fetch_inventory_category_mix(&state.pool, as_of, window, location_id).await?;
    let slow_movers = fetch_inventory_slow_movers(&state.pool, as_of, window, location_id).await?;

    let drivers = build_inventory_drivers(&InventoryInputs {
        kpis: kpis.as_ref(),
        top_onhand: &top_onhand,
        category_mix: &category_mix,
        slow_movers: &slow_movers,
    });
    let actions = build_inventory_actions(&slow_movers);

    Ok(Json(json!({
        "ok": true,
        "as_of": as_of,
        "refreshed_at": refreshed_at,
        "window": window,
        "location": LocationInfo::from_param(location_id),
        "drivers": drivers,
        "actions": actions,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn delta_row() -> OpsDeltaRow {
        OpsDeltaRow {
            as_of_ts: None,
            revenue: Some(100_000.0),
            labor_cost: Some(33_000.0),
            labor_cost_delta_pct: Some(4.0),
            labor_hours: Some(1_000.0),
            labor_hours_delta_pct: Some(12.0),
            avg_hourly_rate: Some(33.0),
            labor_cost_ratio_pct: Some(33.0),
            labor_ratio_delta_pp: Some(1.5),
            sales_per_labor_hour: Some(44.0),
            sales_per_labor_hour_delta_pct: Some(-3.0),
            overtime_hours: Some(90.0),
            overtime_hours_delta_pct: Some(6.0),
        }
    }

    #[test]
    fn percentile_interpolates() {
        let v = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&v, 0.0), Some(10.0));
        assert_eq!(percentile(&v, 1.0), Some(40.0));
        assert_eq!(percentile(&v, 0.5), Some(25.0));
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[7.0], 0.9), Some(7.0));
    }

    #[test]
    fn threshold_grading_in_both_directions() {
        assert_eq!(sev_by_threshold(Some(33.0), 29.0, 32.0, true), Severity::Risk);
        assert_eq!(sev_by_threshold(Some(30.0), 29.0, 32.0, true), Severity::Warn);
        assert_eq!(sev_by_threshold(Some(25.0), 29.0, 32.0, true), Severity::Good);
        assert_eq!(sev_by_threshold(Some(40.0), 55.0, 45.0, false), Severity::Risk);
        assert_eq!(sev_by_threshold(Some(50.0), 55.0, 45.0, false), Severity::Warn);
        assert_eq!(sev_by_threshold(Some(60.0), 55.0, 45.0, false), Severity::Good);
        assert_eq!(sev_by_threshold(None, 29.0, 32.0, true), Severity::Good);
    }

    #[test]
    fn score_caps_the_bump() {
        assert_eq!(score_from(Severity::Risk, None), 100.0);
        assert_eq!(score_from(Severity::Warn, Some(-12.0)), 72.0);
        assert_eq!(score_from(Severity::Good, Some(500.0)), 50.0);
    }

    #[test]
    fn labor_drivers_rank_risk_first() {
        let drivers = build_labor_drivers(&delta_row());
        assert!(!drivers.is_empty());
        assert!(drivers.len() <= 8);
        // Ratio is at 33% which crosses the 32% risk cut.
        assert_eq!(drivers[0].code, "LABOR_COST_RATIO");
        assert_eq!(drivers[0].severity, Severity::Risk);
        for pair in drivers.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn ranking_is_stable_for_equal_scores() {
        let mk = |code: &str| Driver {
            code: code.to_string(),
            title: String::new(),
            detail: String::new(),
            severity: Severity::Warn,
            score: 60.0,
            metric: DriverMetric {
                code: code.to_string(),
                value: None,
                unit: Unit::Pct,
                delta: None,
            },
        };
        let ranked = rank_drivers(vec![mk("A"), mk("B"), mk("C")]);
        let codes: Vec<&str> = ranked.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["A", "B", "C"]);
    }

    #[test]
    fn slow_mover_actions_assign_owners() {
        let mover = |name: &str, score: f64| SlowMover {
            menu_item_id: Uuid::new_v4(),
            item_name: name.to_string(),
            category: "Protein".to_string(),
            avg_on_hand_value: Some(900.0),
            sold_qty: Some(4.0),
            sold_revenue: Some(60.0),
            sell_through_pct: Some(3.0),
            slow_score: Some(score),
        };
        let actions = build_inventory_actions(&[
            mover("Wagyu", 0.2),
            mover("Truffle Oil", 0.15),
            mover("Saffron", 0.1),
            mover("Extra", 0.05),
        ]);
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].owner, "Purchasing");
        assert_eq!(actions[1].owner, "GM / Kitchen");
        assert_eq!(actions[0].severity, Severity::Risk);
    }
}
