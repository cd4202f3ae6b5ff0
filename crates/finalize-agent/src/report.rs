//! Cost report over the persisted usage ledger (`cost-report` subcommand).

use std::fmt::Write as _;

use finalize_gates::{DayUsage, UsageLedger};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayRow {
    pub day: String,
    pub tokens: u64,
    pub calls: u64,
    pub cost_usd: f64,
}

/// Per-day usage, newest first, plus totals over the shown days.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostReport {
    pub days: Vec<DayRow>,
    pub total_tokens: u64,
    pub total_calls: u64,
    pub total_cost_usd: f64,
}

impl CostReport {
    /// `limit = None` shows every recorded day.
    pub fn from_ledger(ledger: &UsageLedger, limit: Option<usize>) -> Self {
        let days: Vec<DayRow> = ledger
            .recent(limit)
            .into_iter()
            .map(|(day, DayUsage { tokens, cost_usd, calls })| DayRow {
                day,
                tokens,
                calls,
                cost_usd,
            })
            .collect();
        Self {
            total_tokens: days.iter().map(|d| d.tokens).sum(),
            total_calls: days.iter().map(|d| d.calls).sum(),
            total_cost_usd: days.iter().map(|d| d.cost_usd).sum(),
            days,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Plain-text table for the terminal.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return "No usage recorded.\n".to_string();
        }
        let mut out = String::new();
        let _ = writeln!(out, "{:<12} {:>12} {:>8} {:>12}", "day", "tokens", "calls", "cost_usd");
        for row in &self.days {
            let _ = writeln!(
                out,
                "{:<12} {:>12} {:>8} {:>12.6}",
                row.day, row.tokens, row.calls, row.cost_usd
            );
        }
        let _ = writeln!(
            out,
            "{:<12} {:>12} {:>8} {:>12.6}",
            "total", self.total_tokens, self.total_calls, self.total_cost_usd
        );
        if self.total_tokens > 0 && self.total_cost_usd == 0.0 {
            out.push_str("note: costs are zero; set FINALIZE_INPUT_PRICE_PER_MTOKENS and FINALIZE_OUTPUT_PRICE_PER_MTOKENS to price usage\n");
        }
        out
    }
}
