//! Table output for reports.

use campaign_engine::{
    AllocationSnapshot, AllocationStatus, BudgetAllocation, CycleReport, ExperimentResult,
    ExperimentTest, FraudAlert, Insight, Money, PacingReport, Severity, roi, rollup,
};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    table
}

fn money(amount: Money) -> String {
    format!("${amount:.2}")
}

fn pct(value: f64) -> String {
    format!("{value:.1}%")
}

/// Print every section of a cycle report.
pub fn print_cycle_report(report: &CycleReport) {
    println!(
        "Campaign {} | cycle {} | {} .. {}",
        report.campaign_id,
        report.cycle_id,
        report.window.start.format("%Y-%m-%d %H:%M"),
        report.window.end.format("%Y-%m-%d %H:%M"),
    );
    if report.skipped > 0 {
        println!("Skipped {} events without channel metadata", report.skipped);
    }
    println!();

    print_channels(report);
    print_alerts(&report.fraud.alerts);
    println!(
        "Bot traffic: {} of {} clicks ({}) from {} unique IPs",
        report.fraud.bot_traffic.bot_clicks,
        report.fraud.total_clicks,
        pct(report.fraud.bot_traffic.bot_rate_pct),
        report.fraud.unique_ips,
    );
    println!();

    print_attribution(report);
    print_allocations(&report.allocations);
    if let Some(pacing) = &report.pacing {
        print_pacing(pacing);
    }
    print_experiments(&report.experiments);
    print_insights(&report.insights);

    if !report.warnings.is_empty() {
        println!("Warnings:");
        for warning in &report.warnings {
            println!("  [{}] {}", warning.kind.as_str(), warning.message);
        }
    }
}

fn print_channels(report: &CycleReport) {
    let totals = rollup(&report.aggregates);
    if totals.is_empty() {
        println!("No channel activity in this window.");
        println!();
        return;
    }

    let mut t = table(&["Channel", "Clicks", "Conversions", "Revenue", "Spend", "ROI"]);
    for row in totals {
        t.add_row(vec![
            Cell::new(&row.channel_id),
            Cell::new(row.clicks),
            Cell::new(row.conversions),
            Cell::new(money(row.revenue)),
            Cell::new(money(row.spend)),
            Cell::new(format!("{:.2}", roi(row.revenue, row.spend))),
        ]);
    }
    println!("{t}");
    println!();
}

/// Print fraud alerts, open or resolved.
pub fn print_alerts(alerts: &[FraudAlert]) {
    if alerts.is_empty() {
        println!("No fraud alerts.");
        println!();
        return;
    }

    let mut t = table(&["Alert", "Source IP", "Severity", "Clicks", "Est. loss", "State"]);
    for alert in alerts {
        let severity = match alert.severity {
            Severity::Critical => Cell::new(alert.severity.as_str()).fg(Color::Red),
            Severity::High => Cell::new(alert.severity.as_str()).fg(Color::Yellow),
        };
        t.add_row(vec![
            Cell::new(alert.id),
            Cell::new(&alert.source_key),
            severity,
            Cell::new(alert.click_count),
            Cell::new(money(alert.estimated_loss)),
            Cell::new(if alert.resolved { "resolved" } else { "open" }),
        ]);
    }
    println!("{t}");
    println!();
}

fn print_attribution(report: &CycleReport) {
    let Some(primary) = report.primary_attribution() else {
        return;
    };
    if primary.insufficient_data {
        let suggestion = primary
            .recommended_model
            .map_or_else(String::new, |m| format!(", try {}", m.as_str()));
        println!(
            "Attribution ({}): not enough clicks or revenue{suggestion}",
            primary.model.as_str()
        );
        println!();
        return;
    }

    let mut t = table(&["Channel", "Credit share"]);
    for result in &primary.results {
        t.add_row(vec![
            Cell::new(&result.channel_id),
            Cell::new(pct(result.credit_share * 100.0)),
        ]);
    }
    println!("Attribution ({})", primary.model.as_str());
    println!("{t}");
    println!();
}

/// Print one set of budget recommendations.
pub fn print_allocations(allocations: &[BudgetAllocation]) {
    if allocations.is_empty() {
        println!("No budget recommendations.");
        println!();
        return;
    }

    let mut t = table(&["Rank", "Channel", "ROI", "Previous", "Recommended", "Status"]);
    for a in allocations {
        let status = Cell::new(a.status.as_str());
        let status = match a.status {
            AllocationStatus::Paused => status.fg(Color::Red),
            AllocationStatus::Scaled => status.fg(Color::Green),
            AllocationStatus::Active => status,
        };
        t.add_row(vec![
            Cell::new(a.rank),
            Cell::new(&a.channel_id),
            Cell::new(format!("{:.2}", a.roi)),
            Cell::new(money(a.previous_budget)),
            Cell::new(money(a.recommended_budget)),
            status,
        ]);
    }
    let total: Money = allocations.iter().map(|a| a.recommended_budget).sum();
    println!("{t}");
    println!("Recommended total: {}", money(total));
    println!();
}

fn print_pacing(pacing: &PacingReport) {
    println!(
        "Pacing: {} | spent {} over {} days, {} days left | pace {}/day, ideal {}/day",
        pacing.status.as_str(),
        money(pacing.spent_so_far),
        pacing.days_elapsed,
        pacing.days_remaining,
        money(pacing.current_pace),
        money(pacing.ideal_daily_budget),
    );
    for recommendation in &pacing.recommendations {
        println!("  - {recommendation}");
    }
    println!();
}

/// Print evaluations of running tests.
pub fn print_experiments(results: &[ExperimentResult]) {
    for result in results {
        println!("Test {}: {}", result.test_id, result.message);
        if result.insufficient_data {
            println!();
            continue;
        }

        let mut t = table(&["Variant", "Visitors", "Conversions", "Rate", "Lift", "Confidence"]);
        for v in &result.variants {
            let name = if v.is_control {
                format!("{} (control)", v.variant_id)
            } else {
                v.variant_id.to_string()
            };
            let mut confidence = Cell::new(pct(v.confidence));
            if v.significant {
                confidence = confidence.fg(Color::Green);
            }
            t.add_row(vec![
                Cell::new(name),
                Cell::new(v.visitors),
                Cell::new(v.conversions),
                Cell::new(pct(v.conversion_rate * 100.0)),
                Cell::new(pct(v.lift * 100.0)),
                confidence,
            ]);
        }
        println!("{t}");
        println!();
    }
}

fn print_insights(insights: &[Insight]) {
    if insights.is_empty() {
        return;
    }
    println!("Insights:");
    for (i, insight) in insights.iter().enumerate() {
        println!(
            "  {}. {} [{}, impact {:.0}]",
            i + 1,
            insight.title,
            insight.action.as_str(),
            insight.impact_score,
        );
        println!("     {}", insight.description);
    }
    println!();
}

/// Print stored allocation snapshots, newest first.
pub fn print_history(history: &[AllocationSnapshot]) {
    if history.is_empty() {
        println!("No allocation history.");
        println!();
        return;
    }
    for snapshot in history {
        println!(
            "Cycle {} at {}",
            snapshot.cycle_id,
            snapshot.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        print_allocations(&snapshot.allocations);
    }
}

/// Print the tests of a campaign.
pub fn print_tests(tests: &[ExperimentTest]) {
    if tests.is_empty() {
        println!("No tests.");
        return;
    }

    let mut t = table(&["Test", "Name", "Status", "Winner", "Created"]);
    for test in tests {
        t.add_row(vec![
            Cell::new(&test.id),
            Cell::new(&test.name),
            Cell::new(test.status.as_str()),
            Cell::new(
                test.winner_variant_id
                    .as_ref()
                    .map_or_else(|| "-".to_string(), ToString::to_string),
            ),
            Cell::new(test.created_at.format("%Y-%m-%d")),
        ]);
    }
    println!("{t}");
}
