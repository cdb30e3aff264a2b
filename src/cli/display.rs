//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use crate::balancing::Distribution;
use crate::config::ValidationReport;
use crate::deploy::DeploymentResult;
use crate::lifecycle::{DeletionReport, UserOutcome};
use crate::templates::{TemplateMapping, TemplateRecord};

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!(
            "{:width$}",
            header.to_uppercase(),
            width = widths[i]
        ));
    }
    output.push('\n');

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    }

    output
}

// ============================================================================
// Validation display
// ============================================================================

pub fn format_validation_report(report: &ValidationReport, path: &str) -> String {
    let mut output = String::new();

    if report.has_errors() {
        output.push_str(&format!("✗ {} is invalid\n\n", path));
    } else {
        output.push_str(&format!("✓ {} is valid\n", path));
    }
    for error in report.errors() {
        output.push_str(&format!("  error[{}]: {}\n", error.code, error.message));
    }
    for warning in report.warnings() {
        output.push_str(&format!("  warning[{}]: {}\n", warning.code, warning.message));
    }

    output
}

// ============================================================================
// Deployment display
// ============================================================================

/// User, node, password and status of every stand in a batch
pub fn format_deployment_result(result: &DeploymentResult) -> String {
    let rows = result
        .passwords
        .iter()
        .map(|(user, password)| {
            let node = result.placement.get(user).cloned().unwrap_or_default();
            let vms = result
                .vmids
                .get(user)
                .map(|ids| {
                    ids.iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            let status = match result.failures.get(user) {
                Some(reason) => format!("FAILED: {}", reason),
                None => "ok".to_string(),
            };
            vec![user.clone(), node, password.clone(), vms, status]
        })
        .collect();

    let mut output = format_table(&["USER", "NODE", "PASSWORD", "VMS", "STATUS"], rows);
    output.push_str(&format!(
        "\n{} of {} stands created\n",
        result.total() - result.failed_count(),
        result.total()
    ));
    output
}

pub fn format_deletion_report(report: &DeletionReport) -> String {
    let rows = report
        .outcomes
        .iter()
        .map(|(user, outcome)| {
            let status = match outcome {
                UserOutcome::Deleted => "deleted".to_string(),
                UserOutcome::Failed(reason) => format!("FAILED: {}", reason),
            };
            vec![user.clone(), status]
        })
        .collect();

    let mut output = format_table(&["USER", "STATUS"], rows);
    output.push_str(&format!(
        "\n{} deleted, {} failed\n",
        report.deleted_count(),
        report.failed_count()
    ));
    if !report.bridges.removed.is_empty() {
        output.push_str("Removed bridges:\n");
        for (node, bridge) in &report.bridges.removed {
            output.push_str(&format!("  {} on {}\n", bridge, node));
        }
    }
    if !report.bridges.skipped_nodes.is_empty() {
        output.push_str(&format!(
            "Bridge cleanup skipped on: {}\n",
            report.bridges.skipped_nodes.join(", ")
        ));
    }
    output
}

pub fn format_distribution(distribution: &Distribution) -> String {
    let rows = distribution
        .iter()
        .map(|(node, users)| vec![node.clone(), users.len().to_string(), users.join(", ")])
        .collect();
    format_table(&["NODE", "COUNT", "USERS"], rows)
}

// ============================================================================
// Template display
// ============================================================================

pub fn format_template_records(records: &[TemplateRecord]) -> String {
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.original_vmid.to_string(),
                r.node.clone(),
                r.local_vmid.to_string(),
            ]
        })
        .collect();
    format_table(&["TEMPLATE", "NODE", "LOCAL VMID"], rows)
}

pub fn format_template_mapping(mapping: &TemplateMapping, node: &str) -> String {
    let rows = mapping
        .iter()
        .map(|(key, local)| vec![key.to_string(), node.to_string(), local.to_string()])
        .collect();
    format_table(&["SOURCE", "NODE", "LOCAL VMID"], rows)
}
