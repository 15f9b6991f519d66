use colored::Colorize;

use crate::broker::classify_health;
use crate::model::{
    ApprovalMode, AuditEntry, AuditResult, HealthState, PendingRequest, ScopePolicy,
};

// ── Palette ──────────────────────────────────────────────────────────────────
// Consistent color vocabulary used across every command.
//
//   heading   – bold cyan   (section titles)
//   label     – bold        (field names / keys)
//   value     – normal      (field values)
//   dim       – dimmed      (secondary info, hints)
//   ok        – green       (healthy / success)
//   warn      – yellow      (needs attention)
//   bad       – red         (dead / denied)

/// Print a section heading.
pub fn heading(text: &str) {
    println!("{}", text.bold().cyan());
}

/// Format a label: value line (indented).
pub fn kv(label: &str, value: &str) {
    println!("  {} {}", format!("{}:", label).bold(), value);
}

/// Format a label: value line where the value is dimmed.
pub fn kv_dim(label: &str, value: &str) {
    println!("  {} {}", format!("{}:", label).bold(), value.dimmed());
}

/// Print a count summary line.
pub fn summary(count: usize, noun: &str) {
    let plural = if count == 1 { "" } else { "s" };
    println!("{}", format!("{} {}{}", count, noun, plural).dimmed());
}

// ── Scopes ───────────────────────────────────────────────────────────────────

pub fn print_policies(policies: &[ScopePolicy], recent_audit: &[AuditEntry]) {
    heading("Scopes");
    if policies.is_empty() {
        println!("{}", "  no scopes configured".dimmed());
        return;
    }

    for policy in policies {
        let marker = if policy.priority == 1 {
            " MAIN".bold().green().to_string()
        } else {
            String::new()
        };
        println!(
            "  {}. {}{}",
            policy.priority,
            policy.scope.bold(),
            marker
        );
        kv("service", &policy.service_name);
        kv("mode", mode_label(policy.approval_mode));
        kv("type", policy.credential_type.label());
        if policy.allowed_domains.is_empty() {
            kv_dim("domains", "any");
        } else {
            kv("domains", &policy.allowed_domains.join(", "));
        }
        kv("secret", if policy.has_secret { "yes" } else { "no" });
        if !policy.preferred_for.is_empty() {
            kv_dim("tags", &policy.preferred_for.join(", "));
        }
        if !policy.is_enabled {
            kv("state", &"disabled".yellow().to_string());
        }
        kv("health", &format_health(derive_health(&policy.scope, recent_audit)));
        println!();
    }
    summary(policies.len(), "scope");
}

fn mode_label(mode: ApprovalMode) -> &'static str {
    match mode {
        ApprovalMode::Auto => "auto",
        ApprovalMode::Manual => "manual",
        ApprovalMode::Pending => "pending",
    }
}

fn format_health(health: HealthState) -> String {
    match health {
        HealthState::Healthy => "healthy".green().to_string(),
        HealthState::Dead => "dead".red().to_string(),
        HealthState::Unreachable => "unreachable".yellow().to_string(),
        HealthState::Unknown => "unknown".dimmed().to_string(),
    }
}

/// Passive health: derived from the newest audit entry for the scope, never
/// from a live probe. Approved entries carry the upstream status in their
/// detail line ("Proxied GET … → 200").
pub fn derive_health(scope: &str, recent_audit: &[AuditEntry]) -> HealthState {
    let Some(entry) = recent_audit.iter().find(|e| e.scope == scope) else {
        return HealthState::Unknown;
    };
    match entry.result {
        AuditResult::Approved => {
            let Some(status) = entry
                .detail
                .as_deref()
                .and_then(|d| d.rsplit_once("→ "))
                .and_then(|(_, tail)| tail.trim().parse::<u16>().ok())
            else {
                return HealthState::Unknown;
            };
            classify_health(status, None)
        }
        AuditResult::Denied => HealthState::Unknown,
        AuditResult::Error => HealthState::Unreachable,
    }
}

// ── Pending requests ─────────────────────────────────────────────────────────

pub fn print_pending(pending: &[PendingRequest]) {
    heading("Pending requests");
    if pending.is_empty() {
        println!("{}", "  none".dimmed());
        return;
    }
    for request in pending {
        println!("  {}", request.id.bright_cyan());
        kv("scope", &request.scope);
        kv("host", &request.requesting_host);
        kv_dim("reason", &request.reason);
        println!();
    }
    summary(pending.len(), "pending request");
}
