// Network exposure configurator
//
// Two named inbound rules (primary + secondary port). Presence is checked by exact name
// before creating; nothing here is fatal.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::time::Instant;

use crate::models::report::FirewallOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub port: u16,
    pub protocol: &'static str,
}

impl FirewallRule {
    pub fn tcp(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            protocol: "TCP",
        }
    }
}

/// `"<display> (primary)"` and `"<display> (secondary)"`.
pub fn required_rules(display_name: &str, port: u16, secondary_port: u16) -> Vec<FirewallRule> {
    vec![
        FirewallRule::tcp(format!("{} (primary)", display_name), port),
        FirewallRule::tcp(format!("{} (secondary)", display_name), secondary_port),
    ]
}

#[async_trait]
pub trait FirewallManager: Send + Sync {
    async fn rule_exists(&self, name: &str) -> Result<bool>;
    async fn add_rule(&self, rule: &FirewallRule) -> Result<()>;
}

pub async fn configure_rules(fw: &dyn FirewallManager, rules: &[FirewallRule]) -> FirewallOutcome {
    let started = Instant::now();
    info!(
        "[PHASE: install] [STEP: firewall] configure_rules entered (rules={})",
        rules.len()
    );

    let mut created = Vec::new();
    let mut already_present = Vec::new();
    let mut failures = Vec::new();

    for rule in rules {
        let res = async {
            if fw.rule_exists(&rule.name).await? {
                return Ok::<bool, anyhow::Error>(false);
            }
            fw.add_rule(rule).await?;
            Ok(true)
        }
        .await;

        match res {
            Ok(true) => {
                info!(
                    "[PHASE: install] [STEP: firewall] rule created (name={}, port={}/{})",
                    rule.name, rule.port, rule.protocol
                );
                created.push(rule.name.clone());
            }
            Ok(false) => {
                info!(
                    "[PHASE: install] [STEP: firewall] rule already present (name={})",
                    rule.name
                );
                already_present.push(rule.name.clone());
            }
            Err(e) => {
                let msg = format!("firewall rule '{}' (port {}): {:#}", rule.name, rule.port, e);
                warn!("[PHASE: install] [STEP: firewall] {}", msg);
                failures.push(msg);
            }
        }
    }

    info!(
        "[PHASE: install] [STEP: firewall] configure_rules exit (created={}, present={}, failed={}, duration_ms={})",
        created.len(),
        already_present.len(),
        failures.len(),
        started.elapsed().as_millis()
    );

    if failures.is_empty() {
        FirewallOutcome::Configured {
            created,
            already_present,
        }
    } else {
        FirewallOutcome::Warned { created, failures }
    }
}
