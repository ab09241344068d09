use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;

use family_rewards::rewards::accrual::AccrualEngine;
use family_rewards::rewards::config::{self, RewardsConfig, EXAMPLE_CONFIG};
use family_rewards::rewards::exemption::ExemptionManager;
use family_rewards::rewards::ledger::{EntryKind, PointsLedger};
use family_rewards::rewards::pairing::PairingService;
use family_rewards::rewards::redemption::{self, RedemptionError, RedemptionService};
use family_rewards::rewards::session::UsageSession;
use family_rewards::rewards::storage;

/// Initialize a new rewards configuration file
pub fn init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            config_path.display()
        );
    }

    std::fs::write(config_path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

    println!("✓ Created rewards configuration file: {}", config_path.display());
    println!("\nEdit this file to set up your children, their learning apps,");
    println!("and how points convert into reward time.");
    Ok(())
}

/// Show balances, today's accrual, and active reward windows
pub async fn status(config_path: &Path, child: Option<&str>) -> Result<()> {
    let config = config::load_config(config_path)?;
    let ledger = open_ledger().await?;
    let manager = open_windows(&config).await?;

    println!("\n=== Family Rewards Status ===\n");

    for profile in config
        .children
        .iter()
        .filter(|c| child.is_none_or(|id| c.id == id))
    {
        println!("{} ({}):", profile.name, profile.id);
        println!("  Balance: {} points", ledger.balance(&profile.id, None).await);
        println!("  Earned today: {} points", ledger.today_accrual(&profile.id).await);

        let balances = ledger.balances(&profile.id).await;
        if !balances.is_empty() {
            println!("  Per app:");
            let mut apps: Vec<_> = balances.into_iter().collect();
            apps.sort();
            for (app, points) in apps {
                println!("    {}: {} points", app, points);
            }
        }

        match manager.get_active_window(&profile.id).await {
            Some(window) => {
                println!(
                    "  Reward window: {} of {} seconds remaining (until {})",
                    window.remaining_seconds(),
                    window.duration_seconds,
                    window.end_time().format("%H:%M:%S")
                );
            }
            None => println!("  Reward window: none"),
        }

        if !profile.learning_apps.is_empty() {
            println!("  Learning apps: {}", profile.learning_apps.join(", "));
        }
        println!();
    }

    Ok(())
}

/// Record a finished learning-app session and award its points
pub async fn accrue(
    config_path: &Path,
    child: &str,
    app: Option<&str>,
    started: &str,
    last_activity: &str,
    ended: Option<&str>,
) -> Result<()> {
    let config = config::load_config(config_path)?;
    require_child(&config, child)?;

    if let (Some(app), Some(profile)) = (app, config.child(child)) {
        if !profile.learning_apps.is_empty() && !profile.learning_apps.iter().any(|a| a == app) {
            println!(
                "Warning: '{}' is not in {}'s learning apps; recording anyway",
                app, profile.name
            );
        }
    }

    let started = parse_timestamp(started)?;
    let last_activity = parse_timestamp(last_activity)?;
    let ended = match ended {
        Some(value) => parse_timestamp(value)?,
        None => Utc::now(),
    };

    let ledger = open_ledger().await?;
    let engine = AccrualEngine::new();
    replay_today(&engine, &ledger, child).await;

    let mut session = UsageSession::start(child, app.map(str::to_string), started);
    session.touch(last_activity);
    let (session, awarded) = engine.end_session(session, &config.points, ended).await;

    if awarded > 0 {
        ledger
            .record_accrual(child, session.app_id.clone(), awarded, Some(ended))
            .await;
        ledger.save(&storage::ledger_path()?).await?;
    }

    println!("✓ Session recorded for {}", child);
    println!("  Points awarded: {}", awarded);
    println!(
        "  Earned today: {} / {} points",
        engine.today_points(child, None).await,
        config.points.daily_cap_points
    );
    Ok(())
}

/// Spend points on a reward-time window
pub async fn redeem(config_path: &Path, child: &str, points: i64, app: Option<&str>) -> Result<()> {
    let config = config::load_config(config_path)?;
    require_child(&config, child)?;

    let ledger = open_ledger().await?;
    let manager = open_windows(&config).await?;

    // Admission is checked before the ledger is touched, so a blocked
    // window never costs points.
    if !manager.can_start_exemption(child).await {
        anyhow::bail!("A reward window is already active for {}", child);
    }

    let service = RedemptionService::new(ledger.clone());
    let window = service
        .redeem(child, points, &config.redemption, app)
        .await?;

    manager.start_exemption(window.clone(), None).await?;

    ledger.save(&storage::ledger_path()?).await?;
    manager.save(&storage::windows_path()?).await?;

    println!("✓ Redeemed {} points for {}", points, child);
    println!(
        "  Reward window: {:.1} minutes (until {})",
        redemption::calculate_minutes(points, &config.redemption),
        window.end_time().format("%H:%M:%S")
    );
    println!(
        "  Remaining balance: {} points",
        ledger.balance(child, None).await
    );
    Ok(())
}

/// Manually adjust a child's balance
pub async fn adjust(
    config_path: &Path,
    child: &str,
    points: i64,
    reason: &str,
    app: Option<&str>,
) -> Result<()> {
    let config = config::load_config(config_path)?;
    require_child(&config, child)?;

    let ledger = open_ledger().await?;
    ledger
        .record_adjustment(child, app.map(str::to_string), points, reason, None)
        .await;
    ledger.save(&storage::ledger_path()?).await?;

    println!("✓ Adjusted {} by {} points ({})", child, points, reason);
    println!(
        "  New balance: {} points",
        ledger.balance(child, None).await
    );
    Ok(())
}

/// Show recent ledger entries and the audit trail
pub async fn history(config_path: &Path, child: &str, limit: usize) -> Result<()> {
    let config = config::load_config(config_path)?;
    require_child(&config, child)?;

    let ledger = open_ledger().await?;
    let entries = ledger.entries(child, Some(limit)).await;

    println!("\n=== Ledger for {} ===\n", child);
    if entries.is_empty() {
        println!("No entries");
    }
    for entry in &entries {
        let kind = match entry.kind {
            EntryKind::Accrual => "accrual",
            EntryKind::Redemption => "redemption",
            EntryKind::Adjustment => "adjustment",
        };
        println!(
            "  {}  {:>6}  {:<10}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.amount,
            kind,
            entry.app_id.as_deref().unwrap_or("-")
        );
    }

    let audit = ledger.audit_log(child).await;
    if !audit.is_empty() {
        println!("\nAudit trail:");
        for record in &audit {
            let mut details: Vec<_> = record
                .details
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            details.sort();
            println!(
                "  {}  {}  {}",
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.action,
                details.join(" ")
            );
        }
    }
    println!();
    Ok(())
}

/// Generate a pairing code for a child
pub async fn pair_generate(config_path: &Path, child: &str, ttl_minutes: i64) -> Result<()> {
    let config = config::load_config(config_path)?;
    require_child(&config, child)?;

    let service = open_pairings(&config).await?;
    let code = service.generate_pairing_code(child, ttl_minutes).await?;

    println!("✓ Pairing code for {}: {}", child, code.code);
    println!(
        "  Valid until {} ({} minutes)",
        code.expires_at.format("%H:%M:%S"),
        ttl_minutes
    );
    println!("  Enter this code on the child's device to pair it.");
    Ok(())
}

/// Consume a pairing code on a device
pub async fn pair_consume(config_path: &Path, code: &str, device: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let service = open_pairings(&config).await?;

    let pairing = service.consume_pairing_code(code, device).await?;
    service.save(&storage::pairings_path()?).await?;

    println!("✓ Device {} paired to {}", pairing.device_id, pairing.child_id);
    Ok(())
}

/// Show the pairing for a device
pub async fn pair_show(config_path: &Path, device: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let service = open_pairings(&config).await?;

    match service.get_pairing(device).await {
        Some(pairing) => {
            println!("Device {}:", device);
            println!("  Child: {}", pairing.child_id);
            println!(
                "  Paired at: {}",
                pairing.paired_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        None => println!("Device {} is not paired", device),
    }
    Ok(())
}

/// Revoke a device's pairing
pub async fn pair_revoke(config_path: &Path, device: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let service = open_pairings(&config).await?;

    let pairing = service.revoke_pairing(device).await?;
    service.save(&storage::pairings_path()?).await?;

    println!("✓ Unpaired device {} from {}", device, pairing.child_id);
    Ok(())
}

/// Fail with the typed error when a child is not in the configured roster.
fn require_child(config: &RewardsConfig, child_id: &str) -> Result<()> {
    if config.child(child_id).is_none() {
        return Err(RedemptionError::ChildNotFound(child_id.to_string()).into());
    }
    Ok(())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp (expected RFC 3339): {}", value))
}

async fn open_ledger() -> Result<PointsLedger> {
    let ledger = PointsLedger::new();
    let path = storage::ledger_path()?;
    if path.exists() {
        ledger.load(&path).await?;
    }
    Ok(ledger)
}

async fn open_windows(config: &RewardsConfig) -> Result<ExemptionManager> {
    let manager = ExemptionManager::new(config.exemption_policy);
    let path = storage::windows_path()?;
    if path.exists() {
        manager.restore_from_persistence(&path).await?;
    }
    Ok(manager)
}

async fn open_pairings(config: &RewardsConfig) -> Result<PairingService> {
    let service = PairingService::new(config.pairing);
    let path = storage::pairings_path()?;
    if path.exists() {
        service.load(&path).await?;
    }
    Ok(service)
}

/// Rebuild today's accrual counters from the ledger so the daily cap keeps
/// holding across invocations.
async fn replay_today(engine: &AccrualEngine, ledger: &PointsLedger, child: &str) {
    let mut per_scope: HashMap<Option<String>, (i64, DateTime<Utc>)> = HashMap::new();
    for entry in ledger.today_entries(child).await {
        if entry.kind == EntryKind::Accrual {
            let slot = per_scope
                .entry(entry.app_id.clone())
                .or_insert((0, entry.timestamp));
            slot.0 += entry.amount;
        }
    }
    for (app, (points, at)) in per_scope {
        engine.prime(child, app.as_deref(), at, points).await;
    }
}
