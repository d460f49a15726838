use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::env;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use money_ledger::allocation::{self, AutoAllocateParams, ConfirmBatchParams, UnallocatedFilter};
use money_ledger::config::BatchConfig;
use money_ledger::{bootstrap, db, period, LedgerConfig, PeriodKey};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "money_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = LedgerConfig::load().context("failed to load configuration")?;

    let mut conn = db::open(&config.database.path)
        .with_context(|| format!("failed to open {}", config.database.path))?;
    info!(path = %config.database.path, "database ready");

    bootstrap(&mut conn, &config.seed)?;

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        None | Some("status") => {}
        Some("auto-allocate") => {
            let report = allocation::auto_allocate(&mut conn, &AutoAllocateParams::from_config(&config.batch))?;
            println!(
                "auto-allocate: scanned {}, suggested {}, skipped {}, errors {}",
                report.scanned,
                report.suggested,
                report.skipped,
                report.errors.len()
            );
        }
        Some("confirm-batch") => {
            let report = allocation::confirm_batch(&mut conn, &ConfirmBatchParams::from_config(&config.batch))?;
            println!(
                "confirm-batch: confirmed {}, skipped {}, errors {}",
                report.confirmed,
                report.skipped,
                report.errors.len()
            );
        }
        Some("lock") => {
            let key = period_arg(&args)?;
            period::lock(&mut conn, key, env::var("USER").ok().as_deref(), None)?;
            println!("🔒 {key} locked");
        }
        Some("unlock") => {
            let key = period_arg(&args)?;
            if period::unlock(&mut conn, key)? {
                println!("🔓 {key} unlocked");
            } else {
                println!("{key} was not locked");
            }
        }
        Some(other) => bail!("unknown command: {other} (status | auto-allocate | confirm-batch | lock YYYY-MM | unlock YYYY-MM)"),
    }

    print_status(&conn, &config.batch)
}

fn period_arg(args: &[String]) -> Result<PeriodKey> {
    let raw = args.get(2).context("period argument required (YYYY-MM)")?;
    raw.parse().with_context(|| format!("invalid period: {raw}"))
}

fn print_status(conn: &Connection, batch: &BatchConfig) -> Result<()> {
    let facts = db::verify_count(conn)?;
    let unallocated = allocation::list_unallocated(
        conn,
        &UnallocatedFilter {
            limit: batch.scan_limit,
            ..UnallocatedFilter::from_config(batch)
        },
    )?;
    let locks = period::list_locks(conn)?;

    println!("💰 Money ledger v{}", money_ledger::VERSION);
    println!("   facts:       {facts}");
    println!("   unallocated: {}", unallocated.len());
    if locks.is_empty() {
        println!("   locked:      none");
    } else {
        let periods: Vec<String> = locks.iter().map(|l| l.period.to_string()).collect();
        println!("   locked:      {}", periods.join(", "));
    }

    Ok(())
}
