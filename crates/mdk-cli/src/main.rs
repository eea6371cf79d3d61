use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mdk_billing::{BranchCode, SequenceDomain};
use std::fs;
use std::path::Path;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "mdk")]
#[command(about = "MediDesk operations CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> site overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Lab-test catalog maintenance
    Catalog {
        #[command(subcommand)]
        cmd: CatalogCmd,
    },

    /// Bill-number sequence inspection
    Seq {
        #[command(subcommand)]
        cmd: SeqCmd,
    },

    /// Report lifecycle inspection
    Report {
        #[command(subcommand)]
        cmd: ReportCmd,
    },

    /// Audit trail utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations. Guardrail: refuses when the database already
    /// holds issued bills unless --yes is provided.
    Migrate {
        /// Acknowledge you are migrating a database that is already billing.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum CatalogCmd {
    /// Import lab tests from CSV (headers: code,name,price,ref_range,unit).
    /// Prices are rupees as decimal strings; rows are validated per line and
    /// rejects are counted, never fatal.
    Import {
        /// Path to the CSV file
        #[arg(long)]
        csv: String,

        /// Actor recorded in the audit trail
        #[arg(long, default_value = "cli")]
        actor: String,
    },
}

#[derive(Subcommand)]
enum SeqCmd {
    /// Read the last allocated value for a branch+domain counter (read-only,
    /// takes no lock, never advances the counter).
    Peek {
        /// Branch code (e.g. PUNE)
        #[arg(long)]
        branch: String,

        /// Sequence domain
        #[arg(long, default_value = "diagnostic")]
        domain: String,
    },
}

#[derive(Subcommand)]
enum ReportCmd {
    /// Print the report lifecycle state for one visit
    Status {
        /// Visit id
        #[arg(long)]
        visit: String,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Export the audit_log table as a hash-chained JSONL file
    Export {
        /// Output path (refused if the file already exists)
        #[arg(long)]
        out: String,
    },

    /// Verify the hash chain of an exported JSONL file
    Verify {
        /// Path to the exported file
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = mdk_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = mdk_db::status(&pool).await?;
                    println!("db_ok={} has_bills_table={}", s.ok, s.has_bills_table);
                }
                DbCmd::Migrate { yes } => {
                    // Guardrail: a schema that already issued bills is, as far
                    // as this tool can tell, a live billing database.
                    let n = mdk_db::count_bills(&pool).await?;
                    if n > 0 && !yes {
                        anyhow::bail!(
                            "REFUSING MIGRATE: database already holds {} issued bill(s). Re-run with: `mdk db migrate --yes`",
                            n
                        );
                    }

                    mdk_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = mdk_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Catalog { cmd } => match cmd {
            CatalogCmd::Import { csv, actor } => {
                let pool = mdk_db::connect_from_env().await?;
                let report = mdk_db::import_lab_tests_csv(
                    &pool,
                    mdk_db::CatalogImportArgs {
                        path: csv.into(),
                        actor,
                    },
                )
                .await?;

                println!("rows_read={}", report.rows_read);
                println!("rows_ok={}", report.rows_ok);
                println!("rows_rejected={}", report.rows_rejected);
                println!("rows_inserted={}", report.rows_inserted);
                println!("rows_updated={}", report.rows_updated);
                println!("rejected_bad_row={}", report.rejects.bad_row);
                println!("rejected_bad_code={}", report.rejects.bad_code);
                println!("rejected_bad_name={}", report.rejects.bad_name);
                println!("rejected_bad_price={}", report.rejects.bad_price);
                println!(
                    "rejected_duplicate_in_batch={}",
                    report.rejects.duplicate_in_batch
                );
            }
        },

        Commands::Seq { cmd } => match cmd {
            SeqCmd::Peek { branch, domain } => {
                // Validate inputs before touching the database.
                let branch = BranchCode::new(&branch)?;
                let domain = SequenceDomain::parse_key(domain.trim())?;

                let pool = mdk_db::connect_from_env().await?;
                let last = mdk_db::peek_sequence(&pool, &branch, domain).await?;

                println!("branch={} domain={}", branch, domain.as_key());
                match last {
                    Some(n) => {
                        println!("last_value={n}");
                        println!("next_value={}", n + 1);
                    }
                    None => {
                        println!("last_value=none");
                        println!("next_value=1");
                    }
                }
            }
        },

        Commands::Report { cmd } => match cmd {
            ReportCmd::Status { visit } => {
                let visit_id = Uuid::parse_str(&visit).context("invalid visit uuid")?;

                let pool = mdk_db::connect_from_env().await?;
                let d = mdk_db::fetch_visit(&pool, visit_id, None).await?;

                println!("visit_id={}", d.visit_id);
                println!("branch_code={}", d.branch_code);
                println!("patient={}", d.patient.full_name);
                println!("bill_number={}", d.bill.bill_number);
                println!("net_paise={}", d.bill.net_paise);
                println!("test_orders={}", d.test_orders.len());
                println!("current_version={}", d.report.current_version);
                println!("status={}", d.report.status);
                println!("finalized_at={}", opt_dt(&d.report.finalized_at));
            }
        },

        Commands::Audit { cmd } => match cmd {
            AuditCmd::Export { out } => {
                if Path::new(&out).exists() {
                    anyhow::bail!(
                        "refusing to export over existing file {out}; appending would break the hash chain"
                    );
                }

                let pool = mdk_db::connect_from_env().await?;

                let mut writer = mdk_audit::ChainWriter::new(&out)?;
                // Claim the path so a rowless export still yields a file
                // that verifies as an empty chain.
                fs::write(&out, b"").with_context(|| format!("create export file {out}"))?;

                let mut after_id: i64 = 0;
                let mut total: u64 = 0;
                loop {
                    let page = mdk_db::fetch_audit_page(&pool, after_id, 500).await?;
                    if page.is_empty() {
                        break;
                    }
                    for row in page {
                        after_id = row.audit_id;
                        writer.append(mdk_audit::AuditRecord {
                            seq: row.audit_id,
                            at: row.at,
                            branch_code: row.branch_code,
                            actor: row.actor,
                            action: row.action,
                            entity: row.entity,
                            entity_id: row.entity_id,
                            detail: row.detail,
                            hash_prev: None,
                            hash_self: None,
                        })?;
                        total += 1;
                    }
                }

                println!("audit_exported=true path={out} records={total}");
                if let Some(h) = writer.last_hash() {
                    println!("chain_head={h}");
                }
            }

            AuditCmd::Verify { path } => match mdk_audit::verify_chain(&path)? {
                mdk_audit::VerifyResult::Valid { lines } => {
                    println!("chain_valid=true lines={lines}");
                }
                mdk_audit::VerifyResult::Broken { line, reason } => {
                    anyhow::bail!("chain_broken=true line={line} reason={reason}");
                }
            },
        },
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn opt_dt(dt: &Option<chrono::DateTime<chrono::Utc>>) -> String {
    dt.as_ref()
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| "".to_string())
}
