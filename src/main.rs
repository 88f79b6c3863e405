use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use gradebook_promotion::averaging;
use gradebook_promotion::models::{ActiveRule, ClassInfo, EvaluationRecord};
use gradebook_promotion::promotion::{self, Placement, PromotionSummary, StudentOutcome};
use gradebook_promotion::rules::{self, RuleFile};

mod config;
mod db;
mod report;

#[derive(Parser)]
#[command(name = "gradebook-promotion")]
#[command(about = "Grade averages, bulletins and year-end promotion decisions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small demo school
    Seed,
    /// Import evaluations from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Print a student's subject and general averages
    Transcript {
        #[arg(long)]
        student: i64,
        /// Restrict to one school year; all years otherwise
        #[arg(long)]
        year: Option<i64>,
        #[arg(long)]
        rules: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Decide promotion for every student of a class
    Promote {
        #[arg(long)]
        class: i64,
        #[arg(long)]
        year: i64,
        /// JSON rule file; its weights always apply, its rule fields only
        /// when no stored rule is active
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Write destination enrollments for promoted students
        #[arg(long, requires = "to_year")]
        apply: bool,
        #[arg(long)]
        to_year: Option<i64>,
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown class bulletin
    Report {
        #[arg(long)]
        class: i64,
        #[arg(long)]
        year: i64,
        #[arg(long)]
        rules: Option<PathBuf>,
        #[arg(long, default_value = "bulletin.md")]
        out: PathBuf,
    },
}

fn load_rule_file(path: Option<&Path>) -> anyhow::Result<Option<RuleFile>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rule file {}", path.display()))?;
    let file = RuleFile::from_json(&contents)
        .with_context(|| format!("failed to parse rule file {}", path.display()))?;
    Ok(Some(file))
}

async fn load_active_rule(pool: &PgPool, rules_path: Option<&Path>) -> anyhow::Result<ActiveRule> {
    let stored = match db::fetch_active_rule(pool).await {
        Ok(stored) => stored,
        Err(err) => {
            warn!(error = %err, "promotion rule store unavailable");
            None
        }
    };

    let from_file = match (rules_path, load_rule_file(rules_path)?) {
        (Some(path), Some(file)) => Some((path, file)),
        _ => None,
    };

    Ok(rules::resolve_active_rule(stored, from_file)?)
}

async fn evaluate_class(
    pool: &PgPool,
    class_id: i64,
    school_year_id: i64,
    rules_path: Option<&Path>,
) -> anyhow::Result<(ClassInfo, ActiveRule, Vec<StudentOutcome>)> {
    let active = load_active_rule(pool, rules_path).await?;
    let class = db::fetch_class(pool, class_id).await?;
    let classes = db::fetch_classes(pool).await?;
    let subjects = db::fetch_subjects(pool).await?;
    let roster = db::fetch_roster(pool, class_id, school_year_id).await?;

    let student_ids: Vec<i64> = roster.iter().map(|entry| entry.student_id).collect();
    let mut by_student: HashMap<i64, Vec<EvaluationRecord>> = HashMap::new();
    for record in db::fetch_class_evaluations(pool, &student_ids, school_year_id).await? {
        by_student.entry(record.student_id).or_default().push(record);
    }

    let placement = Placement {
        current_class: &class,
        classes: &classes,
    };
    let outcomes = promotion::evaluate_class(&roster, &active.rule, &placement, |entry| {
        let records = by_student
            .get(&entry.student_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        averaging::build_annual_result(
            entry.student_id,
            school_year_id,
            records,
            &subjects,
            &active.weights,
        )
    });

    info!(
        class = %class.name,
        school_year_id,
        students = outcomes.len(),
        "evaluated class"
    );
    Ok((class, active, outcomes))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_tracing();
    let cli = Cli::parse();
    let app_config = config::AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(app_config.max_connections)
        .connect(&app_config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} evaluations from {}.", csv.display());
        }
        Commands::Transcript {
            student,
            year,
            rules,
            json,
        } => {
            let rule_file = load_rule_file(rules.as_deref())?;
            let (weights, weights_provenance) = rules::resolve_weights(
                rules.as_deref().zip(rule_file.as_ref()),
            )?;
            let subjects = db::fetch_subjects(&pool).await?;
            let records = db::fetch_evaluations(&pool, student, year).await?;
            let results = averaging::annual_results(student, &records, &subjects, &weights);

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
                return Ok(());
            }

            if results.is_empty() {
                println!("No evaluations found for student {student}.");
                return Ok(());
            }

            println!("Evaluation weights: {weights} ({weights_provenance})");
            for result in &results {
                println!("School year {}:", result.school_year_id);
                for subject in &result.subject_averages {
                    println!(
                        "- {} (coef {}): S1 {} S2 {} annual {}",
                        subject.subject_name,
                        subject.coefficient,
                        report::format_average(subject.semester1_average),
                        report::format_average(subject.semester2_average),
                        report::format_average(subject.annual_average)
                    );
                }
                match result.general_average {
                    Some(average) => println!("General average {average:.2}"),
                    None => println!("General average not computable"),
                }
            }
        }
        Commands::Promote {
            class,
            year,
            rules,
            apply,
            to_year,
            json,
        } => {
            let (class, active, outcomes) =
                evaluate_class(&pool, class, year, rules.as_deref()).await?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "class": class,
                        "rule": active,
                        "outcomes": outcomes,
                    }))?
                );
            } else {
                println!(
                    "{}: minimum average {:.2} ({})",
                    class.name, active.rule.minimum_average, active.provenance
                );
                println!(
                    "Evaluation weights: {} ({})",
                    active.weights, active.weights_provenance
                );
                if let Some(path) = &active.ignored_rule_file {
                    println!(
                        "Rule fields of {} ignored: {} takes precedence.",
                        path.display(),
                        active.provenance
                    );
                }
                for outcome in &outcomes {
                    println!(
                        "- {} ({}): {}",
                        outcome.student_name,
                        report::format_average(outcome.result.general_average),
                        report::describe_decision(&outcome.decision)
                    );
                }
                let summary = PromotionSummary::tally(&outcomes);
                println!(
                    "{} promoted, {} held back, {} not evaluable, {} need manual intervention.",
                    summary.promoted,
                    summary.held_back,
                    summary.not_evaluable,
                    summary.manual_intervention
                );
            }

            if apply {
                let to_year = to_year.context("--apply requires --to-year")?;
                let run_id = Uuid::new_v4();
                let mut applied = 0usize;

                for outcome in &outcomes {
                    let promotion::PromotionDecision::Promoted {
                        general_average, ..
                    } = &outcome.decision
                    else {
                        continue;
                    };
                    let Some(destination) = outcome.decision.destination_class() else {
                        continue;
                    };

                    let request = db::TransferRequest {
                        run_id,
                        student_id: outcome.student_id,
                        enrollment_id: outcome.enrollment_id,
                        from_class: &class,
                        to_class: destination,
                        from_school_year_id: year,
                        to_school_year_id: to_year,
                        general_average: *general_average,
                        disable_source_enrollment: active.rule.disable_year_after_transfer,
                    };
                    if db::apply_transfer(&pool, &request).await? {
                        applied += 1;
                    } else {
                        warn!(
                            student_id = outcome.student_id,
                            to_year, "student already enrolled for the target year"
                        );
                    }
                }

                info!(%run_id, applied, "applied promotions");
                println!("Applied {applied} transfers (run {run_id}).");
            }
        }
        Commands::Report {
            class,
            year,
            rules,
            out,
        } => {
            let (class, active, outcomes) =
                evaluate_class(&pool, class, year, rules.as_deref()).await?;
            let report = report::build_report(
                &class,
                year,
                chrono::Utc::now().date_naive(),
                &active,
                &outcomes,
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
