//! Tally CLI - Cascading, cost-aware transaction categorization
//!
//! Usage:
//!   tally init                          Initialize database and default categories
//!   tally rules add Dining 'STARBUCKS*' Add a merchant rule
//!   tally categorize batch --max-cost 1 Categorize uncategorized transactions
//!   tally feedback record 42 --category Groceries
//!   tally status                        Backend health and remaining budget

mod cli;
mod commands;


use anyhow::Result;
use clap::Parser;
use tally_core::categorize::usage;
use tally_core::Pipeline;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db, cli.org),
        Commands::Prompts => commands::cmd_prompts_list(),
        command => {
            let db = commands::open_db(&cli.db)?;
            let config = commands::load_config(cli.config.as_deref())?;

            // Rule and pattern usage counters are written by a background task
            let (recorder, updater) = usage::channel(db.clone());
            let stats_task = updater.spawn();

            let pipeline = commands::build_pipeline(&db, config, cli.backend, recorder)?;
            let result = run(command, &pipeline, cli.org).await;

            drop(pipeline);
            let applied = stats_task.await?;
            debug!(applied, "Usage statistics flushed");

            result
        }
    }
}

async fn run(command: Commands, pipeline: &Pipeline, org: i64) -> Result<()> {
    match command {
        Commands::Init | Commands::Prompts => Ok(()),
        Commands::Categories { action } => match action {
            None | Some(CategoriesAction::List) => commands::cmd_categories_list(pipeline, org),
            Some(CategoriesAction::Add {
                name,
                parent,
                color,
            }) => commands::cmd_categories_add(pipeline, org, &name, parent.as_deref(), color.as_deref()),
        },
        Commands::Transactions { action } => match action {
            None => commands::cmd_transactions_list(pipeline, org, 20, false),
            Some(TransactionsAction::List {
                limit,
                uncategorized,
            }) => commands::cmd_transactions_list(pipeline, org, limit, uncategorized),
            Some(TransactionsAction::Add {
                amount,
                description,
                merchant,
                date,
            }) => commands::cmd_transactions_add(
                pipeline,
                org,
                amount,
                &description,
                merchant.as_deref(),
                date.as_deref(),
            ),
            Some(TransactionsAction::Show { id }) => commands::cmd_transactions_show(pipeline, org, id),
        },
        Commands::Rules { action } => match action {
            None | Some(RulesAction::List) => commands::cmd_rules_list(pipeline, org),
            Some(RulesAction::Add {
                category,
                pattern,
                options,
            }) => commands::cmd_rules_add(pipeline, org, &category, &pattern, &options),
            Some(RulesAction::Update {
                id,
                category,
                pattern,
                rule_type,
                confidence,
                priority,
                case_sensitive,
                regex,
            }) => commands::cmd_rules_update(
                pipeline,
                org,
                id,
                commands::RuleChanges {
                    category,
                    pattern,
                    rule_type,
                    confidence,
                    priority,
                    case_sensitive,
                    is_regex: regex,
                },
            ),
            Some(RulesAction::Delete { id }) => commands::cmd_rules_delete(pipeline, org, id),
            Some(RulesAction::Test {
                category,
                pattern,
                options,
                examples,
            }) => commands::cmd_rules_test(pipeline, org, &category, &pattern, &options, examples),
        },
        Commands::Patterns { action } => match action {
            None | Some(PatternsAction::List) => commands::cmd_patterns_list(pipeline, org),
            Some(PatternsAction::Similar {
                merchant,
                threshold,
            }) => commands::cmd_patterns_similar(pipeline, org, &merchant, threshold),
            Some(PatternsAction::Clear { yes }) => commands::cmd_patterns_clear(pipeline, org, yes),
        },
        Commands::Categorize { action } => match action {
            CategorizeAction::One { id, json } => commands::cmd_categorize_one(pipeline, org, id, json).await,
            CategorizeAction::Batch {
                selection,
                max_cost,
                json,
            } => commands::cmd_categorize_batch(pipeline, org, &selection, max_cost, json).await,
            CategorizeAction::Estimate { selection } => {
                commands::cmd_categorize_estimate(pipeline, org, &selection)
            }
            CategorizeAction::Similar { id, threshold, limit } => {
                commands::cmd_categorize_similar(pipeline, org, id, threshold, limit).await
            }
            CategorizeAction::Embed { limit } => commands::cmd_categorize_embed(pipeline, org, limit).await,
        },
        Commands::Feedback { action } => match action {
            FeedbackAction::Record {
                transaction_id,
                kind,
                category,
                user,
            } => commands::cmd_feedback_record(
                pipeline,
                org,
                transaction_id,
                &kind,
                category.as_deref(),
                &user,
            ),
            FeedbackAction::List { transaction, limit } => {
                commands::cmd_feedback_list(pipeline, org, transaction, limit)
            }
            FeedbackAction::Analyze => commands::cmd_feedback_analyze(pipeline, org),
            FeedbackAction::Learn => commands::cmd_feedback_learn(pipeline, org),
        },
        Commands::Budget { action } => match action {
            None | Some(BudgetAction::Show) => commands::cmd_budget_show(pipeline, org),
            Some(BudgetAction::Set { monthly, daily }) => {
                commands::cmd_budget_set(pipeline, org, monthly, daily)
            }
        },
        Commands::Stats => commands::cmd_stats(pipeline, org),
        Commands::Status => commands::cmd_status(pipeline, org).await,
    }
}
