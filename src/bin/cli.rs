//! MycelicMemory CLI
//!
//! Command-line interface over the same core as the MCP and REST servers.

use std::collections::HashMap;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mycelic::ai::analyze;
use mycelic::api::AppState;
use mycelic::graph::discovery;
use mycelic::storage::{metrics, sessions, taxonomy};
use mycelic::types::*;
use mycelic::Config;

#[derive(Parser)]
#[command(name = "mycelic")]
#[command(about = "Persistent memory for AI agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new memory
    Store {
        /// Content to remember
        content: String,
        /// Tags (comma-separated)
        #[arg(short = 'T', long)]
        tags: Option<String>,
        /// Importance (1-10)
        #[arg(short, long)]
        importance: Option<i32>,
        /// Domain partition
        #[arg(short, long)]
        domain: Option<String>,
        /// Session to attribute
        #[arg(short, long)]
        session: Option<String>,
        /// Unique slug
        #[arg(long)]
        slug: Option<String>,
    },
    /// Get a memory by id
    Get {
        id: i64,
    },
    /// Update a memory (only supplied fields change)
    Update {
        id: i64,
        #[arg(short, long)]
        content: Option<String>,
        #[arg(short = 'T', long)]
        tags: Option<String>,
        #[arg(short, long)]
        importance: Option<i32>,
        #[arg(short, long)]
        domain: Option<String>,
    },
    /// Delete a memory
    Delete {
        id: i64,
    },
    /// List memories
    List {
        #[arg(short, long, default_value = "20")]
        limit: i64,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    /// Search memories
    Search {
        query: String,
        /// Search mode: keyword, semantic, hybrid
        #[arg(short, long, default_value = "hybrid")]
        mode: String,
        #[arg(short, long, default_value = "10")]
        limit: i64,
        #[arg(long)]
        domain: Option<String>,
    },
    /// Link two memories
    Relate {
        source: i64,
        target: i64,
        /// Relationship type
        #[arg(short = 't', long, default_value = "references")]
        relationship: String,
        #[arg(short, long)]
        strength: Option<f64>,
        #[arg(long)]
        context: Option<String>,
    },
    /// Show relationships for a memory
    Related {
        id: i64,
    },
    /// Traverse the relationship graph
    Graph {
        root: i64,
        #[arg(short, long, default_value = "3")]
        depth: i32,
    },
    /// Discover relationships for a memory
    Discover {
        id: i64,
    },
    /// Ask a question over stored memories
    Analyze {
        question: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// List categories
    Categories,
    /// List domains
    Domains,
    /// List sessions
    Sessions {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Manage data sources
    Sources {
        #[command(subcommand)]
        command: SourceCommands,
    },
    /// Show store statistics
    Stats,
    /// Show operation timing metrics
    Metrics,
}

#[derive(Subcommand)]
enum SourceCommands {
    /// Register a data source
    Add {
        source_type: String,
        name: String,
    },
    /// List registered sources
    List,
    /// Show sync history for a source
    History {
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let state = AppState::from_config(&config)?;
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Store {
            content,
            tags,
            importance,
            domain,
            session,
            slug,
        } => {
            let input = CreateMemoryInput {
                content,
                tags: split_tags(tags),
                importance,
                domain,
                session_id: session,
                slug,
                agent_type: AgentType::Code,
                ..Default::default()
            };
            let memory = state.memory.store(&input)?;
            state
                .ai
                .embed_and_store(&state.storage, memory.id, &memory.content, &cancel)
                .await?;
            println!("Stored memory #{}", memory.id);
            println!("{}", serde_json::to_string_pretty(&memory)?);
        }

        Commands::Get { id } => {
            let memory = state.memory.get(id, true)?;
            println!("{}", serde_json::to_string_pretty(&memory)?);
        }

        Commands::Update {
            id,
            content,
            tags,
            importance,
            domain,
        } => {
            let input = UpdateMemoryInput {
                content,
                tags: tags.map(|t| split_tags(Some(t))),
                importance,
                domain,
                ..Default::default()
            };
            let memory = state.memory.update(id, &input)?;
            println!("Updated memory #{}", memory.id);
        }

        Commands::Delete { id } => {
            state.memory.delete(id)?;
            state.ai.delete_vectors(&[id]).await?;
            println!("Deleted memory #{}", id);
        }

        Commands::List {
            limit,
            domain,
            session,
        } => {
            let options = ListOptions {
                limit: Some(limit),
                offset: None,
                filters: SearchFilters {
                    domain,
                    session_id: session,
                    ..Default::default()
                },
            };
            for memory in state.memory.list(&options)? {
                println!(
                    "#{} [{}] ({}) {}",
                    memory.id,
                    memory.domain.as_deref().unwrap_or("-"),
                    memory.importance,
                    truncate(&memory.content, 70)
                );
            }
        }

        Commands::Search {
            query,
            mode,
            limit,
            domain,
        } => {
            let options = SearchOptions {
                mode: mode.parse().map_err(anyhow::Error::msg)?,
                limit: Some(limit),
                offset: None,
                min_relevance: None,
                filters: SearchFilters {
                    domain,
                    ..Default::default()
                },
            };
            let response = state.search.search(&query, &options, &cancel).await?;
            for warning in &response.warnings {
                eprintln!("warning: {}", warning);
            }
            for result in response.results {
                println!(
                    "#{} ({:.3}, {:?}) {}",
                    result.memory.id,
                    result.relevance,
                    result.match_type,
                    truncate(&result.memory.content, 70)
                );
            }
        }

        Commands::Relate {
            source,
            target,
            relationship,
            strength,
            context,
        } => {
            let input = CreateRelationshipInput {
                source_memory_id: source,
                target_memory_id: target,
                relationship_type: relationship.parse().map_err(anyhow::Error::msg)?,
                strength,
                context,
                auto_generated: false,
            };
            let relationship = state.graph.relate(&input)?;
            println!(
                "Linked #{} -> #{} ({}, {:.2})",
                relationship.source_memory_id,
                relationship.target_memory_id,
                relationship.relationship_type.as_str(),
                relationship.strength
            );
        }

        Commands::Related { id } => {
            for rel in state.graph.find_related(id)? {
                println!(
                    "#{}: {} -> {} ({}, {:.2}){}",
                    rel.id,
                    rel.source_memory_id,
                    rel.target_memory_id,
                    rel.relationship_type.as_str(),
                    rel.strength,
                    if rel.auto_generated { " [auto]" } else { "" }
                );
            }
        }

        Commands::Graph { root, depth } => {
            let graph = state.graph.map_graph(root, depth, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }

        Commands::Discover { id } => {
            let discovered =
                discovery::discover_relationships(&state.storage, &state.graph, &state.ai, id, &cancel)
                    .await?;
            if discovered.is_empty() {
                println!("No new relationships found");
            }
            for d in discovered {
                println!(
                    "#{} -> #{} ({:.2})",
                    d.relationship.source_memory_id, d.relationship.target_memory_id, d.score
                );
            }
        }

        Commands::Analyze { question, session } => {
            let reply = analyze::analyze(
                &state.ai,
                &state.search,
                &question,
                session.as_deref(),
                &cancel,
            )
            .await?;
            println!("{}", reply);
        }

        Commands::Categories => {
            for category in state.storage.with_reader(taxonomy::list_categories)? {
                println!("#{} {}", category.id, category.name);
            }
        }

        Commands::Domains => {
            for domain in state.storage.with_reader(taxonomy::list_domains)? {
                println!("#{} {}", domain.id, domain.name);
            }
        }

        Commands::Sessions { limit } => {
            let sessions = state
                .storage
                .with_reader(|conn| sessions::list_sessions(conn, limit))?;
            for session in sessions {
                println!(
                    "{} [{}] last used {}{}",
                    session.session_id,
                    session.agent_type.as_str(),
                    session.last_accessed.format("%Y-%m-%d %H:%M"),
                    if session.active { "" } else { " (inactive)" }
                );
            }
        }

        Commands::Sources { command } => match command {
            SourceCommands::Add { source_type, name } => {
                let source =
                    state
                        .ingest
                        .register_source(&source_type, &name, &HashMap::new())?;
                println!("Registered source #{} ({})", source.id, source.name);
            }
            SourceCommands::List => {
                for source in state.ingest.list_sources()? {
                    println!(
                        "#{} {} [{}] {}",
                        source.id,
                        source.name,
                        source.status.as_str(),
                        source
                            .last_sync_at
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "never synced".to_string())
                    );
                }
            }
            SourceCommands::History { id } => {
                for entry in state.ingest.sync_history(id, 20)? {
                    println!(
                        "#{} {} processed={} created={} duplicates={}{}",
                        entry.id,
                        entry.status.as_str(),
                        entry.items_processed,
                        entry.memories_created,
                        entry.duplicates_skipped,
                        entry
                            .error_message
                            .map(|e| format!(" error: {}", e))
                            .unwrap_or_default()
                    );
                }
            }
        },

        Commands::Stats => {
            let stats = state.memory.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Metrics => {
            let summaries = state.storage.with_reader(metrics::metric_summaries)?;
            for summary in summaries {
                println!(
                    "{}: {} calls, avg {:.1}ms, max {:.1}ms",
                    summary.operation, summary.count, summary.avg_ms, summary.max_ms
                );
            }
        }
    }

    Ok(())
}

fn split_tags(tags: Option<String>) -> Vec<String> {
    tags.map(|t| {
        t.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> String {
    let first_line = s.lines().next().unwrap_or(s);
    if first_line.chars().count() <= max {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
