use swgraph::graph::store::{graph_stats, list_failed};
use swgraph::{config::Config, db::Db, error::SwgraphError};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load()?;
    let db = Db::new(config.db_path());

    println!("\n=== swgraph Crawl Statistics ===\n");

    let (stats, failed) = db
        .with_connection(|conn| {
            let stats = graph_stats(conn)?;
            let failed = list_failed(conn)?;
            Ok::<_, SwgraphError>((stats, failed))
        })
        .await?;

    if stats.entities.is_empty() {
        println!("The graph is empty.");
        println!("\nRun `swgraph crawl` to populate it.");
        return Ok(());
    }

    println!("Entities by Kind and Status:\n");
    println!("{:-<50}", "");
    println!("{:<20} {:<15} {:>10}", "Kind", "Status", "Count");
    println!("{:-<50}", "");
    for (kind, status, count) in &stats.entities {
        println!("{:<20} {:<15} {:>10}", kind, status, count);
    }
    println!("{:-<50}", "");
    println!("{:<36} {:>10}", "Total", stats.total_entities());

    println!("\nRelationships by Type:\n");
    println!("{:-<50}", "");
    println!("{:<36} {:>10}", "Type", "Count");
    println!("{:-<50}", "");
    for (rel_type, count) in &stats.relationships {
        println!("{:<36} {:>10}", rel_type, count);
    }
    println!("{:-<50}", "");
    println!("{:<36} {:>10}", "Total", stats.total_relationships());

    if failed.is_empty() {
        println!("\nNo failed entities.");
    } else {
        println!("\nFailed Entities ({}):\n", failed.len());
        println!("{:-<80}", "");
        for f in &failed {
            println!(
                "{:<12} {:<40} attempts={}",
                f.kind, f.key, f.attempts
            );
            if let Some(err) = &f.last_error {
                println!("    {}", err);
            }
        }
        println!("{:-<80}", "");
        println!("Run `swgraph reset-failed` then `swgraph crawl --no-seed` to retry them.");
    }

    println!();
    Ok(())
}
