//! `swarm run <request>`: drive a full orchestration run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use swarm_core::SwarmConfig;
use swarm_core::create_orchestrator;

/// Run the request to completion and print the outcome.
pub async fn run(config: SwarmConfig, request: &str, json: bool) -> Result<()> {
    println!("Dispatching request against {}", config.target_repo_path.display());
    println!("  Max workers:  {}", config.max_workers);
    println!("  Task timeout: {}s", config.worker_timeout_secs);
    println!("  Merge strategy: {}", config.merge_strategy);

    let mut orchestrator = create_orchestrator(config).await?;

    // Graceful shutdown: first signal cancels, second force-exits.
    let cancel = orchestrator.cancellation_token();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);
    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel.cancel();
        }
    });

    let snapshot = orchestrator.run(request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!();
        println!("Run complete.");
        println!("  Tasks:   {} created, {} completed, {} failed, {} blocked",
            snapshot.tasks_created,
            snapshot.tasks_completed,
            snapshot.failed_tasks,
            snapshot.blocked_tasks,
        );
        println!("  Merges:  {} merged, {} skipped, {} conflicts, {} failed",
            snapshot.total_merged,
            snapshot.total_skipped,
            snapshot.total_conflicts,
            snapshot.total_failed_merges,
        );
        println!("  Fixes:   {} sweep fixes, {} conflict fixes",
            snapshot.fix_tasks_injected,
            snapshot.conflict_fix_tasks_injected,
        );
        println!("  Tokens:  {}", snapshot.tokens_used);
        println!(
            "  Finalization: {} after {} attempt(s)",
            if snapshot.finalization_passed { "passed" } else { "did not pass" },
            snapshot.finalization_attempts,
        );
    }

    if !snapshot.finalization_passed {
        std::process::exit(1);
    }
    Ok(())
}
