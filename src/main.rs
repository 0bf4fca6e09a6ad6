// L2 Trade-Cost Console Runner
// Streams one symbol and logs every published cost estimate until Ctrl-C

use std::process::ExitCode;
use tracing::{error, info, warn};

use l2_tradecost::core::{setup_logging, ConfigManager};
use l2_tradecost::IngestionPipeline;

fn main() -> ExitCode {
    let config_path = std::env::args().nth(1);

    let manager = match ConfigManager::new(config_path.as_deref()) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&manager.logging());

    match manager.validate() {
        Ok(true) => {}
        Ok(false) => return ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Configuration check failed");
            return ExitCode::FAILURE;
        }
    }

    let config = manager.pipeline();
    info!(symbol = %config.symbol, order_size = config.order_size, fee_tier = %config.fee_tier, "Configuration loaded");

    let log_every = config.stats_log_interval;
    let mut pipeline = match IngestionPipeline::start(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "Pipeline failed to start");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create runtime");
            pipeline.stop();
            return ExitCode::FAILURE;
        }
    };

    let mailbox = pipeline.mailbox();
    let mut received = 0u64;
    runtime.block_on(async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, shutting down");
                    break;
                }
                output = mailbox.recv() => match output {
                    Some(output) => {
                        info!(
                            seq = output.snapshot.sequence_id,
                            mid = output.snapshot.mid_price().unwrap_or(0.0),
                            slippage = %output.metrics.slippage,
                            impact = %output.metrics.market_impact,
                            fee = %output.metrics.fee,
                            maker_pct = %output.metrics.maker_share,
                            net_cost = %output.metrics.net_cost,
                            latency_ms = output.latency.processing_ms,
                            "Cost estimate"
                        );
                        received += 1;
                        if log_every > 0 && received % log_every == 0 {
                            pipeline.stats().print_compact();
                        }
                    }
                    None => {
                        warn!("Mailbox closed, ingestion stopped");
                        break;
                    }
                },
            }
        }
    });

    let fatal = pipeline.fatal_error();
    pipeline.stop();
    pipeline.stats().print_report();

    match fatal {
        Some(e) => {
            error!(error = %e, "Ingestion terminated");
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}
