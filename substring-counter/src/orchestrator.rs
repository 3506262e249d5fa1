use crate::pool::{self, CountJob, ResultStream};
use crate::source::{Source, SourceLoader};
use crate::types::{CountResult, CounterConfig, CounterError, Result};
use num_bigint::BigUint;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Counts `config.substring` across every origin listed in `input`, one per line.
///
/// Returns the total over successfully counted origins. On cancellation the
/// result stream is drained for at most `config.shutdown_grace` and the partial
/// total is returned.
pub async fn run<R>(input: R, config: &CounterConfig, cancel: CancellationToken) -> Result<BigUint>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    config.validate()?;
    let loader = SourceLoader::new(config)?;
    let job = CountJob::from_config(config)?;

    let (tasks_tx, tasks_rx) = mpsc::channel(config.task_queue_capacity);
    let results = pool::consume(config, job, cancel.clone(), tasks_rx);
    let reader = tokio::spawn(read_origins(input, loader, tasks_tx, cancel.clone()));

    let total = calculate_total(results, &cancel, config.shutdown_grace).await;

    // Only still running if the grace period ran out.
    reader.abort();
    Ok(total)
}

async fn read_origins<R>(input: R, loader: SourceLoader, tasks: mpsc::Sender<Source>, cancel: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    // Origins are raw bytes; a line that isn't UTF-8 must not end the run.
    let mut lines = input.split(b'\n');

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_segment() => line,
        };

        let origin = match line {
            Ok(Some(bytes)) => origin_from_line(&bytes),
            Ok(None) => break,
            Err(e) => {
                error!("Error occurred on reading input: {}", e);
                break;
            }
        };

        let source = match loader.source(&origin) {
            Ok(source) => source,
            Err(e) => {
                report(&CountResult::failure(origin, e));
                continue;
            }
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = tasks.reserve() => permit.ok(),
        };

        match permit {
            Some(permit) => permit.send(source),
            None => {
                report(&CountResult::failure(origin, CounterError::Cancelled));
                break;
            }
        }
    }
}

/// Drains `results`, logging each one and summing the successful subtotals.
pub async fn calculate_total(mut results: ResultStream, cancel: &CancellationToken, grace: Duration) -> BigUint {
    let mut total = BigUint::default();

    let deadline = async {
        cancel.cancelled().await;
        tokio::time::sleep(grace).await;
    };
    tokio::pin!(deadline);

    loop {
        let next = tokio::select! {
            biased;
            result = results.recv() => result,
            _ = &mut deadline => {
                warn!("Results still pending {:?} after shutdown was requested", grace);
                None
            }
        };

        let Some(result) = next else {
            break;
        };

        report(&result);
        if result.is_success() {
            total += result.subtotal;
        }
    }

    info!("Total: {}", total);
    total
}

fn origin_from_line(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

fn report(result: &CountResult) {
    match &result.error {
        None => info!("{}: {}", result.origin, result.subtotal),
        Some(e) => warn!("{}: error {}", result.origin, e),
    }
}
