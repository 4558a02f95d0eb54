use std::io::{self, BufRead, Write};

use splatmap::dataset::Dataset;
use splatmap::quality::{Evaluation, ReviewFuture};
use splatmap::{ReviewDecision, Reviewer};
use tracing::warn;

/// Asks the operator on the terminal.
#[derive(Debug, Default)]
pub struct StdinReviewer;

impl Reviewer for StdinReviewer {
    fn review<'a>(&'a self, staging: &'a Dataset, evaluation: &'a Evaluation) -> ReviewFuture<'a> {
        let prompt = prompt(staging, evaluation);
        Box::pin(async move {
            let answer = tokio::task::spawn_blocking(move || ask(&prompt)).await;
            match answer {
                Ok(Ok(line)) => decide(&line),
                Ok(Err(err)) => {
                    warn!("Could not read review answer: {err}");
                    ReviewDecision::Reject("no answer from operator".to_string())
                }
                Err(err) => {
                    warn!("Review prompt failed: {err}");
                    ReviewDecision::Reject("no answer from operator".to_string())
                }
            }
        })
    }
}

fn prompt(staging: &Dataset, evaluation: &Evaluation) -> String {
    let metrics = &evaluation.metrics;
    let mut text = format!(
        "\nStaging {} at {}\n  recovered {} of {} new images, {} registered, {} points\n  mean reprojection error {:.2}px, score {:.1}\n",
        staging.id,
        staging.root.display(),
        metrics.recovered_new,
        metrics.new_images,
        metrics.model.registered_images,
        metrics.model.points,
        metrics.model.mean_reprojection_error,
        metrics.quality_score
    );
    if let Some(alignment) = &metrics.alignment {
        text.push_str(&format!(
            "  aligned on {} anchors, scale {:.3}, residual {:.3}\n",
            alignment.anchors, alignment.scale, alignment.rms_residual
        ));
    }
    for finding in evaluation.findings.iter() {
        text.push_str(&format!("  ! {finding}\n"));
    }
    text.push_str("Merge into main? [y/N or a rejection reason] ");
    text
}

fn ask(prompt: &str) -> io::Result<String> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(prompt.as_bytes())?;
    stdout.flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

fn decide(answer: &str) -> ReviewDecision {
    match answer.trim() {
        "y" | "Y" | "yes" => ReviewDecision::Accept,
        "" | "n" | "N" | "no" => ReviewDecision::Reject("rejected by operator".to_string()),
        reason => ReviewDecision::Reject(reason.to_string()),
    }
}
