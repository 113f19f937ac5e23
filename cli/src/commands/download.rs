use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use modelpack_core::{ProgressEvent, ProgressSink, ProvisionError, StatusReport};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::Overrides;

pub async fn execute(overrides: &Overrides) -> Result<()> {
    let provisioner = Arc::new(super::open_provisioner(overrides)?);
    println!("Downloading model pack: {}", provisioner.pack_url());
    println!("Model store: {}\n", provisioner.registry().root().display());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = provisioner.spawn_download(ProgressSink::new(tx));

    let cancel = task.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling download");
            cancel.cancel();
        }
    });

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );

    // The channel closes once the download task drops its sink.
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::Started { total } => {
                if let Some(total) = total {
                    pb.set_length(total);
                }
                pb.set_message("downloading");
            }
            ProgressEvent::Received { bytes, total } => {
                if let Some(total) = total {
                    pb.set_length(total);
                } else if bytes > pb.length().unwrap_or(0) {
                    pb.set_length(bytes);
                }
                pb.set_position(bytes);
            }
            ProgressEvent::CheckingPack => pb.set_message("checking pack"),
            ProgressEvent::Extracting => pb.set_message("extracting"),
            ProgressEvent::Verifying { model_id } => pb.set_message(format!("verifying {}", model_id)),
            ProgressEvent::Installing => pb.set_message("installing"),
            ProgressEvent::Finished => pb.set_message("done"),
        }
    }

    match task.wait().await {
        Ok(report) => {
            pb.finish_and_clear();
            println!("Model pack installed.");
            println!("  Size: {:.2} GB", report.pack_size as f64 / 1_073_741_824.0);
            println!("  SHA-256: {}\n", report.pack_sha256);
            print_statuses(&report.models);
            Ok(())
        }
        Err(err) => {
            pb.abandon();
            if !matches!(err, ProvisionError::Busy) {
                // Show what the store holds after the failed attempt.
                if let Ok(report) = provisioner.check(None).await {
                    println!();
                    print_statuses(&report);
                }
            }
            Err(err.into())
        }
    }
}

fn print_statuses(report: &StatusReport) {
    for state in report.iter() {
        println!("  {:<24} {}", state.model_id, state.status);
    }
}
