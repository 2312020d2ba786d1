//! Manual probe for the OCR worker stack.
//!
//! Spawns both daemons against a real backend checkout. Given an image it
//! runs one detect + OCR round trip and prints the extracted fields; without
//! one it keeps the daemons alive until Ctrl-C so their logs can be watched.
//!
//! ```text
//! probe <backend-root> [image-file]
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ktp_ocr::{Detection, DetectionOptions, DetectionService, OcrService, SupervisorError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(root) = args.next() else {
        eprintln!("usage: probe <backend-root> [image-file]");
        return ExitCode::from(2);
    };
    let root = PathBuf::from(root);
    let image = args.next().map(PathBuf::from);

    println!("=== OCR Worker Probe ===\n");

    println!("[1/4] Starting detection daemon...");
    let detection = DetectionService::new(&root);
    if let Err(err) = detection.ensure_ready().await {
        report_init_failure("detection", &err);
        return ExitCode::FAILURE;
    }
    println!("✓ Detection daemon ready\n");

    println!("[2/4] Starting OCR daemon...");
    let ocr = OcrService::new(&root);
    if let Err(err) = ocr.ensure_ready().await {
        report_init_failure("ocr", &err);
        detection.shutdown().await;
        return ExitCode::FAILURE;
    }
    println!("✓ OCR daemon ready\n");

    let outcome = match image {
        Some(path) => {
            println!("[3/4] Round-tripping {}...", path.display());
            round_trip(&detection, &ocr, &path).await
        }
        None => {
            println!("[3/4] Daemons running, press Ctrl-C to stop...");
            tokio::signal::ctrl_c().await.map_err(Into::into)
        }
    };

    println!("\n[4/4] Shutting down...");
    detection.shutdown().await;
    ocr.shutdown().await;

    match outcome {
        Ok(()) => {
            println!("✓ Done");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("probe failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn report_init_failure(which: &str, err: &SupervisorError) {
    eprintln!("✗ {which} daemon failed to start: {err}");
    if let Some(tail) = err.diagnostics() {
        eprintln!("--- captured stderr ---\n{tail}");
    }
}

async fn round_trip(
    detection: &DetectionService,
    ocr: &OcrService,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = tokio::fs::read(path).await?;
    println!("  Image: {} bytes", bytes.len());

    let crop = match detection.detect(&bytes, DetectionOptions::default()).await? {
        Detection::Single(single) => {
            println!(
                "✓ Card at [{:.0}, {:.0}, {:.0}, {:.0}] in a {}x{} image",
                single.bbox[0],
                single.bbox[1],
                single.bbox[2],
                single.bbox[3],
                single.original_size[0],
                single.original_size[1]
            );
            if let Some(confidence) = single.confidence {
                println!("  Confidence: {confidence:.3}");
            }
            single.cropped_image
        }
        Detection::Multiple(multi) => {
            println!("✓ Detected {} cards, using the first", multi.crops.len());
            multi
                .crops
                .into_iter()
                .next()
                .ok_or("detection reported no crops")?
                .cropped_image
        }
    };

    let crop_bytes = BASE64.decode(crop.as_bytes())?;
    println!("  Crop: {} bytes\n", crop_bytes.len());

    let result = ocr.process_image(&crop_bytes).await?;
    println!(
        "✓ OCR extracted {} text blocks",
        result.raw.text_blocks_count
    );
    println!(
        "  Identity number: {}",
        result.data.identity_number.as_deref().unwrap_or("-")
    );
    println!("  Name: {}", result.data.name.as_deref().unwrap_or("-"));
    println!("  Gender: {}", result.data.gender.as_deref().unwrap_or("-"));
    println!("  Address: {}", result.data.alamat.as_deref().unwrap_or("-"));
    Ok(())
}
