//! `portrait setup` / `portrait verify-models`: fetch and check the model files.

use anyhow::{bail, Context, Result};
use portrait_models::{ModelFile, Verification, MODELS};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Partial downloads land next to the destination and are renamed into
/// place once complete.
fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Download a single model file with progress output.
fn download_model(model: &ModelFile, model_dir: &Path) -> Result<()> {
    let dest = model_dir.join(model.name);
    let tmp_path = part_path(&dest);

    println!("  downloading {} ({})...", model.name, model.size_display);

    let resp = ureq::get(model.url)
        .call()
        .with_context(|| format!("failed to download {}", model.url))?;

    let content_length = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut reader = resp.into_body().into_reader();
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut buf = [0u8; 65536];
    let mut total: u64 = 0;
    let mut last_pct: u64 = 0;

    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("download of {} interrupted", model.name))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        total += n as u64;

        if let Some(len) = content_length.filter(|&len| len > 0) {
            let pct = (total * 100) / len;
            if pct / 10 > last_pct / 10 {
                print!("  {pct}%\r");
                io::stdout().flush().ok();
                last_pct = pct;
            }
        }
    }

    file.flush()?;
    drop(file);

    if let Some(expected) = model.sha256 {
        print!("  verifying checksum... ");
        io::stdout().flush().ok();
        let digest = portrait_models::sha256_file_hex(&tmp_path)?;
        if digest != expected {
            fs::remove_file(&tmp_path).ok();
            bail!(
                "checksum mismatch for {}:\n  expected: {}\n  got:      {}",
                model.name,
                expected,
                digest
            );
        }
        println!("ok");
    }

    fs::rename(&tmp_path, &dest).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    if model.sha256.is_none() {
        let digest = portrait_models::record_digest(model, model_dir)?;
        println!("  recorded checksum {digest}");
    }

    Ok(())
}

/// Whether an existing file can be kept as is.
///
/// An unpinned file with no recorded digest is adopted: its digest is
/// recorded now and checked by later runs.
fn already_present(model: &ModelFile, model_dir: &Path) -> bool {
    let dest = model_dir.join(model.name);
    if !dest.is_file() {
        return false;
    }
    let expected = match model.sha256 {
        Some(pinned) => pinned.to_string(),
        None => match portrait_models::recorded_digest(model, model_dir) {
            Ok(Some(recorded)) => recorded,
            Ok(None) => {
                return match portrait_models::record_digest(model, model_dir) {
                    Ok(_) => {
                        println!("  {} already present (checksum recorded)", model.name);
                        true
                    }
                    Err(e) => {
                        println!("  {}: {e}, re-downloading", model.name);
                        false
                    }
                };
            }
            Err(_) => {
                println!("  {} has a bad checksum record, re-downloading", model.name);
                return false;
            }
        },
    };
    match portrait_models::sha256_file_hex(&dest) {
        Ok(digest) if digest == expected => {
            println!("  {} already present (checksum ok)", model.name);
            true
        }
        Ok(_) => {
            println!("  {} exists but checksum differs, re-downloading", model.name);
            false
        }
        Err(_) => {
            println!("  {} exists but unreadable, re-downloading", model.name);
            false
        }
    }
}

/// Download whatever is missing from the model directory.
pub fn run(model_dir: &Path) -> Result<()> {
    println!("Model directory: {}", model_dir.display());

    fs::create_dir_all(model_dir)
        .with_context(|| format!("failed to create directory {}", model_dir.display()))?;

    let mut downloaded = 0;
    let mut skipped = 0;

    for model in MODELS {
        if already_present(model, model_dir) {
            skipped += 1;
            continue;
        }
        download_model(model, model_dir)?;
        downloaded += 1;
    }

    println!();
    if downloaded > 0 {
        println!("Setup complete: {downloaded} model(s) downloaded, {skipped} already present.");
    } else {
        println!("All models already present. Nothing to download.");
    }

    Ok(())
}

/// Check every model file and report each one; fails if any is bad.
pub fn verify(model_dir: &Path) -> Result<()> {
    println!("Model directory: {}", model_dir.display());

    let mut failures = 0;
    for model in MODELS {
        match portrait_models::verify_model(model, model_dir) {
            Ok(Verification::ChecksumOk) => println!("  {:<45} ok", model.name),
            Ok(Verification::RecordedChecksumOk) => {
                println!("  {:<45} ok (recorded checksum)", model.name)
            }
            Ok(Verification::Present) => {
                println!("  {:<45} present (no checksum recorded)", model.name)
            }
            Err(e) => {
                println!("  {:<45} FAILED", model.name);
                eprintln!("    {e}");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} model file(s) failed verification; run `portrait setup`");
    }
    println!("All models verified.");
    Ok(())
}
