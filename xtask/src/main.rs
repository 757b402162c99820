// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{env, path::PathBuf};

use anyhow::{Context, anyhow};
use clap::CommandFactory;
use openssl::pkey::PKey;

const TASKS: [&str; 3] = ["manual", "dev-credentials", "package"];

fn main() -> anyhow::Result<()> {
    match env::args()
        .nth(1)
        .ok_or(anyhow!("Must provide a task"))?
        .as_str()
    {
        "manual" => generate_manual(),
        "dev-credentials" => dev_credentials(),
        "package" => package(),
        _ => Err(anyhow!("Unknown task, use one of {:?}", TASKS)),
    }
}

fn root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../")
}

fn generate_manual() -> anyhow::Result<()> {
    let outdir = root().join("ulinux-updater/docs/");
    std::fs::create_dir_all(&outdir)?;
    let command = ulinux_updater::cli::Cli::command();
    let manual = clap_mangen::Man::new(command);
    manual.generate_to(outdir)?;

    Ok(())
}

/// Generate a CA, device and distribution point identities, and a signing key for local testing.
fn dev_credentials() -> anyhow::Result<()> {
    let outdir = root().join("devel/creds");
    // Drop the existing credentials so nothing from an old CA lingers.
    let _ = std::fs::remove_dir_all(&outdir);
    ulinux_updater_test::create_credentials(&outdir)?;
    println!("Development credentials written to {}", outdir.display());

    Ok(())
}

/// Wrap an image in a signed update container using the development signing key.
fn package() -> anyhow::Result<()> {
    let image_path = env::args()
        .nth(2)
        .map(PathBuf::from)
        .ok_or(anyhow!("Usage: package <image> [<output>]"))?;
    let output = env::args()
        .nth(3)
        .map(PathBuf::from)
        .unwrap_or_else(|| image_path.with_extension("tar"));

    let key_path = root().join("devel/creds/ulinux.signing.private_key.pem");
    let key = std::fs::read(&key_path)
        .with_context(|| format!("No signing key at {}; run dev-credentials first", key_path.display()))?;
    let key = PKey::private_key_from_pem(&key)?;
    let image = std::fs::read(&image_path)
        .with_context(|| format!("Failed to read {}", image_path.display()))?;

    std::fs::write(&output, ulinux_updater_test::signed_container(&key, &image)?)?;
    println!("Update container written to {}", output.display());

    Ok(())
}
