// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

// Notary Key Generation Tool
// Generates secp256k1 keys for notary nodes

use anyhow::Result;
use clap::{Parser, Subcommand};
use notary_bridge_keys::{eth_address, public_key_hex};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "notary-keygen")]
#[command(about = "Generate secp256k1 keys for bridge notary nodes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a notary key
    Notary {
        /// Output file path for the generated key
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Examine an existing key file
    Examine {
        /// Path to the key file to examine
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Notary { output } => {
            println!("Generating notary key (secp256k1)...");
            notary_bridge_keys::keygen::generate_notary_key_and_write_to_file(&output)?;
            println!("\n✓ Notary key generated successfully!");
            println!("  File: {:?}", output);

            // Format is stable: "Ethereum address: 0x..."
            examine_key_file(&output)?;

            println!("\nIMPORTANT:");
            println!("  1. Keep this key file secure and backed up");
            println!("  2. Update your notary config 'notary-key-path' to point to this file");
        }
        Commands::Examine { path } => {
            println!("Examining key file: {:?}", path);
            examine_key_file(&path)?;
        }
    }

    Ok(())
}

fn examine_key_file(path: &PathBuf) -> Result<()> {
    let key = notary_bridge_keys::keypair_file::read_key(path)?;
    println!("Key type: secp256k1");
    println!("Public key (hex): {}", public_key_hex(&key));
    println!("Ethereum address: {:?}", eth_address(&key));
    Ok(())
}
