//! lattice-keygen
//!
//! Prints a fresh Ed25519 key pair for provisioning nodes, callers and
//! validators.
//!
//! Usage:
//!   lattice-keygen [id]

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

fn print_usage() {
    eprintln!("lattice-keygen - Generate an Ed25519 key pair");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  lattice-keygen [id]   Print a key pair; with an id, also a config snippet");
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() > 1 || args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        std::process::exit(if args.len() > 1 { 1 } else { 0 });
    }

    let key = SigningKey::generate(&mut OsRng);
    let secret = hex::encode(key.to_bytes());
    let public = hex::encode(key.verifying_key().as_bytes());

    println!("secret_key = \"{secret}\"");
    println!("public_key = \"{public}\"");

    if let Some(id) = args.first() {
        println!();
        println!("# add to lattice.toml under [[nodes]], [[callers]] or [[validators]]");
        println!("id = \"{id}\"");
        println!("public_key = \"{public}\"");
    }
}
