//! # Journal Replication CLI
//!
//! Operator utilities for credential tokens and origin addresses.

use anyhow::{Context, Result};
use journal_repl_client::{decode_token, encode_token, DisconnectReason, ServerNode};
use journal_repl_proto::PROTOCOL_VERSION;
use std::env;

const REASONS: [DisconnectReason; 6] = [
    DisconnectReason::Unknown,
    DisconnectReason::ClientHalted,
    DisconnectReason::ClientException,
    DisconnectReason::BrokenChannel,
    DisconnectReason::ClientError,
    DisconnectReason::IncompatibleJournal,
];

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "version" => {
            println!("journal-repl {}", env!("CARGO_PKG_VERSION"));
            println!("protocol {PROTOCOL_VERSION}");
        }
        "encode-token" => {
            if args.len() < 3 {
                eprintln!("Usage: journal-repl encode-token <secret>");
                std::process::exit(1);
            }
            println!("{}", encode_token(args[2].as_bytes()));
        }
        "decode-token" => {
            if args.len() < 3 {
                eprintln!("Usage: journal-repl decode-token <base64>");
                std::process::exit(1);
            }
            let token = decode_token(&args[2]).context("Failed to decode token")?;
            match String::from_utf8(token) {
                Ok(text) => println!("{text}"),
                Err(err) => println!("{:02x?}", err.into_bytes()),
            }
        }
        "node" => {
            if args.len() < 3 {
                eprintln!("Usage: journal-repl node <address>");
                std::process::exit(1);
            }
            let node: ServerNode = args[2]
                .parse()
                .with_context(|| format!("Invalid node address {}", args[2]))?;
            let json = serde_json::json!({ "host": node.host, "port": node.port });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        "reasons" => {
            for reason in REASONS {
                println!(
                    "{:>2}  {:<22} {}",
                    reason.code(),
                    reason.to_string(),
                    serde_json::to_string(&reason)?
                );
            }
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"Journal replication CLI

USAGE:
    journal-repl <COMMAND> [OPTIONS]

COMMANDS:
    version               Show crate and protocol versions
    encode-token <secret> Encode a credential token as base64
    decode-token <base64> Decode a base64 credential token
    node <address>        Resolve an origin address (host, host:port, tcp://host:port)
    reasons               List disconnect reasons and their codes
    help                  Show this help message

EXAMPLES:
    journal-repl encode-token "s3cret"
    journal-repl node tcp://origin.example:7075
"#
    );
}
