// Payment Core Library
//
// This library provides the core components for the payment and
// subscription lifecycle engine. To run the server, use the binary target:
//
//   cargo run --bin payment_core
//
// This file exists to maintain the library structure while the actual
// server implementation is in src/bin/payment_core.rs.

fn main() {
    eprintln!("This is a library crate. To run the payment core server, use:");
    eprintln!("  cargo run --bin payment_core");
    std::process::exit(1);
}
