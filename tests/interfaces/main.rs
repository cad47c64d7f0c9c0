//! Interface tests for cross-account sourcing using Cucumber.
//!
//! Gherkin scenarios describe the externally visible behavior; step
//! definitions drive a broker through authenticated connections.
//!
//! ```bash
//! cargo test --test interfaces
//! ```

#[path = "../common/mod.rs"]
mod common;
mod steps;

use cucumber::World;
use steps::sourcing::SourcingWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running Cross-Account Sourcing Interface Tests ===\n");
    SourcingWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/interfaces/features/cross_account_sourcing.feature")
        .await;
}
