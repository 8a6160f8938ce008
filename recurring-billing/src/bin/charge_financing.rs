//! Charge due financing installments.

use recurring_billing::startup::{run, Job};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    run(Job::ChargeFinancing).await
}
