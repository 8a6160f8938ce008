//! Send upcoming charge reminders.

use recurring_billing::startup::{run, Job};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    run(Job::SendReminders).await
}
