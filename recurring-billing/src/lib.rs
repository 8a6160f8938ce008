//! recurring-billing: batch jobs that charge financing installments and
//! subscription renewals, and remind payers of upcoming charges.

pub mod calendar;
pub mod config;
pub mod jobs;
pub mod ledger;
pub mod models;
pub mod plans;
pub mod schedule;
pub mod services;
pub mod startup;
