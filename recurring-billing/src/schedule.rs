//! Installment schedule construction.

use crate::calendar::add_months_clamped;
use crate::models::{Cadence, Installment};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("term count must be at least 1")]
    EmptyTerm,
    #[error("financed amount must not be negative, got {0}")]
    NegativeAmount(i64),
}

/// Split `amount_cents` into `term_count` installments after `start`.
///
/// The first `amount % term_count` installments carry one extra cent, so the
/// schedule always sums to exactly `amount_cents`. Installment `i` (1-based) is
/// due `7 * i` days after `start` for weekly cadence, or `i` calendar months
/// after it (day clamped to month end) for monthly cadence.
pub fn build_installment_schedule(
    amount_cents: i64,
    term_count: u32,
    cadence: Cadence,
    start: DateTime<Utc>,
) -> Result<Vec<Installment>, ScheduleError> {
    if term_count == 0 {
        return Err(ScheduleError::EmptyTerm);
    }
    if amount_cents < 0 {
        return Err(ScheduleError::NegativeAmount(amount_cents));
    }

    let terms = i64::from(term_count);
    let base = amount_cents / terms;
    let remainder = amount_cents - base * terms;

    let schedule = (1..=term_count)
        .map(|sequence| {
            let amount_cents = if i64::from(sequence) <= remainder {
                base + 1
            } else {
                base
            };
            let due_at = match cadence {
                Cadence::Weekly => start + Duration::days(7 * i64::from(sequence)),
                Cadence::Monthly => add_months_clamped(start, sequence),
            };
            Installment {
                sequence,
                due_at,
                amount_cents,
            }
        })
        .collect();

    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 31, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_schedule_sums_exactly() {
        let schedule = build_installment_schedule(10_000, 3, Cadence::Monthly, start()).unwrap();

        let amounts: Vec<i64> = schedule.iter().map(|i| i.amount_cents).collect();
        assert_eq!(amounts, vec![3334, 3333, 3333]);
        assert_eq!(amounts.iter().sum::<i64>(), 10_000);
    }

    #[test]
    fn test_remainder_goes_to_leading_installments() {
        let schedule = build_installment_schedule(1_003, 4, Cadence::Weekly, start()).unwrap();

        let amounts: Vec<i64> = schedule.iter().map(|i| i.amount_cents).collect();
        assert_eq!(amounts, vec![251, 251, 251, 250]);
    }

    #[test]
    fn test_monthly_due_dates_clamp_and_increase() {
        let schedule = build_installment_schedule(9_000, 3, Cadence::Monthly, start()).unwrap();

        let due: Vec<DateTime<Utc>> = schedule.iter().map(|i| i.due_at).collect();
        assert_eq!(
            due,
            vec![
                Utc.with_ymd_and_hms(2025, 2, 28, 15, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 3, 31, 15, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 4, 30, 15, 0, 0).unwrap(),
            ]
        );
        assert!(due.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_weekly_due_dates() {
        let schedule = build_installment_schedule(400, 2, Cadence::Weekly, start()).unwrap();

        assert_eq!(schedule[0].due_at, start() + Duration::days(7));
        assert_eq!(schedule[1].due_at, start() + Duration::days(14));
        assert_eq!(schedule[1].sequence, 2);
    }

    #[test]
    fn test_amount_smaller_than_term_count() {
        let schedule = build_installment_schedule(2, 4, Cadence::Weekly, start()).unwrap();

        let amounts: Vec<i64> = schedule.iter().map(|i| i.amount_cents).collect();
        assert_eq!(amounts, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        assert_eq!(
            build_installment_schedule(100, 0, Cadence::Monthly, start()),
            Err(ScheduleError::EmptyTerm)
        );
        assert_eq!(
            build_installment_schedule(-1, 2, Cadence::Monthly, start()),
            Err(ScheduleError::NegativeAmount(-1))
        );
    }
}
