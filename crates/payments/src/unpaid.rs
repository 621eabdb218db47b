use std::collections::BTreeSet;

use chrono::NaiveDate;
use common::BillingPeriod;

/// Months from the registration month through the current month, both
/// inclusive, that have no PAID item. Chronological.
///
/// Empty when the member registered after `today`.
pub fn unpaid_months(
    registered_on: NaiveDate,
    today: NaiveDate,
    paid: &BTreeSet<BillingPeriod>,
) -> Vec<BillingPeriod> {
    BillingPeriod::from_date(registered_on)
        .through(BillingPeriod::from_date(today))
        .filter(|period| !paid.contains(period))
        .collect()
}
