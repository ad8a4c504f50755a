//! Synced key set
//!
//! The fixed list of local store keys mirrored to the remote store.
//! Anything else in the local store is device-local and never leaves it.

/// Number of budget months (one key each)
pub const BUDGET_MONTHS: u8 = 12;

/// Every key replicated to the remote store
pub const SYNCED_KEYS: [&str; 16] = [
    "budgetMonth1",
    "budgetMonth2",
    "budgetMonth3",
    "budgetMonth4",
    "budgetMonth5",
    "budgetMonth6",
    "budgetMonth7",
    "budgetMonth8",
    "budgetMonth9",
    "budgetMonth10",
    "budgetMonth11",
    "budgetMonth12",
    STOCK_PORTFOLIO,
    WATCHLIST,
    BANK_ACCOUNTS,
    ASSET_TREND_OVERRIDES,
];

pub const STOCK_PORTFOLIO: &str = "stockPortfolio";
pub const WATCHLIST: &str = "watchlist";
pub const BANK_ACCOUNTS: &str = "bankAccounts";
pub const ASSET_TREND_OVERRIDES: &str = "assetTrendOverrides";

/// Whether `key` belongs to the synced key set
pub fn is_synced(key: &str) -> bool {
    SYNCED_KEYS.contains(&key)
}

/// Local store key for a budget month (1-12)
pub fn budget_month_key(month: u8) -> Option<String> {
    (1..=BUDGET_MONTHS)
        .contains(&month)
        .then(|| format!("budgetMonth{}", month))
}

/// The synced key set as owned strings
pub fn synced_keys() -> Vec<String> {
    SYNCED_KEYS.iter().map(|k| k.to_string()).collect()
}
