//! Billing domain types: branch codes, sequence domains, bill numbers and
//! paise arithmetic.
//!
//! The bill number format is a bit-exact external contract:
//!
//! ```text
//! {DOMAIN_PREFIX}-{BRANCH_CODE}-{sequence, zero-padded to 5 digits}
//! e.g.  D-KOD-00042
//! ```
//!
//! Printed bills, the front-end and downstream accounting all key on this
//! string, so formatting and parsing must round-trip exactly. Sequence values
//! above 99999 widen past five digits rather than wrap.

use chrono::{DateTime, Utc};
use chrono_tz::Asia::Kolkata;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// BillingError
// ---------------------------------------------------------------------------

/// Returned when branch codes, domain keys or bill-number strings fail
/// validation. Carries enough context to echo back to an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// Branch code is not 2..=8 uppercase ASCII alphanumerics.
    InvalidBranchCode { code: String },
    /// Domain key is not one of the registered sequence domains.
    UnknownDomain { key: String },
    /// Bill-number string does not match the `P-BRANCH-NNNNN` shape.
    MalformedBillNumber { input: String },
    /// Discount exceeds subtotal, or an amount is negative.
    InvalidAmounts { subtotal_paise: i64, discount_paise: i64 },
    /// Summing line items overflowed i64 paise.
    AmountOverflow,
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingError::InvalidBranchCode { code } => {
                write!(f, "invalid branch code {code:?}: expected 2..=8 uppercase ASCII alphanumerics")
            }
            BillingError::UnknownDomain { key } => write!(f, "unknown sequence domain {key:?}"),
            BillingError::MalformedBillNumber { input } => {
                write!(f, "malformed bill number {input:?}")
            }
            BillingError::InvalidAmounts {
                subtotal_paise,
                discount_paise,
            } => write!(
                f,
                "invalid bill amounts: subtotal={subtotal_paise} discount={discount_paise}"
            ),
            BillingError::AmountOverflow => write!(f, "bill amount overflow"),
        }
    }
}

impl std::error::Error for BillingError {}

// ---------------------------------------------------------------------------
// BranchCode
// ---------------------------------------------------------------------------

/// Validated branch identifier. Embedded verbatim between the dashes of a
/// bill number, so dashes are forbidden and the alphabet is restricted to
/// uppercase ASCII alphanumerics (2..=8 chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchCode(String);

impl BranchCode {
    pub fn new(code: impl Into<String>) -> Result<Self, BillingError> {
        let code = code.into();
        let ok = (2..=8).contains(&code.len())
            && code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        if ok {
            Ok(BranchCode(code))
        } else {
            Err(BillingError::InvalidBranchCode { code })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BranchCode {
    type Error = BillingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BranchCode::new(value)
    }
}

impl From<BranchCode> for String {
    fn from(value: BranchCode) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// SequenceDomain
// ---------------------------------------------------------------------------

/// A billing counter family. Each `(branch, domain)` pair owns one
/// monotonically increasing sequence; domains never share numbers.
///
/// `Diagnostic` is the only domain served by the visit API today;
/// `Pharmacy` reserves the counter namespace for the dispensary module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceDomain {
    Diagnostic,
    Pharmacy,
}

impl SequenceDomain {
    /// Storage key for the `number_sequences` table.
    pub fn as_key(&self) -> &'static str {
        match self {
            SequenceDomain::Diagnostic => "diagnostic",
            SequenceDomain::Pharmacy => "pharmacy",
        }
    }

    /// Single-letter prefix embedded in formatted bill numbers.
    pub fn prefix(&self) -> char {
        match self {
            SequenceDomain::Diagnostic => 'D',
            SequenceDomain::Pharmacy => 'P',
        }
    }

    pub fn parse_key(key: &str) -> Result<Self, BillingError> {
        match key {
            "diagnostic" => Ok(SequenceDomain::Diagnostic),
            "pharmacy" => Ok(SequenceDomain::Pharmacy),
            other => Err(BillingError::UnknownDomain {
                key: other.to_string(),
            }),
        }
    }

    fn from_prefix(c: char) -> Option<Self> {
        match c {
            'D' => Some(SequenceDomain::Diagnostic),
            'P' => Some(SequenceDomain::Pharmacy),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// BillNumber
// ---------------------------------------------------------------------------

/// A parsed-or-formatted bill number. Construction always goes through
/// validation; `to_string()` reproduces the wire format exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillNumber {
    pub domain: SequenceDomain,
    pub branch: BranchCode,
    pub sequence: i64,
}

impl BillNumber {
    pub fn new(domain: SequenceDomain, branch: BranchCode, sequence: i64) -> Self {
        debug_assert!(sequence >= 1, "sequence values start at 1");
        BillNumber {
            domain,
            branch,
            sequence,
        }
    }

    /// Parse a formatted bill number back into its parts.
    ///
    /// Branch codes cannot contain dashes, so `split('-')` yields exactly
    /// three segments for any well-formed input.
    pub fn parse(input: &str) -> Result<Self, BillingError> {
        let malformed = || BillingError::MalformedBillNumber {
            input: input.to_string(),
        };

        let parts: Vec<&str> = input.split('-').collect();
        let [prefix, branch, digits] = parts.as_slice() else {
            return Err(malformed());
        };

        let mut prefix_chars = prefix.chars();
        let domain = match (prefix_chars.next(), prefix_chars.next()) {
            (Some(c), None) => SequenceDomain::from_prefix(c).ok_or_else(malformed)?,
            _ => return Err(malformed()),
        };

        let branch = BranchCode::new(*branch).map_err(|_| malformed())?;

        if digits.len() < 5 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(malformed());
        }
        let sequence: i64 = digits.parse().map_err(|_| malformed())?;
        if sequence < 1 {
            return Err(malformed());
        }

        Ok(BillNumber {
            domain,
            branch,
            sequence,
        })
    }
}

impl fmt::Display for BillNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:05}",
            self.domain.prefix(),
            self.branch,
            self.sequence
        )
    }
}

// ---------------------------------------------------------------------------
// Paise arithmetic
// ---------------------------------------------------------------------------

/// Validated bill amounts. `net = subtotal - discount` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillTotals {
    pub subtotal_paise: i64,
    pub discount_paise: i64,
    pub net_paise: i64,
}

impl BillTotals {
    pub fn new(subtotal_paise: i64, discount_paise: i64) -> Result<Self, BillingError> {
        if subtotal_paise < 0 || discount_paise < 0 || discount_paise > subtotal_paise {
            return Err(BillingError::InvalidAmounts {
                subtotal_paise,
                discount_paise,
            });
        }
        Ok(BillTotals {
            subtotal_paise,
            discount_paise,
            net_paise: subtotal_paise - discount_paise,
        })
    }

    /// Sum snapshot prices into a subtotal, carrying the discount over.
    pub fn from_prices<I>(prices: I, discount_paise: i64) -> Result<Self, BillingError>
    where
        I: IntoIterator<Item = i64>,
    {
        let mut subtotal: i64 = 0;
        for p in prices {
            subtotal = subtotal.checked_add(p).ok_or(BillingError::AmountOverflow)?;
        }
        BillTotals::new(subtotal, discount_paise)
    }
}

/// Render paise as rupees with Indian digit grouping: `1234567` paise is
/// `₹12,345.67`; `123456789` paise is `₹12,34,567.89` (last three digits,
/// then groups of two).
pub fn format_inr(paise: i64) -> String {
    let sign = if paise < 0 { "-" } else { "" };
    let abs = paise.unsigned_abs();
    let rupees = abs / 100;
    let fraction = abs % 100;

    let digits = rupees.to_string();
    let mut grouped = String::new();
    let head_len = if digits.len() > 3 {
        (digits.len() - 3) % 2
    } else {
        0
    };

    for (i, c) in digits.chars().enumerate() {
        if i != 0 {
            let in_tail = i >= digits.len() - 3;
            let boundary = if in_tail {
                i == digits.len() - 3
            } else {
                (i - head_len) % 2 == 0
            };
            if boundary {
                grouped.push(',');
            }
        }
        grouped.push(c);
    }

    format!("{sign}₹{grouped}.{fraction:02}")
}

// ---------------------------------------------------------------------------
// IST timestamps
// ---------------------------------------------------------------------------

/// Human-facing bill timestamp in Asia/Kolkata, e.g. `25 Aug 2026, 02:41 PM IST`.
/// Stored timestamps stay UTC; this is display only.
pub fn format_ist(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Kolkata)
        .format("%d %b %Y, %I:%M %p IST")
        .to_string()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn branch(code: &str) -> BranchCode {
        BranchCode::new(code).unwrap()
    }

    #[test]
    fn bill_number_format_is_bit_exact() {
        let n = BillNumber::new(SequenceDomain::Diagnostic, branch("KOD"), 42);
        assert_eq!(n.to_string(), "D-KOD-00042");

        let first = BillNumber::new(SequenceDomain::Diagnostic, branch("MAIN"), 1);
        assert_eq!(first.to_string(), "D-MAIN-00001");
    }

    #[test]
    fn bill_number_widens_past_five_digits() {
        let n = BillNumber::new(SequenceDomain::Diagnostic, branch("MAIN"), 123_456);
        assert_eq!(n.to_string(), "D-MAIN-123456");
    }

    #[test]
    fn pharmacy_domain_uses_p_prefix() {
        let n = BillNumber::new(SequenceDomain::Pharmacy, branch("KOD"), 7);
        assert_eq!(n.to_string(), "P-KOD-00007");
    }

    #[test]
    fn parse_round_trips_format() {
        for s in ["D-KOD-00042", "D-MAIN-00001", "P-BR2-99999", "D-MAIN-123456"] {
            let parsed = BillNumber::parse(s).unwrap();
            assert_eq!(parsed.to_string(), s, "round trip failed for {s}");
        }
    }

    #[test]
    fn parse_rejects_malformed_inputs() {
        for s in [
            "",
            "D-KOD",
            "X-KOD-00042",
            "DD-KOD-00042",
            "D-kod-00042",
            "D-KOD-0042",
            "D-KOD-0004a",
            "D-KOD-00000",
            "D--00042",
        ] {
            assert!(
                matches!(
                    BillNumber::parse(s),
                    Err(BillingError::MalformedBillNumber { .. })
                ),
                "expected malformed for {s:?}"
            );
        }
    }

    #[test]
    fn branch_code_validation() {
        assert!(BranchCode::new("KOD").is_ok());
        assert!(BranchCode::new("BR2").is_ok());
        assert!(BranchCode::new("MAINLAB8").is_ok());

        for bad in ["", "K", "kod", "KOD-1", "TOOLONGBRANCH", "KO D"] {
            assert!(
                matches!(
                    BranchCode::new(bad),
                    Err(BillingError::InvalidBranchCode { .. })
                ),
                "expected invalid for {bad:?}"
            );
        }
    }

    #[test]
    fn domain_keys_round_trip() {
        assert_eq!(SequenceDomain::Diagnostic.as_key(), "diagnostic");
        assert_eq!(
            SequenceDomain::parse_key("diagnostic").unwrap(),
            SequenceDomain::Diagnostic
        );
        assert_eq!(
            SequenceDomain::parse_key("pharmacy").unwrap(),
            SequenceDomain::Pharmacy
        );
        assert!(SequenceDomain::parse_key("radiology").is_err());
    }

    #[test]
    fn totals_enforce_discount_bounds() {
        let t = BillTotals::new(50_000, 5_000).unwrap();
        assert_eq!(t.net_paise, 45_000);

        assert!(BillTotals::new(1_000, 2_000).is_err());
        assert!(BillTotals::new(-1, 0).is_err());
        assert!(BillTotals::new(1_000, -1).is_err());
    }

    #[test]
    fn totals_sum_line_items() {
        let t = BillTotals::from_prices([25_000, 40_000, 15_000], 0).unwrap();
        assert_eq!(t.subtotal_paise, 80_000);
        assert_eq!(t.net_paise, 80_000);

        assert!(matches!(
            BillTotals::from_prices([i64::MAX, 1], 0),
            Err(BillingError::AmountOverflow)
        ));
    }

    #[test]
    fn inr_grouping_is_indian() {
        assert_eq!(format_inr(0), "₹0.00");
        assert_eq!(format_inr(50), "₹0.50");
        assert_eq!(format_inr(123_45), "₹123.45");
        assert_eq!(format_inr(1_234_56), "₹1,234.56");
        assert_eq!(format_inr(12_345_67), "₹12,345.67");
        assert_eq!(format_inr(123_456_78), "₹1,23,456.78");
        assert_eq!(format_inr(1_234_567_89), "₹12,34,567.89");
        assert_eq!(format_inr(-1_234_56), "-₹1,234.56");
    }

    #[test]
    fn ist_rendering_is_stable() {
        let ts = Utc.with_ymd_and_hms(2026, 8, 25, 9, 11, 0).unwrap();
        // IST is UTC+05:30.
        assert_eq!(format_ist(ts), "25 Aug 2026, 02:41 PM IST");
    }
}
