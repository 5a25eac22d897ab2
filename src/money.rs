// Fixed-point money arithmetic
//
// Amounts are integer minor units (cents / kopecks). Rates are basis points
// so fee and bonus computations never touch floats.

pub type Amount = i64;

const BASIS_POINTS: i64 = 10_000;

/// Round-half-up share of `amount` at `rate_bp` basis points.
pub fn share_bp(amount: Amount, rate_bp: u32) -> Amount {
    (amount * rate_bp as i64 + BASIS_POINTS / 2) / BASIS_POINTS
}

/// Remainder after deducting a percentage fee given in basis points.
pub fn net_after_fee_bp(gross: Amount, fee_bp: u32) -> Amount {
    gross - share_bp(gross, fee_bp)
}

/// Format minor units as a major-unit decimal string, e.g. 1900 -> "19.00".
pub fn format_major(amount: Amount) -> String {
    format!("{}.{:02}", amount / 100, (amount % 100).abs())
}

/// Parse a major-unit decimal string into minor units. Fractional digits
/// beyond two are dropped; provider APIs do not quote sub-cent amounts.
pub fn parse_major(s: &str) -> Option<Amount> {
    let s = s.trim();
    let (sign, s) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s),
    };
    let mut parts = s.splitn(2, '.');
    let whole: i64 = parts.next()?.parse().ok()?;
    let cents = match parts.next() {
        None | Some("") => 0,
        Some(frac) if frac.len() == 1 => frac.parse::<i64>().ok()? * 10,
        Some(frac) => frac.get(..2)?.parse::<i64>().ok()?,
    };
    Some(sign * (whole * 100 + cents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_rounds_half_up() {
        assert_eq!(share_bp(9500, 2000), 1900);
        assert_eq!(share_bp(25, 5000), 13); // 12.5 rounds up
        assert_eq!(share_bp(999, 2000), 200); // 199.8 rounds to 200
        assert_eq!(share_bp(0, 2000), 0);
    }

    #[test]
    fn test_net_after_fee() {
        assert_eq!(net_after_fee_bp(10000, 500), 9500);
        assert_eq!(net_after_fee_bp(10000, 0), 10000);
        assert_eq!(net_after_fee_bp(1, 500), 1); // fee rounds to zero
    }

    #[test]
    fn test_format_major() {
        assert_eq!(format_major(1900), "19.00");
        assert_eq!(format_major(9550), "95.50");
        assert_eq!(format_major(5), "0.05");
        assert_eq!(format_major(0), "0.00");
    }

    #[test]
    fn test_parse_major() {
        assert_eq!(parse_major("95"), Some(9500));
        assert_eq!(parse_major("95.5"), Some(9550));
        assert_eq!(parse_major("95.50"), Some(9550));
        assert_eq!(parse_major("100.123"), Some(10012));
        assert_eq!(parse_major(" 19.00 "), Some(1900));
        assert_eq!(parse_major("abc"), None);
        assert_eq!(parse_major(""), None);
    }
}
