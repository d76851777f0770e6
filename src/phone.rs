//! E.164 normalization and number ranking helpers.

use crate::error::GatewayError;

/// Minimum digits after the `+` in a valid E.164 number.
const MIN_E164_DIGITS: usize = 8;

/// Maximum digits after the `+` in a valid E.164 number.
const MAX_E164_DIGITS: usize = 15;

/// Normalize a user- or carrier-supplied phone number into E.164.
///
/// Accepts common punctuation (spaces, dashes, dots, parentheses), a leading
/// `00` international prefix, bare 10-digit NANP numbers, and 11-digit NANP
/// numbers starting with `1`.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidArgument`] when the input cannot be
/// normalized to `+[1-9]` followed by 7–14 more digits.
pub fn normalize_e164(raw: &str) -> Result<String, GatewayError> {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');
    let mut digits = String::with_capacity(trimmed.len());
    for (idx, ch) in trimmed.chars().enumerate() {
        match ch {
            '0'..='9' => digits.push(ch),
            '+' if idx == 0 => {}
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return Err(invalid(raw)),
        }
    }

    let international = if has_plus {
        digits
    } else if let Some(rest) = digits.strip_prefix("00") {
        rest.to_owned()
    } else if digits.len() == 10 {
        format!("1{digits}")
    } else if digits.len() == 11 && digits.starts_with('1') {
        digits
    } else {
        return Err(invalid(raw));
    };

    if international.len() < MIN_E164_DIGITS
        || international.len() > MAX_E164_DIGITS
        || international.starts_with('0')
    {
        return Err(invalid(raw));
    }
    Ok(format!("+{international}"))
}

fn invalid(raw: &str) -> GatewayError {
    GatewayError::InvalidArgument(format!("not a valid E.164 phone number: {raw:?}"))
}

/// Returns the three-digit area code of a NANP (`+1`) number.
pub fn area_code_of(e164: &str) -> Option<&str> {
    let national = e164.strip_prefix("+1")?;
    if national.len() != 10 {
        return None;
    }
    national.get(..3)
}

/// Best-effort ISO country for numbers first seen without upstream metadata.
///
/// Covers the calling codes the pool is provisioned in; anything else is
/// reported as `ZZ` (unknown region).
pub fn country_hint(e164: &str) -> &'static str {
    const PREFIXES: [(&str, &str); 5] = [
        ("+1", "US"),
        ("+44", "GB"),
        ("+61", "AU"),
        ("+33", "FR"),
        ("+49", "DE"),
    ];
    PREFIXES
        .iter()
        .find(|(prefix, _)| e164.starts_with(*prefix))
        .map_or("ZZ", |(_, country)| *country)
}

/// Rank how memorable the last four digits of a number are.
///
/// `3` = all four identical (`7777`), `2` = straight run (`1234`, `9876`),
/// `1` = repeated pair (`1212`, `3344`), `0` = nothing notable.
pub fn vanity_score(e164: &str) -> u8 {
    let tail: Vec<u32> = e164
        .chars()
        .rev()
        .take(4)
        .filter_map(|c| c.to_digit(10))
        .collect();
    let [d, c, b, a] = match tail.as_slice() {
        [d, c, b, a] => [*d, *c, *b, *a],
        _ => return 0,
    };

    if a == b && b == c && c == d {
        return 3;
    }
    let ascending = b == a.wrapping_add(1) && c == b.wrapping_add(1) && d == c.wrapping_add(1);
    let descending =
        a == b.wrapping_add(1) && b == c.wrapping_add(1) && c == d.wrapping_add(1);
    if ascending || descending {
        return 2;
    }
    if (a == c && b == d) || (a == b && c == d) {
        return 1;
    }
    0
}
