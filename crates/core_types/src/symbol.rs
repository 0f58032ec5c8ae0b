/// Expand a configured symbol token into a full perp instrument id.
/// Short asset tokens (`btc`) map to the USDT perpetual; anything that
/// already carries dashes is taken as a literal instrument id.
pub fn normalize_symbol(token: &str) -> Option<String> {
    let t = token.trim();
    if t.is_empty() {
        return None;
    }
    let upper = t.to_ascii_uppercase();
    if upper.contains('-') {
        Some(upper)
    } else {
        Some(format!("{upper}-USDT-SWAP"))
    }
}

/// Parse a comma-separated symbol list, normalizing and deduplicating
/// while preserving first-seen order.
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in raw.split(',') {
        if let Some(sym) = normalize_symbol(token) {
            if !out.contains(&sym) {
                out.push(sym);
            }
        }
    }
    out
}
