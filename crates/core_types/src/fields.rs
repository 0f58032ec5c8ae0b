use std::collections::HashMap;

/// Flat string map as it arrives off the bus. All numeric wire values are
/// decimal strings; decoding into precise types happens here, once, at the
/// edge.
pub type Fields = HashMap<String, String>;

/// First present-and-finite f64 among the given aliases.
pub fn get_f64(fields: &Fields, keys: &[&str]) -> Option<f64> {
    for k in keys {
        if let Some(raw) = fields.get(*k) {
            if let Ok(v) = raw.trim().parse::<f64>() {
                if v.is_finite() {
                    return Some(v);
                }
            }
        }
    }
    None
}

pub fn get_i64(fields: &Fields, keys: &[&str]) -> Option<i64> {
    for k in keys {
        if let Some(raw) = fields.get(*k) {
            let raw = raw.trim();
            if let Ok(v) = raw.parse::<i64>() {
                return Some(v);
            }
            // Ingress occasionally stringifies integers through a float path.
            if let Ok(v) = raw.parse::<f64>() {
                if v.is_finite() {
                    return Some(v as i64);
                }
            }
        }
    }
    None
}

pub fn get_bool(fields: &Fields, keys: &[&str]) -> Option<bool> {
    for k in keys {
        if let Some(raw) = fields.get(*k) {
            return Some(matches!(raw.trim(), "1" | "true" | "TRUE" | "True"));
        }
    }
    None
}

pub fn get_str<'a>(fields: &'a Fields, keys: &[&str]) -> Option<&'a str> {
    for k in keys {
        if let Some(raw) = fields.get(*k) {
            if !raw.is_empty() {
                return Some(raw.as_str());
            }
        }
    }
    None
}

/// Decimal rendering for the wire. Rust's float Display never switches to
/// scientific notation, which keeps every field parseable as a plain decimal.
pub fn fmt_f64(v: f64) -> String {
    if v.is_finite() {
        format!("{v}")
    } else {
        "0".to_string()
    }
}

pub fn fmt_bool(v: bool) -> String {
    if v { "1" } else { "0" }.to_string()
}

/// Push a field unless its value is empty; the bus contract omits
/// null-equivalent fields instead of writing empty strings.
pub fn push_field(dst: &mut Vec<(String, String)>, key: &str, value: String) {
    if !value.is_empty() {
        dst.push((key.to_string(), value));
    }
}
