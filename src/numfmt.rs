//! INDI numeric format strings
//!
//! Number elements carry a printf-style format used for display. Beyond the
//! usual `%<w>.<p>f`, INDI defines a sexagesimal `m` conversion: `%<w>.<p>m`
//! where the fraction width selects the sub-minute resolution. Inbound
//! number bodies may likewise arrive in sexagesimal form (`H:M:S`).

/// Format a value for display using an INDI format string. Unrecognized
/// formats fall back to the general float representation.
pub fn format_number(value: f64, format: Option<&str>) -> String {
    let Some(format) = format else {
        return general(value);
    };
    let spec = format.trim();
    if let Some((_, frac)) = parse_spec(spec, 'm') {
        let fracbase = match frac {
            9 => 360000,
            8 => 36000,
            6 => 3600,
            5 => 600,
            _ => 60,
        };
        return fs_sexa(value, fracbase);
    }
    if let Some((_, frac)) = parse_spec(spec, 'f') {
        return format!("{:.*}", frac as usize, value);
    }
    general(value)
}

/// Parse a number body, accepting plain floats and sexagesimal forms
/// (`-12:30:45`, `12 30 45`, `12:30`).
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    let negative = trimmed.starts_with('-');
    let unsigned = trimmed.trim_start_matches(['-', '+']);
    let mut parts = unsigned
        .split(|c: char| c == ':' || c == ';' || c.is_whitespace())
        .filter(|s| !s.is_empty());

    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => return None,
    };
    let seconds: f64 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0.0,
    };
    let magnitude = hours + minutes / 60.0 + seconds / 3600.0;
    Some(if negative { -magnitude } else { magnitude })
}

/// Sexagesimal rendering at a given fraction base (units per degree/hour).
fn fs_sexa(value: f64, fracbase: i64) -> String {
    let negative = value < 0.0;
    let magnitude = value.abs();

    let total = (magnitude * fracbase as f64 + 0.5) as i64;
    let whole = total / fracbase;
    let frac = total % fracbase;

    let sign = if negative { "-" } else { "" };
    match fracbase {
        600 => format!("{}{}:{:02}.{}", sign, whole, frac / 10, frac % 10),
        3600 => format!("{}{}:{:02}:{:02}", sign, whole, frac / 60, frac % 60),
        36000 => format!(
            "{}{}:{:02}:{:02}.{}",
            sign,
            whole,
            frac / 600,
            (frac / 10) % 60,
            frac % 10
        ),
        360000 => format!(
            "{}{}:{:02}:{:02}.{:02}",
            sign,
            whole,
            frac / 6000,
            (frac / 100) % 60,
            frac % 100
        ),
        // base 60: whole minutes only
        _ => format!("{}{}:{:02}", sign, whole, frac),
    }
}

fn general(value: f64) -> String {
    format!("{}", value)
}

/// Extract `(width, frac)` from `%<w>.<p><conv>` for the given conversion
/// character. Returns `None` when the string is not of that shape.
fn parse_spec(spec: &str, conv: char) -> Option<(u32, u32)> {
    let body = spec.strip_prefix('%')?.strip_suffix(conv)?;
    let (width, frac) = match body.split_once('.') {
        Some((w, f)) => (w, f),
        None => (body, ""),
    };
    let width = if width.is_empty() {
        0
    } else {
        width.parse().ok()?
    };
    let frac = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    Some((width, frac))
}
