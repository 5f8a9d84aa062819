use std::sync::OnceLock;

use regex::Regex;

fn dns_label() -> Option<&'static Regex> {
    static LABEL: OnceLock<Option<Regex>> = OnceLock::new();
    LABEL
        .get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").ok())
        .as_ref()
}

/// True for names this service may read or delete: a DNS-1123 label
/// starting with `{template}-`.
pub fn is_managed_name(template: &str, name: &str) -> bool {
    name.len() > template.len() + 1
        && name.starts_with(template)
        && name.as_bytes()[template.len()] == b'-'
        && dns_label().is_some_and(|re| re.is_match(name))
}

/// `{template}-{unix_secs}`, with a numeric suffix when that collides with
/// `previous`.
pub fn next_run_id(template: &str, unix_secs: i64, previous: Option<&str>) -> String {
    let base = format!("{template}-{unix_secs}");
    let Some(previous) = previous else {
        return base;
    };
    if previous == base {
        return format!("{base}-1");
    }
    match previous
        .strip_prefix(base.as_str())
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|n| n.parse::<u32>().ok())
    {
        Some(n) => format!("{base}-{}", n + 1),
        None => base,
    }
}
