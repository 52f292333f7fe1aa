//! PromQL template handling: `{{placeholder}}` substitution and a static
//! cost heuristic

use std::collections::{BTreeSet, HashMap};

use crate::registry::{RegistryItem, Service, ServiceRegistry};

/// Outcome of resolving a template against a request
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    pub promql: String,
    /// Placeholder names left verbatim in `promql`
    pub unresolved: Vec<String>,
    /// Service the request was resolved against, if any
    pub service: Option<Service>,
}

impl Substitution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Placeholder names in order of first appearance
pub fn placeholders(template: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut names = Vec::new();
    scan(template, |name| {
        if seen.insert(name.to_string()) {
            names.push(name.to_string());
        }
        None
    });
    names
}

/// Walk `{{ name }}` tokens, replacing those for which `resolve` returns a value
fn scan(template: &str, mut resolve: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) if is_identifier(after[..end].trim()) => {
                let name = after[..end].trim();
                match resolve(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            _ => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escape a value for use inside a double-quoted label matcher
fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Find the service a request is about: an explicit `service` context key
/// wins, otherwise the first registered service named in the query text
pub fn resolve_service(
    query: &str,
    context: &HashMap<String, String>,
    registry: &dyn ServiceRegistry,
) -> Option<Service> {
    if let Some(name) = context.get("service") {
        return match registry.lookup(name) {
            Some(RegistryItem::Service(service)) => Some(service),
            _ => None,
        };
    }
    let lowered = query.to_lowercase();
    registry
        .list_services()
        .into_iter()
        .find(|s| !s.name.is_empty() && lowered.contains(&s.name.to_lowercase()))
}

/// Fill placeholders from, in order: request context, `time_range`, and the
/// resolved service (`service`, `namespace`, then service labels).
///
/// Range placeholders sit unquoted inside `[...]`, so they only take the
/// request's `time_range` or a context value that parses as a duration.
pub fn substitute(
    template: &str,
    query: &str,
    context: &HashMap<String, String>,
    time_range: Option<&str>,
    registry: &dyn ServiceRegistry,
) -> Substitution {
    let service = resolve_service(query, context, registry);
    let mut unresolved = Vec::new();

    let promql = scan(template, |name| {
        let value = match name {
            "time_range" | "range" => time_range
                .or_else(|| {
                    context
                        .get(name)
                        .map(|v| v.trim())
                        .filter(|v| parse_duration_secs(v).is_some())
                })
                .map(str::to_string),
            _ => context.get(name).cloned().or_else(|| match name {
                "service" => service.as_ref().map(|s| s.name.clone()),
                "namespace" => service.as_ref().map(|s| s.namespace.clone()),
                _ => service.as_ref().and_then(|s| s.labels.get(name).cloned()),
            }),
        };
        if value.is_none() && !unresolved.iter().any(|u| u == name) {
            unresolved.push(name.to_string());
        }
        value.map(|v| escape_label_value(&v))
    });

    Substitution {
        promql,
        unresolved,
        service,
    }
}

const AGGREGATIONS: &[&str] = &[
    "sum", "avg", "min", "max", "count", "group", "stddev", "stdvar", "topk", "bottomk",
    "quantile", "count_values",
];

const RANGE_FUNCTIONS: &[&str] = &[
    "rate", "irate", "increase", "delta", "idelta", "deriv", "predict_linear", "resets",
    "changes", "avg_over_time", "min_over_time", "max_over_time", "sum_over_time",
    "count_over_time", "quantile_over_time", "stddev_over_time", "last_over_time",
];

/// Parse a PromQL duration such as `5m`, `1h30m` or `250ms` into seconds
pub fn parse_duration_secs(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut total = 0.0;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let (unit, width) = if rest.starts_with("ms") {
            (0.001, 2)
        } else {
            let factor = match rest.chars().next()? {
                's' => 1.0,
                'm' => 60.0,
                'h' => 3_600.0,
                'd' => 86_400.0,
                'w' => 604_800.0,
                'y' => 31_536_000.0,
                _ => return None,
            };
            (factor, 1)
        };
        total += value * unit;
        rest = &rest[width..];
    }
    Some(total)
}

/// Identifiers immediately followed by `(`, lowercased
fn function_calls(promql: &str) -> Vec<String> {
    let mut calls = Vec::new();
    let bytes = promql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let mut j = i;
            while j < bytes.len() && bytes[j] == b' ' {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'(' {
                calls.push(promql[start..i].to_ascii_lowercase());
            }
        } else {
            i += 1;
        }
    }
    calls
}

/// Relative evaluation cost of a PromQL expression.
///
/// Static heuristic: one unit per selector, range windows weighted by length,
/// extra weight for aggregations, range functions, `histogram_quantile` and
/// subqueries. Only useful for comparing candidate queries.
pub fn estimate_cost(promql: &str) -> f64 {
    let selectors = promql
        .matches('{')
        .count()
        .saturating_sub(promql.matches("{{").count() * 2);
    let mut cost = 1.0 + selectors.max(1) as f64;

    let mut rest = promql;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else { break };
        let window = &after[..close];
        match window.split_once(':') {
            Some((range, _step)) => {
                cost += 5.0;
                cost += parse_duration_secs(range).unwrap_or(0.0) / 600.0;
            }
            None => cost += parse_duration_secs(window).unwrap_or(0.0) / 600.0,
        }
        rest = &after[close + 1..];
    }

    for call in function_calls(promql) {
        if AGGREGATIONS.contains(&call.as_str()) {
            cost += 2.0;
        } else if RANGE_FUNCTIONS.contains(&call.as_str()) {
            cost += 1.5;
        } else if call == "histogram_quantile" {
            cost += 3.0;
        } else if call != "by" && call != "without" && call != "on" && call != "ignoring" {
            cost += 0.5;
        }
    }

    (cost * 100.0).round() / 100.0
}
