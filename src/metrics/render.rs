// Text exposition of merged multi-process snapshots

use std::fmt::Write;

use super::multiprocess::{FamilySnapshot, SampleValue};
use super::MetricKind;

/// Render merged families in the Prometheus text format (version 0.0.4)
pub fn render_families(families: &[FamilySnapshot]) -> String {
    let mut output = String::new();

    for family in families {
        if family.samples.is_empty() {
            continue;
        }

        let _ = writeln!(output, "# HELP {} {}", family.name, escape_help(&family.help));
        let _ = writeln!(output, "# TYPE {} {}", family.name, type_name(family.kind));

        for sample in &family.samples {
            let pairs: Vec<(&str, &str)> = family
                .label_names
                .iter()
                .map(String::as_str)
                .zip(sample.labels.iter().map(String::as_str))
                .collect();

            match &sample.value {
                SampleValue::Counter { value } | SampleValue::Gauge { value, .. } => {
                    let _ = writeln!(
                        output,
                        "{}{} {}",
                        family.name,
                        format_labels(&pairs, None),
                        format_value(*value)
                    );
                }
                SampleValue::Histogram {
                    buckets,
                    sum,
                    count,
                } => {
                    for bucket in buckets {
                        let le = format_value(bucket.upper_bound);
                        let _ = writeln!(
                            output,
                            "{}_bucket{} {}",
                            family.name,
                            format_labels(&pairs, Some(&le)),
                            bucket.cumulative
                        );
                    }
                    let _ = writeln!(
                        output,
                        "{}_bucket{} {}",
                        family.name,
                        format_labels(&pairs, Some("+Inf")),
                        count
                    );
                    let _ = writeln!(
                        output,
                        "{}_sum{} {}",
                        family.name,
                        format_labels(&pairs, None),
                        format_value(*sum)
                    );
                    let _ = writeln!(
                        output,
                        "{}_count{} {}",
                        family.name,
                        format_labels(&pairs, None),
                        count
                    );
                }
            }
        }
    }

    output
}

fn type_name(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Counter => "counter",
        MetricKind::Histogram => "histogram",
        MetricKind::Gauge => "gauge",
    }
}

fn format_labels(pairs: &[(&str, &str)], le: Option<&str>) -> String {
    if pairs.is_empty() && le.is_none() {
        return String::new();
    }
    let mut rendered: Vec<String> = pairs
        .iter()
        .map(|(name, value)| format!("{}=\"{}\"", name, escape_label_value(value)))
        .collect();
    if let Some(le) = le {
        rendered.push(format!("le=\"{}\"", le));
    }
    format!("{{{}}}", rendered.join(","))
}

// Integral values print without a fractional part, as the prometheus encoder does
fn format_value(value: f64) -> String {
    if value.is_infinite() {
        return if value > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }
    if value.is_nan() {
        return "NaN".to_string();
    }
    format!("{}", value)
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
