//! Parsing of the Prometheus text exposition format into flat samples.
//! Comment, `HELP` and `TYPE` lines carry no sample data and are
//! skipped, as are malformed lines.

use crate::labels::LabelSet;

#[derive(Clone, Debug, PartialEq)]
pub struct ScrapedSample {
    pub name: String,
    pub labels: LabelSet,
    pub value: f64,
    /// Milliseconds since the Unix epoch, if the line carried one.
    pub timestamp: Option<i64>,
}

pub fn parse_text(input: &str) -> Vec<ScrapedSample> {
    input.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<ScrapedSample> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let name_end = line.find(|c: char| c == '{' || c.is_whitespace())?;
    let name = &line[..name_end];
    if name.is_empty() {
        return None;
    }

    let mut rest = &line[name_end..];
    let mut labels = LabelSet::new();
    if let Some(inner) = rest.strip_prefix('{') {
        let (parsed, after) = parse_labels(inner)?;
        labels = parsed;
        rest = after;
    }

    let mut parts = rest.split_whitespace();
    let value = parse_value(parts.next()?)?;
    let timestamp = match parts.next() {
        Some(millis) => Some(millis.parse().ok()?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }

    Some(ScrapedSample {
        name: name.to_string(),
        labels,
        value,
        timestamp,
    })
}

fn parse_labels(mut input: &str) -> Option<(LabelSet, &str)> {
    let mut labels = LabelSet::new();

    loop {
        input = input.trim_start();
        if let Some(rest) = input.strip_prefix('}') {
            return Some((labels, rest));
        }

        let assign = input.find('=')?;
        let name = input[..assign].trim();
        if name.is_empty() {
            return None;
        }

        input = input[assign + 1..].trim_start().strip_prefix('"')?;

        let mut value = String::new();
        let mut end = None;
        let mut chars = input.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, escaped)) => value.push(escaped),
                    None => return None,
                },
                '"' => {
                    end = Some(i);
                    break;
                }
                other => value.push(other),
            }
        }

        labels.insert(name, value);
        input = input[end? + 1..].trim_start();
        input = input.strip_prefix(',').unwrap_or(input);
    }
}

fn parse_value(input: &str) -> Option<f64> {
    match input {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        _ => input.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().map(|(n, v)| (*n, *v)).collect()
    }

    #[test]
    fn typical_exposition() {
        let samples = parse_text(
            r#"
# HELP http_requests_total The total number of HTTP requests.
# TYPE http_requests_total counter
http_requests_total{method="post",code="200"} 1027 1395066363000
http_requests_total{method="post",code="400"}    3 1395066363000

metric_without_timestamp_and_labels 12.47
"#,
        );

        assert_eq!(
            samples,
            vec![
                ScrapedSample {
                    name: "http_requests_total".into(),
                    labels: labels(&[("method", "post"), ("code", "200")]),
                    value: 1027.0,
                    timestamp: Some(1395066363000),
                },
                ScrapedSample {
                    name: "http_requests_total".into(),
                    labels: labels(&[("method", "post"), ("code", "400")]),
                    value: 3.0,
                    timestamp: Some(1395066363000),
                },
                ScrapedSample {
                    name: "metric_without_timestamp_and_labels".into(),
                    labels: LabelSet::new(),
                    value: 12.47,
                    timestamp: None,
                },
            ],
        );
    }

    #[test]
    fn escaped_label_values() {
        let samples = parse_text(r#"msdos_file_access_time{path="C:\\DIR\\FILE.TXT",error="Cannot find file:\n\"FILE.TXT\""} 1.458255915e9"#);

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels.get("path"), Some(r"C:\DIR\FILE.TXT"));
        assert_eq!(
            samples[0].labels.get("error"),
            Some("Cannot find file:\n\"FILE.TXT\""),
        );
    }

    #[test]
    fn special_values() {
        let samples = parse_text("a +Inf\nb -Inf\nc NaN");
        assert_eq!(samples[0].value, f64::INFINITY);
        assert_eq!(samples[1].value, f64::NEG_INFINITY);
        assert!(samples[2].value.is_nan());
    }

    #[test]
    fn malformed_lines_skipped() {
        let samples = parse_text(
            "good 1\n\
             {nameless=\"x\"} 1\n\
             no_value\n\
             bad_value x\n\
             unterminated{a=\"b 1\n\
             trailing 1 2 3",
        );

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "good");
    }
}
