use serde::Serialize;

/// One band of a grade scale: the half-open percentage interval
/// `[min_percent, max_percent)` mapped to a label.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub label: String,
    pub min_percent: f64,
    pub max_percent: f64,
}

/// Parses a scale definition: one `label;min;max` record per line. Lines
/// with a wrong field count or non-numeric bounds are skipped, not errors.
/// Input order is preserved; lookup is first-match, so order matters.
pub fn parse_definition(definition: &str) -> Vec<GradeBand> {
    let mut bands = Vec::new();
    for line in definition.lines() {
        let parts: Vec<&str> = line.split(';').map(|p| p.trim()).collect();
        if parts.len() != 3 {
            continue;
        }
        let (Ok(min_percent), Ok(max_percent)) =
            (parts[1].parse::<f64>(), parts[2].parse::<f64>())
        else {
            continue;
        };
        bands.push(GradeBand {
            label: parts[0].to_string(),
            min_percent,
            max_percent,
        });
    }
    bands
}

/// First band with `min <= percent < max` wins. Gaps and overlaps are the
/// scale author's responsibility; no match means no grade.
pub fn grade_for_percent(bands: &[GradeBand], percent: f64) -> Option<&str> {
    bands
        .iter()
        .find(|b| percent >= b.min_percent && percent < b.max_percent)
        .map(|b| b.label.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_lines_are_skipped() {
        let bands = parse_definition("1.0;93.0;100.1\nX;abc;10\nonly;two\n2.0;79.0;86.0\n");
        assert_eq!(bands.len(), 2);
        assert_eq!(bands[0].label, "1.0");
        assert_eq!(bands[1].label, "2.0");
    }

    #[test]
    fn lookup_is_first_match_in_input_order() {
        // Deliberately overlapping: the earlier band must win.
        let bands = parse_definition("good;50.0;100.0\nbad;60.0;100.0");
        assert_eq!(grade_for_percent(&bands, 75.0), Some("good"));
    }

    #[test]
    fn interval_is_half_open() {
        let bands = parse_definition("2.0;79.0;86.0");
        assert_eq!(grade_for_percent(&bands, 79.0), Some("2.0"));
        assert_eq!(grade_for_percent(&bands, 85.999), Some("2.0"));
        assert_eq!(grade_for_percent(&bands, 86.0), None);
        assert_eq!(grade_for_percent(&bands, 78.999), None);
    }

    #[test]
    fn empty_definition_yields_no_bands() {
        assert!(parse_definition("").is_empty());
        assert!(parse_definition(";;\nnot a band").is_empty());
    }
}
