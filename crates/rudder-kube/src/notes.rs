//! Notes extraction from rendered output

use indexmap::IndexMap;
use rudder_core::Chart;

/// File name suffix of rendered notes
pub const NOTES_SUFFIX: &str = "NOTES.txt";

/// Remove every notes file from `files` and return the kept notes text.
///
/// Only the entry chart's `templates/NOTES.txt` is kept unless `sub_notes`
/// is set, in which case every notes file is kept in encounter order.
/// Kept texts are joined by exactly one blank line.
pub fn extract_notes(
    files: &mut IndexMap<String, String>,
    chart: &Chart,
    sub_notes: bool,
) -> Option<String> {
    let root_notes = chart.notes_path();
    let mut kept: Vec<String> = Vec::new();

    files.retain(|path, text| {
        if !path.ends_with(NOTES_SUFFIX) {
            return true;
        }
        if sub_notes || *path == root_notes {
            let trimmed = text.trim_end_matches(['\n', '\r']);
            if !trimmed.trim().is_empty() {
                kept.push(trimmed.to_string());
            }
        }
        false
    });

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::ChartMetadata;
    use semver::Version;

    fn chart() -> Chart {
        Chart::new(ChartMetadata::new("web", Version::new(1, 0, 0)))
    }

    fn rendered() -> IndexMap<String, String> {
        let mut files = IndexMap::new();
        files.insert("web/templates/NOTES.txt".to_string(), "A\n".to_string());
        files.insert("web/templates/svc.yaml".to_string(), "kind: Service".to_string());
        files.insert("web/charts/db/templates/NOTES.txt".to_string(), "B".to_string());
        files
    }

    #[test]
    fn test_root_notes_only_by_default() {
        let mut files = rendered();
        let notes = extract_notes(&mut files, &chart(), false);
        assert_eq!(notes.as_deref(), Some("A"));
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("web/templates/svc.yaml"));
    }

    #[test]
    fn test_sub_notes_joined_by_blank_line() {
        let mut files = rendered();
        let notes = extract_notes(&mut files, &chart(), true);
        assert_eq!(notes.as_deref(), Some("A\n\nB"));
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_no_notes() {
        let mut files = IndexMap::new();
        files.insert("web/templates/NOTES.txt".to_string(), "\n".to_string());
        assert_eq!(extract_notes(&mut files, &chart(), false), None);
        assert!(files.is_empty());
    }
}
