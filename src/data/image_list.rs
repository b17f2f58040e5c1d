use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntry {
    pub path: PathBuf,
    pub label: i64,
}

/// Parse `relative/path.JPEG <label>` lines; blank lines and `#` comments are skipped.
///
/// Paths are joined onto `img_dir`. The label is the last whitespace-separated
/// field, so paths may themselves contain spaces.
pub fn parse_image_list(text: &str, img_dir: &Path, num_classes: usize) -> Result<Vec<ImageEntry>> {
    let line_re = Regex::new(r"^(.+?)\s+(\d+)$")?;
    let mut entries = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let caps = line_re
            .captures(line)
            .with_context(|| format!("Malformed image list line {}: {:?}", line_no + 1, line))?;
        let label: i64 = caps[2]
            .parse()
            .with_context(|| format!("Invalid label on line {}", line_no + 1))?;
        if label as usize >= num_classes {
            anyhow::bail!(
                "Label {} on line {} is out of range for {} classes",
                label,
                line_no + 1,
                num_classes
            );
        }

        entries.push(ImageEntry {
            path: img_dir.join(&caps[1]),
            label,
        });
    }

    Ok(entries)
}

pub fn read_image_list(list: &Path, img_dir: &Path, num_classes: usize) -> Result<Vec<ImageEntry>> {
    let text = fs::read_to_string(list)
        .with_context(|| format!("Failed to read image list: {:?}", list))?;
    let entries = parse_image_list(&text, img_dir, num_classes)
        .with_context(|| format!("Failed to parse image list: {:?}", list))?;
    if entries.is_empty() {
        anyhow::bail!("No images listed in {:?}", list);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_list() {
        let text = "# train split\n\nn01440764/a.JPEG 0\n  n01443537/b c.JPEG 1  \n";
        let entries = parse_image_list(text, Path::new("/imgs"), 10).unwrap();
        assert_eq!(
            entries,
            vec![
                ImageEntry {
                    path: PathBuf::from("/imgs/n01440764/a.JPEG"),
                    label: 0
                },
                ImageEntry {
                    path: PathBuf::from("/imgs/n01443537/b c.JPEG"),
                    label: 1
                },
            ]
        );
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let err = parse_image_list("a.JPEG 0\nbroken\n", Path::new("/imgs"), 10).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_label_out_of_range() {
        assert!(parse_image_list("a.JPEG 10\n", Path::new("/imgs"), 10).is_err());
    }
}
