//! Calibration persistence in the OpenCV FileStorage formats.
//!
//! The file holds two matrices, `calib_rot_transform` (3x3) and
//! `calib_origin` (1x3), both 32-bit float. The flavor is inferred from the
//! file extension: `.xml` for the XML dialect, `.yml`/`.yaml` for the YAML
//! dialect (`%YAML:1.0` with `!!opencv-matrix` tags). Files written by
//! OpenCV load unchanged, and files written here parse back bit-for-bit.

use std::fs;
use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

use crate::cloud::CalibrationTransform;

const ROT_KEY: &str = "calib_rot_transform";
const ORIGIN_KEY: &str = "calib_origin";

#[derive(Debug, Error)]
pub enum CalibFileError {
    #[error("failed to access calibration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported calibration file extension in {0:?} (expected xml, yml, or yaml)")]
    UnknownExtension(String),
    #[error("malformed calibration file: {0}")]
    Malformed(String),
    #[error("calibration entry {0:?} is missing")]
    MissingEntry(&'static str),
}

#[derive(Clone, Copy)]
enum Flavor {
    Xml,
    Yaml,
}

fn flavor_of(path: &Path) -> Result<Flavor, CalibFileError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("xml") => Ok(Flavor::Xml),
        Some("yml") | Some("yaml") => Ok(Flavor::Yaml),
        _ => Err(CalibFileError::UnknownExtension(
            path.display().to_string(),
        )),
    }
}

pub fn save(path: &Path, transform: &CalibrationTransform) -> Result<(), CalibFileError> {
    let rot: Vec<f32> = (0..3)
        .flat_map(|r| (0..3).map(move |c| (r, c)))
        .map(|(r, c)| transform.rot[(r, c)])
        .collect();
    let origin = [
        transform.origin.x,
        transform.origin.y,
        transform.origin.z,
    ];

    let text = match flavor_of(path)? {
        Flavor::Xml => {
            let mut out = String::from("<?xml version=\"1.0\"?>\n<opencv_storage>\n");
            write_matrix_xml(&mut out, ROT_KEY, 3, 3, &rot);
            write_matrix_xml(&mut out, ORIGIN_KEY, 1, 3, &origin);
            out.push_str("</opencv_storage>\n");
            out
        }
        Flavor::Yaml => {
            let mut out = String::from("%YAML:1.0\n---\n");
            write_matrix_yaml(&mut out, ROT_KEY, 3, 3, &rot);
            write_matrix_yaml(&mut out, ORIGIN_KEY, 1, 3, &origin);
            out
        }
    };
    fs::write(path, text)?;
    Ok(())
}

pub fn load(path: &Path) -> Result<CalibrationTransform, CalibFileError> {
    let flavor = flavor_of(path)?;
    let text = fs::read_to_string(path)?;
    let (rot, origin) = match flavor {
        Flavor::Xml => {
            let doc = roxmltree::Document::parse(&text)
                .map_err(|e| CalibFileError::Malformed(e.to_string()))?;
            let root = doc.root_element();
            (
                read_matrix_xml(root, ROT_KEY, 3, 3)?,
                read_matrix_xml(root, ORIGIN_KEY, 1, 3)?,
            )
        }
        Flavor::Yaml => (
            read_matrix_yaml(&text, ROT_KEY, 3, 3)?,
            read_matrix_yaml(&text, ORIGIN_KEY, 1, 3)?,
        ),
    };

    Ok(CalibrationTransform {
        rot: Matrix3::from_row_slice(&rot),
        origin: Vector3::new(origin[0], origin[1], origin[2]),
    })
}

/// Scientific notation round-trips every f32 bit pattern; OpenCV's reader
/// accepts it as-is.
fn format_float(value: f32) -> String {
    if value == 0.0 {
        // keep the sign of negative zero through the round trip
        if value.is_sign_negative() { "-0." } else { "0." }.to_string()
    } else {
        format!("{value:e}")
    }
}

fn write_matrix_xml(out: &mut String, name: &str, rows: usize, cols: usize, data: &[f32]) {
    out.push_str(&format!(
        "<{name} type_id=\"opencv-matrix\">\n  <rows>{rows}</rows>\n  <cols>{cols}</cols>\n  <dt>f</dt>\n  <data>\n    "
    ));
    let rendered: Vec<String> = data.iter().map(|&v| format_float(v)).collect();
    out.push_str(&rendered.join(" "));
    out.push_str(&format!("</data></{name}>\n"));
}

fn write_matrix_yaml(out: &mut String, name: &str, rows: usize, cols: usize, data: &[f32]) {
    let rendered: Vec<String> = data.iter().map(|&v| format_float(v)).collect();
    out.push_str(&format!(
        "{name}: !!opencv-matrix\n   rows: {rows}\n   cols: {cols}\n   dt: f\n   data: [ {} ]\n",
        rendered.join(", ")
    ));
}

fn read_matrix_xml(
    root: roxmltree::Node,
    name: &'static str,
    rows: usize,
    cols: usize,
) -> Result<Vec<f32>, CalibFileError> {
    let node = root
        .children()
        .find(|n| n.has_tag_name(name))
        .ok_or(CalibFileError::MissingEntry(name))?;
    let field = |tag: &str| {
        node.children()
            .find(|n| n.has_tag_name(tag))
            .and_then(|n| n.text())
            .map(str::trim)
            .ok_or_else(|| CalibFileError::Malformed(format!("{name} has no <{tag}>")))
    };

    check_shape(name, rows, cols, field("rows")?, field("cols")?, field("dt")?)?;
    parse_floats(name, rows * cols, field("data")?)
}

fn read_matrix_yaml(
    text: &str,
    name: &'static str,
    rows: usize,
    cols: usize,
) -> Result<Vec<f32>, CalibFileError> {
    let mut lines = text.lines();
    lines
        .by_ref()
        .find(|line| line.trim_start().starts_with(&format!("{name}:")))
        .ok_or(CalibFileError::MissingEntry(name))?;

    let mut rows_text = None;
    let mut cols_text = None;
    let mut dt_text = None;
    let mut data_text = String::new();
    let mut in_data = false;
    for line in lines {
        let trimmed = line.trim();
        if in_data {
            data_text.push(' ');
            data_text.push_str(trimmed);
        } else if let Some(rest) = trimmed.strip_prefix("rows:") {
            rows_text = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("cols:") {
            cols_text = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("dt:") {
            dt_text = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("data:") {
            data_text.push_str(rest.trim());
            in_data = true;
        } else if !line.starts_with(' ') {
            // next top-level key
            break;
        }
        if in_data && data_text.contains(']') {
            break;
        }
    }

    let missing = |tag: &str| CalibFileError::Malformed(format!("{name} has no {tag} field"));
    check_shape(
        name,
        rows,
        cols,
        &rows_text.ok_or_else(|| missing("rows"))?,
        &cols_text.ok_or_else(|| missing("cols"))?,
        &dt_text.ok_or_else(|| missing("dt"))?,
    )?;

    let data = data_text
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .replace(',', " ");
    parse_floats(name, rows * cols, &data)
}

fn check_shape(
    name: &str,
    rows: usize,
    cols: usize,
    rows_text: &str,
    cols_text: &str,
    dt_text: &str,
) -> Result<(), CalibFileError> {
    let parsed_rows: usize = rows_text
        .parse()
        .map_err(|_| CalibFileError::Malformed(format!("{name} has invalid rows")))?;
    let parsed_cols: usize = cols_text
        .parse()
        .map_err(|_| CalibFileError::Malformed(format!("{name} has invalid cols")))?;
    if parsed_rows != rows || parsed_cols != cols {
        return Err(CalibFileError::Malformed(format!(
            "{name} is {parsed_rows}x{parsed_cols}, expected {rows}x{cols}"
        )));
    }
    if dt_text != "f" {
        return Err(CalibFileError::Malformed(format!(
            "{name} has element type {dt_text:?}, expected \"f\""
        )));
    }
    Ok(())
}

fn parse_floats(name: &str, expected: usize, text: &str) -> Result<Vec<f32>, CalibFileError> {
    let values: Vec<f32> = text
        .split_whitespace()
        .map(|token| {
            token
                .parse::<f32>()
                .map_err(|_| CalibFileError::Malformed(format!("{name} has bad float {token:?}")))
        })
        .collect::<Result<_, _>>()?;
    if values.len() != expected {
        return Err(CalibFileError::Malformed(format!(
            "{name} holds {} values, expected {expected}",
            values.len()
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transform() -> CalibrationTransform {
        CalibrationTransform {
            rot: Matrix3::new(
                0.999, -0.031, 0.002, //
                0.031, 0.998, -0.047, //
                -0.0005, 0.047, 0.9989,
            ),
            origin: Vector3::new(0.0125, -0.3037, 0.7031),
        }
    }

    fn assert_bits_equal(a: &CalibrationTransform, b: &CalibrationTransform) {
        for r in 0..3 {
            for c in 0..3 {
                assert_eq!(a.rot[(r, c)].to_bits(), b.rot[(r, c)].to_bits());
            }
        }
        for i in 0..3 {
            assert_eq!(a.origin[i].to_bits(), b.origin[i].to_bits());
        }
    }

    #[test]
    fn test_xml_round_trip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.xml");
        let transform = sample_transform();
        save(&path, &transform).unwrap();
        let loaded = load(&path).unwrap();
        assert_bits_equal(&transform, &loaded);
    }

    #[test]
    fn test_yaml_round_trip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.yml");
        let transform = sample_transform();
        save(&path, &transform).unwrap();
        let loaded = load(&path).unwrap();
        assert_bits_equal(&transform, &loaded);
    }

    #[test]
    fn test_loads_opencv_written_xml() {
        // verbatim OpenCV FileStorage output, wrapped indentation included
        let text = r#"<?xml version="1.0"?>
<opencv_storage>
<calib_rot_transform type_id="opencv-matrix">
  <rows>3</rows>
  <cols>3</cols>
  <dt>f</dt>
  <data>
    9.99847710e-01 -1.74524058e-02 0. 1.74524058e-02 9.99847710e-01 0. 0.
    0. 1.</data></calib_rot_transform>
<calib_origin type_id="opencv-matrix">
  <rows>1</rows>
  <cols>3</cols>
  <dt>f</dt>
  <data>
    -1.25000000e-02 0. 5.00000000e-01</data></calib_origin>
</opencv_storage>
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("from_opencv.xml");
        fs::write(&path, text).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.rot[(0, 0)], 9.99847710e-01);
        assert_eq!(loaded.rot[(0, 1)], -1.74524058e-02);
        assert_eq!(loaded.rot[(2, 2)], 1.0);
        assert_eq!(loaded.origin.x, -1.25e-02);
        assert_eq!(loaded.origin.z, 0.5);
    }

    #[test]
    fn test_loads_opencv_written_yaml() {
        let text = r#"%YAML:1.0
---
calib_rot_transform: !!opencv-matrix
   rows: 3
   cols: 3
   dt: f
   data: [ 1., 0., 0., 0., 1., 0., 0., 0., 1. ]
calib_origin: !!opencv-matrix
   rows: 1
   cols: 3
   dt: f
   data: [ -1.25000000e-02, 0., 5.00000000e-01 ]
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("from_opencv.yml");
        fs::write(&path, text).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.rot[(0, 0)], 1.0);
        assert_eq!(loaded.origin.y, 0.0);
        assert_eq!(loaded.origin.z, 0.5);
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let result = load(Path::new("calibration.json"));
        assert!(matches!(result, Err(CalibFileError::UnknownExtension(_))));
    }

    #[test]
    fn test_missing_entry_is_reported() {
        let text = "<?xml version=\"1.0\"?>\n<opencv_storage>\n</opencv_storage>\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.xml");
        fs::write(&path, text).unwrap();
        assert!(matches!(
            load(&path),
            Err(CalibFileError::MissingEntry(ROT_KEY))
        ));
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let text = r#"<?xml version="1.0"?>
<opencv_storage>
<calib_rot_transform type_id="opencv-matrix">
  <rows>2</rows><cols>3</cols><dt>f</dt>
  <data>1. 0. 0. 0. 1. 0.</data></calib_rot_transform>
</opencv_storage>
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.xml");
        fs::write(&path, text).unwrap();
        assert!(matches!(load(&path), Err(CalibFileError::Malformed(_))));
    }
}
