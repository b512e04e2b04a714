//! Sample plate model and well resolution.
//!
//! An [`Insert`] is the plate loaded into the XY stage: a label plus its wells, each at a
//! stage location in micrometres. [`WellMap`] turns step well labels into stage
//! coordinates, including the raster walk used when a step advances to a new well every
//! few repetitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{AppResult, DaqError};

/// Default distance within which two wells count as the same row or column.
pub const DEFAULT_GRID_TOLERANCE_UM: f64 = 1000.0;

/// Outline of a well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WellShape {
    #[allow(missing_docs)]
    #[default]
    Circle,
    #[allow(missing_docs)]
    Rectangle,
}

/// One sample position on the insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Well {
    /// Label, unique within the insert.
    pub label: String,
    /// Stage coordinates of the well centre (µm).
    pub location_um: (f64, f64),
    /// `[x_min, y_min, x_max, y_max]` in µm.
    #[serde(default)]
    pub bounding_box: [f64; 4],
    /// Outline used by the plate view.
    #[serde(default)]
    pub shape: WellShape,
}

impl Well {
    /// Circular well with a bounding box derived from `radius_um`.
    pub fn circle(label: impl Into<String>, x: f64, y: f64, radius_um: f64) -> Self {
        Self {
            label: label.into(),
            location_um: (x, y),
            bounding_box: [x - radius_um, y - radius_um, x + radius_um, y + radius_um],
            shape: WellShape::Circle,
        }
    }
}

/// The physical sample plate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Insert {
    /// Insert name.
    pub label: String,
    /// Wells in definition order.
    pub wells: Vec<Well>,
}

impl Insert {
    /// Insert from label and wells.
    pub fn new(label: impl Into<String>, wells: Vec<Well>) -> Self {
        Self {
            label: label.into(),
            wells,
        }
    }

    /// Rectangular grid labelled `A1`, `B1`, ... with rows along +y and columns along +x.
    ///
    /// `rows` letters are used for the row, the column number starts at 1.
    pub fn grid(label: impl Into<String>, rows: usize, cols: usize, pitch_um: f64) -> Self {
        let mut wells = Vec::with_capacity(rows * cols);
        for col in 0..cols {
            for row in 0..rows {
                let name = format!("{}{}", row_letter(row), col + 1);
                wells.push(Well::circle(
                    name,
                    col as f64 * pitch_um,
                    row as f64 * pitch_um,
                    pitch_um / 4.0,
                ));
            }
        }
        Self::new(label, wells)
    }

    /// Load an insert definition from JSON.
    pub fn from_json_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn row_letter(row: usize) -> String {
    let mut n = row;
    let mut out = Vec::new();
    loop {
        out.push((b'A' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.iter().rev().collect()
}

/// Label → coordinate resolver over one insert.
///
/// Read-only once built; safe to share between threads.
#[derive(Debug, Clone)]
pub struct WellMap {
    wells: Vec<Well>,
    index: HashMap<String, usize>,
    tolerance_um: f64,
}

impl WellMap {
    /// Build a map with the default grid tolerance.
    pub fn new(insert: &Insert) -> AppResult<Self> {
        Self::with_tolerance(insert, DEFAULT_GRID_TOLERANCE_UM)
    }

    /// Build a map; wells within `tolerance_um` of each other share a row/column.
    pub fn with_tolerance(insert: &Insert, tolerance_um: f64) -> AppResult<Self> {
        let mut index = HashMap::with_capacity(insert.wells.len());
        for (i, well) in insert.wells.iter().enumerate() {
            if index.insert(well.label.clone(), i).is_some() {
                return Err(DaqError::Configuration(format!(
                    "duplicate well label '{}' in insert '{}'",
                    well.label, insert.label
                )));
            }
        }
        Ok(Self {
            wells: insert.wells.clone(),
            index,
            tolerance_um: tolerance_um.abs(),
        })
    }

    /// Number of wells.
    pub fn len(&self) -> usize {
        self.wells.len()
    }

    /// True when the insert has no wells.
    pub fn is_empty(&self) -> bool {
        self.wells.is_empty()
    }

    /// Direct lookup by label.
    pub fn well(&self, label: &str) -> Option<(f64, f64)> {
        self.index.get(label).map(|&i| self.wells[i].location_um)
    }

    /// Well reached by walking `increment` steps from `label` in raster order.
    ///
    /// Each step prefers the nearest unvisited well further along the same column
    /// (x within tolerance, larger y). When the column is exhausted it moves to the
    /// nearest column strictly to the right, entering it at the well on the walk
    /// origin's row. Wells already visited during this walk are never revisited.
    /// Returns `None` when the walk runs out of wells before `increment` steps.
    pub fn next_well(&self, label: &str, increment: u32) -> Option<(f64, f64)> {
        let origin = *self.index.get(label)?;
        let origin_row = self.wells[origin].location_um.1;

        let mut visited = vec![false; self.wells.len()];
        visited[origin] = true;
        let mut current = origin;

        for _ in 0..increment {
            let next = self
                .next_in_column(current, &visited)
                .or_else(|| self.next_column(current, origin_row, &visited))?;
            visited[next] = true;
            current = next;
        }

        Some(self.wells[current].location_um)
    }

    fn next_in_column(&self, current: usize, visited: &[bool]) -> Option<usize> {
        let (cx, cy) = self.wells[current].location_um;
        self.nearest(visited, |(x, y)| {
            let dy = y - cy;
            ((x - cx).abs() <= self.tolerance_um && dy > self.tolerance_um).then_some(dy)
        })
    }

    fn next_column(&self, current: usize, origin_row: f64, visited: &[bool]) -> Option<usize> {
        let cx = self.wells[current].location_um.0;
        self.nearest(visited, |(x, y)| {
            let dx = x - cx;
            (dx > self.tolerance_um && (y - origin_row).abs() <= self.tolerance_um).then_some(dx)
        })
    }

    /// Unvisited well with the smallest delta reported by `delta`; ties go to the
    /// well defined first.
    fn nearest<F>(&self, visited: &[bool], delta: F) -> Option<usize>
    where
        F: Fn((f64, f64)) -> Option<f64>,
    {
        self.wells
            .iter()
            .enumerate()
            .filter(|(i, _)| !visited[*i])
            .filter_map(|(i, w)| delta(w.location_um).map(|d| (i, d.abs())))
            .fold(None, |best: Option<(usize, f64)>, (i, d)| match best {
                Some((_, bd)) if bd <= d => best,
                _ => Some((i, d)),
            })
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_3x3() -> WellMap {
        WellMap::new(&Insert::grid("3x3", 3, 3, 9000.0)).unwrap()
    }

    #[test]
    fn grid_labels_and_positions() {
        let map = grid_3x3();
        assert_eq!(map.len(), 9);
        assert_eq!(map.well("A1"), Some((0.0, 0.0)));
        assert_eq!(map.well("C1"), Some((0.0, 18000.0)));
        assert_eq!(map.well("A3"), Some((18000.0, 0.0)));
        assert_eq!(map.well("Z9"), None);
    }

    #[test]
    fn row_letters_roll_over() {
        assert_eq!(row_letter(0), "A");
        assert_eq!(row_letter(25), "Z");
        assert_eq!(row_letter(26), "AA");
    }

    #[test]
    fn zero_increment_is_the_well_itself() {
        let map = grid_3x3();
        assert_eq!(map.next_well("B2", 0), map.well("B2"));
    }

    #[test]
    fn walk_goes_down_the_column_then_wraps() {
        let map = grid_3x3();
        let expected = ["B1", "C1", "A2", "B2", "C2", "A3", "B3", "C3"];
        for (k, label) in expected.iter().enumerate() {
            assert_eq!(
                map.next_well("A1", k as u32 + 1),
                map.well(label),
                "increment {}",
                k + 1
            );
        }
        assert_eq!(map.next_well("A1", 9), None);
    }

    #[test]
    fn walk_from_middle_of_column_uses_origin_row() {
        let map = grid_3x3();
        // B1 -> C1 -> B2 (origin row) -> C2 -> B3 -> C3
        assert_eq!(map.next_well("B1", 2), map.well("B2"));
        assert_eq!(map.next_well("B1", 5), map.well("C3"));
        assert_eq!(map.next_well("B1", 6), None);
    }

    #[test]
    fn walk_tolerates_jitter() {
        let insert = Insert::new(
            "jittered",
            vec![
                Well::circle("A1", 0.0, 0.0, 100.0),
                Well::circle("B1", 40.0, 9010.0, 100.0),
                Well::circle("A2", 9005.0, -30.0, 100.0),
            ],
        );
        let map = WellMap::new(&insert).unwrap();
        assert_eq!(map.next_well("A1", 1), map.well("B1"));
        assert_eq!(map.next_well("A1", 2), map.well("A2"));
    }

    #[test]
    fn walk_is_deterministic() {
        let map = grid_3x3();
        assert_eq!(map.next_well("A1", 4), map.next_well("A1", 4));
    }

    #[test]
    fn unknown_label_has_no_neighbours() {
        assert_eq!(grid_3x3().next_well("Q7", 1), None);
    }

    #[test]
    fn duplicate_labels_rejected() {
        let insert = Insert::new(
            "dup",
            vec![
                Well::circle("A1", 0.0, 0.0, 1.0),
                Well::circle("A1", 10.0, 0.0, 1.0),
            ],
        );
        assert!(WellMap::new(&insert).is_err());
    }
}
